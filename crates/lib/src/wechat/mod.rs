//! WeChat push protocol: handshake signatures and push payload parsing.

pub mod parser;
pub mod signature;

pub use parser::{parse, MalformedPayload};
pub use signature::{compute_signature, verify, SignatureQuery};
