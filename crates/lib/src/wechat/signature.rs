//! Handshake signature verification.
//!
//! WeChat proves a request is genuine by sending `signature`, the lowercase hex SHA-1 of
//! `timestamp`, `nonce` and the app token, sorted as strings and concatenated with no
//! separator. During the one-time handshake it also sends `echostr`, which must be echoed
//! back verbatim when the signature matches.

use serde::Deserialize;
use sha1::{Digest, Sha1};

/// Compute the signature WeChat would send for these inputs.
pub fn compute_signature(timestamp: &str, nonce: &str, token: &str) -> String {
    let mut parts = [timestamp, nonce, token];
    parts.sort_unstable();
    let digest = Sha1::digest(parts.concat().as_bytes());
    hex::encode(digest)
}

/// Returns true iff `signature` equals the computed digest exactly (case-sensitive).
pub fn verify(timestamp: &str, nonce: &str, token: &str, signature: &str) -> bool {
    compute_signature(timestamp, nonce, token) == signature
}

/// Query parameters WeChat attaches to webhook requests. `echostr` is only present on the handshake.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignatureQuery {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
    pub nonce: Option<String>,
    pub echostr: Option<String>,
}

impl SignatureQuery {
    /// Verify signature/timestamp/nonce; false when any of them is missing.
    pub fn is_signed_by(&self, token: &str) -> bool {
        match (&self.signature, &self.timestamp, &self.nonce) {
            (Some(signature), Some(timestamp), Some(nonce)) => {
                verify(timestamp, nonce, token, signature)
            }
            _ => false,
        }
    }

    /// Body to return for a handshake: `echostr` when all four fields are present and the
    /// signature verifies, otherwise empty. Rejection is signalled by the empty body alone.
    pub fn handshake_response(&self, token: &str) -> String {
        match self.echostr {
            Some(ref echostr) if self.is_signed_by(token) => echostr.clone(),
            _ => String::new(),
        }
    }
}
