//! Gateway: the HTTP surface WeChat talks to.
//!
//! One port serves the webhook path (GET handshake, POST push delivery), a health path and,
//! optionally, a reply path. Push requests stay open until their reply is dispatched.

mod server;
mod webhook;

pub use server::{router, run_gateway, Gateway, GatewayState};
