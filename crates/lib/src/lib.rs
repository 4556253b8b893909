//! wxgate core library: WeChat webhook handshake, push parsing, and deferred replies
//! correlated by message id.

pub mod channels;
pub mod config;
pub mod gateway;
pub mod wechat;
