//! Channel plumbing around the webhook.
//!
//! Inbound events go out to a [`MessageBus`]; the push request that carried them stays
//! open in the [`PendingReplyRegistry`] until [`ReplyDispatcher`] delivers the reply.

mod dispatch;
mod inbound;
mod pending;

pub use dispatch::{DispatchError, OutboundReply, ReplyDispatcher};
pub use inbound::{BusError, ChannelBus, InboundEvent, MessageBus, TRANSPORT_TYPE};
pub use pending::{PendingChannel, PendingReply, PendingReplyRegistry};
