//! Reply dispatch: deliver an out-of-band reply to the push request still waiting for it.

use crate::channels::pending::{PendingReply, PendingReplyRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A reply produced by the surrounding system for an earlier push delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundReply {
    /// Message id of the push delivery being answered.
    pub in_reply_to: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Already replied, evicted, or never registered.
    #[error("no pending request for message {message_id}")]
    UnmatchedReply { message_id: String },
    /// The peer closed the connection before the reply arrived. The entry is still cleared.
    #[error("connection for message {message_id} closed before reply")]
    ChannelWriteFailure { message_id: String },
}

/// Entry point for outbound replies. Cheap to clone; hand one to whatever produces replies.
#[derive(Clone)]
pub struct ReplyDispatcher {
    registry: Arc<PendingReplyRegistry>,
}

impl ReplyDispatcher {
    pub fn new(registry: Arc<PendingReplyRegistry>) -> Self {
        Self { registry }
    }

    /// Write `content` to the pending request for `message_id` and complete it.
    /// Failures are logged and returned; none of them affect other requests.
    pub async fn dispatch(&self, message_id: &str, content: &str) -> Result<(), DispatchError> {
        let Some(channel) = self.registry.take(message_id).await else {
            log::warn!("unmatched reply for message {}: dropped", message_id);
            return Err(DispatchError::UnmatchedReply {
                message_id: message_id.to_string(),
            });
        };
        if channel
            .complete(PendingReply::Content(content.to_string()))
            .is_err()
        {
            log::warn!("reply for message {} not written: connection closed", message_id);
            return Err(DispatchError::ChannelWriteFailure {
                message_id: message_id.to_string(),
            });
        }
        log::debug!("reply delivered for message {}", message_id);
        Ok(())
    }

    /// Dispatch an [`OutboundReply`] (its `in_reply_to` is the message id).
    pub async fn handle_outbound_reply(&self, reply: &OutboundReply) -> Result<(), DispatchError> {
        self.dispatch(&reply.in_reply_to, &reply.content).await
    }
}
