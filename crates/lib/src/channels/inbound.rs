//! Inbound push events and the message bus they are handed to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub const TRANSPORT_TYPE: &str = "wechat";

/// A push delivery normalised from the platform payload. The four required fields are
/// never empty; `message_id` keys the pending reply for this delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub message_id: String,
    pub from_addr: String,
    pub to_addr: String,
    pub content: String,
    pub transport_type: String,
    /// Platform message type (e.g. "text"), when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
    /// Platform `CreateTime`, when present and numeric.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("message bus closed")]
    Closed,
    #[error("message bus rejected event: {0}")]
    Rejected(String),
}

/// Receives normalised events for processing. Replies come back later through
/// [`ReplyDispatcher`](crate::channels::ReplyDispatcher), keyed by message id.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, event: InboundEvent) -> Result<(), BusError>;
}

/// In-process bus: forwards events to an mpsc receiver owned by the consumer.
#[derive(Clone)]
pub struct ChannelBus {
    tx: mpsc::Sender<InboundEvent>,
}

impl ChannelBus {
    /// Create a bus and the receiver that consumes its events.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<InboundEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MessageBus for ChannelBus {
    async fn publish(&self, event: InboundEvent) -> Result<(), BusError> {
        self.tx.send(event).await.map_err(|_| BusError::Closed)
    }
}
