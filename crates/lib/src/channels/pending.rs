//! Pending reply registry: held-open push responses keyed by message id.
//!
//! Each accepted push delivery leaves its HTTP response waiting on a [`PendingChannel`].
//! The registry owns every channel until it is taken for a reply, superseded by a newer
//! registration of the same id, evicted as stale, or drained at shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio::time::Instant;

/// What a held-open response is completed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingReply {
    /// Reply content, written as the response body.
    Content(String),
    /// A newer delivery registered the same message id.
    Superseded,
    /// No reply arrived within the configured lifetime.
    Expired,
    /// The event could not be handed to the bus, or the gateway is shutting down.
    Unavailable,
}

/// An open, not-yet-completed response. `complete` consumes the channel, so it is written
/// and closed at most once.
#[derive(Debug)]
pub struct PendingChannel {
    message_id: String,
    /// Assigned by the registry on registration; tells apart deliveries sharing an id.
    seq: u64,
    created_at: Instant,
    tx: oneshot::Sender<PendingReply>,
}

impl PendingChannel {
    /// Open a channel for `message_id`; the receiver resolves when the channel is completed.
    pub fn open(message_id: impl Into<String>) -> (Self, oneshot::Receiver<PendingReply>) {
        let (tx, rx) = oneshot::channel();
        let channel = Self {
            message_id: message_id.into(),
            seq: 0,
            created_at: Instant::now(),
            tx,
        };
        (channel, rx)
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// True once the waiting side has gone away (e.g. the peer closed the connection).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Write `reply` and complete the channel. Returns the reply back when nobody is waiting.
    pub fn complete(self, reply: PendingReply) -> Result<(), PendingReply> {
        self.tx.send(reply)
    }
}

/// Registry of message ids to pending channels. Shared by the webhook handler, the reply
/// dispatcher and the staleness sweeper.
pub struct PendingReplyRegistry {
    inner: Arc<RwLock<HashMap<String, PendingChannel>>>,
    next_seq: AtomicU64,
    /// Set by `drain`; later registrations are released immediately.
    closing: AtomicBool,
}

impl Default for PendingReplyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingReplyRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            next_seq: AtomicU64::new(1),
            closing: AtomicBool::new(false),
        }
    }

    /// Register `channel` under its message id. An existing entry for the same id is
    /// replaced and its connection completed with [`PendingReply::Superseded`]. Returns the
    /// sequence number identifying this registration (see [`take_if`](Self::take_if)).
    ///
    /// After [`drain`](Self::drain) nothing is stored: the channel is completed with
    /// [`PendingReply::Unavailable`] straight away.
    pub async fn register(&self, mut channel: PendingChannel) -> u64 {
        let id = channel.message_id.clone();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        channel.seq = seq;
        let previous = {
            let mut g = self.inner.write().await;
            if self.closing.load(Ordering::SeqCst) {
                drop(g);
                log::debug!("pending reply {} refused: registry closing", id);
                let _ = channel.complete(PendingReply::Unavailable);
                return seq;
            }
            g.insert(id.clone(), channel)
        };
        log::debug!("pending reply registered: {}", id);
        if let Some(old) = previous {
            log::warn!("pending reply {} superseded by a newer delivery", id);
            if old.complete(PendingReply::Superseded).is_err() {
                log::debug!("superseded connection for {} was already closed", id);
            }
        }
        seq
    }

    /// Remove and return the channel for `message_id`. Of any number of concurrent calls
    /// for the same id, at most one gets `Some`.
    pub async fn take(&self, message_id: &str) -> Option<PendingChannel> {
        self.inner.write().await.remove(message_id)
    }

    /// Remove and return the channel for `message_id` only if it is still the registration
    /// numbered `seq`. A newer delivery that superseded it is left in place.
    pub async fn take_if(&self, message_id: &str, seq: u64) -> Option<PendingChannel> {
        let mut g = self.inner.write().await;
        match g.get(message_id) {
            Some(c) if c.seq == seq => g.remove(message_id),
            _ => None,
        }
    }

    pub async fn size(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Evict entries at least `ttl` old, completing them with [`PendingReply::Expired`], and
    /// entries whose peer already disconnected. Returns the number evicted.
    pub async fn sweep(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let evicted: Vec<PendingChannel> = {
            let mut g = self.inner.write().await;
            let stale: Vec<String> = g
                .iter()
                .filter(|(_, c)| c.is_closed() || now.duration_since(c.created_at) >= ttl)
                .map(|(id, _)| id.clone())
                .collect();
            stale.iter().filter_map(|id| g.remove(id)).collect()
        };
        let count = evicted.len();
        for channel in evicted {
            if channel.is_closed() {
                log::debug!("pending reply {} dropped: peer disconnected", channel.message_id);
            } else {
                log::debug!("pending reply {} expired", channel.message_id);
                let _ = channel.complete(PendingReply::Expired);
            }
        }
        count
    }

    /// Remove every entry, completing each with `reply`, and refuse later registrations.
    /// Returns the number drained.
    pub async fn drain(&self, reply: PendingReply) -> usize {
        let entries = {
            let mut g = self.inner.write().await;
            self.closing.store(true, Ordering::SeqCst);
            std::mem::take(&mut *g)
        };
        let count = entries.len();
        for (_, channel) in entries {
            let _ = channel.complete(reply.clone());
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::collections::HashSet;

    #[tokio::test]
    async fn take_returns_registered_channel_once() {
        let registry = PendingReplyRegistry::new();
        let (channel, rx) = PendingChannel::open("42");
        registry.register(channel).await;
        assert_eq!(registry.size().await, 1);

        let taken = registry.take("42").await.expect("registered channel");
        assert_eq!(taken.message_id(), "42");
        assert!(registry.take("42").await.is_none());
        assert_eq!(registry.size().await, 0);

        taken
            .complete(PendingReply::Content("pong".to_string()))
            .unwrap();
        assert_eq!(rx.await.unwrap(), PendingReply::Content("pong".to_string()));
    }

    #[tokio::test]
    async fn take_unknown_id_is_none() {
        let registry = PendingReplyRegistry::new();
        assert!(registry.take("never").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_supersedes_previous() {
        let registry = PendingReplyRegistry::new();
        let (first, first_rx) = PendingChannel::open("dup");
        let (second, second_rx) = PendingChannel::open("dup");
        registry.register(first).await;
        registry.register(second).await;
        assert_eq!(registry.size().await, 1);
        assert_eq!(first_rx.await.unwrap(), PendingReply::Superseded);

        let taken = registry.take("dup").await.expect("latest channel");
        taken
            .complete(PendingReply::Content("latest".to_string()))
            .unwrap();
        assert_eq!(
            second_rx.await.unwrap(),
            PendingReply::Content("latest".to_string())
        );
        assert!(registry.take("dup").await.is_none());
    }

    #[tokio::test]
    async fn complete_reports_closed_peer() {
        let (channel, rx) = PendingChannel::open("gone");
        drop(rx);
        assert!(channel.is_closed());
        assert_eq!(
            channel.complete(PendingReply::Content("late".to_string())),
            Err(PendingReply::Content("late".to_string()))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_register_and_take_is_exactly_once() {
        let registry = Arc::new(PendingReplyRegistry::new());
        let mut receivers = Vec::new();
        let mut registrations = Vec::new();
        for i in 0..1000 {
            let (channel, rx) = PendingChannel::open(i.to_string());
            receivers.push(rx);
            let registry = registry.clone();
            registrations.push(tokio::spawn(async move { registry.register(channel).await }));
        }
        for r in join_all(registrations).await {
            r.unwrap();
        }
        assert_eq!(registry.size().await, 1000);

        // Two competing takes per id.
        let mut takes = Vec::new();
        for i in (0..1000).chain(0..1000) {
            let registry = registry.clone();
            takes.push(tokio::spawn(async move {
                registry.take(&i.to_string()).await.map(|c| c.message_id().to_string())
            }));
        }
        let taken: Vec<String> = join_all(takes)
            .await
            .into_iter()
            .filter_map(|r| r.unwrap())
            .collect();
        assert_eq!(taken.len(), 1000);
        let unique: HashSet<&String> = taken.iter().collect();
        assert_eq!(unique.len(), 1000);
        assert_eq!(registry.size().await, 0);
        drop(receivers);
    }

    #[tokio::test]
    async fn sweep_expires_old_entries() {
        let registry = PendingReplyRegistry::new();
        let (channel, rx) = PendingChannel::open("old");
        registry.register(channel).await;

        assert_eq!(registry.sweep(Duration::from_secs(3600)).await, 0);
        assert_eq!(registry.size().await, 1);

        assert_eq!(registry.sweep(Duration::ZERO).await, 1);
        assert_eq!(registry.size().await, 0);
        assert_eq!(rx.await.unwrap(), PendingReply::Expired);
    }

    #[tokio::test]
    async fn sweep_drops_disconnected_entries() {
        let registry = PendingReplyRegistry::new();
        let (closed, closed_rx) = PendingChannel::open("closed");
        let (live, _live_rx) = PendingChannel::open("live");
        registry.register(closed).await;
        registry.register(live).await;
        drop(closed_rx);

        assert_eq!(registry.sweep(Duration::from_secs(3600)).await, 1);
        assert!(registry.take("closed").await.is_none());
        assert!(registry.take("live").await.is_some());
    }

    #[tokio::test]
    async fn take_if_leaves_newer_registration_in_place() {
        let registry = PendingReplyRegistry::new();
        let (first, _first_rx) = PendingChannel::open("dup");
        let (second, second_rx) = PendingChannel::open("dup");
        let first_seq = registry.register(first).await;
        let second_seq = registry.register(second).await;
        assert_ne!(first_seq, second_seq);

        assert!(registry.take_if("dup", first_seq).await.is_none());
        assert_eq!(registry.size().await, 1);

        let taken = registry.take_if("dup", second_seq).await.expect("own registration");
        assert_eq!(taken.seq(), second_seq);
        taken.complete(PendingReply::Unavailable).unwrap();
        assert_eq!(second_rx.await.unwrap(), PendingReply::Unavailable);
        assert!(registry.take_if("dup", second_seq).await.is_none());
    }

    #[tokio::test]
    async fn register_after_drain_is_released_immediately() {
        let registry = PendingReplyRegistry::new();
        assert_eq!(registry.drain(PendingReply::Unavailable).await, 0);

        let (late, late_rx) = PendingChannel::open("late");
        registry.register(late).await;
        assert_eq!(registry.size().await, 0);
        assert_eq!(late_rx.await.unwrap(), PendingReply::Unavailable);
    }

    #[tokio::test]
    async fn drain_completes_everything() {
        let registry = PendingReplyRegistry::new();
        let (a, a_rx) = PendingChannel::open("a");
        let (b, b_rx) = PendingChannel::open("b");
        registry.register(a).await;
        registry.register(b).await;

        assert_eq!(registry.drain(PendingReply::Unavailable).await, 2);
        assert_eq!(registry.size().await, 0);
        assert_eq!(a_rx.await.unwrap(), PendingReply::Unavailable);
        assert_eq!(b_rx.await.unwrap(), PendingReply::Unavailable);
    }
}
