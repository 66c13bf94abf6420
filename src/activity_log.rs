//! Activity-log sink boundary (§1 "persistent activity-log storage (treated as a sink)").
//!
//! The persistence engine itself is out of scope. This module defines the trait a real sink
//! implements, an envelope shape matching §4.11 ("hand `(event_attrs, user_attrs)` to the
//! activity-log writer"), and two throwaway implementations useful for wiring and tests: one that
//! discards everything, and one that forwards onto an `mpsc` channel for a real sink to drain
//! asynchronously so the decode path is never blocked by slow storage.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// One row destined for the activity log: the normalized event attributes plus the user
/// attributes associated with it (follower, subscriber, chatter, etc).
#[derive(Clone, Debug)]
pub struct ActivityLogEntry {
    /// Canonical event type, e.g. `channel.follow`.
    pub event_type: String,
    /// Normalized event attributes (the envelope plus per-type fields from §4.11).
    pub event_attrs: Value,
    /// Attributes describing the user the event is about, if any.
    pub user_attrs: Option<Value>,
}

/// Sink that persists activity-log entries. Implementations must not block the caller for long;
/// the handoff from [`crate::twitch::event_handler`] happens on a background task precisely so a
/// slow sink cannot stall event decoding.
#[async_trait]
pub trait ActivityLogSink: Send + Sync + 'static {
    /// Persist one entry. Errors are logged by the caller and otherwise swallowed — a dropped
    /// activity-log row is not treated as a fatal condition for the live event pipeline.
    async fn record(&self, entry: ActivityLogEntry) -> anyhow::Result<()>;
}

/// A sink that discards every entry. Useful as a default when no real sink is wired up yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullActivityLogSink;

#[async_trait]
impl ActivityLogSink for NullActivityLogSink {
    async fn record(&self, _entry: ActivityLogEntry) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A sink that forwards entries onto a bounded `mpsc` channel, letting a real storage writer
/// drain them on its own schedule without ever touching the hot event path.
#[derive(Clone)]
pub struct ChannelActivityLogSink {
    tx: mpsc::Sender<ActivityLogEntry>,
}

impl ChannelActivityLogSink {
    /// Create a new channel-backed sink together with the receiving half a storage writer should
    /// poll in its own task.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ActivityLogEntry>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ActivityLogSink for ChannelActivityLogSink {
    async fn record(&self, entry: ActivityLogEntry) -> anyhow::Result<()> {
        self.tx
            .send(entry)
            .await
            .map_err(|_| anyhow::anyhow!("activity log receiver dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn channel_sink_forwards_entries() {
        let (sink, mut rx) = ChannelActivityLogSink::new(4);
        sink.record(ActivityLogEntry {
            event_type: "channel.follow".to_owned(),
            event_attrs: json!({"user_id": "1"}),
            user_attrs: None,
        })
        .await
        .unwrap();

        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.event_type, "channel.follow");
    }

    #[tokio::test]
    async fn null_sink_always_succeeds() {
        NullActivityLogSink
            .record(ActivityLogEntry {
                event_type: "x".to_owned(),
                event_attrs: json!(null),
                user_attrs: None,
            })
            .await
            .unwrap();
    }
}
