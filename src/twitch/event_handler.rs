//! Normalizes raw EventSub notifications into canonical envelopes and fans them out (§4.11).

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use crate::activity_log::{ActivityLogEntry, ActivityLogSink};
use crate::metrics::Metrics;
use crate::pubsub::{topics, Bus};

/// Builds and publishes the canonical event envelope for one EventSub notification.
pub struct EventHandler {
    bus: Bus,
    metrics: Arc<dyn Metrics>,
    activity_log: Arc<dyn ActivityLogSink>,
}

impl EventHandler {
    /// Create a handler publishing onto `bus` and recording telemetry/activity-log entries.
    #[must_use]
    pub fn new(bus: Bus, metrics: Arc<dyn Metrics>, activity_log: Arc<dyn ActivityLogSink>) -> Self {
        Self { bus, metrics, activity_log }
    }

    /// Handle one raw EventSub notification. Rejects events missing `id`/`broadcaster_user_id`
    /// rather than publishing a malformed envelope.
    pub async fn handle(&self, event_type: &str, raw_event: &Value) {
        let Some(id) = raw_event.get("id").and_then(Value::as_str).filter(|s| !s.is_empty()) else {
            warn!(event_type, "twitch notification missing or empty id; dropped");
            return;
        };
        let Some(broadcaster_user_id) = raw_event.get("broadcaster_user_id").and_then(Value::as_str).filter(|s| !s.is_empty()) else {
            warn!(event_type, "twitch notification missing or empty broadcaster_user_id; dropped");
            return;
        };

        let mut envelope = json!({
            "type": event_type,
            "id": id,
            "broadcaster_user_id": broadcaster_user_id,
            "broadcaster_user_login": raw_event.get("broadcaster_user_login").cloned().unwrap_or(Value::Null),
            "broadcaster_user_name": raw_event.get("broadcaster_user_name").cloned().unwrap_or(Value::Null),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        merge_type_specific_fields(&mut envelope, event_type, raw_event);

        self.metrics.twitch_event(event_type, broadcaster_user_id);

        let mut dest_topics = vec![topics::DASHBOARD.to_owned(), topics::twitch_event(event_type)];
        if let Some(legacy) = legacy_topic(event_type) {
            dest_topics.push(legacy.to_owned());
        }
        self.bus.publish_many(dest_topics, envelope.clone()).await;

        if is_persistable(event_type) {
            let activity_log = self.activity_log.clone();
            let entry = ActivityLogEntry {
                event_type: event_type.to_owned(),
                event_attrs: envelope,
                user_attrs: user_attrs(event_type, raw_event),
            };
            tokio::spawn(async move {
                if let Err(e) = activity_log.record(entry).await {
                    warn!(error = %e, "failed to record twitch activity log entry");
                }
            });
        }
    }
}

/// Legacy per-category topic a given event type also fans out to, for consumers written before
/// the generic `twitch:<type>` topic existed (§6 "Internal publish/subscribe topics").
fn legacy_topic(event_type: &str) -> Option<&'static str> {
    match event_type {
        "channel.chat.message" | "channel.chat.clear" | "channel.chat.message_delete" => Some(topics::CHAT),
        "channel.follow" => Some(topics::FOLLOWERS),
        "channel.subscribe" | "channel.subscription.gift" => Some(topics::SUBSCRIPTIONS),
        "channel.cheer" => Some(topics::CHEERS),
        "stream.online" | "stream.offline" => Some(topics::STREAM_STATUS),
        "channel.update" => Some(topics::CHANNEL_UPDATES),
        _ => None,
    }
}

/// Whether `event_type` is in the persistable set handed to the activity-log sink (§4.11).
fn is_persistable(event_type: &str) -> bool {
    matches!(
        event_type,
        "stream.online"
            | "stream.offline"
            | "channel.update"
            | "channel.follow"
            | "channel.subscribe"
            | "channel.subscription.gift"
            | "channel.cheer"
            | "channel.chat.message"
            | "channel.chat.clear"
            | "channel.chat.message_delete"
    )
}

fn merge_type_specific_fields(envelope: &mut Value, event_type: &str, raw_event: &Value) {
    let Some(fields) = type_specific_fields(event_type, raw_event) else { return };
    if let (Value::Object(envelope), Value::Object(fields)) = (envelope, fields) {
        envelope.extend(fields);
    }
}

fn type_specific_fields(event_type: &str, raw_event: &Value) -> Option<Value> {
    let pick = |keys: &[&str]| {
        let mut out = serde_json::Map::new();
        for key in keys {
            if let Some(v) = raw_event.get(*key) {
                out.insert((*key).to_owned(), v.clone());
            }
        }
        Value::Object(out)
    };

    match event_type {
        "stream.online" => Some(json!({
            "stream_id": raw_event.get("id").cloned().unwrap_or(Value::Null),
            "stream_type": raw_event.get("type").cloned().unwrap_or(Value::Null),
            "started_at": raw_event.get("started_at").cloned().unwrap_or(Value::Null),
        })),
        "channel.follow" => Some(pick(&["user_id", "user_login", "user_name", "followed_at"])),
        "channel.subscribe" => Some(pick(&["user_id", "user_login", "user_name", "tier", "is_gift"])),
        "channel.subscription.gift" => Some(pick(&["user_id", "user_login", "user_name", "tier", "total", "cumulative_total", "is_anonymous"])),
        "channel.cheer" => Some(pick(&["user_id", "user_login", "user_name", "is_anonymous", "message", "bits"])),
        "channel.update" => Some(pick(&["title", "language", "category_id", "category_name", "content_classification_labels"])),
        "channel.chat.message" => Some(pick(&["message_id", "chatter_user_id", "chatter_user_login", "chatter_user_name", "message", "color", "badges"])),
        "channel.chat.clear" => Some(Value::Object(serde_json::Map::new())),
        "channel.chat.message_delete" => Some(pick(&["target_user_id", "target_user_login", "message_id"])),
        _ => None,
    }
}

/// User attributes to persist alongside the event, for the event types worth tracking per-user
/// (§4.11 "hand `(event_attrs, user_attrs)` to the activity-log writer"). Events with no
/// meaningful subject user (e.g. `channel.update`) return `None` and are not persisted.
fn user_attrs(event_type: &str, raw_event: &Value) -> Option<Value> {
    let (id_key, login_key, name_key) = match event_type {
        "channel.follow" | "channel.subscribe" | "channel.subscription.gift" | "channel.cheer" => ("user_id", "user_login", "user_name"),
        "channel.chat.message" => ("chatter_user_id", "chatter_user_login", "chatter_user_name"),
        _ => return None,
    };
    let user_id = raw_event.get(id_key)?.clone();
    Some(json!({
        "user_id": user_id,
        "user_login": raw_event.get(login_key).cloned().unwrap_or(Value::Null),
        "user_name": raw_event.get(name_key).cloned().unwrap_or(Value::Null),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity_log::NullActivityLogSink;
    use crate::metrics::TracingMetrics;

    fn handler() -> EventHandler {
        EventHandler::new(Bus::default(), Arc::new(TracingMetrics), Arc::new(NullActivityLogSink))
    }

    #[tokio::test]
    async fn drops_notifications_missing_id() {
        let handler = handler();
        let mut sub = handler.bus.subscribe(topics::DASHBOARD).await;
        handler.handle("channel.follow", &json!({"broadcaster_user_id": "1"})).await;
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn publishes_to_dashboard_and_type_topic() {
        let handler = handler();
        let mut dashboard = handler.bus.subscribe(topics::DASHBOARD).await;
        let mut typed = handler.bus.subscribe(topics::twitch_event("channel.follow")).await;

        handler
            .handle(
                "channel.follow",
                &json!({"id": "evt1", "broadcaster_user_id": "1", "user_id": "2", "user_login": "bob", "user_name": "Bob"}),
            )
            .await;

        let on_dashboard = dashboard.recv().await.unwrap();
        assert_eq!(on_dashboard.payload["type"], "channel.follow");
        assert_eq!(on_dashboard.payload["user_id"], "2");

        let on_typed = typed.recv().await.unwrap();
        assert_eq!(on_typed.payload["id"], "evt1");
    }

    #[tokio::test]
    async fn follow_events_also_fan_to_legacy_followers_topic() {
        let handler = handler();
        let mut legacy = handler.bus.subscribe(topics::FOLLOWERS).await;

        handler
            .handle("channel.follow", &json!({"id": "evt1", "broadcaster_user_id": "1", "user_id": "2"}))
            .await;

        assert!(legacy.recv().await.is_some());
    }

    #[tokio::test]
    async fn channel_update_has_no_legacy_user_attrs() {
        assert!(user_attrs("channel.update", &json!({"broadcaster_user_id": "1"})).is_none());
    }

    #[tokio::test]
    async fn drops_notifications_with_empty_id_or_broadcaster() {
        let handler = handler();
        let mut sub = handler.bus.subscribe(topics::DASHBOARD).await;
        handler.handle("channel.follow", &json!({"id": "", "broadcaster_user_id": "1"})).await;
        handler.handle("channel.follow", &json!({"id": "evt1", "broadcaster_user_id": ""})).await;
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn persistable_events_without_a_subject_user_still_reach_the_sink() {
        let (sink, mut rx) = crate::activity_log::ChannelActivityLogSink::new(4);
        let handler = EventHandler::new(Bus::default(), Arc::new(TracingMetrics), Arc::new(sink));

        handler
            .handle("channel.update", &json!({"id": "evt1", "broadcaster_user_id": "1", "title": "New title"}))
            .await;

        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.event_type, "channel.update");
        assert!(entry.user_attrs.is_none());
    }

    #[tokio::test]
    async fn non_persistable_events_never_reach_the_sink() {
        let (sink, mut rx) = crate::activity_log::ChannelActivityLogSink::new(4);
        let handler = EventHandler::new(Bus::default(), Arc::new(TracingMetrics), Arc::new(sink));

        handler.handle("channel.raid", &json!({"id": "evt1", "broadcaster_user_id": "1"})).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stream_online_maps_id_and_type_without_clobbering_the_envelope_type() {
        let handler = handler();
        let mut dashboard = handler.bus.subscribe(topics::DASHBOARD).await;

        handler
            .handle(
                "stream.online",
                &json!({"id": "stream1", "broadcaster_user_id": "1", "type": "live", "started_at": "2026-07-27T00:00:00Z"}),
            )
            .await;

        let on_dashboard = dashboard.recv().await.unwrap();
        assert_eq!(on_dashboard.payload["type"], "stream.online");
        assert_eq!(on_dashboard.payload["stream_id"], "stream1");
        assert_eq!(on_dashboard.payload["stream_type"], "live");
    }
}
