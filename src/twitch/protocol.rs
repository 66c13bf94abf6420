//! Twitch EventSub WebSocket wire protocol (§6 "Twitch EventSub WebSocket").
//!
//! Every frame is `{ metadata: { message_id, message_type, ... }, payload: {...} }`. Unlike OBS's
//! numeric opcode, the type tag here is a string field sitting alongside `payload` rather than
//! nested inside it, so a plain `#[derive(Deserialize)]` on the envelope suffices; only the
//! `payload` shape depends on `message_type` and is decoded on demand by the caller.

use serde::Deserialize;

fn default_keepalive_timeout() -> u64 {
    10
}

/// The outer envelope every EventSub WebSocket frame shares.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    /// Tag and bookkeeping fields.
    pub metadata: Metadata,
    /// Payload shape depends on `metadata.message_type`.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// `metadata` block common to every message type.
#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    /// Unique id of this message; used to deduplicate notification resends.
    pub message_id: String,
    /// One of `session_welcome`, `session_keepalive`, `session_reconnect`, `notification`,
    /// `revocation`.
    pub message_type: String,
    /// Present only on `notification`: the EventSub subscription type, e.g. `channel.follow`.
    #[serde(default)]
    pub subscription_type: Option<String>,
}

/// `payload` of `session_welcome` and `session_reconnect`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionPayload {
    /// Session details.
    pub session: SessionInfo,
}

/// `session` object nested in [`SessionPayload`].
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    /// Opaque session identifier, used as the `transport.session_id` of new subscriptions.
    pub id: String,
    /// Seconds of silence tolerated before the client must force a reconnect.
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_seconds: u64,
    /// Present only on `session_reconnect`: the URL to hot-swap the socket to.
    #[serde(default)]
    pub reconnect_url: Option<String>,
}

/// `payload` of `notification`.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationPayload {
    /// The subscription this notification belongs to (id, condition, etc).
    #[serde(default)]
    pub subscription: serde_json::Value,
    /// The event body itself; shape depends on `metadata.subscription_type`.
    pub event: serde_json::Value,
}

/// `payload` of `revocation`.
#[derive(Debug, Clone, Deserialize)]
pub struct RevocationPayload {
    /// The revoked subscription.
    pub subscription: RevokedSubscription,
}

/// `subscription` block nested in [`RevocationPayload`].
#[derive(Debug, Clone, Deserialize)]
pub struct RevokedSubscription {
    /// The subscription id to remove from the local tracking set.
    pub id: String,
    /// Revocation reason, e.g. `authorization_revoked`, `user_removed`, `version_removed`.
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_session_welcome_envelope() {
        let raw = r#"{
            "metadata": {"message_id": "1", "message_type": "session_welcome"},
            "payload": {"session": {"id": "abc", "keepalive_timeout_seconds": 10}}
        }"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.metadata.message_type, "session_welcome");
        let payload: SessionPayload = serde_json::from_value(envelope.payload).unwrap();
        assert_eq!(payload.session.id, "abc");
    }

    #[test]
    fn decodes_notification_with_subscription_type() {
        let raw = r#"{
            "metadata": {"message_id": "2", "message_type": "notification", "subscription_type": "channel.follow"},
            "payload": {"subscription": {}, "event": {"user_id": "1"}}
        }"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.metadata.subscription_type.as_deref(), Some("channel.follow"));
    }
}
