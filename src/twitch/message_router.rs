//! Pure dispatch of decoded EventSub frames by `metadata.message_type` (§4.7).

use crate::twitch::protocol::{Envelope, NotificationPayload, RevocationPayload, SessionPayload};

/// The action a [`Envelope`] implies, independent of how the caller actually carries it out.
#[derive(Debug, Clone)]
pub enum RouterAction {
    /// `session_welcome`: forward `(session_id, keepalive_timeout_seconds)` to the owner.
    SessionWelcome {
        /// New session id.
        session_id: String,
        /// Keepalive timeout to arm the watchdog with.
        keepalive_timeout_seconds: u64,
    },
    /// `session_keepalive`: no-op beyond resetting the keepalive watchdog, which the caller does
    /// for every frame regardless of type.
    Keepalive,
    /// `session_reconnect`: hot-swap the socket to `reconnect_url`.
    Reconnect {
        /// URL to connect the replacement socket to.
        reconnect_url: String,
    },
    /// `notification`: an EventSub event arrived.
    Notification {
        /// The EventSub subscription type, e.g. `channel.follow`.
        subscription_type: String,
        /// Raw event body; shape depends on `subscription_type`.
        event: serde_json::Value,
    },
    /// `revocation`: a subscription was revoked server-side.
    Revocation {
        /// Id of the revoked subscription.
        subscription_id: String,
        /// Revocation reason.
        reason: String,
    },
    /// Any other `message_type`. Logged and dropped by the caller, never treated as an error.
    Unknown {
        /// The unrecognized message type.
        message_type: String,
    },
}

/// Route one decoded envelope to the action its `metadata.message_type` implies.
///
/// Malformed `payload` (the wrong shape for the declared type) degrades to [`RouterAction::Unknown`]
/// rather than erroring; a single bad frame does not need to interrupt the session.
#[must_use]
pub fn route(envelope: &Envelope) -> RouterAction {
    match envelope.metadata.message_type.as_str() {
        "session_welcome" => match serde_json::from_value::<SessionPayload>(envelope.payload.clone()) {
            Ok(payload) => RouterAction::SessionWelcome {
                session_id: payload.session.id,
                keepalive_timeout_seconds: payload.session.keepalive_timeout_seconds,
            },
            Err(_) => RouterAction::Unknown {
                message_type: "session_welcome (malformed payload)".to_owned(),
            },
        },
        "session_keepalive" => RouterAction::Keepalive,
        "session_reconnect" => match serde_json::from_value::<SessionPayload>(envelope.payload.clone()) {
            Ok(payload) => match payload.session.reconnect_url {
                Some(reconnect_url) => RouterAction::Reconnect { reconnect_url },
                None => RouterAction::Unknown {
                    message_type: "session_reconnect (no reconnect_url)".to_owned(),
                },
            },
            Err(_) => RouterAction::Unknown {
                message_type: "session_reconnect (malformed payload)".to_owned(),
            },
        },
        "notification" => {
            let Some(subscription_type) = envelope.metadata.subscription_type.clone() else {
                return RouterAction::Unknown {
                    message_type: "notification (missing subscription_type)".to_owned(),
                };
            };
            match serde_json::from_value::<NotificationPayload>(envelope.payload.clone()) {
                Ok(payload) => RouterAction::Notification {
                    subscription_type,
                    event: payload.event,
                },
                Err(_) => RouterAction::Unknown {
                    message_type: format!("notification:{subscription_type} (malformed payload)"),
                },
            }
        }
        "revocation" => match serde_json::from_value::<RevocationPayload>(envelope.payload.clone()) {
            Ok(payload) => RouterAction::Revocation {
                subscription_id: payload.subscription.id,
                reason: payload.subscription.status,
            },
            Err(_) => RouterAction::Unknown {
                message_type: "revocation (malformed payload)".to_owned(),
            },
        },
        other => RouterAction::Unknown {
            message_type: other.to_owned(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twitch::protocol::Metadata;

    fn envelope(message_type: &str, subscription_type: Option<&str>, payload: serde_json::Value) -> Envelope {
        Envelope {
            metadata: Metadata {
                message_id: "1".to_owned(),
                message_type: message_type.to_owned(),
                subscription_type: subscription_type.map(str::to_owned),
            },
            payload,
        }
    }

    #[test]
    fn routes_session_welcome() {
        let env = envelope(
            "session_welcome",
            None,
            serde_json::json!({"session": {"id": "abc", "keepalive_timeout_seconds": 15}}),
        );
        match route(&env) {
            RouterAction::SessionWelcome { session_id, keepalive_timeout_seconds } => {
                assert_eq!(session_id, "abc");
                assert_eq!(keepalive_timeout_seconds, 15);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn routes_keepalive_as_noop() {
        let env = envelope("session_keepalive", None, serde_json::json!({}));
        assert!(matches!(route(&env), RouterAction::Keepalive));
    }

    #[test]
    fn routes_reconnect_with_url() {
        let env = envelope(
            "session_reconnect",
            None,
            serde_json::json!({"session": {"id": "abc", "reconnect_url": "wss://x"}}),
        );
        match route(&env) {
            RouterAction::Reconnect { reconnect_url } => assert_eq!(reconnect_url, "wss://x"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn routes_notification_with_event_body() {
        let env = envelope(
            "notification",
            Some("channel.follow"),
            serde_json::json!({"subscription": {}, "event": {"user_id": "1"}}),
        );
        match route(&env) {
            RouterAction::Notification { subscription_type, event } => {
                assert_eq!(subscription_type, "channel.follow");
                assert_eq!(event["user_id"], "1");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn routes_revocation() {
        let env = envelope(
            "revocation",
            None,
            serde_json::json!({"subscription": {"id": "sub1", "status": "authorization_revoked"}}),
        );
        match route(&env) {
            RouterAction::Revocation { subscription_id, reason } => {
                assert_eq!(subscription_id, "sub1");
                assert_eq!(reason, "authorization_revoked");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_message_type_is_dropped_not_erroring() {
        let env = envelope("something_new", None, serde_json::json!({}));
        assert!(matches!(route(&env), RouterAction::Unknown { .. }));
    }
}
