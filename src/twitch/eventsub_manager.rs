//! Twitch Helix EventSub subscription management (§4.9).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const HELIX_SUBSCRIPTIONS_URL: &str = "https://api.twitch.tv/helix/eventsub/subscriptions";

/// One row of the default subscription set (§4.9 "Default subscription set").
pub struct DefaultSubscription {
    /// EventSub subscription type.
    pub event_type: &'static str,
    /// Scopes required to create it.
    pub required_scopes: &'static [&'static str],
    /// Critical events get extra create-retries (§4.9 "Critical events").
    pub critical: bool,
}

/// The default subscription set every session re-creates on `session_welcome`.
pub const DEFAULT_SUBSCRIPTIONS: &[DefaultSubscription] = &[
    DefaultSubscription { event_type: "stream.online", required_scopes: &[], critical: true },
    DefaultSubscription { event_type: "stream.offline", required_scopes: &[], critical: true },
    DefaultSubscription { event_type: "channel.update", required_scopes: &[], critical: true },
    DefaultSubscription { event_type: "channel.follow", required_scopes: &["moderator:read:followers"], critical: true },
    DefaultSubscription { event_type: "channel.subscribe", required_scopes: &["channel:read:subscriptions"], critical: false },
    DefaultSubscription {
        event_type: "channel.subscription.gift",
        required_scopes: &["channel:read:subscriptions"],
        critical: false,
    },
    DefaultSubscription { event_type: "channel.cheer", required_scopes: &["bits:read"], critical: false },
    DefaultSubscription {
        event_type: "channel.chat.message",
        required_scopes: &["user:read:chat"],
        critical: false,
    },
    DefaultSubscription {
        event_type: "channel.chat.clear",
        required_scopes: &["user:read:chat"],
        critical: false,
    },
    DefaultSubscription {
        event_type: "channel.chat.message_delete",
        required_scopes: &["user:read:chat"],
        critical: false,
    },
    DefaultSubscription { event_type: "channel.raid", required_scopes: &[], critical: false },
];

/// Required scope set for a given event type, beyond the default table (used by ad-hoc
/// subscriptions the default table does not cover).
#[must_use]
pub fn required_scopes(event_type: &str) -> &'static [&'static str] {
    DEFAULT_SUBSCRIPTIONS
        .iter()
        .find(|s| s.event_type == event_type)
        .map_or(&[], |s| s.required_scopes)
}

/// Helix API version to request for a given event type (§4.9 "Select API version per event type").
#[must_use]
pub fn api_version(event_type: &str) -> &'static str {
    match event_type {
        "channel.follow" | "channel.update" => "2",
        _ => "1",
    }
}

/// Build the `condition` object for a default subscription, given the authorized user's id
/// (§4.9 "Condition templates").
#[must_use]
pub fn condition_template(event_type: &str, user_id: &str) -> serde_json::Value {
    if event_type == "channel.follow" || event_type.starts_with("channel.shoutout.") {
        serde_json::json!({ "broadcaster_user_id": user_id, "moderator_user_id": user_id })
    } else if event_type.starts_with("channel.chat.") {
        serde_json::json!({ "broadcaster_user_id": user_id, "user_id": user_id })
    } else if event_type == "user.update" {
        serde_json::json!({ "user_id": user_id })
    } else if event_type == "channel.raid" {
        serde_json::json!({ "to_broadcaster_user_id": user_id })
    } else {
        serde_json::json!({ "broadcaster_user_id": user_id })
    }
}

/// Recursively key-sort a JSON value so structurally equal conditions always serialize
/// byte-identically, independent of field order (§4.9 "normalize `condition` by key-sorting").
#[must_use]
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: BTreeMap<String, serde_json::Value> = map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                serde_json::to_value(sorted).expect("BTreeMap<String, Value> always serializes")
            }
            serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

/// Build the deduplication key for a subscription: `type + ":" + canonical_json(condition)`.
#[must_use]
pub fn dedup_key(event_type: &str, condition: &serde_json::Value) -> String {
    format!("{event_type}:{}", canonical_json(condition))
}

/// A created EventSub subscription, as tracked locally.
#[derive(Clone, Debug)]
pub struct Subscription {
    /// Helix-assigned subscription id.
    pub id: String,
    /// EventSub subscription type.
    pub event_type: String,
    /// Normalized condition this subscription was created with.
    pub condition: serde_json::Value,
    /// Twitch-reported cost against the session's total budget.
    pub cost: u32,
}

/// Errors from [`EventSubManager`] operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// `scopes_present` does not contain every scope `required_scope[event_type]` names.
    #[error("missing required scopes for {event_type}: {missing:?}")]
    MissingScopes {
        /// The event type that was declined.
        event_type: String,
        /// The specific scopes that were absent.
        missing: Vec<String>,
    },
    /// A subscription with the same `type:condition` key already exists for this session.
    #[error("duplicate subscription for {0}")]
    DuplicateSubscription(String),
    /// Creating this subscription would exceed the session's `max_total_cost`.
    #[error("subscription cost {cost} would exceed remaining budget {remaining}")]
    CostExceeded {
        /// Cost of the subscription that was declined.
        cost: u32,
        /// Budget remaining before this subscription.
        remaining: u32,
    },
    /// The Helix API returned a non-retryable error status.
    #[error("helix request failed: {0}")]
    Http(String),
    /// Transport-level failure talking to Helix.
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    #[serde(rename = "type")]
    event_type: &'a str,
    version: &'a str,
    condition: &'a serde_json::Value,
    transport: CreateTransport<'a>,
}

#[derive(Serialize)]
struct CreateTransport<'a> {
    method: &'static str,
    session_id: &'a str,
}

#[derive(Deserialize)]
struct CreateResponse {
    data: Vec<CreatedSubscription>,
}

#[derive(Deserialize)]
struct CreatedSubscription {
    id: String,
    cost: u32,
}

/// Manages the set of EventSub subscriptions for one session, including cost accounting and
/// client-side deduplication.
pub struct EventSubManager {
    http: reqwest::Client,
    client_id: String,
    access_token: Arc<Mutex<String>>,
    max_total_cost: Arc<Mutex<u32>>,
    total_cost: Arc<Mutex<u32>>,
    by_key: Arc<Mutex<HashMap<String, Subscription>>>,
}

impl EventSubManager {
    /// Create a manager for a freshly started session (`total_cost` resets to 0; `max_total_cost`
    /// is reported by Twitch on the first successful subscription and defaults to 10 until then).
    #[must_use]
    pub fn new(http: reqwest::Client, client_id: String, access_token: String) -> Self {
        Self {
            http,
            client_id,
            access_token: Arc::new(Mutex::new(access_token)),
            max_total_cost: Arc::new(Mutex::new(10)),
            total_cost: Arc::new(Mutex::new(0)),
            by_key: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Update the access token used for subsequent requests (after a refresh).
    pub async fn set_access_token(&self, access_token: String) {
        *self.access_token.lock().await = access_token;
    }

    /// Reset bookkeeping for a new session (fresh `session_id` means Twitch's subscription set is
    /// empty again).
    pub async fn reset_for_new_session(&self) {
        self.by_key.lock().await.clear();
        *self.total_cost.lock().await = 0;
    }

    /// Create one subscription, applying scope validation, dedup, and cost accounting before
    /// calling Helix. Critical event types get up to 3 retries on transient failure; everything
    /// else gets 1 attempt (§4.9 "Critical events").
    pub async fn create_subscription(
        &self,
        session_id: &str,
        event_type: &str,
        condition: serde_json::Value,
        scopes_present: &[String],
        critical: bool,
    ) -> Result<Subscription, Error> {
        let required = required_scopes(event_type);
        let missing: Vec<String> = required
            .iter()
            .filter(|scope| !scopes_present.iter().any(|present| present == *scope))
            .map(|s| (*s).to_owned())
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingScopes { event_type: event_type.to_owned(), missing });
        }

        let condition = serde_json::from_str::<serde_json::Value>(&canonical_json(&condition)).expect("canonical_json round-trips");
        let key = dedup_key(event_type, &condition);
        if self.by_key.lock().await.contains_key(&key) {
            return Err(Error::DuplicateSubscription(key));
        }

        let attempts = if critical { 3 } else { 1 };
        let mut last_err = None;
        for attempt in 0..attempts {
            match self.try_create(session_id, event_type, &condition).await {
                Ok(subscription) => {
                    self.by_key.lock().await.insert(key, subscription.clone());
                    return Ok(subscription);
                }
                Err(e @ (Error::MissingScopes { .. } | Error::DuplicateSubscription(_) | Error::CostExceeded { .. })) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(event_type, attempt, error = %e, "eventsub create failed; retrying if attempts remain");
                    last_err = Some(e);
                    if attempt + 1 < attempts {
                        let wait_ms = (1000u64 * 2u64.pow(attempt)).min(5000);
                        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt was made"))
    }

    async fn try_create(&self, session_id: &str, event_type: &str, condition: &serde_json::Value) -> Result<Subscription, Error> {
        let request = CreateRequest {
            event_type,
            version: api_version(event_type),
            condition,
            transport: CreateTransport { method: "websocket", session_id },
        };

        let access_token = self.access_token.lock().await.clone();
        let response = self
            .http
            .post(HELIX_SUBSCRIPTIONS_URL)
            .header("Client-Id", &self.client_id)
            .header("Authorization", format!("Bearer {access_token}"))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() != 202 {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Http(format!("{status} {body}")));
        }

        let body: CreateResponse = response.json().await?;
        let created = body.data.into_iter().next().ok_or_else(|| Error::Http("empty data[]".to_owned()))?;

        let max_total_cost = *self.max_total_cost.lock().await;
        let mut total_cost = self.total_cost.lock().await;
        if *total_cost + created.cost > max_total_cost {
            let remaining = max_total_cost - *total_cost;
            drop(total_cost);
            // Twitch already created it server-side; roll back rather than leak an
            // untracked subscription that would keep consuming budget silently.
            if let Err(e) = self.delete_subscription(&created.id).await {
                warn!(id = %created.id, error = %e, "failed to roll back cost-exceeded subscription");
            }
            return Err(Error::CostExceeded { cost: created.cost, remaining });
        }
        *total_cost += created.cost;

        Ok(Subscription {
            id: created.id,
            event_type: event_type.to_owned(),
            condition: condition.clone(),
            cost: created.cost,
        })
    }

    /// Delete a subscription by id. `404` and `204` are both treated as success (already gone is
    /// not an error).
    pub async fn delete_subscription(&self, id: &str) -> Result<(), Error> {
        let access_token = self.access_token.lock().await.clone();
        let url = format!("{HELIX_SUBSCRIPTIONS_URL}?id={}", urlencode(id));
        let response = self
            .http
            .delete(url)
            .header("Client-Id", &self.client_id)
            .header("Authorization", format!("Bearer {access_token}"))
            .send()
            .await?;

        let status = response.status().as_u16();
        if status == 204 || status == 404 {
            self.by_key.lock().await.retain(|_, s| s.id != id);
            debug!(id, "eventsub subscription deleted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(Error::Http(format!("{status} {body}")))
    }

    /// Remove a subscription from local bookkeeping without calling Helix (used on `revocation`,
    /// where Twitch has already torn it down server-side).
    pub async fn forget(&self, id: &str) {
        let mut by_key = self.by_key.lock().await;
        if let Some((key, subscription)) = by_key.iter().find(|(_, s)| s.id == id).map(|(k, s)| (k.clone(), s.clone())) {
            by_key.remove(&key);
            drop(by_key);
            let mut total_cost = self.total_cost.lock().await;
            *total_cost -= subscription.cost.min(*total_cost);
        }
    }
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_template_uses_moderator_shape_for_follow() {
        let condition = condition_template("channel.follow", "123");
        assert_eq!(condition["broadcaster_user_id"], "123");
        assert_eq!(condition["moderator_user_id"], "123");
    }

    #[test]
    fn condition_template_uses_chat_shape_for_chat_events() {
        let condition = condition_template("channel.chat.message", "123");
        assert_eq!(condition["user_id"], "123");
    }

    #[test]
    fn condition_template_uses_to_broadcaster_for_raid() {
        let condition = condition_template("channel.raid", "123");
        assert_eq!(condition["to_broadcaster_user_id"], "123");
        assert!(condition.get("broadcaster_user_id").is_none());
    }

    #[test]
    fn canonical_json_is_order_independent() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn api_version_matches_spec_table() {
        assert_eq!(api_version("channel.follow"), "2");
        assert_eq!(api_version("channel.update"), "2");
        assert_eq!(api_version("channel.cheer"), "1");
    }

    #[test]
    fn dedup_key_combines_type_and_condition() {
        let condition = serde_json::json!({"broadcaster_user_id": "1"});
        assert_eq!(dedup_key("channel.follow", &condition), format!("channel.follow:{}", canonical_json(&condition)));
    }

    #[tokio::test]
    async fn forget_does_not_deadlock_and_clears_cost() {
        let manager = EventSubManager::new(reqwest::Client::new(), "client".to_owned(), "token".to_owned());
        let key = dedup_key("channel.follow", &serde_json::json!({"broadcaster_user_id": "1"}));
        manager.by_key.lock().await.insert(
            key,
            Subscription {
                id: "sub1".to_owned(),
                event_type: "channel.follow".to_owned(),
                condition: serde_json::json!({"broadcaster_user_id": "1"}),
                cost: 1,
            },
        );
        *manager.total_cost.lock().await = 1;

        tokio::time::timeout(Duration::from_secs(1), manager.forget("sub1")).await.expect("forget must not deadlock");

        assert_eq!(*manager.total_cost.lock().await, 0);
        assert!(manager.by_key.lock().await.is_empty());
    }
}
