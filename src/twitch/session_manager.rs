//! Twitch-side session coordination: subscription lifecycle driven by `session_welcome` (§4.8).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::twitch::connection_manager::TwitchEvent;
use crate::twitch::eventsub_manager::{EventSubManager, DEFAULT_SUBSCRIPTIONS};
use crate::twitch::event_handler::EventHandler;
use crate::twitch::token_manager::TokenManager;

const RETRY_INITIAL: Duration = Duration::from_millis(500);
const RETRY_FACTOR: u32 = 2;
const RETRY_CAP: Duration = Duration::from_secs(5);
const MAX_RETRY_ATTEMPTS: u32 = 8;

/// Surfaced to the owner when default subscriptions could not be created before retries were
/// exhausted. The session itself is left running (§4.8 "do not tear down the session").
#[derive(Debug, Clone)]
pub struct SubscriptionCreationFailed {
    /// Session id the failure applies to.
    pub session_id: String,
}

struct State {
    session_id: Option<String>,
    default_subscriptions_created: bool,
    retry_generation: u64,
}

/// Coordinates EventSub subscription creation/teardown against the session lifecycle reported by
/// a [`crate::twitch::connection_manager::ConnectionManager`].
pub struct SessionManager {
    eventsub: Arc<EventSubManager>,
    token_manager: Arc<TokenManager>,
    event_handler: Arc<EventHandler>,
    state: RwLock<State>,
    failures: watch::Sender<Option<SubscriptionCreationFailed>>,
}

impl SessionManager {
    /// Create a session manager. Call [`Self::run`] with the `ConnectionManager`'s event stream to
    /// drive it.
    #[must_use]
    pub fn new(
        eventsub: Arc<EventSubManager>,
        token_manager: Arc<TokenManager>,
        event_handler: Arc<EventHandler>,
    ) -> (Arc<Self>, watch::Receiver<Option<SubscriptionCreationFailed>>) {
        let (tx, rx) = watch::channel(None);
        let manager = Arc::new(Self {
            eventsub,
            token_manager,
            event_handler,
            state: RwLock::new(State {
                session_id: None,
                default_subscriptions_created: false,
                retry_generation: 0,
            }),
            failures: tx,
        });
        (manager, rx)
    }

    /// Drive this manager from a `ConnectionManager`'s event stream until it closes.
    pub async fn run(self: Arc<Self>, mut events: tokio::sync::mpsc::Receiver<TwitchEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TwitchEvent::SessionWelcome { session_id } => self.on_session_welcome(session_id).await,
                TwitchEvent::Notification { subscription_type, event } => {
                    self.event_handler.handle(&subscription_type, &event).await;
                }
                TwitchEvent::Revocation { subscription_id, reason } => self.on_revocation(subscription_id, reason).await,
                TwitchEvent::Disconnected => self.on_disconnected().await,
            }
        }
    }

    async fn on_session_welcome(self: &Arc<Self>, session_id: String) {
        info!(session_id = %session_id, "twitch session welcome; (re)creating default subscriptions");
        self.eventsub.reset_for_new_session().await;
        self.failures.send_replace(None);

        let generation = {
            let mut state = self.state.write().await;
            state.session_id = Some(session_id.clone());
            state.default_subscriptions_created = false;
            state.retry_generation += 1;
            state.retry_generation
        };

        self.clone().attempt_default_subscriptions(session_id, generation, 0).await;
    }

    async fn attempt_default_subscriptions(self: Arc<Self>, session_id: String, generation: u64, attempt: u32) {
        {
            let state = self.state.read().await;
            if state.session_id.as_deref() != Some(session_id.as_str()) || state.retry_generation != generation {
                debug!(session_id = %session_id, "abandoning stale subscription retry; session changed");
                return;
            }
        }

        let Some(token) = self.token_manager.current() else {
            self.schedule_retry(session_id, generation, attempt);
            return;
        };
        let Some(user_id) = token.user_id.clone() else {
            self.schedule_retry(session_id, generation, attempt);
            return;
        };

        let mut any_succeeded = false;
        for definition in DEFAULT_SUBSCRIPTIONS {
            let condition = crate::twitch::eventsub_manager::condition_template(definition.event_type, &user_id);
            match self
                .eventsub
                .create_subscription(&session_id, definition.event_type, condition, &token.scopes, definition.critical)
                .await
            {
                Ok(_) => any_succeeded = true,
                Err(crate::twitch::eventsub_manager::Error::DuplicateSubscription(key)) => {
                    debug!(key, "default subscription already present");
                    any_succeeded = true;
                }
                Err(e) => {
                    warn!(event_type = definition.event_type, error = %e, "failed to create default subscription");
                }
            }
        }

        if any_succeeded {
            let mut state = self.state.write().await;
            if state.session_id.as_deref() == Some(session_id.as_str()) && state.retry_generation == generation {
                state.default_subscriptions_created = true;
            }
            return;
        }

        self.schedule_retry(session_id, generation, attempt);
    }

    fn schedule_retry(self: &Arc<Self>, session_id: String, generation: u64, attempt: u32) {
        if attempt >= MAX_RETRY_ATTEMPTS {
            error!(session_id = %session_id, attempt, "giving up on default subscription creation; surfacing failure");
            self.failures.send_replace(Some(SubscriptionCreationFailed { session_id }));
            return;
        }

        let delay_ms = (RETRY_INITIAL.as_millis() as u64 * u64::from(RETRY_FACTOR).pow(attempt)).min(RETRY_CAP.as_millis() as u64);
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            this.attempt_default_subscriptions(session_id, generation, attempt + 1).await;
        });
    }

    async fn on_revocation(&self, subscription_id: String, reason: String) {
        info!(subscription_id = %subscription_id, reason = %reason, "removing revoked twitch subscription from local set");
        self.eventsub.forget(&subscription_id).await;
    }

    async fn on_disconnected(&self) {
        let mut state = self.state.write().await;
        state.session_id = None;
        state.default_subscriptions_created = false;
        state.retry_generation += 1;
    }

    /// Whether the default subscription set has been created at least once for the current
    /// session. Resets to `false` on every new `session_welcome`.
    pub async fn default_subscriptions_created(&self) -> bool {
        self.state.read().await.default_subscriptions_created
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity_log::NullActivityLogSink;
    use crate::metrics::TracingMetrics;
    use crate::pubsub::Bus;
    use crate::twitch::token_store::{JsonFileTokenStore, PersistedTokens};

    async fn manager() -> Arc<SessionManager> {
        let http = reqwest::Client::new();
        let eventsub = Arc::new(EventSubManager::new(http.clone(), "client".to_owned(), "token".to_owned()));
        let path = std::env::temp_dir().join(format!("streamcore-session-manager-test-{}.json", std::process::id()));
        let store = Arc::new(JsonFileTokenStore::new(path));
        let (token_manager, _rx) = TokenManager::start(http, "client".to_owned(), "secret".to_owned(), store).await;
        let event_handler = Arc::new(EventHandler::new(Bus::default(), Arc::new(TracingMetrics), Arc::new(NullActivityLogSink)));
        let (manager, _failures) = SessionManager::new(eventsub, token_manager, event_handler);
        manager
    }

    #[tokio::test]
    async fn starts_with_no_subscriptions_created() {
        let manager = manager().await;
        assert!(!manager.default_subscriptions_created().await);
    }

    #[tokio::test]
    async fn schedules_retry_when_user_id_unknown() {
        let manager = manager().await;
        manager.clone().on_session_welcome("session-1".to_owned()).await;
        // No token validated yet, so user_id is unknown; creation must not have completed
        // synchronously and the session must still be tracked as pending.
        assert!(!manager.default_subscriptions_created().await);
    }

    #[tokio::test]
    async fn disconnect_clears_session_state() {
        let manager = manager().await;
        manager.clone().on_session_welcome("session-1".to_owned()).await;
        manager.on_disconnected().await;
        assert!(!manager.default_subscriptions_created().await);
        assert!(manager.state.read().await.session_id.is_none());
    }
}
