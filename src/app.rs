//! Wires one full instance of the integration core together from [`Config`] (§2 "Data/control
//! flow").
//!
//! This is the composition root: it owns no protocol logic of its own, only the construction and
//! cancellation-aware shutdown of the components defined elsewhere in the crate. The binary entry
//! point ([`crate`] root `main.rs`) is a thin wrapper that loads [`Config`], builds an [`App`], and
//! awaits [`App::run`] until `Ctrl-C` or an owner-driven shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::activity_log::{ActivityLogSink, NullActivityLogSink};
use crate::config::Config;
use crate::correlation::service::CorrelationService;
use crate::metrics::{Metrics, TracingMetrics};
use crate::obs::sessions_supervisor::SessionsSupervisor;
use crate::pubsub::Bus;
use crate::twitch::connection_manager::ConnectionManager;
use crate::twitch::event_handler::EventHandler;
use crate::twitch::eventsub_manager::EventSubManager;
use crate::twitch::session_manager::SessionManager as TwitchSessionManager;
use crate::twitch::token_manager::TokenManager;
use crate::twitch::token_store::{JsonFileTokenStore, TokenStore};

/// The default OBS session id used for the single configured OBS instance (§6 configuration has
/// no notion of multiple OBS targets; §9 Open Question 2 notes the system permits but does not
/// require deduplicating against the same physical instance).
const DEFAULT_OBS_SESSION_ID: &str = "default";

/// A fully wired instance of the integration core: OBS session supervision, Twitch EventSub
/// supervision, and the temporal correlation engine, all publishing onto one shared [`Bus`].
pub struct App {
    bus: Bus,
    obs_sessions: Arc<SessionsSupervisor>,
    twitch_connection: Arc<ConnectionManager>,
    correlation: Arc<CorrelationService>,
    cancel: CancellationToken,
}

impl App {
    /// Build every component and start their background tasks, but do not yet connect to OBS or
    /// Twitch — call [`Self::run`] to do that and block until shutdown.
    pub async fn new(config: Config, activity_log: Arc<dyn ActivityLogSink>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .build()?;
        let bus = Bus::default();
        let metrics: Arc<dyn Metrics> = Arc::new(TracingMetrics);

        let token_store: Arc<dyn TokenStore> = Arc::new(JsonFileTokenStore::new(config.token_store_path.clone()));
        let (token_manager, mut token_rx) =
            TokenManager::start(http.clone(), config.twitch_client_id.clone(), config.twitch_client_secret.clone(), token_store).await;

        let eventsub = Arc::new(EventSubManager::new(
            http.clone(),
            config.twitch_client_id.clone(),
            token_manager.current().map(|t| t.access_token).unwrap_or_default(),
        ));
        {
            let eventsub = eventsub.clone();
            tokio::spawn(async move {
                loop {
                    if token_rx.changed().await.is_err() {
                        return;
                    }
                    if let Some(token) = token_rx.borrow().clone() {
                        eventsub.set_access_token(token.access_token).await;
                    }
                }
            });
        }

        let reconnect_base_delay = Duration::from_millis(config.reconnect_interval_ms);

        let event_handler = Arc::new(EventHandler::new(bus.clone(), metrics.clone(), activity_log.clone()));
        let (twitch_session_manager, mut subscription_failures) = TwitchSessionManager::new(eventsub, token_manager, event_handler);
        let (twitch_connection, twitch_events) = ConnectionManager::start(config.twitch_client_id.clone(), reconnect_base_delay);

        tokio::spawn({
            let manager = twitch_session_manager.clone();
            async move { manager.run(twitch_events).await }
        });
        tokio::spawn(async move {
            loop {
                if subscription_failures.changed().await.is_err() {
                    return;
                }
                if let Some(failure) = subscription_failures.borrow().clone() {
                    error!(session_id = %failure.session_id, "twitch default subscription creation failed; session continues degraded");
                }
            }
        });

        let obs_sessions = Arc::new(SessionsSupervisor::new(bus.clone(), metrics.clone(), reconnect_base_delay));
        let correlation = CorrelationService::start(bus.clone(), metrics.clone());

        Ok(Self {
            bus,
            obs_sessions,
            twitch_connection,
            correlation,
            cancel: CancellationToken::new(),
        })
    }

    /// The shared publish/subscribe bus, for an embedding process that wants to subscribe
    /// directly (e.g. a dashboard channel layer) rather than going through a network boundary.
    #[must_use]
    pub fn bus(&self) -> Bus {
        self.bus.clone()
    }

    /// The OBS sessions supervisor, for starting/stopping sessions at runtime.
    #[must_use]
    pub fn obs_sessions(&self) -> Arc<SessionsSupervisor> {
        self.obs_sessions.clone()
    }

    /// The correlation engine, for feeding it transcription events.
    #[must_use]
    pub fn correlation(&self) -> Arc<CorrelationService> {
        self.correlation.clone()
    }

    /// Start the single configured OBS session (§6 "obs_websocket_host"/"obs_websocket_port").
    pub async fn start_default_obs_session(&self, config: &Config) -> anyhow::Result<()> {
        let uri = format!("ws://{}:{}", config.obs_websocket_host, config.obs_websocket_port);
        let password = (!config.obs_websocket_password.is_empty()).then(|| config.obs_websocket_password.clone());
        self.obs_sessions
            .start_session(DEFAULT_OBS_SESSION_ID.to_owned(), uri, password)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    /// Run until cancelled (by [`Self::shutdown`] or an external `Ctrl-C` watcher). Owner
    /// termination cascades: cancelling stops accepting new work but does not race-restart any
    /// child (§5 "Owner-process termination cascades").
    pub async fn run(&self) {
        info!("stream-event integration core running");
        self.cancel.cancelled().await;
        info!("shutdown requested; stopping obs sessions");
        for session_id in self.obs_sessions.session_ids().await {
            self.obs_sessions.stop_session(&session_id).await;
        }
        let state = self.twitch_connection.state().await;
        warn!(?state, "integration core stopped");
    }

    /// Request shutdown. Safe to call multiple times.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// A token that cancels when [`Self::shutdown`] is called, for an embedder that wants to
    /// watch for shutdown alongside its own work.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Spawn a task that calls [`App::shutdown`] on `Ctrl-C`, matching the cancellation-token
/// shutdown pattern used across the corpus's service binaries.
pub fn spawn_ctrl_c_watcher(app: &App) {
    let cancel = app.cancellation_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("caught ctrl-c; shutting down");
        cancel.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity_log::NullActivityLogSink;

    fn test_config() -> Config {
        Config {
            twitch_client_id: "id".to_owned(),
            twitch_client_secret: "secret".to_owned(),
            obs_websocket_password: String::new(),
            obs_websocket_host: "localhost".to_owned(),
            obs_websocket_port: 4455,
            http_timeout_ms: 10_000,
            reconnect_interval_ms: 5_000,
            database_url: "sqlite://local.db".to_owned(),
            secret_key_base: "base".to_owned(),
            token_store_path: std::env::temp_dir()
                .join(format!("streamcore-app-test-{}.json", std::process::id()))
                .to_string_lossy()
                .into_owned(),
        }
    }

    #[tokio::test]
    async fn builds_without_connecting_to_anything() {
        let app = App::new(test_config(), Arc::new(NullActivityLogSink)).await.unwrap();
        assert!(app.obs_sessions.session_ids().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_the_token() {
        let app = App::new(test_config(), Arc::new(NullActivityLogSink)).await.unwrap();
        let token = app.cancellation_token();
        app.shutdown();
        assert!(token.is_cancelled());
    }
}
