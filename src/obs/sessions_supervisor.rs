//! Top-level keyed OBS session supervisor (§4.5 "A top-level `SessionsSupervisor`").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tracing::warn;

use crate::metrics::Metrics;
use crate::obs::session_manager::{SessionHandles, SessionManager};
use crate::pubsub::Bus;

/// Error returned when a session id is already registered.
#[derive(Debug, thiserror::Error)]
#[error("obs session '{0}' is already running")]
pub struct DuplicateSession(pub String);

/// Dynamically starts and stops [`SessionManager`]s keyed by session id, enforcing that no two
/// sessions share an id.
#[derive(Clone)]
pub struct SessionsSupervisor {
    bus: Bus,
    metrics: Arc<dyn Metrics>,
    reconnect_base_delay: Duration,
    sessions: Arc<RwLock<HashMap<String, Arc<SessionManager>>>>,
}

impl SessionsSupervisor {
    /// Create an empty supervisor. `reconnect_base_delay` seeds every session's transport backoff
    /// policy (§6 `reconnect_interval_ms`).
    #[must_use]
    pub fn new(bus: Bus, metrics: Arc<dyn Metrics>, reconnect_base_delay: Duration) -> Self {
        Self {
            bus,
            metrics,
            reconnect_base_delay,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start a new session. Fails if `session_id` is already running.
    pub async fn start_session(
        &self,
        session_id: String,
        uri: String,
        password: Option<String>,
    ) -> Result<watch::Receiver<Option<SessionHandles>>, DuplicateSession> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session_id) {
            return Err(DuplicateSession(session_id));
        }

        let (manager, handles_rx) = SessionManager::start(
            session_id.clone(),
            uri,
            password,
            self.bus.clone(),
            self.metrics.clone(),
            self.reconnect_base_delay,
        );
        sessions.insert(session_id, manager);
        Ok(handles_rx)
    }

    /// Stop and forget a session. No-op if it was not running.
    pub async fn stop_session(&self, session_id: &str) {
        if let Some(manager) = self.sessions.write().await.remove(session_id) {
            manager.stop();
        } else {
            warn!(session = %session_id, "stop_session: no such session");
        }
    }

    /// Currently registered session ids.
    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::TracingMetrics;

    fn supervisor() -> SessionsSupervisor {
        SessionsSupervisor::new(Bus::default(), Arc::new(TracingMetrics), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn duplicate_session_id_is_rejected() {
        let supervisor = supervisor();
        supervisor
            .start_session("s1".to_owned(), "ws://127.0.0.1:0".to_owned(), None)
            .await
            .unwrap();

        let result = supervisor.start_session("s1".to_owned(), "ws://127.0.0.1:0".to_owned(), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn stop_session_allows_id_reuse() {
        let supervisor = supervisor();
        supervisor
            .start_session("s1".to_owned(), "ws://127.0.0.1:0".to_owned(), None)
            .await
            .unwrap();
        supervisor.stop_session("s1").await;

        let result = supervisor.start_session("s1".to_owned(), "ws://127.0.0.1:0".to_owned(), None).await;
        assert!(result.is_ok());
    }
}
