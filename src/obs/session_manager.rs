//! OBS per-session supervisor (§4.5 "OBS SessionManager").
//!
//! Owns one session's full child set: [`Connection`], [`SceneManager`], [`StreamManager`], and
//! [`StatsCollector`]. They all derive from the same `Connection` event source, so the restart
//! strategy is one-for-all: a fatal protocol error tears down and restarts every child together
//! rather than trying to recover just the failed part.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics::Metrics;
use crate::obs::connection::Connection;
use crate::obs::scene::{SceneManager, SceneState};
use crate::obs::stats::{Stats, StatsCollector};
use crate::obs::stream_state::{StreamManager, StreamState};
use crate::pubsub::Bus;

/// Read-only handles into a running session's domain state, refreshed as the session restarts.
#[derive(Clone)]
pub struct SessionHandles {
    /// The live OBS request/event connection.
    pub connection: Arc<Connection>,
    /// Scene state snapshots.
    pub scene: watch::Receiver<SceneState>,
    /// Stream/record/output state snapshots.
    pub stream: watch::Receiver<StreamState>,
    /// Performance stats snapshots.
    pub stats: watch::Receiver<Stats>,
}

/// Supervises one OBS session, restarting its whole child set on fatal failure.
pub struct SessionManager {
    session_id: String,
    uri: String,
    password: Option<String>,
    bus: Bus,
    metrics: Arc<dyn Metrics>,
    reconnect_base_delay: Duration,
    cancel: CancellationToken,
    handles: watch::Sender<Option<SessionHandles>>,
}

impl SessionManager {
    /// Start supervising `session_id`. Returns the manager and a receiver that yields the current
    /// [`SessionHandles`] each time the session (re)starts; `None` while a restart is in progress.
    #[must_use]
    pub fn start(
        session_id: String,
        uri: String,
        password: Option<String>,
        bus: Bus,
        metrics: Arc<dyn Metrics>,
        reconnect_base_delay: Duration,
    ) -> (Arc<Self>, watch::Receiver<Option<SessionHandles>>) {
        let (handles_tx, handles_rx) = watch::channel(None);
        let manager = Arc::new(Self {
            session_id,
            uri,
            password,
            bus,
            metrics,
            reconnect_base_delay,
            cancel: CancellationToken::new(),
            handles: handles_tx,
        });

        let worker = manager.clone();
        tokio::spawn(async move { worker.supervise().await });

        (manager, handles_rx)
    }

    /// Stop this session for good. Does not restart.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn supervise(self: Arc<Self>) {
        let mut restart_count: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            info!(session = %self.session_id, restart_count, "starting obs session children");
            let (connection, mut fatal_rx) = Connection::start(
                self.session_id.clone(),
                self.uri.clone(),
                self.password.clone(),
                self.bus.clone(),
                self.metrics.clone(),
                self.reconnect_base_delay,
            );
            let (_scene, scene_rx) = SceneManager::start(self.session_id.clone(), self.bus.clone());
            let (_stream, stream_rx) = StreamManager::start(self.session_id.clone(), self.bus.clone());
            let (_stats, stats_rx) = StatsCollector::start(self.session_id.clone(), connection.clone(), self.bus.clone());

            self.handles.send_replace(Some(SessionHandles {
                connection: connection.clone(),
                scene: scene_rx,
                stream: stream_rx,
                stats: stats_rx,
            }));

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    connection.stop().await;
                    self.handles.send_replace(None);
                    return;
                }
                fatal = &mut fatal_rx => {
                    match fatal {
                        Ok(error) => error!(session = %self.session_id, error = %error, "obs session failed fatally; restarting all children"),
                        Err(_) => warn!(session = %self.session_id, "obs connection task ended unexpectedly; restarting all children"),
                    }
                }
            }

            self.handles.send_replace(None);
            restart_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::TracingMetrics;

    #[tokio::test]
    async fn stop_prevents_further_restarts() {
        let (manager, _rx) = SessionManager::start(
            "s1".to_owned(),
            "ws://127.0.0.1:0".to_owned(),
            None,
            Bus::default(),
            Arc::new(TracingMetrics),
            Duration::from_secs(1),
        );
        manager.stop();
        assert!(manager.cancel.is_cancelled());
    }
}
