//! OBS performance stats polling (§4.4 "StatsCollector").

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::obs::connection::{Connection, ConnectionState};
use crate::pubsub::{topics, Bus};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const LIVENESS_DEADLINE: Duration = Duration::from_secs(2);

/// Cached OBS performance counters, as reported by `GetStats`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Stats {
    /// Current frames rendered per second.
    pub active_fps: f64,
    /// Average time, in milliseconds, to render a frame.
    pub average_frame_time: f64,
    /// Current CPU usage, as a percentage.
    pub cpu_usage: f64,
    /// Current RAM usage, in megabytes.
    pub memory_usage: f64,
    /// Free disk space on the recording drive, in megabytes.
    pub available_disk_space: f64,
    /// Total frames rendered by OBS's internal renderer.
    pub render_total_frames: u64,
    /// Frames skipped by OBS's internal renderer.
    pub render_skipped_frames: u64,
    /// Total frames sent to the output encoders.
    pub output_total_frames: u64,
    /// Frames the output encoders skipped (e.g. due to encoding lag).
    pub output_skipped_frames: u64,
}

/// Polls an OBS session's stats on a fixed interval, skipping polls while disconnected.
pub struct StatsCollector {
    session_id: String,
    connection: Arc<Connection>,
    bus: Bus,
    state: watch::Sender<Stats>,
}

impl StatsCollector {
    /// Start polling. Returns the collector and a receiver for [`Stats`] snapshots.
    #[must_use]
    pub fn start(session_id: String, connection: Arc<Connection>, bus: Bus) -> (Arc<Self>, watch::Receiver<Stats>) {
        let (tx, rx) = watch::channel(Stats::default());
        let collector = Arc::new(Self { session_id, connection, bus, state: tx });

        let worker = collector.clone();
        tokio::spawn(async move { worker.run().await });

        (collector, rx)
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.poll_once().await;
        }
    }

    async fn poll_once(&self) {
        if self.connection.state().await != ConnectionState::Ready {
            debug!(session = %self.session_id, "skipping stats poll: not connected");
            return;
        }

        let liveness = self
            .connection
            .send_request_with_timeout("GetSceneList", serde_json::Value::Null, LIVENESS_DEADLINE)
            .await;
        if liveness.is_err() {
            debug!(session = %self.session_id, "skipping stats poll: liveness probe failed");
            return;
        }

        let Ok(data) = self.connection.send_request("GetStats", serde_json::Value::Null).await else {
            debug!(session = %self.session_id, "GetStats failed");
            return;
        };

        let stats = Stats {
            active_fps: data["activeFps"].as_f64().unwrap_or_default(),
            average_frame_time: data["averageFrameRenderTime"].as_f64().unwrap_or_default(),
            cpu_usage: data["cpuUsage"].as_f64().unwrap_or_default(),
            memory_usage: data["memoryUsage"].as_f64().unwrap_or_default(),
            available_disk_space: data["availableDiskSpace"].as_f64().unwrap_or_default(),
            render_total_frames: data["renderTotalFrames"].as_u64().unwrap_or_default(),
            render_skipped_frames: data["renderSkippedFrames"].as_u64().unwrap_or_default(),
            output_total_frames: data["outputTotalFrames"].as_u64().unwrap_or_default(),
            output_skipped_frames: data["outputSkippedFrames"].as_u64().unwrap_or_default(),
        };

        self.state.send_replace(stats.clone());
        self.bus
            .publish(
                topics::OBS_STATS,
                serde_json::json!({ "sessionId": self.session_id, "stats": stats }),
            )
            .await;
    }
}
