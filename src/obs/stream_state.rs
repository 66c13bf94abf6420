//! OBS stream/record/output domain state (§4.4 "StreamManager").

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::pubsub::{topics, Bus, BusEvent};

/// A snapshot of OBS's output states.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StreamState {
    /// Whether the stream output is active.
    pub streaming: bool,
    /// Whether the record output is active.
    pub recording: bool,
    /// Whether recording is currently paused.
    pub recording_paused: bool,
    /// Whether the virtual camera is active.
    pub virtual_cam_active: bool,
    /// Whether the replay buffer is active.
    pub replay_buffer_active: bool,
}

/// Maintains [`StreamState`] for one OBS session by subscribing to its event topic.
pub struct StreamManager {
    session_id: String,
    bus: Bus,
    state: watch::Sender<StreamState>,
}

impl StreamManager {
    /// Start tracking output state for `session_id`.
    #[must_use]
    pub fn start(session_id: String, bus: Bus) -> (Arc<Self>, watch::Receiver<StreamState>) {
        let (tx, rx) = watch::channel(StreamState::default());
        let manager = Arc::new(Self { session_id, bus, state: tx });

        let worker = manager.clone();
        tokio::spawn(async move { worker.run().await });

        (manager, rx)
    }

    async fn run(self: Arc<Self>) {
        let mut events = self.bus.subscribe(topics::obs_session_events(&self.session_id)).await;
        while let Some(BusEvent { payload, .. }) = events.recv().await {
            let Some(event_type) = payload["eventType"].as_str() else { continue };
            let data = &payload["eventData"];

            match event_type {
                "StreamStateChanged" => self.apply(|s| s.streaming = active(data, "outputActive")),
                "RecordStateChanged" => self.apply(|s| s.recording = active(data, "outputActive")),
                "RecordPauseStateChanged" => {
                    if let Some(paused) = data["outputPaused"].as_bool() {
                        self.apply(|s| s.recording_paused = paused);
                    }
                }
                "VirtualCamStateChanged" => self.apply(|s| s.virtual_cam_active = active(data, "outputActive")),
                "ReplayBufferStateChanged" => self.apply(|s| s.replay_buffer_active = active(data, "outputActive")),
                _ => {}
            }
        }
    }

    fn apply(&self, f: impl FnOnce(&mut StreamState)) {
        self.state.send_modify(f);
    }
}

fn active(data: &serde_json::Value, field: &str) -> bool {
    data[field].as_bool().unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_state_changed_updates_snapshot() {
        let bus = Bus::default();
        let (_manager, mut rx) = StreamManager::start("s1".to_owned(), bus.clone());

        bus.publish(
            topics::obs_session_events("s1"),
            serde_json::json!({
                "sessionId": "s1",
                "eventType": "StreamStateChanged",
                "eventData": { "outputActive": true, "outputState": "OBS_WEBSOCKET_OUTPUT_STARTED" },
            }),
        )
        .await;

        rx.changed().await.unwrap();
        assert!(rx.borrow().streaming);
    }

    #[tokio::test]
    async fn record_pause_state_changed_updates_snapshot() {
        let bus = Bus::default();
        let (_manager, mut rx) = StreamManager::start("s1".to_owned(), bus.clone());

        bus.publish(
            topics::obs_session_events("s1"),
            serde_json::json!({
                "sessionId": "s1",
                "eventType": "RecordPauseStateChanged",
                "eventData": { "outputPaused": true },
            }),
        )
        .await;

        rx.changed().await.unwrap();
        assert!(rx.borrow().recording_paused);
    }
}
