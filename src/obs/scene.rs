//! OBS scene domain state (§4.4 "SceneManager").
//!
//! Single-writer cache rebuilt from the raw event stream; readers observe an eventually
//! consistent snapshot through a [`tokio::sync::watch`] handle rather than locking shared state.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::pubsub::{topics, Bus, BusEvent};

/// A snapshot of the current OBS scene collection state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SceneState {
    /// Names of every scene in the current collection, in OBS order.
    pub scenes: Vec<String>,
    /// Name of the active program scene, if known.
    pub current_program_scene: Option<String>,
    /// Name of the active preview scene (studio mode only).
    pub current_preview_scene: Option<String>,
    /// Whether studio mode is enabled.
    pub studio_mode_enabled: bool,
}

/// Maintains [`SceneState`] for one OBS session by subscribing to its event topic.
pub struct SceneManager {
    session_id: String,
    bus: Bus,
    state: watch::Sender<SceneState>,
}

impl SceneManager {
    /// Start tracking scene state for `session_id`. Returns the manager and a receiver for
    /// snapshots of [`SceneState`] as they change.
    #[must_use]
    pub fn start(session_id: String, bus: Bus) -> (Arc<Self>, watch::Receiver<SceneState>) {
        let (tx, rx) = watch::channel(SceneState::default());
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

            let changed = match event_type {
                "SceneListChanged" => self.on_scene_list_changed(data),
                "CurrentProgramSceneChanged" => self.on_current_program_scene_changed(data),
                "CurrentPreviewSceneChanged" => self.on_current_preview_scene_changed(data),
                "StudioModeStateChanged" => self.on_studio_mode_state_changed(data),
                _ => false,
            };

            if changed {
                let snapshot = self.state.borrow().clone();
                self.bus
                    .publish(
                        topics::obs_session_event_type(&self.session_id, "scene_current_changed"),
                        serde_json::json!({ "sessionId": self.session_id, "scene": snapshot }),
                    )
                    .await;
            }
        }
    }

    fn on_scene_list_changed(&self, data: &serde_json::Value) -> bool {
        let Some(scenes) = data["scenes"].as_array() else { return false };
        let names: Vec<String> = scenes
            .iter()
            .filter_map(|s| s["sceneName"].as_str().map(str::to_owned))
            .collect();
        self.state.send_modify(|state| state.scenes = names);
        true
    }

    fn on_current_program_scene_changed(&self, data: &serde_json::Value) -> bool {
        let Some(name) = data["sceneName"].as_str() else { return false };
        self.state.send_modify(|state| state.current_program_scene = Some(name.to_owned()));
        true
    }

    fn on_current_preview_scene_changed(&self, data: &serde_json::Value) -> bool {
        let Some(name) = data["sceneName"].as_str() else { return false };
        self.state.send_modify(|state| state.current_preview_scene = Some(name.to_owned()));
        true
    }

    fn on_studio_mode_state_changed(&self, data: &serde_json::Value) -> bool {
        let Some(enabled) = data["studioModeEnabled"].as_bool() else { return false };
        debug!(session = %self.session_id, enabled, "studio mode state changed");
        self.state.send_modify(|state| state.studio_mode_enabled = enabled);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scene_list_changed_updates_snapshot() {
        let bus = Bus::default();
        let (_manager, mut rx) = SceneManager::start("s1".to_owned(), bus.clone());

        bus.publish(
            topics::obs_session_events("s1"),
            serde_json::json!({
                "sessionId": "s1",
                "eventType": "SceneListChanged",
                "eventData": { "scenes": [{"sceneName": "Main"}, {"sceneName": "BRB"}] },
            }),
        )
        .await;

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().scenes, vec!["Main".to_owned(), "BRB".to_owned()]);
    }

    #[tokio::test]
    async fn current_program_scene_changed_updates_snapshot() {
        let bus = Bus::default();
        let (_manager, mut rx) = SceneManager::start("s1".to_owned(), bus.clone());

        bus.publish(
            topics::obs_session_events("s1"),
            serde_json::json!({
                "sessionId": "s1",
                "eventType": "CurrentProgramSceneChanged",
                "eventData": { "sceneName": "Main" },
            }),
        )
        .await;

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().current_program_scene, Some("Main".to_owned()));
    }
}
