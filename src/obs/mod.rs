//! OBS WebSocket v5 integration (§4.2, §4.4, §4.9-§4.11).
//!
//! [`connection::Connection`] drives the per-session protocol FSM; [`scene::SceneManager`],
//! [`stream_state::StreamManager`], and [`stats::StatsCollector`] are bus subscribers that
//! derive higher-level domain state from the raw event stream; [`session_manager::SessionManager`]
//! owns one full set of these as a supervised unit, and [`sessions_supervisor::SessionsSupervisor`]
//! owns the keyed set of all configured OBS sessions.

pub mod auth;
pub mod connection;
pub mod protocol;
pub mod request_tracker;
pub mod scene;
pub mod session_manager;
pub mod sessions_supervisor;
pub mod stats;
pub mod stream_state;

/// Errors surfaced by the OBS subsystem as a whole.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection FSM failed (see [`connection::Error`]).
    #[error(transparent)]
    Connection(#[from] connection::Error),
}

impl Error {
    /// Bucket this error for dashboard-facing reporting (§7).
    #[must_use]
    pub fn kind(&self) -> crate::error::ErrorKind {
        match self {
            Self::Connection(e) => e.kind(),
        }
    }
}
