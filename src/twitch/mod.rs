//! Twitch EventSub integration (§4.6-§4.11).

pub mod connection_manager;
pub mod event_handler;
pub mod eventsub_manager;
pub mod message_router;
pub mod protocol;
pub mod session_manager;
pub mod token_manager;
pub mod token_store;

/// Aggregate error type for the Twitch half of the system.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Error from the OAuth token manager.
    #[error(transparent)]
    Token(#[from] token_manager::Error),
    /// Error from EventSub subscription management.
    #[error(transparent)]
    EventSub(#[from] eventsub_manager::Error),
}

impl Error {
    /// Bucket this error for dashboard-facing reporting (§7).
    #[must_use]
    pub fn kind(&self) -> crate::error::ErrorKind {
        match self {
            Self::Token(e) => e.kind(),
            Self::EventSub(e) => match e {
                eventsub_manager::Error::MissingScopes { .. } => crate::error::ErrorKind::Auth,
                eventsub_manager::Error::DuplicateSubscription(_) | eventsub_manager::Error::CostExceeded { .. } => {
                    crate::error::ErrorKind::Application
                }
                eventsub_manager::Error::Http(_) | eventsub_manager::Error::Request(_) => crate::error::ErrorKind::Transient,
            },
        }
    }
}
