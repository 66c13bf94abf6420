//! Crate-wide error types.
//!
//! Each subsystem (`obs`, `twitch`, `correlation`) defines its own error enum and a `kind()`
//! accessor that buckets it into one of the five kinds a caller or dashboard cares about:
//! transient, protocol framing, protocol fatal, auth, or application. This lets long-running
//! connection state be queried without matching on every individual variant.

use std::fmt;

/// Coarse bucket every error falls into, independent of which subsystem produced it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Recoverable by backoff + retry at the component that owns the resource.
    Transient,
    /// Malformed frame or unexpected shape; the session continues.
    ProtocolFraming,
    /// Unrecoverable protocol state; the owner decides whether to restart.
    ProtocolFatal,
    /// Missing credentials, expired tokens, missing scopes.
    Auth,
    /// Caller-visible failure that does not affect connection health.
    Application,
}

/// Top-level error returned by the crate's public entry points.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Error from the OBS half of the system.
    #[error(transparent)]
    Obs(#[from] crate::obs::Error),
    /// Error from the Twitch half of the system.
    #[error(transparent)]
    Twitch(#[from] crate::twitch::Error),
    /// Error from the correlation engine.
    #[error(transparent)]
    Correlation(#[from] crate::correlation::Error),
    /// Configuration could not be loaded or was incomplete.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Bucket this error for dashboard-facing reporting.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Obs(e) => e.kind(),
            Self::Twitch(e) => e.kind(),
            Self::Correlation(_) => ErrorKind::Application,
            Self::Config(_) => ErrorKind::Application,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A human-readable, truncated view of a raw frame for log lines, so malformed-JSON errors don't
/// dump unbounded payloads into logs (§7 "logged with the raw frame truncated").
#[must_use]
pub fn truncate_for_log(raw: &str) -> impl fmt::Display + '_ {
    struct Truncated<'a>(&'a str);
    impl fmt::Display for Truncated<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            const LIMIT: usize = 256;
            if self.0.len() <= LIMIT {
                write!(f, "{}", self.0)
            } else {
                write!(f, "{}… ({} bytes total)", &self.0[..LIMIT], self.0.len())
            }
        }
    }
    Truncated(raw)
}
