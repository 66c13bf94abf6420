//! Temporal correlation engine: speech/chat sliding buffers, delay estimation, and pattern
//! scoring (§4.12).
//!
//! [`sliding_buffer::SlidingBuffer`] is the bounded, time-windowed store shared by both domains;
//! [`temporal_analyzer::TemporalAnalyzer`] turns the raw event stream into two bucketed signals
//! and periodically estimates the broadcaster→viewer stream delay by cross-correlation;
//! [`temporal_engine::TemporalEngine`] uses that estimate to pair transcriptions with chat
//! messages and score how likely each pairing is a genuine reaction.

pub mod service;
pub mod sliding_buffer;
pub mod temporal_analyzer;
pub mod temporal_engine;

/// Errors surfaced by the correlation subsystem.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A delay estimation pass ran with too few signal buckets to be meaningful (§8 "Correlation
    /// with `|series| < 10`"). Not fatal: the prior delay estimate is kept and confidence decays.
    #[error("insufficient signal data for delay estimation")]
    InsufficientSignalData,
}

impl Error {
    /// Bucket this error for dashboard-facing reporting (§7).
    #[must_use]
    pub fn kind(&self) -> crate::error::ErrorKind {
        match self {
            Self::InsufficientSignalData => crate::error::ErrorKind::Application,
        }
    }
}
