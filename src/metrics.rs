//! Telemetry façade (§4.3 "Latency... is emitted via telemetry", §4.11 "Emit telemetry counters").
//!
//! A full metrics exporter is out of scope (§1). `Metrics` is the seam a real exporter would
//! implement; [`TracingMetrics`] is the default, recording everything as structured `tracing`
//! events so it shows up in logs without pulling in a metrics crate.

use std::fmt;

/// Telemetry sink used by the OBS and Twitch subsystems.
pub trait Metrics: Send + Sync + 'static {
    /// Record the round-trip latency of a resolved OBS request.
    fn obs_request_latency(&self, request_type: &str, latency_ms: u64);
    /// Increment the counter for a Twitch event of the given type for a broadcaster.
    fn twitch_event(&self, event_type: &str, broadcaster_user_id: &str);
    /// Record a temporal correlation delay estimate.
    fn correlation_delay_estimate(&self, delay_ms: u64, confidence: f64);
}

/// Default [`Metrics`] implementation: logs each observation as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl Metrics for TracingMetrics {
    fn obs_request_latency(&self, request_type: &str, latency_ms: u64) {
        tracing::debug!(request_type, latency_ms, "obs request latency");
    }

    fn twitch_event(&self, event_type: &str, broadcaster_user_id: &str) {
        tracing::debug!(event_type, broadcaster_user_id, "twitch event counter");
    }

    fn correlation_delay_estimate(&self, delay_ms: u64, confidence: f64) {
        tracing::debug!(delay_ms, confidence, "correlation delay estimate");
    }
}

impl fmt::Debug for dyn Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Metrics")
    }
}
