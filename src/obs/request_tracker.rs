//! Pending-request table for OBS `Request`/`RequestResponse` correlation (§4.3).
//!
//! Grounded on `dnaka91-obws::client::connection::ReceiverList`'s oneshot-per-request design,
//! generalized with an explicit per-request deadline and a `Metrics` latency hook. Every tracked
//! request resolves exactly once: success, protocol error, or timeout — never more than one of the
//! three (§8 "Request completion").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::debug;

use crate::metrics::Metrics;
use crate::obs::protocol::{RequestStatus, RequestResponse};

/// Default per-request deadline (§3 "Default timeout 30 s").
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome delivered to a request's waiter.
#[derive(Debug)]
pub enum RequestOutcome {
    /// `requestStatus.result == true`; carries `responseData`.
    Success(serde_json::Value),
    /// `requestStatus.result == false`; carries the status for the caller to inspect.
    Failed(RequestStatus),
    /// No response arrived before the deadline.
    Timeout,
    /// The owning connection tore down before a response arrived.
    Cancelled,
}

struct Entry {
    waiter: oneshot::Sender<RequestOutcome>,
    request_type: String,
    sent_at: Instant,
}

/// Tracks in-flight OBS requests keyed by `request_id`.
pub struct RequestTracker {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Entry>>,
    metrics: Arc<dyn Metrics>,
}

impl RequestTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new(metrics: Arc<dyn Metrics>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Register a new request, returning its id and a receiver that resolves exactly once. The
    /// caller is responsible for actually sending the frame and for scheduling the timeout (see
    /// [`spawn_request_timeout`]); registering first avoids a race where a response arrives
    /// before the waiter is in the table.
    pub async fn track(&self, request_type: &str, _timeout: Duration) -> (u64, oneshot::Receiver<RequestOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.entries.lock().await.insert(
            id,
            Entry {
                waiter: tx,
                request_type: request_type.to_owned(),
                sent_at: Instant::now(),
            },
        );

        (id, rx)
    }

    /// Resolve a request by id, removing it from the table. Returns `true` if a waiter was found
    /// (the caller logs a warning if not — an unmatched response is a protocol framing issue, not
    /// a crash).
    pub async fn complete(&self, response: RequestResponse) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(id) = response.request_id.parse::<u64>().ok() else {
            return false;
        };
        let Some(entry) = entries.remove(&id) else {
            return false;
        };
        drop(entries);

        let latency_ms = entry.sent_at.elapsed().as_millis() as u64;
        self.metrics.obs_request_latency(&entry.request_type, latency_ms);
        debug!(request_type = %entry.request_type, latency_ms, "obs request resolved");

        let outcome = if response.request_status.result {
            RequestOutcome::Success(response.response_data)
        } else {
            RequestOutcome::Failed(response.request_status)
        };
        let _ = entry.waiter.send(outcome);
        true
    }

    /// Force-resolve a request as timed out. No-op if it already resolved.
    pub async fn timeout(&self, id: u64) {
        if let Some(entry) = self.entries.lock().await.remove(&id) {
            let _ = entry.waiter.send(RequestOutcome::Timeout);
        }
    }

    /// Cancel every in-flight request (FSM teardown), resolving each waiter with `Cancelled`.
    pub async fn cancel_all(&self) {
        let mut entries = self.entries.lock().await;
        for (_, entry) in entries.drain() {
            let _ = entry.waiter.send(RequestOutcome::Cancelled);
        }
    }

    /// Number of requests currently in flight. Exposed for tests and diagnostics.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Spawn the cancellable one-shot timer for a tracked request. Kept as a free function (rather
/// than a method needing `Arc<Self>` internally) so callers control the `Arc` lifetime.
pub fn spawn_request_timeout(tracker: Arc<RequestTracker>, id: u64, timeout: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        tracker.timeout(id).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::TracingMetrics;

    fn tracker() -> Arc<RequestTracker> {
        Arc::new(RequestTracker::new(Arc::new(TracingMetrics)))
    }

    #[tokio::test]
    async fn success_resolves_waiter_with_response_data() {
        let tracker = tracker();
        let (id, rx) = tracker.track("GetVersion", DEFAULT_TIMEOUT).await;

        tracker
            .complete(RequestResponse {
                request_id: id.to_string(),
                request_type: "GetVersion".to_owned(),
                request_status: RequestStatus {
                    result: true,
                    code: 100,
                    comment: None,
                },
                response_data: serde_json::json!({"obsVersion": "30.0.0"}),
            })
            .await;

        match rx.await.unwrap() {
            RequestOutcome::Success(data) => assert_eq!(data["obsVersion"], "30.0.0"),
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_status_resolves_waiter_with_failed() {
        let tracker = tracker();
        let (id, rx) = tracker.track("SetCurrentProgramScene", DEFAULT_TIMEOUT).await;

        tracker
            .complete(RequestResponse {
                request_id: id.to_string(),
                request_type: "SetCurrentProgramScene".to_owned(),
                request_status: RequestStatus {
                    result: false,
                    code: 600,
                    comment: Some("scene not found".to_owned()),
                },
                response_data: serde_json::Value::Null,
            })
            .await;

        assert!(matches!(rx.await.unwrap(), RequestOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn timeout_resolves_waiter_exactly_once() {
        let tracker = tracker();
        let (id, rx) = tracker.track("GetStats", Duration::from_millis(1)).await;
        tracker.timeout(id).await;
        assert!(matches!(rx.await.unwrap(), RequestOutcome::Timeout));
        // Completing afterwards must be a no-op (entry already removed).
        assert!(
            !tracker
                .complete(RequestResponse {
                    request_id: id.to_string(),
                    request_type: "GetStats".to_owned(),
                    request_status: RequestStatus { result: true, code: 100, comment: None },
                    response_data: serde_json::Value::Null,
                })
                .await
        );
    }

    #[tokio::test]
    async fn cancel_all_resolves_every_waiter() {
        let tracker = tracker();
        let (_, rx1) = tracker.track("A", DEFAULT_TIMEOUT).await;
        let (_, rx2) = tracker.track("B", DEFAULT_TIMEOUT).await;
        tracker.cancel_all().await;
        assert!(matches!(rx1.await.unwrap(), RequestOutcome::Cancelled));
        assert!(matches!(rx2.await.unwrap(), RequestOutcome::Cancelled));
        assert_eq!(tracker.len().await, 0);
    }
}
