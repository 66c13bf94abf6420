//! Wires the correlation core into the bus: buffers chat from `chat`, accepts transcriptions
//! from an external speech-to-text collaborator (out of scope, §1), and periodically
//! re-estimates the stream delay.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::correlation::sliding_buffer::{ChatItem, SlidingBuffer, TranscriptionItem};
use crate::correlation::temporal_analyzer::{TemporalAnalyzer, TemporalAnalyzerConfig};
use crate::correlation::temporal_engine::TemporalEngine;
use crate::metrics::Metrics;
use crate::pubsub::{topics, Bus, BusEvent};

const ESTIMATION_INTERVAL: Duration = Duration::from_secs(60);
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(2 * 60);
const TRANSCRIPTION_BUFFER_WINDOW_MS: i64 = 30_000;
const TRANSCRIPTION_BUFFER_MAX_SIZE: usize = 100;
const CHAT_BUFFER_WINDOW_MS: i64 = 30_000;
const CHAT_BUFFER_MAX_SIZE: usize = 300;

struct Shared {
    analyzer: TemporalAnalyzer,
    transcriptions: SlidingBuffer<TranscriptionItem>,
    chat: SlidingBuffer<ChatItem>,
}

/// Runs the temporal correlation engine as a long-lived task: buffers chat off the bus, accepts
/// transcription events via [`Self::ingest_transcription`], and publishes scored pairings on
/// `correlation:temporal`.
pub struct CorrelationService {
    bus: Bus,
    metrics: Arc<dyn Metrics>,
    engine: TemporalEngine,
    shared: Mutex<Shared>,
    transcriptions_in: mpsc::Sender<TranscriptionItem>,
}

impl CorrelationService {
    /// Start the service: a chat-ingestion loop, a transcription-ingestion loop, and a periodic
    /// delay-estimation/retention loop, all sharing one `Mutex`-guarded buffer set (registration
    /// and estimation are rare relative to per-message work, so a single lock is adequate here
    /// even though the rest of the crate avoids locking business state).
    #[must_use]
    pub fn start(bus: Bus, metrics: Arc<dyn Metrics>) -> Arc<Self> {
        let (transcriptions_in, transcriptions_out) = mpsc::channel(256);
        let service = Arc::new(Self {
            bus,
            metrics,
            engine: TemporalEngine,
            shared: Mutex::new(Shared {
                analyzer: TemporalAnalyzer::new(TemporalAnalyzerConfig::default()),
                transcriptions: SlidingBuffer::new(TRANSCRIPTION_BUFFER_WINDOW_MS, TRANSCRIPTION_BUFFER_MAX_SIZE),
                chat: SlidingBuffer::new(CHAT_BUFFER_WINDOW_MS, CHAT_BUFFER_MAX_SIZE),
            }),
            transcriptions_in,
        });

        let chat_worker = service.clone();
        tokio::spawn(async move { chat_worker.run_chat_ingest().await });

        let transcription_worker = service.clone();
        tokio::spawn(async move { transcription_worker.run_transcription_ingest(transcriptions_out).await });

        let estimation_worker = service.clone();
        tokio::spawn(async move { estimation_worker.run_estimation_loop().await });

        service
    }

    /// Feed one recognized transcription into the engine. The caller (an external speech-to-text
    /// collaborator, out of scope per §1) supplies the wall-clock timestamp the words were
    /// spoken at.
    pub async fn ingest_transcription(&self, timestamp_ms: i64, text: String) {
        let word_count = text.split_whitespace().count();
        let item = TranscriptionItem { timestamp_ms, text, word_count: word_count.max(1) };
        if self.transcriptions_in.send(item).await.is_err() {
            warn!("correlation service transcription channel closed");
        }
    }

    async fn run_chat_ingest(self: Arc<Self>) {
        let mut events = self.bus.subscribe(topics::CHAT).await;
        while let Some(BusEvent { payload, .. }) = events.recv().await {
            let Some(timestamp_ms) = chat_timestamp_ms(&payload) else { continue };
            let user = payload["chatter_user_name"]
                .as_str()
                .or_else(|| payload["chatter_user_login"].as_str())
                .unwrap_or("unknown")
                .to_owned();
            let message = payload["message"]["text"].as_str().unwrap_or_default().to_owned();
            let emotes = payload["message"]["fragments"]
                .as_array()
                .map(|fragments| {
                    fragments
                        .iter()
                        .filter(|f| f["type"] == "emote")
                        .filter_map(|f| f["text"].as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default();

            let item = ChatItem { timestamp_ms, user, message, emotes };
            let mut shared = self.shared.lock().await;
            shared.analyzer.add_chat_event(timestamp_ms);
            shared.chat.add(item);
        }
    }

    async fn run_transcription_ingest(self: Arc<Self>, mut transcriptions: mpsc::Receiver<TranscriptionItem>) {
        while let Some(item) = transcriptions.recv().await {
            let (delay_ms, delay_confidence, correlations) = {
                let mut shared = self.shared.lock().await;
                shared.analyzer.add_transcription_event(item.timestamp_ms, item.word_count as u64);
                let estimate = shared.analyzer.estimate();
                let correlations = self.engine.correlate(&item, &shared.chat, estimate.delay_ms, estimate.confidence);
                shared.transcriptions.add(item.clone());
                (estimate.delay_ms, estimate.confidence, correlations)
            };

            for correlation in correlations {
                debug!(
                    chat_user = %correlation.chat_user,
                    pattern = ?correlation.pattern,
                    temporal_pattern = ?correlation.temporal_pattern,
                    confidence = correlation.confidence,
                    delay_ms,
                    delay_confidence,
                    "temporal correlation"
                );
                self.bus
                    .publish(
                        topics::CORRELATION_TEMPORAL,
                        serde_json::json!({
                            "transcription_ts": correlation.transcription_ts,
                            "chat_ts": correlation.chat_ts,
                            "chat_user": correlation.chat_user,
                            "pattern": format!("{:?}", correlation.pattern),
                            "temporal_pattern": format!("{:?}", correlation.temporal_pattern),
                            "confidence": correlation.confidence,
                        }),
                    )
                    .await;
            }
        }
    }

    async fn run_estimation_loop(self: Arc<Self>) {
        let mut estimate_ticker = tokio::time::interval(ESTIMATION_INTERVAL);
        let mut retention_ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = estimate_ticker.tick() => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    let mut shared = self.shared.lock().await;
                    match shared.analyzer.estimate_delay(now_ms) {
                        Ok(estimate) => self.metrics.correlation_delay_estimate(estimate.delay_ms as u64, estimate.confidence),
                        Err(e) => debug!(error = %e, "delay estimation skipped"),
                    }
                }
                _ = retention_ticker.tick() => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    let mut shared = self.shared.lock().await;
                    shared.analyzer.retain_recent(now_ms);
                }
            }
        }
    }
}

fn chat_timestamp_ms(payload: &serde_json::Value) -> Option<i64> {
    payload["timestamp"].as_str().and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok()).map(|dt| dt.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::TracingMetrics;
    use serde_json::json;

    #[tokio::test]
    async fn chat_from_bus_is_buffered() {
        let bus = Bus::default();
        let service = CorrelationService::start(bus.clone(), Arc::new(TracingMetrics));

        let base = 1_700_000_000_000_i64;
        bus.publish(
            topics::CHAT,
            json!({
                "timestamp": chrono::DateTime::from_timestamp_millis(base).unwrap().to_rfc3339(),
                "chatter_user_name": "viewer1",
                "message": { "text": "hello world", "fragments": [] },
            }),
        )
        .await;

        // Give the chat-ingest task a chance to drain the publish.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let shared = service.shared.lock().await;
        assert_eq!(shared.chat.size(), 1);
    }

    #[tokio::test]
    async fn transcription_with_no_delay_confidence_yet_publishes_nothing() {
        let bus = Bus::default();
        let service = CorrelationService::start(bus.clone(), Arc::new(TracingMetrics));
        let mut correlations = bus.subscribe(topics::CORRELATION_TEMPORAL).await;

        // No estimation pass has run, so delay_confidence is still 0.0 and no pairing can clear
        // the emit threshold even with a chat message sitting in the window.
        service.ingest_transcription(1_700_000_000_000, "hello world how are you".to_owned()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(correlations.try_recv().is_err());
    }
}
