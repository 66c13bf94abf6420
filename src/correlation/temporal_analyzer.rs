//! Bucketed transcription/chat signals and cross-correlation delay estimation (§4.12
//! "TemporalAnalyzer").

use std::collections::BTreeMap;

use super::Error;

/// Tunables for [`TemporalAnalyzer`], defaulted per §4.12/§8.
#[derive(Clone, Copy, Debug)]
pub struct TemporalAnalyzerConfig {
    /// Width of each signal bucket, in milliseconds.
    pub bucket_size_ms: i64,
    /// How far back delay estimation looks, in milliseconds.
    pub analysis_window_ms: i64,
    /// Signal buckets older than `2 * analysis_window_ms` are dropped.
    pub retention_window_ms: i64,
    /// Smallest candidate delay considered, in milliseconds.
    pub delay_range_min_ms: i64,
    /// Largest candidate delay considered, in milliseconds.
    pub delay_range_max_ms: i64,
    /// Correlation peak below which an estimate is discarded in favor of confidence decay.
    pub min_signal_strength: f64,
    /// Minimum number of in-window buckets required per series to attempt estimation.
    pub min_buckets: usize,
}

impl Default for TemporalAnalyzerConfig {
    fn default() -> Self {
        let analysis_window_ms = 5 * 60 * 1_000;
        Self {
            bucket_size_ms: 2_000,
            analysis_window_ms,
            retention_window_ms: 2 * analysis_window_ms,
            delay_range_min_ms: 3_000,
            delay_range_max_ms: 20_000,
            min_signal_strength: 0.3,
            min_buckets: 10,
        }
    }
}

/// Current stream-delay estimate plus its confidence (§3 "Delay Estimate").
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DelayEstimate {
    /// Estimated broadcaster→viewer delay, clamped to `[delay_range_min_ms, delay_range_max_ms]`.
    pub delay_ms: i64,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Epoch milliseconds of the last estimation attempt, successful or not.
    pub last_estimation_at: i64,
}

/// Maintains the two bucketed signals and periodically re-estimates the stream delay by
/// cross-correlating them.
#[derive(Debug)]
pub struct TemporalAnalyzer {
    config: TemporalAnalyzerConfig,
    transcription_signal: BTreeMap<i64, u64>,
    chat_signal: BTreeMap<i64, u64>,
    estimate: DelayEstimate,
}

impl TemporalAnalyzer {
    /// Create an analyzer with the given config, seeded with a delay estimate at the minimum of
    /// the candidate range and zero confidence.
    #[must_use]
    pub fn new(config: TemporalAnalyzerConfig) -> Self {
        let estimate = DelayEstimate {
            delay_ms: config.delay_range_min_ms,
            confidence: 0.0,
            last_estimation_at: 0,
        };
        Self {
            config,
            transcription_signal: BTreeMap::new(),
            chat_signal: BTreeMap::new(),
            estimate,
        }
    }

    /// The current delay estimate.
    #[must_use]
    pub fn estimate(&self) -> DelayEstimate {
        self.estimate
    }

    fn bucket_of(&self, ts_ms: i64) -> i64 {
        ts_ms.div_euclid(self.config.bucket_size_ms) * self.config.bucket_size_ms
    }

    /// Add `word_count` words at `ts_ms` to the transcription signal.
    pub fn add_transcription_event(&mut self, ts_ms: i64, word_count: u64) {
        let bucket = self.bucket_of(ts_ms);
        *self.transcription_signal.entry(bucket).or_insert(0) += word_count;
    }

    /// Add one chat message at `ts_ms` to the chat signal.
    pub fn add_chat_event(&mut self, ts_ms: i64) {
        let bucket = self.bucket_of(ts_ms);
        *self.chat_signal.entry(bucket).or_insert(0) += 1;
    }

    /// Drop signal buckets older than `2 * analysis_window_ms` relative to `now_ms` (§4.12 "Every
    /// ~2 min, drop signal buckets older than 2 × analysis_window").
    pub fn retain_recent(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.config.retention_window_ms;
        self.transcription_signal.retain(|&bucket, _| bucket >= cutoff);
        self.chat_signal.retain(|&bucket, _| bucket >= cutoff);
    }

    /// Run one delay-estimation pass as of `now_ms` (§4.12 steps 1-4).
    ///
    /// On success the internal estimate is updated and returned. On insufficient data the prior
    /// delay is kept, confidence decays by `0.95`, and [`Error::InsufficientSignalData`] is
    /// returned so the caller can log/telemeter the degraded pass.
    pub fn estimate_delay(&mut self, now_ms: i64) -> Result<DelayEstimate, Error> {
        let cutoff = now_ms - self.config.analysis_window_ms;
        let trans_in_window = self.transcription_signal.range(cutoff..).count();
        let chat_in_window = self.chat_signal.range(cutoff..).count();

        if trans_in_window < self.config.min_buckets || chat_in_window < self.config.min_buckets {
            self.estimate.confidence = (self.estimate.confidence * 0.95).clamp(0.0, 1.0);
            self.estimate.last_estimation_at = now_ms;
            return Err(Error::InsufficientSignalData);
        }

        let (trans_series, chat_series, bucket_count) = self.aligned_series(cutoff);
        if bucket_count == 0 {
            self.estimate.confidence = (self.estimate.confidence * 0.95).clamp(0.0, 1.0);
            self.estimate.last_estimation_at = now_ms;
            return Err(Error::InsufficientSignalData);
        }

        let bucket_size = self.config.bucket_size_ms;
        let mut best_delay = self.estimate.delay_ms;
        let mut best_peak = f64::MIN;

        let mut delay = self.config.delay_range_min_ms;
        while delay <= self.config.delay_range_max_ms {
            let shift = (delay / bucket_size) as usize;
            let peak = correlate_with_shift(&trans_series, &chat_series, shift);
            if peak > best_peak {
                best_peak = peak;
                best_delay = delay;
            }
            delay += bucket_size;
        }

        self.estimate.last_estimation_at = now_ms;
        if best_peak >= self.config.min_signal_strength {
            self.estimate.delay_ms = best_delay.clamp(self.config.delay_range_min_ms, self.config.delay_range_max_ms);
            self.estimate.confidence = (0.7 * best_peak + 0.3 * self.estimate.confidence).clamp(0.0, 1.0);
        } else {
            self.estimate.confidence = (self.estimate.confidence * 0.95).clamp(0.0, 1.0);
        }
        Ok(self.estimate)
    }

    /// Build two equal-length series over the common bucket range of both signals (§4.12 step 2),
    /// filling missing buckets with zero. Returns the series and the bucket count.
    fn aligned_series(&self, cutoff: i64) -> (Vec<f64>, Vec<f64>, usize) {
        let bucket_size = self.config.bucket_size_ms;
        let trans_min = self.transcription_signal.range(cutoff..).next().map(|(&b, _)| b);
        let chat_min = self.chat_signal.range(cutoff..).next().map(|(&b, _)| b);
        let trans_max = self.transcription_signal.range(cutoff..).next_back().map(|(&b, _)| b);
        let chat_max = self.chat_signal.range(cutoff..).next_back().map(|(&b, _)| b);

        let (Some(min_a), Some(min_b), Some(max_a), Some(max_b)) = (trans_min, chat_min, trans_max, chat_max) else {
            return (Vec::new(), Vec::new(), 0);
        };
        let min_common = min_a.min(min_b);
        let max_common = max_a.max(max_b);
        if max_common < min_common {
            return (Vec::new(), Vec::new(), 0);
        }

        let count = ((max_common - min_common) / bucket_size + 1) as usize;
        let mut trans_series = Vec::with_capacity(count);
        let mut chat_series = Vec::with_capacity(count);
        let mut bucket = min_common;
        while bucket <= max_common {
            trans_series.push(*self.transcription_signal.get(&bucket).unwrap_or(&0) as f64);
            chat_series.push(*self.chat_signal.get(&bucket).unwrap_or(&0) as f64);
            bucket += bucket_size;
        }
        (trans_series, chat_series, count)
    }
}

/// Correlate `trans` against `chat` shifted left by `shift` buckets (simulating a chat response
/// that lags speech by `shift * bucket_size_ms`), over the overlapping portion only.
fn correlate_with_shift(trans: &[f64], chat: &[f64], shift: usize) -> f64 {
    if shift >= chat.len() || trans.is_empty() {
        return f64::MIN;
    }
    let shifted_chat = &chat[shift..];
    let overlap = trans.len().min(shifted_chat.len());
    if overlap == 0 {
        return f64::MIN;
    }
    pearson_correlation(&trans[..overlap], &shifted_chat[..overlap])
}

/// Pearson correlation coefficient of two equal-length series, computed in double precision.
/// Returns `0.0` for a constant series (zero-variance denominator) instead of `NaN` (§9
/// "Correlation numerics").
#[must_use]
pub fn pearson_correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let n_f = n as f64;
    let mean_a = a[..n].iter().sum::<f64>() / n_f;
    let mean_b = b[..n].iter().sum::<f64>() / n_f;

    let mut cov = 0.0_f64;
    let mut var_a = 0.0_f64;
    let mut var_b = 0.0_f64;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    let denom = (var_a * var_b).sqrt();
    if denom == 0.0 {
        0.0
    } else {
        cov / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pearson_of_identical_series_is_one() {
        let series = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((pearson_correlation(&series, &series) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn pearson_of_constant_series_is_zero_not_nan() {
        let a = [3.0, 3.0, 3.0];
        let b = [1.0, 2.0, 3.0];
        assert_eq!(pearson_correlation(&a, &b), 0.0);
    }

    #[test]
    fn pearson_of_inverse_series_is_negative_one() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [4.0, 3.0, 2.0, 1.0];
        assert!((pearson_correlation(&a, &b) + 1.0).abs() < 1e-9);
    }

    fn seed_shifted_signals(analyzer: &mut TemporalAnalyzer, shift_ms: i64) {
        for i in 0..20 {
            let ts = i * 2_000;
            let word_count = 2 + (i as u64 % 3);
            analyzer.add_transcription_event(ts, word_count);
            // Mirror the transcription shape into the chat signal, shifted, so the two series
            // actually correlate instead of just overlapping in time.
            for _ in 0..word_count {
                analyzer.add_chat_event(ts + shift_ms);
            }
        }
    }

    #[test]
    fn estimates_known_delay_from_shifted_signals() {
        let mut analyzer = TemporalAnalyzer::new(TemporalAnalyzerConfig::default());
        seed_shifted_signals(&mut analyzer, 8_000);
        let now_ms = 19 * 2_000 + 8_000 + 1_000;
        let estimate = analyzer.estimate_delay(now_ms).expect("enough buckets");
        assert_eq!(estimate.delay_ms, 8_000);
        assert!(estimate.confidence >= 0.7);
    }

    #[test]
    fn insufficient_buckets_decays_confidence_and_keeps_delay() {
        let mut analyzer = TemporalAnalyzer::new(TemporalAnalyzerConfig::default());
        analyzer.estimate.confidence = 0.5;
        analyzer.add_transcription_event(0, 3);
        analyzer.add_chat_event(0);
        let before = analyzer.estimate().delay_ms;
        let err = analyzer.estimate_delay(10_000).unwrap_err();
        assert!(matches!(err, Error::InsufficientSignalData));
        assert_eq!(analyzer.estimate().delay_ms, before);
        assert!((analyzer.estimate().confidence - 0.475).abs() < 1e-9);
    }

    #[test]
    fn delay_is_always_within_configured_range() {
        let mut analyzer = TemporalAnalyzer::new(TemporalAnalyzerConfig::default());
        seed_shifted_signals(&mut analyzer, 8_000);
        let now_ms = 19 * 2_000 + 8_000 + 1_000;
        let estimate = analyzer.estimate_delay(now_ms).unwrap();
        assert!(estimate.delay_ms >= analyzer.config.delay_range_min_ms);
        assert!(estimate.delay_ms <= analyzer.config.delay_range_max_ms);
        assert!((0.0..=1.0).contains(&estimate.confidence));
    }

    #[test]
    fn retain_recent_drops_old_buckets() {
        let mut analyzer = TemporalAnalyzer::new(TemporalAnalyzerConfig::default());
        analyzer.add_transcription_event(0, 1);
        analyzer.add_chat_event(0);
        analyzer.retain_recent(i64::MAX / 2);
        assert!(analyzer.transcription_signal.is_empty());
        assert!(analyzer.chat_signal.is_empty());
    }
}
