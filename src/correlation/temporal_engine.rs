//! Pairs transcriptions with chat messages using the current delay estimate and scores each
//! pairing's likelihood of being a genuine reaction (§4.12 "TemporalEngine").

use std::collections::HashSet;

use super::sliding_buffer::{ChatItem, SlidingBuffer, TranscriptionItem};

/// Width, in milliseconds, of the correlation window centered on `transcription_ts + delay_ms`.
const CORRELATION_WINDOW_HALF_MS: i64 = 2_000;

/// Minimum final confidence an emitted [`Correlation`] must clear.
const MIN_EMIT_CONFIDENCE: f64 = 0.4;

/// Stop words excluded from [`significant_words`] (§4.12).
const STOP_WORDS: &[&str] = &[
    "the", "and", "or", "but", "is", "are", "was", "were", "a", "an", "to", "for", "of", "in", "on", "at", "by",
];

/// Reaction tokens recognized by the `emote_reaction` base pattern, beyond literal emote names.
const REACTION_TOKENS: &[&str] = &["lol", "lmao", "lul", "pog", "pogchamp", "kekw", "haha", "omg"];

/// Question words recognized by the `question_response` base pattern.
const QUESTION_WORDS: &[&str] = &["what", "why", "how", "when"];

/// Which textual rule matched a chat/transcription pairing (§4.12, base pattern score, first
/// match wins).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PatternKind {
    /// Chat literally contains the transcription text (length > 5).
    DirectQuote,
    /// Chat shares significant words with the transcription above the overlap threshold.
    KeywordEcho,
    /// Chat contains an emote or a known reaction token.
    EmoteReaction,
    /// Chat contains a question mark and a question word.
    QuestionResponse,
    /// None of the above matched; scored on timing alone.
    TemporalOnly,
}

impl PatternKind {
    /// Base confidence contributed by this pattern, before the temporal multiplier.
    #[must_use]
    pub fn base_score(self) -> f64 {
        match self {
            Self::DirectQuote => 0.9,
            Self::KeywordEcho => 0.7,
            Self::EmoteReaction => 0.6,
            Self::QuestionResponse => 0.5,
            Self::TemporalOnly => 0.3,
        }
    }
}

/// How closely the chat message's timing matches the delay-adjusted expectation (§4.12, temporal
/// pattern multiplier).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TemporalPatternKind {
    /// Within 1s of the expected arrival.
    ImmediateReaction,
    /// Within 3s.
    QuickResponse,
    /// Within 8s.
    DelayedReaction,
    /// Within 15s.
    DiscussionSpawn,
    /// Beyond 15s; still emitted but downweighted identically to `DiscussionSpawn`.
    Outlier,
}

impl TemporalPatternKind {
    /// Classify a timing deviation (`(chat_ts - trans_ts) - delay_ms`) into a pattern and its
    /// multiplier.
    #[must_use]
    pub fn classify(timing_deviation_ms: i64) -> (Self, f64) {
        let magnitude = timing_deviation_ms.abs();
        if magnitude <= 1_000 {
            (Self::ImmediateReaction, 1.0)
        } else if magnitude <= 3_000 {
            (Self::QuickResponse, 0.9)
        } else if magnitude <= 8_000 {
            (Self::DelayedReaction, 0.7)
        } else if magnitude <= 15_000 {
            (Self::DiscussionSpawn, 0.5)
        } else {
            (Self::Outlier, 0.5)
        }
    }
}

/// One scored transcription/chat pairing.
#[derive(Clone, Debug)]
pub struct Correlation {
    /// Transcription timestamp, epoch ms.
    pub transcription_ts: i64,
    /// Chat message timestamp, epoch ms.
    pub chat_ts: i64,
    /// Chatter who sent the paired message.
    pub chat_user: String,
    /// Textual rule that matched.
    pub pattern: PatternKind,
    /// Timing classification relative to the delay-adjusted expectation.
    pub temporal_pattern: TemporalPatternKind,
    /// Final confidence: `base_score * temporal_multiplier * delay_confidence`.
    pub confidence: f64,
}

/// Lowercased, stop-word-filtered tokens of length > 2 (§4.12 "Significant words").
#[must_use]
pub fn significant_words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.len() > 2 && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

fn base_pattern(transcription_text: &str, chat_message: &str) -> PatternKind {
    let lower_chat = chat_message.to_lowercase();
    let lower_trans = transcription_text.to_lowercase();

    if transcription_text.len() > 5 && lower_chat.contains(&lower_trans) {
        return PatternKind::DirectQuote;
    }

    let trans_words = significant_words(transcription_text);
    let chat_words = significant_words(chat_message);
    if !chat_words.is_empty() {
        let overlap = trans_words.intersection(&chat_words).count();
        let overlap_ratio = overlap as f64 / chat_words.len() as f64;
        if overlap >= 2 && overlap_ratio >= 0.3 {
            return PatternKind::KeywordEcho;
        }
    }

    if REACTION_TOKENS.iter().any(|token| lower_chat.contains(token)) {
        return PatternKind::EmoteReaction;
    }

    if lower_chat.contains('?') && QUESTION_WORDS.iter().any(|word| lower_chat.contains(word)) {
        return PatternKind::QuestionResponse;
    }

    PatternKind::TemporalOnly
}

fn base_pattern_with_emotes(transcription_text: &str, chat: &ChatItem) -> PatternKind {
    if !chat.emotes.is_empty() {
        let pattern = base_pattern(transcription_text, &chat.message);
        if matches!(pattern, PatternKind::DirectQuote | PatternKind::KeywordEcho) {
            return pattern;
        }
        return PatternKind::EmoteReaction;
    }
    base_pattern(transcription_text, &chat.message)
}

/// Pairs each incoming transcription against buffered chat messages and scores the pairings.
#[derive(Debug, Default)]
pub struct TemporalEngine;

impl TemporalEngine {
    /// Score every chat message in `chat_buffer` that falls within the delay-adjusted correlation
    /// window of `transcription`, returning matches at or above the emit threshold sorted by
    /// descending confidence (§4.12).
    #[must_use]
    pub fn correlate(
        &self,
        transcription: &TranscriptionItem,
        chat_buffer: &SlidingBuffer<ChatItem>,
        delay_ms: i64,
        delay_confidence: f64,
    ) -> Vec<Correlation> {
        let window_center = transcription.timestamp_ms + delay_ms;
        let window_min = window_center - CORRELATION_WINDOW_HALF_MS;
        let window_max = window_center + CORRELATION_WINDOW_HALF_MS;

        let mut correlations: Vec<Correlation> = chat_buffer
            .get_range(window_min, window_max)
            .into_iter()
            .filter_map(|chat| {
                let pattern = base_pattern_with_emotes(&transcription.text, chat);
                let timing_deviation = (chat.timestamp_ms - transcription.timestamp_ms) - delay_ms;
                let (temporal_pattern, multiplier) = TemporalPatternKind::classify(timing_deviation);
                let confidence = pattern.base_score() * multiplier * delay_confidence;
                if confidence < MIN_EMIT_CONFIDENCE {
                    return None;
                }
                Some(Correlation {
                    transcription_ts: transcription.timestamp_ms,
                    chat_ts: chat.timestamp_ms,
                    chat_user: chat.user.clone(),
                    pattern,
                    temporal_pattern,
                    confidence,
                })
            })
            .collect();

        correlations.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
        correlations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(ts: i64, user: &str, message: &str) -> ChatItem {
        ChatItem {
            timestamp_ms: ts,
            user: user.to_owned(),
            message: message.to_owned(),
            emotes: Vec::new(),
        }
    }

    #[test]
    fn significant_words_drops_stop_words_and_short_tokens() {
        let words = significant_words("The Quick Fox is a Cat");
        assert!(words.contains("quick"));
        assert!(words.contains("fox"));
        assert!(words.contains("cat"));
        assert!(!words.contains("the"));
        assert!(!words.contains("is"));
        assert!(!words.contains("a"));
    }

    #[test]
    fn direct_quote_scores_highest() {
        let pattern = base_pattern("hello world", "omg hello world lol");
        assert_eq!(pattern, PatternKind::DirectQuote);
    }

    #[test]
    fn keyword_echo_requires_overlap_ratio() {
        // "hello" and "world" overlap (2 words), over 2 chat words => ratio 1.0.
        let pattern = base_pattern("hello world how are you", "hello world");
        assert_eq!(pattern, PatternKind::KeywordEcho);
    }

    #[test]
    fn emote_reaction_matches_known_tokens() {
        assert_eq!(base_pattern("something happened", "pog"), PatternKind::EmoteReaction);
    }

    #[test]
    fn question_response_requires_mark_and_word() {
        assert_eq!(base_pattern("we shipped the update", "wait how?"), PatternKind::QuestionResponse);
    }

    #[test]
    fn falls_back_to_temporal_only() {
        assert_eq!(base_pattern("we shipped the update", "neat"), PatternKind::TemporalOnly);
    }

    #[test]
    fn temporal_pattern_classifies_by_magnitude() {
        assert_eq!(TemporalPatternKind::classify(500).0, TemporalPatternKind::ImmediateReaction);
        assert_eq!(TemporalPatternKind::classify(2_500).0, TemporalPatternKind::QuickResponse);
        assert_eq!(TemporalPatternKind::classify(6_000).0, TemporalPatternKind::DelayedReaction);
        assert_eq!(TemporalPatternKind::classify(12_000).0, TemporalPatternKind::DiscussionSpawn);
        assert_eq!(TemporalPatternKind::classify(30_000).0, TemporalPatternKind::Outlier);
    }

    #[test]
    fn seed_scenario_6_keyword_echo_immediate_reaction() {
        let transcription = TranscriptionItem {
            timestamp_ms: 10_000,
            text: "hello world how are you".to_owned(),
            word_count: 5,
        };
        let mut buffer: SlidingBuffer<ChatItem> = SlidingBuffer::new(60_000, 300);
        buffer.add(chat(18_500, "viewer1", "hello world"));

        let engine = TemporalEngine;
        let correlations = engine.correlate(&transcription, &buffer, 8_000, 0.9);

        assert_eq!(correlations.len(), 1);
        let correlation = &correlations[0];
        assert_eq!(correlation.pattern, PatternKind::KeywordEcho);
        assert_eq!(correlation.temporal_pattern, TemporalPatternKind::ImmediateReaction);
        assert!((correlation.confidence - 0.63).abs() < 1e-9);
    }

    #[test]
    fn below_threshold_correlations_are_not_emitted() {
        let transcription = TranscriptionItem {
            timestamp_ms: 0,
            text: "nothing in particular".to_owned(),
            word_count: 3,
        };
        let mut buffer: SlidingBuffer<ChatItem> = SlidingBuffer::new(60_000, 300);
        buffer.add(chat(20_000, "viewer1", "neat"));

        let engine = TemporalEngine;
        let correlations = engine.correlate(&transcription, &buffer, 8_000, 0.9);
        assert!(correlations.is_empty());
    }

    #[test]
    fn results_sorted_by_descending_confidence() {
        let transcription = TranscriptionItem {
            timestamp_ms: 0,
            text: "hello world how are you".to_owned(),
            word_count: 5,
        };
        let mut buffer: SlidingBuffer<ChatItem> = SlidingBuffer::new(60_000, 300);
        buffer.add(chat(8_300, "viewer1", "hello world"));
        buffer.add(chat(8_900, "viewer2", "pog"));

        let engine = TemporalEngine;
        let correlations = engine.correlate(&transcription, &buffer, 8_000, 1.0);
        assert!(correlations.len() >= 2);
        assert!(correlations.windows(2).all(|w| w[0].confidence >= w[1].confidence));
    }
}
