//! Bounded, time-windowed, newest-first buffer shared by the transcription and chat domains
//! (§3 "Sliding Buffer Item", §4.12 "SlidingBuffer").

use std::collections::VecDeque;

/// Anything that can be stored in a [`SlidingBuffer`] carries a millisecond timestamp.
pub trait Timestamped {
    /// Epoch milliseconds this item was produced at.
    fn timestamp_ms(&self) -> i64;
}

/// A transcription item: recognized speech text plus its word count, per §3.
#[derive(Clone, Debug, PartialEq)]
pub struct TranscriptionItem {
    /// Epoch milliseconds the transcription was produced at.
    pub timestamp_ms: i64,
    /// Recognized text.
    pub text: String,
    /// Word count of `text`, cached at insertion time.
    pub word_count: usize,
}

impl Timestamped for TranscriptionItem {
    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

/// A chat message item, per §3.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatItem {
    /// Epoch milliseconds the message was received at.
    pub timestamp_ms: i64,
    /// Chatter's display name or login.
    pub user: String,
    /// Message body.
    pub message: String,
    /// Emote names present in the message, if any.
    pub emotes: Vec<String>,
}

impl Timestamped for ChatItem {
    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

/// A bounded, time-windowed, newest-first buffer.
///
/// Items are kept ordered newest-first because they arrive roughly in chronological order, which
/// lets pruning stop at the first item still inside the window instead of scanning the whole
/// deque (§3 "pruning may stop at the first in-window item"). "Now" for age-pruning purposes is
/// the timestamp of the most recently inserted item rather than the wall clock, so the buffer
/// stays a pure data structure that unit tests can drive with arbitrary logical timestamps.
#[derive(Debug)]
pub struct SlidingBuffer<T> {
    items: VecDeque<T>,
    window_ms: i64,
    max_size: usize,
}

impl<T: Timestamped> SlidingBuffer<T> {
    /// Create a buffer bounded by age (`window_ms`) and cardinality (`max_size`).
    #[must_use]
    pub fn new(window_ms: i64, max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            window_ms,
            max_size,
        }
    }

    /// Insert one item, then prune by age and by cardinality (§8 "Buffer bounds").
    pub fn add(&mut self, item: T) {
        let reference = item.timestamp_ms();
        self.items.push_front(item);
        self.prune_against(reference);
    }

    /// Re-apply the age and cardinality bounds using the newest stored item as the time
    /// reference. A no-op on an empty buffer.
    pub fn prune(&mut self) {
        if let Some(reference) = self.items.front().map(Timestamped::timestamp_ms) {
            self.prune_against(reference);
        }
    }

    fn prune_against(&mut self, reference: i64) {
        while let Some(oldest) = self.items.back() {
            if reference - oldest.timestamp_ms() > self.window_ms {
                self.items.pop_back();
            } else {
                break;
            }
        }
        while self.items.len() > self.max_size {
            self.items.pop_back();
        }
    }

    /// Number of items currently stored.
    #[must_use]
    pub fn size(&self) -> usize {
        self.items.len()
    }

    /// All items, optionally bounded to `max_age_ms` relative to the newest item, oldest-first.
    #[must_use]
    pub fn to_list(&self, max_age_ms: Option<i64>) -> Vec<&T> {
        let Some(max_age_ms) = max_age_ms else {
            return self.items.iter().rev().collect();
        };
        let Some(reference) = self.items.front().map(Timestamped::timestamp_ms) else {
            return Vec::new();
        };
        self.items
            .iter()
            .rev()
            .filter(|item| reference - item.timestamp_ms() <= max_age_ms)
            .collect()
    }

    /// Items whose timestamp falls in `[min_t, max_t]`, returned oldest-first.
    #[must_use]
    pub fn get_range(&self, min_t: i64, max_t: i64) -> Vec<&T> {
        self.items
            .iter()
            .rev()
            .filter(|item| {
                let ts = item.timestamp_ms();
                ts >= min_t && ts <= max_t
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(ts: i64, message: &str) -> ChatItem {
        ChatItem {
            timestamp_ms: ts,
            user: "u".to_owned(),
            message: message.to_owned(),
            emotes: Vec::new(),
        }
    }

    #[test]
    fn prunes_items_older_than_window() {
        let mut buf = SlidingBuffer::new(1_000, 100);
        buf.add(chat(0, "a"));
        buf.add(chat(500, "b"));
        buf.add(chat(1_600, "c")); // ages item at t=0 out (1600 - 0 > 1000)
        assert_eq!(buf.size(), 2);
        assert!(buf.to_list(None).iter().all(|i| i.message != "a"));
    }

    #[test]
    fn prunes_by_cardinality() {
        let mut buf = SlidingBuffer::new(1_000_000, 2);
        buf.add(chat(0, "a"));
        buf.add(chat(1, "b"));
        buf.add(chat(2, "c"));
        assert_eq!(buf.size(), 2);
        let list = buf.to_list(None);
        assert_eq!(list.iter().map(|i| i.message.as_str()).collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn to_list_returns_oldest_first() {
        let mut buf = SlidingBuffer::new(10_000, 10);
        buf.add(chat(0, "a"));
        buf.add(chat(100, "b"));
        buf.add(chat(200, "c"));
        let list = buf.to_list(None);
        assert_eq!(list.iter().map(|i| i.message.as_str()).collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[test]
    fn get_range_filters_by_timestamp_inclusive() {
        let mut buf = SlidingBuffer::new(10_000, 10);
        buf.add(chat(0, "a"));
        buf.add(chat(500, "b"));
        buf.add(chat(1_000, "c"));
        let range = buf.get_range(400, 1_000);
        assert_eq!(range.iter().map(|i| i.message.as_str()).collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn empty_buffer_operations_do_not_panic() {
        let buf: SlidingBuffer<ChatItem> = SlidingBuffer::new(1_000, 10);
        assert_eq!(buf.size(), 0);
        assert!(buf.to_list(None).is_empty());
        assert!(buf.get_range(0, 100).is_empty());
    }
}
