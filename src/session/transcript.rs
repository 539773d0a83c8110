//! Per-speaker transcript accumulation
//!
//! Deltas are appended in arrival order. Turn ends do not clear anything;
//! instead each accumulator keeps at most `max_chars` characters, dropping
//! the oldest text first so a long conversation cannot grow without bound.
//!
//! A turn mark records where the current turn began, so a barge-in can drop
//! the partial response without touching completed turns.

use crate::streaming::Speaker;

/// Default character cap per speaker
pub const DEFAULT_MAX_CHARS: usize = 16 * 1024;

/// Aggregates transcript deltas for one speaker
#[derive(Debug, Clone)]
pub struct TranscriptAggregator {
    text: String,
    /// Characters currently held (`text.len()` counts bytes)
    chars: usize,
    /// 0 disables the cap
    max_chars: usize,
    /// Byte offset where the current turn starts
    turn_start: usize,
    delta_count: u64,
    dropped_chars: u64,
}

impl Default for TranscriptAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHARS)
    }
}

impl TranscriptAggregator {
    pub fn new(max_chars: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            max_chars,
            turn_start: 0,
            delta_count: 0,
            dropped_chars: 0,
        }
    }

    /// Append a delta and return the accumulated text
    pub fn process_delta(&mut self, delta: &str) -> &str {
        if delta.is_empty() {
            return &self.text;
        }

        self.text.push_str(delta);
        self.chars += delta.chars().count();
        self.delta_count += 1;
        self.enforce_cap();

        if self.delta_count % 10 == 0 {
            log::debug!(
                "TranscriptAggregator: {} deltas, {} chars accumulated, {} dropped by cap",
                self.delta_count,
                self.chars,
                self.dropped_chars
            );
        }
        &self.text
    }

    fn enforce_cap(&mut self) {
        if self.max_chars == 0 || self.chars <= self.max_chars {
            return;
        }

        let excess = self.chars - self.max_chars;
        // Byte offset of the first character that survives
        let cut = self
            .text
            .char_indices()
            .nth(excess)
            .map_or(self.text.len(), |(i, _)| i);
        self.text.drain(..cut);
        self.turn_start = self.turn_start.saturating_sub(cut);
        self.chars -= excess;
        self.dropped_chars += excess as u64;
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Close the current turn; later deltas belong to the next one
    pub fn mark_turn_end(&mut self) {
        self.turn_start = self.text.len();
    }

    /// Drop the turn in progress and return how many characters went
    pub fn discard_turn(&mut self) -> usize {
        let removed = self.text[self.turn_start..].chars().count();
        self.text.truncate(self.turn_start);
        self.chars -= removed;
        removed
    }

    pub fn reset(&mut self) {
        self.text.clear();
        self.chars = 0;
        self.turn_start = 0;
        self.delta_count = 0;
        self.dropped_chars = 0;
    }
}

/// The two accumulators of a conversation
#[derive(Debug, Clone, Default)]
pub struct Transcripts {
    pub user: TranscriptAggregator,
    pub model: TranscriptAggregator,
}

impl Transcripts {
    pub fn new(max_chars: usize) -> Self {
        Self {
            user: TranscriptAggregator::new(max_chars),
            model: TranscriptAggregator::new(max_chars),
        }
    }

    pub fn append(&mut self, speaker: Speaker, text: &str) {
        match speaker {
            Speaker::User => self.user.process_delta(text),
            Speaker::Model => self.model.process_delta(text),
        };
    }

    /// Drop the partial model response (barge-in); completed turns and the
    /// user side are kept
    pub fn discard_model(&mut self) {
        let removed = self.model.discard_turn();
        if removed > 0 {
            log::debug!("Discarding {} chars of partial model response", removed);
        }
    }

    /// The model finished its turn
    pub fn end_model_turn(&mut self) {
        self.model.mark_turn_end();
    }

    pub fn clear(&mut self) {
        self.user.reset();
        self.model.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deltas_append_in_order() {
        let mut agg = TranscriptAggregator::default();
        agg.process_delta("Where is ");
        agg.process_delta("");
        agg.process_delta("Hall B?");

        assert_eq!(agg.text(), "Where is Hall B?");
        assert_eq!(agg.delta_count, 2);
    }

    #[test]
    fn test_cap_drops_oldest_characters() {
        let mut agg = TranscriptAggregator::new(5);
        agg.process_delta("abc");
        agg.process_delta("defg");

        assert_eq!(agg.text(), "cdefg");
        assert_eq!(agg.chars, 5);
        assert_eq!(agg.dropped_chars, 2);
    }

    #[test]
    fn test_cap_respects_char_boundaries() {
        let mut agg = TranscriptAggregator::new(3);
        agg.process_delta("héllo wörld");

        assert_eq!(agg.text(), "rld");
        agg.process_delta("日本語");
        assert_eq!(agg.text(), "日本語");
        assert_eq!(agg.chars, 3);
    }

    #[test]
    fn test_zero_cap_is_unbounded() {
        let mut agg = TranscriptAggregator::new(0);
        let long = "x".repeat(100_000);
        agg.process_delta(&long);
        assert_eq!(agg.chars, 100_000);
    }

    #[test]
    fn test_discard_model_keeps_user() {
        let mut t = Transcripts::default();
        t.append(Speaker::User, "What time is the keynote?");
        t.append(Speaker::Model, "The keynote starts at");

        t.discard_model();

        assert_eq!(t.user.text(), "What time is the keynote?");
        assert_eq!(t.model.text(), "");
    }

    #[test]
    fn test_discard_model_keeps_completed_turns() {
        let mut t = Transcripts::default();
        t.append(Speaker::Model, "Lunch is at noon. ");
        t.end_model_turn();
        t.append(Speaker::Model, "The keynote is in");

        assert_eq!(&t.model.text[t.model.turn_start..], "The keynote is in");
        t.discard_model();

        assert_eq!(t.model.text(), "Lunch is at noon. ");
        assert_eq!(t.model.chars, 18);
        assert_eq!(&t.model.text[t.model.turn_start..], "");
    }

    #[test]
    fn test_turn_mark_follows_cap() {
        let mut agg = TranscriptAggregator::new(4);
        agg.process_delta("abcd");
        agg.mark_turn_end();
        agg.process_delta("éf");

        // "ab" dropped by the cap, the mark moves with the text
        assert_eq!(agg.text(), "cdéf");
        assert_eq!(&agg.text[agg.turn_start..], "éf");
        assert_eq!(agg.discard_turn(), 2);
        assert_eq!(agg.text(), "cd");
        assert_eq!(agg.chars, 2);
    }

    #[test]
    fn test_mark_dropped_by_cap_discards_whole_text() {
        let mut agg = TranscriptAggregator::new(3);
        agg.process_delta("ab");
        agg.mark_turn_end();
        agg.process_delta("cdef");

        assert_eq!(agg.text(), "def");
        assert_eq!(&agg.text[agg.turn_start..], "def");
        agg.discard_turn();
        assert_eq!(agg.text(), "");
        assert_eq!(agg.chars, 0);
    }

    #[test]
    fn test_reset_allows_reuse() {
        let mut agg = TranscriptAggregator::new(3);
        agg.process_delta("first");
        agg.reset();
        assert_eq!(agg.dropped_chars, 0);
        agg.process_delta("two");
        assert_eq!(agg.text(), "two");
        assert_eq!(agg.delta_count, 1);
    }
}
