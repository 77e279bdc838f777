//! End-of-turn detection
//!
//! Decides when the user has finished speaking. VAD alone ends a turn on any
//! pause; here the transcript so far is scored for how complete it sounds, and
//! the silence required before replying scales between the minimum and
//! maximum endpointing delay.

use std::time::Duration;

use crate::config::TurnSettings;

/// Words that rarely end a finished sentence
const CONTINUATION_WORDS: &[&str] = &[
    "and", "but", "or", "so", "because", "then", "like", "um", "uh", "the", "a", "an", "to",
    "of", "with", "if", "that", "which",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnDetector {
    min_delay: Duration,
    max_delay: Duration,
}

impl From<TurnSettings> for TurnDetector {
    fn from(settings: TurnSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.min_endpointing_delay_ms),
            Duration::from_millis(settings.max_endpointing_delay_ms),
        )
    }
}

impl Default for TurnDetector {
    fn default() -> Self {
        Self::from(TurnSettings::default())
    }
}

impl TurnDetector {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
        }
    }

    /// Probability in `[0, 1]` that `text` is a complete user turn
    pub fn end_of_turn_probability(&self, text: &str) -> f32 {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return 0.0;
        }

        if trimmed.ends_with(['.', '!', '?']) {
            return 0.9;
        }
        if trimmed.ends_with(',') {
            return 0.2;
        }

        let last_word = trimmed
            .rsplit(char::is_whitespace)
            .next()
            .unwrap_or_default()
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if CONTINUATION_WORDS.contains(&last_word.as_str()) {
            return 0.1;
        }

        0.6
    }

    /// Silence to wait for before treating `text` as finished
    pub fn required_silence(&self, text: &str) -> Duration {
        let p = self.end_of_turn_probability(text);
        let span = self.max_delay - self.min_delay;
        self.min_delay + span.mul_f32(1.0 - p)
    }

    pub fn is_turn_complete(&self, text: &str, trailing_silence: Duration) -> bool {
        !text.trim().is_empty() && trailing_silence >= self.required_silence(text)
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probability_by_ending() {
        let detector = TurnDetector::default();
        assert_eq!(detector.end_of_turn_probability("   "), 0.0);
        assert_eq!(detector.end_of_turn_probability("What time is it?"), 0.9);
        assert_eq!(detector.end_of_turn_probability("I was thinking, "), 0.2);
        assert_eq!(detector.end_of_turn_probability("I want coffee and"), 0.1);
        assert_eq!(detector.end_of_turn_probability("I want coffee"), 0.6);
    }

    #[test]
    fn test_required_silence_scales() {
        let detector = TurnDetector::new(Duration::from_millis(500), Duration::from_millis(1500));
        let done = detector.required_silence("Thanks.");
        let trailing = detector.required_silence("so um");
        assert!(done < trailing);
        assert!(done.abs_diff(Duration::from_millis(600)) < Duration::from_millis(1));
        assert!(trailing <= detector.max_delay());
    }

    #[test]
    fn test_turn_complete() {
        let detector = TurnDetector::default();
        assert!(detector.is_turn_complete("Hello there.", Duration::from_secs(2)));
        assert!(!detector.is_turn_complete("Hello there and", Duration::from_secs(2)));
        assert!(!detector.is_turn_complete("", Duration::from_secs(10)));
    }

    #[test]
    fn test_max_never_below_min() {
        let detector = TurnDetector::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(detector.required_silence("and"), Duration::from_secs(2));
    }
}
