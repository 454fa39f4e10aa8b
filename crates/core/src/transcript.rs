//! Transcript types for streaming speech recognition

use serde::{Deserialize, Serialize};

/// One recognition event from an ASR session.
///
/// A session emits a monotonically increasing `sequence` per utterance;
/// `is_final = true` terminates the utterance and no later event may reuse
/// its sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    /// Recognized text so far (partial) or the settled utterance (final)
    pub text: String,

    /// Whether this event ends the utterance
    pub is_final: bool,

    /// Server-assigned ordering within the session
    pub sequence: u64,

    /// Start offset in ms from stream start
    pub start_ms: u64,

    /// End offset in ms from stream start
    pub end_ms: u64,
}

impl Transcript {
    /// Create a partial (in-progress) transcript
    pub fn partial(text: impl Into<String>, sequence: u64) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            sequence,
            start_ms: 0,
            end_ms: 0,
        }
    }

    /// Create a final transcript
    pub fn final_result(text: impl Into<String>, sequence: u64) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            sequence,
            start_ms: 0,
            end_ms: 0,
        }
    }

    /// Set the time range
    pub fn with_time_range(mut self, start_ms: u64, end_ms: u64) -> Self {
        self.start_ms = start_ms;
        self.end_ms = end_ms;
        self
    }

    /// True when the text carries no speech content
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_then_final() {
        let p = Transcript::partial("what time", 1);
        let f = Transcript::final_result("what time is it", 2).with_time_range(120, 1480);

        assert!(!p.is_final);
        assert!(f.is_final);
        assert!(f.sequence > p.sequence);
        assert_eq!(f.end_ms - f.start_ms, 1360);
    }

    #[test]
    fn whitespace_only_is_empty() {
        assert!(Transcript::final_result("   ", 1).is_empty());
        assert!(!Transcript::final_result("stop", 1).is_empty());
    }
}
