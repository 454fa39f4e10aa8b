//! Token stream → utterance segmentation
//!
//! Accumulates stripped text into a rolling buffer and flushes a fragment
//! when a sentence terminator (or newline) is seen, when a pause mark is seen
//! with enough buffered text, or when the buffer reaches its cap. The final
//! flush at end of stream is terminal even without a terminator. Fragments
//! that are only whitespace or stripped markup are suppressed.

use serde::{Deserialize, Serialize};

use voiceloop_core::Utterance;

use crate::stripper::StreamingStripper;

/// Sentence-terminating punctuation
fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '?' | '!' | '。' | '！' | '？')
}

/// Strong pause punctuation
fn is_pause(c: char) -> bool {
    matches!(c, ',' | '，' | ';' | '；' | ':' | '：')
}

/// Segmentation tunables, counted in Unicode codepoints
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SanitizerConfig {
    /// Minimum buffered length before a pause mark may flush
    pub min_flush_chars: usize,
    /// Buffer cap; reaching it forces a flush
    pub max_buffer_chars: usize,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            min_flush_chars: 10,
            max_buffer_chars: 100,
        }
    }
}

/// Converts raw chat tokens into TTS-ready utterances
#[derive(Debug)]
pub struct TextSanitizer {
    config: SanitizerConfig,
    stripper: StreamingStripper,
    buffer: String,
    buffer_chars: usize,
}

impl TextSanitizer {
    pub fn new(config: SanitizerConfig) -> Self {
        Self {
            config,
            stripper: StreamingStripper::new(),
            buffer: String::new(),
            buffer_chars: 0,
        }
    }

    /// Feed one token; returns any utterances that became ready
    pub fn push(&mut self, token: &str) -> Vec<Utterance> {
        let stripped = self.stripper.push(token);
        self.ingest(&stripped)
    }

    /// End of token stream: flush the stripper tail and emit the remaining
    /// buffer as a terminal utterance (suppressed when blank)
    pub fn finish(&mut self) -> Vec<Utterance> {
        let tail = self.stripper.finish();
        let mut flushed = self.ingest(&tail);

        let text = std::mem::take(&mut self.buffer);
        self.buffer_chars = 0;
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            flushed.push(Utterance::terminal(trimmed));
        }
        flushed
    }

    pub fn reset(&mut self) {
        self.stripper.reset();
        self.buffer.clear();
        self.buffer_chars = 0;
    }

    fn ingest(&mut self, text: &str) -> Vec<Utterance> {
        let mut flushed = Vec::new();
        for ch in text.chars() {
            self.buffer.push(ch);
            self.buffer_chars += 1;

            if is_sentence_end(ch) || ch == '\n' {
                self.flush_whole(&mut flushed);
            } else if is_pause(ch) && self.buffer_chars >= self.config.min_flush_chars {
                self.flush_whole(&mut flushed);
            } else if self.buffer_chars >= self.config.max_buffer_chars {
                self.flush_overflow(&mut flushed);
            }
        }
        flushed
    }

    fn flush_whole(&mut self, out: &mut Vec<Utterance>) {
        let text = std::mem::take(&mut self.buffer);
        self.buffer_chars = 0;
        Self::emit(out, text.trim());
    }

    /// Buffer hit the cap: split at the most recent pause mark when one sits
    /// in the last quarter, otherwise flush everything
    fn flush_overflow(&mut self, out: &mut Vec<Utterance>) {
        let chars: Vec<char> = self.buffer.chars().collect();
        let n = chars.len();
        let quarter_start = n - n / 4;

        let split = (quarter_start..n).rev().find(|&idx| is_pause(chars[idx]));
        match split {
            Some(p) => {
                let head: String = chars[..=p].iter().collect();
                let rest: String = chars[p + 1..].iter().collect();
                self.buffer = rest;
                self.buffer_chars = n - (p + 1);
                Self::emit(out, head.trim());
            }
            None => self.flush_whole(out),
        }
    }

    fn emit(out: &mut Vec<Utterance>, trimmed: &str) {
        if !trimmed.is_empty() {
            out.push(Utterance::new(trimmed));
        }
    }
}

impl Default for TextSanitizer {
    fn default() -> Self {
        Self::new(SanitizerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stripper::strip_markup;

    fn run(tokens: &[&str]) -> Vec<Utterance> {
        let mut sanitizer = TextSanitizer::default();
        let mut out = Vec::new();
        for t in tokens {
            out.extend(sanitizer.push(t));
        }
        out.extend(sanitizer.finish());
        out
    }

    fn texts(utterances: &[Utterance]) -> Vec<&str> {
        utterances.iter().map(|u| u.text.as_str()).collect()
    }

    #[test]
    fn sentence_terminator_flushes() {
        let out = run(&[" It", " is", " about", " three", " pm", "."]);
        assert_eq!(texts(&out), vec!["It is about three pm."]);
        // trailing flush was empty and therefore suppressed
        assert!(!out[0].is_terminal);
    }

    #[test]
    fn markup_is_stripped_and_lines_segment() {
        let out = run(&["**Hi**", " there.", "\n- item one", "\n- item two", "\n"]);
        assert_eq!(texts(&out), vec!["Hi there.", "item one", "item two"]);
    }

    #[test]
    fn pause_respects_min_length() {
        // comma at 3 chars buffered: below the minimum, no flush
        let out = run(&["ab,", " and then some more.", ""]);
        assert_eq!(texts(&out), vec!["ab, and then some more."]);

        let out = run(&["a long enough clause,", " rest."]);
        assert_eq!(texts(&out), vec!["a long enough clause,", "rest."]);
    }

    #[test]
    fn overflow_splits_at_recent_pause() {
        let mut config = SanitizerConfig::default();
        config.max_buffer_chars = 20;
        config.min_flush_chars = 100; // keep the pause rule out of the way
        let mut sanitizer = TextSanitizer::new(config);

        let mut out = sanitizer.push("abcdefghijklmnop, rst");
        out.extend(sanitizer.finish());
        // cap is hit at 20 chars; the comma sits in the last quarter
        assert_eq!(texts(&out), vec!["abcdefghijklmnop,", "rst"]);
        assert!(out[1].is_terminal);
    }

    #[test]
    fn overflow_without_pause_flushes_everything() {
        let mut config = SanitizerConfig::default();
        config.max_buffer_chars = 10;
        let mut sanitizer = TextSanitizer::new(config);

        let out = sanitizer.push("abcdefghijklm");
        assert_eq!(texts(&out), vec!["abcdefghij"]);
    }

    #[test]
    fn terminal_flush_without_terminator() {
        let out = run(&["no punctuation here"]);
        assert_eq!(texts(&out), vec!["no punctuation here"]);
        assert!(out[0].is_terminal);
    }

    #[test]
    fn blank_stream_emits_nothing() {
        assert!(run(&["  ", "\n", "**"]).is_empty());
    }

    #[test]
    fn concatenation_preserves_stripped_text() {
        let tokens = [
            "**Intro**: first",
            " clause, then a second",
            " one. Another sentence",
            " without end",
        ];
        let out = run(&tokens);

        let full: String = tokens.concat();
        let expected: String = strip_markup(&full).split_whitespace().collect::<Vec<_>>().join(" ");
        let got = texts(&out).join(" ");
        let got: String = got.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(got, expected);
    }

    #[test]
    fn reset_clears_state() {
        let mut sanitizer = TextSanitizer::default();
        let _ = sanitizer.push("partial **bo");
        sanitizer.reset();
        let out = sanitizer.finish();
        assert!(out.is_empty());
    }
}
