//! Stream-aware text post-processing
//!
//! Converts the raw chat token stream into TTS-ready utterances: markup is
//! stripped, text is segmented on sentence and pause boundaries, and the tail
//! is flushed when the stream ends. The on-screen transcript keeps the raw
//! tokens; only the TTS feed goes through this crate.

mod sanitizer;
mod stripper;

pub use sanitizer::{SanitizerConfig, TextSanitizer};
pub use stripper::{strip_markup, StreamingStripper};
