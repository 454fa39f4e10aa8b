//! Chat stream and TTS feed types

use serde::{Deserialize, Serialize};

/// One text fragment from the chat stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    /// Position in the stream, starting at 0
    pub index: u32,
}

impl Token {
    pub fn new(text: impl Into<String>, index: u32) -> Self {
        Self {
            text: text.into(),
            index,
        }
    }
}

/// A tool invocation requested by the model at end of stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON argument payload as accumulated from deltas
    pub arguments: String,
}

/// Why the chat stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
}

/// Terminal summary of one chat stream
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub finish: FinishReason,
    pub tool_calls: Vec<ToolCall>,
}

impl ChatOutcome {
    pub fn stop() -> Self {
        Self {
            finish: FinishReason::Stop,
            tool_calls: Vec::new(),
        }
    }
}

/// Generation parameters forwarded to the chat provider
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2000,
        }
    }
}

/// A sanitized, TTS-ready phrase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub text: String,
    /// Set on the flush forced by end of the token stream
    pub is_terminal: bool,
}

impl Utterance {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_terminal: false,
        }
    }

    pub fn terminal(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_terminal: true,
        }
    }

    /// True when nothing speakable remains after trimming
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}
