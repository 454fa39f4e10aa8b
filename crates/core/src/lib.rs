//! Core traits and types for the voiceloop pipeline
//!
//! This crate provides foundational types used across all other crates:
//! - Audio frame types
//! - Transcript and chat stream types
//! - Conversation history
//! - Turn lifecycle (state, outcome, cancellation)
//! - Error taxonomy
//! - Provider traits (ASR, chat, TTS, memory) and audio device seams

pub mod audio;
pub mod cancel;
pub mod chat;
pub mod error;
pub mod message;
pub mod traits;
pub mod transcript;
pub mod turn;

pub use audio::{AudioFrame, Channels, ReferenceFrame, SampleRate};
pub use cancel::CancellationToken;
pub use chat::{ChatOutcome, FinishReason, GenerationParams, Token, ToolCall, Utterance};
pub use error::{Error, ErrorKind, Result};
pub use message::{ChatMessage, ConversationHistory, ConversationMessage, Role};
pub use traits::{
    AsrProvider, AsrSession, AudioSink, AudioSource, ChatEvent, ChatProvider, ChatStream,
    MemorySnippet, MemoryStore, TtsProvider, TtsSession,
};
pub use transcript::Transcript;
pub use turn::{CancelReason, TurnId, TurnOutcome, TurnReport, TurnState};
