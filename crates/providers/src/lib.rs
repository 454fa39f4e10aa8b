//! Streaming provider adapters
//!
//! Concrete clients behind the core provider traits:
//! - [`OpenAiChatProvider`]: OpenAI-compatible chat completions over SSE
//! - [`WsAsrProvider`]: websocket streaming recognition
//! - [`WsTtsProvider`]: websocket streaming synthesis
//! - [`LocalMemoryStore`] / [`NullMemoryStore`]: long-term memory backends

pub mod asr;
pub mod llm;
pub mod memory;
pub mod tts;

pub use asr::{WsAsrProvider, WsAsrSession};
pub use llm::OpenAiChatProvider;
pub use memory::{LocalMemoryStore, NullMemoryStore};
pub use tts::{WsTtsProvider, WsTtsSession};
