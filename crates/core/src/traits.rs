//! Provider traits and audio device seams
//!
//! The pipeline depends only on these contracts; concrete adapters live in
//! `voiceloop-providers` and `voiceloop-audio`, and scripted fakes drive the
//! orchestrator in tests.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::audio::{AudioFrame, ReferenceFrame};
use crate::cancel::CancellationToken;
use crate::chat::{ChatOutcome, GenerationParams, Token};
use crate::error::{Error, Result};
use crate::message::ChatMessage;
use crate::transcript::Transcript;

/// A streaming speech-recognition session.
///
/// Sessions may be long-lived across turns; `flush` forces a final transcript
/// for whatever audio has been sent so far.
#[async_trait]
pub trait AsrSession: Send + Sync {
    /// Push a capture frame. Non-blocking; the adapter coalesces if the
    /// provider requires larger windows.
    async fn send(&self, frame: AudioFrame) -> Result<()>;

    /// Subscribe to transcript events. Both the orchestrator and the barge-in
    /// controller hold a subscription.
    fn transcripts(&self) -> broadcast::Receiver<Transcript>;

    /// Ask the provider to finalize the current utterance
    async fn flush(&self) -> Result<()>;

    /// Terminate the session; any in-flight final is still delivered first
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait AsrProvider: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn AsrSession>>;
}

/// Events on a chat token stream
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Token(Token),
    /// End of stream; carries finish reason and any tool calls
    Done(ChatOutcome),
    Error(Error),
}

/// One-shot streaming chat completion, already opened
pub struct ChatStream {
    pub events: mpsc::Receiver<ChatEvent>,
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Open a streaming completion. Triggering `cancel` stops the network
    /// read within 100 ms and releases the connection.
    async fn open(
        &self,
        messages: Vec<ChatMessage>,
        params: GenerationParams,
        cancel: CancellationToken,
    ) -> Result<ChatStream>;
}

/// An incremental text-to-speech session
#[async_trait]
pub trait TtsSession: Send {
    /// Enqueue a text fragment; the provider may buffer to a boundary
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// No more text will arrive; remaining audio is emitted, then the frame
    /// channel closes
    async fn finish(&mut self) -> Result<()>;

    /// Cancel immediately; the frame channel closes with no guarantee about
    /// unemitted audio
    fn abort(&mut self);

    /// Take the audio frame stream. Yields `Some` exactly once.
    fn take_frames(&mut self) -> Option<mpsc::Receiver<AudioFrame>>;
}

#[async_trait]
pub trait TtsProvider: Send + Sync {
    async fn open(&self, cancel: CancellationToken) -> Result<Box<dyn TtsSession>>;
}

/// A retrieved long-term memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySnippet {
    pub content: String,
}

/// Long-term memory collaborator.
///
/// Implementations must be safe to call concurrently; the orchestrator
/// applies a 500 ms deadline to every call.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn search(
        &self,
        query: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<MemorySnippet>>;

    async fn record_turn(
        &self,
        user_id: &str,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<()>;
}

/// Output device seam.
///
/// `submit` applies cooperative back-pressure above the configured watermark;
/// `abort` discards pending frames and silences the device within one frame
/// period, and later submits are ordered after it.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn submit(&self, frame: AudioFrame) -> Result<()>;

    /// Wait until the enqueued buffer has drained
    async fn flush(&self) -> Result<()>;

    /// Idempotent immediate stop
    fn abort(&self);

    /// True iff a frame reached the device within the last frame period and
    /// the buffer is non-empty
    fn is_playing(&self) -> bool;

    /// Instant of the most recent submitted frame, if any. Used by the
    /// barge-in grace window.
    fn last_submit(&self) -> Option<Instant>;

    /// Mirror of every submitted frame with its intended play-out instant
    fn reference_frames(&self) -> broadcast::Receiver<ReferenceFrame>;
}

/// Input device seam. `frames` yields the capture channel exactly once; the
/// channel closes when capture stops.
pub trait AudioSource: Send {
    fn start(&mut self) -> Result<()>;
    fn frames(&mut self) -> Option<mpsc::Receiver<AudioFrame>>;
    fn stop(&mut self);
}
