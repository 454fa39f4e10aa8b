//! Error taxonomy shared across the pipeline
//!
//! Errors never propagate across turn boundaries; every new turn starts with
//! fresh sessions. The orchestrator maps each error to its kind to decide
//! between in-turn recovery, turn failure, and pipeline teardown.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification driving recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing credentials, unresolvable devices. Fatal at startup.
    Config,
    /// Dropped buffers, momentary stalls. Recovered in-stage.
    TransientIo,
    /// Recoverable provider trouble; one reconnect per session.
    ProviderTransient,
    /// Auth, quota, malformed request. Fails the turn, not the pipeline.
    ProviderFatal,
    /// A stage missed its deadline.
    Timeout,
    /// Barge-in or explicit cancel. Not an error in the user's eyes.
    Cancelled,
}

/// Pipeline errors
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("input device busy: {0}")]
    DeviceBusy(String),

    #[error("audio capture failed: {0}")]
    CaptureFailed(String),

    #[error("audio playback failed: {0}")]
    Playback(String),

    #[error("ASR authentication failed: {0}")]
    AsrAuthFailed(String),

    #[error("ASR session error: {0}")]
    Asr(String),

    #[error("chat stream interrupted: {0}")]
    LlmInterrupted(String),

    #[error("chat request failed: {0}")]
    LlmFailed(String),

    #[error("no chat token before deadline")]
    LlmTimeout,

    #[error("TTS session error: {0}")]
    Tts(String),

    #[error("no TTS audio before deadline")]
    TtsTimeout,

    #[error("memory store error: {0}")]
    Memory(String),

    #[error("stage channel closed")]
    ChannelClosed,

    #[error("turn cancelled")]
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::DeviceBusy(_) => ErrorKind::Config,
            Error::CaptureFailed(_) | Error::Playback(_) | Error::ChannelClosed => {
                ErrorKind::TransientIo
            }
            Error::Asr(_) | Error::LlmInterrupted(_) | Error::Tts(_) | Error::Memory(_) => {
                ErrorKind::ProviderTransient
            }
            Error::AsrAuthFailed(_) | Error::LlmFailed(_) => ErrorKind::ProviderFatal,
            Error::LlmTimeout | Error::TtsTimeout => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the error should end the turn rather than be retried in-stage
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Config | ErrorKind::ProviderFatal | ErrorKind::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_assignments() {
        assert_eq!(Error::Config("x".into()).kind(), ErrorKind::Config);
        assert_eq!(
            Error::AsrAuthFailed("401".into()).kind(),
            ErrorKind::ProviderFatal
        );
        assert_eq!(Error::LlmTimeout.kind(), ErrorKind::Timeout);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert!(!Error::Asr("stall".into()).is_fatal());
        assert!(Error::LlmFailed("quota".into()).is_fatal());
    }
}
