//! Configuration for the voiceloop pipeline
//!
//! Settings are layered: an optional config file, then environment variables
//! with the `VOICELOOP` prefix. Provider credentials are validated at startup
//! so misconfiguration never surfaces from inside a turn.

mod roles;
mod settings;

pub use roles::{RoleConfig, RoleLibrary};
pub use settings::{
    AecSettings, AsrSettings, AudioSettings, LlmSettings, MemorySettings, NoiseSuppression,
    ObservabilitySettings, PipelineSettings, Settings, TtsSettings,
};

use thiserror::Error;

/// Configuration errors, surfaced at startup only
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("missing required field `{field}`: {message}")]
    MissingField { field: String, message: String },

    #[error("invalid value for `{field}`: {message}")]
    InvalidValue { field: String, message: String },

    #[error("unknown role `{0}`")]
    UnknownRole(String),
}
