//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use voiceloop_core::GenerationParams;

use crate::ConfigError;

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// User identity forwarded to the memory store
    #[serde(default = "default_user_id")]
    pub user_id: String,

    /// Role id selected from the role library
    #[serde(default = "default_role")]
    pub role: String,

    #[serde(default)]
    pub llm: LlmSettings,

    #[serde(default)]
    pub asr: AsrSettings,

    #[serde(default)]
    pub tts: TtsSettings,

    #[serde(default)]
    pub audio: AudioSettings,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub memory: MemorySettings,

    #[serde(default)]
    pub observability: ObservabilitySettings,
}

impl Settings {
    /// Load settings from the optional `config/voiceloop.toml` file layered
    /// under `VOICELOOP__*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name("config/voiceloop").required(false))
            .add_source(
                Environment::with_prefix("VOICELOOP")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Validate credentials and tunables. Failures here exit the program
    /// before any device or session is opened.
    pub fn validate(&self, voice_mode: bool) -> Result<(), ConfigError> {
        if self.llm.api_key.is_empty() {
            return Err(ConfigError::MissingField {
                field: "llm.api_key".into(),
                message: "set VOICELOOP__LLM__API_KEY or add it to the config file".into(),
            });
        }
        if voice_mode {
            if self.asr.api_key.is_empty() {
                return Err(ConfigError::MissingField {
                    field: "asr.api_key".into(),
                    message: "voice mode needs an ASR credential".into(),
                });
            }
            if self.tts.api_key.is_empty() {
                return Err(ConfigError::MissingField {
                    field: "tts.api_key".into(),
                    message: "voice mode needs a TTS credential".into(),
                });
            }
        }
        if self.audio.frame_ms == 0 || self.audio.frame_ms > 60 {
            return Err(ConfigError::InvalidValue {
                field: "audio.frame_ms".into(),
                message: format!("{} ms is outside 1..=60", self.audio.frame_ms),
            });
        }
        if self.pipeline.playback_watermark_ms < 40 {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.playback_watermark_ms".into(),
                message: "watermark below 40 ms starves the output device".into(),
            });
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            role: default_role(),
            llm: LlmSettings::default(),
            asr: AsrSettings::default(),
            tts: TtsSettings::default(),
            audio: AudioSettings::default(),
            pipeline: PipelineSettings::default(),
            memory: MemorySettings::default(),
            observability: ObservabilitySettings::default(),
        }
    }
}

/// Chat provider settings (OpenAI-compatible endpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl LlmSettings {
    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Streaming recognition provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrSettings {
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_asr_url")]
    pub url: String,

    #[serde(default = "default_asr_model")]
    pub model: String,

    #[serde(default = "default_capture_rate")]
    pub sample_rate: u32,

    /// Ask the provider to drop fillers ("um", "uh") from transcripts
    #[serde(default = "default_true")]
    pub disfluency_removal: bool,
}

impl Default for AsrSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            url: default_asr_url(),
            model: default_asr_model(),
            sample_rate: default_capture_rate(),
            disfluency_removal: true,
        }
    }
}

/// Streaming synthesis provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsSettings {
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_tts_url")]
    pub url: String,

    #[serde(default = "default_voice")]
    pub voice: String,

    #[serde(default = "default_playback_rate")]
    pub sample_rate: u32,

    /// Wire sample format; only s16le is supported
    #[serde(default = "default_sample_format")]
    pub format: String,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            url: default_tts_url(),
            voice: default_voice(),
            sample_rate: default_playback_rate(),
            format: default_sample_format(),
        }
    }
}

/// Noise suppression strength for the echo canceller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseSuppression {
    Off,
    Low,
    Moderate,
    High,
}

impl Default for NoiseSuppression {
    fn default() -> Self {
        NoiseSuppression::Moderate
    }
}

/// Echo cancellation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AecSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Expected round-trip delay from reference submission to echoed capture
    #[serde(default = "default_stream_delay_ms")]
    pub stream_delay_ms: u32,

    #[serde(default)]
    pub noise_suppression: NoiseSuppression,

    #[serde(default = "default_true")]
    pub high_pass: bool,
}

impl Default for AecSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            stream_delay_ms: default_stream_delay_ms(),
            noise_suppression: NoiseSuppression::default(),
            high_pass: true,
        }
    }
}

/// Audio device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Input device name substring; default device when unset
    #[serde(default)]
    pub input_device: Option<String>,

    /// Output device name substring; default device when unset
    #[serde(default)]
    pub output_device: Option<String>,

    #[serde(default = "default_capture_rate")]
    pub capture_sample_rate: u32,

    /// Capture frame cadence
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,

    /// The input is an aggregate device carrying `{mic, reference}` channels
    #[serde(default)]
    pub aggregate_device: bool,

    #[serde(default)]
    pub aec: AecSettings,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            capture_sample_rate: default_capture_rate(),
            frame_ms: default_frame_ms(),
            aggregate_device: false,
            aec: AecSettings::default(),
        }
    }
}

/// Pipeline tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Conversation history cap, in messages
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Minimum trimmed transcript length that may fire barge-in
    #[serde(default = "default_barge_in_min_chars")]
    pub barge_in_min_chars: usize,

    /// Echo-grace window after the last playback frame (software AEC only)
    #[serde(default = "default_barge_in_grace_ms")]
    pub barge_in_grace_ms: u64,

    /// Forced ASR flush after this long without a final transcript
    #[serde(default = "default_asr_final_timeout_ms")]
    pub asr_final_timeout_ms: u64,

    #[serde(default = "default_llm_first_token_timeout_ms")]
    pub llm_first_token_timeout_ms: u64,

    #[serde(default = "default_tts_first_frame_timeout_ms")]
    pub tts_first_frame_timeout_ms: u64,

    /// Playback buffer watermark for cooperative back-pressure
    #[serde(default = "default_playback_watermark_ms")]
    pub playback_watermark_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            barge_in_min_chars: default_barge_in_min_chars(),
            barge_in_grace_ms: default_barge_in_grace_ms(),
            asr_final_timeout_ms: default_asr_final_timeout_ms(),
            llm_first_token_timeout_ms: default_llm_first_token_timeout_ms(),
            tts_first_frame_timeout_ms: default_tts_first_frame_timeout_ms(),
            playback_watermark_ms: default_playback_watermark_ms(),
        }
    }
}

/// Long-term memory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    #[serde(default)]
    pub enabled: bool,

    /// Snippets retrieved per turn
    #[serde(default = "default_memory_limit")]
    pub limit: usize,

    /// Recorded turns kept by the local store
    #[serde(default = "default_memory_capacity")]
    pub capacity: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: default_memory_limit(),
            capacity: default_memory_capacity(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_user_id() -> String {
    "default_user".into()
}
fn default_role() -> String {
    "default".into()
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_asr_url() -> String {
    "wss://asr.example.com/v1/realtime".into()
}
fn default_asr_model() -> String {
    "realtime-asr-1".into()
}
fn default_tts_url() -> String {
    "wss://tts.example.com/v1/stream".into()
}
fn default_voice() -> String {
    "cherry".into()
}
fn default_sample_format() -> String {
    "s16le".into()
}
fn default_capture_rate() -> u32 {
    16_000
}
fn default_playback_rate() -> u32 {
    24_000
}
fn default_frame_ms() -> u32 {
    10
}
fn default_stream_delay_ms() -> u32 {
    40
}
fn default_history_limit() -> usize {
    20
}
fn default_barge_in_min_chars() -> usize {
    2
}
fn default_barge_in_grace_ms() -> u64 {
    200
}
fn default_asr_final_timeout_ms() -> u64 {
    8_000
}
fn default_llm_first_token_timeout_ms() -> u64 {
    10_000
}
fn default_tts_first_frame_timeout_ms() -> u64 {
    3_000
}
fn default_playback_watermark_ms() -> u64 {
    200
}
fn default_memory_limit() -> usize {
    5
}
fn default_memory_capacity() -> usize {
    256
}
fn default_log_level() -> String {
    "info".into()
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.audio.frame_ms, 10);
        assert_eq!(settings.audio.aec.stream_delay_ms, 40);
        assert_eq!(settings.pipeline.barge_in_grace_ms, 200);
        assert_eq!(settings.pipeline.history_limit, 20);
        assert_eq!(settings.memory.limit, 5);
        assert_eq!(
            settings.audio.aec.noise_suppression,
            NoiseSuppression::Moderate
        );
    }

    #[test]
    fn validate_flags_missing_llm_key() {
        let settings = Settings::default();
        let err = settings.validate(false).unwrap_err();
        assert!(matches!(err, crate::ConfigError::MissingField { ref field, .. } if field == "llm.api_key"));
    }

    #[test]
    fn validate_requires_voice_credentials_only_in_voice_mode() {
        let mut settings = Settings::default();
        settings.llm.api_key = "k".into();
        assert!(settings.validate(false).is_ok());

        let err = settings.validate(true).unwrap_err();
        assert!(matches!(err, crate::ConfigError::MissingField { ref field, .. } if field == "asr.api_key"));
    }

    #[test]
    fn validate_rejects_degenerate_frame_cadence() {
        let mut settings = Settings::default();
        settings.llm.api_key = "k".into();
        settings.audio.frame_ms = 0;
        assert!(settings.validate(false).is_err());
    }
}
