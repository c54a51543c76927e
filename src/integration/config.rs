//! Configuration for the integration layer
//!
//! Provides centralized configuration for all components. Every section
//! has defaults, so a TOML file only needs the values it changes.

use crate::llm::prompts::{DEFAULT_GREETING, GREETING_INSTRUCTION, PODCAST_HOST_PROMPT};
use crate::llm::OpenAiReplyConfig;
use crate::speech::{
    CaptureConfig, OpenAiSpeechConfig, OpenAiTranscriptionConfig, SynthesisConfig,
};
use crate::{Result, RoadcastError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// How the conversation opens
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Greeting {
    /// Speak this line; it is not recorded as a turn
    Fixed(String),
    /// Ask the reply service for an opening line using this instruction;
    /// the result is recorded as the first agent turn
    Generated(String),
}

impl Default for Greeting {
    fn default() -> Self {
        Greeting::Fixed(DEFAULT_GREETING.to_string())
    }
}

impl Greeting {
    /// A generated opening line using the stock host instruction
    pub fn generated() -> Self {
        Greeting::Generated(GREETING_INSTRUCTION.to_string())
    }
}

/// Which recognition backend the host binary uses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognizerBackendKind {
    /// Read typed lines from stdin
    #[default]
    Console,
    /// Microphone audio sent to the OpenAI transcription endpoint
    #[serde(rename = "openai")]
    OpenAi,
}

/// Which synthesis backend the host binary uses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechBackendKind {
    /// Print replies to the terminal
    #[default]
    Console,
    /// OpenAI speech endpoint with local playback
    #[serde(rename = "openai")]
    OpenAi,
}

/// Delays between conversation steps, in seconds
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Hardware settle gap between releasing and re-acquiring the device
    pub device_settle: f32,

    /// Pause after the host finishes speaking before the microphone opens
    pub post_speech_delay: f32,

    /// Pause before listening again after an empty turn
    pub relisten_delay: f32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            device_settle: 0.25,
            post_speech_delay: 0.5,
            relisten_delay: 1.0,
        }
    }
}

impl TimingConfig {
    pub fn device_settle_duration(&self) -> Duration {
        secs(self.device_settle)
    }

    pub fn post_speech_duration(&self) -> Duration {
        secs(self.post_speech_delay)
    }

    pub fn relisten_duration(&self) -> Duration {
        secs(self.relisten_delay)
    }
}

/// Bounded exponential backoff for reply requests
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per reply, including the first
    pub max_attempts: u32,

    /// Seconds to wait after the first failure
    pub initial_backoff: f32,

    pub multiplier: f32,

    /// Upper bound on a single wait, in seconds
    pub max_backoff: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: 1.0,
            multiplier: 2.0,
            max_backoff: 8.0,
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt following failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let wait = self.initial_backoff * self.multiplier.powi(exponent);
        secs(wait.min(self.max_backoff))
    }
}

/// Longest delay or timeout any section accepts, in seconds
pub const MAX_DELAY_SECS: f32 = 3600.0;

/// Seconds to a `Duration`, clamped to `0..=MAX_DELAY_SECS`
pub(crate) fn secs(value: f32) -> Duration {
    if !(value.is_finite() && value > 0.0) {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f32(value.min(MAX_DELAY_SECS)).unwrap_or(Duration::ZERO)
}

/// Configuration for the complete application
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoadcastConfig {
    pub capture: CaptureConfig,

    pub synthesis: SynthesisConfig,

    /// Chat completions client
    pub reply: OpenAiReplyConfig,

    /// Speech endpoint client (used with the `openai` speech backend)
    pub speech_service: OpenAiSpeechConfig,

    /// Transcription client (used with the `openai` recognizer backend)
    pub transcription: OpenAiTranscriptionConfig,

    pub timing: TimingConfig,

    pub retry: RetryPolicy,

    pub greeting: Greeting,

    /// Base instruction sent with every reply request
    pub system_instruction: String,

    pub speech_backend: SpeechBackendKind,

    pub recognizer_backend: RecognizerBackendKind,

    /// Capacity of orchestrator channels
    pub channel_buffer_size: usize,

    /// How long shutdown waits for workers, in milliseconds
    pub shutdown_timeout_ms: u64,
}

impl Default for RoadcastConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            synthesis: SynthesisConfig::default(),
            reply: OpenAiReplyConfig::default(),
            speech_service: OpenAiSpeechConfig::default(),
            transcription: OpenAiTranscriptionConfig::default(),
            timing: TimingConfig::default(),
            retry: RetryPolicy::default(),
            greeting: Greeting::default(),
            system_instruction: PODCAST_HOST_PROMPT.to_string(),
            speech_backend: SpeechBackendKind::default(),
            recognizer_backend: RecognizerBackendKind::default(),
            channel_buffer_size: 100,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl RoadcastConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a TOML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| RoadcastError::ConfigError(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML; API keys are never written
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RoadcastError::ConfigError(format!("Failed to serialize config: {}", e)))
    }

    /// Set the API key for the reply, speech and transcription services
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.reply.api_key = Some(key.clone());
        self.speech_service.api_key = Some(key.clone());
        self.transcription.api_key = Some(key);
        self
    }

    /// Set the capture configuration
    pub fn with_capture(mut self, capture: CaptureConfig) -> Self {
        self.capture = capture;
        self
    }

    /// Set the synthesis configuration
    pub fn with_synthesis(mut self, synthesis: SynthesisConfig) -> Self {
        self.synthesis = synthesis;
        self
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_greeting(mut self, greeting: Greeting) -> Self {
        self.greeting = greeting;
        self
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = instruction.into();
        self
    }

    pub fn with_speech_backend(mut self, backend: SpeechBackendKind) -> Self {
        self.speech_backend = backend;
        self
    }

    pub fn with_recognizer_backend(mut self, backend: RecognizerBackendKind) -> Self {
        self.recognizer_backend = backend;
        self
    }

    /// Set the shutdown timeout in milliseconds
    pub fn with_shutdown_timeout(mut self, timeout_ms: u64) -> Self {
        self.shutdown_timeout_ms = timeout_ms;
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let audio_io = cfg!(feature = "audio-io");
        if !audio_io && self.speech_backend == SpeechBackendKind::OpenAi {
            return Err(RoadcastError::ConfigError(
                "speech_backend = \"openai\" needs the audio-io feature for playback".into(),
            ));
        }

        if !audio_io && self.recognizer_backend == RecognizerBackendKind::OpenAi {
            return Err(RoadcastError::ConfigError(
                "recognizer_backend = \"openai\" needs the audio-io feature for the microphone"
                    .into(),
            ));
        }

        let positive = [
            ("capture.silence_threshold", self.capture.silence_threshold),
            ("capture.no_speech_timeout", self.capture.no_speech_timeout),
            ("transcription.partial_interval", self.transcription.partial_interval),
            ("transcription.max_utterance", self.transcription.max_utterance),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0 && value <= MAX_DELAY_SECS) {
                return Err(RoadcastError::ConfigError(format!(
                    "{} must be in (0, {}], got {}",
                    name, MAX_DELAY_SECS, value
                )));
            }
        }

        let non_negative = [
            ("capture.device_wait", self.capture.device_wait),
            ("synthesis.device_wait", self.synthesis.device_wait),
            ("timing.device_settle", self.timing.device_settle),
            ("timing.post_speech_delay", self.timing.post_speech_delay),
            ("timing.relisten_delay", self.timing.relisten_delay),
            ("retry.initial_backoff", self.retry.initial_backoff),
            ("retry.max_backoff", self.retry.max_backoff),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && (0.0..=MAX_DELAY_SECS).contains(&value)) {
                return Err(RoadcastError::ConfigError(format!(
                    "{} must be in [0, {}], got {}",
                    name, MAX_DELAY_SECS, value
                )));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(RoadcastError::ConfigError(
                "retry.max_attempts must be at least 1".into(),
            ));
        }

        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(RoadcastError::ConfigError(format!(
                "retry.multiplier must be at least 1.0, got {}",
                self.retry.multiplier
            )));
        }

        if self.channel_buffer_size == 0 {
            return Err(RoadcastError::ConfigError(
                "channel_buffer_size must be positive".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RoadcastConfig::default();
        assert_eq!(config.capture.silence_threshold, 2.0);
        assert_eq!(config.capture.no_speech_timeout, 30.0);
        assert_eq!(config.timing.device_settle_duration(), Duration::from_millis(250));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.speech_backend, SpeechBackendKind::Console);
        assert!(matches!(config.greeting, Greeting::Fixed(_)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff(1), Duration::from_secs(1));
        assert_eq!(retry.backoff(2), Duration::from_secs(2));
        assert_eq!(retry.backoff(3), Duration::from_secs(4));
        assert_eq!(retry.backoff(4), Duration::from_secs(8));
        assert_eq!(retry.backoff(10), Duration::from_secs(8));
    }

    #[test]
    fn test_partial_toml() {
        let toml_str = r#"
            shutdown_timeout_ms = 2000

            [capture]
            silence_threshold = 1.5

            [retry]
            max_attempts = 5

            [greeting]
            generated = "Open the show"
        "#;

        let config = RoadcastConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.capture.silence_threshold, 1.5);
        assert_eq!(config.capture.no_speech_timeout, 30.0);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.multiplier, 2.0);
        assert_eq!(config.speech_backend, SpeechBackendKind::Console);
        assert_eq!(config.greeting, Greeting::Generated("Open the show".into()));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(2));
        assert_eq!(config.reply.model, "gpt-4o-mini");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = RoadcastConfig::default();
        config.capture.silence_threshold = 0.0;
        assert!(matches!(config.validate(), Err(RoadcastError::ConfigError(_))));

        let mut config = RoadcastConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = RoadcastConfig::default();
        config.timing.relisten_delay = -1.0;
        assert!(config.validate().is_err());

        assert!(RoadcastConfig::from_toml_str("[capture]\nsilence_threshold = -2.0").is_err());
    }

    #[test]
    fn test_validation_rejects_huge_delays() {
        let result = RoadcastConfig::from_toml_str(
            "[capture]\nno_speech_timeout = 1e30\n[timing]\nrelisten_delay = 1e30\n",
        );
        assert!(matches!(result, Err(RoadcastError::ConfigError(_))));

        let mut config = RoadcastConfig::default();
        config.retry.max_backoff = MAX_DELAY_SECS * 2.0;
        assert!(config.validate().is_err());

        let mut config = RoadcastConfig::default();
        config.retry.multiplier = f32::INFINITY;
        assert!(config.validate().is_err());

        let mut config = RoadcastConfig::default();
        config.timing.relisten_delay = MAX_DELAY_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unvalidated_delays_are_clamped() {
        let timing = TimingConfig {
            device_settle: f32::NAN,
            post_speech_delay: -3.0,
            relisten_delay: 1e30,
        };
        assert_eq!(timing.device_settle_duration(), Duration::ZERO);
        assert_eq!(timing.post_speech_duration(), Duration::ZERO);
        assert_eq!(timing.relisten_duration(), Duration::from_secs(3600));

        let retry = RetryPolicy {
            max_attempts: 3,
            initial_backoff: 1e30,
            multiplier: 1e30,
            max_backoff: f32::INFINITY,
        };
        assert_eq!(retry.backoff(5), Duration::from_secs(3600));
    }

    #[test]
    fn test_generated_greeting_uses_host_instruction() {
        match Greeting::generated() {
            Greeting::Generated(instruction) => assert_eq!(instruction, GREETING_INSTRUCTION),
            other => panic!("unexpected greeting {:?}", other),
        }

        let config = RoadcastConfig::default().with_greeting(Greeting::generated());
        let reloaded = RoadcastConfig::from_toml_str(&config.to_toml_string().unwrap()).unwrap();
        assert_eq!(reloaded.greeting, Greeting::generated());
    }

    #[test]
    fn test_backend_selection_parses() {
        let config = RoadcastConfig::default()
            .with_speech_backend(SpeechBackendKind::OpenAi)
            .with_recognizer_backend(RecognizerBackendKind::OpenAi);
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("speech_backend = \"openai\""));
        assert!(text.contains("recognizer_backend = \"openai\""));
    }

    #[cfg(not(feature = "audio-io"))]
    #[test]
    fn test_openai_backends_need_audio_io() {
        let result = RoadcastConfig::from_toml_str("speech_backend = \"openai\"\n");
        assert!(matches!(result, Err(RoadcastError::ConfigError(_))));

        let config =
            RoadcastConfig::default().with_recognizer_backend(RecognizerBackendKind::OpenAi);
        assert!(config.validate().is_err());
    }

    #[cfg(feature = "audio-io")]
    #[test]
    fn test_openai_backends_with_audio_io() {
        let config = RoadcastConfig::default()
            .with_speech_backend(SpeechBackendKind::OpenAi)
            .with_recognizer_backend(RecognizerBackendKind::OpenAi);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_api_key_is_not_written() {
        let config = RoadcastConfig::default().with_api_key("sk-very-secret");
        assert_eq!(config.reply.api_key.as_deref(), Some("sk-very-secret"));

        let text = config.to_toml_string().unwrap();
        assert!(!text.contains("sk-very-secret"));

        let reloaded = RoadcastConfig::from_toml_str(&text).unwrap();
        assert!(reloaded.reply.api_key.is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let result = RoadcastConfig::load("/nonexistent/roadcast.toml");
        assert!(matches!(result, Err(RoadcastError::IOError(_))));
    }
}
