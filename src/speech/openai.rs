//! OpenAI-compatible speech synthesis backend
//!
//! Audio is generated through `/v1/audio/speech` and, with the `audio-io`
//! feature, played through rodio on the default output device.

use super::synthesis::{SpeechAudio, SpeechSynthesizer, VoiceSettings};
use super::CancelFlag;
use crate::llm::openai::{error_for_status, transport_error};
use crate::{Result, RoadcastError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info};

/// Configuration for the speech endpoint
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiSpeechConfig {
    /// API key; never written back to config files
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    pub base_url: String,

    pub model: String,

    /// Encoded audio format requested from the service
    pub response_format: String,

    pub timeout_secs: u64,
}

impl Default for OpenAiSpeechConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com".to_string(),
            model: "tts-1".to_string(),
            response_format: "mp3".to_string(),
            timeout_secs: 30,
        }
    }
}

impl OpenAiSpeechConfig {
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/audio/speech", self.base_url.trim_end_matches('/'))
    }
}

/// Build the JSON body for a speech request
pub fn build_speech_body(
    config: &OpenAiSpeechConfig,
    text: &str,
    voice: &VoiceSettings,
) -> serde_json::Value {
    serde_json::json!({
        "model": config.model,
        "input": text,
        "voice": voice.voice,
        "response_format": config.response_format,
        "speed": speed_for_rate(voice.rate),
    })
}

/// Map a platform speaking rate (0.5 = normal) to the service's speed factor
fn speed_for_rate(rate: f32) -> f32 {
    (rate / 0.5).clamp(0.25, 4.0)
}

/// Remote synthesizer with local playback
pub struct OpenAiSpeechSynthesizer {
    config: OpenAiSpeechConfig,
    client: reqwest::Client,
    runtime: Option<Runtime>,
}

impl OpenAiSpeechSynthesizer {
    pub fn new(config: OpenAiSpeechConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                RoadcastError::ConfigError(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            config,
            client,
            runtime: None,
        })
    }

    /// Runtime is created lazily so it lives on the synthesis worker thread
    fn runtime(&mut self) -> Result<&Runtime> {
        if self.runtime.is_none() {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| {
                    RoadcastError::ConfigError(format!("Failed to create tokio runtime: {}", e))
                })?;
            self.runtime = Some(runtime);
        }

        self.runtime
            .as_ref()
            .ok_or_else(|| RoadcastError::ConfigError("Runtime unavailable".into()))
    }

    async fn request_audio(
        client: reqwest::Client,
        config: OpenAiSpeechConfig,
        api_key: String,
        body: serde_json::Value,
    ) -> Result<Vec<u8>> {
        let response = client
            .post(config.endpoint())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, &text));
        }

        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(bytes.to_vec())
    }
}

async fn wait_cancelled(cancel: CancelFlag) {
    while !cancel.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

impl SpeechSynthesizer for OpenAiSpeechSynthesizer {
    fn synthesize(
        &mut self,
        text: &str,
        voice: &VoiceSettings,
        cancel: &CancelFlag,
    ) -> Result<SpeechAudio> {
        let api_key = self
            .config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| RoadcastError::MissingCredential("OPENAI_API_KEY".into()))?;

        let body = build_speech_body(&self.config, text, voice);
        let request = Self::request_audio(self.client.clone(), self.config.clone(), api_key, body);
        let cancel = cancel.clone();
        let format = self.config.response_format.clone();

        let bytes = self.runtime()?.block_on(async move {
            tokio::select! {
                result = request => result,
                _ = wait_cancelled(cancel) => Err(RoadcastError::Superseded),
            }
        })?;

        if bytes.is_empty() {
            return Err(RoadcastError::EmptyResponse("Speech service returned no audio".into()));
        }

        debug!("Received {} bytes of {} audio", bytes.len(), format);
        Ok(SpeechAudio::Encoded { bytes, format })
    }

    fn play(&mut self, audio: SpeechAudio, cancel: &CancelFlag) -> Result<()> {
        play_audio(audio, cancel)
    }
}

#[cfg(feature = "audio-io")]
fn play_audio(audio: SpeechAudio, cancel: &CancelFlag) -> Result<()> {
    use rodio::{buffer::SamplesBuffer, Decoder, OutputStream, Sink};
    use std::io::Cursor;

    let (_stream, handle) = OutputStream::try_default()
        .map_err(|e| RoadcastError::DeviceUnavailable(format!("No output stream: {}", e)))?;
    let sink = Sink::try_new(&handle)
        .map_err(|e| RoadcastError::DeviceUnavailable(format!("Failed to create sink: {}", e)))?;

    match audio {
        SpeechAudio::Encoded { bytes, format } => {
            let source = Decoder::new(Cursor::new(bytes)).map_err(|e| {
                RoadcastError::EmptyResponse(format!("Undecodable {} audio: {}", format, e))
            })?;
            sink.append(source);
        }
        SpeechAudio::Samples {
            samples,
            sample_rate,
        } => sink.append(SamplesBuffer::new(1, sample_rate, samples)),
        SpeechAudio::Text(text) => {
            info!("No audio to play for: {}", text);
            return Ok(());
        }
    }

    while !sink.empty() {
        if cancel.is_cancelled() {
            sink.stop();
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    Ok(())
}

#[cfg(not(feature = "audio-io"))]
fn play_audio(audio: SpeechAudio, _cancel: &CancelFlag) -> Result<()> {
    match audio {
        SpeechAudio::Text(text) => {
            info!("No audio to play for: {}", text);
            Ok(())
        }
        _ => Err(RoadcastError::DeviceUnavailable(
            "Audio playback requires the audio-io feature".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speech_body() {
        let config = OpenAiSpeechConfig::default();
        let voice = VoiceSettings::default();
        let body = build_speech_body(&config, "Good morning", &voice);

        assert_eq!(body["model"], "tts-1");
        assert_eq!(body["voice"], "nova");
        assert_eq!(body["input"], "Good morning");
        assert_eq!(body["response_format"], "mp3");
        let speed = body["speed"].as_f64().unwrap();
        assert!((speed - 0.96).abs() < 1e-3);
    }

    #[test]
    fn test_speed_is_clamped() {
        assert_eq!(speed_for_rate(0.01), 0.25);
        assert_eq!(speed_for_rate(5.0), 4.0);
    }

    #[test]
    fn test_missing_key_is_reported() {
        let mut synth = OpenAiSpeechSynthesizer::new(OpenAiSpeechConfig::default()).unwrap();
        let result = synth.synthesize("hi", &VoiceSettings::default(), &CancelFlag::new());
        assert!(matches!(result, Err(RoadcastError::MissingCredential(_))));
    }

    #[test]
    fn test_api_key_not_serialized() {
        let config = OpenAiSpeechConfig::default().with_api_key("sk-secret");
        let text = toml::to_string(&config).unwrap();
        assert!(!text.contains("sk-secret"));
    }
}
