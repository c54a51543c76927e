//! Microphone recognition through an OpenAI-compatible transcription endpoint
//!
//! The utterance heard so far is re-sent to `/v1/audio/transcriptions` every
//! `partial_interval` seconds while new speech keeps arriving, so the
//! capture engine sees cumulative partial transcripts the way a streaming
//! recognizer reports them. Microphone input requires the `audio-io` feature.

use crate::integration::config::secs;
use crate::llm::openai::{error_for_status, transport_error};
use crate::{Result, RoadcastError};
use hound::{SampleFormat, WavSpec, WavWriter};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;
use tracing::debug;

/// Configuration for the transcription endpoint and microphone buffering
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiTranscriptionConfig {
    /// API key; never written back to config files
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    pub base_url: String,

    pub model: String,

    /// ISO-639-1 hint; `None` lets the service detect the language
    pub language: Option<String>,

    pub timeout_secs: u64,

    /// Seconds between transcription requests while the driver is speaking
    pub partial_interval: f32,

    /// RMS level a frame must reach to count as speech
    pub speech_level: f32,

    /// Longest utterance kept, in seconds; later audio is dropped
    pub max_utterance: f32,
}

impl Default for OpenAiTranscriptionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com".to_string(),
            model: "whisper-1".to_string(),
            language: Some("en".to_string()),
            timeout_secs: 30,
            partial_interval: 1.0,
            speech_level: 0.01,
            max_utterance: 60.0,
        }
    }
}

impl OpenAiTranscriptionConfig {
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn partial_interval_duration(&self) -> Duration {
        secs(self.partial_interval)
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/audio/transcriptions", self.base_url.trim_end_matches('/'))
    }

    fn key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| RoadcastError::MissingCredential("OPENAI_API_KEY".into()))
    }
}

/// Text fields sent alongside the audio file
pub fn transcription_fields(config: &OpenAiTranscriptionConfig) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("model", config.model.clone()),
        ("response_format", "json".to_string()),
    ];
    if let Some(language) = config.language.as_deref().filter(|l| !l.is_empty()) {
        fields.push(("language", language.to_string()));
    }
    fields
}

/// Build the multipart form for one transcription request
pub fn build_transcription_form(config: &OpenAiTranscriptionConfig, wav: Vec<u8>) -> Result<Form> {
    let file = Part::bytes(wav)
        .file_name("speech.wav")
        .mime_str("audio/wav")
        .map_err(|e| RoadcastError::ConfigError(format!("Invalid audio part: {}", e)))?;

    Ok(transcription_fields(config)
        .into_iter()
        .fold(Form::new(), |form, (name, value)| form.text(name, value))
        .part("file", file))
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Extract the transcript from a JSON transcription response
///
/// An empty transcript is valid: the audio held no recognizable words.
pub fn parse_transcription_response(body: &str) -> Result<String> {
    let response: TranscriptionResponse = serde_json::from_str(body).map_err(|e| {
        RoadcastError::TransportFailure(format!("Malformed transcription response: {}", e))
    })?;
    Ok(response.text.trim().to_string())
}

/// Encode mono samples as 16-bit PCM WAV
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)
            .map_err(|e| RoadcastError::IOError(format!("Failed to create WAV writer: {}", e)))?;
        for &sample in samples {
            let sample_i16 = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| RoadcastError::IOError(format!("Failed to write sample: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| RoadcastError::IOError(format!("Failed to finalize WAV: {}", e)))?;
    }

    Ok(cursor.into_inner())
}

/// Root mean square level of a frame
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Average interleaved channels into mono
pub fn to_mono(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Audio of the current utterance, plus whether it changed since the last request
#[derive(Debug)]
pub struct UtteranceBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    speech_level: f32,
    max_samples: usize,
    fresh_speech: bool,
}

impl UtteranceBuffer {
    pub fn new(sample_rate: u32, config: &OpenAiTranscriptionConfig) -> Self {
        let max_samples = secs(config.max_utterance).as_secs_f32() * sample_rate as f32;
        Self {
            samples: Vec::new(),
            sample_rate,
            speech_level: config.speech_level,
            max_samples: max_samples as usize,
            fresh_speech: false,
        }
    }

    pub fn push(&mut self, frame: &[f32]) {
        let room = self.max_samples.saturating_sub(self.samples.len());
        if room == 0 {
            return;
        }
        if rms(frame) >= self.speech_level {
            self.fresh_speech = true;
        }
        self.samples.extend_from_slice(&frame[..frame.len().min(room)]);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// WAV of the whole utterance when new speech arrived since the last call
    pub fn take_request(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.fresh_speech {
            return Ok(None);
        }
        self.fresh_speech = false;
        encode_wav(&self.samples, self.sample_rate).map(Some)
    }
}

/// HTTP client for the transcription endpoint
#[derive(Clone)]
pub struct OpenAiTranscriptionClient {
    config: OpenAiTranscriptionConfig,
    client: reqwest::Client,
}

impl OpenAiTranscriptionClient {
    pub fn new(config: OpenAiTranscriptionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                RoadcastError::ConfigError(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &OpenAiTranscriptionConfig {
        &self.config
    }

    pub async fn transcribe(&self, wav: Vec<u8>) -> Result<String> {
        let api_key = self.config.key()?;
        let bytes = wav.len();
        let form = build_transcription_form(&self.config, wav)?;

        let response = self
            .client
            .post(self.config.endpoint())
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(error_for_status(status, &body));
        }

        let text = parse_transcription_response(&body)?;
        debug!("Transcribed {} bytes of audio: {:?}", bytes, text);
        Ok(text)
    }
}

#[cfg(feature = "audio-io")]
pub use microphone::MicrophoneRecognizer;

#[cfg(feature = "audio-io")]
mod microphone {
    use super::{OpenAiTranscriptionClient, UtteranceBuffer};
    use crate::speech::capture::{RecognitionEvent, SpeechRecognizer};
    use crate::speech::CancelFlag;
    use crate::{Result, RoadcastError};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::StreamConfig;
    use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};
    use tracing::{debug, error, info, warn};

    /// Recognizer listening on the default input device
    pub struct MicrophoneRecognizer {
        client: OpenAiTranscriptionClient,
        cancel: Option<CancelFlag>,
        worker: Option<JoinHandle<()>>,
    }

    impl MicrophoneRecognizer {
        pub fn new(client: OpenAiTranscriptionClient) -> Self {
            Self {
                client,
                cancel: None,
                worker: None,
            }
        }
    }

    impl SpeechRecognizer for MicrophoneRecognizer {
        fn start(&mut self) -> Result<Receiver<RecognitionEvent>> {
            self.stop();
            self.client.config().key()?;

            let (event_tx, event_rx) = unbounded();
            let cancel = CancelFlag::new();
            let client = self.client.clone();
            let worker_cancel = cancel.clone();

            let worker = thread::Builder::new()
                .name("roadcast-microphone".into())
                .spawn(move || {
                    if let Err(e) = listen(client, &event_tx, &worker_cancel) {
                        if !matches!(e, RoadcastError::Superseded) {
                            error!("Microphone recognition failed: {}", e);
                            let _ = event_tx.send(RecognitionEvent::Error(e.to_string()));
                        }
                    }
                    debug!("Microphone stream closed");
                })
                .map_err(|e| {
                    RoadcastError::DeviceUnavailable(format!("Failed to spawn recognizer: {}", e))
                })?;

            self.cancel = Some(cancel);
            self.worker = Some(worker);
            Ok(event_rx)
        }

        fn stop(&mut self) {
            if let Some(cancel) = self.cancel.take() {
                cancel.cancel();
            }
            if let Some(worker) = self.worker.take() {
                if worker.join().is_err() {
                    warn!("Microphone worker panicked");
                }
            }
        }
    }

    impl Drop for MicrophoneRecognizer {
        fn drop(&mut self) {
            self.stop();
        }
    }

    async fn wait_cancelled(cancel: CancelFlag) {
        while !cancel.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Capture until cancelled, re-transcribing the utterance as speech arrives
    fn listen(
        client: OpenAiTranscriptionClient,
        events: &Sender<RecognitionEvent>,
        cancel: &CancelFlag,
    ) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                RoadcastError::ConfigError(format!("Failed to create tokio runtime: {}", e))
            })?;

        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| RoadcastError::DeviceUnavailable("No input device available".into()))?;
        let config: StreamConfig = device
            .default_input_config()
            .map_err(|e| {
                RoadcastError::DeviceUnavailable(format!("Failed to get input config: {}", e))
            })?
            .into();
        let channels = config.channels as usize;
        let sample_rate = config.sample_rate.0;
        info!(
            "Listening on {} ({} Hz, {} channels)",
            device.name().unwrap_or_else(|_| "Unknown".to_string()),
            sample_rate,
            channels
        );

        let (audio_tx, audio_rx) = bounded::<Vec<f32>>(256);
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Err(e) = audio_tx.try_send(super::to_mono(data, channels)) {
                        debug!("Dropping input frame: {}", e);
                    }
                },
                |err| error!("Audio input stream error: {}", err),
                None,
            )
            .map_err(|e| {
                RoadcastError::DeviceUnavailable(format!("Failed to build input stream: {}", e))
            })?;
        stream.play().map_err(|e| {
            RoadcastError::DeviceUnavailable(format!("Failed to start input stream: {}", e))
        })?;

        let interval = client
            .config()
            .partial_interval_duration()
            .max(Duration::from_millis(250));
        let mut utterance = UtteranceBuffer::new(sample_rate, client.config());
        let mut next_request = Instant::now() + interval;

        while !cancel.is_cancelled() {
            match audio_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(frame) => utterance.push(&frame),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RoadcastError::DeviceUnavailable("Input stream closed".into()));
                }
            }

            if Instant::now() < next_request {
                continue;
            }
            next_request = Instant::now() + interval;

            let Some(wav) = utterance.take_request()? else {
                continue;
            };
            let request = client.transcribe(wav);
            let text = runtime.block_on(async {
                tokio::select! {
                    result = request => result,
                    _ = wait_cancelled(cancel.clone()) => Err(RoadcastError::Superseded),
                }
            })?;

            if !text.is_empty() && events.send(RecognitionEvent::Partial(text)).is_err() {
                break;
            }
        }

        drop(stream);
        debug!("Heard {} samples", utterance.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_fields() {
        let config = OpenAiTranscriptionConfig::default();
        assert_eq!(
            transcription_fields(&config),
            vec![
                ("model", "whisper-1".to_string()),
                ("response_format", "json".to_string()),
                ("language", "en".to_string()),
            ]
        );

        let config = OpenAiTranscriptionConfig {
            language: None,
            ..Default::default()
        };
        assert!(transcription_fields(&config)
            .iter()
            .all(|(name, _)| *name != "language"));
        assert!(build_transcription_form(&config, vec![0; 44]).is_ok());
    }

    #[test]
    fn test_endpoint() {
        let config = OpenAiTranscriptionConfig::default().with_base_url("http://localhost:8080/");
        assert_eq!(config.endpoint(), "http://localhost:8080/v1/audio/transcriptions");
    }

    #[test]
    fn test_parse_response() {
        let text = parse_transcription_response(r#"{"text": " Take the next exit. "}"#).unwrap();
        assert_eq!(text, "Take the next exit.");

        assert_eq!(parse_transcription_response(r#"{"text": ""}"#).unwrap(), "");

        let result = parse_transcription_response(r#"{"error": {"message": "bad audio"}}"#);
        assert!(matches!(result, Err(RoadcastError::TransportFailure(_))));
    }

    #[test]
    fn test_wav_encoding() {
        let wav = encode_wav(&[0.0, 0.5, -0.5, 2.0], 16000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0], 0);
        // Out-of-range input is clipped
        assert_eq!(samples[3], i16::MAX);
    }

    #[test]
    fn test_mono_mixdown() {
        let mono = to_mono(&[0.2, 0.4, -1.0, 1.0], 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert_eq!(mono[1], 0.0);
        assert_eq!(to_mono(&[0.1, 0.2], 1), vec![0.1, 0.2]);
        assert!((rms(&[0.5, -0.5]) - 0.5).abs() < 1e-6);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn test_utterance_requests_only_after_new_speech() {
        let config = OpenAiTranscriptionConfig {
            speech_level: 0.1,
            max_utterance: 1.0,
            ..Default::default()
        };
        let mut utterance = UtteranceBuffer::new(100, &config);

        utterance.push(&[0.0; 20]);
        assert!(utterance.take_request().unwrap().is_none());

        utterance.push(&[0.5; 20]);
        assert!(utterance.take_request().unwrap().is_some());
        // Trailing silence does not trigger another request
        utterance.push(&[0.0; 20]);
        assert!(utterance.take_request().unwrap().is_none());

        // Audio beyond one second at 100 Hz is dropped
        utterance.push(&[0.5; 200]);
        assert_eq!(utterance.len(), 100);
    }

    #[tokio::test]
    async fn test_missing_key_is_reported() {
        let client = OpenAiTranscriptionClient::new(OpenAiTranscriptionConfig::default()).unwrap();
        let result = client.transcribe(encode_wav(&[0.0; 16], 16000).unwrap()).await;
        assert!(matches!(result, Err(RoadcastError::MissingCredential(_))));
    }

    #[test]
    fn test_api_key_not_serialized() {
        let config = OpenAiTranscriptionConfig::default().with_api_key("sk-secret");
        let text = toml::to_string(&config).unwrap();
        assert!(!text.contains("sk-secret"));
    }
}
