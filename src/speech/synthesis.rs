//! Speech synthesis with interrupt-on-replace semantics
//!
//! One utterance plays at a time. Replacing or stopping an utterance cancels
//! it and classifies its completion as [`SpeechOutcome::Interrupted`]; only an
//! utterance that ran to its end while still current is
//! [`SpeechOutcome::FinishedNaturally`].

use super::CancelFlag;
use crate::audio::AudioArbiter;
use crate::integration::config::secs;
use crate::state::OperationToken;
use crate::{Result, RoadcastError};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Voice parameters passed to the synthesis backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// Backend voice identifier
    pub voice: String,

    /// BCP-47 language tag
    pub language: String,

    /// Speaking rate (0.5 is the platform default cadence)
    pub rate: f32,

    pub pitch: f32,

    pub volume: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            voice: "nova".to_string(),
            language: "en-US".to_string(),
            rate: 0.48,
            pitch: 1.0,
            volume: 1.0,
        }
    }
}

impl VoiceSettings {
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    pub fn with_rate(mut self, rate: f32) -> Self {
        self.rate = rate;
        self
    }
}

/// Configuration for the synthesis engine
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub voice: VoiceSettings,

    /// Seconds to queue for the audio device before failing the utterance
    pub device_wait: f32,

    /// Maximum queue size for pending commands and events
    pub queue_size: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            voice: VoiceSettings::default(),
            device_wait: 2.0,
            queue_size: 100,
        }
    }
}

impl SynthesisConfig {
    /// Set the voice parameters
    pub fn with_voice(mut self, voice: VoiceSettings) -> Self {
        self.voice = voice;
        self
    }

    /// Set how long to wait for the audio device
    pub fn with_device_wait(mut self, secs: f32) -> Self {
        self.device_wait = secs;
        self
    }

    pub fn device_wait_duration(&self) -> Duration {
        secs(self.device_wait)
    }
}

/// Playable audio produced by a synthesis backend
#[derive(Clone, Debug, PartialEq)]
pub enum SpeechAudio {
    /// Compressed audio (e.g. mp3) to be decoded at playback
    Encoded { bytes: Vec<u8>, format: String },

    /// Raw mono samples
    Samples { samples: Vec<f32>, sample_rate: u32 },

    /// Text rendered by a non-audio backend
    Text(String),
}

impl SpeechAudio {
    pub fn is_empty(&self) -> bool {
        match self {
            SpeechAudio::Encoded { bytes, .. } => bytes.is_empty(),
            SpeechAudio::Samples { samples, .. } => samples.is_empty(),
            SpeechAudio::Text(text) => text.trim().is_empty(),
        }
    }
}

/// Speech synthesis backend
///
/// Both calls block the synthesis worker. `play` must return promptly once
/// `cancel` is set.
pub trait SpeechSynthesizer: Send {
    fn synthesize(
        &mut self,
        text: &str,
        voice: &VoiceSettings,
        cancel: &CancelFlag,
    ) -> Result<SpeechAudio>;

    fn play(&mut self, audio: SpeechAudio, cancel: &CancelFlag) -> Result<()>;
}

/// How an utterance ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpeechOutcome {
    FinishedNaturally,
    Interrupted,
}

/// Commands sent to the synthesis worker
#[derive(Clone, Debug)]
pub enum SynthesisCommand {
    Speak {
        token: OperationToken,
        text: String,
        cancel: CancelFlag,
    },
    Shutdown,
}

/// Events emitted by the synthesis worker
#[derive(Clone, Debug)]
pub enum SynthesisEvent {
    /// Device acquired and playback starting
    Started { token: OperationToken },
    /// Utterance over; the device is already released
    Completed {
        token: OperationToken,
        outcome: SpeechOutcome,
    },
    /// Utterance could not be spoken
    Failed {
        token: OperationToken,
        error: RoadcastError,
    },
    /// Worker has shut down
    Shutdown,
}

struct ActiveSpeech {
    token: OperationToken,
    cancel: CancelFlag,
}

/// Handle to the synthesis worker
pub struct SynthesisEngine {
    command_tx: Sender<SynthesisCommand>,
    event_rx: Receiver<SynthesisEvent>,
    active: Arc<Mutex<Option<ActiveSpeech>>>,
}

impl SynthesisEngine {
    /// Create the engine and its (not yet started) worker
    pub fn new(
        config: SynthesisConfig,
        arbiter: AudioArbiter,
        synthesizer: Box<dyn SpeechSynthesizer>,
    ) -> (Self, SynthesisWorker) {
        let (command_tx, command_rx) = bounded(config.queue_size.max(1));
        let (event_tx, event_rx) = bounded(config.queue_size.max(1));
        let active = Arc::new(Mutex::new(None));

        let engine = Self {
            command_tx,
            event_rx,
            active: Arc::clone(&active),
        };

        let worker = SynthesisWorker {
            config,
            arbiter,
            synthesizer,
            command_rx,
            event_tx,
            active,
        };

        (engine, worker)
    }

    /// Speak `text`, interrupting whatever is currently speaking
    pub fn speak(&self, token: OperationToken, text: impl Into<String>) -> Result<()> {
        let cancel = CancelFlag::new();
        {
            let mut active = self.active.lock();
            if let Some(previous) = active.take() {
                debug!("Utterance {} replaced by {}", previous.token, token);
                previous.cancel.cancel();
            }
            *active = Some(ActiveSpeech {
                token,
                cancel: cancel.clone(),
            });
        }

        self.command_tx
            .send(SynthesisCommand::Speak {
                token,
                text: text.into(),
                cancel,
            })
            .map_err(|e| {
                RoadcastError::ChannelError(format!("Failed to send speak command: {}", e))
            })
    }

    /// Interrupt the current utterance, if any
    pub fn stop(&self) {
        if let Some(previous) = self.active.lock().take() {
            debug!("Utterance {} stopped", previous.token);
            previous.cancel.cancel();
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Stop speaking and shut the worker down
    pub fn shutdown(&self) -> Result<()> {
        self.stop();
        self.command_tx.send(SynthesisCommand::Shutdown).map_err(|e| {
            RoadcastError::ChannelError(format!("Failed to send shutdown command: {}", e))
        })
    }

    /// Get a receiver for events
    pub fn event_receiver(&self) -> Receiver<SynthesisEvent> {
        self.event_rx.clone()
    }
}

/// Worker side of the synthesis engine
pub struct SynthesisWorker {
    config: SynthesisConfig,
    arbiter: AudioArbiter,
    synthesizer: Box<dyn SpeechSynthesizer>,
    command_rx: Receiver<SynthesisCommand>,
    event_tx: Sender<SynthesisEvent>,
    active: Arc<Mutex<Option<ActiveSpeech>>>,
}

impl SynthesisWorker {
    /// Start the worker thread
    pub fn start(self) -> JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    fn run(mut self) {
        info!("Synthesis worker started");

        loop {
            match self.command_rx.recv() {
                Ok(SynthesisCommand::Speak {
                    token,
                    text,
                    cancel,
                }) => {
                    let result = self.speak(token, &text, &cancel);
                    self.finish(token, &cancel, result);
                }

                Ok(SynthesisCommand::Shutdown) => {
                    info!("Synthesis worker shutting down");
                    let _ = self.event_tx.send(SynthesisEvent::Shutdown);
                    break;
                }

                Err(e) => {
                    error!("Synthesis command channel error: {}", e);
                    break;
                }
            }
        }

        info!("Synthesis worker stopped");
    }

    fn speak(&mut self, token: OperationToken, text: &str, cancel: &CancelFlag) -> Result<()> {
        if cancel.is_cancelled() {
            return Ok(());
        }

        debug!(
            "Synthesizing utterance {}: {}",
            token,
            text.chars().take(50).collect::<String>()
        );
        let audio = self
            .synthesizer
            .synthesize(text, &self.config.voice, cancel)?;

        if cancel.is_cancelled() {
            return Ok(());
        }
        if audio.is_empty() {
            return Err(RoadcastError::EmptyResponse(
                "Synthesizer produced no audio".into(),
            ));
        }

        let lease = self
            .arbiter
            .acquire_playback(self.config.device_wait_duration())?;

        self.emit(SynthesisEvent::Started { token });
        let played = self.synthesizer.play(audio, cancel);
        lease.release();

        played
    }

    /// Classify the utterance and report it; the device is already released
    fn finish(&mut self, token: OperationToken, cancel: &CancelFlag, result: Result<()>) {
        let cancelled = {
            let mut active = self.active.lock();
            if active.as_ref().map(|a| a.token) == Some(token) {
                active.take();
            }
            cancel.is_cancelled()
        };

        let event = match result {
            _ if cancelled => SynthesisEvent::Completed {
                token,
                outcome: SpeechOutcome::Interrupted,
            },
            Ok(()) => SynthesisEvent::Completed {
                token,
                outcome: SpeechOutcome::FinishedNaturally,
            },
            Err(error) => {
                warn!("Utterance {} failed: {}", token, error);
                SynthesisEvent::Failed { token, error }
            }
        };

        debug!("Utterance {} done: {:?}", token, event);
        self.emit(event);
    }

    fn emit(&self, event: SynthesisEvent) {
        if self.event_tx.send(event).is_err() {
            error!("Synthesis event channel closed");
        }
    }
}
