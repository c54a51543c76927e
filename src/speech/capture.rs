//! Speech capture with silence-based turn detection
//!
//! The capture worker owns the recognizer backend and holds an
//! [`AudioLease`] for as long as a capture session is open. Each session ends
//! in exactly one [`CaptureEvent::Finalized`], which is emitted only after the
//! lease has been returned to the arbiter.

use crate::audio::{AudioArbiter, AudioLease};
use crate::integration::config::secs;
use crate::state::OperationToken;
use crate::{Result, RoadcastError};
use crossbeam_channel::{at, bounded, select, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Configuration for speech capture
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Seconds of silence after the last new transcript content that end a turn
    pub silence_threshold: f32,

    /// Seconds to wait for any speech before giving up on the turn
    pub no_speech_timeout: f32,

    /// Seconds to queue for the audio device before reporting it unavailable
    pub device_wait: f32,

    /// Capacity of the command and event channels
    pub queue_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            silence_threshold: 2.0,
            no_speech_timeout: 30.0,
            device_wait: 1.0,
            queue_size: 100,
        }
    }
}

impl CaptureConfig {
    /// Set the silence threshold in seconds
    pub fn with_silence_threshold(mut self, secs: f32) -> Self {
        self.silence_threshold = secs;
        self
    }

    /// Set the no-speech timeout in seconds
    pub fn with_no_speech_timeout(mut self, secs: f32) -> Self {
        self.no_speech_timeout = secs;
        self
    }

    /// Set how long to wait for the audio device
    pub fn with_device_wait(mut self, secs: f32) -> Self {
        self.device_wait = secs;
        self
    }

    pub fn silence_duration(&self) -> Duration {
        secs(self.silence_threshold)
    }

    pub fn no_speech_duration(&self) -> Duration {
        secs(self.no_speech_timeout)
    }

    pub fn device_wait_duration(&self) -> Duration {
        secs(self.device_wait)
    }
}

/// Output of a speech recognition backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Best transcript so far for the current utterance (cumulative)
    Partial(String),
    /// Backend decided the utterance is complete
    Final(String),
    /// Backend failed; the stream is over
    Error(String),
}

/// Speech recognition backend
///
/// `start` opens a recognition stream and returns its event receiver; the
/// stream ends when the sender is dropped. `stop` must make the backend drop
/// its sender soon after.
pub trait SpeechRecognizer: Send {
    fn start(&mut self) -> Result<Receiver<RecognitionEvent>>;

    fn stop(&mut self);
}

/// Silence deadline tracking for one capture session
#[derive(Clone, Debug)]
pub struct TurnDetector {
    silence: Duration,
    no_speech: Duration,
    started_at: Instant,
    last_activity: Option<Instant>,
    transcript: String,
}

impl TurnDetector {
    pub fn new(silence: Duration, no_speech: Duration, now: Instant) -> Self {
        Self {
            silence,
            no_speech,
            started_at: now,
            last_activity: None,
            transcript: String::new(),
        }
    }

    /// Record a transcript update. Returns true when it carried new content,
    /// which resets the silence deadline.
    pub fn observe(&mut self, text: &str, now: Instant) -> bool {
        let text = text.trim();
        if text.is_empty() || text == self.transcript {
            return false;
        }

        self.transcript = text.to_string();
        self.last_activity = Some(now);
        true
    }

    /// Instant at which the turn is considered over
    pub fn deadline(&self) -> Instant {
        match self.last_activity {
            Some(last) => last + self.silence,
            None => self.started_at + self.no_speech,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    pub fn heard_speech(&self) -> bool {
        self.last_activity.is_some()
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn into_transcript(self) -> String {
        self.transcript
    }
}

/// Why a capture session ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalizeReason {
    /// Silence threshold elapsed after speech
    Silence,
    /// No speech at all before the no-speech timeout
    NoSpeech,
    /// `stop_capture` was called
    Stopped,
    /// Recognition stream ended on its own
    StreamEnded,
    /// Recognition stream reported an error
    StreamError(String),
    /// The device or the recognizer could not be started
    DeviceUnavailable(String),
    /// A new capture was requested while this one was running
    Restarted,
    /// Engine shut down
    Shutdown,
}

/// Result of one capture session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalizedTranscript {
    pub text: String,
    pub reason: FinalizeReason,
}

impl FinalizedTranscript {
    pub fn new(text: impl Into<String>, reason: FinalizeReason) -> Self {
        Self {
            text: text.into(),
            reason,
        }
    }

    pub fn empty(reason: FinalizeReason) -> Self {
        Self::new(String::new(), reason)
    }

    /// Whether the session produced no usable utterance
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Commands sent to the capture worker
#[derive(Clone, Debug)]
pub enum CaptureCommand {
    /// Open a capture session tagged with `token`
    Start(OperationToken),
    /// Finalize the running session immediately
    Stop,
    /// Shutdown the worker
    Shutdown,
}

/// Events emitted by the capture worker
#[derive(Clone, Debug)]
pub enum CaptureEvent {
    /// Device acquired and recognition running
    Started { token: OperationToken },
    /// New transcript content
    Partial { token: OperationToken, text: String },
    /// Session over; the device is already released
    Finalized {
        token: OperationToken,
        transcript: FinalizedTranscript,
    },
    /// Worker has shut down
    Shutdown,
}

/// Handle to the capture worker
pub struct CaptureEngine {
    command_tx: Sender<CaptureCommand>,
    event_rx: Receiver<CaptureEvent>,
}

impl CaptureEngine {
    /// Create the engine and its (not yet started) worker
    pub fn new(
        config: CaptureConfig,
        arbiter: AudioArbiter,
        recognizer: Box<dyn SpeechRecognizer>,
    ) -> (Self, CaptureWorker) {
        let (command_tx, command_rx) = bounded(config.queue_size.max(1));
        let (event_tx, event_rx) = bounded(config.queue_size.max(1));

        let engine = Self {
            command_tx,
            event_rx,
        };

        let worker = CaptureWorker {
            config,
            arbiter,
            recognizer,
            command_rx,
            event_tx,
        };

        (engine, worker)
    }

    /// Begin capturing; a running session is finalized first
    pub fn start_capture(&self, token: OperationToken) -> Result<()> {
        self.send_command(CaptureCommand::Start(token))
    }

    /// Force immediate finalization of the running session
    pub fn stop_capture(&self) -> Result<()> {
        self.send_command(CaptureCommand::Stop)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send_command(CaptureCommand::Shutdown)
    }

    /// Get a receiver for events
    pub fn event_receiver(&self) -> Receiver<CaptureEvent> {
        self.event_rx.clone()
    }

    fn send_command(&self, cmd: CaptureCommand) -> Result<()> {
        self.command_tx.send(cmd).map_err(|e| {
            RoadcastError::ChannelError(format!("Failed to send capture command: {}", e))
        })
    }
}

struct ActiveCapture {
    token: OperationToken,
    lease: AudioLease,
    recognition_rx: Receiver<RecognitionEvent>,
    detector: TurnDetector,
}

enum Step {
    Command(CaptureCommand),
    Recognition(RecognitionEvent),
    StreamClosed,
    Deadline,
}

/// Worker side of the capture engine
pub struct CaptureWorker {
    config: CaptureConfig,
    arbiter: AudioArbiter,
    recognizer: Box<dyn SpeechRecognizer>,
    command_rx: Receiver<CaptureCommand>,
    event_tx: Sender<CaptureEvent>,
}

impl CaptureWorker {
    /// Start the worker thread
    pub fn start(self) -> JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    fn run(mut self) {
        info!("Capture worker started");
        let mut session: Option<ActiveCapture> = None;

        loop {
            let step = match session.as_ref() {
                None => match self.command_rx.recv() {
                    Ok(cmd) => Step::Command(cmd),
                    Err(_) => Step::Command(CaptureCommand::Shutdown),
                },
                Some(active) => {
                    let deadline = at(active.detector.deadline());
                    select! {
                        recv(self.command_rx) -> msg => match msg {
                            Ok(cmd) => Step::Command(cmd),
                            Err(_) => Step::Command(CaptureCommand::Shutdown),
                        },
                        recv(active.recognition_rx) -> msg => match msg {
                            Ok(event) => Step::Recognition(event),
                            Err(_) => Step::StreamClosed,
                        },
                        recv(deadline) -> _ => Step::Deadline,
                    }
                }
            };

            match step {
                Step::Command(CaptureCommand::Start(token)) => {
                    if let Some(active) = session.take() {
                        debug!("Capture restart requested while {} is running", active.token);
                        self.finalize(active, FinalizeReason::Restarted);
                    }
                    session = self.begin(token);
                }

                Step::Command(CaptureCommand::Stop) => match session.take() {
                    Some(active) => self.finalize(active, FinalizeReason::Stopped),
                    None => debug!("Stop requested with no capture running"),
                },

                Step::Command(CaptureCommand::Shutdown) => {
                    if let Some(active) = session.take() {
                        self.finalize(active, FinalizeReason::Shutdown);
                    }
                    info!("Capture worker shutting down");
                    let _ = self.event_tx.send(CaptureEvent::Shutdown);
                    break;
                }

                Step::Recognition(event) => {
                    let Some(mut active) = session.take() else {
                        continue;
                    };

                    match event {
                        RecognitionEvent::Partial(text) => {
                            if active.detector.observe(&text, Instant::now()) {
                                let text = active.detector.transcript().to_string();
                                self.emit(CaptureEvent::Partial {
                                    token: active.token,
                                    text,
                                });
                            }
                            session = Some(active);
                        }
                        RecognitionEvent::Final(text) => {
                            active.detector.observe(&text, Instant::now());
                            self.finalize(active, FinalizeReason::StreamEnded);
                        }
                        RecognitionEvent::Error(e) => {
                            warn!("Recognition stream error: {}", e);
                            self.finalize(active, FinalizeReason::StreamError(e));
                        }
                    }
                }

                Step::StreamClosed => {
                    if let Some(active) = session.take() {
                        debug!("Recognition stream closed before the silence deadline");
                        self.finalize(active, FinalizeReason::StreamEnded);
                    }
                }

                Step::Deadline => {
                    let expired = session
                        .as_ref()
                        .map(|active| active.detector.is_expired(Instant::now()))
                        .unwrap_or(false);

                    if expired {
                        if let Some(active) = session.take() {
                            let reason = if active.detector.heard_speech() {
                                FinalizeReason::Silence
                            } else {
                                FinalizeReason::NoSpeech
                            };
                            self.finalize(active, reason);
                        }
                    }
                }
            }
        }

        info!("Capture worker stopped");
    }

    fn begin(&mut self, token: OperationToken) -> Option<ActiveCapture> {
        let lease = match self.arbiter.acquire_capture(self.config.device_wait_duration()) {
            Ok(lease) => lease,
            Err(e) => {
                warn!("Capture could not acquire the audio device: {}", e);
                self.emit(CaptureEvent::Finalized {
                    token,
                    transcript: FinalizedTranscript::empty(FinalizeReason::DeviceUnavailable(
                        e.to_string(),
                    )),
                });
                return None;
            }
        };

        let recognition_rx = match self.recognizer.start() {
            Ok(rx) => rx,
            Err(e) => {
                warn!("Recognizer failed to start: {}", e);
                lease.release();
                self.emit(CaptureEvent::Finalized {
                    token,
                    transcript: FinalizedTranscript::empty(FinalizeReason::DeviceUnavailable(
                        e.to_string(),
                    )),
                });
                return None;
            }
        };

        debug!("Capture {} started", token);
        self.emit(CaptureEvent::Started { token });

        Some(ActiveCapture {
            token,
            lease,
            recognition_rx,
            detector: TurnDetector::new(
                self.config.silence_duration(),
                self.config.no_speech_duration(),
                Instant::now(),
            ),
        })
    }

    fn finalize(&mut self, active: ActiveCapture, reason: FinalizeReason) {
        let ActiveCapture {
            token,
            lease,
            recognition_rx,
            detector,
        } = active;

        self.recognizer.stop();
        drop(recognition_rx);
        lease.release();

        let transcript = FinalizedTranscript::new(detector.into_transcript(), reason);
        debug!(
            "Capture {} finalized ({:?}): {:?}",
            token, transcript.reason, transcript.text
        );
        self.emit(CaptureEvent::Finalized { token, transcript });
    }

    fn emit(&self, event: CaptureEvent) {
        if self.event_tx.send(event).is_err() {
            error!("Capture event channel closed");
        }
    }
}
