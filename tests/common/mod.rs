//! Shared fakes for integration tests
//!
//! Recognizer, synthesizer and reply service stand-ins that run the real
//! engines without audio hardware or network access.

#![allow(dead_code)]

use crossbeam_channel::{unbounded, Receiver, Sender};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use roadcast::audio::{AudioMode, AudioSession};
use roadcast::integration::{
    Backends, Greeting, Orchestrator, OrchestratorHandle, RetryPolicy, RoadcastConfig,
    TimingConfig,
};
use roadcast::llm::{ReplyRequest, ReplyService};
use roadcast::speech::{
    CancelFlag, CaptureConfig, RecognitionEvent, SpeechAudio, SpeechRecognizer, SpeechSynthesizer,
    VoiceSettings,
};
use roadcast::{Result, RoadcastError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const GREETING: &str = "Welcome aboard.";

/// Tight timings so a full exchange takes well under a second
pub fn fast_config() -> RoadcastConfig {
    RoadcastConfig::default()
        .with_capture(
            CaptureConfig::default()
                .with_silence_threshold(0.15)
                .with_no_speech_timeout(5.0),
        )
        .with_timing(TimingConfig {
            device_settle: 0.01,
            post_speech_delay: 0.05,
            relisten_delay: 0.05,
        })
        .with_retry(RetryPolicy {
            max_attempts: 3,
            initial_backoff: 0.05,
            multiplier: 2.0,
            max_backoff: 0.2,
        })
        .with_greeting(Greeting::Fixed(GREETING.to_string()))
        .with_shutdown_timeout(2000)
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Device switches observed by the audio session
#[derive(Debug, Default)]
pub struct SessionLog {
    pub active: Option<AudioMode>,
    pub activations: Vec<AudioMode>,
    /// Activations that happened while another mode was still active
    pub overlaps: usize,
}

#[derive(Clone, Default)]
pub struct RecordingSession {
    pub log: Arc<Mutex<SessionLog>>,
}

impl AudioSession for RecordingSession {
    fn activate(&self, mode: AudioMode) -> Result<()> {
        let mut log = self.log.lock();
        if log.active.is_some() {
            log.overlaps += 1;
        }
        log.active = Some(mode);
        log.activations.push(mode);
        Ok(())
    }

    fn deactivate(&self, _mode: AudioMode) {
        self.log.lock().active = None;
    }
}

/// Recognizer that "hears" one scripted utterance per capture session
///
/// An empty utterance (or an exhausted script) keeps the stream open without
/// producing any speech.
pub struct ScriptedRecognizer {
    script: Arc<Mutex<VecDeque<String>>>,
    starts: Arc<AtomicUsize>,
    current: Option<Sender<RecognitionEvent>>,
}

impl ScriptedRecognizer {
    pub fn new(utterances: &[&str]) -> Self {
        Self {
            script: Arc::new(Mutex::new(
                utterances.iter().map(|u| u.to_string()).collect(),
            )),
            starts: Arc::new(AtomicUsize::new(0)),
            current: None,
        }
    }

    pub fn starts(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.starts)
    }
}

impl SpeechRecognizer for ScriptedRecognizer {
    fn start(&mut self) -> Result<Receiver<RecognitionEvent>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = unbounded();

        let utterance = self.script.lock().pop_front().unwrap_or_default();
        let mut heard = String::new();
        for word in utterance.split_whitespace() {
            if !heard.is_empty() {
                heard.push(' ');
            }
            heard.push_str(word);
            let _ = tx.send(RecognitionEvent::Partial(heard.clone()));
        }

        self.current = Some(tx);
        Ok(rx)
    }

    fn stop(&mut self) {
        self.current = None;
    }
}

/// Synthesizer that records what it was asked to say and "plays" for a
/// fixed time, honouring cancellation
pub struct FakeSynthesizer {
    pub spoken: Arc<Mutex<Vec<String>>>,
    duration: Duration,
}

impl FakeSynthesizer {
    pub fn new(duration: Duration) -> Self {
        Self {
            spoken: Arc::new(Mutex::new(Vec::new())),
            duration,
        }
    }
}

impl SpeechSynthesizer for FakeSynthesizer {
    fn synthesize(
        &mut self,
        text: &str,
        _voice: &VoiceSettings,
        _cancel: &CancelFlag,
    ) -> Result<SpeechAudio> {
        self.spoken.lock().push(text.to_string());
        Ok(SpeechAudio::Text(text.to_string()))
    }

    fn play(&mut self, _audio: SpeechAudio, cancel: &CancelFlag) -> Result<()> {
        let end = Instant::now() + self.duration;
        while Instant::now() < end && !cancel.is_cancelled() {
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

/// Reply service answering from a queue; an empty queue echoes the driver
pub struct FakeReplyService {
    replies: Mutex<VecDeque<Result<String>>>,
    delay: Duration,
    pub requests: Mutex<Vec<ReplyRequest>>,
}

impl FakeReplyService {
    pub fn new(replies: Vec<Result<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            delay: Duration::from_millis(20),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl ReplyService for FakeReplyService {
    fn generate_reply<'a>(&'a self, request: &'a ReplyRequest) -> BoxFuture<'a, Result<String>> {
        async move {
            self.requests.lock().push(request.clone());
            let reply = self
                .replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(format!("You said: {}", request.user_message)));
            tokio::time::sleep(self.delay).await;
            reply
        }
        .boxed()
    }
}

pub fn transport_failure() -> Result<String> {
    Err(RoadcastError::TransportFailure("connection reset".into()))
}

/// A running orchestrator wired to the fakes
pub struct Harness {
    pub handle: OrchestratorHandle,
    pub replies: Arc<FakeReplyService>,
    pub spoken: Arc<Mutex<Vec<String>>>,
    pub capture_starts: Arc<AtomicUsize>,
    pub session: Arc<Mutex<SessionLog>>,
    workers: Vec<JoinHandle<()>>,
}

impl Harness {
    pub fn spawn(
        config: RoadcastConfig,
        utterances: &[&str],
        replies: FakeReplyService,
        speaking_time: Duration,
    ) -> Self {
        let recognizer = ScriptedRecognizer::new(utterances);
        let capture_starts = recognizer.starts();
        let synthesizer = FakeSynthesizer::new(speaking_time);
        let spoken = Arc::clone(&synthesizer.spoken);
        let replies = Arc::new(replies);
        let session = RecordingSession::default();
        let session_log = Arc::clone(&session.log);

        let backends = Backends::new(
            recognizer,
            synthesizer,
            Arc::clone(&replies) as Arc<dyn ReplyService>,
        )
        .with_session(session);

        let (orchestrator, handle) = Orchestrator::new(config, backends).unwrap();
        let workers = orchestrator.start().unwrap();

        Self {
            handle,
            replies,
            spoken,
            capture_starts,
            session: session_log,
            workers,
        }
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().clone()
    }

    pub fn shutdown(self) {
        self.handle.shutdown().unwrap();
        for worker in self.workers {
            worker.join().unwrap();
        }
    }
}
