//! Conversation orchestrator
//!
//! Connects all components: Capture -> Reply -> Synthesis -> Capture.
//!
//! A single loop thread owns the engines and applies every asynchronous
//! result to the shared [`ConversationState`] one at a time. Commands from
//! the handle flip the state synchronously on the caller's thread and hand
//! the resulting effects to the loop for execution.

use super::config::RoadcastConfig;
use super::now_playing::{remote_action, NowPlayingInfo, RemoteAction, RemoteCommand};
use crate::audio::{AudioArbiter, AudioMode, AudioSession, NullAudioSession};
use crate::llm::{ReplyEvent, ReplyHandle, ReplyRunner, ReplyService};
use crate::speech::{
    CaptureEngine, CaptureEvent, CaptureWorker, SpeechRecognizer, SpeechSynthesizer,
    SynthesisEngine, SynthesisEvent, SynthesisWorker,
};
use crate::state::{
    ConversationEvent, ConversationSnapshot, ConversationState, Effect, OperationToken, Phase,
    SharedConversationState, TimerAction, TurnPolicy,
};
use crate::{Result, RoadcastError};
use crossbeam_channel::{at, bounded, never, select, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// External collaborators the orchestrator drives
pub struct Backends {
    pub session: Box<dyn AudioSession>,
    pub recognizer: Box<dyn SpeechRecognizer>,
    pub synthesizer: Box<dyn SpeechSynthesizer>,
    pub reply: Arc<dyn ReplyService>,
}

impl Backends {
    /// Backends with a headless audio session
    pub fn new(
        recognizer: impl SpeechRecognizer + 'static,
        synthesizer: impl SpeechSynthesizer + 'static,
        reply: Arc<dyn ReplyService>,
    ) -> Self {
        Self {
            session: Box::new(NullAudioSession),
            recognizer: Box::new(recognizer),
            synthesizer: Box::new(synthesizer),
            reply,
        }
    }

    /// Use a hardware audio session
    pub fn with_session(mut self, session: impl AudioSession + 'static) -> Self {
        self.session = Box::new(session);
        self
    }
}

/// Commands processed by the orchestrator loop
#[derive(Debug)]
pub enum OrchestratorCommand {
    /// Carry out effects of a transition made on the caller's thread
    Execute(Vec<Effect>),
    /// Stop everything and shut the workers down
    Shutdown,
}

/// Handle for controlling the orchestrator from a host or tests
pub struct OrchestratorHandle {
    command_tx: Sender<OrchestratorCommand>,
    event_rx: Receiver<ConversationEvent>,
    state: SharedConversationState,
    arbiter: AudioArbiter,
    /// Keeps transitions and their effect batches in the same order
    gate: Mutex<()>,
}

impl OrchestratorHandle {
    /// Send a command to the orchestrator
    pub fn send_command(&self, cmd: OrchestratorCommand) -> Result<()> {
        self.command_tx
            .send(cmd)
            .map_err(|e| RoadcastError::ChannelError(format!("Failed to send command: {}", e)))
    }

    fn transition(&self, apply: impl FnOnce(&mut ConversationState) -> Vec<Effect>) -> Result<()> {
        let _gate = self.gate.lock();
        let effects = apply(&mut *self.state.write());
        if effects.is_empty() {
            return Ok(());
        }
        self.send_command(OrchestratorCommand::Execute(effects))
    }

    /// Start a new conversation (from `Idle` or `Error`)
    pub fn start(&self) -> Result<()> {
        self.transition(ConversationState::start)
    }

    pub fn pause(&self) -> Result<()> {
        self.transition(ConversationState::pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.transition(ConversationState::resume)
    }

    pub fn stop(&self) -> Result<()> {
        self.transition(ConversationState::stop)
    }

    /// Apply a head-unit remote button
    pub fn remote(&self, command: RemoteCommand) -> Result<()> {
        match remote_action(command, self.state.phase()) {
            RemoteAction::Start => self.start(),
            RemoteAction::Pause => self.pause(),
            RemoteAction::Resume => self.resume(),
            RemoteAction::Stop => self.stop(),
            RemoteAction::Ignore => Ok(()),
        }
    }

    /// Request shutdown
    pub fn shutdown(&self) -> Result<()> {
        self.send_command(OrchestratorCommand::Shutdown)
    }

    /// Get the shared conversation state
    pub fn state(&self) -> &SharedConversationState {
        &self.state
    }

    /// Get a snapshot of the conversation (no lock held after return)
    pub fn snapshot(&self) -> ConversationSnapshot {
        self.state.snapshot()
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Current mode of the shared audio device
    pub fn audio_mode(&self) -> AudioMode {
        self.arbiter.mode()
    }

    /// Status for the head-unit display
    pub fn now_playing(&self) -> NowPlayingInfo {
        NowPlayingInfo::from_snapshot(&self.snapshot())
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv_event(&self) -> Option<ConversationEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Receive an event, waiting at most `timeout`
    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<ConversationEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }
}

/// Main orchestrator that coordinates all workers
pub struct Orchestrator {
    config: RoadcastConfig,
    state: SharedConversationState,
    command_rx: Receiver<OrchestratorCommand>,
    event_tx: Sender<ConversationEvent>,

    // Sub-components (to be started)
    capture: Option<(CaptureEngine, CaptureWorker)>,
    synthesis: Option<(SynthesisEngine, SynthesisWorker)>,
    reply_runner: Option<ReplyRunner>,
}

impl Orchestrator {
    /// Create a new orchestrator
    ///
    /// Returns the orchestrator and a handle for controlling it.
    /// The orchestrator must be started with `start()` to begin processing.
    pub fn new(config: RoadcastConfig, backends: Backends) -> Result<(Self, OrchestratorHandle)> {
        config.validate()?;
        let buffer_size = config.channel_buffer_size;

        let state = SharedConversationState::new(TurnPolicy::from_config(&config));
        let arbiter =
            AudioArbiter::from_boxed(backends.session, config.timing.device_settle_duration());

        let (command_tx, command_rx) = bounded(buffer_size);
        let (event_tx, event_rx) = bounded(buffer_size);

        let capture =
            CaptureEngine::new(config.capture.clone(), arbiter.clone(), backends.recognizer);
        let synthesis =
            SynthesisEngine::new(config.synthesis.clone(), arbiter.clone(), backends.synthesizer);
        let reply_runner = ReplyRunner::new(backends.reply).with_queue_size(buffer_size);

        let handle = OrchestratorHandle {
            command_tx,
            event_rx,
            state: state.clone(),
            arbiter,
            gate: Mutex::new(()),
        };

        let orchestrator = Self {
            config,
            state,
            command_rx,
            event_tx,
            capture: Some(capture),
            synthesis: Some(synthesis),
            reply_runner: Some(reply_runner),
        };

        Ok((orchestrator, handle))
    }

    /// Start the orchestrator and all workers
    ///
    /// This consumes the orchestrator and returns join handles for the worker threads.
    pub fn start(mut self) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        let (capture, capture_worker) = self
            .capture
            .take()
            .ok_or_else(|| RoadcastError::ChannelError("Capture worker already taken".into()))?;
        handles.push(capture_worker.start());
        info!("Capture worker started");

        let (synthesis, synthesis_worker) = self
            .synthesis
            .take()
            .ok_or_else(|| RoadcastError::ChannelError("Synthesis worker already taken".into()))?;
        handles.push(synthesis_worker.start());
        info!("Synthesis worker started");

        let mut reply = self
            .reply_runner
            .take()
            .ok_or_else(|| RoadcastError::ChannelError("Reply runner already taken".into()))?
            .start_worker()?;
        if let Some(join) = reply.take_join_handle() {
            handles.push(join);
        }
        info!("Reply worker started");

        let event_loop = EventLoop {
            state: self.state,
            command_rx: self.command_rx,
            event_tx: self.event_tx,
            capture,
            synthesis,
            reply,
            timer: None,
            shutdown_timeout: self.config.shutdown_timeout(),
        };

        handles.push(thread::spawn(move || event_loop.run()));
        info!("Orchestrator loop started");

        Ok(handles)
    }
}

struct PendingTimer {
    token: OperationToken,
    action: TimerAction,
    deadline: Instant,
}

enum Step {
    Command(OrchestratorCommand),
    Capture(CaptureEvent),
    Synthesis(SynthesisEvent),
    Reply(ReplyEvent),
    Timer,
    CaptureClosed,
    SynthesisClosed,
    ReplyClosed,
}

struct EventLoop {
    state: SharedConversationState,
    command_rx: Receiver<OrchestratorCommand>,
    event_tx: Sender<ConversationEvent>,
    capture: CaptureEngine,
    synthesis: SynthesisEngine,
    reply: ReplyHandle,
    timer: Option<PendingTimer>,
    shutdown_timeout: Duration,
}

impl EventLoop {
    fn run(mut self) {
        info!("Orchestrator main loop starting");

        let mut capture_rx = self.capture.event_receiver();
        let mut synthesis_rx = self.synthesis.event_receiver();
        let mut reply_rx = self.reply.event_receiver();

        loop {
            let timer_rx = match &self.timer {
                Some(timer) => at(timer.deadline),
                None => never(),
            };

            let step = select! {
                recv(self.command_rx) -> cmd => match cmd {
                    Ok(cmd) => Step::Command(cmd),
                    Err(_) => {
                        warn!("Command channel disconnected");
                        Step::Command(OrchestratorCommand::Shutdown)
                    }
                },
                recv(capture_rx) -> event => event.map_or(Step::CaptureClosed, Step::Capture),
                recv(synthesis_rx) -> event => {
                    event.map_or(Step::SynthesisClosed, Step::Synthesis)
                },
                recv(reply_rx) -> event => event.map_or(Step::ReplyClosed, Step::Reply),
                recv(timer_rx) -> _ => Step::Timer,
            };

            match step {
                Step::Command(OrchestratorCommand::Execute(effects)) => self.execute(effects),
                Step::Command(OrchestratorCommand::Shutdown) => {
                    info!("Shutdown requested");
                    self.shutdown();
                    break;
                }

                Step::Capture(event) => self.on_capture_event(event),
                Step::Synthesis(event) => self.on_synthesis_event(event),
                Step::Reply(ReplyEvent::Completed { token, result }) => {
                    let effects = self.state.write().on_reply(token, result);
                    self.execute(effects);
                }

                Step::Timer => {
                    if let Some(timer) = self.timer.take() {
                        debug!("Timer {} fired ({:?})", timer.token, timer.action);
                        let effects = self.state.write().on_timer(timer.token, timer.action);
                        self.execute(effects);
                    }
                }

                Step::CaptureClosed => {
                    capture_rx = never();
                    self.on_worker_lost("Capture");
                }
                Step::SynthesisClosed => {
                    synthesis_rx = never();
                    self.on_worker_lost("Synthesis");
                }
                Step::Reply(ReplyEvent::Shutdown) | Step::ReplyClosed => {
                    reply_rx = never();
                    self.on_worker_lost("Reply");
                }
            }
        }

        info!("Orchestrator stopped");
    }

    fn on_capture_event(&mut self, event: CaptureEvent) {
        let effects = match event {
            CaptureEvent::Started { token } => self.state.write().on_capture_started(token),
            CaptureEvent::Partial { token, text } => {
                self.state.write().on_partial_transcript(token, text)
            }
            CaptureEvent::Finalized { token, transcript } => {
                self.state.write().on_capture_finished(token, transcript)
            }
            CaptureEvent::Shutdown => {
                warn!("Capture worker stopped unexpectedly");
                Vec::new()
            }
        };
        self.execute(effects);
    }

    fn on_synthesis_event(&mut self, event: SynthesisEvent) {
        let effects = match event {
            SynthesisEvent::Started { token } => self.state.write().on_speech_started(token),
            SynthesisEvent::Completed { token, outcome } => {
                self.state.write().on_speech_finished(token, outcome)
            }
            SynthesisEvent::Failed { token, error } => {
                self.state.write().on_speech_failed(token, error)
            }
            SynthesisEvent::Shutdown => {
                warn!("Synthesis worker stopped unexpectedly");
                Vec::new()
            }
        };
        self.execute(effects);
    }

    /// A worker thread is gone; an active conversation cannot continue without it
    fn on_worker_lost(&mut self, worker: &str) {
        error!("{} worker disconnected", worker);
        let effects = {
            let mut state = self.state.write();
            if state.is_active() {
                state.fail(RoadcastError::ChannelError(format!("{} worker stopped", worker)))
            } else {
                Vec::new()
            }
        };
        self.execute(effects);
    }

    /// Whether an operation-starting effect still belongs to the pending operation
    fn is_live(&self, token: OperationToken) -> bool {
        let live = self.state.read().pending().map(|p| p.token) == Some(token);
        if !live {
            debug!("Skipping effect for superseded {}", token);
        }
        live
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            let result = match effect {
                Effect::StartCapture(token) if self.is_live(token) => {
                    self.capture.start_capture(token)
                }
                Effect::RequestReply { token, request } if self.is_live(token) => {
                    self.reply.generate(token, request)
                }
                Effect::Speak { token, text } if self.is_live(token) => {
                    self.synthesis.speak(token, text)
                }
                Effect::Schedule {
                    token,
                    delay,
                    action,
                } if self.is_live(token) => {
                    self.timer = Some(PendingTimer {
                        token,
                        action,
                        deadline: Instant::now() + delay,
                    });
                    Ok(())
                }
                Effect::StartCapture(_)
                | Effect::RequestReply { .. }
                | Effect::Speak { .. }
                | Effect::Schedule { .. } => Ok(()),

                Effect::StopCapture => {
                    if let Err(e) = self.capture.stop_capture() {
                        warn!("Failed to stop capture: {}", e);
                    }
                    Ok(())
                }
                Effect::CancelReply => {
                    if let Err(e) = self.reply.cancel() {
                        warn!("Failed to cancel reply: {}", e);
                    }
                    Ok(())
                }
                Effect::StopSpeaking => {
                    self.synthesis.stop();
                    Ok(())
                }
                Effect::CancelTimer => {
                    self.timer = None;
                    Ok(())
                }
                Effect::Emit(event) => {
                    self.emit(event);
                    Ok(())
                }
            };

            if let Err(e) = result {
                error!("Failed to execute effect: {}", e);
                let effects = self.state.write().fail(e);
                self.execute(effects);
                return;
            }
        }
    }

    fn emit(&self, event: ConversationEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => debug!("Event queue full, dropping {:?}", event),
            Err(TrySendError::Disconnected(_)) => debug!("No event listener"),
        }
    }

    fn shutdown(&mut self) {
        let effects = self.state.write().stop();
        self.execute(effects);

        let _ = self.capture.shutdown();
        let _ = self.synthesis.shutdown();
        let _ = self.reply.shutdown();

        // Wait for shutdown events with timeout
        let capture_rx = self.capture.event_receiver();
        let synthesis_rx = self.synthesis.event_receiver();
        let reply_rx = self.reply.event_receiver();
        let mut capture_done = false;
        let mut synthesis_done = false;
        let mut reply_done = false;

        let deadline = Instant::now() + self.shutdown_timeout;
        while !(capture_done && synthesis_done && reply_done) {
            select! {
                recv(capture_rx) -> event => match event {
                    Ok(CaptureEvent::Shutdown) | Err(_) => {
                        capture_done = true;
                        debug!("Capture shutdown confirmed");
                    }
                    Ok(_) => {}
                },
                recv(synthesis_rx) -> event => match event {
                    Ok(SynthesisEvent::Shutdown) | Err(_) => {
                        synthesis_done = true;
                        debug!("Synthesis shutdown confirmed");
                    }
                    Ok(_) => {}
                },
                recv(reply_rx) -> event => match event {
                    Ok(ReplyEvent::Shutdown) | Err(_) => {
                        reply_done = true;
                        debug!("Reply shutdown confirmed");
                    }
                    Ok(_) => {}
                },
                recv(at(deadline)) -> _ => {
                    warn!("Shutdown timeout reached, forcing exit");
                    break;
                },
            }
        }

        self.emit(ConversationEvent::Shutdown);
        info!("Orchestrator shutdown complete");
    }
}
