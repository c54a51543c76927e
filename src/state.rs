//! Conversation state machine
//!
//! `ConversationState` holds the phase, the turn log and the single pending
//! operation. Every transition is a plain method that mutates the state and
//! returns the [`Effect`]s the orchestrator must carry out, which keeps the
//! turn-taking rules testable without threads or devices.
//!
//! Any asynchronous result carries the [`OperationToken`] it was started
//! with. Results whose token no longer matches the pending operation are
//! superseded and dropped.

use crate::integration::config::{Greeting, RetryPolicy, RoadcastConfig};
use crate::llm::prompts::build_system_instruction;
use crate::llm::ReplyRequest;
use crate::messages::{Speaker, Turn, TurnLog};
use crate::speech::{FinalizedTranscript, SpeechOutcome};
use crate::{Result, RoadcastError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Turn-taking phase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    /// No session
    #[default]
    Idle,
    /// Opening line being prepared or spoken
    Greeting,
    /// Microphone open, waiting for the driver
    Listening,
    /// Waiting for the reply service
    Thinking,
    /// Reply being spoken
    Speaking,
    /// Session held; device released
    Paused,
    /// Session failed; `start()` is the only way out
    Error,
}

impl Phase {
    /// Whether a session is running (not idle, paused or failed)
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Phase::Greeting | Phase::Listening | Phase::Thinking | Phase::Speaking
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle => write!(f, "Idle"),
            Phase::Greeting => write!(f, "Greeting"),
            Phase::Listening => write!(f, "Listening"),
            Phase::Thinking => write!(f, "Thinking"),
            Phase::Speaking => write!(f, "Speaking"),
            Phase::Paused => write!(f, "Paused"),
            Phase::Error => write!(f, "Error"),
        }
    }
}

/// Identity of one asynchronous operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationToken(u64);

impl OperationToken {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for OperationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Capture,
    Generation,
    Synthesis,
    /// Timer between steps (settle, re-listen, retry backoff)
    Delay,
}

/// The one operation the conversation is currently waiting on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingOperation {
    pub kind: OperationKind,
    pub token: OperationToken,
    /// Reply attempt number this operation belongs to (1-based)
    pub attempt: u32,
}

/// What to do when a scheduled delay fires
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerAction {
    /// Open the microphone
    Listen,
    /// Re-issue the failed reply request
    RetryReply,
}

/// Side effects requested by a transition
#[derive(Clone, Debug)]
pub enum Effect {
    StartCapture(OperationToken),
    StopCapture,
    RequestReply {
        token: OperationToken,
        request: ReplyRequest,
    },
    CancelReply,
    Speak {
        token: OperationToken,
        text: String,
    },
    StopSpeaking,
    Schedule {
        token: OperationToken,
        delay: Duration,
        action: TimerAction,
    },
    CancelTimer,
    Emit(ConversationEvent),
}

/// Notifications for the presentation layer
#[derive(Clone, Debug, PartialEq)]
pub enum ConversationEvent {
    PhaseChanged(Phase),
    /// Live transcript of the current capture
    Transcript(String),
    TurnAppended(Turn),
    Error(String),
    Shutdown,
}

/// Timing and content rules for a conversation
#[derive(Clone, Debug, PartialEq)]
pub struct TurnPolicy {
    pub greeting: Greeting,
    pub system_instruction: String,
    /// Settle delay after speech before the microphone opens
    pub post_speech_delay: Duration,
    /// Delay before listening again after an empty turn
    pub relisten_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for TurnPolicy {
    fn default() -> Self {
        Self::from_config(&RoadcastConfig::default())
    }
}

impl TurnPolicy {
    pub fn from_config(config: &RoadcastConfig) -> Self {
        Self {
            greeting: config.greeting.clone(),
            system_instruction: config.system_instruction.clone(),
            post_speech_delay: config.timing.post_speech_duration(),
            relisten_delay: config.timing.relisten_duration(),
            retry: config.retry.clone(),
        }
    }
}

/// State of the current conversation session
#[derive(Debug)]
pub struct ConversationState {
    phase: Phase,
    log: TurnLog,
    is_active: bool,
    pending: Option<PendingOperation>,
    next_token: u64,
    paused_from: Option<Phase>,
    live_transcript: String,
    error: Option<RoadcastError>,
    session_id: Option<Uuid>,
    started_at: Option<Instant>,
    started_wall: Option<DateTime<Utc>>,
    policy: TurnPolicy,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new(TurnPolicy::default())
    }
}

impl ConversationState {
    pub fn new(policy: TurnPolicy) -> Self {
        Self {
            phase: Phase::Idle,
            log: TurnLog::new(),
            is_active: false,
            pending: None,
            next_token: 0,
            paused_from: None,
            live_transcript: String::new(),
            error: None,
            session_id: None,
            started_at: None,
            started_wall: None,
            policy,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn log(&self) -> &TurnLog {
        &self.log
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn pending(&self) -> Option<PendingOperation> {
        self.pending
    }

    pub fn error(&self) -> Option<&RoadcastError> {
        self.error.as_ref()
    }

    pub fn policy(&self) -> &TurnPolicy {
        &self.policy
    }

    /// Wall-clock time since `start()`
    pub fn elapsed(&self) -> Duration {
        self.started_at
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Create an immutable snapshot of current state
    pub fn snapshot(&self) -> ConversationSnapshot {
        let pending_kind = self.pending.map(|p| p.kind);
        ConversationSnapshot {
            phase: self.phase,
            turns: self.log.turns().to_vec(),
            is_active: self.is_active,
            is_listening: self.phase == Phase::Listening
                && pending_kind == Some(OperationKind::Capture),
            is_speaking: pending_kind == Some(OperationKind::Synthesis),
            live_transcript: self.live_transcript.clone(),
            error: self.error.clone(),
            session_id: self.session_id,
            started_at: self.started_wall,
            elapsed: self.elapsed(),
        }
    }

    // === Commands ===

    /// Begin a new session from `Idle` or `Error`
    pub fn start(&mut self) -> Vec<Effect> {
        if !matches!(self.phase, Phase::Idle | Phase::Error) {
            debug!("start() ignored in phase {}", self.phase);
            return Vec::new();
        }

        let mut effects = Vec::new();
        self.log.clear();
        self.error = None;
        self.live_transcript.clear();
        self.paused_from = None;
        self.is_active = true;
        self.session_id = Some(Uuid::new_v4());
        self.started_at = Some(Instant::now());
        self.started_wall = Some(Utc::now());

        info!(
            "Conversation {} started",
            self.session_id.map(|id| id.to_string()).unwrap_or_default()
        );

        self.set_phase(Phase::Greeting, &mut effects);
        self.begin_greeting(1, &mut effects);
        effects
    }

    /// Hold the session and release the device; repeated calls are no-ops
    pub fn pause(&mut self) -> Vec<Effect> {
        if !self.phase.is_running() {
            debug!("pause() ignored in phase {}", self.phase);
            return Vec::new();
        }

        let mut effects = Vec::new();
        self.paused_from = Some(self.phase);
        self.cancel_all(&mut effects);
        self.is_active = false;
        self.set_phase(Phase::Paused, &mut effects);
        effects
    }

    /// Continue a paused session
    pub fn resume(&mut self) -> Vec<Effect> {
        if self.phase != Phase::Paused {
            debug!("resume() ignored in phase {}", self.phase);
            return Vec::new();
        }

        let mut effects = Vec::new();
        self.is_active = true;

        let unanswered = self.log.last_speaker() == Some(Speaker::User);
        match self.paused_from.take() {
            Some(Phase::Thinking) if unanswered => self.request_reply(1, &mut effects),
            _ => self.begin_listening(&mut effects),
        }
        effects
    }

    /// End the session; the turn log stays readable until the next `start()`
    pub fn stop(&mut self) -> Vec<Effect> {
        if self.phase == Phase::Idle {
            debug!("stop() ignored, already idle");
            return Vec::new();
        }

        let mut effects = Vec::new();
        self.cancel_all(&mut effects);
        self.is_active = false;
        self.paused_from = None;
        self.set_phase(Phase::Idle, &mut effects);
        info!("Conversation stopped after {} turns", self.log.len());
        effects
    }

    /// Surface `error` and release everything
    pub fn fail(&mut self, error: RoadcastError) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.fail_into(error, &mut effects);
        effects
    }

    // === Results ===

    pub fn on_capture_started(&mut self, token: OperationToken) -> Vec<Effect> {
        if self.is_current(token, OperationKind::Capture) {
            debug!("Capture {} running", token);
        }
        Vec::new()
    }

    pub fn on_partial_transcript(&mut self, token: OperationToken, text: String) -> Vec<Effect> {
        if !self.is_current(token, OperationKind::Capture) {
            return Vec::new();
        }

        self.live_transcript = text.clone();
        vec![Effect::Emit(ConversationEvent::Transcript(text))]
    }

    pub fn on_capture_finished(
        &mut self,
        token: OperationToken,
        transcript: FinalizedTranscript,
    ) -> Vec<Effect> {
        if !self.accept(token, OperationKind::Capture) {
            return Vec::new();
        }

        let mut effects = Vec::new();
        self.pending = None;
        self.live_transcript.clear();

        if transcript.is_empty() {
            debug!("Empty turn ({:?}), listening again", transcript.reason);
            self.schedule(self.policy.relisten_delay, TimerAction::Listen, 1, &mut effects);
            return effects;
        }

        if self.log.last_speaker() == Some(Speaker::User) {
            // Roles must alternate: drop the new words and answer the open turn
            warn!("Driver spoke twice without a reply in between, dropping the second turn");
            self.request_reply(1, &mut effects);
            return effects;
        }

        let turn = Turn::new(Speaker::User, transcript.text.trim());
        self.append(turn, &mut effects);
        self.request_reply(1, &mut effects);
        effects
    }

    pub fn on_reply(&mut self, token: OperationToken, result: Result<String>) -> Vec<Effect> {
        if !self.accept(token, OperationKind::Generation) {
            return Vec::new();
        }

        let attempt = self.pending.map(|p| p.attempt).unwrap_or(1);
        self.pending = None;
        let mut effects = Vec::new();

        match result {
            Ok(reply) => {
                self.append(Turn::new(Speaker::Agent, reply.clone()), &mut effects);
                let token = self.mint(OperationKind::Synthesis, attempt);
                effects.push(Effect::Speak { token, text: reply });
                if self.phase == Phase::Thinking {
                    self.set_phase(Phase::Speaking, &mut effects);
                }
            }

            Err(e) if e.is_recoverable() && attempt < self.policy.retry.max_attempts => {
                let delay = self.policy.retry.backoff(attempt);
                warn!(
                    "Reply attempt {}/{} failed: {}, retrying in {:?}",
                    attempt, self.policy.retry.max_attempts, e, delay
                );
                self.schedule(delay, TimerAction::RetryReply, attempt + 1, &mut effects);
            }

            Err(e) => self.fail_into(e, &mut effects),
        }

        effects
    }

    pub fn on_timer(&mut self, token: OperationToken, action: TimerAction) -> Vec<Effect> {
        if !self.accept(token, OperationKind::Delay) {
            return Vec::new();
        }

        let attempt = self.pending.map(|p| p.attempt).unwrap_or(1);
        self.pending = None;
        let mut effects = Vec::new();

        match action {
            TimerAction::Listen => self.begin_listening(&mut effects),
            TimerAction::RetryReply if self.phase == Phase::Greeting => {
                self.begin_greeting(attempt, &mut effects)
            }
            TimerAction::RetryReply => self.request_reply(attempt, &mut effects),
        }

        effects
    }

    pub fn on_speech_started(&mut self, token: OperationToken) -> Vec<Effect> {
        if self.is_current(token, OperationKind::Synthesis) {
            debug!("Speech {} playing", token);
        }
        Vec::new()
    }

    pub fn on_speech_finished(
        &mut self,
        token: OperationToken,
        outcome: SpeechOutcome,
    ) -> Vec<Effect> {
        if !self.accept(token, OperationKind::Synthesis) {
            return Vec::new();
        }

        self.pending = None;
        let mut effects = Vec::new();

        match outcome {
            SpeechOutcome::FinishedNaturally => {
                self.schedule(
                    self.policy.post_speech_delay,
                    TimerAction::Listen,
                    1,
                    &mut effects,
                );
            }
            SpeechOutcome::Interrupted => {
                info!("Speech interrupted externally, pausing");
                self.paused_from = Some(self.phase);
                self.is_active = false;
                self.set_phase(Phase::Paused, &mut effects);
            }
        }

        effects
    }

    pub fn on_speech_failed(&mut self, token: OperationToken, error: RoadcastError) -> Vec<Effect> {
        if !self.accept(token, OperationKind::Synthesis) {
            return Vec::new();
        }
        self.fail(error)
    }

    // === Internals ===

    fn mint(&mut self, kind: OperationKind, attempt: u32) -> OperationToken {
        self.next_token += 1;
        let token = OperationToken(self.next_token);
        self.pending = Some(PendingOperation {
            kind,
            token,
            attempt,
        });
        token
    }

    fn is_current(&self, token: OperationToken, kind: OperationKind) -> bool {
        matches!(self.pending, Some(p) if p.token == token && p.kind == kind)
    }

    /// Check a result against the pending operation; stale results are dropped
    fn accept(&self, token: OperationToken, kind: OperationKind) -> bool {
        if self.is_current(token, kind) {
            return true;
        }
        debug!(
            "Dropping {:?} result for {}: {}",
            kind,
            token,
            RoadcastError::Superseded
        );
        false
    }

    fn set_phase(&mut self, phase: Phase, effects: &mut Vec<Effect>) {
        if self.phase != phase {
            info!("Phase {} -> {}", self.phase, phase);
            self.phase = phase;
            effects.push(Effect::Emit(ConversationEvent::PhaseChanged(phase)));
        }
    }

    fn append(&mut self, turn: Turn, effects: &mut Vec<Effect>) {
        debug!("{}: {}", turn.role, turn.text);
        self.log.append(turn.clone());
        effects.push(Effect::Emit(ConversationEvent::TurnAppended(turn)));
    }

    fn schedule(
        &mut self,
        delay: Duration,
        action: TimerAction,
        attempt: u32,
        effects: &mut Vec<Effect>,
    ) {
        let token = self.mint(OperationKind::Delay, attempt);
        effects.push(Effect::Schedule {
            token,
            delay,
            action,
        });
    }

    fn cancel_all(&mut self, effects: &mut Vec<Effect>) {
        self.pending = None;
        self.live_transcript.clear();
        effects.extend([
            Effect::CancelTimer,
            Effect::StopCapture,
            Effect::CancelReply,
            Effect::StopSpeaking,
        ]);
    }

    fn fail_into(&mut self, error: RoadcastError, effects: &mut Vec<Effect>) {
        warn!("Conversation failed: {}", error);
        self.cancel_all(effects);
        self.is_active = false;
        self.paused_from = None;
        effects.push(Effect::Emit(ConversationEvent::Error(error.user_message())));
        self.error = Some(error);
        self.set_phase(Phase::Error, effects);
    }

    fn begin_listening(&mut self, effects: &mut Vec<Effect>) {
        let token = self.mint(OperationKind::Capture, 1);
        effects.push(Effect::StartCapture(token));
        self.set_phase(Phase::Listening, effects);
    }

    fn begin_greeting(&mut self, attempt: u32, effects: &mut Vec<Effect>) {
        match self.policy.greeting.clone() {
            Greeting::Fixed(text) => {
                let token = self.mint(OperationKind::Synthesis, attempt);
                effects.push(Effect::Speak { token, text });
            }
            Greeting::Generated(instruction) => {
                let request = ReplyRequest {
                    system_instruction: build_system_instruction(
                        &self.policy.system_instruction,
                        self.elapsed(),
                    ),
                    history: Vec::new(),
                    user_message: instruction,
                    conversation_elapsed: self.elapsed(),
                };
                let token = self.mint(OperationKind::Generation, attempt);
                effects.push(Effect::RequestReply { token, request });
            }
        }
    }

    /// Ask for a reply to the trailing user turn
    fn request_reply(&mut self, attempt: u32, effects: &mut Vec<Effect>) {
        let turns = self.log.turns();
        let Some((last, history)) = turns.split_last() else {
            warn!("No user turn to reply to, listening instead");
            self.begin_listening(effects);
            return;
        };

        let elapsed = self.elapsed();
        let request = ReplyRequest {
            system_instruction: build_system_instruction(&self.policy.system_instruction, elapsed),
            history: history.to_vec(),
            user_message: last.text.clone(),
            conversation_elapsed: elapsed,
        };

        let token = self.mint(OperationKind::Generation, attempt);
        debug!("Reply {} requested (attempt {})", token, attempt);
        effects.push(Effect::RequestReply { token, request });
        self.set_phase(Phase::Thinking, effects);
    }
}

/// Immutable snapshot of the conversation
///
/// Used by the presentation layer without holding locks.
#[derive(Clone, Debug)]
pub struct ConversationSnapshot {
    pub phase: Phase,
    pub turns: Vec<Turn>,
    pub is_active: bool,
    pub is_listening: bool,
    pub is_speaking: bool,
    pub live_transcript: String,
    pub error: Option<RoadcastError>,
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed: Duration,
}

impl ConversationSnapshot {
    /// Human-readable error text, if any
    pub fn error_message(&self) -> Option<String> {
        self.error
            .as_ref()
            .filter(|e| e.is_user_visible())
            .map(|e| e.user_message())
    }
}

/// Thread-safe shared conversation state
#[derive(Clone)]
pub struct SharedConversationState {
    inner: Arc<RwLock<ConversationState>>,
}

impl Default for SharedConversationState {
    fn default() -> Self {
        Self::new(TurnPolicy::default())
    }
}

impl SharedConversationState {
    pub fn new(policy: TurnPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ConversationState::new(policy))),
        }
    }

    /// Get a read lock on the state
    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, ConversationState> {
        self.inner.read()
    }

    /// Get a write lock on the state
    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, ConversationState> {
        self.inner.write()
    }

    /// Get a snapshot of current state (no lock held after return)
    pub fn snapshot(&self) -> ConversationSnapshot {
        self.inner.read().snapshot()
    }

    pub fn phase(&self) -> Phase {
        self.inner.read().phase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::FinalizeReason;

    fn policy() -> TurnPolicy {
        TurnPolicy {
            greeting: Greeting::Fixed("Welcome aboard!".into()),
            system_instruction: "Host the show.".into(),
            post_speech_delay: Duration::from_millis(500),
            relisten_delay: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }

    fn speak_token(effects: &[Effect]) -> OperationToken {
        effects
            .iter()
            .find_map(|e| match e {
                Effect::Speak { token, .. } => Some(*token),
                _ => None,
            })
            .expect("speak effect")
    }

    fn capture_token(effects: &[Effect]) -> OperationToken {
        effects
            .iter()
            .find_map(|e| match e {
                Effect::StartCapture(token) => Some(*token),
                _ => None,
            })
            .expect("capture effect")
    }

    fn reply_token(effects: &[Effect]) -> (OperationToken, ReplyRequest) {
        effects
            .iter()
            .find_map(|e| match e {
                Effect::RequestReply { token, request } => Some((*token, request.clone())),
                _ => None,
            })
            .expect("reply effect")
    }

    fn timer(effects: &[Effect]) -> (OperationToken, Duration, TimerAction) {
        effects
            .iter()
            .find_map(|e| match e {
                Effect::Schedule {
                    token,
                    delay,
                    action,
                } => Some((*token, *delay, *action)),
                _ => None,
            })
            .expect("schedule effect")
    }

    fn heard(text: &str) -> FinalizedTranscript {
        FinalizedTranscript::new(text, FinalizeReason::Silence)
    }

    /// Drive a fresh state to `Listening` and return the capture token
    fn listening(state: &mut ConversationState) -> OperationToken {
        let effects = state.start();
        let greet = speak_token(&effects);
        let effects = state.on_speech_finished(greet, SpeechOutcome::FinishedNaturally);
        let (delay_token, _, action) = timer(&effects);
        assert_eq!(action, TimerAction::Listen);
        capture_token(&state.on_timer(delay_token, action))
    }

    #[test]
    fn test_second_driver_turn_is_refused() {
        let mut state = ConversationState::new(policy());
        let capture = listening(&mut state);
        state.log.append(Turn::new(Speaker::User, "first question"));

        let effects = state.on_capture_finished(capture, heard("second question"));

        let roles: Vec<Speaker> = state.log().turns().iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Speaker::User]);
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::Emit(ConversationEvent::TurnAppended(_)))));

        let (_, request) = reply_token(&effects);
        assert_eq!(request.user_message, "first question");
        assert!(request.history.is_empty());
        assert_eq!(state.phase(), Phase::Thinking);
    }

    #[test]
    fn test_start_speaks_greeting() {
        let mut state = ConversationState::new(policy());
        let effects = state.start();

        assert_eq!(state.phase(), Phase::Greeting);
        assert!(state.is_active());
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Speak { text, .. } if text == "Welcome aboard!"
        )));
        assert!(state.log().is_empty());
        assert!(state.snapshot().session_id.is_some());
    }

    #[test]
    fn test_generated_greeting_is_logged() {
        let mut policy = policy();
        policy.greeting = Greeting::Generated("Say hi".into());
        let mut state = ConversationState::new(policy);

        let (token, request) = reply_token(&state.start());
        assert!(request.history.is_empty());
        assert_eq!(request.user_message, "Say hi");
        assert_eq!(state.phase(), Phase::Greeting);

        let effects = state.on_reply(token, Ok("Hello driver!".into()));
        speak_token(&effects);
        assert_eq!(state.phase(), Phase::Greeting);
        assert_eq!(state.log().last_speaker(), Some(Speaker::Agent));
    }

    #[test]
    fn test_greeting_completion_listens_after_delay() {
        let mut state = ConversationState::new(policy());
        let greet = speak_token(&state.start());

        let effects = state.on_speech_finished(greet, SpeechOutcome::FinishedNaturally);
        let (token, delay, action) = timer(&effects);
        assert_eq!(delay, Duration::from_millis(500));
        assert_eq!(action, TimerAction::Listen);
        assert_eq!(state.phase(), Phase::Greeting);

        let effects = state.on_timer(token, action);
        capture_token(&effects);
        assert_eq!(state.phase(), Phase::Listening);
        assert!(state.snapshot().is_listening);
    }

    #[test]
    fn test_full_turn_alternates() {
        let mut state = ConversationState::new(policy());
        let mut capture = listening(&mut state);

        for round in 0..3 {
            let question = format!("question {}", round);
            let effects = state.on_capture_finished(capture, heard(&question));
            assert_eq!(state.phase(), Phase::Thinking);
            let (token, request) = reply_token(&effects);
            assert_eq!(request.user_message, question);
            assert_eq!(request.history.len(), round * 2);

            let effects = state.on_reply(token, Ok(format!("answer {}", round)));
            assert_eq!(state.phase(), Phase::Speaking);
            let speech = speak_token(&effects);

            let effects = state.on_speech_finished(speech, SpeechOutcome::FinishedNaturally);
            assert_eq!(state.phase(), Phase::Speaking);
            let (delay, _, action) = timer(&effects);
            capture = capture_token(&state.on_timer(delay, action));
        }

        let roles: Vec<_> = state.log().turns().iter().map(|t| t.role).collect();
        assert_eq!(roles.len(), 6);
        for pair in roles.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
        assert_eq!(roles[0], Speaker::User);
    }

    #[test]
    fn test_empty_finalization_relistens_without_turn() {
        let mut state = ConversationState::new(policy());
        let capture = listening(&mut state);

        let effects = state.on_capture_finished(
            capture,
            FinalizedTranscript::empty(FinalizeReason::NoSpeech),
        );
        let (token, delay, action) = timer(&effects);
        assert_eq!(delay, Duration::from_secs(1));
        assert_eq!(action, TimerAction::Listen);
        assert!(state.log().is_empty());
        assert_eq!(state.phase(), Phase::Listening);

        capture_token(&state.on_timer(token, action));
    }

    #[test]
    fn test_missing_credential_is_fatal() {
        let mut state = ConversationState::new(policy());
        let capture = listening(&mut state);

        let (token, _) =
            reply_token(&state.on_capture_finished(capture, heard("What's your name?")));
        let effects = state.on_reply(
            token,
            Err(RoadcastError::MissingCredential("OPENAI_API_KEY".into())),
        );

        assert_eq!(state.phase(), Phase::Error);
        assert_eq!(state.log().len(), 1);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Emit(ConversationEvent::Error(_)))));
        assert!(state.snapshot().error_message().is_some());
        assert!(!state.is_active());
    }

    #[test]
    fn test_recoverable_failure_retries_with_backoff() {
        let mut state = ConversationState::new(policy());
        let capture = listening(&mut state);
        let (mut token, _) = reply_token(&state.on_capture_finished(capture, heard("hi")));

        let mut delays = Vec::new();
        for _ in 0..2 {
            let effects =
                state.on_reply(token, Err(RoadcastError::TransportFailure("down".into())));
            assert_eq!(state.phase(), Phase::Thinking);
            let (timer_token, delay, action) = timer(&effects);
            assert_eq!(action, TimerAction::RetryReply);
            delays.push(delay);
            token = reply_token(&state.on_timer(timer_token, action)).0;
        }
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);

        // Third failure exhausts the default three attempts
        state.on_reply(token, Err(RoadcastError::EmptyResponse("blank".into())));
        assert_eq!(state.phase(), Phase::Error);
        assert_eq!(state.log().len(), 1);
    }

    #[test]
    fn test_retry_then_success() {
        let mut state = ConversationState::new(policy());
        let capture = listening(&mut state);
        let (token, _) = reply_token(&state.on_capture_finished(capture, heard("hi")));

        let effects = state.on_reply(token, Err(RoadcastError::TransportFailure("503".into())));
        let (timer_token, _, action) = timer(&effects);
        let (token, _) = reply_token(&state.on_timer(timer_token, action));

        speak_token(&state.on_reply(token, Ok("there you are".into())));
        assert_eq!(state.phase(), Phase::Speaking);
        assert_eq!(state.log().len(), 2);
    }

    #[test]
    fn test_stop_during_thinking_drops_late_reply() {
        let mut state = ConversationState::new(policy());
        let capture = listening(&mut state);
        let (token, _) = reply_token(&state.on_capture_finished(capture, heard("tell me a joke")));

        let effects = state.stop();
        assert!(effects.iter().any(|e| matches!(e, Effect::CancelReply)));
        assert_eq!(state.phase(), Phase::Idle);

        let effects = state.on_reply(token, Ok("late joke".into()));
        assert!(effects.is_empty());
        assert_eq!(state.log().len(), 1);
        assert_eq!(state.log().last_speaker(), Some(Speaker::User));
    }

    #[test]
    fn test_stop_during_speaking_goes_idle() {
        let mut state = ConversationState::new(policy());
        let capture = listening(&mut state);
        let (token, _) = reply_token(&state.on_capture_finished(capture, heard("go on")));
        let speech = speak_token(&state.on_reply(token, Ok("One. Two. Three.".into())));

        let effects = state.stop();
        assert!(effects.iter().any(|e| matches!(e, Effect::StopSpeaking)));
        assert!(state
            .on_speech_finished(speech, SpeechOutcome::Interrupted)
            .is_empty());
        assert_eq!(state.phase(), Phase::Idle);
    }

    #[test]
    fn test_pause_is_idempotent() {
        let mut state = ConversationState::new(policy());
        listening(&mut state);

        let first = state.pause();
        assert!(!first.is_empty());
        assert_eq!(state.phase(), Phase::Paused);
        let before = state.snapshot();

        let second = state.pause();
        assert!(second.is_empty());
        let after = state.snapshot();
        assert_eq!(before.phase, after.phase);
        assert_eq!(before.is_active, after.is_active);
        assert_eq!(before.turns, after.turns);
    }

    #[test]
    fn test_resume_after_listening_pause() {
        let mut state = ConversationState::new(policy());
        let old_capture = listening(&mut state);
        state.pause();

        let effects = state.resume();
        let capture = capture_token(&effects);
        assert_ne!(capture, old_capture);
        assert_eq!(state.phase(), Phase::Listening);

        // Finalization from the paused capture is stale
        assert!(state
            .on_capture_finished(old_capture, heard("ghost"))
            .is_empty());
        assert!(state.log().is_empty());
    }

    #[test]
    fn test_resume_after_thinking_pause_reissues_request() {
        let mut state = ConversationState::new(policy());
        let capture = listening(&mut state);
        let (old, _) = reply_token(&state.on_capture_finished(capture, heard("still there?")));
        state.pause();

        let (token, request) = reply_token(&state.resume());
        assert_ne!(token, old);
        assert_eq!(request.user_message, "still there?");
        assert_eq!(state.phase(), Phase::Thinking);
    }

    #[test]
    fn test_resume_after_greeting_pause_listens() {
        let mut state = ConversationState::new(policy());
        state.start();
        state.pause();

        capture_token(&state.resume());
        assert_eq!(state.phase(), Phase::Listening);
    }

    #[test]
    fn test_current_interruption_pauses() {
        let mut state = ConversationState::new(policy());
        let greet = speak_token(&state.start());

        state.on_speech_finished(greet, SpeechOutcome::Interrupted);
        assert_eq!(state.phase(), Phase::Paused);
        assert!(!state.is_active());
    }

    #[test]
    fn test_playback_failure_surfaces_error() {
        let mut state = ConversationState::new(policy());
        let greet = speak_token(&state.start());

        state.on_speech_failed(greet, RoadcastError::DeviceUnavailable("no output".into()));
        assert_eq!(state.phase(), Phase::Error);
    }

    #[test]
    fn test_restart_clears_log_and_error() {
        let mut state = ConversationState::new(policy());
        let capture = listening(&mut state);
        let (token, _) = reply_token(&state.on_capture_finished(capture, heard("hello")));
        state.on_reply(token, Err(RoadcastError::MissingCredential("key".into())));
        assert_eq!(state.phase(), Phase::Error);

        state.start();
        assert_eq!(state.phase(), Phase::Greeting);
        assert!(state.log().is_empty());
        assert!(state.error().is_none());
    }

    #[test]
    fn test_partial_transcript_updates_snapshot() {
        let mut state = ConversationState::new(policy());
        let capture = listening(&mut state);

        let effects = state.on_partial_transcript(capture, "turn".into());
        assert_eq!(effects.len(), 1);
        assert_eq!(state.snapshot().live_transcript, "turn");

        let stale = state.on_partial_transcript(OperationToken::new(999), "x".into());
        assert!(stale.is_empty());
    }

    #[test]
    fn test_shared_state_snapshot() {
        let shared = SharedConversationState::new(policy());
        shared.write().start();
        assert_eq!(shared.phase(), Phase::Greeting);
        assert!(shared.snapshot().is_speaking);
    }
}
