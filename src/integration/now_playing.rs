//! Head-unit "now playing" surface
//!
//! Derives the status line shown on a car display from a conversation
//! snapshot and maps the head unit's remote buttons onto orchestrator
//! commands.

use crate::state::{ConversationSnapshot, Phase};
use crate::RoadcastError;

pub const NOW_PLAYING_TITLE: &str = "Podcast Host";
pub const NOW_PLAYING_ARTIST: &str = "AI Host";

/// Icon hint for the status line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusIcon {
    Idle,
    Microphone,
    Thinking,
    Speaker,
    Paused,
    Warning,
}

/// Metadata published to the head unit
#[derive(Clone, Debug, PartialEq)]
pub struct NowPlayingInfo {
    pub title: String,
    pub artist: String,
    pub status: String,
    pub icon: StatusIcon,
    /// 1.0 while a session is running, 0.0 otherwise
    pub playback_rate: f32,
}

impl NowPlayingInfo {
    pub fn from_snapshot(snapshot: &ConversationSnapshot) -> Self {
        let (status, icon) = match snapshot.phase {
            Phase::Greeting => ("Starting conversation...".to_string(), StatusIcon::Speaker),
            Phase::Listening => ("Listening...".to_string(), StatusIcon::Microphone),
            Phase::Thinking => ("AI is thinking...".to_string(), StatusIcon::Thinking),
            Phase::Speaking => ("AI is speaking...".to_string(), StatusIcon::Speaker),
            Phase::Paused => ("Paused".to_string(), StatusIcon::Paused),
            Phase::Idle => ("Conversation ended".to_string(), StatusIcon::Idle),
            Phase::Error => (error_status(snapshot.error.as_ref()), StatusIcon::Warning),
        };

        Self {
            title: NOW_PLAYING_TITLE.to_string(),
            artist: NOW_PLAYING_ARTIST.to_string(),
            status,
            icon,
            playback_rate: if snapshot.phase.is_running() { 1.0 } else { 0.0 },
        }
    }
}

fn error_status(error: Option<&RoadcastError>) -> String {
    match error {
        Some(RoadcastError::MissingCredential(_)) => "Error: Missing API Key".to_string(),
        _ => "Connection error".to_string(),
    }
}

/// Buttons forwarded from the head unit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteCommand {
    Stop,
    TogglePlayPause,
}

/// What the orchestrator should do for a remote button press
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteAction {
    Start,
    Pause,
    Resume,
    Stop,
    Ignore,
}

/// Map a remote button to an action for the current phase
pub fn remote_action(command: RemoteCommand, phase: Phase) -> RemoteAction {
    match command {
        RemoteCommand::Stop if phase == Phase::Idle => RemoteAction::Ignore,
        RemoteCommand::Stop => RemoteAction::Stop,
        RemoteCommand::TogglePlayPause => match phase {
            Phase::Idle | Phase::Error => RemoteAction::Start,
            Phase::Paused => RemoteAction::Resume,
            _ => RemoteAction::Pause,
        },
    }
}
