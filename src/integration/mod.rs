//! Integration layer
//!
//! This module wires the capture, reply and synthesis workers into one
//! turn-taking loop and exposes what a host application needs:
//! - Orchestrator and its control handle
//! - Application configuration
//! - Head-unit "now playing" status and remote buttons

pub mod config;
pub mod now_playing;
pub mod orchestrator;

// Re-export main types
pub use config::{
    Greeting, RecognizerBackendKind, RetryPolicy, RoadcastConfig, SpeechBackendKind, TimingConfig,
};
pub use now_playing::{remote_action, NowPlayingInfo, RemoteAction, RemoteCommand, StatusIcon};
pub use orchestrator::{Backends, Orchestrator, OrchestratorCommand, OrchestratorHandle};
