//! Roadcast - a hands-free spoken-dialogue companion for drivers
//!
//! The crate drives a listen → think → speak loop over a single shared audio
//! device. Capture and playback are time-shared through an explicit arbiter,
//! and every asynchronous result is matched against an operation token so
//! that stale completions are dropped instead of acted upon.

pub mod audio;
pub mod integration;
pub mod llm;
pub mod messages;
pub mod speech;
pub mod state;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoadcastError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Empty response: {0}")]
    EmptyResponse(String),

    #[error("Missing credential: {0}")]
    MissingCredential(String),

    #[error("Operation superseded")]
    Superseded,

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for RoadcastError {
    fn from(e: std::io::Error) -> Self {
        RoadcastError::IOError(e.to_string())
    }
}

impl RoadcastError {
    /// Check if this error is worth retrying
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Network hiccups and blank replies are typically transient
            RoadcastError::TransportFailure(_) => true,
            RoadcastError::EmptyResponse(_) => true,
            // No key configured, retrying won't help
            RoadcastError::MissingCredential(_) => false,
            RoadcastError::DeviceUnavailable(_) => false,
            RoadcastError::Superseded => false,
            RoadcastError::ChannelError(_) => false,
            RoadcastError::ConfigError(_) => false,
            RoadcastError::IOError(_) => false,
        }
    }

    /// Whether the error should ever reach the presentation layer
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, RoadcastError::Superseded)
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            RoadcastError::DeviceUnavailable(_) => {
                "Audio device unavailable. Please check your microphone/speakers.".to_string()
            }
            RoadcastError::TransportFailure(_) => {
                "Connection error. Please check your network and try again.".to_string()
            }
            RoadcastError::EmptyResponse(_) => {
                "The host had nothing to say. Please try again.".to_string()
            }
            RoadcastError::MissingCredential(_) => {
                "Missing API key. Please configure a key and start again.".to_string()
            }
            RoadcastError::Superseded => String::new(),
            RoadcastError::ChannelError(_) => {
                "Internal communication error. Please restart the application.".to_string()
            }
            RoadcastError::ConfigError(_) => {
                "Configuration error. Please check settings.".to_string()
            }
            RoadcastError::IOError(_) => "File system error occurred.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RoadcastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(RoadcastError::TransportFailure("timeout".into()).is_recoverable());
        assert!(RoadcastError::EmptyResponse("no choices".into()).is_recoverable());
        assert!(!RoadcastError::MissingCredential("OPENAI_API_KEY".into()).is_recoverable());
        assert!(!RoadcastError::DeviceUnavailable("no output".into()).is_recoverable());
    }

    #[test]
    fn test_superseded_is_silent() {
        let err = RoadcastError::Superseded;
        assert!(!err.is_user_visible());
        assert!(err.user_message().is_empty());
        assert!(RoadcastError::TransportFailure("x".into()).is_user_visible());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: RoadcastError = io.into();
        assert!(matches!(err, RoadcastError::IOError(_)));
    }
}
