//! Hardware audio session backends
//!
//! An `AudioSession` performs the actual device mode switch. Only the
//! [`AudioArbiter`](super::AudioArbiter) calls into it, from inside its
//! critical section.

use super::AudioMode;
use crate::Result;
use tracing::debug;

/// Platform hook that switches the shared device between capture and playback
pub trait AudioSession: Send + Sync {
    /// Configure the device for `mode` (`Capturing` or `Playing`)
    fn activate(&self, mode: AudioMode) -> Result<()>;

    /// Hand the device back after `mode` ends
    fn deactivate(&self, mode: AudioMode);
}

/// Session for headless hosts and tests: every switch succeeds
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAudioSession;

impl AudioSession for NullAudioSession {
    fn activate(&self, mode: AudioMode) -> Result<()> {
        debug!("Null audio session activated for {}", mode);
        Ok(())
    }

    fn deactivate(&self, mode: AudioMode) {
        debug!("Null audio session deactivated from {}", mode);
    }
}

#[cfg(feature = "audio-io")]
pub use self::cpal_session::CpalAudioSession;

#[cfg(feature = "audio-io")]
mod cpal_session {
    use super::AudioSession;
    use crate::audio::AudioMode;
    use crate::{Result, RoadcastError};
    use cpal::traits::{DeviceTrait, HostTrait};
    use tracing::{debug, info};

    /// Session backed by the default cpal host
    ///
    /// Each activation checks that the default device for the requested
    /// direction exists and reports a usable configuration.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct CpalAudioSession;

    impl CpalAudioSession {
        pub fn new() -> Self {
            Self
        }
    }

    impl AudioSession for CpalAudioSession {
        fn activate(&self, mode: AudioMode) -> Result<()> {
            let host = cpal::default_host();

            match mode {
                AudioMode::Capturing => {
                    let device = host.default_input_device().ok_or_else(|| {
                        RoadcastError::DeviceUnavailable("No input device available".into())
                    })?;
                    let config = device.default_input_config().map_err(|e| {
                        RoadcastError::DeviceUnavailable(format!(
                            "Failed to get input config: {}",
                            e
                        ))
                    })?;
                    info!(
                        "Input device ready: {} ({} Hz)",
                        device.name().unwrap_or_else(|_| "Unknown".to_string()),
                        config.sample_rate().0
                    );
                }
                AudioMode::Playing => {
                    let device = host.default_output_device().ok_or_else(|| {
                        RoadcastError::DeviceUnavailable("No output device available".into())
                    })?;
                    let config = device.default_output_config().map_err(|e| {
                        RoadcastError::DeviceUnavailable(format!(
                            "Failed to get output config: {}",
                            e
                        ))
                    })?;
                    info!(
                        "Output device ready: {} ({} Hz)",
                        device.name().unwrap_or_else(|_| "Unknown".to_string()),
                        config.sample_rate().0
                    );
                }
                AudioMode::Idle => {}
            }

            Ok(())
        }

        fn deactivate(&self, mode: AudioMode) {
            debug!("Audio session released from {}", mode);
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_session_always_succeeds() {
        let session = NullAudioSession;
        assert!(session.activate(AudioMode::Capturing).is_ok());
        session.deactivate(AudioMode::Capturing);
        assert!(session.activate(AudioMode::Playing).is_ok());
        session.deactivate(AudioMode::Playing);
    }
}
