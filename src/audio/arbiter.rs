//! Audio resource arbiter
//!
//! The arbiter is the only owner of the shared device mode. Capture and
//! synthesis obtain an [`AudioLease`] before touching the device and give it
//! back through [`AudioLease::release`] (or by dropping it). Two flavours of
//! acquisition are offered:
//! - `try_acquire_*` fails fast when the device is busy or still settling
//! - `acquire_*(wait)` queues for at most `wait`, including the settle gap

use super::session::{AudioSession, NullAudioSession};
use crate::{Result, RoadcastError};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Mode of the shared audio device
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AudioMode {
    /// Nobody holds the device
    #[default]
    Idle,
    /// Microphone is open for speech capture
    Capturing,
    /// Speaker is busy with synthesized speech
    Playing,
}

impl AudioMode {
    pub fn is_idle(&self) -> bool {
        matches!(self, AudioMode::Idle)
    }
}

impl std::fmt::Display for AudioMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioMode::Idle => write!(f, "Idle"),
            AudioMode::Capturing => write!(f, "Capturing"),
            AudioMode::Playing => write!(f, "Playing"),
        }
    }
}

struct ArbiterState {
    mode: AudioMode,
    /// Lease id of the current holder
    holder: Option<u64>,
    next_lease: u64,
    released_at: Option<Instant>,
}

struct ArbiterInner {
    state: Mutex<ArbiterState>,
    changed: Condvar,
    session: Box<dyn AudioSession>,
    settle: Duration,
}

/// Single authority over [`AudioMode`]
#[derive(Clone)]
pub struct AudioArbiter {
    inner: Arc<ArbiterInner>,
}

impl AudioArbiter {
    /// Create an arbiter over `session`, enforcing `settle` between a release
    /// and the next acquisition
    pub fn new(session: impl AudioSession + 'static, settle: Duration) -> Self {
        Self::from_boxed(Box::new(session), settle)
    }

    pub fn from_boxed(session: Box<dyn AudioSession>, settle: Duration) -> Self {
        Self {
            inner: Arc::new(ArbiterInner {
                state: Mutex::new(ArbiterState {
                    mode: AudioMode::Idle,
                    holder: None,
                    next_lease: 1,
                    released_at: None,
                }),
                changed: Condvar::new(),
                session,
                settle,
            }),
        }
    }

    /// Arbiter without real hardware behind it
    pub fn headless(settle: Duration) -> Self {
        Self::new(NullAudioSession, settle)
    }

    /// Current device mode
    pub fn mode(&self) -> AudioMode {
        self.inner.state.lock().mode
    }

    pub fn is_idle(&self) -> bool {
        self.mode().is_idle()
    }

    /// Configured hardware settle gap
    pub fn settle(&self) -> Duration {
        self.inner.settle
    }

    /// Time left before the device may be acquired again
    pub fn settle_remaining(&self) -> Duration {
        let state = self.inner.state.lock();
        self.ready_at(&state)
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Acquire the device for capture, failing immediately if it is not free
    pub fn try_acquire_capture(&self) -> Result<AudioLease> {
        self.acquire(AudioMode::Capturing, Duration::ZERO)
    }

    /// Acquire the device for playback, failing immediately if it is not free
    pub fn try_acquire_playback(&self) -> Result<AudioLease> {
        self.acquire(AudioMode::Playing, Duration::ZERO)
    }

    /// Acquire the device for capture, queueing for at most `wait`
    pub fn acquire_capture(&self, wait: Duration) -> Result<AudioLease> {
        self.acquire(AudioMode::Capturing, wait)
    }

    /// Acquire the device for playback, queueing for at most `wait`
    pub fn acquire_playback(&self, wait: Duration) -> Result<AudioLease> {
        self.acquire(AudioMode::Playing, wait)
    }

    fn ready_at(&self, state: &ArbiterState) -> Option<Instant> {
        state.released_at.map(|at| at + self.inner.settle)
    }

    fn acquire(&self, mode: AudioMode, wait: Duration) -> Result<AudioLease> {
        if mode.is_idle() {
            return Err(RoadcastError::ConfigError(
                "Cannot acquire the device in Idle mode".into(),
            ));
        }

        let deadline = Instant::now() + wait;
        let mut state = self.inner.state.lock();

        loop {
            let now = Instant::now();

            if state.mode.is_idle() {
                match self.ready_at(&state) {
                    Some(ready) if ready > now => {
                        if ready > deadline {
                            return Err(RoadcastError::DeviceUnavailable(format!(
                                "audio device settling for another {:?}",
                                ready - now
                            )));
                        }
                        self.inner.changed.wait_until(&mut state, ready);
                        continue;
                    }
                    _ => {}
                }

                self.inner.session.activate(mode)?;

                let id = state.next_lease;
                state.next_lease += 1;
                state.mode = mode;
                state.holder = Some(id);
                debug!("Audio device acquired for {} (lease {})", mode, id);

                return Ok(AudioLease {
                    arbiter: self.clone(),
                    id,
                    mode,
                    released: false,
                });
            }

            if now >= deadline {
                return Err(RoadcastError::DeviceUnavailable(format!(
                    "audio device busy ({}) while requesting {}",
                    state.mode, mode
                )));
            }

            self.inner.changed.wait_until(&mut state, deadline);
        }
    }

    fn release(&self, id: u64) {
        let mut state = self.inner.state.lock();
        if state.holder != Some(id) {
            warn!("Ignoring release of stale lease {}", id);
            return;
        }

        let mode = state.mode;
        self.inner.session.deactivate(mode);
        state.mode = AudioMode::Idle;
        state.holder = None;
        state.released_at = Some(Instant::now());
        drop(state);

        debug!("Audio device released from {} (lease {})", mode, id);
        self.inner.changed.notify_all();
    }
}

/// Exclusive hold on the shared device
///
/// Dropping the lease releases the device.
pub struct AudioLease {
    arbiter: AudioArbiter,
    id: u64,
    mode: AudioMode,
    released: bool,
}

impl AudioLease {
    pub fn mode(&self) -> AudioMode {
        self.mode
    }

    /// Give the device back; the mode is `Idle` when this returns
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.arbiter.release(self.id);
        }
    }
}

impl Drop for AudioLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for AudioLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioLease")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("released", &self.released)
            .finish()
    }
}
