pub mod arbiter;
pub mod session;

pub use arbiter::{AudioArbiter, AudioLease, AudioMode};
#[cfg(feature = "audio-io")]
pub use session::CpalAudioSession;
pub use session::{AudioSession, NullAudioSession};
