//! Speech capture and synthesis engines
//!
//! This module provides:
//! - Capture engine with silence-based turn detection
//! - Synthesis engine with interrupt-on-replace semantics
//! - Console and OpenAI backends for both sides

pub mod capture;
pub mod console;
pub mod openai;
pub mod synthesis;
pub mod transcription;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// Re-export commonly used types
pub use capture::{
    CaptureCommand, CaptureConfig, CaptureEngine, CaptureEvent, CaptureWorker, FinalizeReason,
    FinalizedTranscript, RecognitionEvent, SpeechRecognizer, TurnDetector,
};
pub use console::{ConsoleRecognizer, ConsoleSynthesizer};
pub use openai::{OpenAiSpeechConfig, OpenAiSpeechSynthesizer};
pub use synthesis::{
    SpeechAudio, SpeechOutcome, SpeechSynthesizer, SynthesisCommand, SynthesisConfig,
    SynthesisEngine, SynthesisEvent, SynthesisWorker, VoiceSettings,
};
#[cfg(feature = "audio-io")]
pub use transcription::MicrophoneRecognizer;
pub use transcription::{OpenAiTranscriptionClient, OpenAiTranscriptionConfig};

/// Shared cancellation signal checked by long-running backend calls
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
