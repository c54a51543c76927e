//! Console speech backends
//!
//! Typed lines stand in for the microphone and printed text stands in for the
//! speaker, so the whole turn-taking loop can run in a terminal.

use super::capture::{RecognitionEvent, SpeechRecognizer};
use super::synthesis::{SpeechAudio, SpeechSynthesizer, VoiceSettings};
use super::CancelFlag;
use crate::Result;
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Recognizer fed by lines of text
///
/// Each line is replayed word by word as cumulative partial transcripts, the
/// way a streaming recognizer reports speech. One forwarder thread runs per
/// recognition stream, and `stop` waits for it to exit so a line typed
/// between two sessions is never consumed by a stream nobody reads.
pub struct ConsoleRecognizer {
    lines: Receiver<String>,
    word_delay: Duration,
    /// Line taken by a forwarder that was stopped before replaying it
    carried: Arc<Mutex<Option<String>>>,
    stop_tx: Option<Sender<()>>,
    forwarder: Option<JoinHandle<()>>,
}

impl ConsoleRecognizer {
    pub fn new(lines: Receiver<String>) -> Self {
        Self {
            lines,
            word_delay: Duration::from_millis(120),
            carried: Arc::new(Mutex::new(None)),
            stop_tx: None,
            forwarder: None,
        }
    }

    /// Set the delay between replayed words
    pub fn with_word_delay(mut self, delay: Duration) -> Self {
        self.word_delay = delay;
        self
    }
}

/// Replay lines as partials until stopped or either end hangs up
fn forward_lines(
    lines: Receiver<String>,
    carried: Arc<Mutex<Option<String>>>,
    event_tx: Sender<RecognitionEvent>,
    stop_rx: Receiver<()>,
    word_delay: Duration,
) {
    let mut heard = String::new();
    let mut next = carried.lock().take();
    loop {
        let line = match next.take() {
            Some(line) => line,
            None => select! {
                recv(lines) -> line => match line {
                    Ok(line) => line,
                    Err(_) => break,
                },
                recv(stop_rx) -> _ => break,
            },
        };

        // Both were ready and the line won: hand it to the next stream
        if stop_rx.try_recv().is_ok() {
            *carried.lock() = Some(line);
            break;
        }

        for word in line.split_whitespace() {
            if !heard.is_empty() {
                heard.push(' ');
            }
            heard.push_str(word);
            if event_tx.send(RecognitionEvent::Partial(heard.clone())).is_err() {
                return;
            }
            if stop_rx.recv_timeout(word_delay).is_ok() {
                return;
            }
        }
    }
    debug!("Console recognition stream closed");
}

impl SpeechRecognizer for ConsoleRecognizer {
    fn start(&mut self) -> Result<Receiver<RecognitionEvent>> {
        self.stop();

        let (event_tx, event_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let lines = self.lines.clone();
        let carried = Arc::clone(&self.carried);
        let word_delay = self.word_delay;

        let forwarder =
            thread::spawn(move || forward_lines(lines, carried, event_tx, stop_rx, word_delay));

        self.stop_tx = Some(stop_tx);
        self.forwarder = Some(forwarder);
        Ok(event_rx)
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.try_send(());
        }
        if let Some(forwarder) = self.forwarder.take() {
            if forwarder.join().is_err() {
                warn!("Console forwarder panicked");
            }
        }
    }
}

/// Synthesizer that prints replies and simulates their speaking time
pub struct ConsoleSynthesizer {
    words_per_second: f32,
}

impl ConsoleSynthesizer {
    pub fn new(words_per_second: f32) -> Self {
        Self {
            words_per_second: words_per_second.max(0.1),
        }
    }

    fn speaking_time(&self, text: &str) -> Duration {
        let words = text.split_whitespace().count() as f32;
        Duration::from_secs_f32(words / self.words_per_second)
    }
}

impl Default for ConsoleSynthesizer {
    fn default() -> Self {
        Self::new(3.0)
    }
}

impl SpeechSynthesizer for ConsoleSynthesizer {
    fn synthesize(
        &mut self,
        text: &str,
        _voice: &VoiceSettings,
        _cancel: &CancelFlag,
    ) -> Result<SpeechAudio> {
        Ok(SpeechAudio::Text(text.trim().to_string()))
    }

    fn play(&mut self, audio: SpeechAudio, cancel: &CancelFlag) -> Result<()> {
        let text = match audio {
            SpeechAudio::Text(text) => text,
            other => {
                debug!("Console synthesizer cannot render {:?}", other);
                return Ok(());
            }
        };

        println!("Host: {}", text);

        let end = Instant::now() + self.speaking_time(&text);
        while Instant::now() < end {
            if cancel.is_cancelled() {
                println!("  (interrupted)");
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }

        Ok(())
    }
}
