//! Roadcast - console host
//!
//! Typed lines or the microphone play the driver's voice; the host's replies
//! are printed or spoken depending on the configured speech backend.

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use roadcast::audio::AudioSession;
use roadcast::integration::{
    Backends, Orchestrator, OrchestratorHandle, RecognizerBackendKind, RemoteCommand,
    RoadcastConfig, SpeechBackendKind,
};
use roadcast::llm::OpenAiReplyService;
use roadcast::speech::{
    ConsoleRecognizer, ConsoleSynthesizer, OpenAiSpeechSynthesizer, SpeechRecognizer,
    SpeechSynthesizer,
};
use roadcast::state::ConversationEvent;
use std::io::BufRead;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roadcast=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Roadcast");

    let mut config = match std::env::args().nth(1) {
        Some(path) => RoadcastConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => RoadcastConfig::default(),
    };
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        config = config.with_api_key(key);
    } else {
        warn!("OPENAI_API_KEY is not set; replies will fail");
    }

    let (line_tx, line_rx) = unbounded::<String>();
    let backends = build_backends(&config, line_rx)?;

    let typed_speech = config.recognizer_backend == RecognizerBackendKind::Console;
    let (orchestrator, handle) = Orchestrator::new(config, backends)?;
    let handle = Arc::new(handle);
    let workers = orchestrator.start()?;

    println!("Commands: /start /pause /resume /stop /toggle /quit");
    if typed_speech {
        println!("Anything else is heard as speech while the host is listening.");
    }

    let input_handle = Arc::clone(&handle);
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if let Err(e) = route_line(&input_handle, &line, &line_tx) {
                warn!("Command failed: {}", e);
            }
            if line.trim() == "/quit" {
                return;
            }
        }
        let _ = input_handle.shutdown();
    });

    loop {
        match handle.recv_event_timeout(Duration::from_millis(250)) {
            Some(ConversationEvent::PhaseChanged(_)) => {
                println!("[{}]", handle.now_playing().status);
            }
            Some(ConversationEvent::Error(message)) => println!("! {}", message),
            Some(ConversationEvent::Shutdown) => break,
            Some(_) | None => {}
        }
    }

    for worker in workers {
        let _ = worker.join();
    }

    info!("Roadcast stopped");
    Ok(())
}

fn build_backends(config: &RoadcastConfig, lines: Receiver<String>) -> Result<Backends> {
    let recognizer: Box<dyn SpeechRecognizer> = match config.recognizer_backend {
        RecognizerBackendKind::Console => Box::new(ConsoleRecognizer::new(lines)),
        #[cfg(feature = "audio-io")]
        RecognizerBackendKind::OpenAi => {
            use roadcast::speech::{MicrophoneRecognizer, OpenAiTranscriptionClient};
            let client = OpenAiTranscriptionClient::new(config.transcription.clone())?;
            Box::new(MicrophoneRecognizer::new(client))
        }
        #[cfg(not(feature = "audio-io"))]
        RecognizerBackendKind::OpenAi => {
            anyhow::bail!("The openai recognizer needs the audio-io feature")
        }
    };

    let synthesizer: Box<dyn SpeechSynthesizer> = match config.speech_backend {
        SpeechBackendKind::Console => Box::new(ConsoleSynthesizer::default()),
        SpeechBackendKind::OpenAi => {
            Box::new(OpenAiSpeechSynthesizer::new(config.speech_service.clone())?)
        }
    };
    let reply = Arc::new(OpenAiReplyService::new(config.reply.clone())?);

    #[cfg(feature = "audio-io")]
    let session: Box<dyn AudioSession> = Box::new(roadcast::audio::CpalAudioSession::new());
    #[cfg(not(feature = "audio-io"))]
    let session: Box<dyn AudioSession> = Box::new(roadcast::audio::NullAudioSession);

    let backends = Backends {
        session,
        recognizer,
        synthesizer,
        reply,
    };

    Ok(backends)
}

fn route_line(
    handle: &OrchestratorHandle,
    line: &str,
    speech: &Sender<String>,
) -> roadcast::Result<()> {
    match line.trim() {
        "/start" => handle.start(),
        "/pause" => handle.pause(),
        "/resume" => handle.resume(),
        "/stop" => handle.stop(),
        "/toggle" => handle.remote(RemoteCommand::TogglePlayPause),
        "/quit" => handle.shutdown(),
        "" => Ok(()),
        text => {
            if handle.snapshot().is_listening {
                let _ = speech.send(text.to_string());
            } else {
                println!("(not listening)");
            }
            Ok(())
        }
    }
}
