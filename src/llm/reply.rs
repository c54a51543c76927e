//! Reply service contract and worker
//!
//! The worker owns a tokio runtime on its own thread. Each `Generate`
//! command runs as a task that is aborted when a newer request or a
//! `Cancel` arrives, so at most one request is outstanding.

use crate::messages::Turn;
use crate::state::OperationToken;
use crate::{Result, RoadcastError};
use crossbeam_channel::{bounded, Receiver, Sender};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A single chat message as sent to a reply service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Everything a reply service needs for one reply
#[derive(Clone, Debug, PartialEq)]
pub struct ReplyRequest {
    /// Fixed instruction, including the elapsed-time note
    pub system_instruction: String,

    /// Prior turns, oldest first
    pub history: Vec<Turn>,

    /// The new user utterance
    pub user_message: String,

    /// Wall-clock time since the conversation started
    pub conversation_elapsed: Duration,
}

impl ReplyRequest {
    /// Flatten into system, history and user messages
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::new("system", &self.system_instruction));
        messages.extend(
            self.history
                .iter()
                .map(|turn| ChatMessage::new(turn.role.as_role(), &turn.text)),
        );
        messages.push(ChatMessage::new("user", &self.user_message));
        messages
    }
}

/// Text generation backend
///
/// Implementations return `MissingCredential`, `TransportFailure` or
/// `EmptyResponse` on failure.
pub trait ReplyService: Send + Sync {
    fn generate_reply<'a>(&'a self, request: &'a ReplyRequest) -> BoxFuture<'a, Result<String>>;
}

/// Commands sent to the reply worker
#[derive(Clone, Debug)]
pub enum ReplyCommand {
    /// Generate a reply; supersedes any request in flight
    Generate {
        token: OperationToken,
        request: ReplyRequest,
    },
    /// Abort the request in flight without reporting it
    Cancel,
    /// Shutdown the worker
    Shutdown,
}

/// Events emitted by the reply worker
#[derive(Clone, Debug)]
pub enum ReplyEvent {
    /// Request finished (successfully or not)
    Completed {
        token: OperationToken,
        result: Result<String>,
    },
    /// Worker has shut down
    Shutdown,
}

/// Handle for interacting with a running reply worker
pub struct ReplyHandle {
    command_tx: Sender<ReplyCommand>,
    event_rx: Receiver<ReplyEvent>,
    worker_handle: Option<JoinHandle<()>>,
}

impl ReplyHandle {
    /// Request a reply tagged with `token`
    pub fn generate(&self, token: OperationToken, request: ReplyRequest) -> Result<()> {
        self.send_command(ReplyCommand::Generate { token, request })
    }

    /// Abort the request in flight
    pub fn cancel(&self) -> Result<()> {
        self.send_command(ReplyCommand::Cancel)
    }

    /// Ask the worker to shut down
    pub fn shutdown(&self) -> Result<()> {
        self.send_command(ReplyCommand::Shutdown)
    }

    /// Get a receiver for events
    pub fn event_receiver(&self) -> Receiver<ReplyEvent> {
        self.event_rx.clone()
    }

    /// Take the worker thread handle for joining
    pub fn take_join_handle(&mut self) -> Option<JoinHandle<()>> {
        self.worker_handle.take()
    }

    fn send_command(&self, cmd: ReplyCommand) -> Result<()> {
        self.command_tx.send(cmd).map_err(|e| {
            RoadcastError::ChannelError(format!("Failed to send reply command: {}", e))
        })
    }
}

/// Spawns the reply worker thread
pub struct ReplyRunner {
    service: Arc<dyn ReplyService>,
    queue_size: usize,
}

impl ReplyRunner {
    pub fn new(service: Arc<dyn ReplyService>) -> Self {
        Self {
            service,
            queue_size: 100,
        }
    }

    /// Set the command/event channel capacity
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size.max(1);
        self
    }

    /// Start the worker thread
    ///
    /// The worker runs in a separate thread with its own tokio runtime.
    pub fn start_worker(self) -> Result<ReplyHandle> {
        let (command_tx, command_rx) = bounded::<ReplyCommand>(self.queue_size);
        let (event_tx, event_rx) = bounded::<ReplyEvent>(self.queue_size);
        let service = self.service;

        let worker_handle = std::thread::Builder::new()
            .name("reply-worker".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Runtime::new() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create tokio runtime: {}", e);
                        let _ = event_tx.send(ReplyEvent::Shutdown);
                        return;
                    }
                };

                runtime.block_on(worker_loop(service, command_rx, event_tx));
            })?;

        Ok(ReplyHandle {
            command_tx,
            event_rx,
            worker_handle: Some(worker_handle),
        })
    }
}

/// Main worker loop: dispatch commands, keep at most one task in flight
async fn worker_loop(
    service: Arc<dyn ReplyService>,
    command_rx: Receiver<ReplyCommand>,
    event_tx: Sender<ReplyEvent>,
) {
    info!("Reply worker started");
    let mut in_flight: Option<(OperationToken, tokio::task::JoinHandle<()>)> = None;

    loop {
        let command = match command_rx.recv() {
            Ok(cmd) => cmd,
            Err(_) => {
                info!("Command channel closed, shutting down");
                break;
            }
        };

        match command {
            ReplyCommand::Generate { token, request } => {
                if let Some((previous, task)) = in_flight.take() {
                    if !task.is_finished() {
                        debug!("Reply {} superseded by {}", previous, token);
                    }
                    task.abort();
                }

                debug!(
                    "Requesting reply {} with {} prior turns",
                    token,
                    request.history.len()
                );

                let service = Arc::clone(&service);
                let event_tx = event_tx.clone();
                let task = tokio::spawn(async move {
                    let result = service
                        .generate_reply(&request)
                        .await
                        .and_then(|reply| {
                            let reply = reply.trim().to_string();
                            if reply.is_empty() {
                                Err(RoadcastError::EmptyResponse("Reply was blank".into()))
                            } else {
                                Ok(reply)
                            }
                        });

                    if let Err(e) = &result {
                        warn!("Reply {} failed: {}", token, e);
                    }
                    if event_tx.send(ReplyEvent::Completed { token, result }).is_err() {
                        error!("Reply event channel closed");
                    }
                });
                in_flight = Some((token, task));
            }

            ReplyCommand::Cancel => {
                if let Some((token, task)) = in_flight.take() {
                    debug!("Reply {} cancelled", token);
                    task.abort();
                }
            }

            ReplyCommand::Shutdown => {
                info!("Received shutdown command");
                break;
            }
        }
    }

    if let Some((_, task)) = in_flight.take() {
        task.abort();
    }
    let _ = event_tx.send(ReplyEvent::Shutdown);
    info!("Reply worker shutdown complete");
}
