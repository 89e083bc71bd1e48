//! Event loop for one stream session
//!
//! The loop owns the receive side of the stream. Status reports requested
//! by `Ping` events run on a separate worker fed through a bounded queue,
//! so a slow `Update` call never stalls the receive path.
//!
//! ```text
//!   inbound ──► EventLoop ──try_send──► [queue: 16] ──► update worker ──► Update RPC
//!                  │
//!   outbound ◄─────┘ (liveness message on entry)
//! ```

use std::sync::Arc;
use std::time::Duration;

use ant_proto::{StreamRequest, StreamResponse, UpdateRequest};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::{debug, error, info, warn};

use crate::channel::MarabuntaChannel;
use crate::events::ControllerEvent;

/// Pending status reports before new Pings are dropped
pub const UPDATE_QUEUE_CAPACITY: usize = 16;

/// Default deadline for one Update call
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Event loop state for the current connection attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Connecting,
    Streaming,
    Closed,
    Cancelled,
    Failed,
}

/// How a stream session ended
#[derive(Debug)]
pub enum StreamOutcome {
    /// marabunta ended the stream cleanly
    Closed,
    /// Shutdown was requested, or the transport reported cancellation
    Cancelled,
    /// Transport error
    Failed(Status),
}

impl StreamOutcome {
    fn state(&self) -> LoopState {
        match self {
            StreamOutcome::Closed => LoopState::Closed,
            StreamOutcome::Cancelled => LoopState::Cancelled,
            StreamOutcome::Failed(_) => LoopState::Failed,
        }
    }
}

/// Reports the agent identity back to marabunta
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Returns marabunta's acceptance flag
    async fn update(&self, identity: &str) -> Result<bool, Status>;
}

/// [`StatusReporter`] backed by the Update RPC
pub struct GrpcStatusReporter {
    client: MarabuntaChannel,
    timeout: Duration,
}

impl GrpcStatusReporter {
    pub fn new(client: MarabuntaChannel, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl StatusReporter for GrpcStatusReporter {
    async fn update(&self, identity: &str) -> Result<bool, Status> {
        let mut client = self.client.clone();
        let request = UpdateRequest {
            name: identity.to_string(),
        };
        match tokio::time::timeout(self.timeout, client.update(request)).await {
            Ok(response) => Ok(response?.into_inner().ok),
            Err(_) => Err(Status::deadline_exceeded(format!(
                "update not answered within {:?}",
                self.timeout
            ))),
        }
    }
}

/// Liveness payload: current time, RFC3339 with nanoseconds
pub fn liveness_payload() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Runs the send/receive protocol for one stream session
pub struct EventLoop {
    identity: String,
    reporter: Arc<dyn StatusReporter>,
    cancel: CancellationToken,
    state: Arc<RwLock<LoopState>>,
}

impl EventLoop {
    pub fn new(
        identity: impl Into<String>,
        reporter: Arc<dyn StatusReporter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            identity: identity.into(),
            reporter,
            cancel,
            state: Arc::new(RwLock::new(LoopState::Connecting)),
        }
    }

    /// Share a state cell with the supervisor
    pub fn with_state(mut self, state: Arc<RwLock<LoopState>>) -> Self {
        self.state = state;
        self
    }

    pub async fn state(&self) -> LoopState {
        *self.state.read().await
    }

    /// Run until the stream ends, fails, or shutdown is requested.
    ///
    /// Never reconnects; the outcome tells the caller what happened.
    pub async fn run<S>(&self, mut inbound: S, outbound: mpsc::Sender<StreamRequest>) -> StreamOutcome
    where
        S: Stream<Item = Result<StreamResponse, Status>> + Unpin + Send,
    {
        *self.state.write().await = LoopState::Streaming;

        let liveness = StreamRequest {
            msg: liveness_payload(),
        };
        if let Err(e) = outbound.send(liveness).await {
            warn!(error = %e, "Failed to send liveness message");
        }

        let (updates, worker) = self.spawn_update_worker();

        let outcome = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("Shutdown requested, leaving stream");
                    break StreamOutcome::Cancelled;
                }
                next = inbound.next() => match next {
                    Some(Ok(response)) => self.dispatch(ControllerEvent::from(response), &updates),
                    Some(Err(status)) if status.code() == Code::Cancelled => {
                        info!(status = %status, "Stream cancelled");
                        break StreamOutcome::Cancelled;
                    }
                    Some(Err(status)) => {
                        error!(code = ?status.code(), message = %status.message(), "Stream failed");
                        break StreamOutcome::Failed(status);
                    }
                    None => {
                        info!("Stream closed by marabunta");
                        break StreamOutcome::Closed;
                    }
                },
            }
        };

        drop(updates);
        self.finish_updates(worker, &outcome).await;

        *self.state.write().await = outcome.state();
        outcome
    }

    fn dispatch(&self, event: ControllerEvent, updates: &mpsc::Sender<String>) {
        debug!(kind = event.kind(), "Event received");
        match event {
            ControllerEvent::Ping { message } => {
                info!(message = %message, "Ping received");
                if let Err(e) = updates.try_send(message) {
                    warn!(error = %e, "Update queue full, dropping ping");
                }
            }
            ControllerEvent::Pulse { message } => {
                info!(message = %message, "Pulse received");
            }
            ControllerEvent::Unknown { raw } => {
                warn!(raw = %raw, "Ignoring unknown event");
            }
        }
    }

    fn spawn_update_worker(&self) -> (mpsc::Sender<String>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<String>(UPDATE_QUEUE_CAPACITY);
        let reporter = self.reporter.clone();
        let identity = self.identity.clone();

        let worker = tokio::spawn(async move {
            while let Some(ping) = rx.recv().await {
                match reporter.update(&identity).await {
                    Ok(accepted) => info!(ping = %ping, accepted, "Update response"),
                    Err(status) => {
                        warn!(ping = %ping, code = ?status.code(), message = %status.message(), "Update failed")
                    }
                }
            }
            debug!("Update worker stopped");
        });

        (tx, worker)
    }

    /// Queued reports still go out after a clean close. A failed transport
    /// would only time them out one by one, and shutdown doesn't wait.
    async fn finish_updates(&self, mut worker: JoinHandle<()>, outcome: &StreamOutcome) {
        if !matches!(outcome, StreamOutcome::Closed) {
            worker.abort();
            return;
        }
        tokio::select! {
            _ = &mut worker => {}
            _ = self.cancel.cancelled() => worker.abort(),
        }
    }
}
