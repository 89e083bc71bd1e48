//! Reconnecting supervisor around the event loop
//!
//! Keeps at most one stream open per agent. Closed and failed sessions,
//! as well as retryable connect errors, are retried with jittered
//! exponential backoff. Shutdown ends the supervisor without a retry, and
//! trust failures (bad credentials, unknown CA, wrong server name) stop it
//! with the error.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::channel::{ChannelError, ConnectTarget, SecureChannel, StreamSession};
use crate::retry::{Backoff, BackoffConfig};
use crate::stream::{EventLoop, GrpcStatusReporter, LoopState, StreamOutcome, DEFAULT_UPDATE_TIMEOUT};

/// Supervises the control stream to one marabunta endpoint
pub struct Supervisor {
    channel: SecureChannel,
    target: ConnectTarget,
    connect_timeout: Duration,
    update_timeout: Duration,
    backoff: BackoffConfig,
    state: Arc<RwLock<LoopState>>,
}

impl Supervisor {
    pub fn new(channel: SecureChannel, target: ConnectTarget) -> Self {
        Self {
            channel,
            target,
            connect_timeout: crate::channel::DEFAULT_CONNECT_TIMEOUT,
            update_timeout: DEFAULT_UPDATE_TIMEOUT,
            backoff: BackoffConfig::default(),
            state: Arc::new(RwLock::new(LoopState::Connecting)),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_update_timeout(mut self, timeout: Duration) -> Self {
        self.update_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// State of the current connection attempt
    pub async fn state(&self) -> LoopState {
        *self.state.read().await
    }

    /// Run until `cancel` fires (Ok) or a non-retryable error occurs (Err)
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ChannelError> {
        let mut backoff = Backoff::new(self.backoff.clone());

        loop {
            *self.state.write().await = LoopState::Connecting;

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                session = self.open_session() => Some(session),
            };

            let session = match attempt {
                None => return self.stopped().await,
                Some(Ok(session)) => session,
                Some(Err(e)) if e.is_retryable() => {
                    warn!(endpoint = %self.target, error = %e, "Connection attempt failed");
                    if !self.pause(&mut backoff, &cancel).await {
                        return self.stopped().await;
                    }
                    continue;
                }
                Some(Err(e)) => {
                    *self.state.write().await = LoopState::Failed;
                    error!(endpoint = %self.target, error = %e, "Giving up on marabunta");
                    return Err(e);
                }
            };

            let StreamSession {
                outbound,
                inbound,
                client,
            } = session;
            let reporter = Arc::new(GrpcStatusReporter::new(client, self.update_timeout));
            let event_loop = EventLoop::new(self.channel.identity(), reporter, cancel.clone())
                .with_state(self.state.clone());

            match event_loop.run(inbound, outbound).await {
                StreamOutcome::Cancelled => {
                    info!(endpoint = %self.target, "Stream cancelled, not reconnecting");
                    return Ok(());
                }
                StreamOutcome::Closed => {
                    info!(endpoint = %self.target, "Stream closed, reconnecting");
                }
                StreamOutcome::Failed(status) => {
                    warn!(
                        endpoint = %self.target,
                        code = ?status.code(),
                        message = %status.message(),
                        "Stream failed, reconnecting"
                    );
                }
            }

            // The session reached Streaming: start over from the initial delay
            backoff.reset();
            if !self.pause(&mut backoff, &cancel).await {
                return self.stopped().await;
            }
        }
    }

    async fn open_session(&self) -> Result<StreamSession, ChannelError> {
        let transport = self
            .channel
            .connect(&self.target, self.connect_timeout)
            .await?;
        transport.open_stream().await
    }

    /// Sleep for the next backoff delay; false if shutdown came first
    async fn pause(&self, backoff: &mut Backoff, cancel: &CancellationToken) -> bool {
        let delay = backoff.next_delay();
        info!(delay_ms = delay.as_millis(), "Waiting before reconnecting");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn stopped(&self) -> Result<(), ChannelError> {
        *self.state.write().await = LoopState::Cancelled;
        info!("Supervisor stopped");
        Ok(())
    }
}
