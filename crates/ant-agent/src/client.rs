//! Agent facade: identity, bootstrap and the supervised stream
//!
//! [`AntClient`] wires the runtime pieces together from [`AgentSettings`]:
//!
//! ```text
//!   AgentHome ──► CertificateBootstrapper ──► SecureChannel ──► Supervisor ──► EventLoop
//! ```

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bootstrap::{self, BootstrapError, BootstrapOutcome, CertificateBootstrapper};
use crate::channel::SecureChannel;
use crate::enroll::EnrollmentClient;
use crate::error::Result;
use crate::home::AgentHome;
use crate::mtls::AgentCredentials;
use crate::retry::retry_with_backoff;
use crate::settings::AgentSettings;
use crate::supervisor::Supervisor;

/// One ant, configured from validated settings
#[derive(Clone, Debug)]
pub struct AntClient {
    settings: AgentSettings,
}

impl AntClient {
    pub fn new(settings: AgentSettings) -> Self {
        Self { settings }
    }

    /// Open (creating if needed) the agent home
    pub fn home(&self) -> Result<AgentHome> {
        Ok(AgentHome::open(&self.settings.home)?)
    }

    /// Stored agent identity, created on first use
    pub fn identity(&self) -> Result<String> {
        Ok(self.home()?.identity()?)
    }

    /// Bootstrapper targeting the configured certificate and key paths
    pub fn bootstrapper(&self) -> Result<CertificateBootstrapper> {
        let trust = self.settings.enrollment_trust()?;
        let enrollment = EnrollmentClient::new(&self.settings.enrollment.url, &trust)?;
        Ok(CertificateBootstrapper::new(
            self.home()?,
            &self.settings.tls.crt,
            &self.settings.tls.key,
            enrollment,
        ))
    }

    /// Obtain a certificate if the configured one is missing.
    ///
    /// Retryable enrollment failures (transport errors, 5xx) are retried
    /// with backoff up to `bootstrap_attempts` times. Cancelling `cancel`
    /// abandons the pending attempt or backoff sleep; a key and CSR left
    /// behind without a certificate are regenerated on the next run.
    pub async fn bootstrap(&self, cancel: &CancellationToken) -> Result<BootstrapOutcome> {
        if !bootstrap::needs_bootstrap(&self.settings.tls.crt, &self.settings.tls.key) {
            return Ok(BootstrapOutcome::Skipped);
        }

        let bootstrapper = self.bootstrapper()?;
        let attempts = retry_with_backoff(
            &self.settings.backoff,
            self.settings.bootstrap_attempts,
            "bootstrap",
            || bootstrapper.run(),
            |e: &BootstrapError| e.is_retryable(),
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Bootstrap cancelled");
                Ok(BootstrapOutcome::Cancelled)
            }
            outcome = attempts => Ok(outcome?),
        }
    }

    /// Load credentials, then stream to marabunta until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let identity = self.identity()?;
        let credentials = AgentCredentials::load(
            &self.settings.tls.crt,
            &self.settings.tls.key,
            self.settings.stream_ca(),
        )?;
        let channel = SecureChannel::new(&identity, &credentials, &self.settings.server_name)?;

        info!(
            identity = %identity,
            endpoint = %self.settings.grpc_target(),
            server_name = %self.settings.server_name,
            "Starting ant"
        );

        Supervisor::new(channel, self.settings.grpc_target())
            .with_connect_timeout(self.settings.connect_timeout)
            .with_update_timeout(self.settings.update_timeout)
            .with_backoff(self.settings.backoff.clone())
            .run(cancel)
            .await?;
        Ok(())
    }
}
