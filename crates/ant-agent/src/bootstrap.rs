//! Certificate bootstrap
//!
//! Before it can dial marabunta with mTLS the ant needs a signed
//! certificate:
//! 1. Generate a P-256 key pair locally (the private key never leaves the host)
//! 2. Build a CSR for the agent identity
//! 3. Persist key (0600) and CSR (0644) atomically
//! 4. Submit the CSR to the enrollment endpoint and persist the returned
//!    certificate atomically
//!
//! Bootstrap only runs when the configured certificate or key is missing
//! or unreadable, so it is safe to call on every startup. It never retries
//! internally; [`BootstrapError::is_retryable`] tells the caller whether
//! running it again can help.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::enroll::{EnrollmentClient, EnrollmentError};
use crate::home::{self, AgentHome, StoreError, PRIVATE_FILE_MODE, PUBLIC_FILE_MODE};
use crate::pki::{self, CertificateRequest, PkiError};

/// Bootstrap errors, one variant per failing stage
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Identity, key, CSR or certificate could not be persisted
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// Key generation or CSR encoding failed
    #[error(transparent)]
    Pki(#[from] PkiError),

    /// Submitting the CSR failed or marabunta refused it
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
}

impl BootstrapError {
    /// Whether running the whole bootstrap again may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            BootstrapError::Enrollment(e) => e.is_retryable(),
            BootstrapError::Storage(_) | BootstrapError::Pki(_) => false,
        }
    }
}

/// What a bootstrap run did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Certificate and key were already present, nothing was done
    Skipped,
    /// A new certificate was obtained for this identity
    Enrolled { identity: String },
    /// Shutdown was requested before a certificate was obtained
    Cancelled,
}

/// True unless both `cert_path` and `key_path` are readable files
pub fn needs_bootstrap(cert_path: &Path, key_path: &Path) -> bool {
    !home::is_readable_file(cert_path) || !home::is_readable_file(key_path)
}

/// Obtains and persists the agent's signed certificate
pub struct CertificateBootstrapper {
    home: AgentHome,
    cert_path: PathBuf,
    key_path: PathBuf,
    enrollment: EnrollmentClient,
}

impl CertificateBootstrapper {
    /// Bootstrap into `cert_path`/`key_path`; identity and CSR live in `home`
    pub fn new(
        home: AgentHome,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        enrollment: EnrollmentClient,
    ) -> Self {
        Self {
            home,
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            enrollment,
        }
    }

    pub fn needs_bootstrap(&self) -> bool {
        needs_bootstrap(&self.cert_path, &self.key_path)
    }

    /// Run the bootstrap if the certificate or key is missing.
    pub async fn run(&self) -> Result<BootstrapOutcome, BootstrapError> {
        if !self.needs_bootstrap() {
            debug!(
                cert = %self.cert_path.display(),
                key = %self.key_path.display(),
                "Certificate and key present, skipping bootstrap"
            );
            return Ok(BootstrapOutcome::Skipped);
        }

        let identity = self.home.identity()?;
        info!(identity = %identity, url = %self.enrollment.url(), "Bootstrapping agent certificate");

        let key_pair = pki::generate_key_pair()?;
        let request = pki::build_csr(&identity, &key_pair)?;
        self.persist_key_and_csr(&request)?;

        let cert_pem = self
            .enrollment
            .submit(&identity, request.csr_pem())
            .await?;
        home::write_atomic(&self.cert_path, cert_pem.as_bytes(), PUBLIC_FILE_MODE)?;

        info!(
            identity = %identity,
            cert = %self.cert_path.display(),
            "Agent certificate stored"
        );
        Ok(BootstrapOutcome::Enrolled { identity })
    }

    fn persist_key_and_csr(&self, request: &CertificateRequest) -> Result<(), StoreError> {
        home::write_atomic(
            &self.key_path,
            request.private_key_pem().as_bytes(),
            PRIVATE_FILE_MODE,
        )?;
        home::write_atomic(
            &self.home.csr_path(),
            request.csr_pem().as_bytes(),
            PUBLIC_FILE_MODE,
        )?;
        debug!(
            key = %self.key_path.display(),
            csr = %self.home.csr_path().display(),
            "Persisted key and CSR"
        );
        Ok(())
    }
}
