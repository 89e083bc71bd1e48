//! Error type for the agent runtime
//!
//! Each concern keeps its own error enum; this type wraps them for callers
//! that drive the whole agent.

use thiserror::Error;

use crate::bootstrap::BootstrapError;
use crate::channel::ChannelError;
use crate::enroll::EnrollmentError;
use crate::home::StoreError;
use crate::mtls::MtlsError;

/// Main error type for agent operations
#[derive(Debug, Error)]
pub enum Error {
    /// Agent home or identity persistence failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Certificate bootstrap failed
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),

    /// Enrollment could not be configured
    #[error("enrollment setup failed: {0}")]
    Enrollment(#[from] EnrollmentError),

    /// Certificate, key or CA could not be loaded
    #[error(transparent)]
    Credentials(#[from] MtlsError),

    /// Connecting or streaming to marabunta failed permanently
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl Error {
    /// Whether the failing step may succeed if run again
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Bootstrap(e) => e.is_retryable(),
            Error::Enrollment(e) => e.is_retryable(),
            Error::Channel(e) => e.is_retryable(),
            Error::Store(_) | Error::Credentials(_) => false,
        }
    }
}

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, Error>;
