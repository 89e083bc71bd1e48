//! Ant - marabunta fleet agent runtime
//!
//! This crate provides everything an ant does after configuration is
//! resolved:
//!
//! - **Identity**: a durable agent identifier in the agent home
//! - **Bootstrap**: key generation, CSR submission and certificate storage
//! - **Secure channel**: mTLS transport with one bidirectional stream
//! - **Event loop**: liveness, Ping/Pulse dispatch and status reports
//! - **Supervisor**: reconnects with backoff until shutdown
//!
//! # Architecture
//!
//! The ant always dials out. Enrollment happens once over HTTPS; afterwards
//! every connection to marabunta is authenticated in both directions.

pub mod bootstrap;
pub mod channel;
pub mod client;
pub mod enroll;
pub mod error;
pub mod events;
pub mod home;
pub mod mtls;
pub mod pki;
pub mod retry;
pub mod settings;
pub mod stream;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use bootstrap::{BootstrapError, BootstrapOutcome, CertificateBootstrapper};
pub use channel::{ChannelError, ConnectReason, ConnectTarget, SecureChannel, Transport};
pub use client::AntClient;
pub use enroll::{EnrollmentClient, EnrollmentError, EnrollmentTrust};
pub use error::{Error, Result};
pub use events::ControllerEvent;
pub use home::{AgentHome, StoreError};
pub use mtls::{install_crypto_provider, AgentCredentials, MtlsError, TrustAnchor};
pub use retry::{retry_with_backoff, Backoff, BackoffConfig};
pub use settings::{AgentSettings, EnrollmentSettings, TlsPaths};
pub use stream::{EventLoop, LoopState, StatusReporter, StreamOutcome};
pub use supervisor::Supervisor;
