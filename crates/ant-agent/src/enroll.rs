//! CSR submission to the marabunta enrollment endpoint
//!
//! The ant POSTs its raw CSR PEM over HTTPS and expects the signed
//! certificate back as a PEM block. Enrollment happens before the ant has
//! any credentials, so the server is verified against an explicitly
//! configured trust anchor. Skipping verification is possible but has to be
//! asked for, and is logged every time it is used.

use std::time::Duration;

use reqwest::header::USER_AGENT;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

use crate::pki;

/// Request timeout for the whole enrollment exchange
pub const ENROLLMENT_TIMEOUT: Duration = Duration::from_secs(10);

/// At most this many bytes of the response body are read
pub const MAX_RESPONSE_BYTES: usize = 4096;

/// Client tag sent with every request, `ant-<identity>`
pub fn client_tag(identity: &str) -> String {
    format!("ant-{}", identity)
}

/// How the enrollment server's certificate is verified
#[derive(Clone)]
pub enum EnrollmentTrust {
    /// Trust only the CA certificates in this PEM bundle
    Anchored(String),
    /// Accept any server certificate (explicit opt-in)
    Insecure,
}

impl std::fmt::Debug for EnrollmentTrust {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnrollmentTrust::Anchored(_) => f.write_str("Anchored"),
            EnrollmentTrust::Insecure => f.write_str("Insecure"),
        }
    }
}

/// Enrollment errors
#[derive(Debug, Error)]
pub enum EnrollmentError {
    /// Neither an enrollment CA nor a TLS CA is configured and insecure
    /// enrollment was not requested
    #[error("no trust anchor configured for enrollment endpoint {url}; set an enrollment CA or explicitly enable insecure enrollment")]
    NoTrustAnchor { url: String },

    /// The configured trust anchor could not be used
    #[error("invalid enrollment trust anchor: {0}")]
    InvalidTrustAnchor(String),

    /// Request could not be sent or the response could not be read
    #[error("enrollment request to {url} failed: {message}")]
    Transport { url: String, message: String },

    /// marabunta answered with something other than 200
    #[error("enrollment rejected by {url} (HTTP {status}): {message}")]
    Rejected {
        url: String,
        status: u16,
        /// Response body, capped at [`MAX_RESPONSE_BYTES`]
        message: String,
    },

    /// 200 response without a usable certificate PEM block
    #[error("invalid enrollment response from {url}: {reason}")]
    Parse { url: String, reason: String },
}

impl EnrollmentError {
    /// Whether running the bootstrap again later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            EnrollmentError::Transport { .. } => true,
            EnrollmentError::Rejected { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// HTTPS client for the enrollment endpoint
#[derive(Clone, Debug)]
pub struct EnrollmentClient {
    url: String,
    http: reqwest::Client,
}

impl EnrollmentClient {
    /// Build a client for `url` that verifies the server according to `trust`
    pub fn new(url: impl Into<String>, trust: &EnrollmentTrust) -> Result<Self, EnrollmentError> {
        let url = url.into();
        let mut builder = reqwest::Client::builder()
            .timeout(ENROLLMENT_TIMEOUT)
            .https_only(true);

        match trust {
            EnrollmentTrust::Anchored(ca_pem) => {
                let blocks = pki::parse_pem_blocks(ca_pem)
                    .map_err(|e| EnrollmentError::InvalidTrustAnchor(e.to_string()))?;
                builder = builder.tls_built_in_root_certs(false);
                for der in blocks {
                    let cert = reqwest::Certificate::from_der(&der)
                        .map_err(|e| EnrollmentError::InvalidTrustAnchor(e.to_string()))?;
                    builder = builder.add_root_certificate(cert);
                }
            }
            EnrollmentTrust::Insecure => {
                warn!(
                    url = %url,
                    "Enrollment server certificate verification is disabled; any server can issue this agent's certificate"
                );
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        let http = builder.build().map_err(|e| {
            EnrollmentError::InvalidTrustAnchor(format!("failed to build HTTP client: {}", e))
        })?;

        Ok(Self { url, http })
    }

    /// Wrap an already configured HTTP client
    #[cfg(test)]
    pub(crate) fn with_http_client(url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            http,
        }
    }

    /// Enrollment endpoint URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Submit `csr_pem` for signing and return the certificate as a
    /// `CERTIFICATE` PEM block.
    ///
    /// Only the first [`MAX_RESPONSE_BYTES`] of the body are read, whatever
    /// length the server announces. A non-200 status yields
    /// [`EnrollmentError::Rejected`] carrying that (capped) body. On 200 the
    /// first PEM block is taken, whatever its label, and must hold an X.509
    /// certificate.
    pub async fn submit(&self, identity: &str, csr_pem: &str) -> Result<String, EnrollmentError> {
        info!(url = %self.url, identity = %identity, "Submitting CSR for signing");

        let mut response = self
            .http
            .post(&self.url)
            .header(USER_AGENT, client_tag(identity))
            .body(csr_pem.as_bytes().to_vec())
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        let status = response.status();
        let body = read_capped(&mut response, MAX_RESPONSE_BYTES)
            .await
            .map_err(|e| self.transport(e))?;

        debug!(url = %self.url, status = %status, bytes = body.len(), "Enrollment response received");

        if status != StatusCode::OK {
            return Err(EnrollmentError::Rejected {
                url: self.url.clone(),
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let der = first_pem_block(&body).ok_or_else(|| self.parse_error("no PEM block in body"))?;
        X509Certificate::from_der(&der)
            .map_err(|e| self.parse_error(&format!("PEM block is not a certificate: {}", e)))?;

        info!(url = %self.url, identity = %identity, "Certificate received from marabunta");
        Ok(pki::encode_certificate_pem(&der))
    }

    fn transport(&self, error: reqwest::Error) -> EnrollmentError {
        let message = if error.is_timeout() {
            format!("timed out after {:?}", ENROLLMENT_TIMEOUT)
        } else {
            error_chain(&error)
        };
        EnrollmentError::Transport {
            url: self.url.clone(),
            message,
        }
    }

    fn parse_error(&self, reason: &str) -> EnrollmentError {
        EnrollmentError::Parse {
            url: self.url.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Read at most `cap` bytes of the body, then stop reading
async fn read_capped(
    response: &mut reqwest::Response,
    cap: usize,
) -> Result<Vec<u8>, reqwest::Error> {
    let mut body = Vec::with_capacity(cap.min(1024));
    while body.len() < cap {
        let Some(chunk) = response.chunk().await? else {
            break;
        };
        let take = chunk.len().min(cap - body.len());
        body.extend_from_slice(&chunk[..take]);
    }
    Ok(body)
}

/// DER contents of the first PEM block in `body`, if any
fn first_pem_block(body: &[u8]) -> Option<Vec<u8>> {
    ::pem::parse(body).ok().map(|block| block.into_contents())
}

/// Render an error and all of its sources on one line
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
