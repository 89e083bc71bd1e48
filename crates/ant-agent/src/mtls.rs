//! mTLS credentials for the marabunta connection
//!
//! The ant authenticates with the certificate obtained during bootstrap and
//! verifies marabunta against a trust anchor: either an explicit CA bundle
//! or, when none is configured, the last certificate of the client
//! certificate file (bundle-as-chain).

use std::path::{Path, PathBuf};

use rcgen::{KeyPair, PublicKeyData};
use thiserror::Error;
use tonic::transport::{Certificate, ClientTlsConfig, Identity};
use tracing::debug;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::pki;

/// Credential errors
#[derive(Debug, Error)]
pub enum MtlsError {
    /// A credential file could not be read
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The credentials can't be used to authenticate this agent
    #[error("invalid credentials in {}: {reason}", path.display())]
    InvalidCredentials { path: PathBuf, reason: String },
}

/// Where the trust anchor came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnchorSource {
    /// An explicitly configured CA bundle
    Bundle(PathBuf),
    /// The last certificate of the client certificate file
    CertificateChain(PathBuf),
}

/// CA certificates marabunta's server certificate must chain to
#[derive(Clone, Debug)]
pub struct TrustAnchor {
    pem: String,
    source: AnchorSource,
}

impl TrustAnchor {
    /// Use every certificate in `pem` as a trust anchor
    pub fn bundle(pem: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, MtlsError> {
        let path = path.into();
        let pem = pem.into();
        pki::parse_pem_blocks(&pem).map_err(|e| MtlsError::InvalidCredentials {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            pem,
            source: AnchorSource::Bundle(path),
        })
    }

    /// Use the last certificate of a concatenated client certificate file.
    ///
    /// A file holding only the leaf has no CA to anchor on, so it is
    /// rejected instead of trusting the leaf for itself.
    pub fn from_chain(cert_chain_pem: &str, path: impl Into<PathBuf>) -> Result<Self, MtlsError> {
        let path = path.into();
        let mut blocks =
            pki::parse_pem_blocks(cert_chain_pem).map_err(|e| MtlsError::InvalidCredentials {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if blocks.len() < 2 {
            return Err(MtlsError::InvalidCredentials {
                path,
                reason: "no CA certificate after the client certificate; configure tls.ca \
                         (or enrollment.ca) with marabunta's CA"
                    .to_string(),
            });
        }
        let last = blocks.pop().ok_or_else(|| MtlsError::InvalidCredentials {
            path: path.clone(),
            reason: "no certificate in chain".to_string(),
        })?;
        Ok(Self {
            pem: pki::encode_certificate_pem(&last),
            source: AnchorSource::CertificateChain(path),
        })
    }

    /// Anchor certificates as PEM
    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn source(&self) -> &AnchorSource {
        &self.source
    }
}

/// Client certificate, private key and trust anchor for one agent
#[derive(Clone)]
pub struct AgentCredentials {
    cert_pem: String,
    key_pem: Zeroizing<String>,
    trust: TrustAnchor,
    cert_path: PathBuf,
}

impl AgentCredentials {
    /// Assemble credentials from PEM strings already in memory
    pub fn new(
        cert_pem: String,
        key_pem: Zeroizing<String>,
        trust: TrustAnchor,
        cert_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cert_pem,
            key_pem,
            trust,
            cert_path: cert_path.into(),
        }
    }

    /// Load credentials from disk.
    ///
    /// Without `ca_path` the trust anchor is the last certificate of
    /// `cert_path`.
    pub fn load(cert_path: &Path, key_path: &Path, ca_path: Option<&Path>) -> Result<Self, MtlsError> {
        let cert_pem = read(cert_path)?;
        let key_pem = Zeroizing::new(read(key_path)?);
        let trust = match ca_path {
            Some(ca_path) => TrustAnchor::bundle(read(ca_path)?, ca_path)?,
            None => TrustAnchor::from_chain(&cert_pem, cert_path)?,
        };
        debug!(
            cert = %cert_path.display(),
            anchor = ?trust.source(),
            "Loaded agent credentials"
        );
        Ok(Self::new(cert_pem, key_pem, trust, cert_path))
    }

    pub fn trust(&self) -> &TrustAnchor {
        &self.trust
    }

    /// Check the leaf certificate before using it.
    ///
    /// The leaf must be signed by one of the trust anchors, be inside its
    /// validity window, carry `identity` as CommonName and hold the public
    /// half of the stored private key.
    pub fn verify(&self, identity: &str) -> Result<(), MtlsError> {
        let leaf_der = pki::parse_pem_blocks(&self.cert_pem)
            .map_err(|e| self.invalid(e.to_string()))?
            .remove(0);
        let (_, leaf) = X509Certificate::from_der(&leaf_der)
            .map_err(|e| self.invalid(format!("failed to parse certificate: {}", e)))?;

        let anchors = pki::parse_pem_blocks(self.trust.pem())
            .map_err(|e| self.invalid(format!("trust anchor: {}", e)))?;
        let signed_by_anchor = anchors.iter().any(|anchor_der| {
            X509Certificate::from_der(anchor_der)
                .map(|(_, anchor)| leaf.verify_signature(Some(anchor.public_key())).is_ok())
                .unwrap_or(false)
        });
        if !signed_by_anchor {
            return Err(self.invalid("certificate is not signed by the trust anchor"));
        }

        let now = chrono::Utc::now().timestamp();
        if now < leaf.validity().not_before.timestamp() {
            return Err(self.invalid("certificate not yet valid"));
        }
        if now > leaf.validity().not_after.timestamp() {
            return Err(self.invalid("certificate expired"));
        }

        let cn = leaf
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("");
        if cn != identity {
            return Err(self.invalid(format!(
                "certificate subject {:?} does not match agent identity {:?}",
                cn, identity
            )));
        }

        let key_pair = KeyPair::from_pem(&self.key_pem)
            .map_err(|e| self.invalid(format!("failed to parse private key: {}", e)))?;
        if key_pair.subject_public_key_info() != leaf.public_key().raw {
            return Err(self.invalid("private key does not match certificate"));
        }

        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> MtlsError {
        MtlsError::InvalidCredentials {
            path: self.cert_path.clone(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Debug for AgentCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCredentials")
            .field("cert_path", &self.cert_path)
            .field("trust", &self.trust.source())
            .finish_non_exhaustive()
    }
}

/// Build a tonic client TLS config presenting `credentials` and verifying
/// the server against the trust anchor under `server_name`, regardless of
/// the address dialed.
pub fn build_tls_config(credentials: &AgentCredentials, server_name: &str) -> ClientTlsConfig {
    let identity = Identity::from_pem(&credentials.cert_pem, credentials.key_pem.as_bytes());
    let ca_cert = Certificate::from_pem(credentials.trust.pem());

    ClientTlsConfig::new()
        .identity(identity)
        .ca_certificate(ca_cert)
        .domain_name(server_name)
}

/// Install the process-wide rustls crypto provider (ok if already installed)
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn read(path: &Path) -> Result<String, MtlsError> {
    std::fs::read_to_string(path).map_err(|source| MtlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestCa;

    fn credentials(ca: &TestCa, cert: String, key: String) -> AgentCredentials {
        let trust = TrustAnchor::bundle(ca.cert_pem(), "/etc/ant/ca.crt").unwrap();
        AgentCredentials::new(cert, Zeroizing::new(key), trust, "/etc/ant/ant.crt")
    }

    #[test]
    fn issued_certificate_verifies_against_its_ca() {
        let ca = TestCa::new("marabunta test CA");
        let (cert, key) = ca.issue_client("agent-42");

        assert!(credentials(&ca, cert, key).verify("agent-42").is_ok());
    }

    #[test]
    fn certificate_from_another_ca_is_rejected() {
        let ca = TestCa::new("marabunta test CA");
        let rogue = TestCa::new("rogue CA");
        let (cert, key) = rogue.issue_client("agent-42");

        let err = credentials(&ca, cert, key).verify("agent-42").unwrap_err();
        assert!(err.to_string().contains("not signed by the trust anchor"));
    }

    #[test]
    fn subject_must_match_identity() {
        let ca = TestCa::new("marabunta test CA");
        let (cert, key) = ca.issue_client("agent-42");

        let err = credentials(&ca, cert, key).verify("agent-43").unwrap_err();
        assert!(matches!(err, MtlsError::InvalidCredentials { .. }));
        assert!(err.to_string().contains("agent-43"));
    }

    #[test]
    fn expired_certificate_is_rejected() {
        let ca = TestCa::new("marabunta test CA");
        let key_pair = pki::generate_key_pair().unwrap();
        let request = pki::build_csr("agent-42", &key_pair).unwrap();
        let cert = ca.sign_csr_expired(request.csr_pem());

        let err = credentials(&ca, cert, request.private_key_pem().to_string())
            .verify("agent-42")
            .unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn mismatched_key_is_rejected() {
        let ca = TestCa::new("marabunta test CA");
        let (cert, _) = ca.issue_client("agent-42");
        let (_, other_key) = ca.issue_client("agent-42");

        let err = credentials(&ca, cert, other_key)
            .verify("agent-42")
            .unwrap_err();
        assert!(err.to_string().contains("private key does not match"));
    }

    #[test]
    fn chain_mode_trusts_the_last_certificate() {
        let ca = TestCa::new("marabunta test CA");
        let (cert, key) = ca.issue_client("agent-42");
        let chain = format!("{}{}", cert, ca.cert_pem());

        let trust = TrustAnchor::from_chain(&chain, "/etc/ant/ant.crt").unwrap();
        assert_eq!(
            trust.source(),
            &AnchorSource::CertificateChain(PathBuf::from("/etc/ant/ant.crt"))
        );
        assert_eq!(
            pki::parse_pem_blocks(trust.pem()).unwrap(),
            pki::parse_pem_blocks(ca.cert_pem()).unwrap()
        );

        let creds = AgentCredentials::new(chain, Zeroizing::new(key), trust, "/etc/ant/ant.crt");
        assert!(creds.verify("agent-42").is_ok());
    }

    #[test]
    fn load_reads_files_and_falls_back_to_chain() {
        let dir = tempfile::tempdir().unwrap();
        let ca = TestCa::new("marabunta test CA");
        let (cert, key) = ca.issue_client("agent-42");
        let cert_path = dir.path().join("ant.crt");
        let key_path = dir.path().join("ant.key");
        let ca_path = dir.path().join("ca.crt");
        std::fs::write(&cert_path, format!("{}{}", cert, ca.cert_pem())).unwrap();
        std::fs::write(&key_path, &key).unwrap();
        std::fs::write(&ca_path, ca.cert_pem()).unwrap();

        let with_ca = AgentCredentials::load(&cert_path, &key_path, Some(&ca_path)).unwrap();
        assert_eq!(
            with_ca.trust().source(),
            &AnchorSource::Bundle(ca_path.clone())
        );
        assert!(with_ca.verify("agent-42").is_ok());

        let chained = AgentCredentials::load(&cert_path, &key_path, None).unwrap();
        assert!(matches!(
            chained.trust().source(),
            AnchorSource::CertificateChain(_)
        ));
        assert!(chained.verify("agent-42").is_ok());
    }

    #[test]
    fn leaf_only_chain_asks_for_a_ca() {
        let ca = TestCa::new("marabunta test CA");
        let (cert, _key) = ca.issue_client("agent-42");

        let err = TrustAnchor::from_chain(&cert, "/etc/ant/ant.crt").unwrap_err();
        assert!(matches!(err, MtlsError::InvalidCredentials { .. }));
        assert!(err.to_string().contains("tls.ca"));
    }

    #[test]
    fn missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.crt");

        let err = AgentCredentials::load(&missing, &missing, None).unwrap_err();
        assert!(matches!(err, MtlsError::Read { .. }));
        assert!(err.to_string().contains("nope.crt"));
    }

    #[test]
    fn debug_output_hides_key_material() {
        let ca = TestCa::new("marabunta test CA");
        let (cert, key) = ca.issue_client("agent-42");
        let rendered = format!("{:?}", credentials(&ca, cert, key));
        assert!(!rendered.contains("PRIVATE KEY"));
    }
}
