//! Key generation and certificate signing requests
//!
//! The ant generates its own P-256 key pair and sends marabunta only a
//! CSR. The private key never leaves the agent home.

use rcgen::{
    CertificateParams, DistinguishedName, DnType, DnValue, KeyPair, PKCS_ECDSA_P256_SHA256,
};
use thiserror::Error;
use zeroize::Zeroizing;

/// Organization placed in every CSR subject
pub const ORGANIZATION: &str = "marabunta";

/// Organizational unit placed in every CSR subject
pub const ORGANIZATIONAL_UNIT: &str = "ant";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key pair generation failed
    #[error("key generation failed: {0}")]
    KeyGen(String),

    /// CSR subject or ASN.1 encoding failed
    #[error("CSR encoding failed: {0}")]
    Encoding(String),

    /// PEM or certificate parsing failed
    #[error("certificate parsing error: {0}")]
    Parse(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Generate a fresh ECDSA P-256 key pair
pub fn generate_key_pair() -> Result<KeyPair> {
    KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| PkiError::KeyGen(format!("failed to generate P-256 key: {}", e)))
}

/// A CSR together with the private key that signed it
pub struct CertificateRequest {
    key_pem: Zeroizing<String>,
    csr_pem: String,
}

impl CertificateRequest {
    /// CSR in PEM format (sent to marabunta)
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// Private key in PKCS#8 PEM format (stored locally)
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }
}

impl std::fmt::Debug for CertificateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRequest")
            .field("csr_pem", &self.csr_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Build a CSR for `identity` signed with `key_pair`.
///
/// Subject is `CN=<identity>, O=marabunta, OU=ant`; the signature algorithm
/// follows the key, ECDSA with SHA-256 for keys from [`generate_key_pair`].
pub fn build_csr(identity: &str, key_pair: &KeyPair) -> Result<CertificateRequest> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(identity.to_string()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn.push(
        DnType::OrganizationalUnitName,
        DnValue::Utf8String(ORGANIZATIONAL_UNIT.to_string()),
    );
    params.distinguished_name = dn;

    let csr = params
        .serialize_request(key_pair)
        .map_err(|e| PkiError::Encoding(format!("failed to create CSR: {}", e)))?;

    let csr_pem = csr
        .pem()
        .map_err(|e| PkiError::Encoding(format!("failed to serialize CSR: {}", e)))?;

    Ok(CertificateRequest {
        key_pem: Zeroizing::new(key_pair.serialize_pem()),
        csr_pem,
    })
}

/// Parse every PEM block in `pem_data` and return the DER contents in order
pub fn parse_pem_blocks(pem_data: &str) -> Result<Vec<Vec<u8>>> {
    let blocks = ::pem::parse_many(pem_data.as_bytes())
        .map_err(|e| PkiError::Parse(format!("failed to parse PEM: {}", e)))?;
    if blocks.is_empty() {
        return Err(PkiError::Parse("no PEM blocks found".to_string()));
    }
    Ok(blocks.into_iter().map(|p| p.into_contents()).collect())
}

/// Re-encode DER bytes as a single `CERTIFICATE` PEM block
pub fn encode_certificate_pem(der: &[u8]) -> String {
    ::pem::encode(&::pem::Pem::new("CERTIFICATE", der.to_vec()))
}
