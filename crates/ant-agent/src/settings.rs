//! Validated settings consumed by the agent runtime
//!
//! Built by the CLI from the config file and flags; the runtime never reads
//! configuration sources itself.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::{ConnectTarget, DEFAULT_CONNECT_TIMEOUT};
use crate::enroll::{EnrollmentError, EnrollmentTrust};
use crate::home::AgentHome;
use crate::retry::BackoffConfig;
use crate::stream::DEFAULT_UPDATE_TIMEOUT;

/// Default controller host
pub const DEFAULT_MARABUNTA: &str = "marabunta.host";
/// Default enrollment (HTTPS) port
pub const DEFAULT_HTTP_PORT: u16 = 8000;
/// Default control stream (gRPC) port
pub const DEFAULT_GRPC_PORT: u16 = 1415;
/// Name marabunta's server certificate must be valid for
pub const DEFAULT_SERVER_NAME: &str = "marabunta";
/// Bootstrap attempts before giving up on retryable enrollment errors
pub const DEFAULT_BOOTSTRAP_ATTEMPTS: u32 = 5;

/// Client certificate, key and CA bundle paths
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsPaths {
    pub crt: PathBuf,
    pub key: PathBuf,
    /// CA bundle; without it the last certificate in `crt` is the anchor
    pub ca: Option<PathBuf>,
}

/// Enrollment endpoint and how to trust it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnrollmentSettings {
    pub url: String,
    /// CA for the enrollment server; falls back to the TLS CA bundle
    pub ca: Option<PathBuf>,
    /// Skip enrollment server verification (logged on every use)
    pub insecure: bool,
}

/// Everything the agent runtime needs
#[derive(Clone, Debug, PartialEq)]
pub struct AgentSettings {
    pub home: PathBuf,
    pub marabunta: String,
    pub http_port: u16,
    pub grpc_port: u16,
    pub server_name: String,
    pub tls: TlsPaths,
    pub enrollment: EnrollmentSettings,
    pub connect_timeout: Duration,
    pub update_timeout: Duration,
    pub backoff: BackoffConfig,
    pub bootstrap_attempts: u32,
}

impl AgentSettings {
    /// Defaults for an agent rooted at `home`
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let layout = AgentHome::new(&home);
        Self {
            tls: TlsPaths {
                crt: layout.cert_path(),
                key: layout.key_path(),
                ca: None,
            },
            enrollment: EnrollmentSettings {
                url: default_enrollment_url(DEFAULT_MARABUNTA, DEFAULT_HTTP_PORT),
                ca: None,
                insecure: false,
            },
            home,
            marabunta: DEFAULT_MARABUNTA.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            grpc_port: DEFAULT_GRPC_PORT,
            server_name: DEFAULT_SERVER_NAME.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            update_timeout: DEFAULT_UPDATE_TIMEOUT,
            backoff: BackoffConfig::default(),
            bootstrap_attempts: DEFAULT_BOOTSTRAP_ATTEMPTS,
        }
    }

    /// Where the control stream is dialed
    pub fn grpc_target(&self) -> ConnectTarget {
        ConnectTarget::new(&self.marabunta, self.grpc_port)
    }

    /// CA bundle for marabunta's stream certificate: `tls.ca`, then
    /// `enrollment.ca`. `None` means the anchor comes from `tls.crt` itself.
    pub fn stream_ca(&self) -> Option<&Path> {
        self.tls.ca.as_deref().or(self.enrollment.ca.as_deref())
    }

    /// Resolve how the enrollment server is verified.
    ///
    /// `enrollment.ca`, then `tls.ca`; with neither, only an explicit
    /// `insecure` lets enrollment proceed.
    pub fn enrollment_trust(&self) -> Result<EnrollmentTrust, EnrollmentError> {
        match self.enrollment.ca.as_ref().or(self.tls.ca.as_ref()) {
            Some(path) => std::fs::read_to_string(path)
                .map(EnrollmentTrust::Anchored)
                .map_err(|e| {
                    EnrollmentError::InvalidTrustAnchor(format!(
                        "failed to read {}: {}",
                        path.display(),
                        e
                    ))
                }),
            None if self.enrollment.insecure => Ok(EnrollmentTrust::Insecure),
            None => Err(EnrollmentError::NoTrustAnchor {
                url: self.enrollment.url.clone(),
            }),
        }
    }
}

/// `https://<marabunta>:<http_port>/`
pub fn default_enrollment_url(marabunta: &str, http_port: u16) -> String {
    format!("https://{}:{}/", marabunta, http_port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_live_under_home() {
        let settings = AgentSettings::new("/var/lib/ant");

        assert_eq!(settings.tls.crt, PathBuf::from("/var/lib/ant/ant.crt"));
        assert_eq!(settings.tls.key, PathBuf::from("/var/lib/ant/ant.key"));
        assert_eq!(settings.enrollment.url, "https://marabunta.host:8000/");
        assert_eq!(
            settings.grpc_target(),
            ConnectTarget::new("marabunta.host", 1415)
        );
        assert_eq!(settings.server_name, "marabunta");
        assert_eq!(settings.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn enrollment_ca_wins_over_tls_ca() {
        let dir = tempfile::tempdir().unwrap();
        let enrollment_ca = dir.path().join("enroll.crt");
        let tls_ca = dir.path().join("ca.crt");
        std::fs::write(&enrollment_ca, "enrollment").unwrap();
        std::fs::write(&tls_ca, "tls").unwrap();

        let mut settings = AgentSettings::new(dir.path());
        settings.tls.ca = Some(tls_ca);
        settings.enrollment.ca = Some(enrollment_ca);

        match settings.enrollment_trust().unwrap() {
            EnrollmentTrust::Anchored(pem) => assert_eq!(pem, "enrollment"),
            other => panic!("expected anchored trust, got {:?}", other),
        }
    }

    #[test]
    fn tls_ca_is_the_fallback_anchor() {
        let dir = tempfile::tempdir().unwrap();
        let tls_ca = dir.path().join("ca.crt");
        std::fs::write(&tls_ca, "tls").unwrap();

        let mut settings = AgentSettings::new(dir.path());
        settings.tls.ca = Some(tls_ca);

        assert!(matches!(
            settings.enrollment_trust().unwrap(),
            EnrollmentTrust::Anchored(pem) if pem == "tls"
        ));
    }

    #[test]
    fn stream_ca_falls_back_to_enrollment_ca() {
        let mut settings = AgentSettings::new("/var/lib/ant");
        assert_eq!(settings.stream_ca(), None);

        settings.enrollment.ca = Some(PathBuf::from("/etc/ant/enroll.crt"));
        assert_eq!(settings.stream_ca(), Some(Path::new("/etc/ant/enroll.crt")));

        settings.tls.ca = Some(PathBuf::from("/etc/ant/ca.crt"));
        assert_eq!(settings.stream_ca(), Some(Path::new("/etc/ant/ca.crt")));
    }

    #[test]
    fn no_anchor_is_refused_unless_insecure() {
        let mut settings = AgentSettings::new("/var/lib/ant");

        let err = settings.enrollment_trust().unwrap_err();
        assert!(matches!(err, EnrollmentError::NoTrustAnchor { .. }));
        assert!(err.to_string().contains("https://marabunta.host:8000/"));

        settings.enrollment.insecure = true;
        assert!(matches!(
            settings.enrollment_trust().unwrap(),
            EnrollmentTrust::Insecure
        ));
    }

    #[test]
    fn unreadable_anchor_names_the_file() {
        let mut settings = AgentSettings::new("/var/lib/ant");
        settings.enrollment.ca = Some(PathBuf::from("/nonexistent/enroll.crt"));

        let err = settings.enrollment_trust().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/enroll.crt"));
    }
}
