//! Ant configuration (`ant.yml`) and flag overrides.
//!
//! Resolution order (highest priority first):
//! 1. Command line flags
//! 2. The file given with `-c/--config`
//! 3. Built-in defaults
//!
//! Certificate and key default to `<home>/ant.crt` and `<home>/ant.key`,
//! where home is `~/.marabunta` unless configured. Missing defaults are
//! produced by bootstrap; explicitly configured files must already exist.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ant_agent::home::is_readable_file;
use ant_agent::settings::{
    default_enrollment_url, AgentSettings, EnrollmentSettings, DEFAULT_BOOTSTRAP_ATTEMPTS,
    DEFAULT_GRPC_PORT, DEFAULT_HTTP_PORT, DEFAULT_MARABUNTA, DEFAULT_SERVER_NAME,
};
use ant_agent::BackoffConfig;
use serde::{Deserialize, Serialize};

use crate::{Error, GlobalArgs, Result};

const HOME_DIR_NAME: &str = ".marabunta";

/// Parsed `ant.yml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntConfig {
    /// Controller host
    pub marabunta: String,
    /// Enrollment (HTTPS) port
    pub http_port: u16,
    /// Control stream (gRPC) port
    pub grpc_port: u16,
    /// Agent home; `~/.marabunta` when unset
    pub home: Option<PathBuf>,
    pub tls: TlsConfig,
    pub enrollment: EnrollmentConfig,
    pub connect_timeout_secs: u64,
    pub update_timeout_secs: u64,
    pub bootstrap_attempts: u32,
    pub backoff: BackoffSettings,
}

/// `tls:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub crt: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    /// Name marabunta's certificate must be valid for
    pub server_name: String,
}

/// `enrollment:` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollmentConfig {
    /// Defaults to `https://<marabunta>:<http_port>/`
    pub url: Option<String>,
    /// CA for the enrollment server; falls back to `tls.ca`
    pub ca: Option<PathBuf>,
    /// Accept any enrollment server certificate
    pub insecure: bool,
}

/// `backoff:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for AntConfig {
    fn default() -> Self {
        Self {
            marabunta: DEFAULT_MARABUNTA.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            grpc_port: DEFAULT_GRPC_PORT,
            home: None,
            tls: TlsConfig::default(),
            enrollment: EnrollmentConfig::default(),
            connect_timeout_secs: 5,
            update_timeout_secs: 10,
            bootstrap_attempts: DEFAULT_BOOTSTRAP_ATTEMPTS,
            backoff: BackoffSettings::default(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            crt: None,
            key: None,
            ca: None,
            server_name: DEFAULT_SERVER_NAME.to_string(),
        }
    }
}

impl Default for BackoffSettings {
    fn default() -> Self {
        let backoff = BackoffConfig::default();
        Self {
            initial_ms: backoff.initial_delay.as_millis() as u64,
            max_ms: backoff.max_delay.as_millis() as u64,
            multiplier: backoff.multiplier,
        }
    }
}

/// Returns `~/.marabunta/`, creating it if it doesn't exist.
pub fn marabunta_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::command_failed("could not determine home directory"))?;
    let dir = home.join(HOME_DIR_NAME);
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::command_failed(format!("failed to create {}: {}", dir.display(), e))
        })?;
    }
    Ok(dir)
}

impl AntConfig {
    /// Load `path`; it must be a readable regular file
    pub fn load(path: &Path) -> Result<Self> {
        if !is_readable_file(path) {
            return Err(Error::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }
        let data = std::fs::read_to_string(path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&data).map_err(|source| Error::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Config file (if any) with flags applied, validated
    pub fn from_args(args: &GlobalArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    /// Flags override file values
    pub fn apply_args(&mut self, args: &GlobalArgs) {
        if let Some(home) = &args.home {
            self.home = Some(home.clone());
        }
        if let Some(marabunta) = &args.marabunta {
            self.marabunta = marabunta.clone();
        }
        if let Some(port) = args.http_port {
            self.http_port = port;
        }
        if let Some(port) = args.grpc_port {
            self.grpc_port = port;
        }
        if let Some(crt) = &args.tls_crt {
            self.tls.crt = Some(crt.clone());
        }
        if let Some(key) = &args.tls_key {
            self.tls.key = Some(key.clone());
        }
        if let Some(ca) = &args.tls_ca {
            self.tls.ca = Some(ca.clone());
        }
        if let Some(name) = &args.server_name {
            self.tls.server_name = name.clone();
        }
        if let Some(url) = &args.enrollment_url {
            self.enrollment.url = Some(url.clone());
        }
        if let Some(ca) = &args.enrollment_ca {
            self.enrollment.ca = Some(ca.clone());
        }
        if args.insecure_enrollment {
            self.enrollment.insecure = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.marabunta.trim().is_empty() {
            return Err(Error::validation("marabunta host must not be empty"));
        }
        if self.http_port == 0 || self.grpc_port == 0 {
            return Err(Error::validation("http_port and grpc_port must be non-zero"));
        }
        if self.tls.server_name.trim().is_empty() {
            return Err(Error::validation("tls.server_name must not be empty"));
        }

        let explicit = [
            ("TLS crt", self.tls.crt.as_ref()),
            ("TLS key", self.tls.key.as_ref()),
            ("TLS CA", self.tls.ca.as_ref()),
            ("enrollment CA", self.enrollment.ca.as_ref()),
        ];
        for (what, path) in explicit {
            if let Some(path) = path {
                if !is_readable_file(path) {
                    return Err(Error::validation(format!(
                        "cannot read {} file: {}",
                        what,
                        path.display()
                    )));
                }
            }
        }

        if self.connect_timeout_secs == 0 || self.update_timeout_secs == 0 {
            return Err(Error::validation("timeouts must be at least one second"));
        }
        if self.backoff.initial_ms == 0
            || self.backoff.max_ms < self.backoff.initial_ms
            || self.backoff.multiplier < 1.0
        {
            return Err(Error::validation(
                "backoff needs initial_ms > 0, max_ms >= initial_ms and multiplier >= 1",
            ));
        }
        Ok(())
    }

    /// Settings for the agent runtime, resolving the home directory
    pub fn agent_settings(&self) -> Result<AgentSettings> {
        let home = match &self.home {
            Some(home) => home.clone(),
            None => marabunta_dir()?,
        };
        Ok(self.settings_for_home(home))
    }

    fn settings_for_home(&self, home: PathBuf) -> AgentSettings {
        let mut settings = AgentSettings::new(home);

        settings.marabunta = self.marabunta.clone();
        settings.http_port = self.http_port;
        settings.grpc_port = self.grpc_port;
        settings.server_name = self.tls.server_name.clone();

        if let Some(crt) = &self.tls.crt {
            settings.tls.crt = crt.clone();
        }
        if let Some(key) = &self.tls.key {
            settings.tls.key = key.clone();
        }
        settings.tls.ca = self.tls.ca.clone();

        settings.enrollment = EnrollmentSettings {
            url: self
                .enrollment
                .url
                .clone()
                .unwrap_or_else(|| default_enrollment_url(&self.marabunta, self.http_port)),
            ca: self.enrollment.ca.clone(),
            insecure: self.enrollment.insecure,
        };

        settings.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        settings.update_timeout = Duration::from_secs(self.update_timeout_secs);
        settings.bootstrap_attempts = self.bootstrap_attempts;
        settings.backoff = BackoffConfig {
            initial_delay: Duration::from_millis(self.backoff.initial_ms),
            max_delay: Duration::from_millis(self.backoff.max_ms),
            multiplier: self.backoff.multiplier,
        };
        settings
    }
}
