//! Agent home directory
//!
//! Everything the ant persists lives under a single directory (by default
//! `~/.marabunta`):
//!
//! - `ant.id`  - agent identity, a UUID v1 of at most 36 bytes
//! - `ant.key` - PEM private key, owner read/write only
//! - `ant.csr` - PEM certificate request, kept for audit
//! - `ant.crt` - PEM certificate signed by marabunta
//!
//! Files are written to a temp file in the same directory and renamed into
//! place, so a crash never leaves a half-written key or certificate behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::RngCore;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Identity file name
pub const IDENTITY_FILE: &str = "ant.id";
/// Private key file name
pub const KEY_FILE: &str = "ant.key";
/// Certificate request file name
pub const CSR_FILE: &str = "ant.csr";
/// Signed certificate file name
pub const CERT_FILE: &str = "ant.crt";

/// Identities read back from disk are truncated to this many bytes
pub const MAX_IDENTITY_LEN: usize = 36;

/// Mode for private key material
pub const PRIVATE_FILE_MODE: u32 = 0o600;
/// Mode for everything else
pub const PUBLIC_FILE_MODE: u32 = 0o644;

/// Errors persisting agent state
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading, creating or writing a file under the agent home failed
    #[error("storage error at {}: {source}", path.display())]
    Storage {
        /// File or directory involved
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn storage(path: &Path, source: std::io::Error) -> Self {
        StoreError::Storage {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Directory holding the identity and bootstrap artifacts of one agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentHome {
    dir: PathBuf,
}

impl AgentHome {
    /// Use `dir` as the agent home without touching the filesystem
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Use `dir` as the agent home, creating it if it doesn't exist
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::storage(&dir, e))?;
        Ok(Self { dir })
    }

    /// The home directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn identity_path(&self) -> PathBuf {
        self.dir.join(IDENTITY_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    pub fn csr_path(&self) -> PathBuf {
        self.dir.join(CSR_FILE)
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CERT_FILE)
    }

    /// Load the agent identity, creating and persisting one on first use
    pub fn identity(&self) -> Result<String, StoreError> {
        get_or_create_identity(&self.identity_path())
    }
}

/// Return the identity stored at `path`, or create a new one.
///
/// A readable, non-empty file wins: its content is trimmed and truncated to
/// [`MAX_IDENTITY_LEN`] bytes. Anything else (missing, unreadable, empty or
/// whitespace only) gets a fresh time based UUID written atomically to `path`.
/// Repeated calls against the same path return the same value.
pub fn get_or_create_identity(path: &Path) -> Result<String, StoreError> {
    if let Some(identity) = read_identity(path) {
        debug!(path = %path.display(), identity = %identity, "Loaded agent identity");
        return Ok(identity);
    }

    let identity = Uuid::now_v1(&random_node_id()).to_string();
    write_atomic(path, identity.as_bytes(), PUBLIC_FILE_MODE)?;

    info!(path = %path.display(), identity = %identity, "Created agent identity");
    Ok(identity)
}

fn read_identity(path: &Path) -> Option<String> {
    if !is_readable_file(path) {
        return None;
    }
    let raw = fs::read(path).ok()?;
    let identity = truncate_identity(&String::from_utf8_lossy(&raw));
    (!identity.is_empty()).then_some(identity)
}

fn truncate_identity(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut end = trimmed.len().min(MAX_IDENTITY_LEN);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].trim_end().to_string()
}

/// Random node id for UUID v1, with the multicast bit set as RFC 4122
/// requires for ids not derived from a MAC address.
fn random_node_id() -> [u8; 6] {
    let mut node = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut node);
    node[0] |= 0x01;
    node
}

/// True if `path` is a regular file this process can open for reading
pub fn is_readable_file(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => fs::File::open(path).is_ok(),
        _ => false,
    }
}

/// Write `contents` to `path` via a temp file in the same directory.
///
/// The temp file gets `mode` before any byte is written and is synced
/// before the rename.
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::storage(dir, e))?;
    set_mode(tmp.as_file(), mode).map_err(|e| StoreError::storage(path, e))?;
    tmp.write_all(contents)
        .map_err(|e| StoreError::storage(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::storage(path, e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::storage(path, e.error))?;

    debug!(path = %path.display(), bytes = contents.len(), "Wrote file");
    Ok(())
}

#[cfg(unix)]
fn set_mode(file: &fs::File, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &fs::File, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
