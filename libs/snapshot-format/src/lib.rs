//! Snapshot backup folder format.
//!
//! A backup is a folder with one sub-directory per datacenter and an optional
//! bootstrap token sidecar captured alongside the snapshots.
//!
//! # Layout
//!
//! ```text
//! <backup>/
//!   .token              base64 of the bootstrap ACL token (ACL clusters only)
//!   dc1/snapshot.gz
//!   dc2/snapshot.gz
//! ```
//!
//! The sidecar holds the token exactly as the Kubernetes secret's data field
//! stores it (standard base64, no trailing newline).

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

/// Snapshot file name inside each datacenter directory.
pub const SNAPSHOT_FILE: &str = "snapshot.gz";

/// Bootstrap token sidecar file name at the backup root.
pub const TOKEN_SIDECAR_FILE: &str = ".token";

/// Maximum datacenter name length in bytes.
pub const MAX_DATACENTER_LENGTH: usize = 253;

/// Snapshot format errors.
#[derive(Debug, Error)]
pub enum SnapshotFormatError {
    /// Invalid datacenter name.
    #[error("invalid datacenter '{name}': {reason}")]
    InvalidDatacenter { name: String, reason: String },

    /// The sidecar content is not valid base64.
    #[error("invalid token sidecar {path}: {reason}")]
    InvalidSidecar { path: String, reason: String },

    /// The datacenter directory already holds a backup.
    #[error("backup directory already exists: {0}")]
    AlreadyExists(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// A backup folder on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotLayout {
    root: PathBuf,
}

impl SnapshotLayout {
    /// Create a layout rooted at `root`.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// The backup root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one datacenter's snapshot.
    pub fn datacenter_dir(&self, datacenter: &str) -> Result<PathBuf, SnapshotFormatError> {
        validate_datacenter(datacenter)?;
        Ok(self.root.join(datacenter))
    }

    /// Path of one datacenter's snapshot file.
    pub fn snapshot_path(&self, datacenter: &str) -> Result<PathBuf, SnapshotFormatError> {
        Ok(self.datacenter_dir(datacenter)?.join(SNAPSHOT_FILE))
    }

    /// Path of the bootstrap token sidecar.
    pub fn token_sidecar_path(&self) -> PathBuf {
        self.root.join(TOKEN_SIDECAR_FILE)
    }

    /// Whether the backup carries a bootstrap token sidecar.
    pub fn has_token_sidecar(&self) -> bool {
        self.token_sidecar_path().is_file()
    }

    /// Datacenters present in the backup, sorted by name.
    pub fn datacenters(&self) -> Result<Vec<String>, SnapshotFormatError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Create the directory for a new datacenter snapshot.
    ///
    /// Fails if the directory already exists so a backup never overwrites
    /// another one.
    pub fn create_datacenter_dir(&self, datacenter: &str) -> Result<PathBuf, SnapshotFormatError> {
        let dir = self.datacenter_dir(datacenter)?;
        fs::create_dir_all(&self.root)?;
        match fs::create_dir(&dir) {
            Ok(()) => Ok(dir),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(SnapshotFormatError::AlreadyExists(dir.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read the bootstrap token sidecar, if present.
    pub fn read_token_sidecar(&self) -> Result<Option<TokenSidecar>, SnapshotFormatError> {
        let path = self.token_sidecar_path();
        if !path.is_file() {
            return Ok(None);
        }
        TokenSidecar::read_from_file(&path).map(Some)
    }
}

/// The bootstrap token captured with a backup.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSidecar {
    token: Vec<u8>,
}

impl TokenSidecar {
    /// Wrap raw token bytes.
    pub fn from_token<T: Into<Vec<u8>>>(token: T) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Raw token bytes.
    pub fn token(&self) -> &[u8] {
        &self.token
    }

    /// Token as UTF-8, if it is valid UTF-8.
    pub fn token_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.token).ok()
    }

    /// Serialize to the on-disk form.
    pub fn encode(&self) -> String {
        STANDARD.encode(&self.token)
    }

    /// Parse the on-disk form. Surrounding whitespace is ignored.
    pub fn parse(content: &str) -> Result<Self, base64::DecodeError> {
        let token = STANDARD.decode(content.trim())?;
        Ok(Self { token })
    }

    /// Read from a file.
    pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Self, SnapshotFormatError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        Self::parse(&content).map_err(|e| SnapshotFormatError::InvalidSidecar {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Write to a file atomically, readable by the owner only.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), SnapshotFormatError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&temp_path)?;

            file.write_all(self.encode().as_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

impl fmt::Debug for TokenSidecar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSidecar")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Validate a datacenter name used as a directory name.
fn validate_datacenter(name: &str) -> Result<(), SnapshotFormatError> {
    let invalid = |reason: &str| SnapshotFormatError::InvalidDatacenter {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if name.len() > MAX_DATACENTER_LENGTH {
        return Err(invalid("name is too long"));
    }
    if name == "." || name == ".." {
        return Err(invalid("name cannot be a relative path component"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(invalid(&format!("invalid character '{}'", c)));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datacenter_validation() {
        assert!(validate_datacenter("dc1").is_ok());
        assert!(validate_datacenter("eu-west_1.a").is_ok());

        assert!(validate_datacenter("").is_err());
        assert!(validate_datacenter("..").is_err());
        assert!(validate_datacenter("dc1/../etc").is_err());
        assert!(validate_datacenter("dc 1").is_err());
    }

    #[test]
    fn test_sidecar_matches_secret_encoding() {
        let sidecar = TokenSidecar::from_token("6f1c2a5e-bootstrap");
        assert_eq!(sidecar.encode(), "NmYxYzJhNWUtYm9vdHN0cmFw");

        let parsed = TokenSidecar::parse("NmYxYzJhNWUtYm9vdHN0cmFw\n").unwrap();
        assert_eq!(parsed.token_str(), Some("6f1c2a5e-bootstrap"));
    }

    #[test]
    fn test_sidecar_rejects_garbage() {
        assert!(TokenSidecar::parse("not base64 !!").is_err());
    }

    #[test]
    fn test_sidecar_debug_is_redacted() {
        let sidecar = TokenSidecar::from_token("secret-token");
        assert!(!format!("{:?}", sidecar).contains("secret-token"));
    }

    #[test]
    fn test_layout_lists_datacenters_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SnapshotLayout::new(dir.path());

        layout.create_datacenter_dir("dc2").unwrap();
        layout.create_datacenter_dir("dc1").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        assert_eq!(layout.datacenters().unwrap(), vec!["dc1", "dc2"]);
    }

    #[test]
    fn test_create_datacenter_dir_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SnapshotLayout::new(dir.path());

        layout.create_datacenter_dir("dc1").unwrap();
        let result = layout.create_datacenter_dir("dc1");

        assert!(matches!(result, Err(SnapshotFormatError::AlreadyExists(_))));
    }

    #[test]
    fn test_sidecar_file_roundtrip_and_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let layout = SnapshotLayout::new(dir.path());
        assert!(!layout.has_token_sidecar());
        assert!(layout.read_token_sidecar().unwrap().is_none());

        TokenSidecar::from_token("bootstrap")
            .write_to_file(layout.token_sidecar_path())
            .unwrap();

        assert!(layout.has_token_sidecar());
        let sidecar = layout.read_token_sidecar().unwrap().unwrap();
        assert_eq!(sidecar.token(), b"bootstrap");

        let mode = fs::metadata(layout.token_sidecar_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
