//! Per-session configuration artifacts.
//!
//! Every session hands its process a config file path via `--config`. The
//! file is created empty before spawn and removed on teardown, whichever way
//! the session ends.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::pty::SessionError;

/// File name prefix of provisioned artifacts.
pub const ARTIFACT_PREFIX: &str = "shellgate-config-";

/// Creates config artifacts in a directory.
#[derive(Debug, Clone)]
pub struct ConfigProvisioner {
    dir: PathBuf,
    prefix: String,
}

impl ConfigProvisioner {
    /// Provisioner writing to the system temporary directory.
    pub fn new() -> Self {
        Self::in_dir(std::env::temp_dir())
    }

    /// Provisioner writing to `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            prefix: ARTIFACT_PREFIX.to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates a uniquely named, empty artifact and returns a guard owning it.
    // TODO: seed the artifact from per-identity saved configuration keyed by
    // the client's public key fingerprint.
    pub fn provision(&self) -> Result<ConfigArtifact, SessionError> {
        let file = tempfile::Builder::new()
            .prefix(&self.prefix)
            .tempfile_in(&self.dir)
            .map_err(SessionError::ProvisionFailed)?;

        let (_file, path) = file
            .keep()
            .map_err(|e| SessionError::ProvisionFailed(e.error))?;

        let path = match fs::canonicalize(&path) {
            Ok(canonical) => canonical,
            Err(e) => {
                let _ = release(&path);
                return Err(SessionError::ProvisionFailed(e));
            }
        };

        tracing::debug!(path = %path.display(), "Provisioned session config");

        Ok(ConfigArtifact {
            path,
            released: false,
        })
    }
}

impl Default for ConfigProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

/// Deletes an artifact, treating an already missing file as success.
pub fn release(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// A provisioned config file. Deleted on [`release`](Self::release) or drop.
#[derive(Debug)]
pub struct ConfigArtifact {
    path: PathBuf,
    released: bool,
}

impl ConfigArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the artifact now, reporting any error other than not-found.
    pub fn release(mut self) -> io::Result<()> {
        self.released = true;
        let result = release(&self.path);
        if result.is_ok() {
            tracing::debug!(path = %self.path.display(), "Released session config");
        }
        result
    }
}

impl Drop for ConfigArtifact {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = release(&self.path) {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove session config"
            );
        }
    }
}
