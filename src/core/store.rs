//! On-disk layout of the guard's durable state.
//!
//! Everything the subsystem persists lives under `<project>/.projguard/`:
//! the append-only transaction log, per-transaction backup directories and
//! the advisory lock table. Nothing else is written outside the project's own
//! manifest and resource files.

use crate::core::error::GuardError;
use std::fs;
use std::path::{Path, PathBuf};

pub const STATE_DIR_NAME: &str = ".projguard";

/// Store handle for one project's guard state.
#[derive(Debug, Clone)]
pub struct Store {
    /// Canonical project root (the directory holding the manifest).
    pub project_root: PathBuf,
    /// Absolute path to `<project>/.projguard`.
    pub root: PathBuf,
}

impl Store {
    pub fn for_project(project_root: &Path) -> Result<Self, GuardError> {
        let project_root = fs::canonicalize(project_root).map_err(|e| {
            GuardError::Config(format!(
                "project path {} is not accessible: {}",
                project_root.display(),
                e
            ))
        })?;
        if !project_root.is_dir() {
            return Err(GuardError::Config(format!(
                "project path {} is not a directory",
                project_root.display()
            )));
        }
        let root = project_root.join(STATE_DIR_NAME);
        Ok(Self { project_root, root })
    }

    /// Creates the state directories if they are missing.
    pub fn ensure_layout(&self) -> Result<(), GuardError> {
        for dir in [self.logs_dir(), self.backups_dir(), self.locks_dir()] {
            fs::create_dir_all(&dir).map_err(GuardError::IoError)?;
        }
        Ok(())
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// Digest of the manifest recorded at the last successful sync.
    pub fn marker_path(&self) -> PathBuf {
        self.root.join("sync.marker")
    }

    pub fn default_transaction_log(&self) -> PathBuf {
        self.logs_dir().join("transactions.jsonl")
    }

    /// Resolves a caller-supplied path against the project root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }
}
