//! Backup store: byte-exact copies of files taken before they are mutated.
//!
//! Layout per transaction:
//!
//! ```text
//! backups/<txn-id>/index.json     ordered BackupEntry list
//! backups/<txn-id>/files/<n>.bak  copied bytes, one per entry
//! ```
//!
//! A file that did not exist when it was backed up is recorded as a
//! placeholder entry with no blob; restoring it deletes whatever was created
//! at that path afterwards.

use crate::core::error::GuardError;
use crate::core::time;
use crate::core::transaction::TxStatus;
use crate::core::txlog::{CompactReport, TransactionSummary};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const INDEX_FILE: &str = "index.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub seq: usize,
    pub original_path: PathBuf,
    /// `None` for a non-existence placeholder.
    pub backup_path: Option<PathBuf>,
    pub original_existed: bool,
    pub sha256: Option<String>,
    pub size: u64,
    /// Unix permission bits of the original, restored alongside the bytes.
    #[serde(default)]
    pub mode: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupIndex {
    pub txn_id: String,
    pub entries: Vec<BackupEntry>,
}

impl BackupIndex {
    pub fn entry_for(&self, path: &Path) -> Option<&BackupEntry> {
        self.entries.iter().find(|e| e.original_path == path)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct BackupHandle {
    pub txn_id: String,
    pub entry: BackupEntry,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub kept_open: usize,
    pub kept_failed: usize,
    pub kept_recent: usize,
    /// Transaction log segments dropped along with the backups.
    pub log: CompactReport,
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn txn_dir(&self, txn_id: &str) -> PathBuf {
        self.dir.join(txn_id)
    }

    pub fn load_index(&self, txn_id: &str) -> Result<BackupIndex, GuardError> {
        let path = self.txn_dir(txn_id).join(INDEX_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BackupIndex {
                txn_id: txn_id.to_string(),
                entries: Vec::new(),
            }),
            Err(e) => Err(GuardError::IoError(e)),
        }
    }

    fn save_index(&self, index: &BackupIndex) -> Result<(), GuardError> {
        let path = self.txn_dir(&index.txn_id).join(INDEX_FILE);
        write_atomic(&path, serde_json::to_string_pretty(index)?.as_bytes())
    }

    /// Copies `path` into the store for `txn_id`.
    ///
    /// A path already backed up by this transaction keeps its first copy: that
    /// one holds the pre-transaction state.
    pub fn backup(
        &self,
        txn_id: &str,
        path: &Path,
        optional: bool,
    ) -> Result<BackupHandle, GuardError> {
        let mut index = self.load_index(txn_id)?;
        if let Some(existing) = index.entry_for(path) {
            return Ok(BackupHandle {
                txn_id: txn_id.to_string(),
                entry: existing.clone(),
            });
        }
        let seq = index.entries.len();

        let entry = match fs::metadata(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !optional {
                    return Err(GuardError::NotFound(path.display().to_string()));
                }
                BackupEntry {
                    seq,
                    original_path: path.to_path_buf(),
                    backup_path: None,
                    original_existed: false,
                    sha256: None,
                    size: 0,
                    mode: None,
                }
            }
            Err(e) => return Err(backup_failure(path, e)),
            Ok(meta) if meta.is_dir() => {
                return Err(GuardError::BackupFailure {
                    path: path.to_path_buf(),
                    reason: "directories cannot be backed up".to_string(),
                });
            }
            Ok(meta) => {
                let bytes = fs::read(path).map_err(|e| backup_failure(path, e))?;
                let blob = self
                    .txn_dir(txn_id)
                    .join("files")
                    .join(format!("{}.bak", seq));
                write_synced(&blob, &bytes).map_err(|e| backup_failure(path, e))?;
                BackupEntry {
                    seq,
                    original_path: path.to_path_buf(),
                    backup_path: Some(blob),
                    original_existed: true,
                    sha256: Some(sha256_hex(&bytes)),
                    size: bytes.len() as u64,
                    mode: permission_bits(&meta),
                }
            }
        };

        index.txn_id = txn_id.to_string();
        index.entries.push(entry.clone());
        self.save_index(&index)
            .map_err(|e| GuardError::BackupFailure {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        debug!(txn = txn_id, path = %path.display(), existed = entry.original_existed, "backed up");
        Ok(BackupHandle {
            txn_id: txn_id.to_string(),
            entry,
        })
    }

    /// Puts the original back. Safe to call any number of times.
    pub fn restore(&self, handle: &BackupHandle) -> Result<(), GuardError> {
        let entry = &handle.entry;
        let fail = |reason: String| {
            tracing::error!(txn = %handle.txn_id, path = %entry.original_path.display(), %reason, "restore failed");
            GuardError::RestoreFailure {
                txn_id: handle.txn_id.clone(),
                paths: vec![entry.original_path.clone()],
            }
        };

        if !entry.original_existed {
            return match fs::remove_file(&entry.original_path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(fail(e.to_string())),
            };
        }

        let blob = entry
            .backup_path
            .as_ref()
            .ok_or_else(|| fail("backup entry has no blob".to_string()))?;
        let bytes = fs::read(blob).map_err(|e| fail(e.to_string()))?;
        if entry.sha256.as_deref() != Some(sha256_hex(&bytes).as_str()) {
            return Err(fail("backup blob checksum mismatch".to_string()));
        }
        if let Some(parent) = entry.original_path.parent() {
            fs::create_dir_all(parent).map_err(|e| fail(e.to_string()))?;
        }
        write_atomic(&entry.original_path, &bytes).map_err(|e| fail(e.to_string()))?;
        if let Some(mode) = entry.mode {
            set_permission_bits(&entry.original_path, mode).map_err(|e| fail(e.to_string()))?;
        }
        Ok(())
    }

    /// Transaction ids that have a backup directory.
    pub fn list_transactions(&self) -> Result<Vec<String>, GuardError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(GuardError::IoError(e)),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(GuardError::IoError)?;
            if entry.path().is_dir() {
                ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Deletes backups of transactions that ended more than `older_than_days`
    /// ago. Open and failed transactions are never pruned. Directories the
    /// log does not know about age out by modification time.
    pub fn prune(
        &self,
        older_than_days: u64,
        txns: &BTreeMap<String, TransactionSummary>,
    ) -> Result<PruneReport, GuardError> {
        let cutoff = prune_cutoff_ms(older_than_days);
        let mut report = PruneReport::default();

        for id in self.list_transactions()? {
            let dir = self.txn_dir(&id);
            let ended_at = match txns.get(&id) {
                Some(t) if t.status == TxStatus::Open => {
                    report.kept_open += 1;
                    continue;
                }
                Some(t) if t.status == TxStatus::Failed => {
                    report.kept_failed += 1;
                    continue;
                }
                Some(t) => t.ended_at_ms.unwrap_or(t.last_activity_ms),
                None => modified_ms(&dir).unwrap_or(0),
            };
            if ended_at <= cutoff {
                fs::remove_dir_all(&dir).map_err(GuardError::IoError)?;
                report.removed.push(id);
            } else {
                report.kept_recent += 1;
            }
        }
        if !report.removed.is_empty() {
            info!(removed = report.removed.len(), older_than_days, "pruned backups");
        }
        Ok(report)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Writes content by way of a temp file in the same directory and a rename,
/// so readers see either the old or the new bytes.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), GuardError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(GuardError::IoError)?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent).map_err(GuardError::IoError)?;
    temp_file.write_all(content).map_err(GuardError::IoError)?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(GuardError::IoError)?;
    temp_file
        .persist(path)
        .map_err(|err| GuardError::IoError(err.error))?;
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = File::create(path)?;
    f.write_all(bytes)?;
    f.sync_all()
}

fn backup_failure(path: &Path, err: std::io::Error) -> GuardError {
    GuardError::BackupFailure {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

/// Epoch milliseconds `days` ago, clamped at zero.
pub fn prune_cutoff_ms(days: u64) -> u64 {
    time::now_epoch_ms().saturating_sub(days.saturating_mul(time::MS_PER_DAY))
}

fn modified_ms(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(
        modified
            .duration_since(std::time::UNIX_EPOCH)
            .ok()?
            .as_millis() as u64,
    )
}

#[cfg(unix)]
fn permission_bits(meta: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn permission_bits(_meta: &fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
fn set_permission_bits(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_permission_bits(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
