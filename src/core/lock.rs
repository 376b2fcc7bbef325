//! Advisory, path-keyed resource locks shared across processes.
//!
//! A lock is a file under `<state>/locks/` named by the SHA-256 of the
//! canonical resource path and created with `create_new`, which gives
//! single-winner semantics across threads and processes alike. Locks held by
//! a transaction outlive the process that took them (`begin` and `commit` may
//! run in different invocations) and are released by commit or rollback.
//!
//! A lock is reclaimable when its holder is provably gone: the owning
//! transaction is terminal in the log, or the owner is unknown to the log and
//! past the grace window, or a read guard has been held far longer than any
//! check takes.

use crate::core::error::GuardError;
use crate::core::time;
use crate::core::transaction::TxStatus;
use crate::core::txlog::TransactionLog;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Time a freshly created lock may exist before its owner shows up in the log.
const OWNER_GRACE_MS: u64 = 5_000;
/// Read guards older than this are considered abandoned.
const READER_STALE_MS: u64 = 60_000;
const POLL_INTERVAL_MS: u64 = 10;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockOwner {
    Transaction { txn_id: String },
    Reader { label: String },
}

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockOwner::Transaction { txn_id } => write!(f, "transaction {}", txn_id),
            LockOwner::Reader { label } => write!(f, "reader {}", label),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub resource: String,
    pub owner: LockOwner,
    pub pid: u32,
    pub acquired_at_ms: u64,
}

/// Canonical key for a resource. Paths that do not exist yet are keyed by
/// their canonical parent plus file name.
pub fn canonical_resource(path: &Path) -> PathBuf {
    if let Ok(p) = fs::canonicalize(path) {
        return p;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            fs::canonicalize(parent)
                .map(|p| p.join(name))
                .unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    }
}

#[derive(Debug, Clone)]
pub struct LockTable {
    dir: PathBuf,
    log: TransactionLog,
}

impl LockTable {
    pub fn new(dir: impl Into<PathBuf>, log: TransactionLog) -> Self {
        Self {
            dir: dir.into(),
            log,
        }
    }

    pub fn lock_path(&self, resource: &Path) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(resource.to_string_lossy().as_bytes());
        self.dir.join(format!("{:x}.lock", hasher.finalize()))
    }

    /// Single non-blocking attempt. `Ok(None)` means someone else holds it.
    pub fn try_acquire(
        &self,
        resource: &Path,
        owner: &LockOwner,
    ) -> Result<Option<LockLease>, GuardError> {
        fs::create_dir_all(&self.dir).map_err(GuardError::IoError)?;
        let lock_path = self.lock_path(resource);

        for _ in 0..2 {
            match OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    let info = LockInfo {
                        resource: resource.to_string_lossy().to_string(),
                        owner: owner.clone(),
                        pid: std::process::id(),
                        acquired_at_ms: time::now_epoch_ms(),
                    };
                    file.write_all(serde_json::to_string(&info)?.as_bytes())
                        .map_err(GuardError::IoError)?;
                    file.sync_data().map_err(GuardError::IoError)?;
                    debug!(resource = %resource.display(), %owner, "lock acquired");
                    return Ok(Some(LockLease {
                        path: lock_path,
                        resource: resource.to_path_buf(),
                        persisted: false,
                    }));
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !self.reclaim_if_stale(&lock_path)? {
                        return Ok(None);
                    }
                }
                Err(err) => return Err(GuardError::IoError(err)),
            }
        }
        Ok(None)
    }

    /// Polls until the lock is taken or `timeout` elapses.
    pub fn acquire(
        &self,
        resource: &Path,
        owner: &LockOwner,
        timeout: Duration,
    ) -> Result<LockLease, GuardError> {
        let start = Instant::now();
        loop {
            if let Some(lease) = self.try_acquire(resource, owner)? {
                return Ok(lease);
            }
            if start.elapsed() >= timeout {
                let holder = self
                    .holder(resource)
                    .ok()
                    .flatten()
                    .map(|h| h.owner.to_string())
                    .unwrap_or_else(|| "unknown holder".to_string());
                warn!(resource = %resource.display(), %holder, ?timeout, "lock wait timed out");
                return Err(GuardError::ResourceBusy {
                    resource: resource.to_path_buf(),
                    holder,
                });
            }
            std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS + jitter_ms(15)));
        }
    }

    pub fn holder(&self, resource: &Path) -> Result<Option<LockInfo>, GuardError> {
        read_info(&self.lock_path(resource))
    }

    /// Removes the lock if `owner` holds it. Returns whether a lock was removed.
    pub fn release(&self, resource: &Path, owner: &LockOwner) -> Result<bool, GuardError> {
        let lock_path = self.lock_path(resource);
        match read_info(&lock_path)? {
            Some(info) if &info.owner == owner => match fs::remove_file(&lock_path) {
                Ok(()) => {
                    debug!(resource = %resource.display(), %owner, "lock released");
                    Ok(true)
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(GuardError::IoError(e)),
            },
            Some(info) => {
                debug!(resource = %resource.display(), holder = %info.owner, "lock held by someone else; not released");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn is_stale(&self, info: &LockInfo) -> Result<bool, GuardError> {
        let age = time::now_epoch_ms().saturating_sub(info.acquired_at_ms);
        match &info.owner {
            LockOwner::Reader { .. } => Ok(age > READER_STALE_MS),
            LockOwner::Transaction { txn_id } => match self.log.status_of(txn_id)? {
                Some(TxStatus::Open) => Ok(false),
                Some(_) => Ok(true),
                None => Ok(age > OWNER_GRACE_MS),
            },
        }
    }

    /// Moves a stale lock aside. Returns true when the slot is free again.
    fn reclaim_if_stale(&self, lock_path: &Path) -> Result<bool, GuardError> {
        let observed = match read_info(lock_path) {
            Ok(Some(info)) => info,
            Ok(None) => return Ok(true),
            Err(_) => {
                // Holder is mid-write or the file is corrupt; judge by age.
                return match modified_age_ms(lock_path) {
                    Some(age) if age > OWNER_GRACE_MS => remove_if_exists(lock_path),
                    _ => Ok(false),
                };
            }
        };
        if !self.is_stale(&observed)? {
            return Ok(false);
        }

        let tomb = lock_path.with_extension(format!("stale-{}", time::new_event_id()));
        match fs::rename(lock_path, &tomb) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(GuardError::IoError(e)),
        }
        // Another reclaimer may have replaced the lock between our read and rename.
        if read_info(&tomb).ok().flatten().as_ref() != Some(&observed) {
            if fs::hard_link(&tomb, lock_path).is_ok() {
                let _ = fs::remove_file(&tomb);
            }
            return Ok(false);
        }
        let _ = fs::remove_file(&tomb);
        warn!(resource = %observed.resource, owner = %observed.owner, "reclaimed stale lock");
        Ok(true)
    }
}

/// Handle to a held lock. Dropping it releases the lock unless it was
/// persisted for a transaction that continues in another process.
#[derive(Debug)]
pub struct LockLease {
    path: PathBuf,
    resource: PathBuf,
    persisted: bool,
}

impl LockLease {
    pub fn resource(&self) -> &Path {
        &self.resource
    }

    /// Keeps the lock file after the lease is dropped.
    pub fn persist(mut self) {
        self.persisted = true;
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if !self.persisted {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn read_info(lock_path: &Path) -> Result<Option<LockInfo>, GuardError> {
    match fs::read_to_string(lock_path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(GuardError::IoError(e)),
    }
}

fn remove_if_exists(path: &Path) -> Result<bool, GuardError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(GuardError::IoError(e)),
    }
}

fn modified_age_ms(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.elapsed().ok()?.as_millis() as u64)
}

fn jitter_ms(max_exclusive: u64) -> u64 {
    if max_exclusive <= 1 {
        return 0;
    }
    time::now_epoch_ms() % max_exclusive
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::txlog::{LogEvent, LogRecord};

    fn table(dir: &Path) -> (LockTable, TransactionLog) {
        let log = TransactionLog::new(dir.join("transactions.jsonl"));
        (LockTable::new(dir.join("locks"), log.clone()), log)
    }

    fn txn(id: &str) -> LockOwner {
        LockOwner::Transaction {
            txn_id: id.to_string(),
        }
    }

    #[test]
    fn second_acquire_is_refused_while_held() {
        let tmp = tempfile::tempdir().unwrap();
        let (locks, log) = table(tmp.path());
        log.append(&LogRecord::new("t1", LogEvent::Begin, "")).unwrap();
        let resource = tmp.path().join("project.json");

        let lease = locks.try_acquire(&resource, &txn("t1")).unwrap();
        assert!(lease.is_some());
        assert!(locks.try_acquire(&resource, &txn("t2")).unwrap().is_none());

        drop(lease);
        assert!(locks.try_acquire(&resource, &txn("t2")).unwrap().is_some());
    }

    #[test]
    fn bounded_wait_reports_busy() {
        let tmp = tempfile::tempdir().unwrap();
        let (locks, log) = table(tmp.path());
        log.append(&LogRecord::new("t1", LogEvent::Begin, "")).unwrap();
        let resource = tmp.path().join("project.json");
        let _held = locks.acquire(&resource, &txn("t1"), Duration::ZERO).unwrap();

        let start = Instant::now();
        let err = locks
            .acquire(&resource, &txn("t2"), Duration::from_millis(100))
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(2));
        match err {
            GuardError::ResourceBusy { holder, .. } => assert!(holder.contains("t1")),
            other => panic!("expected busy, got {other:?}"),
        }
    }

    #[test]
    fn lock_of_terminal_transaction_is_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        let (locks, log) = table(tmp.path());
        let resource = tmp.path().join("project.json");
        log.append(&LogRecord::new("t1", LogEvent::Begin, "")).unwrap();
        locks.try_acquire(&resource, &txn("t1")).unwrap().unwrap().persist();
        log.append(&LogRecord::new("t1", LogEvent::Commit, "")).unwrap();

        let lease = locks.try_acquire(&resource, &txn("t2")).unwrap();
        assert!(lease.is_some());
        assert_eq!(locks.holder(&resource).unwrap().unwrap().owner, txn("t2"));
    }

    #[test]
    fn persisted_lease_survives_drop_until_release() {
        let tmp = tempfile::tempdir().unwrap();
        let (locks, log) = table(tmp.path());
        log.append(&LogRecord::new("t1", LogEvent::Begin, "")).unwrap();
        let resource = tmp.path().join("project.json");
        locks.try_acquire(&resource, &txn("t1")).unwrap().unwrap().persist();
        assert!(locks.holder(&resource).unwrap().is_some());

        assert!(!locks.release(&resource, &txn("other")).unwrap());
        assert!(locks.release(&resource, &txn("t1")).unwrap());
        assert!(locks.holder(&resource).unwrap().is_none());
    }

    #[test]
    fn canonical_resource_handles_missing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("new.txt");
        let key = canonical_resource(&missing);
        assert_eq!(key, fs::canonicalize(tmp.path()).unwrap().join("new.txt"));
    }
}
