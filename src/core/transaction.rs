//! Transaction manager: the atomicity contract for file mutations.
//!
//! ```text
//! begin ──► OPEN ──backup/mutate──► commit   ──► COMMITTED
//!                                └─► rollback ──► ROLLED_BACK
//!                                              └► FAILED (a restore failed)
//! ```
//!
//! `begin` takes a lock per resource in sorted path order with a bounded
//! wait, so bursts of callers serialize instead of deadlocking. Every file is
//! backed up (and the backup logged) before it is touched; rollback restores
//! in reverse backup order. Status lives in the transaction log; the per
//! transaction record under `backups/<id>/transaction.json` only carries the
//! working data (resources, heartbeat, owner).

use crate::core::backup::{
    BackupEntry, BackupHandle, BackupStore, PruneReport, prune_cutoff_ms, write_atomic,
};
use crate::core::config::Config;
use crate::core::error::GuardError;
use crate::core::lock::{LockLease, LockOwner, LockTable, canonical_resource};
use crate::core::store::Store;
use crate::core::time;
use crate::core::txlog::{LogEvent, LogRecord, ResourceStatus, TransactionLog, TransactionSummary};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

const RECORD_FILE: &str = "transaction.json";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Open,
    Committed,
    RolledBack,
    Failed,
}

impl TxStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TxStatus::Open)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TxStatus::Open => "OPEN",
            TxStatus::Committed => "COMMITTED",
            TxStatus::RolledBack => "ROLLED_BACK",
            TxStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: String,
    pub kind: String,
    pub status: TxStatus,
    pub started_at_ms: u64,
    pub ended_at_ms: Option<u64>,
    pub heartbeat_at_ms: u64,
    /// Canonical paths whose locks this transaction holds, sorted.
    pub resources: Vec<PathBuf>,
    pub backed_up_files: Vec<BackupEntry>,
    pub log_offset: u64,
    pub owner_pid: u32,
    /// Begun from the command line; finalized by a later invocation.
    pub detached: bool,
}

impl Transaction {
    fn owner(&self) -> LockOwner {
        LockOwner::Transaction {
            txn_id: self.id.clone(),
        }
    }

    fn ensure_open(&self, action: &str) -> Result<(), GuardError> {
        if self.status.is_terminal() {
            return Err(GuardError::InvalidTransition {
                txn_id: self.id.clone(),
                status: self.status.to_string(),
                action: action.to_string(),
            });
        }
        Ok(())
    }
}

/// Result of a scoped [`TransactionManager::execute`] call.
#[derive(Debug)]
pub struct Executed<T> {
    pub value: T,
    pub transaction: Transaction,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub rolled_back: Vec<String>,
    pub auto_committed: Vec<String>,
    pub failed: Vec<String>,
    pub still_open: Vec<String>,
}

impl RecoveryReport {
    pub fn had_work(&self) -> bool {
        !(self.rolled_back.is_empty() && self.auto_committed.is_empty() && self.failed.is_empty())
    }
}

pub struct TransactionManager {
    config: Config,
    log: TransactionLog,
    backups: BackupStore,
    locks: LockTable,
}

impl TransactionManager {
    pub fn new(store: &Store, config: &Config) -> Self {
        let log = TransactionLog::new(config.transaction_log_path(store));
        Self {
            config: config.clone(),
            backups: BackupStore::new(store.backups_dir()),
            locks: LockTable::new(store.locks_dir(), log.clone()),
            log,
        }
    }

    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.config.lock_timeout_ms)
    }

    /// Opens a transaction for in-process use.
    pub fn begin(&self, kind: &str, resources: &[PathBuf]) -> Result<Transaction, GuardError> {
        self.begin_inner(kind, resources, false)
    }

    /// Opens a transaction that a later process will commit or roll back.
    pub fn begin_detached(
        &self,
        kind: &str,
        resources: &[PathBuf],
    ) -> Result<Transaction, GuardError> {
        self.begin_inner(kind, resources, true)
    }

    fn begin_inner(
        &self,
        kind: &str,
        resources: &[PathBuf],
        detached: bool,
    ) -> Result<Transaction, GuardError> {
        if kind.trim().is_empty() {
            return Err(GuardError::Config("transaction kind must not be empty".into()));
        }
        let id = time::new_event_id();
        let owner = LockOwner::Transaction { txn_id: id.clone() };

        let mut keys: Vec<PathBuf> = resources.iter().map(|p| canonical_resource(p)).collect();
        keys.sort();
        keys.dedup();

        // Sorted acquisition order rules out lock-ordering deadlocks.
        let mut leases: Vec<LockLease> = Vec::with_capacity(keys.len());
        for key in &keys {
            leases.push(self.locks.acquire(key, &owner, self.lock_timeout())?);
        }

        let record = LogRecord::new(&id, LogEvent::Begin, "")
            .with_kind(kind)
            .with_paths(&keys);
        let log_offset = self.log.append(&record)?;
        let now = record.ts_ms;

        let txn = Transaction {
            id,
            kind: kind.to_string(),
            status: TxStatus::Open,
            started_at_ms: now,
            ended_at_ms: None,
            heartbeat_at_ms: now,
            resources: keys,
            backed_up_files: Vec::new(),
            log_offset,
            owner_pid: std::process::id(),
            detached,
        };
        self.save(&txn)?;
        for lease in leases {
            lease.persist();
        }
        info!(txn = %txn.id, kind, resources = txn.resources.len(), "transaction started");
        Ok(txn)
    }

    pub fn load(&self, txn_id: &str) -> Result<Transaction, GuardError> {
        let summary = self.log.replay()?.remove(txn_id);
        let path = self.backups.txn_dir(txn_id).join(RECORD_FILE);
        let mut txn = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<Transaction>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => match &summary {
                // Crashed between BEGIN and the record write.
                Some(s) => from_summary(s),
                None => return Err(GuardError::UnknownTransaction(txn_id.to_string())),
            },
            Err(e) => return Err(GuardError::IoError(e)),
        };
        if let Some(s) = summary {
            txn.status = s.status;
            txn.ended_at_ms = s.ended_at_ms;
            txn.heartbeat_at_ms = txn.heartbeat_at_ms.max(s.last_activity_ms);
        }
        txn.backed_up_files = self.backups.load_index(txn_id)?.entries;
        Ok(txn)
    }

    fn save(&self, txn: &Transaction) -> Result<(), GuardError> {
        let path = self.backups.txn_dir(&txn.id).join(RECORD_FILE);
        write_atomic(&path, serde_json::to_string_pretty(txn)?.as_bytes())
    }

    /// Backs up `path` for an open transaction, taking its lock first if the
    /// transaction does not hold it yet.
    pub fn backup_file(
        &self,
        txn_id: &str,
        path: &Path,
        optional: bool,
    ) -> Result<BackupHandle, GuardError> {
        let mut txn = self.load(txn_id)?;
        txn.ensure_open("back up files")?;
        let key = canonical_resource(path);
        if let Some(entry) = txn.backed_up_files.iter().find(|e| e.original_path == key) {
            return Ok(BackupHandle {
                txn_id: txn_id.to_string(),
                entry: entry.clone(),
            });
        }

        if !txn.resources.contains(&key) {
            let lease = self.locks.acquire(&key, &txn.owner(), self.lock_timeout())?;
            txn.resources.push(key.clone());
            txn.resources.sort();
            self.save(&txn)?;
            lease.persist();
        }

        let handle = self.backups.backup(txn_id, &key, optional)?;
        let detail = match &handle.entry.sha256 {
            Some(sha) => format!("existed=true size={} sha256={}", handle.entry.size, sha),
            None => "existed=false".to_string(),
        };
        let record = LogRecord::new(txn_id, LogEvent::Backup, detail).with_paths([&key]);
        self.log.append(&record)?;
        txn.heartbeat_at_ms = record.ts_ms;
        txn.backed_up_files.push(handle.entry.clone());
        self.save(&txn)?;
        Ok(handle)
    }

    /// Marks the owner of an open transaction as still alive.
    pub fn heartbeat(&self, txn_id: &str) -> Result<Transaction, GuardError> {
        let mut txn = self.load(txn_id)?;
        txn.ensure_open("heartbeat")?;
        txn.heartbeat_at_ms = time::now_epoch_ms();
        self.save(&txn)?;
        Ok(txn)
    }

    pub fn commit(&self, txn_id: &str) -> Result<Transaction, GuardError> {
        self.commit_with_detail(txn_id, "")
    }

    pub fn commit_with_detail(&self, txn_id: &str, detail: &str) -> Result<Transaction, GuardError> {
        let mut txn = self.load(txn_id)?;
        txn.ensure_open("commit")?;
        let record = LogRecord::new(txn_id, LogEvent::Commit, detail);
        self.log.append(&record)?;
        txn.status = TxStatus::Committed;
        txn.ended_at_ms = Some(record.ts_ms);
        self.finish(&txn);
        info!(txn = txn_id, kind = %txn.kind, files = txn.backed_up_files.len(), "transaction committed");
        Ok(txn)
    }

    /// Restores every backed-up file in reverse order.
    ///
    /// If any restore fails the remaining files are still restored, the
    /// transaction becomes FAILED with the unrestored paths logged, and
    /// [`GuardError::RestoreFailure`] is returned.
    pub fn rollback(&self, txn_id: &str) -> Result<Transaction, GuardError> {
        let mut txn = self.load(txn_id)?;
        txn.ensure_open("roll back")?;

        let mut unrestored: Vec<PathBuf> = Vec::new();
        for entry in txn.backed_up_files.iter().rev() {
            let handle = BackupHandle {
                txn_id: txn_id.to_string(),
                entry: entry.clone(),
            };
            if self.backups.restore(&handle).is_err() {
                unrestored.push(entry.original_path.clone());
            }
        }

        if unrestored.is_empty() {
            let record = LogRecord::new(
                txn_id,
                LogEvent::Rollback,
                format!("restored {} file(s)", txn.backed_up_files.len()),
            );
            self.log.append(&record)?;
            txn.status = TxStatus::RolledBack;
            txn.ended_at_ms = Some(record.ts_ms);
            self.finish(&txn);
            info!(txn = txn_id, "transaction rolled back");
            return Ok(txn);
        }

        let record = LogRecord::new(
            txn_id,
            LogEvent::Fail,
            "restore failed; manual recovery required",
        )
        .with_paths(&unrestored);
        self.log.append(&record)?;
        txn.status = TxStatus::Failed;
        txn.ended_at_ms = Some(record.ts_ms);
        self.finish(&txn);
        error!(txn = txn_id, unrestored = ?unrestored, "rollback could not restore all files");
        Err(GuardError::RestoreFailure {
            txn_id: txn_id.to_string(),
            paths: unrestored,
        })
    }

    fn finish(&self, txn: &Transaction) {
        if let Err(e) = self.save(txn) {
            warn!(txn = %txn.id, error = %e, "could not update transaction record");
        }
        let owner = txn.owner();
        for resource in &txn.resources {
            if let Err(e) = self.locks.release(resource, &owner) {
                warn!(txn = %txn.id, resource = %resource.display(), error = %e, "lock release failed");
            }
        }
    }

    /// Runs `f` inside a transaction: commit on `Ok`, rollback on `Err`.
    ///
    /// A failing mutation surfaces as [`GuardError::MutationFailure`] after a
    /// clean rollback, or as [`GuardError::RestoreFailure`] when the rollback
    /// itself could not finish.
    pub fn execute<T, F>(
        &self,
        kind: &str,
        resources: &[PathBuf],
        f: F,
    ) -> Result<Executed<T>, GuardError>
    where
        F: FnOnce(&mut TxScope<'_>) -> Result<T, GuardError>,
    {
        let txn = self.begin(kind, resources)?;
        let mut scope = TxScope {
            manager: self,
            txn_id: txn.id.clone(),
            commit_detail: String::new(),
        };

        let outcome = f(&mut scope);
        let detail = std::mem::take(&mut scope.commit_detail);
        match outcome {
            Ok(value) => match self.commit_with_detail(&txn.id, &detail) {
                Ok(transaction) => Ok(Executed { value, transaction }),
                Err(err) => {
                    warn!(txn = %txn.id, error = %err, "commit failed; rolling back");
                    self.rollback(&txn.id)?;
                    Err(err)
                }
            },
            Err(err) => {
                warn!(txn = %txn.id, kind, error = %err, "mutation failed; rolling back");
                self.rollback(&txn.id)?;
                Err(GuardError::MutationFailure {
                    txn_id: txn.id,
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Resolves transactions left open by crashed or forgetful callers.
    ///
    /// - In-process transactions are rolled back once their owning process is
    ///   gone, and never touched while it lives. Where liveness cannot be
    ///   probed the staleness window applies instead.
    /// - Detached transactions idle (no heartbeat) for `AUTO_COMMIT_DELAY_MS`
    ///   are auto-committed when auto-commit is enabled. This is best-effort.
    /// - Detached transactions idle past the staleness window are rolled back.
    pub fn recover(&self) -> Result<RecoveryReport, GuardError> {
        let mut report = RecoveryReport::default();
        let now = time::now_epoch_ms();

        for summary in self.log.list_open_transactions()? {
            let txn = self.load(&summary.id)?;
            let idle_ms = now.saturating_sub(txn.heartbeat_at_ms);

            let action = if !txn.detached {
                match process_alive(txn.owner_pid) {
                    Some(true) => Recovery::Leave,
                    Some(false) => Recovery::Rollback,
                    None if idle_ms >= self.config.stale_after_ms => Recovery::Rollback,
                    None => Recovery::Leave,
                }
            } else if self.config.auto_commit_enabled()
                && idle_ms >= self.config.auto_commit_delay_ms
            {
                Recovery::AutoCommit
            } else if idle_ms >= self.config.stale_after_ms {
                Recovery::Rollback
            } else {
                Recovery::Leave
            };

            match action {
                Recovery::Leave => report.still_open.push(txn.id),
                Recovery::AutoCommit => {
                    warn!(txn = %txn.id, idle_ms, "auto-committing idle transaction");
                    self.commit_with_detail(&txn.id, &format!("auto-commit after {} ms idle", idle_ms))?;
                    report.auto_committed.push(txn.id);
                }
                Recovery::Rollback => {
                    warn!(txn = %txn.id, idle_ms, detached = txn.detached, "rolling back abandoned transaction");
                    match self.rollback(&txn.id) {
                        Ok(_) => report.rolled_back.push(txn.id),
                        Err(GuardError::RestoreFailure { .. }) => report.failed.push(txn.id),
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(report)
    }

    /// Deletes old backup sets, then compacts the log records of the
    /// transactions they belonged to.
    pub fn prune(&self, older_than_days: u64) -> Result<PruneReport, GuardError> {
        let mut report = self.backups.prune(older_than_days, &self.log.replay()?)?;
        report.log = self.log.compact(prune_cutoff_ms(older_than_days))?;
        Ok(report)
    }

    pub fn list(&self, open_only: bool) -> Result<Vec<TransactionSummary>, GuardError> {
        let mut txns: Vec<TransactionSummary> = self
            .log
            .replay()?
            .into_values()
            .filter(|t| !open_only || t.status == TxStatus::Open)
            .collect();
        txns.sort_by_key(|t| t.log_offset);
        Ok(txns)
    }

    pub fn current_status(&self, path: &Path) -> Result<ResourceStatus, GuardError> {
        let key = canonical_resource(path);
        self.log.current_status(&key.to_string_lossy())
    }
}

enum Recovery {
    Leave,
    AutoCommit,
    Rollback,
}

/// Mutation surface handed to [`TransactionManager::execute`] callbacks.
/// Every write or delete backs the file up first.
pub struct TxScope<'a> {
    manager: &'a TransactionManager,
    txn_id: String,
    commit_detail: String,
}

impl TxScope<'_> {
    pub fn id(&self) -> &str {
        &self.txn_id
    }

    pub fn backup(&mut self, path: &Path, optional: bool) -> Result<BackupHandle, GuardError> {
        self.manager.backup_file(&self.txn_id, path, optional)
    }

    pub fn read(&self, path: &Path) -> Result<Vec<u8>, GuardError> {
        fs::read(path).map_err(GuardError::IoError)
    }

    pub fn write(&mut self, path: &Path, content: &[u8]) -> Result<(), GuardError> {
        self.backup(path, true)?;
        write_atomic(path, content)
    }

    pub fn remove(&mut self, path: &Path) -> Result<(), GuardError> {
        self.backup(path, false)?;
        fs::remove_file(path).map_err(GuardError::IoError)
    }

    /// Free-form text recorded on the COMMIT log record.
    pub fn note(&mut self, detail: impl Into<String>) {
        self.commit_detail = detail.into();
    }
}

fn from_summary(s: &TransactionSummary) -> Transaction {
    Transaction {
        id: s.id.clone(),
        kind: s.kind.clone(),
        status: s.status,
        started_at_ms: s.started_at_ms,
        ended_at_ms: s.ended_at_ms,
        heartbeat_at_ms: s.last_activity_ms,
        resources: s.resources.iter().map(PathBuf::from).collect(),
        backed_up_files: Vec::new(),
        log_offset: s.log_offset,
        owner_pid: 0,
        detached: true,
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> Option<bool> {
    Some(pid != 0 && Path::new(&format!("/proc/{}", pid)).exists())
}

// Without /proc there is no cheap liveness probe; callers fall back to the
// staleness window.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> Option<bool> {
    None
}
