//! Append-only transaction log.
//!
//! One JSON object per line. Every append is flushed to disk before it
//! returns, so a crash leaves a consistent prefix; a torn trailing line is
//! skipped on replay. The log is the single source of truth for transaction
//! status: "which transactions are open" and "what is the state of resource X"
//! are both answered by replaying it.
//!
//! `prune` rotates the active file into `<name>.<ulid>` segments and drops
//! settled segments whose transactions all finished before the retention
//! cutoff, which keeps replay bounded.

use crate::core::error::GuardError;
use crate::core::time;
use crate::core::transaction::TxStatus;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogEvent {
    Begin,
    Backup,
    Commit,
    Rollback,
    Fail,
}

impl LogEvent {
    pub fn terminal_status(self) -> Option<TxStatus> {
        match self {
            LogEvent::Commit => Some(TxStatus::Committed),
            LogEvent::Rollback => Some(TxStatus::RolledBack),
            LogEvent::Fail => Some(TxStatus::Failed),
            LogEvent::Begin | LogEvent::Backup => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub ts: String,
    pub ts_ms: u64,
    pub event_id: String,
    pub txn_id: String,
    pub event: LogEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    #[serde(default)]
    pub detail: String,
}

impl LogRecord {
    pub fn new(txn_id: &str, event: LogEvent, detail: impl Into<String>) -> Self {
        Self {
            ts: time::now_epoch_z(),
            ts_ms: time::now_epoch_ms(),
            event_id: time::new_event_id(),
            txn_id: txn_id.to_string(),
            event,
            kind: None,
            paths: Vec::new(),
            detail: detail.into(),
        }
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_string());
        self
    }

    pub fn with_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.paths = paths
            .into_iter()
            .map(|p| p.as_ref().to_string_lossy().to_string())
            .collect();
        self
    }
}

/// A transaction reconstructed from its log records.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TransactionSummary {
    pub id: String,
    pub kind: String,
    pub status: TxStatus,
    pub started_at_ms: u64,
    pub ended_at_ms: Option<u64>,
    pub last_activity_ms: u64,
    pub resources: Vec<String>,
    pub backed_up: Vec<String>,
    /// Paths a failed rollback could not restore.
    pub unrestored: Vec<String>,
    pub log_offset: u64,
}

impl TransactionSummary {
    pub fn touches(&self, resource: &str) -> bool {
        self.resources.iter().any(|r| r == resource) || self.backed_up.iter().any(|r| r == resource)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResourceStatus {
    Idle,
    Transaction { txn_id: String, status: TxStatus },
}

/// Outcome of [`TransactionLog::compact`].
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactReport {
    /// Whether the active file was moved into an archived segment.
    pub rotated: bool,
    pub removed_segments: usize,
    pub removed_records: usize,
}

/// Archived segments younger than this may still receive a late append from
/// a writer that opened the active file just before rotation.
const SEGMENT_SETTLE_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct TransactionLog {
    path: PathBuf,
}

impl TransactionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record and syncs it. Returns the position the record
    /// starts at, counted across archived segments and the active file.
    pub fn append(&self, record: &LogRecord) -> Result<u64, GuardError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(GuardError::IoError)?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut f = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(GuardError::IoError)?;
        let len = f.metadata().map_err(GuardError::IoError)?.len();
        // Terminate a torn tail left by a crash so this record gets its own line.
        let torn = len > 0 && last_byte(&mut f)? != Some(b'\n');
        if torn {
            debug!(len, "terminating torn trailing log line");
            line.insert(0, '\n');
        }
        let offset = self.archived_len()? + len + u64::from(torn);
        // A single write keeps concurrent appenders from interleaving within a line.
        f.write_all(line.as_bytes()).map_err(GuardError::IoError)?;
        f.sync_data().map_err(GuardError::IoError)?;
        debug!(txn = %record.txn_id, event = ?record.event, offset, "appended log record");
        Ok(offset)
    }

    /// Reads every well-formed record with its position, oldest segment first.
    pub fn records(&self) -> Result<Vec<(u64, LogRecord)>, GuardError> {
        let mut out = Vec::new();
        let mut base = 0u64;
        for segment in self.segments()? {
            base += read_segment(&segment, base, &mut out)?;
        }
        Ok(out)
    }

    /// Folds the log into one summary per transaction, keyed by id.
    pub fn replay(&self) -> Result<BTreeMap<String, TransactionSummary>, GuardError> {
        Ok(fold(self.records()?))
    }

    /// Transactions with a BEGIN and no COMMIT/ROLLBACK/FAIL.
    pub fn list_open_transactions(&self) -> Result<Vec<TransactionSummary>, GuardError> {
        let mut open: Vec<TransactionSummary> = self
            .replay()?
            .into_values()
            .filter(|t| t.status == TxStatus::Open)
            .collect();
        open.sort_by_key(|t| t.log_offset);
        Ok(open)
    }

    pub fn tail(&self, n: usize) -> Result<Vec<LogRecord>, GuardError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut window: VecDeque<LogRecord> = VecDeque::new();
        for (_, record) in self.records()? {
            if window.len() == n {
                window.pop_front();
            }
            window.push_back(record);
        }
        Ok(window.into_iter().collect())
    }

    pub fn status_of(&self, txn_id: &str) -> Result<Option<TxStatus>, GuardError> {
        Ok(self.replay()?.get(txn_id).map(|t| t.status))
    }

    /// State of the most recent transaction touching `resource`.
    pub fn current_status(&self, resource: &str) -> Result<ResourceStatus, GuardError> {
        let latest = self
            .replay()?
            .into_values()
            .filter(|t| t.touches(resource))
            .max_by_key(|t| t.log_offset);
        Ok(match latest {
            Some(t) => ResourceStatus::Transaction {
                txn_id: t.id,
                status: t.status,
            },
            None => ResourceStatus::Idle,
        })
    }

    /// Moves the active file into an archived segment and deletes archived
    /// segments that only hold transactions which committed or rolled back
    /// at or before `cutoff_ms`. Segments touching open or failed
    /// transactions are kept.
    pub fn compact(&self, cutoff_ms: u64) -> Result<CompactReport, GuardError> {
        self.compact_settled(cutoff_ms, SEGMENT_SETTLE_MS)
    }

    fn compact_settled(&self, cutoff_ms: u64, settle_ms: u64) -> Result<CompactReport, GuardError> {
        let mut report = CompactReport {
            rotated: self.rotate()?,
            ..CompactReport::default()
        };
        let txns = self.replay()?;
        let now = time::now_epoch_ms();

        for segment in self.archived_segments()? {
            let settled = modified_ms(&segment).is_some_and(|m| now.saturating_sub(m) >= settle_ms);
            if !settled {
                continue;
            }
            let mut records = Vec::new();
            read_segment(&segment, 0, &mut records)?;
            let finished = records.iter().all(|(_, r)| match txns.get(&r.txn_id) {
                Some(t) => {
                    matches!(t.status, TxStatus::Committed | TxStatus::RolledBack)
                        && t.ended_at_ms.is_some_and(|end| end <= cutoff_ms)
                }
                // Orphan records whose BEGIN was compacted earlier.
                None => true,
            });
            if finished {
                fs::remove_file(&segment).map_err(GuardError::IoError)?;
                report.removed_segments += 1;
                report.removed_records += records.len();
            }
        }
        if report.removed_segments > 0 {
            info!(
                segments = report.removed_segments,
                records = report.removed_records,
                "compacted transaction log"
            );
        }
        Ok(report)
    }

    /// Renames a non-empty active file to `<name>.<ulid>`. Writers that
    /// opened it before the rename finish their line in the archived segment,
    /// which is still read on replay.
    fn rotate(&self) -> Result<bool, GuardError> {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.len() > 0 => {}
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(GuardError::IoError(e)),
        }
        let mut archived = self.path.clone().into_os_string();
        archived.push(format!(".{}", time::new_event_id()));
        fs::rename(&self.path, &archived).map_err(GuardError::IoError)?;
        debug!(segment = %Path::new(&archived).display(), "rotated transaction log");
        Ok(true)
    }

    /// Archived segments in creation order.
    fn archived_segments(&self) -> Result<Vec<PathBuf>, GuardError> {
        let (Some(dir), Some(name)) = (self.path.parent(), self.path.file_name()) else {
            return Ok(Vec::new());
        };
        let prefix = format!("{}.", name.to_string_lossy());
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(GuardError::IoError(e)),
        };
        let mut segments = Vec::new();
        for entry in entries {
            let entry = entry.map_err(GuardError::IoError)?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let is_segment = file_name
                .strip_prefix(&prefix)
                .is_some_and(|suffix| suffix.len() == 26 && suffix.chars().all(|c| c.is_ascii_alphanumeric()));
            if is_segment {
                segments.push(entry.path());
            }
        }
        // ULID suffixes sort chronologically.
        segments.sort();
        Ok(segments)
    }

    fn segments(&self) -> Result<Vec<PathBuf>, GuardError> {
        let mut segments = self.archived_segments()?;
        segments.push(self.path.clone());
        Ok(segments)
    }

    fn archived_len(&self) -> Result<u64, GuardError> {
        let mut total = 0;
        for segment in self.archived_segments()? {
            total += fs::metadata(&segment).map(|m| m.len()).unwrap_or(0);
        }
        Ok(total)
    }
}

/// Appends the well-formed records of one segment to `out`, positioned from
/// `base`. Returns the number of bytes read.
fn read_segment(path: &Path, base: u64, out: &mut Vec<(u64, LogRecord)>) -> Result<u64, GuardError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(GuardError::IoError(e)),
    };
    let mut reader = BufReader::new(file);
    let mut offset = 0u64;
    let mut buf = String::new();
    loop {
        buf.clear();
        let read = reader.read_line(&mut buf).map_err(GuardError::IoError)?;
        if read == 0 {
            break;
        }
        let line = buf.trim();
        if !line.is_empty() {
            match serde_json::from_str::<LogRecord>(line) {
                Ok(record) => out.push((base + offset, record)),
                Err(e) => debug!(offset, segment = %path.display(), error = %e, "skipping unreadable log line"),
            }
        }
        offset += read as u64;
    }
    Ok(offset)
}

fn fold(records: Vec<(u64, LogRecord)>) -> BTreeMap<String, TransactionSummary> {
    let mut txns: BTreeMap<String, TransactionSummary> = BTreeMap::new();
    for (offset, record) in records {
        match record.event {
            LogEvent::Begin => {
                txns.insert(
                    record.txn_id.clone(),
                    TransactionSummary {
                        id: record.txn_id.clone(),
                        kind: record.kind.clone().unwrap_or_default(),
                        status: TxStatus::Open,
                        started_at_ms: record.ts_ms,
                        ended_at_ms: None,
                        last_activity_ms: record.ts_ms,
                        resources: record.paths.clone(),
                        backed_up: Vec::new(),
                        unrestored: Vec::new(),
                        log_offset: offset,
                    },
                );
            }
            event => {
                let Some(summary) = txns.get_mut(&record.txn_id) else {
                    debug!(txn = %record.txn_id, "record without BEGIN ignored");
                    continue;
                };
                summary.last_activity_ms = summary.last_activity_ms.max(record.ts_ms);
                if event == LogEvent::Backup {
                    summary.backed_up.extend(record.paths.iter().cloned());
                } else if let Some(status) = event.terminal_status() {
                    if summary.status == TxStatus::Open {
                        summary.status = status;
                        summary.ended_at_ms = Some(record.ts_ms);
                        if event == LogEvent::Fail {
                            summary.unrestored = record.paths.clone();
                        }
                    }
                }
            }
        }
    }
    txns
}

fn last_byte(f: &mut File) -> Result<Option<u8>, GuardError> {
    let mut byte = [0u8; 1];
    f.seek(SeekFrom::End(-1)).map_err(GuardError::IoError)?;
    match f.read(&mut byte).map_err(GuardError::IoError)? {
        1 => Ok(Some(byte[0])),
        _ => Ok(None),
    }
}

fn modified_ms(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.duration_since(std::time::UNIX_EPOCH).ok()?.as_millis() as u64)
}
