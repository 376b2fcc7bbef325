use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Exit code for a clean run.
pub const EXIT_OK: i32 = 0;
/// Exit code when the command completed but left issues unresolved, or a
/// resource was busy and the caller may retry later.
pub const EXIT_PARTIAL: i32 = 1;
/// Exit code for invalid arguments or configuration.
pub const EXIT_INVALID: i32 = 2;
/// Exit code for unrecoverable internal failures.
pub const EXIT_INTERNAL: i32 = 3;
/// Exit code when a rollback could not restore every file.
pub const EXIT_RESTORE_FAILED: i32 = 4;

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Resource busy: {resource} is locked by {holder}")]
    ResourceBusy { resource: PathBuf, holder: String },
    #[error("Backup failed for {path}: {reason}")]
    BackupFailure { path: PathBuf, reason: String },
    #[error("Mutation failed in transaction {txn_id}: {reason}")]
    MutationFailure { txn_id: String, reason: String },
    #[error("Rollback of transaction {txn_id} could not restore: {}", format_paths(.paths))]
    RestoreFailure { txn_id: String, paths: Vec<PathBuf> },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Transaction {txn_id} is {status}; cannot {action}")]
    InvalidTransition {
        txn_id: String,
        status: String,
        action: String,
    },
    #[error("Unknown transaction: {0}")]
    UnknownTransaction(String),
    #[error("Manifest error: {0}")]
    Manifest(String),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
}

impl GuardError {
    /// Maps the error onto the command-line exit code contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            GuardError::Config(_) => EXIT_INVALID,
            GuardError::TomlError(_) => EXIT_INVALID,
            GuardError::UnknownTransaction(_) => EXIT_INVALID,
            GuardError::InvalidTransition { .. } => EXIT_INVALID,
            GuardError::ResourceBusy { .. } => EXIT_PARTIAL,
            GuardError::RestoreFailure { .. } => EXIT_RESTORE_FAILED,
            GuardError::BackupFailure { .. }
            | GuardError::MutationFailure { .. }
            | GuardError::NotFound(_)
            | GuardError::Manifest(_)
            | GuardError::IoError(_)
            | GuardError::JsonError(_) => EXIT_INTERNAL,
        }
    }

    /// Short machine-readable tag used in command envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            GuardError::Config(_) | GuardError::TomlError(_) => "CONFIG_ERROR",
            GuardError::ResourceBusy { .. } => "RESOURCE_BUSY",
            GuardError::BackupFailure { .. } => "BACKUP_FAILURE",
            GuardError::MutationFailure { .. } => "MUTATION_FAILURE",
            GuardError::RestoreFailure { .. } => "RESTORE_FAILURE",
            GuardError::NotFound(_) => "NOT_FOUND",
            GuardError::InvalidTransition { .. } => "INVALID_TRANSITION",
            GuardError::UnknownTransaction(_) => "UNKNOWN_TRANSACTION",
            GuardError::Manifest(_) => "MANIFEST_ERROR",
            GuardError::IoError(_) => "IO_ERROR",
            GuardError::JsonError(_) => "JSON_ERROR",
        }
    }
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
