//! CLI struct definitions for the projguard command-line interface.
//!
//! All clap-derived types live here. Dispatch logic lives in `lib.rs`.

use crate::core::output::OutputFormat;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "projguard",
    version = env!("CARGO_PKG_VERSION"),
    about = "Transactional edits, integrity checks and self-healing repairs for project manifests."
)]
pub(crate) struct Cli {
    /// Project directory holding the manifest and `.projguard/` state (defaults to cwd).
    #[clap(long, global = true)]
    pub project: Option<PathBuf>,
    /// Output format: 'text' or 'json'.
    #[clap(long, global = true, value_enum, default_value = "text")]
    pub format: OutputFormat,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Begin, back up, commit and roll back file transactions
    Transaction(TransactionCli),

    /// Audit the manifest and its resource tree
    Integrity(IntegrityCli),

    /// Apply suggested fixes for integrity issues
    Repair(RepairCli),
}

#[derive(clap::Args, Debug)]
pub(crate) struct TransactionCli {
    #[clap(subcommand)]
    pub command: TransactionCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum TransactionCommand {
    /// Open a transaction and lock its resources (default: the manifest)
    Begin {
        /// Operation kind recorded in the log (e.g. EDIT, REPAIR).
        kind: String,
        /// Files to lock; relative paths resolve against the project.
        paths: Vec<PathBuf>,
    },
    /// Back up a file before mutating it
    #[clap(name = "backup_file", alias = "backup-file")]
    BackupFile {
        txn_id: String,
        path: PathBuf,
        /// Record a placeholder when the file does not exist yet.
        #[clap(long)]
        optional: bool,
    },
    /// Finalize a transaction and release its locks
    Commit { txn_id: String },
    /// Restore every backed-up file and release the locks
    Rollback { txn_id: String },
    /// Mark a long-running transaction as still alive
    Heartbeat { txn_id: String },
    /// List transactions reconstructed from the log
    List {
        /// Only transactions that are still open.
        #[clap(long)]
        open: bool,
        /// Print the last N raw log records instead.
        #[clap(long)]
        tail: Option<usize>,
    },
    /// Show whether a file is part of an open transaction
    Status { path: PathBuf },
    /// Roll back or finalize abandoned transactions
    Recover,
    /// Delete backups of finished transactions
    Prune {
        /// Age threshold in days (defaults to KEEP_BACKUP_DAYS).
        #[clap(long)]
        days: Option<u64>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct IntegrityCli {
    #[clap(subcommand)]
    pub command: IntegrityCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum IntegrityCommand {
    /// Check the project and print issues, Critical first
    Check {
        project_path: PathBuf,
        /// 'minimal', 'normal' or 'detailed' (defaults to INTEGRITY_CHECK_MODE).
        mode: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct RepairCli {
    pub project_path: PathBuf,
    /// 'interactive', 'guided' or 'automatic'.
    pub policy: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backup_file_with_underscore_name() {
        let cli = Cli::try_parse_from([
            "projguard",
            "transaction",
            "backup_file",
            "01J0",
            "a.txt",
            "--optional",
        ])
        .unwrap();
        match cli.command {
            Command::Transaction(TransactionCli {
                command: TransactionCommand::BackupFile { optional, .. },
            }) => assert!(optional),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "projguard",
            "integrity",
            "check",
            ".",
            "detailed",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
    }
}
