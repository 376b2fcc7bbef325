//! projguard: transactional file mutation and project integrity.
//!
//! Structured project manifests get edited by people, generators and
//! scripts. projguard makes those edits safe and keeps the tree consistent:
//!
//! - **Transactions**: every mutation is preceded by a backup, recorded in
//!   an append-only log, and either committed or rolled back as a whole.
//! - **Integrity checks**: the manifest is audited against the filesystem at
//!   a chosen depth and every defect is classified and ranked.
//! - **Self-healing**: suggested fixes are applied under a policy, each in
//!   its own transaction.
//!
//! # State layout
//!
//! ```text
//! <project>/.projguard/
//!   config.toml            optional settings (env vars override)
//!   logs/transactions.jsonl
//!   backups/<txn-id>/      index.json, files/<n>.bak, transaction.json
//!   locks/<sha256>.lock    one per locked resource
//!   sync.marker            manifest digest at the last sync
//! ```
//!
//! # Examples
//!
//! ```bash
//! txn=$(projguard --format json transaction begin EDIT | jq -r .transaction.id)
//! projguard transaction backup_file "$txn" project.json
//! # ... edit project.json ...
//! projguard transaction commit "$txn"
//!
//! projguard integrity check . detailed
//! projguard repair . guided
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: store, log, locks, backups, transactions, manifest codec
//! - [`integrity`]: the read-only checker and its validator registry
//! - [`heal`]: the self-healer and its approval capability

mod cli;
pub mod core;
pub mod heal;
pub mod integrity;

use crate::core::{
    config::Config,
    error::{EXIT_OK, EXIT_PARTIAL, EXIT_RESTORE_FAILED, GuardError},
    output::{self, OutputFormat},
    store::Store,
    telemetry,
    transaction::TransactionManager,
};
use clap::Parser;
use cli::{Cli, Command, IntegrityCommand, TransactionCommand};
use colored::Colorize;
use heal::approval::{Approver, DenyAll, TerminalApprover};
use heal::{RepairPolicy, SelfHealer};
use integrity::{CheckMode, IntegrityChecker, Severity};
use serde_json::json;
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing::{info, warn};

/// Parses the command line, runs it and returns the process exit code.
pub fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return e.exit_code();
        }
    };
    let format = cli.format;
    match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            report_error(format, &err);
            err.exit_code()
        }
    }
}

fn report_error(format: OutputFormat, err: &GuardError) {
    match format {
        OutputFormat::Json => output::emit(
            format,
            "error",
            "error",
            json!({
                "error": { "code": err.code(), "message": err.to_string() },
                "exit_code": err.exit_code(),
            }),
            "",
        ),
        OutputFormat::Text => eprintln!("{} {}", "error:".bright_red().bold(), err),
    }
}

fn dispatch(cli: Cli) -> Result<i32, GuardError> {
    let project_root: PathBuf = match &cli.command {
        Command::Integrity(group) => match &group.command {
            IntegrityCommand::Check { project_path, .. } => project_path.clone(),
        },
        Command::Repair(repair) => repair.project_path.clone(),
        Command::Transaction(_) => match &cli.project {
            Some(p) => p.clone(),
            None => std::env::current_dir()?,
        },
    };
    let store = Store::for_project(&project_root)?;
    let config = Config::load(&store)?;
    telemetry::initialise(&config)?;
    if cli.format == OutputFormat::Json || !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }

    // Arguments are validated before anything on disk can change.
    let request = match cli.command {
        Command::Transaction(group) => Request::Transaction(group.command),
        Command::Integrity(group) => match group.command {
            IntegrityCommand::Check { mode, .. } => Request::Check(match mode {
                Some(raw) => raw.parse()?,
                None => config.integrity_check_mode,
            }),
        },
        Command::Repair(repair) => Request::Repair(repair.policy.parse()?),
    };

    let manager = TransactionManager::new(&store, &config);
    let explicit_recover = matches!(request, Request::Transaction(TransactionCommand::Recover));
    if config.error_handling_enabled && !explicit_recover {
        startup_recovery(&manager);
    }

    let format = cli.format;
    match request {
        Request::Transaction(command) => {
            store.ensure_layout()?;
            run_transaction(command, &store, &config, &manager, format)
        }
        Request::Check(mode) => run_check(mode, &store, &config, format),
        Request::Repair(policy) => run_repair(policy, &store, &config, format),
    }
}

/// A parsed invocation with its free-form arguments already validated.
enum Request {
    Transaction(TransactionCommand),
    Check(CheckMode),
    Repair(RepairPolicy),
}

/// Resolves transactions a previous invocation left behind. Never fails the
/// command that triggered it.
fn startup_recovery(manager: &TransactionManager) {
    match manager.recover() {
        Ok(report) if report.had_work() => info!(
            rolled_back = report.rolled_back.len(),
            auto_committed = report.auto_committed.len(),
            failed = report.failed.len(),
            "startup recovery sweep resolved abandoned transactions"
        ),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "startup recovery sweep failed"),
    }
}

fn run_transaction(
    command: TransactionCommand,
    store: &Store,
    config: &Config,
    manager: &TransactionManager,
    format: OutputFormat,
) -> Result<i32, GuardError> {
    match command {
        TransactionCommand::Begin { kind, paths } => {
            let resources: Vec<PathBuf> = if paths.is_empty() {
                vec![config.manifest_path(store)]
            } else {
                paths.iter().map(|p| store.resolve(p)).collect()
            };
            let txn = manager.begin_detached(&kind, &resources)?;
            let text = output::render_transaction(&txn);
            output::emit(format, "transaction.begin", "ok", json!({ "transaction": txn }), &text);
        }
        TransactionCommand::BackupFile {
            txn_id,
            path,
            optional,
        } => {
            let handle = manager.backup_file(&txn_id, &store.resolve(&path), optional)?;
            let text = format!(
                "backed up {} in {} ({})\n",
                handle.entry.original_path.display(),
                handle.txn_id,
                if handle.entry.original_existed {
                    "copy"
                } else {
                    "placeholder"
                }
            );
            output::emit(format, "transaction.backup_file", "ok", json!({ "backup": handle }), &text);
        }
        TransactionCommand::Commit { txn_id } => {
            let txn = manager.commit(&txn_id)?;
            let text = output::render_transaction(&txn);
            output::emit(format, "transaction.commit", "ok", json!({ "transaction": txn }), &text);
        }
        TransactionCommand::Rollback { txn_id } => {
            let txn = manager.rollback(&txn_id)?;
            let text = output::render_transaction(&txn);
            output::emit(format, "transaction.rollback", "ok", json!({ "transaction": txn }), &text);
        }
        TransactionCommand::Heartbeat { txn_id } => {
            let txn = manager.heartbeat(&txn_id)?;
            let text = output::render_transaction(&txn);
            output::emit(format, "transaction.heartbeat", "ok", json!({ "transaction": txn }), &text);
        }
        TransactionCommand::List { open, tail } => match tail {
            Some(n) => {
                let records = manager.log().tail(n)?;
                let text = output::render_records(&records);
                output::emit(format, "transaction.list", "ok", json!({ "records": records }), &text);
            }
            None => {
                let txns = manager.list(open)?;
                let text = output::render_summaries(&txns);
                output::emit(format, "transaction.list", "ok", json!({ "transactions": txns }), &text);
            }
        },
        TransactionCommand::Status { path } => {
            let resolved = store.resolve(&path);
            let status = manager.current_status(&resolved)?;
            let shown = resolved.display().to_string();
            let text = output::render_status(&shown, &status);
            output::emit(
                format,
                "transaction.status",
                "ok",
                json!({ "resource": shown, "status": status }),
                &text,
            );
        }
        TransactionCommand::Recover => {
            let report = manager.recover()?;
            let status = if report.failed.is_empty() { "ok" } else { "error" };
            let text = output::render_recovery(&report);
            output::emit(format, "transaction.recover", status, json!({ "recovery": report }), &text);
            if !report.failed.is_empty() {
                return Ok(EXIT_RESTORE_FAILED);
            }
        }
        TransactionCommand::Prune { days } => {
            let days = days.unwrap_or(config.keep_backup_days);
            let report = manager.prune(days)?;
            let text = format!(
                "pruned {} backup set(s) older than {} day(s); kept {} open, {} failed, {} recent; dropped {} log segment(s)\n",
                report.removed.len(),
                days,
                report.kept_open,
                report.kept_failed,
                report.kept_recent,
                report.log.removed_segments
            );
            output::emit(format, "transaction.prune", "ok", json!({ "prune": report }), &text);
        }
    }
    Ok(EXIT_OK)
}

fn run_check(
    mode: CheckMode,
    store: &Store,
    config: &Config,
    format: OutputFormat,
) -> Result<i32, GuardError> {
    let issues = IntegrityChecker::new(config).check(&store.project_root, mode)?;

    if config.auto_repair && issues.iter().any(|i| i.suggested_fix.is_some()) {
        info!(issues = issues.len(), "AUTO_REPAIR set; repairing automatically");
        let healer = SelfHealer::new(config).with_mode(mode);
        let report =
            healer.repair_issues(&store.project_root, &issues, RepairPolicy::Automatic, &mut DenyAll)?;
        let text = format!(
            "{}{}",
            output::render_issues(mode, &issues),
            output::render_repair(&report)
        );
        let code = report.exit_code();
        output::emit(
            format,
            "integrity.check",
            if code == EXIT_OK { "ok" } else { "partial" },
            json!({
                "mode": mode,
                "issues": issues,
                "summary": integrity::CheckSummary::of(&issues),
                "repair": report,
            }),
            &text,
        );
        return Ok(code);
    }

    // Info-level findings are advisory and do not fail the check.
    let code = if issues.iter().any(|i| i.severity >= Severity::Warning) {
        EXIT_PARTIAL
    } else {
        EXIT_OK
    };
    let text = output::render_issues(mode, &issues);
    output::emit(
        format,
        "integrity.check",
        if code == EXIT_OK { "ok" } else { "issues" },
        json!({
            "mode": mode,
            "issues": issues,
            "summary": integrity::CheckSummary::of(&issues),
        }),
        &text,
    );
    Ok(code)
}

fn run_repair(
    policy: RepairPolicy,
    store: &Store,
    config: &Config,
    format: OutputFormat,
) -> Result<i32, GuardError> {
    let mut approver: Box<dyn Approver> = match policy {
        RepairPolicy::Automatic => Box::new(DenyAll),
        RepairPolicy::Interactive | RepairPolicy::Guided => Box::new(TerminalApprover::stdio()),
    };
    let report = SelfHealer::new(config).repair(&store.project_root, policy, approver.as_mut())?;
    let code = report.exit_code();
    let status = match code {
        EXIT_OK => "ok",
        EXIT_RESTORE_FAILED => "error",
        _ => "partial",
    };
    let text = output::render_repair(&report);
    output::emit(format, "repair", status, json!({ "report": report }), &text);
    Ok(code)
}
