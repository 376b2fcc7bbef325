//! Output rendering for CLI surfaces.
//!
//! Every command produces one summary: a JSON envelope (see
//! [`crate::core::time::command_envelope`]) or a bounded text block with
//! coloured status tags.

use crate::core::time;
use crate::core::transaction::{RecoveryReport, Transaction};
use crate::core::txlog::{LogRecord, ResourceStatus, TransactionSummary};
use crate::heal::{RepairOutcome, RepairReport};
use crate::integrity::{CheckMode, CheckSummary, IntegrityIssue, Severity};
use colored::{ColoredString, Colorize};
use serde_json::Value as JsonValue;
use std::fmt::Write as _;

const DESCRIPTION_CHARS: usize = 120;

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Prints `text` or the envelope for `cmd` depending on `format`.
pub fn emit(format: OutputFormat, cmd: &str, status: &str, payload: JsonValue, text: &str) {
    match format {
        OutputFormat::Json => {
            let envelope = time::command_envelope(cmd, status, payload);
            println!("{}", envelope);
        }
        OutputFormat::Text => print!("{}", text),
    }
}

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

/// Render up to `max_items` entries joined by ` | `.
pub fn preview_list(items: &[String], max_items: usize) -> String {
    let shown = items
        .iter()
        .take(max_items)
        .cloned()
        .collect::<Vec<_>>()
        .join(" | ");
    if items.len() > max_items {
        format!("{} (+{} more)", shown, items.len() - max_items)
    } else {
        shown
    }
}

pub fn severity_tag(severity: Severity) -> ColoredString {
    match severity {
        Severity::Critical => "CRITICAL".bright_red().bold(),
        Severity::Error => "ERROR".red(),
        Severity::Warning => "WARN".yellow(),
        Severity::Info => "INFO".cyan(),
    }
}

pub fn outcome_tag(outcome: RepairOutcome) -> ColoredString {
    match outcome {
        RepairOutcome::Applied => "APPLIED".green(),
        RepairOutcome::Skipped => "SKIPPED".yellow(),
        RepairOutcome::Deferred => "DEFERRED".yellow(),
        RepairOutcome::Failed => "FAILED".bright_red().bold(),
        RepairOutcome::Unresolved => "UNRESOLVED".red(),
    }
}

pub fn render_issues(mode: CheckMode, issues: &[IntegrityIssue]) -> String {
    let mut out = String::new();
    if issues.is_empty() {
        let _ = writeln!(out, "{} integrity check ({}): no issues", "✓".bright_green(), mode);
        return out;
    }
    for issue in issues {
        let fix = if issue.suggested_fix.is_some() { " [fixable]" } else { "" };
        let _ = writeln!(
            out,
            "{} {:<8} {} {}: {}{}",
            issue.id,
            severity_tag(issue.severity),
            issue.affected_path.display(),
            format!("{:?}", issue.category).dimmed(),
            compact_line(&issue.description, DESCRIPTION_CHARS),
            fix.bright_cyan()
        );
    }
    let summary = CheckSummary::of(issues);
    let counts = summary
        .by_severity
        .iter()
        .rev()
        .map(|(k, v)| format!("{} {:?}", v, k).to_lowercase())
        .collect::<Vec<_>>()
        .join(", ");
    let _ = writeln!(
        out,
        "integrity check ({}): {} issue(s): {}; {} fixable",
        mode, summary.total, counts, summary.fixable
    );
    out
}

pub fn render_repair(report: &RepairReport) -> String {
    let mut out = String::new();
    for action in &report.actions {
        let _ = writeln!(
            out,
            "{} {:<10} {} {}",
            action.issue.id,
            outcome_tag(action.outcome),
            action.issue.affected_path.display(),
            compact_line(&action.detail, DESCRIPTION_CHARS)
        );
    }
    let _ = writeln!(
        out,
        "repair ({}): applied {}, skipped {}, deferred {}, failed {}, unresolved {}",
        report.policy, report.applied, report.skipped, report.deferred, report.failed, report.unresolved
    );
    if report.restore_failures > 0 {
        let _ = writeln!(
            out,
            "{} {} rollback(s) did not finish; inspect the backups before editing further",
            "✗".bright_red(),
            report.restore_failures
        );
    }
    out
}

pub fn render_transaction(txn: &Transaction) -> String {
    let resources: Vec<String> = txn
        .resources
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    format!(
        "{} {} {} backups={} resources: {}\n",
        txn.id,
        txn.kind,
        txn.status.as_str().bold(),
        txn.backed_up_files.len(),
        preview_list(&resources, 3)
    )
}

pub fn render_summaries(summaries: &[TransactionSummary]) -> String {
    if summaries.is_empty() {
        return "no transactions\n".to_string();
    }
    let mut out = String::new();
    for s in summaries {
        let _ = writeln!(
            out,
            "{} {:<10} {:<12} backups={} resources: {}",
            s.id,
            s.kind,
            s.status.as_str(),
            s.backed_up.len(),
            preview_list(&s.resources, 3)
        );
    }
    out
}

pub fn render_records(records: &[LogRecord]) -> String {
    let mut out = String::new();
    for r in records {
        let _ = writeln!(
            out,
            "{} {} {:?} {} {}",
            r.ts,
            r.txn_id,
            r.event,
            preview_list(&r.paths, 2),
            compact_line(&r.detail, DESCRIPTION_CHARS)
        );
    }
    out
}

pub fn render_status(resource: &str, status: &ResourceStatus) -> String {
    match status {
        ResourceStatus::Idle => format!("{} idle\n", resource),
        ResourceStatus::Transaction { txn_id, status } => {
            format!("{} {} in {}\n", resource, status.as_str().bold(), txn_id)
        }
    }
}

pub fn render_recovery(report: &RecoveryReport) -> String {
    format!(
        "recovery: rolled back {}, auto-committed {}, failed {}, still open {}\n",
        report.rolled_back.len(),
        report.auto_committed.len(),
        report.failed.len(),
        report.still_open.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::IssueCategory;

    #[test]
    fn compact_line_bounds_length() {
        assert_eq!(compact_line("a\n  b   c", 10), "a b c");
        assert_eq!(compact_line("abcdef", 3), "abc...");
    }

    #[test]
    fn preview_list_counts_hidden_items() {
        let items: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(preview_list(&items, 2), "a | b (+1 more)");
        assert_eq!(preview_list(&items[..1], 2), "a");
    }

    #[test]
    fn issue_summary_line_counts_severities() {
        colored::control::set_override(false);
        let mut issues = vec![
            IntegrityIssue::new(IssueCategory::OrphanedResource, Severity::Warning, "a", "orphan"),
            IntegrityIssue::new(IssueCategory::MissingReference, Severity::Error, "b", "gone"),
        ];
        crate::integrity::finalize_issues(&mut issues);
        let text = render_issues(CheckMode::Normal, &issues);
        assert!(text.contains("I001 ERROR"));
        assert!(text.contains("2 issue(s): 1 error, 1 warning; 0 fixable"));
    }
}
