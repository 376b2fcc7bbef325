//! Approval capability consulted before a repair is applied.

use crate::integrity::{IntegrityIssue, SuggestedFix};
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    /// Declined; reported as `Skipped`.
    Deny,
    /// Left for a later run; reported as `Deferred`.
    Defer,
}

pub trait Approver {
    fn decide(&mut self, issue: &IntegrityIssue, fix: &SuggestedFix) -> ApprovalDecision;
}

/// Prompts on a terminal. Answers are `y`, `n` or `d` (defer); end of input
/// defers every remaining question.
pub struct TerminalApprover<R, W> {
    input: R,
    output: W,
}

impl TerminalApprover<io::StdinLock<'static>, io::Stderr> {
    /// Reads stdin and prompts on stderr so stdout stays machine-readable.
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stderr())
    }
}

impl<R: BufRead, W: Write> TerminalApprover<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> Approver for TerminalApprover<R, W> {
    fn decide(&mut self, issue: &IntegrityIssue, fix: &SuggestedFix) -> ApprovalDecision {
        loop {
            let prompted = writeln!(
                self.output,
                "[{}] {:?} {}: {}",
                issue.id,
                issue.severity,
                issue.affected_path.display(),
                issue.description
            )
            .and_then(|_| write!(self.output, "  apply {}? [y/n/d] ", describe_fix(fix)))
            .and_then(|_| self.output.flush());
            if prompted.is_err() {
                return ApprovalDecision::Defer;
            }

            let mut line = String::new();
            match self.input.read_line(&mut line) {
                Ok(0) | Err(_) => return ApprovalDecision::Defer,
                Ok(_) => {}
            }
            match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => return ApprovalDecision::Approve,
                "n" | "no" => return ApprovalDecision::Deny,
                "d" | "defer" => return ApprovalDecision::Defer,
                _ => {
                    let _ = writeln!(self.output, "  please answer y, n or d");
                }
            }
        }
    }
}

/// Replays a fixed list of decisions, then falls back to `fallback`.
#[derive(Debug, Clone)]
pub struct ScriptedApprover {
    decisions: VecDeque<ApprovalDecision>,
    fallback: ApprovalDecision,
    asked: usize,
}

impl ScriptedApprover {
    pub fn new(decisions: impl IntoIterator<Item = ApprovalDecision>) -> Self {
        Self {
            decisions: decisions.into_iter().collect(),
            fallback: ApprovalDecision::Defer,
            asked: 0,
        }
    }

    pub fn always(decision: ApprovalDecision) -> Self {
        Self {
            decisions: VecDeque::new(),
            fallback: decision,
            asked: 0,
        }
    }

    pub fn with_fallback(mut self, fallback: ApprovalDecision) -> Self {
        self.fallback = fallback;
        self
    }

    /// Number of questions answered so far.
    pub fn asked(&self) -> usize {
        self.asked
    }
}

impl Approver for ScriptedApprover {
    fn decide(&mut self, _issue: &IntegrityIssue, _fix: &SuggestedFix) -> ApprovalDecision {
        self.asked += 1;
        self.decisions.pop_front().unwrap_or(self.fallback)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Approver for DenyAll {
    fn decide(&mut self, _issue: &IntegrityIssue, _fix: &SuggestedFix) -> ApprovalDecision {
        ApprovalDecision::Deny
    }
}

pub fn describe_fix(fix: &SuggestedFix) -> String {
    match fix {
        SuggestedFix::RemoveReference { section, reference } => {
            format!("remove reference '{}' from '{}'", reference, section)
        }
        SuggestedFix::AddReference { group, file } => {
            format!("add '{}' to group '{}'", file, group)
        }
        SuggestedFix::CreateGroup { name, parent: Some(parent) } => {
            format!("create group '{}' under '{}'", name, parent)
        }
        SuggestedFix::CreateGroup { name, parent: None } => format!("create group '{}'", name),
        SuggestedFix::CreateRootGroup { name } => format!("create root group '{}'", name),
        SuggestedFix::RefreshVersionMarker => "refresh the version marker".to_string(),
    }
}
