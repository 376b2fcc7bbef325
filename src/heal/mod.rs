//! Self-healer: turns integrity issues into repairs.
//!
//! Every applied fix runs in its own `REPAIR` transaction through
//! [`TransactionManager::execute`], so a fix that fails rolls back alone and
//! the rest of the run continues. Issues without a suggested fix are reported
//! as `Unresolved`; they are never an error.

pub mod approval;

use crate::core::config::Config;
use crate::core::error::{EXIT_OK, EXIT_PARTIAL, EXIT_RESTORE_FAILED, GuardError};
use crate::core::manifest::VersionMarker;
use crate::core::store::Store;
use crate::core::transaction::{TransactionManager, TxScope};
use crate::integrity::{CheckMode, FixRisk, IntegrityChecker, IntegrityIssue, Severity, SuggestedFix};
use approval::{ApprovalDecision, Approver, describe_fix};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

pub const REPAIR_KIND: &str = "REPAIR";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RepairPolicy {
    Interactive,
    Guided,
    Automatic,
}

impl FromStr for RepairPolicy {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interactive" => Ok(RepairPolicy::Interactive),
            "guided" => Ok(RepairPolicy::Guided),
            "automatic" => Ok(RepairPolicy::Automatic),
            other => Err(GuardError::Config(format!(
                "unknown repair policy '{}' (expected interactive, guided or automatic)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for RepairPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RepairPolicy::Interactive => "interactive",
            RepairPolicy::Guided => "guided",
            RepairPolicy::Automatic => "automatic",
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    Applied,
    Skipped,
    Deferred,
    Failed,
    Unresolved,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RepairAction {
    pub issue: IntegrityIssue,
    pub outcome: RepairOutcome,
    pub transaction_id: Option<String>,
    pub detail: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RepairReport {
    pub policy: RepairPolicy,
    pub applied: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub failed: usize,
    pub unresolved: usize,
    /// Fixes whose rollback could not finish; the tree needs manual recovery.
    pub restore_failures: usize,
    pub actions: Vec<RepairAction>,
}

impl RepairReport {
    fn new(policy: RepairPolicy) -> Self {
        Self {
            policy,
            applied: 0,
            skipped: 0,
            deferred: 0,
            failed: 0,
            unresolved: 0,
            restore_failures: 0,
            actions: Vec::new(),
        }
    }

    fn push(&mut self, action: RepairAction) {
        match action.outcome {
            RepairOutcome::Applied => self.applied += 1,
            RepairOutcome::Skipped => self.skipped += 1,
            RepairOutcome::Deferred => self.deferred += 1,
            RepairOutcome::Failed => self.failed += 1,
            RepairOutcome::Unresolved => self.unresolved += 1,
        }
        self.actions.push(action);
    }

    /// `0` when every issue was fixed (or there were none), `4` when a rollback
    /// failed, `1` otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.restore_failures > 0 {
            EXIT_RESTORE_FAILED
        } else if self.applied == self.actions.len() {
            EXIT_OK
        } else {
            EXIT_PARTIAL
        }
    }
}

pub struct SelfHealer {
    config: Config,
    checker: IntegrityChecker,
    mode: CheckMode,
}

impl SelfHealer {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            checker: IntegrityChecker::new(config),
            mode: CheckMode::Detailed,
        }
    }

    pub fn with_checker(mut self, checker: IntegrityChecker) -> Self {
        self.checker = checker;
        self
    }

    /// Depth of the check that feeds [`SelfHealer::repair`]. Defaults to detailed.
    pub fn with_mode(mut self, mode: CheckMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn repair(
        &self,
        project_root: &Path,
        policy: RepairPolicy,
        approver: &mut dyn Approver,
    ) -> Result<RepairReport, GuardError> {
        let issues = self.checker.check(project_root, self.mode)?;
        self.repair_issues(project_root, &issues, policy, approver)
    }

    /// Repairs an issue list the caller already holds, in list order.
    pub fn repair_issues(
        &self,
        project_root: &Path,
        issues: &[IntegrityIssue],
        policy: RepairPolicy,
        approver: &mut dyn Approver,
    ) -> Result<RepairReport, GuardError> {
        let store = Store::for_project(project_root)?;
        store.ensure_layout()?;
        let manager = TransactionManager::new(&store, &self.config);
        let targets = RepairTargets {
            manifest: self.config.manifest_path(&store),
            marker: store.marker_path(),
        };

        let mut report = RepairReport::new(policy);
        for issue in issues {
            let action = self.handle(&manager, &targets, issue, policy, approver, &mut report);
            info!(
                issue = %issue.id,
                outcome = ?action.outcome,
                txn = action.transaction_id.as_deref().unwrap_or("-"),
                "repair step finished"
            );
            report.push(action);
        }
        info!(
            %policy,
            applied = report.applied,
            unresolved = report.unresolved,
            failed = report.failed,
            "repair run finished"
        );
        Ok(report)
    }

    fn handle(
        &self,
        manager: &TransactionManager,
        targets: &RepairTargets,
        issue: &IntegrityIssue,
        policy: RepairPolicy,
        approver: &mut dyn Approver,
        report: &mut RepairReport,
    ) -> RepairAction {
        let action = |outcome, transaction_id, detail: String| RepairAction {
            issue: issue.clone(),
            outcome,
            transaction_id,
            detail,
        };

        let Some(fix) = &issue.suggested_fix else {
            return action(RepairOutcome::Unresolved, None, "no automatic fix exists".to_string());
        };

        let auto = match policy {
            RepairPolicy::Automatic => true,
            RepairPolicy::Guided => fix.risk() == FixRisk::Low && issue.severity < Severity::Critical,
            RepairPolicy::Interactive => false,
        };
        if !auto {
            match approver.decide(issue, fix) {
                ApprovalDecision::Approve => {}
                ApprovalDecision::Deny => {
                    return action(RepairOutcome::Skipped, None, "declined".to_string());
                }
                ApprovalDecision::Defer => {
                    return action(RepairOutcome::Deferred, None, "deferred".to_string());
                }
            }
        }

        let note = format!(
            "{} {:?} {}: {}",
            issue.id,
            issue.category,
            issue.affected_path.display(),
            describe_fix(fix)
        );
        match manager.execute(REPAIR_KIND, &targets.resources(), |scope| {
            let changed = self.apply(scope, targets, fix)?;
            scope.note(note);
            Ok(changed)
        }) {
            Ok(done) if done.value => action(
                RepairOutcome::Applied,
                Some(done.transaction.id),
                describe_fix(fix),
            ),
            Ok(done) => action(
                RepairOutcome::Applied,
                Some(done.transaction.id),
                format!("{} (already in place)", describe_fix(fix)),
            ),
            Err(GuardError::ResourceBusy { resource, holder }) => action(
                RepairOutcome::Deferred,
                None,
                format!("{} is held by {}", resource.display(), holder),
            ),
            Err(GuardError::MutationFailure { txn_id, reason }) => {
                warn!(issue = %issue.id, txn = %txn_id, %reason, "repair rolled back");
                action(RepairOutcome::Failed, Some(txn_id), reason)
            }
            Err(err) => {
                let txn_id = match &err {
                    GuardError::RestoreFailure { txn_id, .. } => {
                        report.restore_failures += 1;
                        Some(txn_id.clone())
                    }
                    _ => None,
                };
                action(RepairOutcome::Failed, txn_id, err.to_string())
            }
        }
    }

    /// Applies one fix inside `scope`. Returns whether anything changed.
    fn apply(
        &self,
        scope: &mut TxScope<'_>,
        targets: &RepairTargets,
        fix: &SuggestedFix,
    ) -> Result<bool, GuardError> {
        let codec = self.checker.codec();
        let before = scope.read(&targets.manifest)?;

        if let SuggestedFix::RefreshVersionMarker = fix {
            let marker = VersionMarker::for_bytes(&before);
            let mut bytes = serde_json::to_vec_pretty(&marker)?;
            bytes.push(b'\n');
            scope.write(&targets.marker, &bytes)?;
            return Ok(true);
        }

        let mut manifest = codec.parse(&before)?;
        let changed = match fix {
            SuggestedFix::RemoveReference { section, reference } => {
                manifest.remove_reference(section, reference)
            }
            SuggestedFix::AddReference { group, file } => manifest.add_file(group, file)?,
            SuggestedFix::CreateGroup { name, parent } => {
                manifest.add_group(name, parent.as_deref())?
            }
            SuggestedFix::CreateRootGroup { name } => manifest.regenerate_root_group(name),
            SuggestedFix::RefreshVersionMarker => false,
        };
        if !changed {
            return Ok(false);
        }
        let after = codec.serialize(&manifest)?;
        scope.write(&targets.manifest, &after)?;

        // A marker that matched before this edit tracks the healer's own change.
        if let Ok(Some(marker)) = VersionMarker::read(&targets.marker) {
            if marker.matches(&before) {
                let mut bytes = serde_json::to_vec_pretty(&VersionMarker::for_bytes(&after))?;
                bytes.push(b'\n');
                scope.write(&targets.marker, &bytes)?;
            }
        }
        Ok(true)
    }
}

struct RepairTargets {
    manifest: PathBuf,
    marker: PathBuf,
}

impl RepairTargets {
    /// Every fix may touch both files, so every repair locks both.
    fn resources(&self) -> Vec<PathBuf> {
        vec![self.manifest.clone(), self.marker.clone()]
    }
}
