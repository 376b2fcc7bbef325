//! Structural integrity checks for the manifest and its resource tree.
//!
//! A check never mutates anything. It produces a list of typed issues that
//! is sorted by severity (Critical first), then affected path, so two runs
//! over an unchanged tree return identical lists.
//!
//! Depth is chosen per run:
//! - `minimal`: manifest parses, root group exists, top-level groups exist
//! - `normal`: + file references vs. the filesystem, orphans, version marker
//! - `detailed`: + section well-formedness, resource validators, permissions

pub mod rules;
pub mod validators;

use crate::core::config::Config;
use crate::core::error::GuardError;
use crate::core::lock::{LockOwner, LockTable, canonical_resource};
use crate::core::manifest::{JsonManifestCodec, ManifestCodec};
use crate::core::store::Store;
use crate::core::txlog::TransactionLog;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};
use validators::{ResourceValidator, ValidatorRegistry};

/// How long a detailed check waits for an in-flight repair to finish.
const DETAILED_LOCK_PROBE_MS: u64 = 250;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum CheckMode {
    Minimal,
    Normal,
    Detailed,
}

impl FromStr for CheckMode {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minimal" => Ok(CheckMode::Minimal),
            "normal" => Ok(CheckMode::Normal),
            "detailed" => Ok(CheckMode::Detailed),
            other => Err(GuardError::Config(format!(
                "unknown integrity check mode '{}' (expected minimal, normal or detailed)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for CheckMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CheckMode::Minimal => "minimal",
            CheckMode::Normal => "normal",
            CheckMode::Detailed => "detailed",
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IssueCategory {
    MissingReference,
    MalformedManifestSection,
    OrphanedResource,
    StaleVersionMarker,
    PermissionMismatch,
    InvalidResource,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FixRisk {
    /// Additive or derivable; safe to apply without asking under `guided`.
    Low,
    /// Removes data or changes the manifest's structure.
    Structural,
}

/// Machine-actionable repair descriptor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SuggestedFix {
    RemoveReference { section: String, reference: String },
    AddReference { group: String, file: String },
    CreateGroup { name: String, parent: Option<String> },
    CreateRootGroup { name: String },
    RefreshVersionMarker,
}

impl SuggestedFix {
    pub fn risk(&self) -> FixRisk {
        match self {
            SuggestedFix::AddReference { .. } | SuggestedFix::RefreshVersionMarker => FixRisk::Low,
            SuggestedFix::RemoveReference { .. }
            | SuggestedFix::CreateGroup { .. }
            | SuggestedFix::CreateRootGroup { .. } => FixRisk::Structural,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IntegrityIssue {
    pub id: String,
    pub category: IssueCategory,
    pub severity: Severity,
    /// Path relative to the project root.
    pub affected_path: PathBuf,
    pub description: String,
    pub suggested_fix: Option<SuggestedFix>,
}

impl IntegrityIssue {
    pub fn new(
        category: IssueCategory,
        severity: Severity,
        affected_path: impl Into<PathBuf>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            category,
            severity,
            affected_path: affected_path.into(),
            description: description.into(),
            suggested_fix: None,
        }
    }

    pub fn with_fix(mut self, fix: SuggestedFix) -> Self {
        self.suggested_fix = Some(fix);
        self
    }
}

/// Sorts issues (Critical first, then path) and assigns stable ids.
pub fn finalize_issues(issues: &mut Vec<IntegrityIssue>) {
    issues.sort_by(|a, b| {
        (Reverse(a.severity), &a.affected_path, a.category, &a.description, &a.suggested_fix).cmp(&(
            Reverse(b.severity),
            &b.affected_path,
            b.category,
            &b.description,
            &b.suggested_fix,
        ))
    });
    issues.dedup_by(|a, b| {
        a.severity == b.severity
            && a.affected_path == b.affected_path
            && a.category == b.category
            && a.description == b.description
    });
    for (i, issue) in issues.iter_mut().enumerate() {
        issue.id = format!("I{:03}", i + 1);
    }
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckSummary {
    pub total: usize,
    pub fixable: usize,
    pub by_severity: BTreeMap<Severity, usize>,
}

impl CheckSummary {
    pub fn of(issues: &[IntegrityIssue]) -> Self {
        let mut by_severity = BTreeMap::new();
        for issue in issues {
            *by_severity.entry(issue.severity).or_insert(0usize) += 1;
        }
        Self {
            total: issues.len(),
            fixable: issues.iter().filter(|i| i.suggested_fix.is_some()).count(),
            by_severity,
        }
    }
}

pub struct IntegrityChecker {
    config: Config,
    codec: Box<dyn ManifestCodec>,
    validators: ValidatorRegistry,
}

impl IntegrityChecker {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            codec: Box::new(JsonManifestCodec),
            validators: ValidatorRegistry::with_builtin(),
        }
    }

    pub fn with_codec(mut self, codec: Box<dyn ManifestCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_validator(mut self, validator: Box<dyn ResourceValidator>) -> Self {
        self.validators.register(validator);
        self
    }

    pub fn codec(&self) -> &dyn ManifestCodec {
        self.codec.as_ref()
    }

    /// Runs every rule enabled by `mode` against the project at `project_root`.
    pub fn check(&self, project_root: &Path, mode: CheckMode) -> Result<Vec<IntegrityIssue>, GuardError> {
        let store = Store::for_project(project_root)?;
        let manifest_path = self.config.manifest_path(&store);

        // Avoid reading a half-rolled-back manifest while a repair holds it.
        let _guard = if mode == CheckMode::Detailed {
            let log = TransactionLog::new(self.config.transaction_log_path(&store));
            let locks = LockTable::new(store.locks_dir(), log);
            let owner = LockOwner::Reader {
                label: "integrity-check".to_string(),
            };
            match locks.acquire(
                &canonical_resource(&manifest_path),
                &owner,
                Duration::from_millis(DETAILED_LOCK_PROBE_MS),
            ) {
                Ok(lease) => Some(lease),
                Err(e) => {
                    warn!(error = %e, "manifest lock unavailable; checking possibly in-flight state");
                    None
                }
            }
        } else {
            None
        };

        let mut issues = rules::run(
            &rules::RuleInput {
                project_root: &store.project_root,
                manifest_path: &manifest_path,
                marker_path: &store.marker_path(),
                codec: self.codec.as_ref(),
                validators: &self.validators,
            },
            mode,
        )?;
        finalize_issues(&mut issues);
        info!(%mode, issues = issues.len(), "integrity check finished");
        Ok(issues)
    }
}
