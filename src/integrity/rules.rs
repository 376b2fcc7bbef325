//! Individual integrity rules, grouped by the mode that enables them.

use super::validators::ValidatorRegistry;
use super::{CheckMode, IntegrityIssue, IssueCategory, Severity, SuggestedFix};
use crate::core::error::GuardError;
use crate::core::manifest::{CURRENT_FORMAT_VERSION, Manifest, ManifestCodec, VersionMarker};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Root group name proposed when the manifest has none.
pub const DEFAULT_ROOT_GROUP: &str = "Main";

pub struct RuleInput<'a> {
    pub project_root: &'a Path,
    pub manifest_path: &'a Path,
    pub marker_path: &'a Path,
    pub codec: &'a dyn ManifestCodec,
    pub validators: &'a ValidatorRegistry,
}

impl RuleInput<'_> {
    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(self.project_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Unsorted issue list for `mode`.
pub fn run(input: &RuleInput<'_>, mode: CheckMode) -> Result<Vec<IntegrityIssue>, GuardError> {
    let manifest_rel = input.relative(input.manifest_path);
    let bytes = match fs::read(input.manifest_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(vec![IntegrityIssue::new(
                IssueCategory::MissingReference,
                Severity::Critical,
                manifest_rel,
                "manifest file does not exist",
            )]);
        }
        Err(e) => return Err(GuardError::IoError(e)),
    };
    let manifest = match input.codec.parse(&bytes) {
        Ok(m) => m,
        Err(e) => {
            return Ok(vec![IntegrityIssue::new(
                IssueCategory::MalformedManifestSection,
                Severity::Critical,
                manifest_rel,
                format!("manifest cannot be parsed: {}", e),
            )]);
        }
    };

    let mut issues = Vec::new();
    root_group(&manifest, &manifest_rel, &mut issues);
    top_level_groups(&manifest, &manifest_rel, &mut issues);

    if mode >= CheckMode::Normal {
        file_references(input, &manifest, &mut issues);
        orphaned_files(input, &manifest, &mut issues)?;
        version_marker(input, &bytes, &mut issues);
    }

    if mode >= CheckMode::Detailed {
        malformed_sections(&manifest, &manifest_rel, &mut issues);
        duplicate_groups(&manifest, &manifest_rel, &mut issues);
        resource_validators(input, &manifest, &mut issues);
        permissions(input, &manifest, &mut issues);
    }
    debug!(%mode, raw = issues.len(), "rules evaluated");
    Ok(issues)
}

fn root_group(manifest: &Manifest, manifest_rel: &Path, out: &mut Vec<IntegrityIssue>) {
    if manifest.root().is_some() {
        return;
    }
    let description = match &manifest.root_group {
        Some(name) => format!("root group '{}' is not defined", name),
        None => "manifest has no root group".to_string(),
    };
    let name = manifest
        .root_group
        .clone()
        .unwrap_or_else(|| DEFAULT_ROOT_GROUP.to_string());
    out.push(
        IntegrityIssue::new(
            IssueCategory::MalformedManifestSection,
            Severity::Critical,
            manifest_rel,
            description,
        )
        .with_fix(SuggestedFix::CreateRootGroup { name }),
    );
}

fn top_level_groups(manifest: &Manifest, manifest_rel: &Path, out: &mut Vec<IntegrityIssue>) {
    let Some(root) = manifest.root() else {
        return;
    };
    for child in &root.children {
        if manifest.group(child).is_none() {
            out.push(
                IntegrityIssue::new(
                    IssueCategory::MissingReference,
                    Severity::Error,
                    manifest_rel,
                    format!("top-level group '{}' is listed by '{}' but not defined", child, root.name),
                )
                .with_fix(SuggestedFix::CreateGroup {
                    name: child.clone(),
                    parent: Some(root.name.clone()),
                }),
            );
        }
    }
}

fn file_references(input: &RuleInput<'_>, manifest: &Manifest, out: &mut Vec<IntegrityIssue>) {
    for reference in manifest.references() {
        let relative = normalize(&reference.relative);
        if input.project_root.join(&relative).exists() {
            continue;
        }
        let what = if reference.is_bundle { "resource bundle" } else { "file" };
        out.push(
            IntegrityIssue::new(
                IssueCategory::MissingReference,
                Severity::Error,
                relative,
                format!(
                    "{} '{}' referenced by '{}' does not exist",
                    what, reference.reference, reference.section
                ),
            )
            .with_fix(SuggestedFix::RemoveReference {
                section: reference.section,
                reference: reference.reference,
            }),
        );
    }
}

/// Regular files inside a group's own directory that nothing references.
/// Only groups with an explicit `path` own a directory.
fn orphaned_files(
    input: &RuleInput<'_>,
    manifest: &Manifest,
    out: &mut Vec<IntegrityIssue>,
) -> Result<(), GuardError> {
    let referenced: BTreeSet<PathBuf> = manifest
        .references()
        .iter()
        .map(|r| normalize(&r.relative))
        .collect();

    let mut seen = BTreeSet::new();
    let mut groups: Vec<_> = manifest.groups().filter(|g| g.path.is_some()).collect();
    groups.sort_by(|a, b| a.name.cmp(&b.name));

    for group in groups {
        let dir_rel = normalize(Path::new(group.dir()));
        let dir = input.project_root.join(&dir_rel);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(GuardError::IoError(e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(GuardError::IoError)?;
            if !entry.file_type().map_err(GuardError::IoError)?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();

        for name in names {
            let rel = dir_rel.join(&name);
            if rel == input.relative(input.manifest_path)
                || referenced.contains(&rel)
                || !seen.insert(rel.clone())
            {
                continue;
            }
            out.push(
                IntegrityIssue::new(
                    IssueCategory::OrphanedResource,
                    Severity::Warning,
                    rel,
                    format!("file is in the directory of group '{}' but not referenced", group.name),
                )
                .with_fix(SuggestedFix::AddReference {
                    group: group.name.clone(),
                    file: name,
                }),
            );
        }
    }
    Ok(())
}

fn version_marker(input: &RuleInput<'_>, manifest_bytes: &[u8], out: &mut Vec<IntegrityIssue>) {
    let marker_rel = input.relative(input.marker_path);
    match VersionMarker::read(input.marker_path) {
        Ok(None) => {}
        Ok(Some(marker)) if marker.matches(manifest_bytes) => {}
        Ok(Some(marker)) => out.push(
            IntegrityIssue::new(
                IssueCategory::StaleVersionMarker,
                Severity::Info,
                marker_rel,
                format!("manifest changed since last sync at {}", marker.written_at),
            )
            .with_fix(SuggestedFix::RefreshVersionMarker),
        ),
        Err(e) => out.push(
            IntegrityIssue::new(
                IssueCategory::StaleVersionMarker,
                Severity::Warning,
                marker_rel,
                format!("version marker is unreadable: {}", e),
            )
            .with_fix(SuggestedFix::RefreshVersionMarker),
        ),
    }
}

fn malformed_sections(manifest: &Manifest, manifest_rel: &Path, out: &mut Vec<IntegrityIssue>) {
    if manifest.format_version > CURRENT_FORMAT_VERSION {
        out.push(IntegrityIssue::new(
            IssueCategory::MalformedManifestSection,
            Severity::Warning,
            manifest_rel,
            format!(
                "format_version {} is newer than supported version {}",
                manifest.format_version, CURRENT_FORMAT_VERSION
            ),
        ));
    }
    for section in manifest.malformed() {
        let kind = section.kind.as_deref().unwrap_or("<none>");
        out.push(IntegrityIssue::new(
            IssueCategory::MalformedManifestSection,
            Severity::Error,
            manifest_rel,
            format!("section #{} (kind {}) is malformed: {}", section.index, kind, section.reason),
        ));
    }
}

fn duplicate_groups(manifest: &Manifest, manifest_rel: &Path, out: &mut Vec<IntegrityIssue>) {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for group in manifest.groups() {
        *counts.entry(group.name.as_str()).or_insert(0) += 1;
    }
    for (name, count) in counts.into_iter().filter(|(_, c)| *c > 1) {
        out.push(IntegrityIssue::new(
            IssueCategory::MalformedManifestSection,
            Severity::Error,
            manifest_rel,
            format!("group '{}' is defined {} times", name, count),
        ));
    }
}

fn resource_validators(input: &RuleInput<'_>, manifest: &Manifest, out: &mut Vec<IntegrityIssue>) {
    for bundle in manifest.resource_bundles() {
        let bundle_rel = normalize(Path::new(&bundle.path));
        if !input.project_root.join(&bundle_rel).exists() {
            // Reported by the reference rule.
            continue;
        }
        for finding in input.validators.run(input.project_root, bundle) {
            out.push(IntegrityIssue::new(
                IssueCategory::InvalidResource,
                finding.severity,
                finding.path,
                format!("[{}] {}", finding.validator, finding.description),
            ));
        }
    }
}

/// Files the repair path would have to rewrite must be writable, and so must
/// their directories since writes land through a rename.
fn permissions(input: &RuleInput<'_>, manifest: &Manifest, out: &mut Vec<IntegrityIssue>) {
    let mut candidates = vec![input.relative(input.manifest_path)];
    candidates.extend(manifest.references().iter().map(|r| normalize(&r.relative)));
    candidates.sort();
    candidates.dedup();

    let mut dirs_checked = BTreeSet::new();
    for rel in candidates {
        let abs = input.project_root.join(&rel);
        let Ok(meta) = fs::metadata(&abs) else {
            continue;
        };
        if meta.permissions().readonly() {
            out.push(IntegrityIssue::new(
                IssueCategory::PermissionMismatch,
                Severity::Warning,
                rel.clone(),
                "path is read-only",
            ));
        }
        let parent_rel = rel.parent().map(Path::to_path_buf).unwrap_or_default();
        if !dirs_checked.insert(parent_rel.clone()) {
            continue;
        }
        let parent_abs = input.project_root.join(&parent_rel);
        if let Ok(parent_meta) = fs::metadata(&parent_abs) {
            if parent_meta.permissions().readonly() {
                let shown = if parent_rel.as_os_str().is_empty() {
                    PathBuf::from(".")
                } else {
                    parent_rel
                };
                out.push(IntegrityIssue::new(
                    IssueCategory::PermissionMismatch,
                    Severity::Warning,
                    shown,
                    "directory is read-only; atomic writes into it will fail",
                ));
            }
        }
    }
}

/// Drops `.` components so `./Sources/App.swift` and `Sources/App.swift` compare equal.
pub fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::manifest::JsonManifestCodec;
    use tempfile::tempdir;

    fn run_on(root: &Path, manifest: &str, mode: CheckMode) -> Vec<IntegrityIssue> {
        let manifest_path = root.join("project.json");
        fs::write(&manifest_path, manifest).unwrap();
        let registry = ValidatorRegistry::with_builtin();
        run(
            &RuleInput {
                project_root: root,
                manifest_path: &manifest_path,
                marker_path: &root.join(".projguard").join("sync.marker"),
                codec: &JsonManifestCodec,
                validators: &registry,
            },
            mode,
        )
        .unwrap()
    }

    #[test]
    fn unparseable_manifest_is_single_critical_issue() {
        let dir = tempdir().unwrap();
        let issues = run_on(dir.path(), "{ nope", CheckMode::Detailed);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Critical);
        assert_eq!(issues[0].category, IssueCategory::MalformedManifestSection);
    }

    #[test]
    fn missing_root_group_suggests_regeneration() {
        let dir = tempdir().unwrap();
        let issues = run_on(
            dir.path(),
            r#"{"sections":[{"kind":"group","name":"Sources"}]}"#,
            CheckMode::Minimal,
        );
        assert_eq!(issues.len(), 1);
        assert_eq!(
            issues[0].suggested_fix,
            Some(SuggestedFix::CreateRootGroup {
                name: DEFAULT_ROOT_GROUP.to_string()
            })
        );
    }

    #[test]
    fn minimal_ignores_filesystem() {
        let dir = tempdir().unwrap();
        let manifest = r#"{"root_group":"Main","sections":[
            {"kind":"group","name":"Main","children":["Sources"]},
            {"kind":"group","name":"Sources","path":"Sources","files":["Gone.swift"]}]}"#;
        assert!(run_on(dir.path(), manifest, CheckMode::Minimal).is_empty());
        let normal = run_on(dir.path(), manifest, CheckMode::Normal);
        assert_eq!(normal.len(), 1);
        assert_eq!(normal[0].affected_path, Path::new("Sources").join("Gone.swift"));
    }

    #[test]
    fn orphans_only_in_owned_directories() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("Sources")).unwrap();
        fs::write(dir.path().join("Sources/App.swift"), "").unwrap();
        fs::write(dir.path().join("Sources/Extra.swift"), "").unwrap();
        fs::write(dir.path().join("Sources/.DS_Store"), "").unwrap();
        fs::write(dir.path().join("README.md"), "").unwrap();
        let issues = run_on(
            dir.path(),
            r#"{"root_group":"Main","sections":[
                {"kind":"group","name":"Main","children":["Sources"]},
                {"kind":"group","name":"Sources","path":"./Sources","files":["App.swift"]}]}"#,
            CheckMode::Normal,
        );
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].category, IssueCategory::OrphanedResource);
        assert_eq!(
            issues[0].suggested_fix,
            Some(SuggestedFix::AddReference {
                group: "Sources".into(),
                file: "Extra.swift".into()
            })
        );
    }

    #[test]
    fn detailed_reports_duplicates_and_malformed() {
        let dir = tempdir().unwrap();
        let issues = run_on(
            dir.path(),
            r#"{"root_group":"Main","sections":[
                {"kind":"group","name":"Main"},
                {"kind":"group","name":"Main"},
                {"kind":"widget"}]}"#,
            CheckMode::Detailed,
        );
        let malformed: Vec<_> = issues
            .iter()
            .filter(|i| i.category == IssueCategory::MalformedManifestSection)
            .collect();
        assert_eq!(malformed.len(), 2);
        assert!(malformed.iter().all(|i| i.suggested_fix.is_none()));
    }

    #[test]
    fn normalize_strips_current_dir() {
        assert_eq!(normalize(Path::new("./a/./b")), PathBuf::from("a/b"));
    }
}
