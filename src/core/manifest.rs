//! Typed intermediate representation of the project manifest.
//!
//! The manifest is a JSON document with a `root_group` name and a list of
//! `sections`, each tagged by `kind`:
//!
//! ```json
//! {
//!   "format_version": 1,
//!   "root_group": "Main",
//!   "sections": [
//!     { "kind": "group", "name": "Main", "children": ["Sources"] },
//!     { "kind": "group", "name": "Sources", "path": "Sources", "files": ["App.swift"] },
//!     { "kind": "target", "name": "App", "sources": ["Sources/App.swift"] },
//!     { "kind": "resource_bundle", "name": "Assets", "path": "Assets.xcassets",
//!       "resource_type": "asset_catalog" }
//!   ]
//! }
//! ```
//!
//! Sections that do not fit their kind are kept verbatim as
//! [`Section::Malformed`] so the integrity checker can report them and a
//! serialize round trip never drops data the parser did not understand.
//! Parsing and serializing go through the [`ManifestCodec`] capability.

use crate::core::backup::sha256_hex;
use crate::core::error::GuardError;
use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub const CURRENT_FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GroupSection {
    pub name: String,
    /// Directory of the group relative to the project root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

impl GroupSection {
    pub fn dir(&self) -> &str {
        self.path.as_deref().unwrap_or(".")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TargetSection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResourceBundleSection {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MalformedSection {
    pub index: usize,
    pub kind: Option<String>,
    pub reason: String,
    pub raw: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum TypedSection {
    Group(GroupSection),
    Target(TargetSection),
    ResourceBundle(ResourceBundleSection),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Section {
    Group(GroupSection),
    Target(TargetSection),
    ResourceBundle(ResourceBundleSection),
    Malformed(MalformedSection),
}

impl Section {
    pub fn name(&self) -> Option<&str> {
        match self {
            Section::Group(g) => Some(&g.name),
            Section::Target(t) => Some(&t.name),
            Section::ResourceBundle(r) => Some(&r.name),
            Section::Malformed(_) => None,
        }
    }
}

/// One path-valued reference inside the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReference {
    /// Name of the section holding the reference.
    pub section: String,
    /// The reference exactly as written in the manifest.
    pub reference: String,
    /// Path relative to the project root.
    pub relative: PathBuf,
    pub is_bundle: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub format_version: u32,
    pub root_group: Option<String>,
    pub sections: Vec<Section>,
    /// Top-level keys this representation does not model, kept for round trips.
    pub extra: Map<String, Value>,
}

impl Manifest {
    pub fn groups(&self) -> impl Iterator<Item = &GroupSection> {
        self.sections.iter().filter_map(|s| match s {
            Section::Group(g) => Some(g),
            _ => None,
        })
    }

    pub fn group(&self, name: &str) -> Option<&GroupSection> {
        self.groups().find(|g| g.name == name)
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut GroupSection> {
        self.sections.iter_mut().find_map(|s| match s {
            Section::Group(g) if g.name == name => Some(g),
            _ => None,
        })
    }

    pub fn root(&self) -> Option<&GroupSection> {
        self.root_group.as_deref().and_then(|name| self.group(name))
    }

    pub fn malformed(&self) -> impl Iterator<Item = &MalformedSection> {
        self.sections.iter().filter_map(|s| match s {
            Section::Malformed(m) => Some(m),
            _ => None,
        })
    }

    pub fn resource_bundles(&self) -> impl Iterator<Item = &ResourceBundleSection> {
        self.sections.iter().filter_map(|s| match s {
            Section::ResourceBundle(r) => Some(r),
            _ => None,
        })
    }

    /// Every file reference, resolved relative to the project root.
    pub fn references(&self) -> Vec<FileReference> {
        let mut out = Vec::new();
        for section in &self.sections {
            match section {
                Section::Group(g) => {
                    for file in &g.files {
                        out.push(FileReference {
                            section: g.name.clone(),
                            reference: file.clone(),
                            relative: Path::new(g.dir()).join(file),
                            is_bundle: false,
                        });
                    }
                }
                Section::Target(t) => {
                    for file in t.sources.iter().chain(t.resources.iter()) {
                        out.push(FileReference {
                            section: t.name.clone(),
                            reference: file.clone(),
                            relative: PathBuf::from(file),
                            is_bundle: false,
                        });
                    }
                }
                Section::ResourceBundle(r) => out.push(FileReference {
                    section: r.name.clone(),
                    reference: r.path.clone(),
                    relative: PathBuf::from(&r.path),
                    is_bundle: true,
                }),
                Section::Malformed(_) => {}
            }
        }
        out
    }

    /// Drops `reference` from the named section. A resource bundle whose path
    /// is the reference is removed entirely. Returns whether anything changed.
    pub fn remove_reference(&mut self, section: &str, reference: &str) -> bool {
        let before = self.sections.len();
        self.sections.retain(|s| {
            !matches!(s, Section::ResourceBundle(r) if r.name == section && r.path == reference)
        });
        if self.sections.len() != before {
            return true;
        }

        let mut changed = false;
        for s in self.sections.iter_mut() {
            match s {
                Section::Group(g) if g.name == section => {
                    let n = g.files.len();
                    g.files.retain(|f| f != reference);
                    changed |= g.files.len() != n;
                }
                Section::Target(t) if t.name == section => {
                    let n = t.sources.len() + t.resources.len();
                    t.sources.retain(|f| f != reference);
                    t.resources.retain(|f| f != reference);
                    changed |= t.sources.len() + t.resources.len() != n;
                }
                _ => {}
            }
        }
        changed
    }

    pub fn add_file(&mut self, group: &str, file: &str) -> Result<bool, GuardError> {
        let g = self
            .group_mut(group)
            .ok_or_else(|| GuardError::Manifest(format!("group '{}' does not exist", group)))?;
        if g.files.iter().any(|f| f == file) {
            return Ok(false);
        }
        g.files.push(file.to_string());
        g.files.sort();
        Ok(true)
    }

    /// Adds an empty group, linked under `parent` when given.
    pub fn add_group(&mut self, name: &str, parent: Option<&str>) -> Result<bool, GuardError> {
        if let Some(parent) = parent {
            let p = self.group_mut(parent).ok_or_else(|| {
                GuardError::Manifest(format!("parent group '{}' does not exist", parent))
            })?;
            if !p.children.iter().any(|c| c == name) {
                p.children.push(name.to_string());
            }
        }
        if self.group(name).is_some() {
            return Ok(false);
        }
        self.sections.push(Section::Group(GroupSection {
            name: name.to_string(),
            path: Some(name.to_string()),
            children: Vec::new(),
            files: Vec::new(),
        }));
        Ok(true)
    }

    /// Re-creates the root group. Its children are derived from the groups no
    /// other group lists as a child.
    pub fn regenerate_root_group(&mut self, name: &str) -> bool {
        if self.root().is_some() {
            return false;
        }
        self.root_group = Some(name.to_string());
        let nested: Vec<&str> = self
            .groups()
            .flat_map(|g| g.children.iter().map(String::as_str))
            .collect();
        let mut top_level: Vec<String> = self
            .groups()
            .map(|g| g.name.clone())
            .filter(|n| n != name && !nested.contains(&n.as_str()))
            .collect();
        top_level.sort();

        match self.group_mut(name) {
            Some(existing) => existing.children = top_level,
            None => self.sections.insert(
                0,
                Section::Group(GroupSection {
                    name: name.to_string(),
                    path: None,
                    children: top_level,
                    files: Vec::new(),
                }),
            ),
        }
        true
    }
}

/// Parse/serialize capability for the manifest format.
pub trait ManifestCodec: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<Manifest, GuardError>;
    fn serialize(&self, manifest: &Manifest) -> Result<Vec<u8>, GuardError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonManifestCodec;

impl ManifestCodec for JsonManifestCodec {
    fn parse(&self, bytes: &[u8]) -> Result<Manifest, GuardError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| GuardError::Manifest(format!("not valid JSON: {}", e)))?;
        let Value::Object(mut obj) = value else {
            return Err(GuardError::Manifest(
                "top level must be a JSON object".to_string(),
            ));
        };

        let format_version = match obj.remove("format_version") {
            None => CURRENT_FORMAT_VERSION,
            Some(v) => v
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    GuardError::Manifest("format_version must be a small integer".to_string())
                })?,
        };
        let root_group = match obj.remove("root_group") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
            Some(Value::String(_)) => None,
            Some(_) => {
                return Err(GuardError::Manifest(
                    "root_group must be a string".to_string(),
                ));
            }
        };
        let raw_sections = match obj.remove("sections") {
            None => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(GuardError::Manifest("sections must be an array".to_string()));
            }
        };

        let sections = raw_sections
            .into_iter()
            .enumerate()
            .map(|(index, raw)| {
                let typed = serde_json::from_value::<TypedSection>(raw.clone())
                    .map_err(|e| e.to_string())
                    .and_then(|typed| match unknown_keys(&typed, &raw) {
                        None => Ok(typed),
                        Some(key) => Err(format!("unknown field `{}`", key)),
                    });
                match typed {
                    Ok(TypedSection::Group(g)) => Section::Group(g),
                    Ok(TypedSection::Target(t)) => Section::Target(t),
                    Ok(TypedSection::ResourceBundle(r)) => Section::ResourceBundle(r),
                    Err(reason) => Section::Malformed(MalformedSection {
                        index,
                        kind: raw.get("kind").and_then(Value::as_str).map(String::from),
                        reason,
                        raw,
                    }),
                }
            })
            .collect();

        Ok(Manifest {
            format_version,
            root_group,
            sections,
            extra: obj,
        })
    }

    fn serialize(&self, manifest: &Manifest) -> Result<Vec<u8>, GuardError> {
        let mut obj = Map::new();
        obj.insert(
            "format_version".to_string(),
            Value::from(manifest.format_version),
        );
        if let Some(root) = &manifest.root_group {
            obj.insert("root_group".to_string(), Value::String(root.clone()));
        }
        let mut sections = Vec::with_capacity(manifest.sections.len());
        for section in &manifest.sections {
            let value = match section {
                Section::Group(g) => serde_json::to_value(TypedSection::Group(g.clone()))?,
                Section::Target(t) => serde_json::to_value(TypedSection::Target(t.clone()))?,
                Section::ResourceBundle(r) => {
                    serde_json::to_value(TypedSection::ResourceBundle(r.clone()))?
                }
                Section::Malformed(m) => m.raw.clone(),
            };
            sections.push(value);
        }
        obj.insert("sections".to_string(), Value::Array(sections));
        for (k, v) in &manifest.extra {
            obj.insert(k.clone(), v.clone());
        }

        let mut bytes = serde_json::to_vec_pretty(&Value::Object(obj))?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// First key the typed form would silently drop on serialize.
fn unknown_keys(typed: &TypedSection, raw: &Value) -> Option<String> {
    let allowed: &[&str] = match typed {
        TypedSection::Group(_) => &["kind", "name", "path", "children", "files"],
        TypedSection::Target(_) => &["kind", "name", "sources", "resources"],
        TypedSection::ResourceBundle(_) => &["kind", "name", "path", "resource_type"],
    };
    raw.as_object()?
        .keys()
        .find(|k| !allowed.contains(&k.as_str()))
        .cloned()
}

/// Manifest digest recorded at the last successful sync.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VersionMarker {
    pub manifest_sha256: String,
    pub written_at: String,
}

impl VersionMarker {
    pub fn for_bytes(manifest_bytes: &[u8]) -> Self {
        Self {
            manifest_sha256: sha256_hex(manifest_bytes),
            written_at: time::now_epoch_z(),
        }
    }

    pub fn read(path: &Path) -> Result<Option<Self>, GuardError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GuardError::IoError(e)),
        }
    }

    pub fn matches(&self, manifest_bytes: &[u8]) -> bool {
        self.manifest_sha256 == sha256_hex(manifest_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "format_version": 1,
        "root_group": "Main",
        "generator": "xcodegen",
        "sections": [
            { "kind": "group", "name": "Main", "children": ["Sources"] },
            { "kind": "group", "name": "Sources", "path": "Sources", "files": ["App.swift"] },
            { "kind": "target", "name": "App", "sources": ["Sources/App.swift"] },
            { "kind": "resource_bundle", "name": "Assets", "path": "Assets.xcassets" },
            { "kind": "group", "files": "not-a-list" },
            { "kind": "plugin", "name": "x" },
            { "kind": "target", "name": "T", "sorces": [] }
        ]
    }"#;

    #[test]
    fn parses_typed_and_malformed_sections() {
        let m = JsonManifestCodec.parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(m.root().unwrap().children, vec!["Sources".to_string()]);
        let malformed: Vec<_> = m.malformed().collect();
        assert_eq!(malformed.len(), 3);
        assert_eq!(malformed[0].index, 4);
        assert_eq!(malformed[1].kind.as_deref(), Some("plugin"));
        assert!(malformed[2].reason.contains("sorces"));
    }

    #[test]
    fn serialize_keeps_unknown_content() {
        let codec = JsonManifestCodec;
        let m = codec.parse(SAMPLE.as_bytes()).unwrap();
        let again = codec.parse(&codec.serialize(&m).unwrap()).unwrap();
        assert_eq!(m, again);
        assert_eq!(again.extra["generator"], "xcodegen");
    }

    #[test]
    fn references_resolve_against_group_paths() {
        let m = JsonManifestCodec.parse(SAMPLE.as_bytes()).unwrap();
        let refs = m.references();
        assert!(refs.iter().any(|r| r.section == "Sources"
            && r.relative == Path::new("Sources").join("App.swift")));
        assert!(refs.iter().any(|r| r.is_bundle && r.reference == "Assets.xcassets"));
    }

    #[test]
    fn remove_reference_targets_one_section() {
        let mut m = JsonManifestCodec.parse(SAMPLE.as_bytes()).unwrap();
        assert!(m.remove_reference("Sources", "App.swift"));
        assert!(m.group("Sources").unwrap().files.is_empty());
        assert!(!m.remove_reference("Sources", "App.swift"));
        assert!(m.remove_reference("Assets", "Assets.xcassets"));
        assert_eq!(m.resource_bundles().count(), 0);
    }

    #[test]
    fn regenerated_root_adopts_top_level_groups() {
        let mut m = JsonManifestCodec
            .parse(br#"{"sections":[{"kind":"group","name":"Sources","children":["Nested"]},{"kind":"group","name":"Nested"},{"kind":"group","name":"Resources"}]}"#)
            .unwrap();
        assert!(m.root().is_none());
        assert!(m.regenerate_root_group("Main"));
        assert_eq!(
            m.root().unwrap().children,
            vec!["Resources".to_string(), "Sources".to_string()]
        );
        assert!(!m.regenerate_root_group("Main"));
    }

    #[test]
    fn non_object_manifest_is_rejected() {
        assert!(JsonManifestCodec.parse(b"[1,2]").is_err());
        assert!(JsonManifestCodec.parse(b"{not json").is_err());
    }

    #[test]
    fn add_file_requires_group() {
        let mut m = JsonManifestCodec.parse(SAMPLE.as_bytes()).unwrap();
        assert!(m.add_file("Sources", "Extra.swift").unwrap());
        assert!(!m.add_file("Sources", "Extra.swift").unwrap());
        assert!(matches!(
            m.add_file("Missing", "x"),
            Err(GuardError::Manifest(_))
        ));
    }
}
