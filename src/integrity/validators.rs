//! Pluggable structural checks for resource bundles.
//!
//! Each validator claims the bundles it understands and reports findings
//! relative to the project root. Validators never fail the whole check: an
//! I/O error while validating becomes a finding of its own.

use super::Severity;
use crate::core::error::GuardError;
use crate::core::manifest::ResourceBundleSection;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorFinding {
    pub validator: &'static str,
    pub severity: Severity,
    /// Path relative to the project root.
    pub path: PathBuf,
    pub description: String,
}

pub trait ResourceValidator: Send + Sync {
    fn name(&self) -> &'static str;
    fn applies_to(&self, bundle: &ResourceBundleSection) -> bool;
    fn validate(
        &self,
        project_root: &Path,
        bundle: &ResourceBundleSection,
    ) -> Result<Vec<ValidatorFinding>, GuardError>;
}

#[derive(Default)]
pub struct ValidatorRegistry {
    validators: Vec<Box<dyn ResourceValidator>>,
}

impl ValidatorRegistry {
    pub fn with_builtin() -> Self {
        let mut registry = Self::default();
        registry.register(Box::new(AssetCatalogValidator));
        registry.register(Box::new(LocalizationValidator));
        registry
    }

    pub fn register(&mut self, validator: Box<dyn ResourceValidator>) {
        self.validators.push(validator);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.validators.iter().map(|v| v.name()).collect()
    }

    pub fn run(&self, project_root: &Path, bundle: &ResourceBundleSection) -> Vec<ValidatorFinding> {
        let mut findings = Vec::new();
        for validator in self.validators.iter().filter(|v| v.applies_to(bundle)) {
            debug!(validator = validator.name(), bundle = %bundle.name, "validating resource bundle");
            match validator.validate(project_root, bundle) {
                Ok(mut found) => findings.append(&mut found),
                Err(e) => findings.push(ValidatorFinding {
                    validator: validator.name(),
                    severity: Severity::Warning,
                    path: PathBuf::from(&bundle.path),
                    description: format!("validator could not finish: {}", e),
                }),
            }
        }
        findings
    }
}

fn bundle_is(bundle: &ResourceBundleSection, resource_type: &str, extension: &str) -> bool {
    bundle.resource_type.as_deref() == Some(resource_type)
        || Path::new(&bundle.path)
            .extension()
            .is_some_and(|e| e == extension)
}

/// Asset catalogs need a parseable `Contents.json` at the top and in every
/// `*set` folder beneath it.
pub struct AssetCatalogValidator;

impl AssetCatalogValidator {
    const SET_SUFFIXES: [&'static str; 4] = [".imageset", ".colorset", ".appiconset", ".dataset"];

    fn check_contents(
        &self,
        project_root: &Path,
        dir_rel: &Path,
        out: &mut Vec<ValidatorFinding>,
    ) -> Result<(), GuardError> {
        let contents_rel = dir_rel.join("Contents.json");
        let finding = |description: String| ValidatorFinding {
            validator: self.name(),
            severity: Severity::Error,
            path: contents_rel.clone(),
            description,
        };
        match fs::read(project_root.join(&contents_rel)) {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Object(_)) => {}
                Ok(_) => out.push(finding("Contents.json is not a JSON object".to_string())),
                Err(e) => out.push(finding(format!("Contents.json is not valid JSON: {}", e))),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                out.push(finding("Contents.json is missing".to_string()))
            }
            Err(e) => return Err(GuardError::IoError(e)),
        }
        Ok(())
    }
}

impl ResourceValidator for AssetCatalogValidator {
    fn name(&self) -> &'static str {
        "asset_catalog"
    }

    fn applies_to(&self, bundle: &ResourceBundleSection) -> bool {
        bundle_is(bundle, "asset_catalog", "xcassets")
    }

    fn validate(
        &self,
        project_root: &Path,
        bundle: &ResourceBundleSection,
    ) -> Result<Vec<ValidatorFinding>, GuardError> {
        let root_rel = PathBuf::from(&bundle.path);
        let mut out = Vec::new();
        self.check_contents(project_root, &root_rel, &mut out)?;

        let mut sets = Vec::new();
        for entry in fs::read_dir(project_root.join(&root_rel)).map_err(GuardError::IoError)? {
            let entry = entry.map_err(GuardError::IoError)?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().map_err(GuardError::IoError)?.is_dir()
                && Self::SET_SUFFIXES.iter().any(|s| name.ends_with(s))
            {
                sets.push(name);
            }
        }
        sets.sort();
        for set in sets {
            self.check_contents(project_root, &root_rel.join(set), &mut out)?;
        }
        Ok(out)
    }
}

/// `.lproj` folders must hold at least one `.strings` table, and every table
/// must be readable text.
pub struct LocalizationValidator;

impl ResourceValidator for LocalizationValidator {
    fn name(&self) -> &'static str {
        "localization"
    }

    fn applies_to(&self, bundle: &ResourceBundleSection) -> bool {
        bundle_is(bundle, "localization", "lproj")
    }

    fn validate(
        &self,
        project_root: &Path,
        bundle: &ResourceBundleSection,
    ) -> Result<Vec<ValidatorFinding>, GuardError> {
        let root_rel = PathBuf::from(&bundle.path);
        let mut tables = Vec::new();
        for entry in fs::read_dir(project_root.join(&root_rel)).map_err(GuardError::IoError)? {
            let entry = entry.map_err(GuardError::IoError)?;
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "strings") {
                tables.push(entry.file_name());
            }
        }
        tables.sort();

        let mut out = Vec::new();
        if tables.is_empty() {
            out.push(ValidatorFinding {
                validator: self.name(),
                severity: Severity::Warning,
                path: root_rel.clone(),
                description: "localization folder has no .strings tables".to_string(),
            });
        }
        for table in tables {
            let rel = root_rel.join(&table);
            let bytes = fs::read(project_root.join(&rel)).map_err(GuardError::IoError)?;
            // UTF-16 tables start with a byte order mark.
            let utf16 = bytes.starts_with(&[0xFF, 0xFE]) || bytes.starts_with(&[0xFE, 0xFF]);
            if !utf16 && std::str::from_utf8(&bytes).is_err() {
                out.push(ValidatorFinding {
                    validator: self.name(),
                    severity: Severity::Error,
                    path: rel,
                    description: "strings table is neither UTF-8 nor UTF-16".to_string(),
                });
            }
        }
        Ok(out)
    }
}
