//! Runtime configuration.
//!
//! Values are layered: built-in defaults, then `<project>/.projguard/config.toml`
//! when present, then process environment variables. Bad values are reported as
//! [`GuardError::Config`] before any side effect happens.

use crate::core::error::GuardError;
use crate::core::store::Store;
use crate::integrity::CheckMode;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
pub const ENV_LOG_FILE: &str = "LOG_FILE";
pub const ENV_TRANSACTION_LOG_FILE: &str = "TRANSACTION_LOG_FILE";
pub const ENV_ERROR_HANDLING_ENABLED: &str = "ERROR_HANDLING_ENABLED";
pub const ENV_AUTO_REPAIR: &str = "AUTO_REPAIR";
pub const ENV_AUTO_COMMIT_DELAY_MS: &str = "AUTO_COMMIT_DELAY_MS";
pub const ENV_KEEP_BACKUP_DAYS: &str = "KEEP_BACKUP_DAYS";
pub const ENV_INTEGRITY_CHECK_MODE: &str = "INTEGRITY_CHECK_MODE";
pub const ENV_LOCK_TIMEOUT_MS: &str = "LOCK_TIMEOUT_MS";
pub const ENV_TRANSACTION_STALE_MS: &str = "TRANSACTION_STALE_MS";
pub const ENV_MANIFEST_FILE: &str = "MANIFEST_FILE";

pub const DEFAULT_MANIFEST_FILE: &str = "project.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub transaction_log_file: Option<PathBuf>,
    /// Gates the startup recovery sweep of crash-interrupted transactions.
    pub error_handling_enabled: bool,
    /// Follow `integrity check` with an automatic repair.
    pub auto_repair: bool,
    /// Idle time after which an open transaction may be auto-committed.
    /// Zero disables auto-commit.
    pub auto_commit_delay_ms: u64,
    pub keep_backup_days: u64,
    pub integrity_check_mode: CheckMode,
    pub lock_timeout_ms: u64,
    /// Heartbeat age after which an open transaction counts as abandoned.
    pub stale_after_ms: u64,
    pub manifest_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            log_file: None,
            transaction_log_file: None,
            error_handling_enabled: true,
            auto_repair: false,
            auto_commit_delay_ms: 0,
            keep_backup_days: 7,
            integrity_check_mode: CheckMode::Normal,
            lock_timeout_ms: 2_000,
            stale_after_ms: 10 * 60 * 1000,
            manifest_file: DEFAULT_MANIFEST_FILE.to_string(),
        }
    }
}

/// Shape of `config.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    transaction_log_file: Option<PathBuf>,
    error_handling_enabled: Option<bool>,
    auto_repair: Option<bool>,
    auto_commit_delay_ms: Option<u64>,
    keep_backup_days: Option<u64>,
    integrity_check_mode: Option<String>,
    lock_timeout_ms: Option<u64>,
    stale_after_ms: Option<u64>,
    manifest_file: Option<String>,
}

impl Config {
    /// Loads the layered configuration for a project.
    pub fn load(store: &Store) -> Result<Self, GuardError> {
        let mut config = Self::default();
        let path = store.config_path();
        if path.is_file() {
            let content = fs::read_to_string(&path).map_err(GuardError::IoError)?;
            config.apply_file(&content)?;
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_file(&mut self, content: &str) -> Result<(), GuardError> {
        let file: FileConfig = toml::from_str(content)
            .map_err(|e| GuardError::Config(format!("config.toml: {}", e)))?;
        if let Some(v) = file.log_level {
            self.log_level = v;
        }
        if file.log_file.is_some() {
            self.log_file = file.log_file;
        }
        if file.transaction_log_file.is_some() {
            self.transaction_log_file = file.transaction_log_file;
        }
        if let Some(v) = file.error_handling_enabled {
            self.error_handling_enabled = v;
        }
        if let Some(v) = file.auto_repair {
            self.auto_repair = v;
        }
        if let Some(v) = file.auto_commit_delay_ms {
            self.auto_commit_delay_ms = v;
        }
        if let Some(v) = file.keep_backup_days {
            self.keep_backup_days = v;
        }
        if let Some(v) = file.integrity_check_mode {
            self.integrity_check_mode = v.parse()?;
        }
        if let Some(v) = file.lock_timeout_ms {
            self.lock_timeout_ms = v;
        }
        if let Some(v) = file.stale_after_ms {
            self.stale_after_ms = v;
        }
        if let Some(v) = file.manifest_file {
            self.manifest_file = v;
        }
        Ok(())
    }

    /// Applies environment overrides through `lookup` (injectable for tests).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), GuardError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_LOG_LEVEL) {
            self.log_level = v;
        }
        if let Some(v) = get(ENV_LOG_FILE) {
            self.log_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get(ENV_TRANSACTION_LOG_FILE) {
            self.transaction_log_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get(ENV_ERROR_HANDLING_ENABLED) {
            self.error_handling_enabled = parse_bool(ENV_ERROR_HANDLING_ENABLED, &v)?;
        }
        if let Some(v) = get(ENV_AUTO_REPAIR) {
            self.auto_repair = parse_bool(ENV_AUTO_REPAIR, &v)?;
        }
        if let Some(v) = get(ENV_AUTO_COMMIT_DELAY_MS) {
            self.auto_commit_delay_ms = parse_u64(ENV_AUTO_COMMIT_DELAY_MS, &v)?;
        }
        if let Some(v) = get(ENV_KEEP_BACKUP_DAYS) {
            self.keep_backup_days = parse_u64(ENV_KEEP_BACKUP_DAYS, &v)?;
        }
        if let Some(v) = get(ENV_INTEGRITY_CHECK_MODE) {
            self.integrity_check_mode = v.parse()?;
        }
        if let Some(v) = get(ENV_LOCK_TIMEOUT_MS) {
            self.lock_timeout_ms = parse_u64(ENV_LOCK_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = get(ENV_TRANSACTION_STALE_MS) {
            self.stale_after_ms = parse_u64(ENV_TRANSACTION_STALE_MS, &v)?;
        }
        if let Some(v) = get(ENV_MANIFEST_FILE) {
            self.manifest_file = v;
        }
        Ok(())
    }

    pub fn transaction_log_path(&self, store: &Store) -> PathBuf {
        match &self.transaction_log_file {
            Some(p) => store.resolve(p),
            None => store.default_transaction_log(),
        }
    }

    pub fn manifest_path(&self, store: &Store) -> PathBuf {
        store.project_root.join(&self.manifest_file)
    }

    pub fn auto_commit_enabled(&self) -> bool {
        self.auto_commit_delay_ms > 0
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, GuardError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(GuardError::Config(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64, GuardError> {
    raw.trim().parse::<u64>().map_err(|_| {
        GuardError::Config(format!(
            "{} must be a non-negative integer, got '{}'",
            key, raw
        ))
    })
}
