//! Configuration module for docsync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.
//!
//! Each synchronized folder pair is described by one [`RepoInfo`]. The engine
//! receives it as an immutable `Arc<RepoInfo>`; nothing in the configuration is
//! mutated after loading.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::newtypes::RemotePath;
use crate::domain::sync_item::FolderRoots;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for docsync.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Synchronized folder pairs.
    pub folders: Vec<RepoInfo>,
    pub watcher: WatcherConfig,
    pub transfer: TransferConfig,
    pub logging: LoggingConfig,
    pub mirror: MirrorConfig,
    /// Directory holding the change-store database.
    pub state_dir: PathBuf,
}

/// Direction in which a folder pair propagates changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Bidirectional,
    /// Remote changes are applied locally; local changes are never pushed.
    DownloadOnly,
}

/// One synchronized folder pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfo {
    /// Unique name of the pair, used as the change-store partition key.
    pub name: String,
    /// Local directory being synchronized.
    pub local_path: PathBuf,
    /// Remote folder being synchronized.
    pub remote_path: RemotePath,
    /// Seconds between scheduled passes.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_max_retries")]
    pub max_download_retries: u32,
    #[serde(default = "default_max_retries")]
    pub max_upload_retries: u32,
    #[serde(default = "default_max_retries")]
    pub max_delete_retries: u32,
    /// Transfer chunk size in bytes (reserved for chunked transfer).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Glob patterns, relative to the folder root, that are never synchronized.
    #[serde(default)]
    pub ignored_paths: Vec<String>,
    #[serde(default)]
    pub mode: SyncMode,
    /// Name placed in conflict-copy suffixes.
    #[serde(default = "default_user")]
    pub user: String,
    /// Skip the second of two children whose names differ only by case.
    #[serde(default)]
    pub ignore_case_duplicates: bool,
    /// Capability override; `Some(false)` disables change-log scans.
    #[serde(default)]
    pub change_log: Option<bool>,
    /// Capability override; `Some(false)` disables bulk descendant fetches.
    #[serde(default)]
    pub descendants: Option<bool>,
}

/// Local watcher timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Seconds a deletion waits before it is acted upon.
    pub grace_secs: u64,
    /// Milliseconds a deletion is held back so a following create can pair with it.
    pub pairing_window_ms: u64,
    /// Milliseconds of quiet before watcher activity triggers a pass.
    pub debounce_ms: u64,
}

/// In-operation retry of transient remote failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Attempts per remote call, including the first one.
    pub retry_attempts: u32,
    /// Delay before the first retry; doubled on every further attempt.
    pub retry_base_delay_ms: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Output format: `text` or `json`.
    pub format: String,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_chunk_size() -> u64 {
    4 * 1024 * 1024
}

fn default_user() -> String {
    std::env::var("USER")
        .ok()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "docsync".to_string())
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/docsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("docsync")
            .join("config.yaml")
    }

    /// Location of the change-store database.
    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("docsync.db")
    }

    /// Folder pair by name.
    pub fn folder(&self, name: &str) -> Option<&RepoInfo> {
        self.folders.iter().find(|f| f.name == name)
    }
}

impl RepoInfo {
    /// Folder pair with default settings.
    pub fn new(name: impl Into<String>, local_path: impl Into<PathBuf>, remote_path: RemotePath) -> Self {
        Self {
            name: name.into(),
            local_path: local_path.into(),
            remote_path,
            poll_interval: default_poll_interval(),
            max_download_retries: default_max_retries(),
            max_upload_retries: default_max_retries(),
            max_delete_retries: default_max_retries(),
            chunk_size: default_chunk_size(),
            ignored_paths: Vec::new(),
            mode: SyncMode::default(),
            user: default_user(),
            ignore_case_duplicates: false,
            change_log: None,
            descendants: None,
        }
    }

    pub fn roots(&self) -> FolderRoots {
        FolderRoots::new(self.local_path.clone(), self.remote_path.clone())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn is_bidirectional(&self) -> bool {
        self.mode == SyncMode::Bidirectional
    }
}

/// Mounted share used as the remote side by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Directory that remote paths are resolved against.
    pub root: PathBuf,
}

impl WatcherConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn pairing_window(&self) -> Duration {
        Duration::from_millis(self.pairing_window_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl TransferConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Config::default()
// ---------------------------------------------------------------------------

impl Default for Config {
    fn default() -> Self {
        Self {
            folders: Vec::new(),
            watcher: WatcherConfig::default(),
            transfer: TransferConfig::default(),
            logging: LoggingConfig::default(),
            mirror: MirrorConfig::default(),
            state_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join("docsync"),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            grace_secs: 15,
            pairing_window_ms: 2000,
            debounce_ms: 500,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 5,
            retry_base_delay_ms: 1000,
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/mnt/docsync"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"folders[0].poll_interval"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `logging.format`.
const VALID_LOG_FORMATS: &[&str] = &["text", "json"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut names = HashSet::new();

        // --- folders ---
        for (i, folder) in self.folders.iter().enumerate() {
            let field = |name: &str| format!("folders[{i}].{name}");

            if folder.name.trim().is_empty() {
                errors.push(ValidationError {
                    field: field("name"),
                    message: "must not be empty".into(),
                });
            } else if !names.insert(folder.name.as_str()) {
                errors.push(ValidationError {
                    field: field("name"),
                    message: format!("duplicate folder name '{}'", folder.name),
                });
            }
            if !folder.local_path.is_absolute() {
                errors.push(ValidationError {
                    field: field("local_path"),
                    message: format!("must be absolute: {}", folder.local_path.display()),
                });
            }
            if folder.poll_interval == 0 {
                errors.push(ValidationError {
                    field: field("poll_interval"),
                    message: "must be greater than 0".into(),
                });
            }
            for (name, value) in [
                ("max_download_retries", folder.max_download_retries),
                ("max_upload_retries", folder.max_upload_retries),
                ("max_delete_retries", folder.max_delete_retries),
            ] {
                if value == 0 {
                    errors.push(ValidationError {
                        field: field(name),
                        message: "must be greater than 0".into(),
                    });
                }
            }
            if folder.chunk_size == 0 {
                errors.push(ValidationError {
                    field: field("chunk_size"),
                    message: "must be greater than 0".into(),
                });
            }
            if folder.user.trim().is_empty() {
                errors.push(ValidationError {
                    field: field("user"),
                    message: "must not be empty".into(),
                });
            }
            for pattern in &folder.ignored_paths {
                if pattern.trim().is_empty() || pattern.starts_with('/') {
                    errors.push(ValidationError {
                        field: field("ignored_paths"),
                        message: format!("pattern must be a non-empty relative glob: '{pattern}'"),
                    });
                }
            }
        }

        // Two pairs sharing a local directory would fight over the same files.
        for (i, a) in self.folders.iter().enumerate() {
            for b in &self.folders[i + 1..] {
                if a.local_path.starts_with(&b.local_path) || b.local_path.starts_with(&a.local_path)
                {
                    errors.push(ValidationError {
                        field: "folders".into(),
                        message: format!(
                            "local paths of '{}' and '{}' overlap",
                            a.name, b.name
                        ),
                    });
                }
            }
        }

        // --- watcher ---
        if self.watcher.grace_secs == 0 {
            errors.push(ValidationError {
                field: "watcher.grace_secs".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.watcher.pairing_window_ms > self.watcher.grace_secs * 1000 {
            errors.push(ValidationError {
                field: "watcher.pairing_window_ms".into(),
                message: format!(
                    "pairing_window_ms ({}) must not exceed the grace period ({} s)",
                    self.watcher.pairing_window_ms, self.watcher.grace_secs
                ),
            });
        }

        // --- transfer ---
        if self.transfer.retry_attempts == 0 {
            errors.push(ValidationError {
                field: "transfer.retry_attempts".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- mirror ---
        if !self.mirror.root.is_absolute() {
            errors.push(ValidationError {
                field: "mirror.root".into(),
                message: format!("must be absolute: {}", self.mirror.root.display()),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }
        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            errors.push(ValidationError {
                field: "logging.format".into(),
                message: format!(
                    "invalid format '{}'; valid options: {}",
                    self.logging.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use docsync_core::config::{ConfigBuilder, RepoInfo};
/// use docsync_core::domain::RemotePath;
///
/// let config = ConfigBuilder::new()
///     .folder(RepoInfo::new(
///         "team",
///         "/home/user/Team",
///         RemotePath::new("/Sites/team").unwrap(),
///     ))
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- folders ---

    pub fn folder(mut self, folder: RepoInfo) -> Self {
        self.config.folders.push(folder);
        self
    }

    // --- watcher ---

    pub fn watcher_grace_secs(mut self, seconds: u64) -> Self {
        self.config.watcher.grace_secs = seconds;
        self
    }

    pub fn watcher_pairing_window_ms(mut self, ms: u64) -> Self {
        self.config.watcher.pairing_window_ms = ms;
        self
    }

    pub fn watcher_debounce_ms(mut self, ms: u64) -> Self {
        self.config.watcher.debounce_ms = ms;
        self
    }

    // --- transfer ---

    pub fn transfer_retry_attempts(mut self, n: u32) -> Self {
        self.config.transfer.retry_attempts = n;
        self
    }

    pub fn transfer_retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.transfer.retry_base_delay_ms = ms;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_format(mut self, format: impl Into<String>) -> Self {
        self.config.logging.format = format.into();
        self
    }

    // --- mirror ---

    pub fn mirror_root(mut self, root: PathBuf) -> Self {
        self.config.mirror.root = root;
        self
    }

    // --- state ---

    pub fn state_dir(mut self, dir: PathBuf) -> Self {
        self.config.state_dir = dir;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
