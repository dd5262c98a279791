//! Worth-syncing rules
//!
//! Decides which local and remote names take part in synchronization.
//! Built-in rules reject editor and office lock files, swap files, OS
//! metadata, version-control directories, our own partial downloads, and
//! names the local filesystem cannot hold. User patterns come from
//! `RepoInfo::ignored_paths`:
//!
//! - a pattern without `/` is matched against every path component, so
//!   `*.bak` ignores backups at any depth;
//! - a pattern with `/` is matched against the whole relative path, and
//!   everything below a matching folder is ignored too.

use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use tracing::trace;

use docsync_core::domain::{validate_name, RelativePath};

/// Suffix of in-progress downloads
pub const TEMP_SUFFIX: &str = ".docsync-part";

const LOCK_FILES: &[&str] = &["~$*", ".~lock.*#", "*.lock"];

const SWAP_FILES: &[&str] = &["*.swp", "*.swo", "*.swx", "*~", ".#*", "#*#", "*.tmp"];

const OS_METADATA: &[&str] = &[
    ".DS_Store",
    "._*",
    "Thumbs.db",
    "desktop.ini",
    ".directory",
    ".Trash-*",
];

const VCS_DIRS: &[&str] = &[".git", ".svn", ".hg", ".bzr", "CVS"];

const PATH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compiled filter for one folder pair
#[derive(Debug, Clone)]
pub struct SyncFilter {
    builtin: Vec<Pattern>,
    names: Vec<Pattern>,
    paths: Vec<Pattern>,
}

impl SyncFilter {
    /// Filter with the built-in rules and the given user patterns
    ///
    /// # Errors
    /// Fails when a user pattern is not a valid glob.
    pub fn new(ignored_paths: &[String]) -> Result<Self> {
        let builtin = LOCK_FILES
            .iter()
            .chain(SWAP_FILES)
            .chain(OS_METADATA)
            .chain(VCS_DIRS)
            .map(|p| Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid built-in ignore pattern")?;

        let mut names = Vec::new();
        let mut paths = Vec::new();
        for raw in ignored_paths {
            let trimmed = raw.trim().trim_matches('/');
            if trimmed.is_empty() {
                continue;
            }
            let pattern = Pattern::new(trimmed)
                .with_context(|| format!("Invalid ignore pattern: {raw}"))?;
            if trimmed.contains('/') {
                paths.push(pattern);
            } else {
                names.push(pattern);
            }
        }

        Ok(Self {
            builtin,
            names,
            paths,
        })
    }

    /// True when `name` can be created locally
    pub fn is_valid_local_name(name: &str) -> bool {
        validate_name(name).is_ok() && !name.chars().any(char::is_control)
    }

    /// True when a single leaf name passes every name rule
    pub fn is_worth_syncing_name(&self, name: &str) -> bool {
        if !Self::is_valid_local_name(name) || name.ends_with(TEMP_SUFFIX) {
            return false;
        }
        !self
            .builtin
            .iter()
            .chain(&self.names)
            .any(|p| p.matches(name))
    }

    /// True when `path` and all of its ancestors are synchronized
    pub fn is_worth_syncing(&self, path: &RelativePath) -> bool {
        if path.is_root() {
            return true;
        }
        if let Some(bad) = path.components().find(|c| !self.is_worth_syncing_name(c)) {
            trace!(path = %path, component = bad, "Filtered by name rule");
            return false;
        }
        if self.paths.is_empty() {
            return true;
        }

        let mut prefix = String::new();
        for component in path.components() {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(component);
            if self
                .paths
                .iter()
                .any(|p| p.matches_with(&prefix, PATH_OPTIONS))
            {
                trace!(path = %path, matched = %prefix, "Filtered by ignored path");
                return false;
            }
        }
        true
    }
}

impl Default for SyncFilter {
    fn default() -> Self {
        Self::new(&[]).unwrap_or(Self {
            builtin: Vec::new(),
            names: Vec::new(),
            paths: Vec::new(),
        })
    }
}
