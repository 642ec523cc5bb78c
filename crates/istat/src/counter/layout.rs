//! On-disk layout of counters under a store root.
//!
//! Dotted counter names become nested directories; each tier file lives in
//! the counter's directory under the tier's name:
//!
//! ```text
//! <root>/
//! └── web/
//!     └── requests/          counter "web.requests"
//!         ├── 10s
//!         ├── 5m
//!         └── latency/       counter "web.requests.latency"
//!             ├── 10s
//!             └── 5m
//! <root>.bak/                deleted counters, mirrored tree
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::retention::{RetentionInterval, RetentionPolicy};
use crate::error::{Result, StatError};

/// Suffix appended to the root directory to form the backup root.
pub const BACKUP_SUFFIX: &str = ".bak";

/// Maps counter names to directories and tier files under a root.
///
/// # Examples
/// ```rust,ignore
/// use alopex_istat::counter::CounterLayout;
///
/// let layout = CounterLayout::new("/data");
/// let dir = layout.counter_dir("web.requests");
/// ```
#[derive(Debug, Clone)]
pub struct CounterLayout {
    root: PathBuf,
}

impl CounterLayout {
    /// Creates a layout rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Returns the root data directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the tier files of `name`.
    pub fn counter_dir(&self, name: &str) -> PathBuf {
        let mut dir = self.root.clone();
        for part in name.split('.').filter(|p| !p.is_empty()) {
            dir.push(part);
        }
        dir
    }

    /// Path of one tier file inside a counter directory.
    pub fn tier_path(dir: &Path, tier: &RetentionInterval) -> PathBuf {
        dir.join(&tier.name)
    }

    /// Counter name of a directory under the root, if it is one.
    pub fn counter_name_for(&self, dir: &Path) -> Option<String> {
        let rel = dir.strip_prefix(&self.root).ok()?;
        let parts = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("."))
    }

    /// Root of the backup tree, `<root>.bak`.
    pub fn backup_root(&self) -> PathBuf {
        let mut name = self.root.clone().into_os_string();
        name.push(BACKUP_SUFFIX);
        PathBuf::from(name)
    }

    /// Location of `path` mirrored into the backup tree.
    pub fn backup_path(&self, path: &Path) -> Option<PathBuf> {
        let rel = path.strip_prefix(&self.root).ok()?;
        Some(self.backup_root().join(rel))
    }

    /// Returns true if every tier file of `policy` exists in `dir`.
    pub fn files_exist(dir: &Path, policy: &RetentionPolicy) -> bool {
        !policy.is_empty() && policy.iter().all(|ri| Self::tier_path(dir, ri).is_file())
    }

    /// Moves a file into the backup tree by hard-linking it there and
    /// removing the original.
    ///
    /// # Errors
    ///
    /// Returns [`StatError::BackupFailed`] if the file is outside the root,
    /// the link cannot be created, or the original cannot be removed.
    pub fn move_to_backup(&self, path: &Path) -> Result<PathBuf> {
        let failed = |reason: String| StatError::BackupFailed {
            path: path.to_path_buf(),
            reason,
        };
        let target = self
            .backup_path(path)
            .ok_or_else(|| failed("not under the store root".to_string()))?;
        if let Some(parent) = target.parent() {
            if !parent.exists() {
                info!("Creating backup directory {}", parent.display());
            }
            fs::create_dir_all(parent).map_err(|e| failed(e.to_string()))?;
        }
        if target.exists() {
            fs::remove_file(&target).map_err(|e| failed(e.to_string()))?;
        }
        fs::hard_link(path, &target).map_err(|e| failed(e.to_string()))?;
        fs::remove_file(path).map_err(|e| failed(e.to_string()))?;
        debug!("Moved {} to {}", path.display(), target.display());
        Ok(target)
    }

    /// Lists every counter directory under the root that holds all tier
    /// files of `policy`, sorted by counter name.
    ///
    /// Unreadable directories are logged and skipped.
    pub fn scan(&self, policy: &RetentionPolicy) -> Vec<(String, PathBuf)> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("Cannot scan {}: {:?}", dir.display(), err);
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                }
            }
            if dir != self.root && Self::files_exist(&dir, policy) {
                if let Some(name) = self.counter_name_for(&dir) {
                    found.push((name, dir));
                }
            }
        }
        found.sort();
        found
    }

    /// Removes every empty directory below `dir`, deepest first. `dir`
    /// itself is removed too unless it is the root.
    ///
    /// Returns the number of directories removed.
    pub fn prune_empty_dirs(&self, dir: &Path) -> usize {
        let mut removed = 0;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("Cannot prune {}: {:?}", dir.display(), err);
                }
                return 0;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                removed += self.prune_empty_dirs(&path);
            }
        }
        if dir != self.root && is_empty_dir(dir) {
            match fs::remove_dir(dir) {
                Ok(()) => {
                    debug!("Pruned empty directory {}", dir.display());
                    removed += 1;
                }
                Err(err) => warn!("Couldn't delete empty directory {}: {:?}", dir.display(), err),
            }
        }
        removed
    }
}

fn is_empty_dir(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}
