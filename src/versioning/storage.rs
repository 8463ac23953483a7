//! On-disk state of the version manager.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use walkdir::WalkDir;

use crate::error::{Error, ErrorCode, Result};

use super::types::{PluginVersionInfo, RollbackInfo};

/// File name of the version database inside the storage directory.
pub const DATABASE_FILE: &str = "versions.json";

/// Subdirectory of a version directory holding plugin data.
pub const DATA_DIR: &str = "data";

/// Subdirectory of the storage directory holding backups.
pub const BACKUP_DIR: &str = "backups";

/// The `versions.json` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionDatabase {
    /// Installed versions per plugin.
    #[serde(default)]
    pub installed_versions: BTreeMap<String, Vec<PluginVersionInfo>>,
    /// Active version string per plugin.
    #[serde(default)]
    pub active_versions: BTreeMap<String, String>,
    /// Backups per plugin, newest first.
    #[serde(default)]
    pub rollback_points: BTreeMap<String, Vec<RollbackInfo>>,
    /// Top-level keys this crate does not know about.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VersionDatabase {
    /// Read the database. A missing file yields an empty database.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(storage_error("read version database", path, e)),
        };
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&content).map_err(|e| {
            Error::new(
                ErrorCode::StorageError,
                format!("corrupt version database {}: {}", path.display(), e),
            )
        })
    }

    /// Write the database through a temporary file and rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::storage(format!("serialize version database: {}", e)))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, text).map_err(|e| storage_error("write version database", &tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| storage_error("replace version database", path, e))
    }
}

pub(crate) fn storage_error(action: &str, path: &Path, e: io::Error) -> Error {
    let code = if e.kind() == io::ErrorKind::PermissionDenied {
        ErrorCode::InsufficientPermissions
    } else {
        ErrorCode::StorageError
    };
    Error::new(code, format!("{} {}: {}", action, path.display(), e))
}

/// Copy `src` into `dst`, skipping top-level entries named in `skip`.
/// Returns the copied files relative to `dst`.
pub(crate) fn copy_tree(src: &Path, dst: &Path, skip: &[&str]) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dst).map_err(|e| storage_error("create", dst, e))?;
    let mut copied = Vec::new();

    let walker = WalkDir::new(src).min_depth(1).into_iter().filter_entry(|entry| {
        entry.depth() != 1
            || !skip
                .iter()
                .any(|s| entry.file_name().to_str() == Some(*s))
    });

    for entry in walker {
        let entry = entry.map_err(|e| Error::storage(format!("walk {}: {}", src.display(), e)))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::storage(e.to_string()))?
            .to_path_buf();
        let target = dst.join(&relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| storage_error("create", &target, e))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| storage_error("create", parent, e))?;
            }
            fs::copy(entry.path(), &target).map_err(|e| storage_error("copy", entry.path(), e))?;
            copied.push(relative);
        }
    }

    Ok(copied)
}

/// Remove everything inside `dir` except top-level entries named in `keep`.
pub(crate) fn clear_dir(dir: &Path, keep: &[&str]) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(storage_error("read", dir, e)),
    };

    for entry in entries {
        let entry = entry.map_err(|e| storage_error("read", dir, e))?;
        if keep.iter().any(|k| entry.file_name().to_str() == Some(*k)) {
            continue;
        }
        let path = entry.path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|e| storage_error("remove", &path, e))?;
    }
    Ok(())
}

/// Remove a directory tree if it exists.
pub(crate) fn remove_tree(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(storage_error("remove", dir, e)),
    }
}

/// Remove `dir` if it exists and is empty.
pub(crate) fn remove_if_empty(dir: &Path) {
    let empty = fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if empty {
        let _ = fs::remove_dir(dir);
    }
}

/// Whether `dir` exists and holds at least one entry.
pub(crate) fn is_populated(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Total size in bytes of the files under `dir`.
pub(crate) fn tree_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
