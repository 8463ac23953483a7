//! Snapshots of installed versions used as rollback targets.
//!
//! A backup lives in `backups/<plugin>/<uuid>/` and holds a `version/` copy
//! of the version directory without its data, plus a `data/` copy of the
//! data directory.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{Error, ErrorCode, Result};
use crate::version::Version;

use super::storage::{clear_dir, copy_tree, remove_tree, storage_error, DATA_DIR};
use super::types::{now_ms, RollbackInfo};

const VERSION_TREE: &str = "version";

fn backup_error(e: Error) -> Error {
    Error::new(ErrorCode::BackupFailed, e.message)
}

/// Snapshot `version_dir` into a fresh directory under `backups_root`.
pub(crate) fn create(
    backups_root: &Path,
    plugin_id: &str,
    version_dir: &Path,
    current: Version,
    target: Version,
) -> Result<RollbackInfo> {
    let id = Uuid::new_v4().to_string();
    let backup_path = backups_root.join(plugin_id).join(&id);

    let result = (|| -> Result<Vec<PathBuf>> {
        let mut affected: Vec<PathBuf> = copy_tree(version_dir, &backup_path.join(VERSION_TREE), &[DATA_DIR])?
            .into_iter()
            .map(|p| Path::new(VERSION_TREE).join(p))
            .collect();

        let data_src = version_dir.join(DATA_DIR);
        let data_dst = backup_path.join(DATA_DIR);
        if data_src.is_dir() {
            affected.extend(
                copy_tree(&data_src, &data_dst, &[])?
                    .into_iter()
                    .map(|p| Path::new(DATA_DIR).join(p)),
            );
        } else {
            std::fs::create_dir_all(&data_dst).map_err(|e| storage_error("create", &data_dst, e))?;
        }
        Ok(affected)
    })();

    match result {
        Ok(affected_files) => Ok(RollbackInfo {
            id,
            plugin_id: plugin_id.to_string(),
            current_version: current,
            target_version: target,
            backup_path,
            backup_time: now_ms(),
            affected_files,
            data_migration_required: current != target,
        }),
        Err(e) => {
            let _ = remove_tree(&backup_path);
            Err(backup_error(e).with_plugin(plugin_id))
        }
    }
}

/// Restore a backup over `version_dir`. The data tree is restored only when
/// `preserve_user_data` is false.
pub(crate) fn restore(info: &RollbackInfo, version_dir: &Path, preserve_user_data: bool) -> Result<()> {
    let version_tree = info.backup_path.join(VERSION_TREE);
    if !version_tree.is_dir() {
        return Err(Error::new(
            ErrorCode::RollbackFailed,
            format!("backup {} is missing its version tree", info.backup_path.display()),
        )
        .with_plugin(&info.plugin_id));
    }

    let restore_err = |e: Error| {
        Error::new(ErrorCode::RollbackFailed, e.message).with_plugin(&info.plugin_id)
    };

    clear_dir(version_dir, &[DATA_DIR]).map_err(restore_err)?;
    copy_tree(&version_tree, version_dir, &[]).map_err(restore_err)?;

    if !preserve_user_data {
        let data_dir = version_dir.join(DATA_DIR);
        clear_dir(&data_dir, &[]).map_err(restore_err)?;
        let data_tree = info.backup_path.join(DATA_DIR);
        if data_tree.is_dir() {
            copy_tree(&data_tree, &data_dir, &[]).map_err(restore_err)?;
        }
    }

    Ok(())
}

/// Delete a backup's directory.
pub(crate) fn remove(info: &RollbackInfo) -> Result<()> {
    remove_tree(&info.backup_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn populate(dir: &Path) {
        fs::create_dir_all(dir.join(DATA_DIR)).unwrap();
        fs::write(dir.join("plugin.bin"), b"v1 code").unwrap();
        fs::write(dir.join(DATA_DIR).join("state.db"), b"v1 data").unwrap();
    }

    #[test]
    fn test_backup_and_full_restore() {
        let root = tempfile::tempdir().unwrap();
        let version_dir = root.path().join("cal/1.0.0");
        populate(&version_dir);

        let v = Version::new(1, 0, 0);
        let info = create(&root.path().join("backups"), "cal", &version_dir, v, v).unwrap();
        assert!(!info.data_migration_required);
        assert!(info.affected_files.contains(&PathBuf::from("version/plugin.bin")));
        assert!(info.affected_files.contains(&PathBuf::from("data/state.db")));

        fs::write(version_dir.join("plugin.bin"), b"broken").unwrap();
        fs::write(version_dir.join("extra.bin"), b"junk").unwrap();
        fs::write(version_dir.join(DATA_DIR).join("state.db"), b"changed").unwrap();

        restore(&info, &version_dir, false).unwrap();
        assert_eq!(fs::read(version_dir.join("plugin.bin")).unwrap(), b"v1 code");
        assert!(!version_dir.join("extra.bin").exists());
        assert_eq!(fs::read(version_dir.join(DATA_DIR).join("state.db")).unwrap(), b"v1 data");

        remove(&info).unwrap();
        assert!(!info.backup_path.exists());
    }

    #[test]
    fn test_restore_preserving_user_data() {
        let root = tempfile::tempdir().unwrap();
        let version_dir = root.path().join("cal/1.0.0");
        populate(&version_dir);

        let info = create(
            &root.path().join("backups"),
            "cal",
            &version_dir,
            Version::new(2, 0, 0),
            Version::new(1, 0, 0),
        )
        .unwrap();
        assert!(info.data_migration_required);

        fs::write(version_dir.join(DATA_DIR).join("state.db"), b"newer").unwrap();
        restore(&info, &version_dir, true).unwrap();
        assert_eq!(fs::read(version_dir.join(DATA_DIR).join("state.db")).unwrap(), b"newer");
    }

    #[test]
    fn test_missing_source_fails_cleanly() {
        let root = tempfile::tempdir().unwrap();
        let v = Version::new(1, 0, 0);
        let err = create(
            &root.path().join("backups"),
            "cal",
            &root.path().join("absent"),
            v,
            v,
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BackupFailed);
        assert!(!root.path().join("backups/cal").read_dir().map(|mut d| d.next().is_some()).unwrap_or(false));
    }
}
