//! Data migration between plugin versions.

use std::collections::HashMap;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, ErrorCode, Result};
use crate::version::Version;

use super::storage::{copy_tree, remove_tree, storage_error};
use super::types::{
    now_ms, CompatibilityLevel, DataMigrator, MigrationCallback, MigrationContext,
    MigrationStrategy,
};

type Pair = (String, Version, Version);

/// Registered migrators, keyed by plugin and exact version pair.
#[derive(Default)]
pub(crate) struct MigrationRegistry {
    scripts: HashMap<Pair, Arc<dyn DataMigrator>>,
    callbacks: HashMap<Pair, MigrationCallback>,
}

impl MigrationRegistry {
    pub(crate) fn add_script(&mut self, id: &str, from: Version, to: Version, m: Arc<dyn DataMigrator>) {
        self.scripts.insert((id.to_string(), from, to), m);
    }

    pub(crate) fn add_callback(&mut self, id: &str, from: Version, to: Version, cb: MigrationCallback) {
        self.callbacks.insert((id.to_string(), from, to), cb);
    }

    pub(crate) fn remove(&mut self, id: &str, from: Version, to: Version) -> bool {
        let key = (id.to_string(), from, to);
        let script = self.scripts.remove(&key).is_some();
        let callback = self.callbacks.remove(&key).is_some();
        script || callback
    }

    pub(crate) fn script(&self, id: &str, from: Version, to: Version) -> Option<Arc<dyn DataMigrator>> {
        self.scripts.get(&(id.to_string(), from, to)).cloned()
    }

    pub(crate) fn callback(&self, id: &str, from: Version, to: Version) -> Option<MigrationCallback> {
        self.callbacks.get(&(id.to_string(), from, to)).cloned()
    }

    fn has_rule(&self, id: &str, from: Version, to: Version) -> bool {
        let key = (id.to_string(), from, to);
        self.scripts.contains_key(&key) || self.callbacks.contains_key(&key)
    }

    /// Strategy that a registered rule for the pair implies, if any.
    pub(crate) fn registered_strategy(&self, id: &str, from: Version, to: Version) -> Option<MigrationStrategy> {
        let key = (id.to_string(), from, to);
        if self.callbacks.contains_key(&key) {
            Some(MigrationStrategy::Callback)
        } else if self.scripts.contains_key(&key) {
            Some(MigrationStrategy::Script)
        } else {
            None
        }
    }

    /// Exact rule, a two-hop chain of rules, or an automatic migration
    /// across a non-breaking distance.
    pub(crate) fn is_available(&self, id: &str, from: Version, to: Version) -> bool {
        if self.has_rule(id, from, to) {
            return true;
        }

        let two_hop = self
            .scripts
            .keys()
            .chain(self.callbacks.keys())
            .filter(|(pid, f, _)| pid == id && *f == from)
            .any(|(_, _, mid)| self.has_rule(id, *mid, to));
        if two_hop {
            return true;
        }

        CompatibilityLevel::between(&from, &to) != CompatibilityLevel::Breaking
    }
}

fn guarded<F>(what: &str, f: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(_) => Err(Error::migration_failed(format!("{} panicked", what))),
    }
}

/// Run the migration described by `ctx`.
///
/// `source_data` is the data directory of `ctx.from_version`; `ctx.data_directory`
/// is the destination.
pub(crate) fn run(ctx: &MigrationContext, registry: &MigrationRegistry, source_data: &Path) -> Result<()> {
    let id = ctx.plugin_id.as_str();
    let (from, to) = (ctx.from_version, ctx.to_version);

    let result = match ctx.strategy {
        MigrationStrategy::None => Ok(()),
        MigrationStrategy::Automatic => automatic(ctx, source_data),
        MigrationStrategy::Manual => Err(Error::migration_failed(format!(
            "manual migration of {} from {} to {} must be performed by the host",
            id, from, to
        ))),
        MigrationStrategy::Script => match registry.script(id, from, to) {
            Some(script) => guarded("migration script", || script.migrate(ctx)).map_err(|e| {
                if e.code() == ErrorCode::MigrationFailed {
                    e
                } else {
                    Error::new(
                        ErrorCode::InvalidMigrationScript,
                        format!("{} failed: {}", script.description(), e),
                    )
                }
            }),
            None => Err(Error::migration_failed(format!(
                "no migration script registered for {} {} -> {}",
                id, from, to
            ))),
        },
        MigrationStrategy::Callback => {
            let callback = ctx
                .custom_migrator
                .clone()
                .or_else(|| registry.callback(id, from, to));
            match callback {
                Some(callback) => guarded("migration callback", || callback(ctx)),
                None => Err(Error::migration_failed(format!(
                    "no migration callback registered for {} {} -> {}",
                    id, from, to
                ))),
            }
        }
    };

    result.map_err(|e| {
        let e = if e.code() == ErrorCode::InvalidMigrationScript {
            e
        } else if e.code() != ErrorCode::MigrationFailed {
            Error::migration_failed(e.to_string())
        } else {
            e
        };
        e.with_plugin(id)
    })
}

/// Copy the data directory, then stamp every `config.json` with the
/// migration it went through.
///
/// The merged tree is built in a staging directory next to the destination
/// and swapped in only once it is complete, so a failure leaves the
/// destination as it was.
fn automatic(ctx: &MigrationContext, source_data: &Path) -> Result<()> {
    let dest = &ctx.data_directory;
    if !source_data.is_dir() {
        tracing::debug!(plugin_id = %ctx.plugin_id, "no data directory to migrate");
        return Ok(());
    }

    let staging = sibling(dest, "migrating");
    let outcome = stage(ctx, source_data, dest, &staging).and_then(|files| {
        swap_into_place(&staging, dest)?;
        Ok(files)
    });

    match outcome {
        Ok(files) => {
            tracing::info!(
                plugin_id = %ctx.plugin_id,
                from = %ctx.from_version,
                to = %ctx.to_version,
                files = files.len(),
                "data migrated"
            );
            Ok(())
        }
        Err(e) => {
            if let Err(cleanup) = remove_tree(&staging) {
                tracing::warn!(path = %staging.display(), error = %cleanup, "failed to remove staging directory");
            }
            Err(e)
        }
    }
}

fn stage(ctx: &MigrationContext, source_data: &Path, dest: &Path, staging: &Path) -> Result<Vec<PathBuf>> {
    if dest.is_dir() {
        copy_tree(dest, staging, &[])?;
    }
    let files = copy_tree(source_data, staging, &[])?;
    for file in &files {
        if file.file_name().and_then(|n| n.to_str()) == Some("config.json") {
            stamp_config(&staging.join(file), ctx)?;
        }
    }
    Ok(files)
}

fn sibling(dest: &Path, tag: &str) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "data".to_string());
    dest.with_file_name(format!(".{}.{}-{}", name, tag, Uuid::new_v4().simple()))
}

/// Replace `dest` with `staging`. The old tree is put back if the final
/// rename fails.
fn swap_into_place(staging: &Path, dest: &Path) -> Result<()> {
    let retired = dest.exists().then(|| sibling(dest, "retired"));
    if let Some(retired) = &retired {
        fs::rename(dest, retired).map_err(|e| storage_error("rename", dest, e))?;
    }

    if let Err(e) = fs::rename(staging, dest) {
        if let Some(retired) = &retired {
            let _ = fs::rename(retired, dest);
        }
        return Err(storage_error("rename", staging, e));
    }

    if let Some(retired) = &retired {
        if let Err(e) = remove_tree(retired) {
            tracing::warn!(path = %retired.display(), error = %e, "failed to remove replaced data");
        }
    }
    Ok(())
}

fn stamp_config(path: &Path, ctx: &MigrationContext) -> Result<()> {
    let text = fs::read_to_string(path).map_err(|e| storage_error("read", path, e))?;
    let mut value: Value = serde_json::from_str(&text)
        .map_err(|e| Error::migration_failed(format!("{} is not JSON: {}", path.display(), e)))?;

    let Some(object) = value.as_object_mut() else {
        return Err(Error::migration_failed(format!(
            "{} is not a JSON object",
            path.display()
        )));
    };
    object.insert("migrated_from".into(), Value::String(ctx.from_version.to_string()));
    object.insert("migrated_to".into(), Value::String(ctx.to_version.to_string()));
    object.insert("migration_timestamp".into(), Value::from(now_ms()));

    let text = serde_json::to_string_pretty(&value)
        .map_err(|e| Error::migration_failed(e.to_string()))?;
    fs::write(path, text).map_err(|e| storage_error("write", path, e))
}
