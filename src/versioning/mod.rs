//! Side-by-side plugin versions: install, activate, migrate, roll back.
//!
//! Layout under the storage directory:
//!
//! ```text
//! versions.json
//! <plugin>/<M.m.p>/...            installed files
//! <plugin>/<M.m.p>/data/          per-version data
//! backups/<plugin>/<uuid>/version backup of the files
//! backups/<plugin>/<uuid>/data    backup of the data
//! ```

mod backup;
mod migration;
mod storage;
mod types;

pub use storage::{VersionDatabase, BACKUP_DIR, DATABASE_FILE, DATA_DIR};
pub use types::{
    CompatibilityLevel, CompatibilityRule, DataMigrator, MigrationCallback, MigrationContext,
    MigrationStrategy, PluginVersionInfo, RollbackInfo, VersionStatus,
};

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use crate::error::{Error, ErrorCode, Result};
use crate::lifecycle::SubscriptionId;
use crate::version::Version;

use migration::MigrationRegistry;
use storage::{copy_tree, is_populated, remove_if_empty, remove_tree, storage_error, tree_size};
use types::now_ms;

/// Callback fired on version changes: `(plugin_id, version, status)`.
pub type VersionCallback = Arc<dyn Fn(&str, &Version, VersionStatus) + Send + Sync>;

/// Parameters for [`VersionManager::install_version`].
#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// Plugin id.
    pub plugin_id: String,
    /// Version being installed.
    pub version: Version,
    /// File or directory to copy in.
    pub source: PathBuf,
    /// Overwrite an existing install of the same version.
    pub replace_existing: bool,
    /// Free-form metadata stored with the record.
    pub metadata: Value,
    /// Plugin ids this version depends on.
    pub dependencies: Vec<String>,
    /// Name of a migration script shipped with the version.
    pub migration_script: Option<String>,
    /// Configuration schema.
    pub configuration_schema: Value,
}

impl InstallRequest {
    /// Create a request.
    pub fn new(plugin_id: impl Into<String>, version: Version, source: impl Into<PathBuf>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            version,
            source: source.into(),
            replace_existing: false,
            metadata: Value::Object(Map::new()),
            dependencies: Vec::new(),
            migration_script: None,
            configuration_schema: Value::Object(Map::new()),
        }
    }

    /// Allow overwriting an existing install.
    pub fn replace_existing(mut self, replace: bool) -> Self {
        self.replace_existing = replace;
        self
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Add a dependency.
    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Name the shipped migration script.
    pub fn with_migration_script(mut self, name: impl Into<String>) -> Self {
        self.migration_script = Some(name.into());
        self
    }

    /// Attach a configuration schema.
    pub fn with_configuration_schema(mut self, schema: Value) -> Self {
        self.configuration_schema = schema;
        self
    }
}

#[derive(Default)]
struct VersionTable {
    installed: BTreeMap<String, Vec<PluginVersionInfo>>,
    active: BTreeMap<String, Version>,
    extra: Map<String, Value>,
}

impl VersionTable {
    fn find(&self, id: &str, version: &Version) -> Option<&PluginVersionInfo> {
        self.installed.get(id)?.iter().find(|i| i.version == *version)
    }

    fn find_mut(&mut self, id: &str, version: &Version) -> Option<&mut PluginVersionInfo> {
        self.installed.get_mut(id)?.iter_mut().find(|i| i.version == *version)
    }

    /// Make `version` the only active record of `id`.
    fn activate(&mut self, id: &str, version: &Version) {
        if let Some(records) = self.installed.get_mut(id) {
            for record in records.iter_mut() {
                if record.version == *version {
                    record.set_active(true);
                } else if record.is_active {
                    record.set_active(false);
                }
            }
        }
        self.active.insert(id.to_string(), *version);
    }
}

/// Manages installed plugin versions under one storage directory.
pub struct VersionManager {
    storage_dir: PathBuf,
    versions: RwLock<VersionTable>,
    migrations: RwLock<MigrationRegistry>,
    compatibility: RwLock<HashMap<String, Vec<CompatibilityRule>>>,
    rollback: RwLock<HashMap<String, Vec<RollbackInfo>>>,
    events: RwLock<Vec<(SubscriptionId, VersionCallback)>>,
    persist_lock: Mutex<()>,
}

impl VersionManager {
    /// Open (or create) a storage directory and load its database.
    pub fn new(storage_dir: impl Into<PathBuf>) -> Result<Self> {
        let storage_dir = storage_dir.into();
        fs::create_dir_all(&storage_dir).map_err(|e| storage_error("create", &storage_dir, e))?;

        let db = VersionDatabase::load(&storage_dir.join(DATABASE_FILE))?;
        let mut table = VersionTable {
            installed: db.installed_versions,
            active: BTreeMap::new(),
            extra: db.extra,
        };
        for (id, version) in db.active_versions {
            match Version::parse(&version) {
                Ok(v) => {
                    table.active.insert(id, v);
                }
                Err(e) => tracing::warn!(plugin_id = %id, error = %e, "ignoring bad active version"),
            }
        }

        tracing::debug!(
            path = %storage_dir.display(),
            plugins = table.installed.len(),
            "version database loaded"
        );

        Ok(Self {
            storage_dir,
            versions: RwLock::new(table),
            migrations: RwLock::new(MigrationRegistry::default()),
            compatibility: RwLock::new(HashMap::new()),
            rollback: RwLock::new(db.rollback_points.into_iter().collect()),
            events: RwLock::new(Vec::new()),
            persist_lock: Mutex::new(()),
        })
    }

    /// Storage root.
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Directory of one installed version.
    pub fn version_dir(&self, id: &str, version: &Version) -> PathBuf {
        self.storage_dir.join(id).join(version.to_string())
    }

    /// Data directory of one installed version.
    pub fn data_dir(&self, id: &str, version: &Version) -> PathBuf {
        self.version_dir(id, version).join(DATA_DIR)
    }

    fn backups_root(&self) -> PathBuf {
        self.storage_dir.join(BACKUP_DIR)
    }

    fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock();
        let db = {
            let versions = self.versions.read();
            let rollback = self.rollback.read();
            VersionDatabase {
                installed_versions: versions.installed.clone(),
                active_versions: versions
                    .active
                    .iter()
                    .map(|(id, v)| (id.clone(), v.to_string()))
                    .collect(),
                rollback_points: rollback
                    .iter()
                    .filter(|(_, points)| !points.is_empty())
                    .map(|(id, points)| (id.clone(), points.clone()))
                    .collect(),
                extra: versions.extra.clone(),
            }
        };
        db.save(&self.storage_dir.join(DATABASE_FILE))
    }

    // Events

    /// Subscribe to version changes.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &Version, VersionStatus) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        self.events.write().push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut events = self.events.write();
        let before = events.len();
        events.retain(|(sid, _)| *sid != id);
        events.len() != before
    }

    fn emit(&self, id: &str, version: &Version, status: VersionStatus) {
        let callbacks: Vec<VersionCallback> =
            self.events.read().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(id, version, status))).is_err() {
                tracing::error!(plugin_id = id, %version, %status, "version callback panicked");
            }
        }
    }

    // Install

    /// Install a version with default options.
    pub fn install(
        &self,
        id: &str,
        version: Version,
        source: &Path,
        replace_existing: bool,
    ) -> Result<PluginVersionInfo> {
        self.install_version(InstallRequest::new(id, version, source).replace_existing(replace_existing))
    }

    /// Copy a version into storage and record it.
    pub fn install_version(&self, request: InstallRequest) -> Result<PluginVersionInfo> {
        let id = request.plugin_id.as_str();
        let version = request.version;

        if !request.source.exists() {
            return Err(Error::file_not_found(request.source.display()).with_plugin(id));
        }

        let was_active = {
            let versions = self.versions.read();
            match versions.find(id, &version) {
                Some(_) if !request.replace_existing => {
                    return Err(Error::new(
                        ErrorCode::VersionAlreadyExists,
                        format!("{} {} is already installed", id, version),
                    )
                    .with_plugin(id));
                }
                Some(existing) => existing.is_active,
                None => false,
            }
        };

        self.emit(id, &version, VersionStatus::Installing);

        let dir = self.version_dir(id, &version);
        let copied = (|| -> Result<()> {
            if dir.exists() {
                storage::clear_dir(&dir, &[DATA_DIR])?;
            }
            fs::create_dir_all(&dir).map_err(|e| storage_error("create", &dir, e))?;

            if request.source.is_dir() {
                copy_tree(&request.source, &dir, &[])?;
            } else {
                let name = request
                    .source
                    .file_name()
                    .ok_or_else(|| Error::invalid_format("install source has no file name"))?;
                fs::copy(&request.source, dir.join(name))
                    .map_err(|e| storage_error("copy", &request.source, e))?;
            }

            let data = dir.join(DATA_DIR);
            fs::create_dir_all(&data).map_err(|e| storage_error("create", &data, e))?;

            if !is_populated(&dir) {
                return Err(Error::new(
                    ErrorCode::CorruptedInstallation,
                    format!("{} is empty after install", dir.display()),
                ));
            }
            Ok(())
        })();

        if let Err(e) = copied {
            if !request.replace_existing {
                let _ = remove_tree(&dir);
                remove_if_empty(&self.storage_dir.join(id));
            }
            tracing::error!(plugin_id = id, %version, error = %e, "install failed");
            return Err(e.with_plugin(id));
        }

        let record = {
            let mut versions = self.versions.write();
            let previous = versions
                .installed
                .get(id)
                .and_then(|records| records.iter().filter(|r| r.version < version).map(|r| r.version).max());

            let mut record = PluginVersionInfo::new(id, version, dir);
            record.metadata = request.metadata;
            record.dependencies = request.dependencies;
            record.migration_script = request.migration_script;
            record.configuration_schema = request.configuration_schema;
            record.compatibility_level = previous
                .map(|p| CompatibilityLevel::between(&p, &version))
                .unwrap_or_default();
            record.set_active(was_active);

            let records = versions.installed.entry(id.to_string()).or_default();
            records.retain(|r| r.version != version);
            records.push(record.clone());
            records.sort_by(|a, b| a.version.cmp(&b.version));
            record
        };

        self.persist()?;
        tracing::info!(plugin_id = id, %version, "version installed");
        self.emit(id, &version, VersionStatus::Installed);
        Ok(record)
    }

    /// Remove an installed version.
    pub fn uninstall(&self, id: &str, version: &Version, force: bool) -> Result<()> {
        {
            let versions = self.versions.read();
            let record = versions
                .find(id, version)
                .ok_or_else(|| Error::version_not_found(id, version))?;
            if record.is_active && !force {
                return Err(Error::new(
                    ErrorCode::ActiveVersionConflict,
                    format!("{} {} is active", id, version),
                )
                .with_plugin(id));
            }
        }

        let dir = self.version_dir(id, version);
        remove_tree(&dir).map_err(|e| e.with_plugin(id))?;
        remove_if_empty(&self.storage_dir.join(id));

        {
            let mut versions = self.versions.write();
            if let Some(records) = versions.installed.get_mut(id) {
                records.retain(|r| r.version != *version);
                if records.is_empty() {
                    versions.installed.remove(id);
                }
            }
            if versions.active.get(id) == Some(version) {
                versions.active.remove(id);
            }
        }

        self.persist()?;
        tracing::info!(plugin_id = id, %version, "version uninstalled");
        self.emit(id, version, VersionStatus::NotInstalled);
        Ok(())
    }

    // Queries

    /// Installed versions of a plugin, oldest first.
    pub fn get_installed_versions(&self, id: &str) -> Vec<PluginVersionInfo> {
        self.versions.read().installed.get(id).cloned().unwrap_or_default()
    }

    /// The active version of a plugin.
    pub fn get_active_version(&self, id: &str) -> Option<Version> {
        self.versions.read().active.get(id).copied()
    }

    /// Record for one version.
    pub fn get_version_info(&self, id: &str, version: &Version) -> Option<PluginVersionInfo> {
        self.versions.read().find(id, version).cloned()
    }

    /// Whether a version is installed.
    pub fn is_version_installed(&self, id: &str, version: &Version) -> bool {
        self.versions.read().find(id, version).is_some()
    }

    /// Plugins with at least one installed version.
    pub fn get_all_plugins(&self) -> Vec<String> {
        self.versions.read().installed.keys().cloned().collect()
    }

    /// Newest installed version.
    pub fn get_latest_version(&self, id: &str) -> Option<Version> {
        self.versions
            .read()
            .installed
            .get(id)
            .and_then(|records| records.iter().map(|r| r.version).max())
    }

    // Activation

    /// Make `version` the active version, migrating data from the previous
    /// active version first when `migrate_data` is set.
    pub fn set_active_version(&self, id: &str, version: &Version, migrate_data: bool) -> Result<()> {
        let previous = {
            let versions = self.versions.read();
            if versions.find(id, version).is_none() {
                return Err(Error::version_not_found(id, version));
            }
            versions.active.get(id).copied()
        };

        if let Some(previous) = previous.filter(|p| p != version) {
            if migrate_data {
                let strategy = {
                    let migrations = self.migrations.read();
                    if !migrations.is_available(id, previous, *version) {
                        tracing::warn!(plugin_id = id, from = %previous, to = %version, "no migration path");
                        return Err(Error::migration_failed(format!(
                            "no migration from {} to {} for {}",
                            previous, version, id
                        ))
                        .with_plugin(id));
                    }
                    migrations
                        .registered_strategy(id, previous, *version)
                        .unwrap_or(MigrationStrategy::Automatic)
                };
                let ctx = self.migration_context(id, previous, *version, strategy);
                self.migrate_plugin_data(&ctx)?;
            }
        }

        self.versions.write().activate(id, version);
        self.persist()?;

        tracing::info!(plugin_id = id, %version, "version activated");
        self.emit(id, version, VersionStatus::Active);
        Ok(())
    }

    /// Bump a version's usage counter.
    pub fn record_usage(&self, id: &str, version: &Version) -> Result<()> {
        {
            let mut versions = self.versions.write();
            let record = versions
                .find_mut(id, version)
                .ok_or_else(|| Error::version_not_found(id, version))?;
            record.usage_count += 1;
            record.last_used = now_ms();
        }
        self.persist()
    }

    /// Mark an installed version deprecated. Active versions cannot be.
    pub fn deprecate_version(&self, id: &str, version: &Version) -> Result<()> {
        {
            let mut versions = self.versions.write();
            let record = versions
                .find_mut(id, version)
                .ok_or_else(|| Error::version_not_found(id, version))?;
            if record.is_active {
                return Err(Error::new(
                    ErrorCode::ActiveVersionConflict,
                    format!("{} {} is active", id, version),
                )
                .with_plugin(id));
            }
            record.status = VersionStatus::Deprecated;
        }
        self.persist()?;
        self.emit(id, version, VersionStatus::Deprecated);
        Ok(())
    }

    /// Check that an installed version's files are present. A missing or
    /// empty directory marks the version corrupted and deactivates it.
    pub fn verify_installation(&self, id: &str, version: &Version) -> Result<bool> {
        let dir = {
            let versions = self.versions.read();
            versions
                .find(id, version)
                .ok_or_else(|| Error::version_not_found(id, version))?
                .installation_path
                .clone()
        };

        let intact = dir.is_dir() && fs::read_dir(&dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .any(|e| e.file_name().to_str() != Some(DATA_DIR))
            })
            .unwrap_or(false);
        if intact {
            return Ok(true);
        }

        {
            let mut versions = self.versions.write();
            if let Some(record) = versions.find_mut(id, version) {
                record.is_active = false;
                record.status = VersionStatus::Corrupted;
            }
            if versions.active.get(id) == Some(version) {
                versions.active.remove(id);
            }
        }
        self.persist()?;
        tracing::error!(plugin_id = id, %version, "installation is corrupted");
        self.emit(id, version, VersionStatus::Corrupted);
        Ok(false)
    }

    /// Uninstall the oldest inactive versions beyond `keep`. Returns the
    /// removed versions.
    pub fn cleanup_old_versions(&self, id: &str, keep: usize) -> Result<Vec<Version>> {
        let doomed: Vec<Version> = {
            let versions = self.versions.read();
            let mut inactive: Vec<Version> = versions
                .installed
                .get(id)
                .map(|records| records.iter().filter(|r| !r.is_active).map(|r| r.version).collect())
                .unwrap_or_default();
            inactive.sort_by(|a, b| b.cmp(a));
            inactive.into_iter().skip(keep).collect()
        };

        for version in &doomed {
            self.uninstall(id, version, false)?;
        }
        Ok(doomed)
    }

    /// Bytes used under the storage directory.
    pub fn storage_usage(&self) -> u64 {
        tree_size(&self.storage_dir)
    }

    // Migration

    /// Register a scripted migration for an exact version pair.
    pub fn register_migration_script(
        &self,
        id: &str,
        from: Version,
        to: Version,
        migrator: Arc<dyn DataMigrator>,
    ) {
        self.migrations.write().add_script(id, from, to, migrator);
    }

    /// Register a callback migration for an exact version pair.
    pub fn register_migration_callback<F>(&self, id: &str, from: Version, to: Version, callback: F)
    where
        F: Fn(&MigrationContext) -> Result<()> + Send + Sync + 'static,
    {
        self.migrations.write().add_callback(id, from, to, Arc::new(callback));
    }

    /// Remove the migrators registered for a pair.
    pub fn unregister_migration(&self, id: &str, from: Version, to: Version) -> bool {
        self.migrations.write().remove(id, from, to)
    }

    /// Whether data can be migrated from `from` to `to`.
    pub fn is_migration_available(&self, id: &str, from: &Version, to: &Version) -> bool {
        self.migrations.read().is_available(id, *from, *to)
    }

    /// A context targeting the storage layout's data directory of `to`.
    pub fn migration_context(
        &self,
        id: &str,
        from: Version,
        to: Version,
        strategy: MigrationStrategy,
    ) -> MigrationContext {
        let mut ctx = MigrationContext::new(id, from, to, strategy).with_data_directory(self.data_dir(id, &to));
        let versions = self.versions.read();
        if let Some(old) = versions.find(id, &from) {
            ctx.old_configuration = old.configuration_schema.clone();
        }
        if let Some(new) = versions.find(id, &to) {
            ctx.new_configuration = new.configuration_schema.clone();
        }
        ctx
    }

    /// Run a migration.
    pub fn migrate_plugin_data(&self, ctx: &MigrationContext) -> Result<()> {
        let id = ctx.plugin_id.as_str();
        let (from, to) = (ctx.from_version, ctx.to_version);

        if ctx.create_backup && self.is_version_installed(id, &from) {
            self.create_backup(id, &from)?;
        }

        let restore_status = {
            let mut versions = self.versions.write();
            versions.find_mut(id, &to).and_then(|record| {
                if record.is_active {
                    None
                } else {
                    let old = record.status;
                    record.status = VersionStatus::Migrating;
                    Some(old)
                }
            })
        };

        tracing::info!(plugin_id = id, %from, %to, strategy = ?ctx.strategy, "migration started");
        self.emit(id, &to, VersionStatus::Migrating);

        let result = {
            let registry = self.migrations.read();
            migration::run(ctx, &registry, &self.data_dir(id, &from))
        };

        let final_status = {
            let mut versions = self.versions.write();
            match (versions.find_mut(id, &to), restore_status) {
                (Some(record), Some(old)) => {
                    record.status = old;
                    old
                }
                (Some(record), None) => record.status,
                (None, _) => VersionStatus::NotInstalled,
            }
        };
        if restore_status.is_some() {
            self.persist()?;
        }

        match &result {
            Ok(()) => tracing::info!(plugin_id = id, %from, %to, "migration completed"),
            Err(e) => tracing::error!(plugin_id = id, %from, %to, error = %e, "migration failed"),
        }
        self.emit(id, &to, final_status);
        result
    }

    // Backups and rollback

    /// Snapshot an installed version.
    ///
    /// The backup names `version` as both its current and its target version,
    /// so only a rollback to `version` ever restores it.
    pub fn create_backup(&self, id: &str, version: &Version) -> Result<RollbackInfo> {
        let dir = self
            .versions
            .read()
            .find(id, version)
            .map(|record| record.installation_path.clone())
            .ok_or_else(|| Error::version_not_found(id, version))?;

        let info = backup::create(&self.backups_root(), id, &dir, *version, *version)?;
        self.rollback
            .write()
            .entry(id.to_string())
            .or_default()
            .insert(0, info.clone());
        self.persist()?;

        tracing::info!(plugin_id = id, %version, backup = %info.id, "backup created");
        Ok(info)
    }

    /// Backups of a plugin, newest first.
    pub fn get_rollback_points(&self, id: &str) -> Vec<RollbackInfo> {
        self.rollback.read().get(id).cloned().unwrap_or_default()
    }

    /// Restore `target` from its newest backup and make it active.
    ///
    /// Without a matching backup an installed target is simply activated.
    pub fn rollback_to_version(&self, id: &str, target: &Version, preserve_user_data: bool) -> Result<()> {
        let backup = self
            .rollback
            .read()
            .get(id)
            .and_then(|points| {
                points
                    .iter()
                    .find(|p| p.current_version == *target || p.target_version == *target)
                    .cloned()
            });

        let installed = self.versions.read().find(id, target).map(|r| r.status);
        let Some(previous_status) = installed else {
            return Err(Error::new(
                ErrorCode::RollbackFailed,
                format!("{} {} is not installed and cannot be rolled back to", id, target),
            )
            .with_plugin(id));
        };

        let Some(backup) = backup else {
            tracing::warn!(plugin_id = id, %target, "no backup for rollback target, activating installed files");
            self.versions.write().activate(id, target);
            self.persist()?;
            self.emit(id, target, VersionStatus::Active);
            return Ok(());
        };

        tracing::info!(plugin_id = id, %target, backup = %backup.id, "rollback started");
        {
            let mut versions = self.versions.write();
            if let Some(record) = versions.find_mut(id, target) {
                if !record.is_active {
                    record.status = VersionStatus::RollingBack;
                }
            }
        }
        self.emit(id, target, VersionStatus::RollingBack);

        let dir = self.version_dir(id, target);
        if let Err(e) = backup::restore(&backup, &dir, preserve_user_data) {
            {
                let mut versions = self.versions.write();
                if let Some(record) = versions.find_mut(id, target) {
                    if !record.is_active {
                        record.status = previous_status;
                    }
                }
            }
            tracing::error!(plugin_id = id, %target, error = %e, "rollback failed");
            self.emit(id, target, previous_status);
            return Err(e);
        }

        self.versions.write().activate(id, target);
        self.persist()?;
        tracing::info!(plugin_id = id, %target, "rollback completed");
        self.emit(id, target, VersionStatus::Active);
        Ok(())
    }

    /// Keep the newest `keep_count` backups of a plugin and delete the rest.
    /// Returns the number removed.
    pub fn cleanup_old_backups(&self, id: &str, keep_count: usize) -> Result<usize> {
        let removed: Vec<RollbackInfo> = {
            let mut rollback = self.rollback.write();
            match rollback.get_mut(id) {
                Some(points) if points.len() > keep_count => points.split_off(keep_count),
                _ => Vec::new(),
            }
        };

        for info in &removed {
            if let Err(e) = backup::remove(info) {
                tracing::warn!(plugin_id = id, backup = %info.id, error = %e, "failed to delete backup");
            }
        }
        remove_if_empty(&self.backups_root().join(id));

        if !removed.is_empty() {
            self.persist()?;
        }
        Ok(removed.len())
    }

    // Compatibility

    /// Add a host-range rule for a plugin. Rules are consulted in order.
    pub fn add_compatibility_rule(&self, id: &str, rule: CompatibilityRule) {
        self.compatibility.write().entry(id.to_string()).or_default().push(rule);
    }

    /// Remove every rule for a plugin.
    pub fn clear_compatibility_rules(&self, id: &str) {
        self.compatibility.write().remove(id);
    }

    /// Compatibility of a plugin version with a host version.
    pub fn check_compatibility(&self, id: &str, plugin_version: &Version, host_version: &Version) -> CompatibilityLevel {
        if let Some(rule) = self
            .compatibility
            .read()
            .get(id)
            .and_then(|rules| rules.iter().find(|r| r.matches(host_version)))
        {
            return rule.level;
        }
        CompatibilityLevel::between(plugin_version, host_version)
    }

    /// Installed versions usable with `host_version`, newest first.
    pub fn get_compatible_versions(&self, id: &str, host_version: &Version) -> Vec<Version> {
        let mut compatible: Vec<Version> = self
            .get_installed_versions(id)
            .into_iter()
            .map(|r| r.version)
            .filter(|v| self.check_compatibility(id, v, host_version).is_compatible())
            .collect();
        compatible.sort_by(|a, b| b.cmp(a));
        compatible
    }
}

impl std::fmt::Debug for VersionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let versions = self.versions.read();
        f.debug_struct("VersionManager")
            .field("storage_dir", &self.storage_dir)
            .field("plugins", &versions.installed.len())
            .field("active", &versions.active.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        sources: PathBuf,
        manager: VersionManager,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let sources = dir.path().join("sources");
        fs::create_dir_all(&sources).unwrap();
        let manager = VersionManager::new(dir.path().join("store")).unwrap();
        Fixture {
            _dir: dir,
            sources,
            manager,
        }
    }

    impl Fixture {
        fn source(&self, name: &str, content: &str) -> PathBuf {
            let path = self.sources.join(name);
            fs::write(&path, content).unwrap();
            path
        }

        fn install(&self, id: &str, version: &str) -> PluginVersionInfo {
            let src = self.source(&format!("{}-{}.plug", id, version), version);
            self.manager.install(id, v(version), &src, false).unwrap()
        }
    }

    #[test]
    fn test_install_and_query() {
        let f = fixture();
        let info = f.install("cal", "1.0.0");

        assert_eq!(info.status, VersionStatus::Installed);
        assert!(info.installation_path.join("cal-1.0.0.plug").exists());
        assert!(info.installation_path.join(DATA_DIR).is_dir());
        assert!(f.manager.is_version_installed("cal", &v("1.0.0")));
        assert_eq!(f.manager.get_all_plugins(), vec!["cal"]);
        assert!(f.manager.storage_usage() > 0);
    }

    #[test]
    fn test_install_duplicate() {
        let f = fixture();
        f.install("cal", "1.0.0");
        let src = f.source("again.plug", "again");

        let err = f.manager.install("cal", v("1.0.0"), &src, false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::VersionAlreadyExists);

        f.manager.install("cal", v("1.0.0"), &src, true).unwrap();
        let dir = f.manager.version_dir("cal", &v("1.0.0"));
        assert!(dir.join("again.plug").exists());
        assert!(!dir.join("cal-1.0.0.plug").exists());
        assert_eq!(f.manager.get_installed_versions("cal").len(), 1);
    }

    #[test]
    fn test_install_missing_source() {
        let f = fixture();
        let err = f
            .manager
            .install("cal", v("1.0.0"), &f.sources.join("nope"), false)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileNotFound);
    }

    #[test]
    fn test_install_uninstall_roundtrip() {
        let f = fixture();
        f.install("cal", "1.0.0");
        f.manager.uninstall("cal", &v("1.0.0"), false).unwrap();

        assert!(f.manager.get_installed_versions("cal").is_empty());
        assert!(!f.manager.storage_dir().join("cal").exists());

        let err = f.manager.uninstall("cal", &v("1.0.0"), false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::VersionNotFound);
    }

    #[test]
    fn test_uninstall_active_requires_force() {
        let f = fixture();
        f.install("cal", "1.0.0");
        f.manager.set_active_version("cal", &v("1.0.0"), false).unwrap();

        let err = f.manager.uninstall("cal", &v("1.0.0"), false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ActiveVersionConflict);

        f.manager.uninstall("cal", &v("1.0.0"), true).unwrap();
        assert!(f.manager.get_active_version("cal").is_none());
    }

    #[test]
    fn test_single_active_version() {
        let f = fixture();
        for ver in ["1.0.0", "1.1.0", "1.2.0"] {
            f.install("cal", ver);
        }
        f.manager.set_active_version("cal", &v("1.1.0"), false).unwrap();
        f.manager.set_active_version("cal", &v("1.2.0"), false).unwrap();

        let installed = f.manager.get_installed_versions("cal");
        let active: Vec<_> = installed.iter().filter(|r| r.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].version, v("1.2.0"));
        for record in &installed {
            assert_eq!(record.status == VersionStatus::Active, record.is_active);
        }

        let err = f.manager.set_active_version("cal", &v("9.9.9"), false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::VersionNotFound);
    }

    #[test]
    fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        let src = dir.path().join("p.plug");
        fs::write(&src, b"x").unwrap();

        {
            let manager = VersionManager::new(&store).unwrap();
            manager.install("cal", v("1.0.0"), &src, false).unwrap();
            manager.set_active_version("cal", &v("1.0.0"), false).unwrap();
            manager.create_backup("cal", &v("1.0.0")).unwrap();
        }

        let manager = VersionManager::new(&store).unwrap();
        assert_eq!(manager.get_active_version("cal"), Some(v("1.0.0")));
        assert_eq!(manager.get_rollback_points("cal").len(), 1);
    }

    #[test]
    fn test_activation_migrates_data() {
        let f = fixture();
        f.install("cal", "1.0.0");
        f.install("cal", "1.1.0");
        f.manager.set_active_version("cal", &v("1.0.0"), false).unwrap();
        fs::write(f.manager.data_dir("cal", &v("1.0.0")).join("config.json"), r#"{"a":1}"#).unwrap();

        f.manager.set_active_version("cal", &v("1.1.0"), true).unwrap();

        let text = fs::read_to_string(f.manager.data_dir("cal", &v("1.1.0")).join("config.json")).unwrap();
        let config: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(config["a"], 1);
        assert_eq!(config["migrated_from"], "1.0.0");
        assert_eq!(f.manager.get_active_version("cal"), Some(v("1.1.0")));
    }

    #[test]
    fn test_failed_migration_keeps_active_version() {
        let f = fixture();
        f.install("cal", "1.0.0");
        f.install("cal", "2.0.0");
        f.manager.set_active_version("cal", &v("1.0.0"), false).unwrap();
        f.manager.register_migration_callback("cal", v("1.0.0"), v("2.0.0"), |_| {
            Err(Error::execution_failed("schema mismatch"))
        });

        let err = f.manager.set_active_version("cal", &v("2.0.0"), true).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MigrationFailed);
        assert_eq!(f.manager.get_active_version("cal"), Some(v("1.0.0")));
        assert_eq!(
            f.manager.get_version_info("cal", &v("2.0.0")).unwrap().status,
            VersionStatus::Installed
        );
    }

    #[test]
    fn test_migration_callback_scenario() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        f.manager.register_migration_callback("text", v("1.0.0"), v("2.0.0"), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(f.manager.is_migration_available("text", &v("1.0.0"), &v("2.0.0")));

        let ctx = f
            .manager
            .migration_context("text", v("1.0.0"), v("2.0.0"), MigrationStrategy::Callback);
        f.manager.migrate_plugin_data(&ctx).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        f.manager.unregister_migration("text", v("1.0.0"), v("2.0.0"));
        let err = f.manager.migrate_plugin_data(&ctx).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MigrationFailed);
    }

    #[test]
    fn test_rollback_scenario() {
        let f = fixture();
        for ver in ["1.0.0", "1.1.0", "1.2.0"] {
            f.install("cal", ver);
        }
        f.manager.set_active_version("cal", &v("1.2.0"), false).unwrap();
        assert_eq!(f.manager.get_active_version("cal"), Some(v("1.2.0")));

        f.manager.create_backup("cal", &v("1.2.0")).unwrap();
        f.manager.rollback_to_version("cal", &v("1.1.0"), true).unwrap();

        assert_eq!(f.manager.get_active_version("cal"), Some(v("1.1.0")));
        assert_eq!(f.manager.get_installed_versions("cal").len(), 3);
    }

    #[test]
    fn test_rollback_restores_bytes() {
        let f = fixture();
        f.install("cal", "1.0.0");
        f.manager.set_active_version("cal", &v("1.0.0"), false).unwrap();
        let dir = f.manager.version_dir("cal", &v("1.0.0"));
        fs::write(dir.join(DATA_DIR).join("db"), b"original").unwrap();

        f.manager.create_backup("cal", &v("1.0.0")).unwrap();
        fs::write(dir.join("cal-1.0.0.plug"), b"tampered").unwrap();
        fs::write(dir.join(DATA_DIR).join("db"), b"tampered").unwrap();

        f.manager.rollback_to_version("cal", &v("1.0.0"), false).unwrap();
        assert_eq!(fs::read(dir.join("cal-1.0.0.plug")).unwrap(), b"1.0.0");
        assert_eq!(fs::read(dir.join(DATA_DIR).join("db")).unwrap(), b"original");
    }

    #[test]
    fn test_backup_only_restores_its_own_version() {
        let f = fixture();
        f.install("cal", "1.0.0");
        f.install("cal", "1.1.0");
        f.manager.set_active_version("cal", &v("1.1.0"), false).unwrap();

        let info = f.manager.create_backup("cal", &v("1.0.0")).unwrap();
        assert_eq!(info.current_version, v("1.0.0"));
        assert_eq!(info.target_version, v("1.0.0"));

        f.manager.rollback_to_version("cal", &v("1.1.0"), false).unwrap();

        let dir = f.manager.version_dir("cal", &v("1.1.0"));
        assert_eq!(fs::read(dir.join("cal-1.1.0.plug")).unwrap(), b"1.1.0");
        assert!(!dir.join("cal-1.0.0.plug").exists());
        assert_eq!(f.manager.get_active_version("cal"), Some(v("1.1.0")));
    }

    #[test]
    fn test_rollback_roundtrip_across_versions() {
        let f = fixture();
        f.install("cal", "1.0.0");
        f.install("cal", "1.1.0");
        f.manager.set_active_version("cal", &v("1.0.0"), false).unwrap();
        let dir = f.manager.version_dir("cal", &v("1.0.0"));
        fs::write(dir.join(DATA_DIR).join("db"), b"before").unwrap();

        f.manager.create_backup("cal", &v("1.0.0")).unwrap();
        f.manager.set_active_version("cal", &v("1.1.0"), false).unwrap();
        fs::write(dir.join("cal-1.0.0.plug"), b"patched").unwrap();
        fs::write(dir.join(DATA_DIR).join("db"), b"after").unwrap();
        fs::write(dir.join(DATA_DIR).join("extra"), b"stray").unwrap();

        f.manager.rollback_to_version("cal", &v("1.0.0"), false).unwrap();

        assert_eq!(f.manager.get_active_version("cal"), Some(v("1.0.0")));
        assert!(!f.manager.get_version_info("cal", &v("1.1.0")).unwrap().is_active);
        assert_eq!(fs::read(dir.join("cal-1.0.0.plug")).unwrap(), b"1.0.0");
        assert_eq!(fs::read(dir.join(DATA_DIR).join("db")).unwrap(), b"before");
        assert!(!dir.join(DATA_DIR).join("extra").exists());
    }

    #[test]
    fn test_breaking_activation_without_rule_is_refused() {
        let f = fixture();
        f.install("cal", "1.0.0");
        f.install("cal", "2.0.0");
        f.manager.set_active_version("cal", &v("1.0.0"), false).unwrap();
        fs::write(f.manager.data_dir("cal", &v("1.0.0")).join("config.json"), r#"{"a":1}"#).unwrap();
        assert!(!f.manager.is_migration_available("cal", &v("1.0.0"), &v("2.0.0")));

        let err = f.manager.set_active_version("cal", &v("2.0.0"), true).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MigrationFailed);
        assert_eq!(f.manager.get_active_version("cal"), Some(v("1.0.0")));
        assert!(!f.manager.data_dir("cal", &v("2.0.0")).join("config.json").exists());

        // Without data migration the switch is allowed.
        f.manager.set_active_version("cal", &v("2.0.0"), false).unwrap();
        assert_eq!(f.manager.get_active_version("cal"), Some(v("2.0.0")));
    }

    #[test]
    fn test_rollback_to_unknown_version() {
        let f = fixture();
        f.install("cal", "1.0.0");
        let err = f.manager.rollback_to_version("cal", &v("0.9.0"), true).unwrap_err();
        assert_eq!(err.code(), ErrorCode::RollbackFailed);
    }

    #[test]
    fn test_backup_cleanup() {
        let f = fixture();
        f.install("cal", "1.0.0");
        let first = f.manager.create_backup("cal", &v("1.0.0")).unwrap();
        let second = f.manager.create_backup("cal", &v("1.0.0")).unwrap();
        let third = f.manager.create_backup("cal", &v("1.0.0")).unwrap();

        let points = f.manager.get_rollback_points("cal");
        assert_eq!(points[0].id, third.id);
        assert_eq!(points[2].id, first.id);

        assert_eq!(f.manager.cleanup_old_backups("cal", 1).unwrap(), 2);
        assert_eq!(f.manager.get_rollback_points("cal"), vec![third.clone()]);
        assert!(!second.backup_path.exists());
        assert!(third.backup_path.exists());
    }

    #[test]
    fn test_compatibility_rules() {
        let f = fixture();
        for ver in ["1.0.0", "1.5.0", "2.0.0"] {
            f.install("cal", ver);
        }

        assert_eq!(
            f.manager.check_compatibility("cal", &v("1.0.0"), &v("2.0.0")),
            CompatibilityLevel::Breaking
        );
        assert_eq!(f.manager.get_compatible_versions("cal", &v("1.9.0")), vec![v("1.5.0"), v("1.0.0")]);

        f.manager.add_compatibility_rule(
            "cal",
            CompatibilityRule::new(v("3.0.0"), v("3.9.9"), CompatibilityLevel::Minor),
        );
        assert_eq!(
            f.manager.check_compatibility("cal", &v("1.0.0"), &v("3.1.0")),
            CompatibilityLevel::Minor
        );
        assert_eq!(f.manager.get_compatible_versions("cal", &v("3.1.0")).len(), 3);
    }

    #[test]
    fn test_events_and_panicking_subscriber() {
        let f = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        f.manager.subscribe(|_, _, _| panic!("bad subscriber"));
        let sub = f.manager.subscribe(move |id, ver, status| {
            sink.lock().push((id.to_string(), *ver, status));
        });

        f.install("cal", "1.0.0");
        f.manager.set_active_version("cal", &v("1.0.0"), false).unwrap();

        let events = seen.lock().clone();
        let statuses: Vec<VersionStatus> = events.iter().map(|e| e.2).collect();
        assert_eq!(
            statuses,
            vec![VersionStatus::Installing, VersionStatus::Installed, VersionStatus::Active]
        );

        assert!(f.manager.unsubscribe(sub));
        assert!(!f.manager.unsubscribe(sub));
    }

    #[test]
    fn test_verify_and_cleanup_versions() {
        let f = fixture();
        for ver in ["1.0.0", "1.1.0", "1.2.0"] {
            f.install("cal", ver);
        }
        f.manager.set_active_version("cal", &v("1.2.0"), false).unwrap();
        assert!(f.manager.verify_installation("cal", &v("1.2.0")).unwrap());

        fs::remove_file(f.manager.version_dir("cal", &v("1.2.0")).join("cal-1.2.0.plug")).unwrap();
        assert!(!f.manager.verify_installation("cal", &v("1.2.0")).unwrap());
        assert_eq!(
            f.manager.get_version_info("cal", &v("1.2.0")).unwrap().status,
            VersionStatus::Corrupted
        );
        assert!(f.manager.get_active_version("cal").is_none());

        let removed = f.manager.cleanup_old_versions("cal", 1).unwrap();
        assert_eq!(removed, vec![v("1.1.0"), v("1.0.0")]);

        f.manager.record_usage("cal", &v("1.2.0")).unwrap();
        assert_eq!(f.manager.get_version_info("cal", &v("1.2.0")).unwrap().usage_count, 1);
    }
}
