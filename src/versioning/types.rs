//! Records kept by the version manager.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::version::Version;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Installation status of one plugin version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    /// Not on disk.
    NotInstalled,
    /// Files are being copied.
    Installing,
    /// On disk, not active.
    Installed,
    /// The version the host uses.
    Active,
    /// Superseded but kept.
    Deprecated,
    /// Failed verification.
    Corrupted,
    /// Receiving migrated data.
    Migrating,
    /// Being restored from a backup.
    RollingBack,
}

impl std::fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotInstalled => "not_installed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Active => "active",
            Self::Deprecated => "deprecated",
            Self::Corrupted => "corrupted",
            Self::Migrating => "migrating",
            Self::RollingBack => "rolling_back",
        };
        f.write_str(name)
    }
}

/// How far apart two versions are. Ordered from least to most disruptive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityLevel {
    /// Build metadata only.
    Build,
    /// Patch-level change.
    Patch,
    /// Minor change.
    Minor,
    /// Major change within the same major line.
    Major,
    /// Incompatible.
    Breaking,
}

impl CompatibilityLevel {
    /// Level implied by semantic versioning.
    pub fn between(a: &Version, b: &Version) -> Self {
        if a.major != b.major {
            Self::Breaking
        } else if a.minor != b.minor {
            Self::Major
        } else if a.patch != b.patch {
            Self::Minor
        } else {
            Self::Patch
        }
    }

    /// Whether two versions at this distance can coexist.
    pub fn is_compatible(&self) -> bool {
        *self != Self::Breaking
    }
}

impl Default for CompatibilityLevel {
    fn default() -> Self {
        Self::Patch
    }
}

/// One installed version of a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginVersionInfo {
    /// Plugin id.
    pub plugin_id: String,
    /// Installed version.
    pub version: Version,
    /// Directory holding the version's files.
    pub installation_path: PathBuf,
    /// Current status.
    pub status: VersionStatus,
    /// Install time, ms since the epoch.
    pub install_time: u64,
    /// Last activation or recorded use, ms since the epoch.
    pub last_used: u64,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Value,
    /// Plugin ids this version depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Name of the migration script shipped with this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_script: Option<String>,
    /// Compatibility relative to the previously installed version.
    #[serde(default)]
    pub compatibility_level: CompatibilityLevel,
    /// Whether this is the active version.
    #[serde(default)]
    pub is_active: bool,
    /// Number of recorded uses.
    #[serde(default)]
    pub usage_count: u64,
    /// JSON schema of the version's configuration.
    #[serde(default)]
    pub configuration_schema: Value,
    /// Fields this crate does not know about, kept for round trips.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PluginVersionInfo {
    pub(crate) fn new(plugin_id: &str, version: Version, installation_path: PathBuf) -> Self {
        let now = now_ms();
        Self {
            plugin_id: plugin_id.to_string(),
            version,
            installation_path,
            status: VersionStatus::Installing,
            install_time: now,
            last_used: now,
            metadata: Value::Object(Map::new()),
            dependencies: Vec::new(),
            migration_script: None,
            compatibility_level: CompatibilityLevel::default(),
            is_active: false,
            usage_count: 0,
            configuration_schema: Value::Object(Map::new()),
            extra: Map::new(),
        }
    }

    /// Mark active or demote to installed, keeping `status` and `is_active`
    /// in agreement.
    pub(crate) fn set_active(&mut self, active: bool) {
        self.is_active = active;
        self.status = if active {
            VersionStatus::Active
        } else {
            VersionStatus::Installed
        };
        if active {
            self.last_used = now_ms();
        }
    }
}

/// A backup that a plugin can be rolled back to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackInfo {
    /// Backup id, also the backup directory name.
    pub id: String,
    /// Plugin id.
    pub plugin_id: String,
    /// Version active when the backup was taken.
    pub current_version: Version,
    /// Version whose files were backed up.
    pub target_version: Version,
    /// Backup directory.
    pub backup_path: PathBuf,
    /// Backup time, ms since the epoch.
    pub backup_time: u64,
    /// Files captured, relative to the backup directory.
    pub affected_files: Vec<PathBuf>,
    /// Whether restoring requires moving data between versions.
    pub data_migration_required: bool,
}

/// Strategy for moving data between versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStrategy {
    /// Nothing to migrate.
    None,
    /// Copy the data directory and stamp configuration files.
    Automatic,
    /// Performed outside this crate.
    Manual,
    /// A registered [`DataMigrator`].
    Script,
    /// A registered [`MigrationCallback`].
    Callback,
}

/// Closure run as a callback migration.
pub type MigrationCallback = Arc<dyn Fn(&MigrationContext) -> Result<()> + Send + Sync>;

/// A scripted migration between two specific versions.
pub trait DataMigrator: Send + Sync {
    /// Apply the migration.
    fn migrate(&self, ctx: &MigrationContext) -> Result<()>;

    /// Short human-readable description.
    fn description(&self) -> String {
        String::from("data migration")
    }
}

/// Everything a migration needs to know.
#[derive(Clone)]
pub struct MigrationContext {
    /// Plugin id.
    pub plugin_id: String,
    /// Version data is migrated from.
    pub from_version: Version,
    /// Version data is migrated to.
    pub to_version: Version,
    /// Strategy to apply.
    pub strategy: MigrationStrategy,
    /// Destination data directory.
    pub data_directory: PathBuf,
    /// Configuration of the old version.
    pub old_configuration: Value,
    /// Configuration of the new version.
    pub new_configuration: Value,
    /// Callback used instead of a registered one.
    pub custom_migrator: Option<MigrationCallback>,
    /// Keep existing user data in place.
    pub preserve_user_data: bool,
    /// Take a backup of the source version first.
    pub create_backup: bool,
}

impl MigrationContext {
    /// Create a context with empty configurations.
    pub fn new(plugin_id: &str, from: Version, to: Version, strategy: MigrationStrategy) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            from_version: from,
            to_version: to,
            strategy,
            data_directory: PathBuf::new(),
            old_configuration: Value::Object(Map::new()),
            new_configuration: Value::Object(Map::new()),
            custom_migrator: None,
            preserve_user_data: true,
            create_backup: false,
        }
    }

    /// Set the destination data directory.
    pub fn with_data_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_directory = dir.into();
        self
    }

    /// Use `migrator` instead of a registered callback.
    pub fn with_custom_migrator<F>(mut self, migrator: F) -> Self
    where
        F: Fn(&MigrationContext) -> Result<()> + Send + Sync + 'static,
    {
        self.custom_migrator = Some(Arc::new(migrator));
        self
    }

    /// Take a backup of the source version first.
    pub fn with_backup(mut self, create_backup: bool) -> Self {
        self.create_backup = create_backup;
        self
    }
}

impl std::fmt::Debug for MigrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationContext")
            .field("plugin_id", &self.plugin_id)
            .field("from_version", &self.from_version)
            .field("to_version", &self.to_version)
            .field("strategy", &self.strategy)
            .field("data_directory", &self.data_directory)
            .field("has_custom_migrator", &self.custom_migrator.is_some())
            .field("preserve_user_data", &self.preserve_user_data)
            .field("create_backup", &self.create_backup)
            .finish()
    }
}

/// A host-version range and the level it implies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityRule {
    /// Lowest host version covered, inclusive.
    pub min_host: Version,
    /// Highest host version covered, inclusive.
    pub max_host: Version,
    /// Level reported inside the range.
    pub level: CompatibilityLevel,
}

impl CompatibilityRule {
    /// Create a rule.
    pub fn new(min_host: Version, max_host: Version, level: CompatibilityLevel) -> Self {
        Self {
            min_host,
            max_host,
            level,
        }
    }

    /// Whether `host` falls inside the range.
    pub fn matches(&self, host: &Version) -> bool {
        *host >= self.min_host && *host <= self.max_host
    }
}
