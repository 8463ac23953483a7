//! Manager configuration and per-call load options.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, ErrorCode, Result};
use crate::registry::RegistryConfig;
use crate::watcher::WatchConfig;

/// Configuration for the plugin manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Registry configuration.
    pub registry: RegistryConfig,
    /// Directories scanned by `discover_all`.
    pub search_paths: Vec<PathBuf>,
    /// Descend into subdirectories while discovering.
    pub recursive_discovery: bool,
    /// Errors retained per plugin.
    pub max_error_log: usize,
    /// Time between background health checks.
    pub health_check_interval: Duration,
    /// Reload plugins that keep failing health checks.
    pub auto_restart: bool,
    /// Consecutive failed checks before a restart.
    pub failure_threshold: u32,
    /// Metrics sampling interval.
    pub metrics_interval: Duration,
    /// Metrics samples retained per plugin.
    pub metrics_history: usize,
    /// Storage root of the version manager, if versioning is used.
    pub version_storage_dir: Option<PathBuf>,
    /// Start metrics sampling and health checks when the manager is built.
    pub start_monitoring: bool,
    /// Hot-reload watcher configuration.
    pub watch: WatchConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            search_paths: Vec::new(),
            recursive_discovery: true,
            max_error_log: 100,
            health_check_interval: Duration::from_secs(30),
            auto_restart: false,
            failure_threshold: 3,
            metrics_interval: Duration::from_secs(1),
            metrics_history: 100,
            version_storage_dir: None,
            start_monitoring: false,
            watch: WatchConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Create a new manager configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the registry configuration.
    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    /// Add a discovery directory.
    pub fn with_search_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_paths.push(dir.into());
        self
    }

    /// Set recursive discovery.
    pub fn with_recursive_discovery(mut self, recursive: bool) -> Self {
        self.recursive_discovery = recursive;
        self
    }

    /// Set the per-plugin error log size.
    pub fn with_max_error_log(mut self, max: usize) -> Self {
        self.max_error_log = max;
        self
    }

    /// Set the health check interval.
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Enable or disable automatic restarts.
    pub fn with_auto_restart(mut self, enabled: bool) -> Self {
        self.auto_restart = enabled;
        self
    }

    /// Set the failure threshold for restarts.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the metrics sampling interval.
    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Set the metrics history size.
    pub fn with_metrics_history(mut self, size: usize) -> Self {
        self.metrics_history = size;
        self
    }

    /// Enable versioning rooted at `dir`.
    pub fn with_version_storage(mut self, dir: impl Into<PathBuf>) -> Self {
        self.version_storage_dir = Some(dir.into());
        self
    }

    /// Start background monitoring on build.
    pub fn with_monitoring(mut self, enabled: bool) -> Self {
        self.start_monitoring = enabled;
        self
    }

    /// Set the watcher configuration.
    pub fn with_watch(mut self, watch: WatchConfig) -> Self {
        self.watch = watch;
        self
    }

    /// Reject values the manager cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::new(ErrorCode::InvalidConfiguration, msg));

        if self.metrics_interval < Duration::from_millis(1) {
            return invalid("metrics_interval must be at least 1ms");
        }
        if self.health_check_interval < Duration::from_millis(1) {
            return invalid("health_check_interval must be at least 1ms");
        }
        if self.metrics_history == 0 {
            return invalid("metrics_history must be positive");
        }
        if self.max_error_log == 0 {
            return invalid("max_error_log must be positive");
        }
        if self.failure_threshold == 0 {
            return invalid("failure_threshold must be positive");
        }
        if self.registry.max_plugins == 0 {
            return invalid("max_plugins must be positive");
        }
        Ok(())
    }

    /// Parse from TOML. Durations are given in milliseconds.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(s)?;
        let config = file.into_config();
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    search_paths: Vec<PathBuf>,
    recursive_discovery: bool,
    max_plugins: usize,
    max_error_log: usize,
    health_check_interval_ms: u64,
    auto_restart: bool,
    failure_threshold: u32,
    metrics_interval_ms: u64,
    metrics_history: usize,
    version_storage_dir: Option<PathBuf>,
    start_monitoring: bool,
    watch: WatchFile,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct WatchFile {
    debounce_ms: u64,
    recursive: bool,
    extensions: Vec<String>,
    auto_reload: bool,
}

impl Default for ConfigFile {
    fn default() -> Self {
        let d = ManagerConfig::default();
        Self {
            search_paths: d.search_paths,
            recursive_discovery: d.recursive_discovery,
            max_plugins: d.registry.max_plugins,
            max_error_log: d.max_error_log,
            health_check_interval_ms: d.health_check_interval.as_millis() as u64,
            auto_restart: d.auto_restart,
            failure_threshold: d.failure_threshold,
            metrics_interval_ms: d.metrics_interval.as_millis() as u64,
            metrics_history: d.metrics_history,
            version_storage_dir: d.version_storage_dir,
            start_monitoring: d.start_monitoring,
            watch: WatchFile::default(),
        }
    }
}

impl Default for WatchFile {
    fn default() -> Self {
        let d = WatchConfig::default();
        Self {
            debounce_ms: d.debounce.as_millis() as u64,
            recursive: d.recursive,
            extensions: d.extensions,
            auto_reload: d.auto_reload,
        }
    }
}

impl ConfigFile {
    fn into_config(self) -> ManagerConfig {
        ManagerConfig {
            registry: RegistryConfig::new().with_max_plugins(self.max_plugins),
            search_paths: self.search_paths,
            recursive_discovery: self.recursive_discovery,
            max_error_log: self.max_error_log,
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            auto_restart: self.auto_restart,
            failure_threshold: self.failure_threshold,
            metrics_interval: Duration::from_millis(self.metrics_interval_ms),
            metrics_history: self.metrics_history,
            version_storage_dir: self.version_storage_dir,
            start_monitoring: self.start_monitoring,
            watch: WatchConfig::new()
                .with_debounce(Duration::from_millis(self.watch.debounce_ms))
                .with_recursive(self.watch.recursive)
                .with_extensions(self.watch.extensions)
                .with_auto_reload(self.watch.auto_reload),
        }
    }
}

/// Options for one `load_plugin` call.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    /// Hash the file before loading.
    pub validate_sha256: bool,
    /// Hash the file must match.
    pub expected_sha256: Option<String>,
    /// Require every declared dependency to be registered.
    pub check_dependencies: bool,
    /// Call `initialize` before returning.
    pub initialize_immediately: bool,
    /// Reload when the file changes.
    pub enable_hot_reload: bool,
    /// Upper bound on the loader and `initialize` calls together.
    pub timeout: Option<Duration>,
    /// Passed to `configure` when not empty.
    pub configuration: Value,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            validate_sha256: false,
            expected_sha256: None,
            check_dependencies: true,
            initialize_immediately: true,
            enable_hot_reload: false,
            timeout: None,
            configuration: Value::Object(Map::new()),
        }
    }
}

impl LoadOptions {
    /// Create default load options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the file to hash to `expected`.
    pub fn with_sha256(mut self, expected: impl Into<String>) -> Self {
        self.validate_sha256 = true;
        self.expected_sha256 = Some(expected.into());
        self
    }

    /// Enable or disable the dependency check.
    pub fn with_dependency_check(mut self, check: bool) -> Self {
        self.check_dependencies = check;
        self
    }

    /// Enable or disable immediate initialization.
    pub fn with_initialize(mut self, initialize: bool) -> Self {
        self.initialize_immediately = initialize;
        self
    }

    /// Enable or disable hot reload.
    pub fn with_hot_reload(mut self, enabled: bool) -> Self {
        self.enable_hot_reload = enabled;
        self
    }

    /// Bound the load with a timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Configuration applied before initialization.
    pub fn with_configuration(mut self, configuration: Value) -> Self {
        self.configuration = configuration;
        self
    }

    /// Whether a configuration was supplied.
    pub fn has_configuration(&self) -> bool {
        match &self.configuration {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_builder() {
        let config = ManagerConfig::new()
            .with_search_path("/plugins")
            .with_auto_restart(true)
            .with_metrics_interval(Duration::from_millis(50));

        assert_eq!(config.search_paths.len(), 1);
        assert!(config.auto_restart);
        assert_eq!(config.max_error_log, 100);
        assert_eq!(config.failure_threshold, 3);
        config.validate().unwrap();
    }

    #[test]
    fn test_config_validation() {
        let config = ManagerConfig::new().with_metrics_interval(Duration::ZERO);
        assert_eq!(config.validate().unwrap_err().code(), ErrorCode::InvalidConfiguration);

        let config = ManagerConfig::new().with_failure_threshold(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let config = ManagerConfig::from_toml_str(
            r#"
            search_paths = ["plugins", "extra"]
            recursive_discovery = false
            metrics_interval_ms = 250
            auto_restart = true
            version_storage_dir = "versions"

            [watch]
            debounce_ms = 100
            extensions = ["so"]
            "#,
        )
        .unwrap();

        assert_eq!(config.search_paths, vec![PathBuf::from("plugins"), PathBuf::from("extra")]);
        assert!(!config.recursive_discovery);
        assert_eq!(config.metrics_interval, Duration::from_millis(250));
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.version_storage_dir, Some(PathBuf::from("versions")));
        assert_eq!(config.watch.debounce, Duration::from_millis(100));
        assert!(config.watch.auto_reload);
    }

    #[test]
    fn test_config_rejects_unknown_and_invalid() {
        let err = ManagerConfig::from_toml_str("colour = \"blue\"").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidFormat);

        let err = ManagerConfig::from_toml_str("metrics_interval_ms = 0").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    }

    #[test]
    fn test_load_options() {
        let options = LoadOptions::new();
        assert!(options.check_dependencies);
        assert!(options.initialize_immediately);
        assert!(!options.has_configuration());

        let options = LoadOptions::new()
            .with_sha256("abc")
            .with_timeout(Duration::from_secs(1))
            .with_configuration(json!({ "level": 3 }));
        assert!(options.validate_sha256);
        assert_eq!(options.expected_sha256.as_deref(), Some("abc"));
        assert!(options.has_configuration());
    }
}
