//! # plugin-host-runtime
//!
//! In-process plugin host: load plugins from files, drive them through a
//! checked lifecycle, order them by their dependencies and keep several
//! installed versions of each around.
//!
//! This crate provides:
//! - **Plugin Manager** - One façade for load, unload, reload, commands and queries
//! - **Lifecycle** - A validated state machine with events and pre/post hooks
//! - **Dependencies** - Load ordering, cycle detection and safe-unload checks
//! - **Transactions** - Batches of loads and unloads that roll back as a unit
//! - **Hot Reload** - Reload plugins when their files change, keeping state
//! - **Versioning** - Multi-version installs with data migration and rollback
//! - **Monitoring** - Periodic metrics sampling and health checks
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use plugin_host_runtime::{LoadOptions, ManagerConfig, PluginManager};
//!
//! let manager = PluginManager::new(ManagerConfig::default().with_search_path("plugins"))?;
//!
//! for (path, result) in manager.load_all_plugins(LoadOptions::default()) {
//!     println!("{}: {:?}", path.display(), result);
//! }
//!
//! let reply = manager.execute_command("greeter", "hello", &serde_json::json!({}))?;
//! ```
//!
//! ## Feature Flags
//!
//! - `watch` (default): Enable filesystem watching for hot reload
//! - `metrics-prometheus`: Prometheus metrics integration

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod config;
mod dependency;
mod error;
mod health;
mod integrity;
mod lifecycle;
mod loader;
mod manager;
mod metrics;
mod plugin;
mod registry;
mod transaction;
mod version;
mod watcher;

pub mod versioning;

#[cfg(feature = "metrics-prometheus")]
mod telemetry;

#[cfg(test)]
mod testing;

pub use config::{LoadOptions, ManagerConfig};
pub use dependency::{CircularDependency, CycleResolution, DependencyNode, DependencyResolver};
pub use error::{Error, ErrorCode, Result};
pub use health::{HealthConfig, HealthMonitor, HealthStatus};
pub use integrity::{sha256_bytes, sha256_file, verify_sha256, PluginValidator};
pub use lifecycle::{
    EventBus, HookContext, HookId, HookStage, LifecycleHooks, PluginEvent, PluginState,
    SubscriptionId,
};
pub use loader::{
    DylibLoader, FactoryLoader, LoaderCacheStats, LoaderConfig, PluginFactory, PluginLoader,
};
pub use manager::{PluginManager, PluginManagerBuilder};
pub use metrics::{MetricsCollector, MetricsConfig, MetricsSample, SystemMetrics};
pub use plugin::{
    commands, Plugin, PluginAbiVersion, PluginCapability, PluginCreate, PluginHandle,
    PluginMetadata, PLUGIN_ABI_VERSION,
};
pub use registry::{PluginInfo, PluginRegistry, RegistryConfig, RegistryEvent, RegistryStats};
pub use transaction::{StepReport, StepStatus, Transaction, TransactionOutcome, TransactionStep};
pub use version::Version;
pub use versioning::{InstallRequest, VersionManager, VersionStatus};
pub use watcher::{HotReloadWatcher, ReloadCallback, WatchConfig, WatchEvent};

#[cfg(feature = "metrics-prometheus")]
pub use telemetry::{PrometheusMetrics, TelemetryConfig};

/// Crate version for compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
