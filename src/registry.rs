//! Plugin registry: the authoritative store of plugin records.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::lifecycle::{PluginState, SubscriptionId};
use crate::plugin::{PluginCapability, PluginHandle, PluginMetadata};

/// A registered plugin.
#[derive(Clone)]
pub struct PluginInfo {
    /// Unique plugin id.
    pub id: String,
    /// File the plugin was loaded from.
    pub file_path: PathBuf,
    /// Metadata reported at load time.
    pub metadata: PluginMetadata,
    /// Current lifecycle state.
    pub state: PluginState,
    /// When the plugin was loaded.
    pub load_time: Instant,
    /// Last command, configuration or lifecycle activity.
    pub last_activity: Instant,
    /// Live instance; present iff `state.holds_instance()`.
    pub instance: Option<PluginHandle>,
    /// Last applied configuration.
    pub configuration: Value,
    /// Recent error messages, oldest first.
    pub error_log: VecDeque<String>,
    /// Latest metrics sample.
    pub metrics: Value,
    /// Whether file changes trigger a reload.
    pub hot_reload_enabled: bool,
}

impl PluginInfo {
    /// Create a record for a freshly loaded instance.
    pub fn new(file_path: impl Into<PathBuf>, instance: PluginHandle) -> Self {
        let now = Instant::now();
        Self {
            id: instance.id(),
            file_path: file_path.into(),
            metadata: instance.metadata(),
            state: PluginState::Loaded,
            load_time: now,
            last_activity: now,
            instance: Some(instance),
            configuration: Value::Object(Default::default()),
            error_log: VecDeque::new(),
            metrics: Value::Null,
            hot_reload_enabled: false,
        }
    }

    /// Append an error, dropping the oldest entries beyond `max`.
    pub fn push_error(&mut self, message: impl Into<String>, max: usize) {
        self.error_log.push_back(message.into());
        while self.error_log.len() > max.max(1) {
            self.error_log.pop_front();
        }
    }

    /// Number of retained errors.
    pub fn error_count(&self) -> usize {
        self.error_log.len()
    }

    /// Time since the plugin was loaded.
    pub fn uptime(&self) -> std::time::Duration {
        self.load_time.elapsed()
    }

    /// Verify that instance presence matches the state.
    pub fn check_consistency(&self) -> Result<()> {
        if self.state.holds_instance() != self.instance.is_some() {
            return Err(Error::state_error(format!(
                "plugin {} is {} but instance is {}",
                self.id,
                self.state,
                if self.instance.is_some() { "present" } else { "absent" }
            ))
            .with_plugin(&self.id));
        }
        Ok(())
    }
}

impl std::fmt::Debug for PluginInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInfo")
            .field("id", &self.id)
            .field("file_path", &self.file_path)
            .field("version", &self.metadata.version)
            .field("state", &self.state)
            .field("has_instance", &self.instance.is_some())
            .field("errors", &self.error_log.len())
            .field("hot_reload_enabled", &self.hot_reload_enabled)
            .finish()
    }
}

/// Configuration for the plugin registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    /// Maximum number of plugins allowed.
    pub max_plugins: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { max_plugins: 1024 }
    }
}

impl RegistryConfig {
    /// Create a new registry configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of plugins.
    pub fn with_max_plugins(mut self, max: usize) -> Self {
        self.max_plugins = max;
        self
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Total plugins registered.
    pub total: usize,
    /// Plugins currently running.
    pub running: usize,
    /// Plugins loaded but not initialized.
    pub loaded: usize,
    /// Plugins paused.
    pub paused: usize,
    /// Plugins stopped.
    pub stopped: usize,
    /// Plugins in error state.
    pub error: usize,
}

/// Change notification emitted after a registry write completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A record was added.
    Registered(String),
    /// A record was removed.
    Unregistered(String),
    /// A record's mutable fields changed.
    InfoUpdated(String),
}

type RegistryHandler = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

#[derive(Clone, Default)]
struct Records {
    entries: HashMap<String, PluginInfo>,
    order: Vec<String>,
    by_path: HashMap<PathBuf, String>,
}

impl Records {
    fn remove(&mut self, id: &str) -> Option<PluginInfo> {
        let info = self.entries.remove(id)?;
        self.order.retain(|o| o != id);
        self.by_path.remove(&info.file_path);
        Some(info)
    }
}

/// Thread-safe store of [`PluginInfo`] records keyed by plugin id.
///
/// Reads take a shared lock, writes an exclusive one for their whole
/// duration. Iteration follows registration order.
pub struct PluginRegistry {
    config: RegistryConfig,
    records: RwLock<Records>,
    subscribers: RwLock<Vec<(SubscriptionId, RegistryHandler)>>,
}

impl PluginRegistry {
    /// Create a new plugin registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            records: RwLock::new(Records::default()),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Create with default configuration.
    pub fn default_config() -> Self {
        Self::new(RegistryConfig::default())
    }

    /// Get the registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Subscribe to registry events.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        self.subscribers.write().push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    fn notify(&self, event: RegistryEvent) {
        let handlers: Vec<RegistryHandler> =
            self.subscribers.read().iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::error!(?event, "registry subscriber panicked");
            }
        }
    }

    /// Add a record. Fails with `LoadFailed` if the id exists.
    pub fn register(&self, id: &str, mut info: PluginInfo) -> Result<()> {
        info.id = id.to_string();
        if let Err(e) = info.check_consistency() {
            tracing::error!(plugin_id = id, error = %e, "refusing inconsistent plugin record");
            return Err(e);
        }

        {
            let mut records = self.records.write();
            if records.entries.contains_key(id) {
                return Err(Error::load_failed(format!("plugin {} is already registered", id))
                    .with_plugin(id));
            }
            if records.entries.len() >= self.config.max_plugins {
                return Err(Error::load_failed(format!(
                    "registry full: max {} plugins",
                    self.config.max_plugins
                ))
                .with_plugin(id));
            }

            records.by_path.insert(info.file_path.clone(), id.to_string());
            records.order.push(id.to_string());
            records.entries.insert(id.to_string(), info);
        }

        tracing::debug!(plugin_id = id, "plugin registered");
        self.notify(RegistryEvent::Registered(id.to_string()));
        Ok(())
    }

    /// Remove a record and hand it back, instance included.
    pub fn unregister(&self, id: &str) -> Result<PluginInfo> {
        let info = self
            .records
            .write()
            .remove(id)
            .ok_or_else(|| Error::plugin_not_found(id))?;

        tracing::debug!(plugin_id = id, "plugin unregistered");
        self.notify(RegistryEvent::Unregistered(id.to_string()));
        Ok(info)
    }

    /// Get the live instance for a plugin.
    pub fn get(&self, id: &str) -> Option<PluginHandle> {
        self.records
            .read()
            .entries
            .get(id)
            .and_then(|info| info.instance.clone())
    }

    /// Get a snapshot of a plugin's record.
    pub fn get_info(&self, id: &str) -> Option<PluginInfo> {
        self.records.read().entries.get(id).cloned()
    }

    /// All ids in registration order.
    pub fn get_all_ids(&self) -> Vec<String> {
        self.records.read().order.clone()
    }

    /// Snapshots of every record in registration order.
    pub fn get_all_info(&self) -> Vec<PluginInfo> {
        let records = self.records.read();
        records
            .order
            .iter()
            .filter_map(|id| records.entries.get(id).cloned())
            .collect()
    }

    /// Check if a plugin is registered.
    pub fn is_registered(&self, id: &str) -> bool {
        self.records.read().entries.contains_key(id)
    }

    /// Number of registered plugins.
    pub fn count(&self) -> usize {
        self.records.read().entries.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Replace the mutable fields of a record, keeping its instance.
    ///
    /// Fails with `LoadFailed` for unknown ids and `StateError` if the new
    /// state disagrees with the presence of the owned instance.
    pub fn update_info(&self, id: &str, info: PluginInfo) -> Result<()> {
        {
            let mut records = self.records.write();
            let existing = records.entries.get_mut(id).ok_or_else(|| {
                Error::load_failed(format!("cannot update unknown plugin {}", id)).with_plugin(id)
            })?;

            if info.state.holds_instance() != existing.instance.is_some() {
                return Err(Error::state_error(format!(
                    "state {} does not match instance ownership of {}",
                    info.state, id
                ))
                .with_plugin(id));
            }

            existing.metadata = info.metadata;
            existing.state = info.state;
            existing.load_time = info.load_time;
            existing.last_activity = info.last_activity;
            existing.configuration = info.configuration;
            existing.error_log = info.error_log;
            existing.metrics = info.metrics;
            existing.hot_reload_enabled = info.hot_reload_enabled;
        }

        self.notify(RegistryEvent::InfoUpdated(id.to_string()));
        Ok(())
    }

    /// Remove every record. Returns the removed records.
    pub fn clear(&self) -> Vec<PluginInfo> {
        let removed: Vec<PluginInfo> = {
            let mut records = self.records.write();
            let order = std::mem::take(&mut records.order);
            records.by_path.clear();
            order
                .iter()
                .filter_map(|id| records.entries.remove(id))
                .collect()
        };

        for info in &removed {
            self.notify(RegistryEvent::Unregistered(info.id.clone()));
        }
        removed
    }

    /// Move a plugin to a new state.
    ///
    /// Returns the previous state, plus the released instance when the new
    /// state does not own one.
    pub fn set_state(
        &self,
        id: &str,
        to: PluginState,
    ) -> Result<(PluginState, Option<PluginHandle>)> {
        let outcome = {
            let mut records = self.records.write();
            let info = records
                .entries
                .get_mut(id)
                .ok_or_else(|| Error::plugin_not_found(id))?;

            info.state
                .check_transition(to)
                .map_err(|e| e.with_plugin(id))?;

            if to.holds_instance() && info.instance.is_none() {
                return Err(Error::state_error(format!(
                    "{} has no instance to enter {}",
                    id, to
                ))
                .with_plugin(id));
            }

            let old = info.state;
            info.state = to;
            info.last_activity = Instant::now();
            let released = if to.holds_instance() {
                None
            } else {
                info.instance.take()
            };
            (old, released)
        };

        self.notify(RegistryEvent::InfoUpdated(id.to_string()));
        Ok(outcome)
    }

    /// Swap the live instance of a plugin that owns one.
    pub fn replace_instance(&self, id: &str, instance: PluginHandle) -> Result<PluginHandle> {
        let old = {
            let mut records = self.records.write();
            let info = records
                .entries
                .get_mut(id)
                .ok_or_else(|| Error::plugin_not_found(id))?;

            let old = info.instance.take().ok_or_else(|| {
                Error::state_error(format!("{} has no instance to replace", id)).with_plugin(id)
            })?;
            info.metadata = instance.metadata();
            info.instance = Some(instance);
            old
        };

        self.notify(RegistryEvent::InfoUpdated(id.to_string()));
        Ok(old)
    }

    fn modify<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut PluginInfo),
    {
        {
            let mut records = self.records.write();
            let info = records
                .entries
                .get_mut(id)
                .ok_or_else(|| Error::plugin_not_found(id))?;
            f(info);
        }
        self.notify(RegistryEvent::InfoUpdated(id.to_string()));
        Ok(())
    }

    /// Append to a plugin's bounded error log.
    pub fn record_error(&self, id: &str, message: &str, max_entries: usize) -> Result<()> {
        self.modify(id, |info| info.push_error(message, max_entries))
    }

    /// Refresh `last_activity`.
    pub fn touch(&self, id: &str) -> Result<()> {
        self.modify(id, |info| info.last_activity = Instant::now())
    }

    /// Store the latest metrics sample.
    pub fn set_metrics(&self, id: &str, metrics: Value) -> Result<()> {
        self.modify(id, |info| info.metrics = metrics)
    }

    /// Store the applied configuration.
    pub fn set_configuration(&self, id: &str, configuration: Value) -> Result<()> {
        self.modify(id, |info| {
            info.configuration = configuration;
            info.last_activity = Instant::now();
        })
    }

    /// Toggle hot reload for a plugin.
    pub fn set_hot_reload(&self, id: &str, enabled: bool) -> Result<()> {
        self.modify(id, |info| info.hot_reload_enabled = enabled)
    }

    /// Restore timestamps captured before a reload.
    pub fn restore_timestamps(&self, id: &str, load_time: Instant) -> Result<()> {
        self.modify(id, |info| info.load_time = load_time)
    }

    /// Id registered for a file path.
    pub fn id_for_path(&self, path: &Path) -> Option<String> {
        self.records.read().by_path.get(path).cloned()
    }

    /// Ids of plugins advertising every flag in `caps`.
    pub fn ids_with_capability(&self, caps: PluginCapability) -> Vec<String> {
        self.get_all_info()
            .into_iter()
            .filter(|info| info.metadata.capabilities.contains(caps))
            .map(|info| info.id)
            .collect()
    }

    /// Ids of plugins in a state.
    pub fn ids_in_state(&self, state: PluginState) -> Vec<String> {
        self.get_all_info()
            .into_iter()
            .filter(|info| info.state == state)
            .map(|info| info.id)
            .collect()
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        let records = self.records.read();
        let mut stats = RegistryStats {
            total: records.entries.len(),
            ..Default::default()
        };

        for info in records.entries.values() {
            match info.state {
                PluginState::Running => stats.running += 1,
                PluginState::Loaded => stats.loaded += 1,
                PluginState::Paused => stats.paused += 1,
                PluginState::Stopped => stats.stopped += 1,
                PluginState::Error => stats.error += 1,
                _ => {}
            }
        }

        stats
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::default_config()
    }
}

impl Clone for PluginRegistry {
    /// Copies every record; instances are shared, not duplicated, and
    /// subscribers are not carried over.
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            records: RwLock::new(self.records.read().clone()),
            subscribers: RwLock::new(Vec::new()),
        }
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("config", &self.config)
            .field("plugin_count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::testing::MockPlugin;

    fn create_test_info(name: &str) -> PluginInfo {
        PluginInfo::new(
            format!("/plugins/{}.plug", name),
            MockPlugin::new(name).into_handle(),
        )
    }

    #[test]
    fn test_registry_creation() {
        let registry = PluginRegistry::default_config();
        assert!(registry.is_empty());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_register_plugin() {
        let registry = PluginRegistry::default_config();
        registry.register("test-plugin", create_test_info("test-plugin")).unwrap();

        assert!(registry.is_registered("test-plugin"));
        assert_eq!(registry.count(), 1);
        assert!(registry.get("test-plugin").is_some());
        assert_eq!(
            registry.id_for_path(Path::new("/plugins/test-plugin.plug")).as_deref(),
            Some("test-plugin")
        );
    }

    #[test]
    fn test_register_duplicate() {
        let registry = PluginRegistry::default_config();
        registry.register("dup", create_test_info("dup")).unwrap();

        let err = registry.register("dup", create_test_info("dup")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::LoadFailed);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_register_rejects_inconsistent_record() {
        let registry = PluginRegistry::default_config();
        let mut info = create_test_info("broken");
        info.state = PluginState::Stopped;

        let err = registry.register("broken", info).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StateError);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_plugin() {
        let registry = PluginRegistry::default_config();
        registry.register("test-plugin", create_test_info("test-plugin")).unwrap();

        let info = registry.unregister("test-plugin").unwrap();
        assert!(info.instance.is_some());
        assert!(!registry.is_registered("test-plugin"));
        assert!(registry.id_for_path(&info.file_path).is_none());

        let err = registry.unregister("test-plugin").unwrap_err();
        assert_eq!(err.code(), ErrorCode::PluginNotFound);
    }

    #[test]
    fn test_registration_order() {
        let registry = PluginRegistry::default_config();
        for name in ["c", "a", "b"] {
            registry.register(name, create_test_info(name)).unwrap();
        }
        assert_eq!(registry.get_all_ids(), vec!["c", "a", "b"]);

        registry.unregister("a").unwrap();
        let ids: Vec<String> = registry.get_all_info().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn test_update_info_keeps_instance() {
        let registry = PluginRegistry::default_config();
        registry.register("p", create_test_info("p")).unwrap();

        let mut info = registry.get_info("p").unwrap();
        info.instance = None;
        info.hot_reload_enabled = true;
        info.push_error("first", 10);
        registry.update_info("p", info).unwrap();

        let stored = registry.get_info("p").unwrap();
        assert!(stored.instance.is_some());
        assert!(stored.hot_reload_enabled);
        assert_eq!(stored.error_count(), 1);

        let err = registry.update_info("ghost", create_test_info("ghost")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::LoadFailed);
    }

    #[test]
    fn test_update_info_rejects_state_without_instance() {
        let registry = PluginRegistry::default_config();
        registry.register("p", create_test_info("p")).unwrap();

        let mut info = registry.get_info("p").unwrap();
        info.state = PluginState::Stopped;
        let err = registry.update_info("p", info).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StateError);
    }

    #[test]
    fn test_set_state_releases_instance() {
        let registry = PluginRegistry::default_config();
        registry.register("p", create_test_info("p")).unwrap();

        let (old, released) = registry.set_state("p", PluginState::Initializing).unwrap();
        assert_eq!(old, PluginState::Loaded);
        assert!(released.is_none());

        registry.set_state("p", PluginState::Running).unwrap();
        registry.set_state("p", PluginState::Stopping).unwrap();
        let (_, released) = registry.set_state("p", PluginState::Stopped).unwrap();
        assert!(released.is_some());

        let info = registry.get_info("p").unwrap();
        assert!(info.instance.is_none());
        info.check_consistency().unwrap();

        let err = registry.set_state("p", PluginState::Running).err().unwrap();
        assert_eq!(err.code(), ErrorCode::StateError);
    }

    #[test]
    fn test_uptime_never_decreases_while_active() {
        let registry = PluginRegistry::default_config();
        registry.register("p", create_test_info("p")).unwrap();
        registry.set_state("p", PluginState::Initializing).unwrap();
        registry.set_state("p", PluginState::Running).unwrap();

        let mut last = registry.get_info("p").unwrap().uptime();
        for next in [PluginState::Paused, PluginState::Running, PluginState::Paused, PluginState::Running] {
            std::thread::sleep(std::time::Duration::from_millis(2));
            registry.set_state("p", next).unwrap();
            registry.record_error("p", "noise", 4).unwrap();
            let mut info = registry.get_info("p").unwrap();
            info.last_activity = Instant::now();
            registry.update_info("p", info).unwrap();

            let uptime = registry.get_info("p").unwrap().uptime();
            assert!(uptime >= last, "{:?} went back from {:?}", uptime, last);
            last = uptime;
        }
    }

    #[test]
    fn test_error_log_is_bounded() {
        let registry = PluginRegistry::default_config();
        registry.register("p", create_test_info("p")).unwrap();
        for i in 0..5 {
            registry.record_error("p", &format!("e{}", i), 3).unwrap();
        }
        let info = registry.get_info("p").unwrap();
        assert_eq!(info.error_log, VecDeque::from(vec!["e2".to_string(), "e3".into(), "e4".into()]));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let registry = PluginRegistry::default_config();
        registry.register("a", create_test_info("a")).unwrap();
        registry.register("b", create_test_info("b")).unwrap();

        assert_eq!(registry.clear().len(), 2);
        assert!(registry.clear().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_events_emitted() {
        let registry = PluginRegistry::default_config();
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = events.clone();
        registry.subscribe(move |e| sink.lock().push(e.clone()));

        registry.register("a", create_test_info("a")).unwrap();
        registry.touch("a").unwrap();
        registry.unregister("a").unwrap();

        assert_eq!(
            *events.lock(),
            vec![
                RegistryEvent::Registered("a".into()),
                RegistryEvent::InfoUpdated("a".into()),
                RegistryEvent::Unregistered("a".into()),
            ]
        );
    }

    #[test]
    fn test_clone_shares_instances() {
        let registry = PluginRegistry::default_config();
        registry.register("a", create_test_info("a")).unwrap();

        let copy = registry.clone();
        registry.unregister("a").unwrap();

        assert!(copy.is_registered("a"));
        assert!(!registry.is_registered("a"));
    }

    #[test]
    fn test_max_plugins() {
        let registry = PluginRegistry::new(RegistryConfig::new().with_max_plugins(2));
        registry.register("p1", create_test_info("p1")).unwrap();
        registry.register("p2", create_test_info("p2")).unwrap();

        let err = registry.register("p3", create_test_info("p3")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::LoadFailed);
    }

    #[test]
    fn test_capability_and_stats_queries() {
        let registry = PluginRegistry::default_config();
        let monitored = MockPlugin::new("m")
            .with_capabilities(PluginCapability::MONITORING)
            .into_handle();
        registry.register("m", PluginInfo::new("/m.plug", monitored)).unwrap();
        registry.register("plain", create_test_info("plain")).unwrap();

        assert_eq!(registry.ids_with_capability(PluginCapability::MONITORING), vec!["m"]);
        assert_eq!(registry.ids_in_state(PluginState::Loaded).len(), 2);

        let stats = registry.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.loaded, 2);
    }
}
