//! The plugin manager: one façade over loading, lifecycle, dependencies,
//! batches, health, metrics, hot reload and versioning.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Condvar, Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::config::{LoadOptions, ManagerConfig};
use crate::dependency::{CircularDependency, CycleResolution, DependencyNode, DependencyResolver};
use crate::error::{Error, ErrorCode, Result};
use crate::health::{HealthConfig, HealthMonitor, HealthStatus};
use crate::integrity::{verify_sha256, PluginValidator};
use crate::lifecycle::{EventBus, HookContext, HookId, HookStage, LifecycleHooks, PluginEvent, PluginState, SubscriptionId};
use crate::loader::{DylibLoader, LoaderConfig, PluginLoader};
use crate::metrics::{MetricsCollector, MetricsConfig};
use crate::plugin::{commands, PluginCapability, PluginHandle};
use crate::registry::{PluginInfo, PluginRegistry};
use crate::transaction::{StepStatus, Transaction};
use crate::versioning::VersionManager;
use crate::watcher::HotReloadWatcher;

#[cfg(feature = "metrics-prometheus")]
use crate::telemetry::PrometheusMetrics;

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Run plugin code, turning a panic into an error with `code`.
fn guarded<T, F>(code: ErrorCode, what: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        tracing::error!(operation = what, "plugin code panicked");
        Err(Error::new(code, format!("{} panicked", what)))
    })
}

struct Slot<T> {
    result: Option<Result<T>>,
    abandoned: bool,
}

/// Run `work` on a helper thread and wait until `deadline`. A result that
/// arrives after the caller gave up is handed to `cleanup`.
fn run_bounded<T, F, C>(deadline: Option<Instant>, code: ErrorCode, what: &str, work: F, cleanup: C) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
    C: FnOnce(T) + Send + 'static,
{
    let Some(deadline) = deadline else {
        return guarded(code, what, work);
    };

    let shared = Arc::new((
        Mutex::new(Slot {
            result: None,
            abandoned: false,
        }),
        Condvar::new(),
    ));
    let worker_shared = shared.clone();
    let label = what.to_string();

    std::thread::Builder::new()
        .name("plugin-load".to_string())
        .spawn(move || {
            let result = guarded(code, &label, work);
            let (lock, cvar) = &*worker_shared;
            let mut slot = lock.lock();
            if slot.abandoned {
                drop(slot);
                if let Ok(value) = result {
                    tracing::debug!(operation = %label, "discarding result that arrived after timeout");
                    cleanup(value);
                }
            } else {
                slot.result = Some(result);
                cvar.notify_one();
            }
        })
        .map_err(|e| Error::new(ErrorCode::SystemError, format!("spawn load worker: {}", e)))?;

    let (lock, cvar) = &*shared;
    let mut slot = lock.lock();
    loop {
        if let Some(result) = slot.result.take() {
            return result;
        }
        if cvar.wait_until(&mut slot, deadline).timed_out() {
            if let Some(result) = slot.result.take() {
                return result;
            }
            slot.abandoned = true;
            return Err(Error::new(ErrorCode::Timeout, format!("{} timed out", what)));
        }
    }
}

/// Builder for [`PluginManager`].
pub struct PluginManagerBuilder {
    config: ManagerConfig,
    loader: Option<Arc<dyn PluginLoader>>,
    registry: Option<Arc<PluginRegistry>>,
    validator: Option<PluginValidator>,
    #[cfg(feature = "metrics-prometheus")]
    telemetry: Option<Arc<PrometheusMetrics>>,
}

impl PluginManagerBuilder {
    /// Start from the default configuration.
    pub fn new() -> Self {
        Self {
            config: ManagerConfig::default(),
            loader: None,
            registry: None,
            validator: None,
            #[cfg(feature = "metrics-prometheus")]
            telemetry: None,
        }
    }

    /// Set the manager configuration.
    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a loader. Defaults to a [`DylibLoader`].
    pub fn with_loader<L: PluginLoader + 'static>(mut self, loader: L) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Use a loader the caller keeps a handle to.
    pub fn with_shared_loader(mut self, loader: Arc<dyn PluginLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Use an existing registry.
    pub fn with_registry(mut self, registry: Arc<PluginRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Run `validator` on every file before it is loaded.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Path) -> Result<()> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Feed Prometheus counters.
    #[cfg(feature = "metrics-prometheus")]
    pub fn with_telemetry(mut self, telemetry: Arc<PrometheusMetrics>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Build the manager.
    pub fn build(self) -> Result<Arc<PluginManager>> {
        let config = self.config;
        config.validate()?;

        let metrics = Arc::new(MetricsCollector::new(
            MetricsConfig::new()
                .with_interval(config.metrics_interval)
                .with_max_history(config.metrics_history),
        )?);

        let versions = match &config.version_storage_dir {
            Some(dir) => Some(VersionManager::new(dir)?),
            None => None,
        };

        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(DylibLoader::new(LoaderConfig::default())));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(PluginRegistry::new(config.registry.clone())));

        let health = HealthMonitor::new(HealthConfig {
            interval: config.health_check_interval,
            auto_restart: config.auto_restart,
            failure_threshold: config.failure_threshold,
        });
        let watcher = HotReloadWatcher::new(config.watch.clone());
        let start_monitoring = config.start_monitoring;

        let manager = Arc::new_cyclic(|this| PluginManager {
            config,
            loader,
            registry,
            resolver: DependencyResolver::new(),
            events: EventBus::new(),
            hooks: LifecycleHooks::new(),
            metrics,
            watcher,
            health,
            versions,
            validator: RwLock::new(self.validator),
            ops: ReentrantMutex::new(()),
            active_transactions: Arc::new(AtomicUsize::new(0)),
            #[cfg(feature = "metrics-prometheus")]
            telemetry: self.telemetry,
            this: this.clone(),
        });

        let weak = Arc::downgrade(&manager);
        manager.watcher.set_reload_callback(move |id| match weak.upgrade() {
            Some(manager) => manager.reload_plugin(id, true),
            None => Err(Error::state_error("plugin manager was dropped")),
        });

        let weak = Arc::downgrade(&manager);
        manager.metrics.set_sink(move |sample| {
            if let Some(manager) = weak.upgrade() {
                manager.events.emit_metrics(&sample.plugin_id, sample.to_json());
            }
        });

        manager.resolver.update_dependency_graph(&manager.registry);

        if start_monitoring {
            manager.start_monitoring()?;
        }

        tracing::info!(loader = manager.loader.name(), "plugin manager ready");
        Ok(manager)
    }
}

impl Default for PluginManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg_attr(not(feature = "metrics-prometheus"), allow(dead_code))]
enum Observation {
    Load(Duration),
    Unload,
    Reload,
    Error,
    Command(Duration),
}

enum Snapshot {
    Cooperative(Value),
    Fallback(Value),
}

/// Front door of the plugin host.
///
/// Mutating operations (load, unload, reload, lifecycle changes) are
/// serialized by one re-entrant lock, so hooks and transactions may call
/// back into the manager from the same thread.
pub struct PluginManager {
    config: ManagerConfig,
    loader: Arc<dyn PluginLoader>,
    registry: Arc<PluginRegistry>,
    resolver: DependencyResolver,
    events: EventBus,
    hooks: LifecycleHooks,
    metrics: Arc<MetricsCollector>,
    watcher: HotReloadWatcher,
    health: HealthMonitor,
    versions: Option<VersionManager>,
    validator: RwLock<Option<PluginValidator>>,
    ops: ReentrantMutex<()>,
    active_transactions: Arc<AtomicUsize>,
    #[cfg(feature = "metrics-prometheus")]
    telemetry: Option<Arc<PrometheusMetrics>>,
    this: Weak<PluginManager>,
}

impl PluginManager {
    /// Create a manager with the default [`DylibLoader`].
    pub fn new(config: ManagerConfig) -> Result<Arc<Self>> {
        PluginManagerBuilder::new().with_config(config).build()
    }

    /// Start building a manager.
    pub fn builder() -> PluginManagerBuilder {
        PluginManagerBuilder::new()
    }

    /// Get the manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Get the plugin loader.
    pub fn loader(&self) -> &Arc<dyn PluginLoader> {
        &self.loader
    }

    /// Get the plugin registry.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Get the dependency resolver.
    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    /// Get the metrics collector.
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Get the hot-reload watcher.
    pub fn watcher(&self) -> &HotReloadWatcher {
        &self.watcher
    }

    /// Get the health monitor.
    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Get the version manager, when versioning is configured.
    pub fn version_manager(&self) -> Option<&VersionManager> {
        self.versions.as_ref()
    }

    /// Get the Prometheus counters, when configured.
    #[cfg(feature = "metrics-prometheus")]
    pub fn telemetry(&self) -> Option<&PrometheusMetrics> {
        self.telemetry.as_deref()
    }

    /// Replace the pre-load validator.
    pub fn set_validator<F>(&self, validator: F)
    where
        F: Fn(&Path) -> Result<()> + Send + Sync + 'static,
    {
        *self.validator.write() = Some(Arc::new(validator));
    }

    /// Remove the pre-load validator.
    pub fn clear_validator(&self) {
        *self.validator.write() = None;
    }

    fn observe(&self, what: Observation) {
        #[cfg(feature = "metrics-prometheus")]
        if let Some(t) = &self.telemetry {
            match what {
                Observation::Load(elapsed) => t.record_load(elapsed.as_secs_f64()),
                Observation::Unload => t.record_unload(),
                Observation::Reload => t.record_reload(),
                Observation::Error => t.record_error(),
                Observation::Command(elapsed) => t.record_command(elapsed.as_secs_f64()),
            }
            t.set_registered(self.registry.count());
        }
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = what;
    }

    // ---- events and hooks -----------------------------------------------

    /// Subscribe to plugin events.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&PluginEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    /// Remove an event subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Register a lifecycle hook.
    pub fn register_hook<F>(&self, stage: HookStage, name: impl Into<String>, hook: F) -> HookId
    where
        F: Fn(&HookContext) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.register(stage, name, hook)
    }

    /// Remove a lifecycle hook.
    pub fn unregister_hook(&self, id: HookId) -> bool {
        self.hooks.unregister(id)
    }

    /// Get the hook registry.
    pub fn hooks(&self) -> &LifecycleHooks {
        &self.hooks
    }

    // ---- discovery ------------------------------------------------------

    /// Files under `dir` the loader accepts, sorted. A missing directory
    /// yields nothing.
    pub fn discover_plugins(&self, dir: &Path, recursive: bool) -> Vec<PathBuf> {
        if !dir.is_dir() {
            tracing::debug!(path = %dir.display(), "discovery skipped: not a directory");
            return Vec::new();
        }

        let mut found: Vec<PathBuf> = WalkDir::new(dir)
            .follow_links(true)
            .max_depth(if recursive { usize::MAX } else { 1 })
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unreadable entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| self.loader.can_load(path))
            .collect();

        found.sort();
        tracing::debug!(path = %dir.display(), count = found.len(), "discovered plugins");
        found
    }

    /// Discover plugins in every configured search path.
    pub fn discover_all(&self) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = self
            .config
            .search_paths
            .iter()
            .flat_map(|dir| self.discover_plugins(dir, self.config.recursive_discovery))
            .collect();
        found.sort();
        found.dedup();
        found
    }

    /// Load everything [`discover_all`](Self::discover_all) finds.
    ///
    /// Files whose dependencies are not loaded yet are retried after the
    /// others, so discovery order does not matter.
    pub fn load_all_plugins(&self, options: LoadOptions) -> Vec<(PathBuf, Result<String>)> {
        let mut pending = self.discover_all();
        let mut results = Vec::new();

        loop {
            let mut deferred = Vec::new();
            let mut progress = false;

            for path in pending {
                match self.load_plugin(&path, options.clone()) {
                    Ok(id) => {
                        progress = true;
                        results.push((path, Ok(id)));
                    }
                    Err(e) if e.code() == ErrorCode::DependencyMissing => deferred.push((path, e)),
                    Err(e) => results.push((path, Err(e))),
                }
            }

            if deferred.is_empty() {
                break;
            }
            if !progress {
                results.extend(deferred.into_iter().map(|(p, e)| (p, Err(e))));
                break;
            }
            pending = deferred.into_iter().map(|(p, _)| p).collect();
        }

        results
    }

    // ---- load -----------------------------------------------------------

    /// Load, configure and (optionally) initialize a plugin. Returns its id.
    pub fn load_plugin(&self, path: impl AsRef<Path>, options: LoadOptions) -> Result<String> {
        let path = normalize(path.as_ref());
        let started = Instant::now();
        let _ops = self.ops.lock();

        match self.load_inner(&path, &options) {
            Ok(id) => {
                let elapsed = started.elapsed();
                self.observe(Observation::Load(elapsed));
                tracing::info!(plugin_id = %id, path = %path.display(), ?elapsed, "plugin loaded");
                Ok(id)
            }
            Err(e) => {
                self.observe(Observation::Error);
                tracing::warn!(path = %path.display(), error = %e, "plugin load failed");
                Err(e)
            }
        }
    }

    /// Load on a background thread.
    pub fn load_plugin_async(
        &self,
        path: impl Into<PathBuf>,
        options: LoadOptions,
    ) -> BoxFuture<'static, Result<String>> {
        let path = path.into();
        let weak = self.this.clone();
        let (tx, rx) = oneshot::channel();

        let spawned = std::thread::Builder::new()
            .name("plugin-async-load".to_string())
            .spawn(move || {
                let result = match weak.upgrade() {
                    Some(manager) => manager.load_plugin(&path, options),
                    None => Err(Error::state_error("plugin manager was dropped")),
                };
                let _ = tx.send(result);
            });

        match spawned {
            Ok(_) => async move {
                rx.await.unwrap_or_else(|_| {
                    Err(Error::new(ErrorCode::SystemError, "load worker exited without a result"))
                })
            }
            .boxed(),
            Err(e) => futures::future::ready(Err(Error::new(
                ErrorCode::SystemError,
                format!("spawn load worker: {}", e),
            )))
            .boxed(),
        }
    }

    fn load_inner(&self, path: &Path, options: &LoadOptions) -> Result<String> {
        if !path.exists() {
            return Err(Error::file_not_found(path.display()));
        }
        if !self.loader.can_load(path) {
            return Err(Error::load_failed(format!(
                "loader {} cannot load {}",
                self.loader.name(),
                path.display()
            )));
        }
        if let Some(existing) = self.registry.id_for_path(path) {
            return Err(Error::new(
                ErrorCode::AlreadyExists,
                format!("{} is already loaded", path.display()),
            )
            .with_plugin(existing));
        }

        let validator = self.validator.read().clone();
        if let Some(validator) = validator {
            guarded(ErrorCode::SecurityViolation, "validator", || (*validator)(path))?;
        }
        if options.validate_sha256 {
            verify_sha256(path, options.expected_sha256.as_deref().unwrap_or_default())?;
        }

        let deadline = options.timeout.map(|t| Instant::now() + t);
        let loader = self.loader.clone();
        let late_loader = self.loader.clone();
        let load_path = path.to_path_buf();
        let instance = run_bounded(
            deadline,
            ErrorCode::LoadFailed,
            "plugin load",
            move || loader.load(&load_path),
            move |plugin: PluginHandle| {
                let id = plugin.id();
                drop(plugin);
                let _ = late_loader.unload(&id);
            },
        )?;

        let id = instance.id();
        if self.registry.is_registered(&id) {
            // The loader keys its bookkeeping by id, which belongs to the
            // registered plugin.
            return Err(Error::load_failed(format!("plugin id {} is already registered", id))
                .with_plugin(id));
        }

        let mut info = PluginInfo::new(path, instance.clone());
        info.hot_reload_enabled = options.enable_hot_reload;

        match self.prepare(&id, path, &mut info, &instance, options, deadline) {
            Ok(()) => {}
            Err(e) => {
                let initialized = info.state == PluginState::Running;
                drop(info);
                self.abandon(&id, instance, initialized);
                return Err(e.with_plugin(&id));
            }
        }

        let running = info.state == PluginState::Running;
        if let Err(e) = self.registry.register(&id, info) {
            self.watcher.unregister_plugin(&id);
            self.abandon(&id, instance, running);
            return Err(e);
        }
        drop(instance);

        self.resolver.update_dependency_graph(&self.registry);
        self.events.emit_loaded(&id);
        Ok(id)
    }

    /// Everything between creating the instance and registering it.
    fn prepare(
        &self,
        id: &str,
        path: &Path,
        info: &mut PluginInfo,
        instance: &PluginHandle,
        options: &LoadOptions,
        deadline: Option<Instant>,
    ) -> Result<()> {
        if options.check_dependencies {
            let missing: Vec<String> = info
                .metadata
                .dependencies
                .iter()
                .filter(|dep| !self.registry.is_registered(dep))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(Error::dependency_missing(format!(
                    "{} requires {}",
                    id,
                    missing.join(", ")
                )));
            }
        }

        if options.has_configuration() {
            guarded(ErrorCode::ConfigurationError, "configure", || {
                instance.configure(&options.configuration)
            })
            .map_err(|e| Error::new(ErrorCode::ConfigurationError, e.message))?;
            info.configuration = options.configuration.clone();
        }

        self.hooks.run(HookStage::PreLoad, id, path)?;

        if options.initialize_immediately {
            info.state.check_transition(PluginState::Initializing)?;
            info.state = PluginState::Initializing;
            self.events
                .emit_state_changed(id, PluginState::Loaded, PluginState::Initializing);

            let plugin = instance.clone();
            let late = instance.clone();
            let outcome = run_bounded(
                deadline,
                ErrorCode::InitializationFailed,
                "plugin initialize",
                move || plugin.initialize(),
                move |()| {
                    let _ = late.shutdown();
                },
            );

            match outcome {
                Ok(()) => {
                    info.state = PluginState::Running;
                    self.events
                        .emit_state_changed(id, PluginState::Initializing, PluginState::Running);
                }
                Err(e) => {
                    info.state = PluginState::Error;
                    self.events
                        .emit_state_changed(id, PluginState::Initializing, PluginState::Error);
                    self.events.emit_error(id, &e.message);
                    tracing::error!(plugin_id = id, error = %e, "plugin failed to initialize");
                    return Err(match e.code() {
                        ErrorCode::Timeout => e,
                        _ => Error::init_failed(e.message),
                    });
                }
            }
        }

        self.hooks.run(HookStage::PostLoad, id, path)?;

        if options.enable_hot_reload {
            self.watcher.register_plugin(id, path)?;
        }
        Ok(())
    }

    /// Tear down an instance that never made it into the registry.
    fn abandon(&self, id: &str, instance: PluginHandle, initialized: bool) {
        if initialized {
            if let Err(e) = guarded(ErrorCode::ExecutionFailed, "shutdown", || instance.shutdown()) {
                tracing::warn!(plugin_id = id, error = %e, "shutdown during load unwind failed");
            }
        }
        self.watcher.unregister_plugin(id);
        drop(instance);
        if let Err(e) = self.loader.unload(id) {
            tracing::debug!(plugin_id = id, error = %e, "loader unload during unwind failed");
        }
    }

    // ---- state machine --------------------------------------------------

    /// Move a registered plugin to `to`, publish the change and release the
    /// instance when the new state does not own one.
    fn transition(&self, id: &str, to: PluginState) -> Result<PluginState> {
        let (old, released) = self.registry.set_state(id, to)?;
        self.events.emit_state_changed(id, old, to);
        tracing::debug!(plugin_id = id, from = %old, to = %to, "plugin state changed");

        if let Some(instance) = released {
            drop(instance);
            if let Err(e) = self.loader.unload(id) {
                tracing::warn!(plugin_id = id, error = %e, "loader failed to release plugin");
            }
        }
        Ok(old)
    }

    fn fail(&self, id: &str, error: &Error) {
        let _ = self
            .registry
            .record_error(id, &error.to_string(), self.config.max_error_log);
        self.events.emit_error(id, &error.message);
        self.observe(Observation::Error);
    }

    /// Call `initialize` on a plugin in `Loaded` state.
    pub fn initialize_plugin(&self, id: &str) -> Result<()> {
        let _ops = self.ops.lock();
        let instance = self.registry.get(id).ok_or_else(|| Error::plugin_not_found(id))?;
        self.transition(id, PluginState::Initializing)?;

        match guarded(ErrorCode::InitializationFailed, "initialize", || instance.initialize()) {
            Ok(()) => {
                self.transition(id, PluginState::Running)?;
                tracing::info!(plugin_id = id, "plugin initialized");
                Ok(())
            }
            Err(e) => {
                drop(instance);
                let e = Error::init_failed(e.message).with_plugin(id);
                self.fail(id, &e);
                self.transition(id, PluginState::Error)?;
                tracing::error!(plugin_id = id, error = %e, "plugin failed to initialize");
                Err(e)
            }
        }
    }

    /// Suspend a running plugin.
    pub fn pause_plugin(&self, id: &str) -> Result<()> {
        let _ops = self.ops.lock();
        self.transition(id, PluginState::Paused).map(|_| ())
    }

    /// Resume a paused plugin.
    pub fn resume_plugin(&self, id: &str) -> Result<()> {
        let _ops = self.ops.lock();
        self.transition(id, PluginState::Running).map(|_| ())
    }

    /// Shut a running or paused plugin down. A failing `shutdown` leaves the
    /// plugin in `Error` and is not reported to the caller.
    pub fn stop_plugin(&self, id: &str) -> Result<()> {
        let _ops = self.ops.lock();
        let instance = self.registry.get(id).ok_or_else(|| Error::plugin_not_found(id))?;
        self.transition(id, PluginState::Stopping)?;

        let outcome = guarded(ErrorCode::ExecutionFailed, "shutdown", || instance.shutdown());
        drop(instance);

        match outcome {
            Ok(()) => {
                self.transition(id, PluginState::Stopped)?;
            }
            Err(e) => {
                tracing::error!(plugin_id = id, error = %e, "plugin shutdown failed");
                self.fail(id, &e);
                self.transition(id, PluginState::Error)?;
            }
        }
        Ok(())
    }

    // ---- unload ---------------------------------------------------------

    /// Shut a plugin down and remove it. Without `force`, a plugin that
    /// others depend on is kept and `DependencyMissing` is returned.
    pub fn unload_plugin(&self, id: &str, force: bool) -> Result<()> {
        let _ops = self.ops.lock();

        let (state, path) = match self.registry.get_info(id) {
            Some(info) => (info.state, info.file_path),
            None => {
                return Err(Error::new(ErrorCode::NotFound, format!("plugin {} is not loaded", id))
                    .with_plugin(id))
            }
        };

        if !force {
            let dependents: Vec<String> = self
                .resolver
                .get_dependents(id)
                .into_iter()
                .filter(|d| self.registry.is_registered(d))
                .collect();
            if !dependents.is_empty() {
                return Err(Error::dependency_missing(format!(
                    "{} is required by {}",
                    id,
                    dependents.join(", ")
                ))
                .with_plugin(id));
            }
        }

        if let Err(e) = self.hooks.run(HookStage::PreUnload, id, &path) {
            if !force {
                return Err(e);
            }
            tracing::warn!(plugin_id = id, error = %e, "pre-unload hook failed, forcing unload");
        }

        if matches!(state, PluginState::Running | PluginState::Paused) {
            self.stop_plugin(id)?;
        }

        self.watcher.unregister_plugin(id);

        let state = self
            .registry
            .get_info(id)
            .map(|info| info.state)
            .unwrap_or(PluginState::Unloaded);
        if !state.can_transition_to(PluginState::Unloaded) && state != PluginState::Unloaded {
            self.transition(id, PluginState::Error)?;
        }
        if state != PluginState::Unloaded {
            self.transition(id, PluginState::Unloaded)?;
        }

        self.registry.unregister(id)?;
        self.metrics.clear_history(id);
        self.health.remove(id);
        self.resolver.update_dependency_graph(&self.registry);

        if let Err(e) = self.hooks.run(HookStage::PostUnload, id, &path) {
            tracing::warn!(plugin_id = id, error = %e, "post-unload hook failed");
        }

        self.events.emit_unloaded(id);
        self.observe(Observation::Unload);
        tracing::info!(plugin_id = id, "plugin unloaded");
        Ok(())
    }

    // ---- reload ---------------------------------------------------------

    /// Replace a plugin with a fresh instance loaded from the same file.
    ///
    /// With `preserve_state`, the plugin's `save_state` snapshot (or its
    /// configuration when it has none) is handed to the new instance.
    pub fn reload_plugin(&self, id: &str, preserve_state: bool) -> Result<()> {
        let _ops = self.ops.lock();
        let info = self
            .registry
            .get_info(id)
            .ok_or_else(|| Error::plugin_not_found(id))?;

        let result = match info.state {
            PluginState::Running | PluginState::Paused => self.reload_running(info, preserve_state),
            PluginState::Loaded => self.reload_loaded(info),
            PluginState::Stopped | PluginState::Error => self.reload_from_disk(info, preserve_state),
            other => Err(Error::state_error(format!("cannot reload a plugin that is {}", other))
                .with_plugin(id)),
        };

        match &result {
            Ok(()) => {
                self.observe(Observation::Reload);
                tracing::info!(plugin_id = id, preserve_state, "plugin reloaded");
            }
            Err(e) => tracing::error!(plugin_id = id, error = %e, "plugin reload failed"),
        }
        result
    }

    fn capture(&self, info: &PluginInfo, instance: &PluginHandle) -> Snapshot {
        match guarded(ErrorCode::ExecutionFailed, "save_state", || {
            instance.execute_command(commands::SAVE_STATE, &Value::Null)
        }) {
            Ok(state) => Snapshot::Cooperative(state),
            Err(e) => {
                if e.code() != ErrorCode::CommandNotFound {
                    tracing::warn!(plugin_id = %info.id, error = %e, "save_state failed, using configuration");
                }
                Snapshot::Fallback(json!({
                    "configuration": info.configuration,
                    "__runtime": {
                        "uptime_ms": info.uptime().as_millis() as u64,
                        "idle_ms": info.last_activity.elapsed().as_millis() as u64,
                        "error_count": info.error_count(),
                    },
                }))
            }
        }
    }

    fn restore(&self, id: &str, instance: &PluginHandle, snapshot: Snapshot, configuration: &Value) {
        let payload = match &snapshot {
            Snapshot::Cooperative(state) => state,
            Snapshot::Fallback(state) => state,
        };

        match guarded(ErrorCode::ExecutionFailed, "restore_state", || {
            instance.execute_command(commands::RESTORE_STATE, payload)
        }) {
            Ok(_) => return,
            Err(e) if e.code() == ErrorCode::CommandNotFound => {}
            Err(e) => {
                tracing::warn!(plugin_id = id, error = %e, "restore_state failed, reapplying configuration")
            }
        }

        let configuration = match &snapshot {
            Snapshot::Fallback(state) => state.get("configuration").unwrap_or(configuration),
            Snapshot::Cooperative(_) => configuration,
        };
        if configuration.as_object().map(|m| m.is_empty()).unwrap_or(true) {
            return;
        }
        if let Err(e) = guarded(ErrorCode::ConfigurationError, "configure", || {
            instance.configure(configuration)
        }) {
            tracing::warn!(plugin_id = id, error = %e, "could not reapply configuration after reload");
        }
    }

    /// Load a fresh instance for `id`, checking it reports the same id.
    fn fresh_instance(&self, id: &str, path: &Path) -> Result<PluginHandle> {
        if let Err(e) = self.loader.unload(id) {
            tracing::debug!(plugin_id = id, error = %e, "loader had nothing to release");
        }
        let instance = guarded(ErrorCode::LoadFailed, "plugin load", || self.loader.load(path))?;
        if instance.id() != id {
            let other = instance.id();
            drop(instance);
            let _ = self.loader.unload(&other);
            return Err(Error::load_failed(format!(
                "{} now provides plugin {} instead of {}",
                path.display(),
                other,
                id
            )));
        }
        Ok(instance)
    }

    fn reload_running(&self, info: PluginInfo, preserve_state: bool) -> Result<()> {
        let id = info.id.clone();
        if info.state == PluginState::Paused {
            self.transition(&id, PluginState::Running)?;
        }

        let old = info
            .instance
            .clone()
            .ok_or_else(|| Error::state_error(format!("{} has no instance", id)).with_plugin(&id))?;
        let snapshot = preserve_state.then(|| self.capture(&info, &old));

        self.transition(&id, PluginState::Reloading)?;

        if let Err(e) = guarded(ErrorCode::ExecutionFailed, "shutdown", || old.shutdown()) {
            tracing::warn!(plugin_id = %id, error = %e, "shutdown before reload failed");
        }

        let result = (|| -> Result<()> {
            let fresh = self.fresh_instance(&id, &info.file_path)?;
            let replaced = self.registry.replace_instance(&id, fresh.clone())?;
            drop(replaced);
            guarded(ErrorCode::InitializationFailed, "initialize", || fresh.initialize())
                .map_err(|e| Error::init_failed(e.message))?;
            self.transition(&id, PluginState::Running)?;
            if let Some(snapshot) = snapshot {
                self.restore(&id, &fresh, snapshot, &info.configuration);
                self.registry.restore_timestamps(&id, info.load_time)?;
            }
            Ok(())
        })();

        drop(old);
        drop(info);

        if let Err(e) = &result {
            let e = e.clone().with_plugin(&id);
            self.fail(&id, &e);
            let _ = self.transition(&id, PluginState::Error);
        }
        result.map_err(|e| e.with_plugin(&id))
    }

    fn reload_loaded(&self, info: PluginInfo) -> Result<()> {
        let id = info.id.clone();
        let path = info.file_path.clone();
        drop(info);

        let fresh = self.fresh_instance(&id, &path)?;
        if !self.registry.is_registered(&id) {
            return Err(Error::plugin_not_found(&id));
        }
        self.registry.replace_instance(&id, fresh)?;
        self.registry.touch(&id)
    }

    fn reload_from_disk(&self, info: PluginInfo, preserve_state: bool) -> Result<()> {
        let id = info.id.clone();
        let mut options = LoadOptions::new()
            .with_dependency_check(false)
            .with_hot_reload(info.hot_reload_enabled);
        if preserve_state {
            options = options.with_configuration(info.configuration.clone());
        }
        let path = info.file_path.clone();
        drop(info);

        self.unload_plugin(&id, true)?;
        let loaded = self.load_plugin(&path, options)?;
        if loaded != id {
            tracing::error!(plugin_id = %id, now = %loaded, "plugin id changed across restart");
            if let Err(e) = self.unload_plugin(&loaded, true) {
                tracing::warn!(plugin_id = %loaded, error = %e, "failed to unload replacement");
            }
            return Err(Error::load_failed(format!(
                "{} now declares id {}",
                path.display(),
                loaded
            ))
            .with_plugin(&id));
        }
        Ok(())
    }

    /// Toggle reload-on-change for a plugin.
    pub fn set_hot_reload(&self, id: &str, enabled: bool) -> Result<()> {
        let path = self
            .registry
            .get_info(id)
            .map(|info| info.file_path)
            .ok_or_else(|| Error::plugin_not_found(id))?;

        if enabled {
            if self.watcher.is_watching(id) {
                self.watcher.enable(id)?;
            } else {
                self.watcher.register_plugin(id, &path)?;
            }
        } else if self.watcher.is_watching(id) {
            self.watcher.disable(id)?;
        }
        self.registry.set_hot_reload(id, enabled)
    }

    // ---- commands and configuration ---------------------------------------

    /// Run a command on a running plugin.
    pub fn execute_command(&self, id: &str, name: &str, params: &Value) -> Result<Value> {
        let info = self
            .registry
            .get_info(id)
            .ok_or_else(|| Error::plugin_not_found(id))?;
        if !info.state.can_call() {
            return Err(Error::state_error(format!(
                "plugin {} is {}, not running",
                id, info.state
            ))
            .with_plugin(id));
        }
        let instance = info
            .instance
            .ok_or_else(|| Error::state_error(format!("{} has no instance", id)).with_plugin(id))?;

        let started = Instant::now();
        let result = guarded(ErrorCode::ExecutionFailed, name, || {
            instance.execute_command(name, params)
        });
        let elapsed = started.elapsed();
        let _ = self.registry.touch(id);
        self.observe(Observation::Command(elapsed));

        result.map_err(|e| {
            let e = if e.plugin_id.is_some() { e } else { e.with_plugin(id) };
            tracing::error!(plugin_id = id, command = name, error = %e, "plugin command failed");
            self.fail(id, &e);
            e
        })
    }

    /// Apply a configuration to a loaded plugin and remember it.
    pub fn configure_plugin(&self, id: &str, configuration: Value) -> Result<()> {
        let instance = self.registry.get(id).ok_or_else(|| {
            if self.registry.is_registered(id) {
                Error::state_error(format!("{} has no live instance", id)).with_plugin(id)
            } else {
                Error::plugin_not_found(id)
            }
        })?;

        match guarded(ErrorCode::ConfigurationError, "configure", || {
            instance.configure(&configuration)
        }) {
            Ok(()) => self.registry.set_configuration(id, configuration),
            Err(e) => {
                let e = Error::new(ErrorCode::ConfigurationError, e.message).with_plugin(id);
                self.fail(id, &e);
                Err(e)
            }
        }
    }

    // ---- queries --------------------------------------------------------

    /// Live instance of a plugin.
    pub fn get_plugin(&self, id: &str) -> Result<PluginHandle> {
        self.registry.get(id).ok_or_else(|| Error::plugin_not_found(id))
    }

    /// Snapshot of a plugin's record.
    pub fn get_plugin_info(&self, id: &str) -> Result<PluginInfo> {
        self.registry
            .get_info(id)
            .ok_or_else(|| Error::plugin_not_found(id))
    }

    /// Check if a plugin is registered.
    pub fn is_loaded(&self, id: &str) -> bool {
        self.registry.is_registered(id)
    }

    /// Ids of registered plugins in load order.
    pub fn loaded_plugins(&self) -> Vec<String> {
        self.registry.get_all_ids()
    }

    /// Snapshots of every record.
    pub fn all_plugin_info(&self) -> Vec<PluginInfo> {
        self.registry.get_all_info()
    }

    /// Ids of plugins advertising `caps`.
    pub fn plugins_with_capability(&self, caps: PluginCapability) -> Vec<String> {
        self.registry.ids_with_capability(caps)
    }

    /// Ids of plugins in `state`.
    pub fn plugins_in_state(&self, state: PluginState) -> Vec<String> {
        self.registry.ids_in_state(state)
    }

    /// Number of registered plugins.
    pub fn plugin_count(&self) -> usize {
        self.registry.count()
    }

    /// Registered ids with dependencies first. Empty on a cycle.
    pub fn get_load_order(&self) -> Vec<String> {
        self.resolver.get_load_order()
    }

    /// Snapshot of the dependency graph.
    pub fn dependency_graph(&self) -> HashMap<String, DependencyNode> {
        self.resolver.graph()
    }

    /// Declared dependencies of `id` that are not loaded.
    pub fn get_missing_dependencies(&self, id: &str) -> Vec<String> {
        self.resolver.get_missing_dependencies(id)
    }

    /// Break dependency cycles. Edits last until the next registry change.
    pub fn resolve_circular_dependencies(
        &self,
        strategy: CycleResolution,
    ) -> Result<Vec<CircularDependency>> {
        self.resolver.resolve_circular_dependencies(strategy)
    }

    // ---- transactions ---------------------------------------------------

    /// Start a transaction bound to this manager.
    pub fn begin_transaction(&self) -> Transaction {
        Transaction::bound(self.this.clone(), self.active_transactions.clone())
    }

    /// Transactions started and not yet finished.
    pub fn active_transactions(&self) -> usize {
        self.active_transactions.load(Ordering::SeqCst)
    }

    /// Hold off every other load, unload and reload until the guard drops.
    pub(crate) fn lock_operations(&self) -> ReentrantMutexGuard<'_, ()> {
        self.ops.lock()
    }

    /// Load several plugins atomically.
    ///
    /// Every path gets a result. When one load fails, the plugins already
    /// loaded are unloaded again and the remaining paths are not attempted.
    pub fn batch_load(&self, paths: &[PathBuf], options: LoadOptions) -> HashMap<PathBuf, Result<String>> {
        let mut tx = self.begin_transaction();
        let mut slots = Vec::with_capacity(paths.len());

        for path in paths {
            match tx.push_load(path.clone(), options.clone()) {
                Ok(slot) => slots.push(slot),
                Err(e) => return paths.iter().map(|p| (p.clone(), Err(e.clone()))).collect(),
            }
        }

        if tx.commit().is_ok() {
            return paths
                .iter()
                .zip(slots)
                .map(|(path, slot)| {
                    let id = slot
                        .lock()
                        .clone()
                        .ok_or_else(|| Error::load_failed("load step reported no plugin id"));
                    (path.clone(), id)
                })
                .collect();
        }

        let outcome = tx.outcome();
        paths
            .iter()
            .zip(outcome.steps)
            .map(|(path, step)| (path.clone(), Err(batch_step_error(step.status))))
            .collect()
    }

    /// Unload several plugins atomically. Dependents are unloaded before
    /// their dependencies.
    pub fn batch_unload(&self, ids: &[String], force: bool) -> HashMap<String, Result<()>> {
        let mut ordered = self.resolver.suggested_load_order(ids);
        ordered.reverse();
        for id in ids {
            if !ordered.contains(id) {
                ordered.push(id.clone());
            }
        }

        let mut tx = self.begin_transaction();
        for id in &ordered {
            if let Err(e) = tx.add_unload(id.clone(), force) {
                return ids.iter().map(|id| (id.clone(), Err(e.clone()))).collect();
            }
        }

        if tx.commit().is_ok() {
            return ids.iter().map(|id| (id.clone(), Ok(()))).collect();
        }

        let outcome = tx.outcome();
        ordered
            .into_iter()
            .zip(outcome.steps)
            .map(|(id, step)| (id, Err(batch_step_error(step.status))))
            .collect()
    }

    // ---- health and monitoring --------------------------------------------

    /// Check one plugin. Restarts it when the failure streak reaches the
    /// threshold and auto-restart is on.
    pub fn check_plugin_health(&self, id: &str) -> Result<HealthStatus> {
        let info = self
            .registry
            .get_info(id)
            .ok_or_else(|| Error::plugin_not_found(id))?;
        let status = self.health.record(&info);
        drop(info);

        if !status.is_healthy {
            tracing::warn!(plugin_id = id, failures = status.consecutive_failures, "plugin unhealthy");
        }

        if self.health.needs_restart(id) {
            tracing::info!(plugin_id = id, "restarting unhealthy plugin");
            match self.reload_plugin(id, true) {
                Ok(()) => self.health.reset(id),
                Err(e) => tracing::error!(plugin_id = id, error = %e, "automatic restart failed"),
            }
        }
        Ok(status)
    }

    /// Check every registered plugin.
    pub fn check_all_health(&self) -> HashMap<String, HealthStatus> {
        self.registry
            .get_all_ids()
            .into_iter()
            .filter_map(|id| self.check_plugin_health(&id).ok().map(|s| (id, s)))
            .collect()
    }

    /// Latest recorded health of a plugin.
    pub fn get_health_status(&self, id: &str) -> Option<HealthStatus> {
        self.health.get(id)
    }

    /// Toggle automatic restarts of unhealthy plugins.
    pub fn set_auto_restart(&self, enabled: bool) {
        self.health.set_auto_restart(enabled);
    }

    /// Start periodic metrics sampling and health checks.
    pub fn start_monitoring(&self) -> Result<()> {
        self.metrics.start(&self.registry)?;

        let weak = self.this.clone();
        self.health.start(move || match weak.upgrade() {
            Some(manager) => {
                manager.check_all_health();
                true
            }
            None => false,
        })?;
        tracing::info!("plugin monitoring started");
        Ok(())
    }

    /// Stop sampling and health checks.
    pub fn stop_monitoring(&self) {
        self.metrics.stop();
        self.health.stop();
    }

    /// Start the file-system watcher and watch every existing search path.
    pub fn start_watching(&self) -> Result<()> {
        for dir in &self.config.search_paths {
            if dir.is_dir() {
                self.watcher.watch_directory(dir)?;
            }
        }
        self.watcher.start()
    }

    /// Stop the file-system watcher.
    pub fn stop_watching(&self) {
        self.watcher.stop();
    }

    /// Stop background work and unload every plugin, dependents first.
    pub fn shutdown(&self) {
        self.stop_monitoring();
        self.stop_watching();

        let _ops = self.ops.lock();
        let mut order = self.resolver.get_load_order();
        if order.len() != self.registry.count() {
            order = self.registry.get_all_ids();
        }
        for id in order.into_iter().rev() {
            if let Err(e) = self.unload_plugin(&id, true) {
                tracing::warn!(plugin_id = %id, error = %e, "unload during shutdown failed");
            }
        }
        tracing::debug!("plugin manager shut down");
    }
}

fn batch_step_error(status: StepStatus) -> Error {
    match status {
        StepStatus::Failed(e) => e,
        StepStatus::RollbackFailed(e) => Error::new(
            ErrorCode::SystemError,
            "rolled back, but undoing this step failed",
        )
        .with_details(e.to_string()),
        StepStatus::Pending => Error::new(ErrorCode::ExecutionFailed, "not attempted: batch failed earlier"),
        StepStatus::RolledBack | StepStatus::Completed => {
            Error::new(ErrorCode::ExecutionFailed, "rolled back after batch failure")
        }
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("loader", &self.loader.name())
            .field("plugin_count", &self.registry.count())
            .field("versioning", &self.versions.is_some())
            .field("active_transactions", &self.active_transactions())
            .finish()
    }
}
