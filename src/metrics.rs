//! Periodic sampling of per-plugin and host-wide metrics.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, ErrorCode, Result};
use crate::lifecycle::PluginState;
use crate::plugin::{commands, PluginCapability};
use crate::registry::{PluginInfo, PluginRegistry};

/// Coarse per-plugin memory estimate used in system samples.
pub const ESTIMATED_BYTES_PER_PLUGIN: u64 = 1024 * 1024;

/// Configuration for the metrics collector.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Sampling interval. Must be at least one millisecond.
    pub interval: Duration,
    /// Samples retained per plugin.
    pub max_history: usize,
    /// How often history is trimmed in the background.
    pub trim_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_history: 100,
            trim_interval: Duration::from_secs(300),
        }
    }
}

impl MetricsConfig {
    /// Create a new metrics configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sampling interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the per-plugin history size.
    pub fn with_max_history(mut self, max: usize) -> Self {
        self.max_history = max;
        self
    }

    /// Set the trim cadence.
    pub fn with_trim_interval(mut self, interval: Duration) -> Self {
        self.trim_interval = interval;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.interval < Duration::from_millis(1) {
            return Err(Error::new(
                ErrorCode::InvalidConfiguration,
                "metrics interval must be at least 1ms",
            ));
        }
        if self.max_history == 0 {
            return Err(Error::new(
                ErrorCode::InvalidConfiguration,
                "metrics history must hold at least one sample",
            ));
        }
        Ok(())
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One sample for one plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSample {
    /// Plugin id.
    pub plugin_id: String,
    /// Wall-clock sample time in ms since the epoch.
    pub timestamp_ms: u64,
    /// Time since the plugin was loaded.
    pub uptime_ms: u64,
    /// Time since the plugin's last activity.
    pub idle_ms: u64,
    /// Numeric state code.
    pub state: u8,
    /// State name.
    pub state_name: String,
    /// Retained error count.
    pub error_count: usize,
    /// Result of the plugin's `get_metrics` command, if it has one.
    pub custom: Option<Value>,
}

impl MetricsSample {
    fn from_info(info: &PluginInfo) -> Self {
        Self {
            plugin_id: info.id.clone(),
            timestamp_ms: epoch_ms(),
            uptime_ms: info.load_time.elapsed().as_millis() as u64,
            idle_ms: info.last_activity.elapsed().as_millis() as u64,
            state: info.state.as_number(),
            state_name: info.state.name().to_string(),
            error_count: info.error_count(),
            custom: None,
        }
    }

    /// Serialize to a JSON value.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Host-wide aggregate sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemMetrics {
    /// Wall-clock sample time in ms since the epoch.
    pub timestamp_ms: u64,
    /// Registered plugins.
    pub total: usize,
    /// Plugins holding a live instance outside of start-up.
    pub loaded: usize,
    /// Plugins in the error state.
    pub failed: usize,
    /// Plugins stopped or unloaded.
    pub unloaded: usize,
    /// Plugins loading or initializing.
    pub initializing: usize,
    /// Coarse memory estimate in bytes.
    pub memory_estimate_bytes: u64,
    /// Age of the earliest load.
    pub uptime_ms: u64,
    /// Sampling interval in effect.
    pub interval_ms: u64,
}

type SampleSink = Arc<dyn Fn(&MetricsSample) + Send + Sync>;

struct Worker {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

/// Samples the registry and keeps a bounded history per plugin.
///
/// History reads return copies, so callers never hold a lock on it.
pub struct MetricsCollector {
    config: RwLock<MetricsConfig>,
    history: DashMap<String, VecDeque<MetricsSample>>,
    system: Mutex<VecDeque<SystemMetrics>>,
    last_trim: Mutex<Instant>,
    samples: AtomicU64,
    running: AtomicBool,
    sink: RwLock<Option<SampleSink>>,
    worker: Mutex<Option<Worker>>,
}

impl MetricsCollector {
    /// Create a collector. Fails on an invalid configuration.
    pub fn new(config: MetricsConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: RwLock::new(config),
            history: DashMap::new(),
            system: Mutex::new(VecDeque::new()),
            last_trim: Mutex::new(Instant::now()),
            samples: AtomicU64::new(0),
            running: AtomicBool::new(false),
            sink: RwLock::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Current configuration.
    pub fn config(&self) -> MetricsConfig {
        self.config.read().clone()
    }

    /// Install a callback invoked for every plugin sample.
    pub fn set_sink<F>(&self, sink: F)
    where
        F: Fn(&MetricsSample) + Send + Sync + 'static,
    {
        *self.sink.write() = Some(Arc::new(sink));
    }

    /// Change the sampling interval.
    pub fn set_interval(&self, interval: Duration) -> Result<()> {
        let mut config = self.config.write();
        let candidate = config.clone().with_interval(interval);
        candidate.validate()?;
        *config = candidate;
        Ok(())
    }

    /// Change the history size and trim immediately.
    pub fn set_max_history_size(&self, max: usize) -> Result<()> {
        {
            let mut config = self.config.write();
            let candidate = config.clone().with_max_history(max);
            candidate.validate()?;
            *config = candidate;
        }
        self.trim_history();
        Ok(())
    }

    /// Take one sample of every registered plugin.
    pub fn collect_once(&self, registry: &PluginRegistry) -> Vec<MetricsSample> {
        let infos = registry.get_all_info();
        let max = self.config.read().max_history;
        let sink = self.sink.read().clone();
        let mut taken = Vec::with_capacity(infos.len());

        for info in &infos {
            let mut sample = MetricsSample::from_info(info);
            sample.custom = self.custom_metrics(info);

            if let Err(e) = registry.set_metrics(&info.id, sample.to_json()) {
                // Unregistered between the snapshot and now.
                tracing::debug!(plugin_id = %info.id, error = %e, "skipping metrics update");
                continue;
            }

            {
                let mut entry = self.history.entry(info.id.clone()).or_default();
                entry.push_back(sample.clone());
                while entry.len() > max {
                    entry.pop_front();
                }
            }

            if let Some(sink) = &sink {
                if catch_unwind(AssertUnwindSafe(|| sink(&sample))).is_err() {
                    tracing::error!(plugin_id = %info.id, "metrics sink panicked");
                }
            }
            taken.push(sample);
        }

        let system = self.system_sample(&infos);
        {
            let mut history = self.system.lock();
            history.push_back(system);
            while history.len() > max {
                history.pop_front();
            }
        }

        self.history.retain(|id, _| registry.is_registered(id));
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.maybe_trim();
        taken
    }

    fn custom_metrics(&self, info: &PluginInfo) -> Option<Value> {
        if !info.metadata.capabilities.contains(PluginCapability::MONITORING) {
            return None;
        }
        let instance = info.instance.as_ref()?;

        match catch_unwind(AssertUnwindSafe(|| {
            instance.execute_command(commands::GET_METRICS, &Value::Null)
        })) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                tracing::error!(plugin_id = %info.id, error = %e, "get_metrics failed");
                None
            }
            Err(_) => {
                tracing::error!(plugin_id = %info.id, "get_metrics panicked");
                None
            }
        }
    }

    fn system_sample(&self, infos: &[PluginInfo]) -> SystemMetrics {
        let mut system = SystemMetrics {
            timestamp_ms: epoch_ms(),
            total: infos.len(),
            interval_ms: self.config.read().interval.as_millis() as u64,
            ..Default::default()
        };

        for info in infos {
            match info.state {
                PluginState::Loaded
                | PluginState::Running
                | PluginState::Paused
                | PluginState::Reloading => system.loaded += 1,
                PluginState::Error => system.failed += 1,
                PluginState::Unloaded | PluginState::Stopped | PluginState::Stopping => {
                    system.unloaded += 1
                }
                PluginState::Loading | PluginState::Initializing => system.initializing += 1,
            }
        }

        system.memory_estimate_bytes = system.loaded as u64 * ESTIMATED_BYTES_PER_PLUGIN;
        system.uptime_ms = infos
            .iter()
            .map(|i| i.load_time)
            .min()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        system
    }

    fn maybe_trim(&self) {
        let due = {
            let mut last = self.last_trim.lock();
            if last.elapsed() >= self.config.read().trim_interval {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if due {
            self.trim_history();
        }
    }

    /// Drop samples beyond the configured history size.
    pub fn trim_history(&self) {
        let max = self.config.read().max_history;
        for mut entry in self.history.iter_mut() {
            let excess = entry.len().saturating_sub(max);
            entry.drain(..excess);
        }
        let mut system = self.system.lock();
        let excess = system.len().saturating_sub(max);
        system.drain(..excess);
    }

    /// Copy of a plugin's history, oldest first.
    pub fn get_plugin_history(&self, id: &str) -> Vec<MetricsSample> {
        self.history
            .get(id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent sample for a plugin.
    pub fn latest(&self, id: &str) -> Option<MetricsSample> {
        self.history.get(id).and_then(|h| h.back().cloned())
    }

    /// Copy of the system history, oldest first.
    pub fn system_history(&self) -> Vec<SystemMetrics> {
        self.system.lock().iter().cloned().collect()
    }

    /// Most recent system sample.
    pub fn latest_system(&self) -> Option<SystemMetrics> {
        self.system.lock().back().cloned()
    }

    /// Forget a plugin's history.
    pub fn clear_history(&self, id: &str) {
        self.history.remove(id);
    }

    /// Number of completed sampling rounds.
    pub fn rounds(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// Whether the background sampler is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start sampling `registry` on a background thread.
    ///
    /// The thread holds only weak references and exits when either side is
    /// dropped.
    pub fn start(self: &Arc<Self>, registry: &Arc<PluginRegistry>) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let collector: Weak<Self> = Arc::downgrade(self);
        let registry: Weak<PluginRegistry> = Arc::downgrade(registry);
        let signal = stop.clone();

        let handle = std::thread::Builder::new()
            .name("plugin-metrics".to_string())
            .spawn(move || loop {
                let interval = match collector.upgrade() {
                    Some(c) => c.config.read().interval,
                    None => break,
                };

                {
                    let (lock, cvar) = &*signal;
                    let mut stopped = lock.lock();
                    if !*stopped {
                        cvar.wait_for(&mut stopped, interval);
                    }
                    if *stopped {
                        break;
                    }
                }

                let (Some(collector), Some(registry)) = (collector.upgrade(), registry.upgrade())
                else {
                    break;
                };
                collector.collect_once(&registry);
            })
            .map_err(|e| Error::new(ErrorCode::SystemError, format!("spawn sampler: {}", e)))?;

        self.running.store(true, Ordering::SeqCst);
        *worker = Some(Worker { stop, handle });
        tracing::debug!("metrics sampler started");
        Ok(())
    }

    /// Stop the background sampler and wait for it to exit.
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        {
            let (lock, cvar) = &*worker.stop;
            *lock.lock() = true;
            cvar.notify_all();
        }
        // The sampler may hold the last strong reference and be dropping us.
        if worker.handle.thread().id() != std::thread::current().id() {
            let _ = worker.handle.join();
        }
        self.running.store(false, Ordering::SeqCst);
        tracing::debug!("metrics sampler stopped");
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("config", &*self.config.read())
            .field("tracked_plugins", &self.history.len())
            .field("rounds", &self.rounds())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPlugin;

    fn registry_with(plugins: Vec<MockPlugin>) -> Arc<PluginRegistry> {
        let registry = Arc::new(PluginRegistry::default_config());
        for plugin in plugins {
            let handle = plugin.into_handle();
            let id = handle.id();
            registry
                .register(&id, PluginInfo::new(format!("/{}.plug", id), handle))
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_interval_validation() {
        let err = MetricsCollector::new(MetricsConfig::new().with_interval(Duration::ZERO))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);

        let collector = MetricsCollector::new(MetricsConfig::default()).unwrap();
        assert!(collector.set_interval(Duration::from_micros(10)).is_err());
        collector.set_interval(Duration::from_millis(5)).unwrap();
        assert_eq!(collector.config().interval, Duration::from_millis(5));
    }

    #[test]
    fn test_collect_once_samples_every_plugin() {
        let registry = registry_with(vec![
            MockPlugin::new("plain"),
            MockPlugin::new("watched").with_capabilities(PluginCapability::MONITORING),
        ]);
        let collector = MetricsCollector::new(MetricsConfig::default()).unwrap();

        let samples = collector.collect_once(&registry);
        assert_eq!(samples.len(), 2);

        let plain = collector.latest("plain").unwrap();
        assert!(plain.custom.is_none());
        assert_eq!(plain.state_name, "loaded");

        let watched = collector.latest("watched").unwrap();
        assert_eq!(watched.custom, Some(serde_json::json!({ "requests": 0 })));

        let info = registry.get_info("watched").unwrap();
        assert_eq!(info.metrics["plugin_id"], "watched");

        let system = collector.latest_system().unwrap();
        assert_eq!(system.total, 2);
        assert_eq!(system.loaded, 2);
        assert_eq!(system.memory_estimate_bytes, 2 * ESTIMATED_BYTES_PER_PLUGIN);
    }

    #[test]
    fn test_history_is_bounded() {
        let registry = registry_with(vec![MockPlugin::new("p")]);
        let collector =
            MetricsCollector::new(MetricsConfig::new().with_max_history(3)).unwrap();

        for _ in 0..5 {
            collector.collect_once(&registry);
        }
        assert_eq!(collector.get_plugin_history("p").len(), 3);
        assert_eq!(collector.system_history().len(), 3);

        collector.set_max_history_size(1).unwrap();
        assert_eq!(collector.get_plugin_history("p").len(), 1);
        assert!(collector.set_max_history_size(0).is_err());
    }

    #[test]
    fn test_uptime_is_monotonic() {
        let registry = registry_with(vec![MockPlugin::new("p")]);
        let collector = MetricsCollector::new(MetricsConfig::default()).unwrap();

        collector.collect_once(&registry);
        std::thread::sleep(Duration::from_millis(5));
        collector.collect_once(&registry);

        let history = collector.get_plugin_history("p");
        assert!(history[1].uptime_ms >= history[0].uptime_ms);
    }

    #[test]
    fn test_unregistered_history_dropped() {
        let registry = registry_with(vec![MockPlugin::new("p")]);
        let collector = MetricsCollector::new(MetricsConfig::default()).unwrap();
        collector.collect_once(&registry);

        registry.unregister("p").unwrap();
        collector.collect_once(&registry);
        assert!(collector.get_plugin_history("p").is_empty());
    }

    #[test]
    fn test_sink_receives_samples() {
        let registry = registry_with(vec![MockPlugin::new("p")]);
        let collector = MetricsCollector::new(MetricsConfig::default()).unwrap();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        collector.set_sink(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        collector.collect_once(&registry);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_background_sampling() {
        let registry = registry_with(vec![MockPlugin::new("p")]);
        let collector = Arc::new(
            MetricsCollector::new(MetricsConfig::new().with_interval(Duration::from_millis(5)))
                .unwrap(),
        );

        collector.start(&registry).unwrap();
        assert!(collector.is_running());

        let deadline = Instant::now() + Duration::from_secs(2);
        while collector.rounds() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        collector.stop();

        assert!(!collector.is_running());
        assert!(collector.rounds() >= 2);
    }
}
