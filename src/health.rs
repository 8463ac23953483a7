//! Per-plugin health tracking.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{Error, ErrorCode, Result};
use crate::registry::PluginInfo;

/// Result of the latest health check of one plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    /// Whether the plugin is `Running` or `Loaded`.
    pub is_healthy: bool,
    /// Human-readable summary.
    pub status_message: String,
    /// Check time, ms since the epoch.
    pub last_check: u64,
    /// Unhealthy checks in a row.
    pub consecutive_failures: u32,
    /// State, error count, uptime and last error.
    pub diagnostics: Value,
}

/// Health check settings.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    /// Time between background checks.
    pub interval: Duration,
    /// Reload plugins that fail too many checks in a row.
    pub auto_restart: bool,
    /// Consecutive failures that trigger a restart.
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            auto_restart: false,
            failure_threshold: 3,
        }
    }
}

/// Keeps the latest [`HealthStatus`] per plugin and runs periodic checks.
pub struct HealthMonitor {
    config: RwLock<HealthConfig>,
    statuses: RwLock<HashMap<String, HealthStatus>>,
    worker: Mutex<Option<(Arc<(Mutex<bool>, Condvar)>, JoinHandle<()>)>>,
}

impl HealthMonitor {
    /// Create a monitor.
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config: RwLock::new(config),
            statuses: RwLock::new(HashMap::new()),
            worker: Mutex::new(None),
        }
    }

    /// Current settings.
    pub fn config(&self) -> HealthConfig {
        self.config.read().clone()
    }

    /// Toggle automatic restarts.
    pub fn set_auto_restart(&self, enabled: bool) {
        self.config.write().auto_restart = enabled;
    }

    /// Evaluate a plugin record and store the result.
    pub fn record(&self, info: &PluginInfo) -> HealthStatus {
        let is_healthy = info.state.is_healthy();
        let mut statuses = self.statuses.write();
        let failures = match statuses.get(&info.id) {
            Some(previous) if !is_healthy => previous.consecutive_failures.saturating_add(1),
            None if !is_healthy => 1,
            _ => 0,
        };

        let status = HealthStatus {
            is_healthy,
            status_message: if is_healthy {
                format!("plugin is {}", info.state)
            } else {
                format!("plugin is {} ({} failed checks)", info.state, failures)
            },
            last_check: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            consecutive_failures: failures,
            diagnostics: json!({
                "state": info.state.name(),
                "error_count": info.error_count(),
                "uptime_ms": info.uptime().as_millis() as u64,
                "last_error": info.error_log.back(),
            }),
        };

        statuses.insert(info.id.clone(), status.clone());
        status
    }

    /// Whether a plugin has failed enough checks to be restarted.
    pub fn needs_restart(&self, id: &str) -> bool {
        let config = self.config.read();
        config.auto_restart
            && self
                .statuses
                .read()
                .get(id)
                .map(|s| s.consecutive_failures >= config.failure_threshold)
                .unwrap_or(false)
    }

    /// Clear the failure streak after a restart.
    pub fn reset(&self, id: &str) {
        if let Some(status) = self.statuses.write().get_mut(id) {
            status.consecutive_failures = 0;
        }
    }

    /// Latest status of a plugin.
    pub fn get(&self, id: &str) -> Option<HealthStatus> {
        self.statuses.read().get(id).cloned()
    }

    /// Latest status of every checked plugin.
    pub fn all(&self) -> HashMap<String, HealthStatus> {
        self.statuses.read().clone()
    }

    /// Forget a plugin.
    pub fn remove(&self, id: &str) {
        self.statuses.write().remove(id);
    }

    /// Call `tick` every configured interval on a background thread until
    /// [`stop`](Self::stop) or `tick` returns `false`.
    pub fn start<F>(&self, tick: F) -> Result<()>
    where
        F: Fn() -> bool + Send + 'static,
    {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let interval = self.config.read().interval;
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = stop.clone();

        let handle = std::thread::Builder::new()
            .name("plugin-health".to_string())
            .spawn(move || loop {
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
                if !tick() {
                    break;
                }
            })
            .map_err(|e| Error::new(ErrorCode::SystemError, format!("spawn health monitor: {}", e)))?;

        *worker = Some((stop, handle));
        Ok(())
    }

    /// Stop the background checks.
    pub fn stop(&self) {
        let Some((stop, handle)) = self.worker.lock().take() else {
            return;
        };
        {
            let (lock, cvar) = &*stop;
            *lock.lock() = true;
            cvar.notify_all();
        }
        if handle.thread().id() != std::thread::current().id() {
            let _ = handle.join();
        }
    }

    /// Whether background checks are running.
    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &*self.config.read())
            .field("tracked", &self.statuses.read().len())
            .field("running", &self.is_running())
            .finish()
    }
}
