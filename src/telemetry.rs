//! Prometheus export of plugin host activity.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};

use crate::error::{Error, ErrorCode, Result};

/// Configuration for the Prometheus exporter.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Prefix for every metric name.
    pub prefix: String,
    /// Record command durations.
    pub detailed_timing: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            prefix: "plugin_host".to_string(),
            detailed_timing: true,
        }
    }
}

impl TelemetryConfig {
    /// Create a new exporter configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the metric prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Enable or disable command timing.
    pub fn with_detailed_timing(mut self, enabled: bool) -> Self {
        self.detailed_timing = enabled;
        self
    }
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::new(ErrorCode::SystemError, format!("prometheus: {}", e))
}

/// Counters and histograms fed by the plugin manager.
pub struct PrometheusMetrics {
    config: TelemetryConfig,
    registry: Registry,
    loads: IntCounter,
    unloads: IntCounter,
    reloads: IntCounter,
    errors: IntCounter,
    registered: IntGauge,
    load_duration: Histogram,
    command_duration: Histogram,
}

impl PrometheusMetrics {
    /// Create and register every metric.
    pub fn new(config: TelemetryConfig) -> Result<Self> {
        let registry = Registry::new();
        let p = &config.prefix;

        let loads = IntCounter::new(format!("{}_loads_total", p), "Plugins loaded")
            .map_err(metric_error)?;
        let unloads = IntCounter::new(format!("{}_unloads_total", p), "Plugins unloaded")
            .map_err(metric_error)?;
        let reloads = IntCounter::new(format!("{}_reloads_total", p), "Plugin reloads")
            .map_err(metric_error)?;
        let errors = IntCounter::new(format!("{}_errors_total", p), "Plugin errors")
            .map_err(metric_error)?;
        let registered = IntGauge::new(format!("{}_registered", p), "Plugins in the registry")
            .map_err(metric_error)?;

        let load_duration = Histogram::with_opts(
            HistogramOpts::new(
                format!("{}_load_duration_seconds", p),
                "Load pipeline duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .map_err(metric_error)?;

        let command_duration = Histogram::with_opts(
            HistogramOpts::new(
                format!("{}_command_duration_seconds", p),
                "Plugin command duration in seconds",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )
        .map_err(metric_error)?;

        registry.register(Box::new(loads.clone())).map_err(metric_error)?;
        registry.register(Box::new(unloads.clone())).map_err(metric_error)?;
        registry.register(Box::new(reloads.clone())).map_err(metric_error)?;
        registry.register(Box::new(errors.clone())).map_err(metric_error)?;
        registry.register(Box::new(registered.clone())).map_err(metric_error)?;
        registry.register(Box::new(load_duration.clone())).map_err(metric_error)?;
        registry.register(Box::new(command_duration.clone())).map_err(metric_error)?;

        Ok(Self {
            config,
            registry,
            loads,
            unloads,
            reloads,
            errors,
            registered,
            load_duration,
            command_duration,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Prometheus registry to expose from an HTTP endpoint.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a successful load.
    pub fn record_load(&self, duration_secs: f64) {
        self.loads.inc();
        self.load_duration.observe(duration_secs);
    }

    /// Record an unload.
    pub fn record_unload(&self) {
        self.unloads.inc();
    }

    /// Record a reload.
    pub fn record_reload(&self) {
        self.reloads.inc();
    }

    /// Record a plugin error.
    pub fn record_error(&self) {
        self.errors.inc();
    }

    /// Record a command duration.
    pub fn record_command(&self, duration_secs: f64) {
        if self.config.detailed_timing {
            self.command_duration.observe(duration_secs);
        }
    }

    /// Track the registry size.
    pub fn set_registered(&self, count: usize) {
        self.registered.set(count as i64);
    }

    /// Total loads recorded.
    pub fn loads_total(&self) -> u64 {
        self.loads.get()
    }

    /// Total unloads recorded.
    pub fn unloads_total(&self) -> u64 {
        self.unloads.get()
    }

    /// Total errors recorded.
    pub fn errors_total(&self) -> u64 {
        self.errors.get()
    }
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetrics")
            .field("config", &self.config)
            .field("loads", &self.loads_total())
            .field("unloads", &self.unloads_total())
            .field("errors", &self.errors_total())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = TelemetryConfig::new()
            .with_prefix("test")
            .with_detailed_timing(false);

        assert_eq!(config.prefix, "test");
        assert!(!config.detailed_timing);
    }

    #[test]
    fn test_recording() {
        let metrics = PrometheusMetrics::new(TelemetryConfig::default()).unwrap();

        metrics.record_load(0.1);
        metrics.record_load(0.2);
        metrics.record_unload();
        metrics.record_error();
        metrics.record_command(0.01);
        metrics.set_registered(1);

        assert_eq!(metrics.loads_total(), 2);
        assert_eq!(metrics.unloads_total(), 1);
        assert_eq!(metrics.errors_total(), 1);
        assert!(!metrics.registry().gather().is_empty());
    }
}
