//! Plugin lifecycle: the state machine, published events and load hooks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{Error, Result};

/// Plugin lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginState {
    /// Not loaded.
    Unloaded,
    /// The loader is working on it.
    Loading,
    /// Loaded but not initialized.
    Loaded,
    /// `initialize` is running.
    Initializing,
    /// Running and accepting commands.
    Running,
    /// Temporarily suspended.
    Paused,
    /// `shutdown` is running.
    Stopping,
    /// Shut down; the instance has been released.
    Stopped,
    /// Unrecoverable failure; the instance has been released.
    Error,
    /// Being replaced by a fresh instance.
    Reloading,
}

impl PluginState {
    /// Check whether `self -> to` is a legal transition.
    pub fn can_transition_to(&self, to: PluginState) -> bool {
        use PluginState as S;

        if to == S::Error {
            return *self != S::Error;
        }

        matches!(
            (*self, to),
            (S::Unloaded, S::Loading)
                | (S::Loading, S::Loaded)
                | (S::Loaded, S::Initializing)
                | (S::Loaded, S::Unloaded)
                | (S::Initializing, S::Running)
                | (S::Running, S::Paused)
                | (S::Paused, S::Running)
                | (S::Running, S::Stopping)
                | (S::Paused, S::Stopping)
                | (S::Stopping, S::Stopped)
                | (S::Stopped, S::Unloaded)
                | (S::Running, S::Reloading)
                | (S::Reloading, S::Running)
                | (S::Error, S::Unloaded)
        )
    }

    /// Whether a registry record in this state owns a live instance.
    pub fn holds_instance(&self) -> bool {
        matches!(
            self,
            Self::Loaded
                | Self::Initializing
                | Self::Running
                | Self::Paused
                | Self::Stopping
                | Self::Reloading
        )
    }

    /// Check if the plugin can receive commands.
    pub fn can_call(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Check if the health monitor treats this state as healthy.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Running | Self::Loaded)
    }

    /// Stable numeric code used in metrics samples.
    pub fn as_number(&self) -> u8 {
        match self {
            Self::Unloaded => 0,
            Self::Loading => 1,
            Self::Loaded => 2,
            Self::Initializing => 3,
            Self::Running => 4,
            Self::Paused => 5,
            Self::Stopping => 6,
            Self::Stopped => 7,
            Self::Error => 8,
            Self::Reloading => 9,
        }
    }

    /// Lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Reloading => "reloading",
        }
    }

    /// Return a `StateError` unless `self -> to` is legal.
    pub fn check_transition(&self, to: PluginState) -> Result<()> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(Error::state_error(format!(
                "illegal transition {} -> {}",
                self, to
            )))
        }
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Event published by the plugin manager.
#[derive(Debug, Clone)]
pub enum PluginEvent {
    /// A plugin finished loading and was registered.
    Loaded {
        /// Plugin id.
        id: String,
        /// Event time.
        at: Instant,
    },
    /// A plugin was unloaded and removed from the registry.
    Unloaded {
        /// Plugin id.
        id: String,
        /// Event time.
        at: Instant,
    },
    /// A plugin changed state.
    StateChanged {
        /// Plugin id.
        id: String,
        /// Previous state.
        old: PluginState,
        /// New state.
        new: PluginState,
        /// Event time.
        at: Instant,
    },
    /// A plugin reported or caused an error.
    Error {
        /// Plugin id.
        id: String,
        /// Error message.
        message: String,
        /// Event time.
        at: Instant,
    },
    /// A fresh metrics sample was recorded.
    MetricsUpdated {
        /// Plugin id.
        id: String,
        /// The sample.
        metrics: Value,
        /// Event time.
        at: Instant,
    },
}

impl PluginEvent {
    /// Get the plugin id.
    pub fn plugin_id(&self) -> &str {
        match self {
            Self::Loaded { id, .. }
            | Self::Unloaded { id, .. }
            | Self::StateChanged { id, .. }
            | Self::Error { id, .. }
            | Self::MetricsUpdated { id, .. } => id,
        }
    }

    /// Get the event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Loaded { .. } => "plugin_loaded",
            Self::Unloaded { .. } => "plugin_unloaded",
            Self::StateChanged { .. } => "plugin_state_changed",
            Self::Error { .. } => "plugin_error",
            Self::MetricsUpdated { .. } => "plugin_metrics_updated",
        }
    }

    /// Get the event timestamp.
    pub fn timestamp(&self) -> Instant {
        match self {
            Self::Loaded { at, .. }
            | Self::Unloaded { at, .. }
            | Self::StateChanged { at, .. }
            | Self::Error { at, .. }
            | Self::MetricsUpdated { at, .. } => *at,
        }
    }
}

/// Identifies a subscription so it can be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }
}

type EventHandler = Arc<dyn Fn(&PluginEvent) + Send + Sync>;

/// Fan-out of [`PluginEvent`]s to subscribers.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<(SubscriptionId, EventHandler)>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&PluginEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(sid, _)| *sid != id);
        handlers.len() != before
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Deliver an event. Handlers run outside the lock; a panicking handler
    /// is logged and skipped.
    pub fn emit(&self, event: PluginEvent) {
        let handlers: Vec<EventHandler> =
            self.handlers.read().iter().map(|(_, h)| h.clone()).collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::error!(
                    event = event.event_name(),
                    plugin_id = %event.plugin_id(),
                    "event subscriber panicked"
                );
            }
        }
    }

    /// Emit a loaded event.
    pub fn emit_loaded(&self, id: &str) {
        self.emit(PluginEvent::Loaded {
            id: id.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit an unloaded event.
    pub fn emit_unloaded(&self, id: &str) {
        self.emit(PluginEvent::Unloaded {
            id: id.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit a state change event.
    pub fn emit_state_changed(&self, id: &str, old: PluginState, new: PluginState) {
        self.emit(PluginEvent::StateChanged {
            id: id.to_string(),
            old,
            new,
            at: Instant::now(),
        });
    }

    /// Emit an error event.
    pub fn emit_error(&self, id: &str, message: &str) {
        self.emit(PluginEvent::Error {
            id: id.to_string(),
            message: message.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit a metrics event.
    pub fn emit_metrics(&self, id: &str, metrics: Value) {
        self.emit(PluginEvent::MetricsUpdated {
            id: id.to_string(),
            metrics,
            at: Instant::now(),
        });
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Point in the load/unload pipeline where a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    /// After the instance is created, before `initialize`.
    PreLoad,
    /// After `initialize`, before registration.
    PostLoad,
    /// Before `shutdown` during unload.
    PreUnload,
    /// After the plugin left the registry.
    PostUnload,
}

/// What a hook is told about the plugin it runs for.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// Stage being run.
    pub stage: HookStage,
    /// Plugin id.
    pub plugin_id: String,
    /// File the plugin was loaded from.
    pub path: PathBuf,
}

/// Identifies a registered hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

type Hook = Arc<dyn Fn(&HookContext) -> Result<()> + Send + Sync>;

struct HookEntry {
    id: HookId,
    stage: HookStage,
    name: String,
    hook: Hook,
}

/// Ordered hook lists for the load/unload pipeline.
#[derive(Default)]
pub struct LifecycleHooks {
    hooks: RwLock<Vec<HookEntry>>,
    next_id: AtomicU64,
}

impl LifecycleHooks {
    /// Create an empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook. Hooks of one stage run in registration order.
    pub fn register<F>(&self, stage: HookStage, name: impl Into<String>, hook: F) -> HookId
    where
        F: Fn(&HookContext) -> Result<()> + Send + Sync + 'static,
    {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.hooks.write().push(HookEntry {
            id,
            stage,
            name: name.into(),
            hook: Arc::new(hook),
        });
        id
    }

    /// Remove a hook.
    pub fn unregister(&self, id: HookId) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|h| h.id != id);
        hooks.len() != before
    }

    /// Names of the hooks registered for a stage, in run order.
    pub fn names(&self, stage: HookStage) -> Vec<String> {
        self.hooks
            .read()
            .iter()
            .filter(|h| h.stage == stage)
            .map(|h| h.name.clone())
            .collect()
    }

    /// Run every hook for a stage. Stops at the first failure; a panicking
    /// hook counts as a failure.
    pub fn run(&self, stage: HookStage, plugin_id: &str, path: &Path) -> Result<()> {
        let hooks: Vec<(String, Hook)> = self
            .hooks
            .read()
            .iter()
            .filter(|h| h.stage == stage)
            .map(|h| (h.name.clone(), h.hook.clone()))
            .collect();

        let ctx = HookContext {
            stage,
            plugin_id: plugin_id.to_string(),
            path: path.to_path_buf(),
        };

        for (name, hook) in hooks {
            let outcome = catch_unwind(AssertUnwindSafe(|| hook(&ctx))).unwrap_or_else(|_| {
                Err(Error::execution_failed(format!("hook {} panicked", name)))
            });

            if let Err(e) = outcome {
                tracing::warn!(hook = %name, plugin_id, ?stage, error = %e, "hook failed");
                return Err(e.with_plugin(plugin_id));
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("hook_count", &self.hooks.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_state_transitions() {
        use PluginState as S;

        assert!(S::Unloaded.can_transition_to(S::Loading));
        assert!(S::Loading.can_transition_to(S::Loaded));
        assert!(S::Loaded.can_transition_to(S::Initializing));
        assert!(S::Initializing.can_transition_to(S::Running));
        assert!(S::Running.can_transition_to(S::Paused));
        assert!(S::Paused.can_transition_to(S::Running));
        assert!(S::Running.can_transition_to(S::Reloading));
        assert!(S::Reloading.can_transition_to(S::Running));
        assert!(S::Stopped.can_transition_to(S::Unloaded));
        assert!(S::Error.can_transition_to(S::Unloaded));

        assert!(!S::Unloaded.can_transition_to(S::Running));
        assert!(!S::Stopped.can_transition_to(S::Running));
        assert!(!S::Paused.can_transition_to(S::Reloading));
        assert!(!S::Error.can_transition_to(S::Error));
        assert!(S::Running.check_transition(S::Loading).is_err());
    }

    #[test]
    fn test_any_state_can_fail() {
        use PluginState as S;
        for state in [
            S::Unloaded,
            S::Loading,
            S::Loaded,
            S::Initializing,
            S::Running,
            S::Paused,
            S::Stopping,
            S::Stopped,
            S::Reloading,
        ] {
            assert!(state.can_transition_to(S::Error), "{} -> error", state);
        }
    }

    #[test]
    fn test_instance_ownership_states() {
        assert!(PluginState::Running.holds_instance());
        assert!(PluginState::Reloading.holds_instance());
        assert!(!PluginState::Stopped.holds_instance());
        assert!(!PluginState::Error.holds_instance());
        assert!(!PluginState::Unloaded.holds_instance());
    }

    #[test]
    fn test_event_bus() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let bus = EventBus::new();
        let id = bus.subscribe(move |_| {
            counter_clone.fetch_add(1, Ordering::Relaxed);
        });
        bus.subscribe(|_| panic!("bad subscriber"));

        bus.emit_loaded("a");
        bus.emit_state_changed("a", PluginState::Loaded, PluginState::Initializing);
        assert_eq!(counter.load(Ordering::Relaxed), 2);

        assert!(bus.unsubscribe(id));
        bus.emit_unloaded("a");
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_hooks_run_in_order_and_stop_on_failure() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let hooks = LifecycleHooks::new();

        for name in ["first", "second"] {
            let seen = seen.clone();
            hooks.register(HookStage::PreLoad, name, move |ctx| {
                seen.lock().push(format!("{}:{}", name, ctx.plugin_id));
                Ok(())
            });
        }
        hooks.register(HookStage::PreLoad, "veto", |_| Err(Error::security_violation("nope")));
        {
            let seen = seen.clone();
            hooks.register(HookStage::PreLoad, "never", move |_| {
                seen.lock().push("never".into());
                Ok(())
            });
        }

        let err = hooks.run(HookStage::PreLoad, "p", Path::new("/p.so")).unwrap_err();
        assert_eq!(err.plugin_id.as_deref(), Some("p"));
        assert_eq!(*seen.lock(), vec!["first:p".to_string(), "second:p".to_string()]);
        assert!(hooks.run(HookStage::PostLoad, "p", Path::new("/p.so")).is_ok());
    }

    #[test]
    fn test_event_info() {
        let event = PluginEvent::StateChanged {
            id: "x".into(),
            old: PluginState::Running,
            new: PluginState::Paused,
            at: Instant::now(),
        };
        assert_eq!(event.plugin_id(), "x");
        assert_eq!(event.event_name(), "plugin_state_changed");
    }
}
