//! Scriptable plugin used by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::lifecycle::PluginState;
use crate::plugin::{commands, Plugin, PluginCapability, PluginHandle, PluginMetadata};
use crate::version::Version;

pub(crate) struct MockPlugin {
    metadata: PluginMetadata,
    state: Mutex<PluginState>,
    config: Mutex<Value>,
    counter: Mutex<u64>,
    fail_initialize: bool,
    fail_shutdown: bool,
    stateful: bool,
    init_delay: Option<std::time::Duration>,
    pub(crate) init_calls: Arc<AtomicUsize>,
    pub(crate) shutdown_calls: Arc<AtomicUsize>,
}

impl MockPlugin {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            metadata: PluginMetadata::new(id, Version::new(1, 0, 0)),
            state: Mutex::new(PluginState::Loaded),
            config: Mutex::new(json!({})),
            counter: Mutex::new(0),
            fail_initialize: false,
            fail_shutdown: false,
            stateful: false,
            init_delay: None,
            init_calls: Arc::new(AtomicUsize::new(0)),
            shutdown_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn with_dependency(mut self, id: &str) -> Self {
        self.metadata.dependencies.push(id.to_string());
        self
    }

    pub(crate) fn with_capabilities(mut self, caps: PluginCapability) -> Self {
        self.metadata.capabilities |= caps;
        self
    }

    pub(crate) fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    pub(crate) fn failing_shutdown(mut self) -> Self {
        self.fail_shutdown = true;
        self
    }

    pub(crate) fn stateful(mut self) -> Self {
        self.stateful = true;
        self
    }

    pub(crate) fn with_init_delay(mut self, delay: std::time::Duration) -> Self {
        self.init_delay = Some(delay);
        self
    }

    pub(crate) fn into_handle(self) -> PluginHandle {
        Arc::new(self)
    }
}

impl Plugin for MockPlugin {
    fn metadata(&self) -> PluginMetadata {
        self.metadata.clone()
    }

    fn initialize(&self) -> Result<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.init_delay {
            std::thread::sleep(delay);
        }
        if self.fail_initialize {
            *self.state.lock() = PluginState::Error;
            return Err(Error::init_failed("mock refused to start"));
        }
        *self.state.lock() = PluginState::Running;
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == PluginState::Stopped {
            return Ok(());
        }
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_shutdown {
            return Err(Error::execution_failed("mock shutdown failed"));
        }
        *state = PluginState::Stopped;
        Ok(())
    }

    fn state(&self) -> PluginState {
        *self.state.lock()
    }

    fn execute_command(&self, name: &str, params: &Value) -> Result<Value> {
        match name {
            "echo" => Ok(params.clone()),
            "increment" => {
                let mut counter = self.counter.lock();
                *counter += 1;
                Ok(json!({ "counter": *counter }))
            }
            "fail" => Err(Error::execution_failed("mock command failed")),
            commands::SAVE_STATE if self.stateful => {
                Ok(json!({ "counter": *self.counter.lock() }))
            }
            commands::RESTORE_STATE if self.stateful => {
                let value = params.get("counter").and_then(Value::as_u64).unwrap_or(0);
                *self.counter.lock() = value;
                Ok(Value::Null)
            }
            commands::GET_METRICS
                if self.metadata.capabilities.contains(PluginCapability::MONITORING) =>
            {
                Ok(json!({ "requests": *self.counter.lock() }))
            }
            other => Err(Error::command_not_found(other)),
        }
    }

    fn available_commands(&self) -> Vec<String> {
        let mut names = vec!["echo".to_string(), "increment".to_string(), "fail".to_string()];
        if self.stateful {
            names.push(commands::SAVE_STATE.to_string());
            names.push(commands::RESTORE_STATE.to_string());
        }
        names
    }

    fn configure(&self, config: &Value) -> Result<()> {
        if config.get("reject").is_some() {
            return Err(Error::new(
                crate::error::ErrorCode::ConfigurationError,
                "mock rejected configuration",
            ));
        }
        *self.config.lock() = config.clone();
        Ok(())
    }

    fn get_configuration(&self) -> Value {
        self.config.lock().clone()
    }
}
