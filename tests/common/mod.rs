//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use plugin_host_runtime::{
    commands, Error, ErrorCode, FactoryLoader, ManagerConfig, Plugin, PluginManager,
    PluginHandle, PluginMetadata, PluginState, Result, Version,
};
use serde_json::{json, Value};

/// Small plugin with a counter that survives reloads.
pub struct TestPlugin {
    metadata: PluginMetadata,
    state: Mutex<PluginState>,
    count: Mutex<u64>,
    broken: bool,
}

impl TestPlugin {
    pub fn new(id: &str) -> Self {
        Self {
            metadata: PluginMetadata::new(id, Version::new(1, 0, 0)),
            state: Mutex::new(PluginState::Loaded),
            count: Mutex::new(0),
            broken: false,
        }
    }

    pub fn depends_on(mut self, id: &str) -> Self {
        self.metadata = self.metadata.with_dependency(id);
        self
    }

    /// Fails in `initialize`.
    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }
}

impl Plugin for TestPlugin {
    fn metadata(&self) -> PluginMetadata {
        self.metadata.clone()
    }

    fn initialize(&self) -> Result<()> {
        if self.broken {
            return Err(Error::init_failed("broken on purpose"));
        }
        *self.state.lock() = PluginState::Running;
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        *self.state.lock() = PluginState::Stopped;
        Ok(())
    }

    fn state(&self) -> PluginState {
        *self.state.lock()
    }

    fn execute_command(&self, name: &str, params: &Value) -> Result<Value> {
        match name {
            "count" => {
                let mut count = self.count.lock();
                *count += 1;
                Ok(json!(*count))
            }
            commands::SAVE_STATE => Ok(json!({ "count": *self.count.lock() })),
            commands::RESTORE_STATE => {
                *self.count.lock() = params["count"].as_u64().unwrap_or(0);
                Ok(Value::Null)
            }
            other => Err(Error::new(ErrorCode::CommandNotFound, format!("unknown command {}", other))),
        }
    }
}

/// A manager over a temp directory of `.plug` files backed by factories.
pub struct Host {
    pub dir: tempfile::TempDir,
    pub loader: Arc<FactoryLoader>,
    pub manager: Arc<PluginManager>,
}

impl Host {
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(FactoryLoader::new(vec!["plug".to_string()]));
        let manager = PluginManager::builder()
            .with_config(config.with_search_path(dir.path()))
            .with_shared_loader(loader.clone())
            .build()
            .unwrap();
        Self { dir, loader, manager }
    }

    /// Write `<name>.plug` and bind it to `make`.
    pub fn plugin<F>(&self, name: &str, make: F) -> PathBuf
    where
        F: Fn() -> TestPlugin + Send + Sync + 'static,
    {
        let path = self.dir.path().join(format!("{}.plug", name));
        std::fs::write(&path, format!("plugin {}", name)).unwrap();
        self.loader.register(&path, move || {
            let plugin: PluginHandle = Arc::new(make());
            Ok(plugin)
        });
        path
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

pub fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}
