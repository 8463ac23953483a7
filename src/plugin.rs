//! The plugin contract and its descriptive types.

use std::path::Path;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::lifecycle::PluginState;
use crate::version::Version;

/// ABI revision a dynamic library must report to be loaded.
pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Names of the optional commands the host looks for.
pub mod commands {
    /// Returns a snapshot of the plugin's runtime state.
    pub const SAVE_STATE: &str = "save_state";
    /// Restores a snapshot produced by [`SAVE_STATE`].
    pub const RESTORE_STATE: &str = "restore_state";
    /// Returns a plugin-defined metrics object.
    pub const GET_METRICS: &str = "get_metrics";
}

bitflags! {
    /// Capabilities a plugin advertises. Flags combine additively.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PluginCapability: u32 {
        /// No capabilities
        const NONE = 0x0;
        /// Provides user-interface elements
        const UI = 0x0001;
        /// Runs as a background service
        const SERVICE = 0x0002;
        /// Uses the network
        const NETWORK = 0x0004;
        /// Transforms data
        const DATA_PROCESSING = 0x0008;
        /// Hosts scripts
        const SCRIPTING = 0x0010;
        /// Touches the filesystem
        const FILE_SYSTEM = 0x0020;
        /// Talks to a database
        const DATABASE = 0x0040;
        /// Initializes asynchronously
        const ASYNC_INIT = 0x0080;
        /// Survives hot reload
        const HOT_RELOAD = 0x0100;
        /// Accepts configuration
        const CONFIGURATION = 0x0200;
        /// Produces logs
        const LOGGING = 0x0400;
        /// Security-sensitive
        const SECURITY = 0x0800;
        /// Spawns threads
        const THREADING = 0x1000;
        /// Answers the `get_metrics` command
        const MONITORING = 0x2000;
    }
}

impl Default for PluginCapability {
    fn default() -> Self {
        Self::NONE
    }
}

/// Descriptive metadata reported by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Plugin name.
    pub name: String,
    /// Plugin version.
    pub version: Version,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Plugin author.
    #[serde(default)]
    pub author: String,
    /// License identifier.
    #[serde(default)]
    pub license: String,
    /// Free-form category.
    #[serde(default)]
    pub category: String,
    /// Project homepage.
    #[serde(default)]
    pub homepage: String,
    /// Ids of plugins that must be loaded first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Search tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Advertised capabilities.
    #[serde(default)]
    pub capabilities: PluginCapability,
    /// Scheduling priority, higher first.
    #[serde(default)]
    pub priority: i32,
}

impl PluginMetadata {
    /// Create metadata with a name and version.
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            description: String::new(),
            author: String::new(),
            license: String::new(),
            category: String::new(),
            homepage: String::new(),
            dependencies: Vec::new(),
            tags: Vec::new(),
            capabilities: PluginCapability::NONE,
            priority: 0,
        }
    }

    /// Add a dependency.
    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Add capabilities.
    pub fn with_capabilities(mut self, caps: PluginCapability) -> Self {
        self.capabilities |= caps;
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Parse from TOML.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let metadata: Self = toml::from_str(s)?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// Parse from JSON.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let metadata: Self = serde_json::from_str(s)?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("json") => Self::from_json_str(&content),
            _ => Err(Error::invalid_format(format!(
                "unsupported metadata file: {}",
                path.display()
            ))),
        }
    }

    /// Serialize to a JSON value.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_format("plugin metadata has an empty name"));
        }
        if self.dependencies.iter().any(|d| d == &self.name) {
            return Err(Error::invalid_format(format!(
                "plugin {} depends on itself",
                self.name
            )));
        }
        Ok(())
    }
}

/// The contract every loaded plugin implements.
///
/// Methods take `&self`; implementations use interior mutability because the
/// host shares instances through [`PluginHandle`]s.
pub trait Plugin: Send + Sync {
    /// Unique id used as the registry key. Defaults to the metadata name.
    fn id(&self) -> String {
        self.metadata().name
    }

    /// Descriptive metadata.
    fn metadata(&self) -> PluginMetadata;

    /// Bring the plugin into service.
    fn initialize(&self) -> Result<()>;

    /// Release resources. Calling this on a stopped plugin must be a no-op.
    fn shutdown(&self) -> Result<()>;

    /// The plugin's own view of its state.
    fn state(&self) -> PluginState;

    /// Advertised capabilities.
    fn capabilities(&self) -> PluginCapability {
        self.metadata().capabilities
    }

    /// Scheduling priority.
    fn priority(&self) -> i32 {
        self.metadata().priority
    }

    /// Whether `initialize` completed.
    fn is_initialized(&self) -> bool {
        matches!(self.state(), PluginState::Running | PluginState::Paused)
    }

    /// Run a named command.
    fn execute_command(&self, name: &str, _params: &Value) -> Result<Value> {
        Err(Error::command_not_found(name))
    }

    /// Names of supported commands.
    fn available_commands(&self) -> Vec<String> {
        Vec::new()
    }

    /// Apply a configuration object.
    fn configure(&self, _config: &Value) -> Result<()> {
        Ok(())
    }

    /// Current configuration object.
    fn get_configuration(&self) -> Value {
        Value::Object(Default::default())
    }
}

/// Shared handle to a live plugin instance.
pub type PluginHandle = Arc<dyn Plugin>;

/// Signature of the constructor a dynamic library exports.
pub type PluginCreate = unsafe fn() -> *mut dyn Plugin;

/// Signature of the ABI version function a dynamic library exports.
pub type PluginAbiVersion = unsafe extern "C" fn() -> u32;

/// Export a plugin type from a `cdylib` so [`DylibLoader`](crate::DylibLoader)
/// can construct it.
///
/// ```rust,ignore
/// plugin_host_runtime::declare_plugin!(MyPlugin, MyPlugin::new);
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($plugin_type:ty, $constructor:path) => {
        #[no_mangle]
        pub extern "C" fn _plugin_abi_version() -> u32 {
            $crate::PLUGIN_ABI_VERSION
        }

        #[no_mangle]
        pub fn _plugin_create() -> *mut dyn $crate::Plugin {
            let constructor: fn() -> $plugin_type = $constructor;
            let boxed: Box<dyn $crate::Plugin> = Box::new(constructor());
            Box::into_raw(boxed)
        }
    };
}
