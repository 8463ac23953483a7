//! Plugin loaders: the collaborator that turns a file into a live instance.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use libloading::{Library, Symbol};
use parking_lot::Mutex;

use crate::error::{Error, ErrorCode, Result};
use crate::plugin::{
    PluginAbiVersion, PluginCreate, PluginHandle, PluginMetadata, PLUGIN_ABI_VERSION,
};

/// Hit/miss counters for a loader's metadata cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderCacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that read from disk.
    pub misses: u64,
}

/// Maps files to live plugin instances.
///
/// The manager is agnostic of the plugin format; everything format-specific
/// lives behind this trait.
pub trait PluginLoader: Send + Sync {
    /// Whether `path` is a file this loader understands.
    fn can_load(&self, path: &Path) -> bool;

    /// Create a plugin instance from `path`.
    fn load(&self, path: &Path) -> Result<PluginHandle>;

    /// Release whatever the loader holds for `plugin_id`.
    fn unload(&self, plugin_id: &str) -> Result<()>;

    /// File extensions (without dot) this loader accepts.
    fn supported_extensions(&self) -> Vec<String>;

    /// Loader name for diagnostics.
    fn name(&self) -> &str;

    /// Whether loaded files may be replaced while the host runs.
    fn supports_hot_reload(&self) -> bool;

    /// Read metadata without loading the plugin.
    fn read_metadata(&self, path: &Path) -> Result<PluginMetadata> {
        Err(Error::not_implemented(format!(
            "{} cannot read metadata for {}",
            self.name(),
            path.display()
        )))
    }

    /// Load several files. The default loads them one after another.
    fn load_batch(&self, paths: &[PathBuf]) -> Vec<Result<PluginHandle>> {
        paths.iter().map(|p| self.load(p)).collect()
    }

    /// Unload several plugins.
    fn unload_batch(&self, plugin_ids: &[String]) -> Vec<Result<()>> {
        plugin_ids.iter().map(|id| self.unload(id)).collect()
    }

    /// Metadata cache counters.
    fn cache_stats(&self) -> LoaderCacheStats {
        LoaderCacheStats::default()
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn matches_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Constructor registered with a [`FactoryLoader`].
pub type PluginFactory = Arc<dyn Fn() -> Result<PluginHandle> + Send + Sync>;

/// Loader for plugins compiled into the host.
///
/// Each factory is bound to a file path; the file acts as the plugin's
/// on-disk identity (hashing, hot reload, discovery) while the instance is
/// built in-process.
pub struct FactoryLoader {
    name: String,
    extensions: Vec<String>,
    hot_reload: bool,
    factories: DashMap<PathBuf, PluginFactory>,
    loaded: DashMap<String, PathBuf>,
}

impl FactoryLoader {
    /// Create a loader accepting the given extensions.
    pub fn new(extensions: Vec<String>) -> Self {
        Self {
            name: "factory".to_string(),
            extensions,
            hot_reload: true,
            factories: DashMap::new(),
            loaded: DashMap::new(),
        }
    }

    /// Set hot-reload support.
    pub fn with_hot_reload(mut self, enabled: bool) -> Self {
        self.hot_reload = enabled;
        self
    }

    /// Bind a factory to a file.
    pub fn register<F>(&self, path: impl AsRef<Path>, factory: F)
    where
        F: Fn() -> Result<PluginHandle> + Send + Sync + 'static,
    {
        self.factories
            .insert(normalize(path.as_ref()), Arc::new(factory));
    }

    /// Remove the factory bound to a file.
    pub fn unregister(&self, path: impl AsRef<Path>) -> bool {
        self.factories.remove(&normalize(path.as_ref())).is_some()
    }

    /// Ids currently handed out by this loader.
    pub fn loaded_ids(&self) -> Vec<String> {
        self.loaded.iter().map(|e| e.key().clone()).collect()
    }
}

impl PluginLoader for FactoryLoader {
    fn can_load(&self, path: &Path) -> bool {
        path.is_file()
            && matches_extension(path, &self.extensions)
            && self.factories.contains_key(&normalize(path))
    }

    fn load(&self, path: &Path) -> Result<PluginHandle> {
        if !path.exists() {
            return Err(Error::file_not_found(path.display()));
        }

        let key = normalize(path);
        let factory = self
            .factories
            .get(&key)
            .map(|f| f.value().clone())
            .ok_or_else(|| {
                Error::load_failed(format!("no factory registered for {}", path.display()))
            })?;

        let plugin = catch_unwind(AssertUnwindSafe(|| factory())).unwrap_or_else(|_| {
            Err(Error::load_failed(format!(
                "plugin factory for {} panicked",
                path.display()
            )))
        })?;

        let id = plugin.id();
        if self.loaded.contains_key(&id) {
            return Err(Error::load_failed(format!("plugin id {} is already loaded", id))
                .with_plugin(id));
        }
        self.loaded.insert(id, key);
        Ok(plugin)
    }

    fn unload(&self, plugin_id: &str) -> Result<()> {
        self.loaded
            .remove(plugin_id)
            .map(|_| ())
            .ok_or_else(|| {
                Error::new(ErrorCode::UnloadFailed, format!("{} was not loaded", plugin_id))
                    .with_plugin(plugin_id)
            })
    }

    fn supported_extensions(&self) -> Vec<String> {
        self.extensions.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supports_hot_reload(&self) -> bool {
        self.hot_reload
    }
}

impl std::fmt::Debug for FactoryLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryLoader")
            .field("extensions", &self.extensions)
            .field("factories", &self.factories.len())
            .field("loaded", &self.loaded.len())
            .finish()
    }
}

/// Configuration for the dynamic library loader.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Accepted file extensions.
    pub extensions: Vec<String>,
    /// Whether to require a matching `_plugin_abi_version` export.
    pub check_abi_version: bool,
    /// Whether loaded libraries may be replaced on disk.
    pub hot_reload: bool,
    /// Worker threads used by batch loads.
    pub parallelism: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            extensions: vec![std::env::consts::DLL_EXTENSION.to_string()],
            check_abi_version: true,
            hot_reload: true,
            parallelism: 4,
        }
    }
}

impl LoaderConfig {
    /// Create a new loader configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set accepted extensions.
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Enable or disable the ABI version check.
    pub fn with_abi_check(mut self, check: bool) -> Self {
        self.check_abi_version = check;
        self
    }

    /// Set hot-reload support.
    pub fn with_hot_reload(mut self, hot_reload: bool) -> Self {
        self.hot_reload = hot_reload;
        self
    }

    /// Set the batch-load thread count.
    pub fn with_parallelism(mut self, threads: usize) -> Self {
        self.parallelism = threads.max(1);
        self
    }
}

// Field order matters: the plugin must drop before its library.
struct LoadedLibrary {
    plugin: PluginHandle,
    library: Library,
}

/// Loader for native dynamic libraries built with
/// [`declare_plugin!`](crate::declare_plugin).
pub struct DylibLoader {
    config: LoaderConfig,
    libraries: Mutex<HashMap<String, LoadedLibrary>>,
    retired: Mutex<Vec<Library>>,
    metadata_cache: DashMap<PathBuf, (SystemTime, PluginMetadata)>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl DylibLoader {
    /// Create a new dynamic library loader.
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            libraries: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
            metadata_cache: DashMap::new(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    /// Get the loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Number of libraries currently open for live plugins.
    pub fn open_libraries(&self) -> usize {
        self.libraries.lock().len()
    }

    fn open(&self, path: &Path) -> Result<(PluginHandle, Library)> {
        // SAFETY: loading a library runs its initializers; plugins are trusted
        // to the same degree as the host binary.
        let library = unsafe { Library::new(path) }.map_err(|e| {
            Error::load_failed(format!("failed to open {}: {}", path.display(), e))
        })?;

        if self.config.check_abi_version {
            // SAFETY: the symbol type matches the signature `declare_plugin!` exports.
            let abi = unsafe {
                let symbol: Symbol<'_, PluginAbiVersion> =
                    library.get(b"_plugin_abi_version").map_err(|e| {
                        Error::load_failed(format!("missing ABI version symbol: {}", e))
                    })?;
                symbol()
            };
            if abi != PLUGIN_ABI_VERSION {
                return Err(Error::load_failed(format!(
                    "{} has ABI {}, host expects {}",
                    path.display(),
                    abi,
                    PLUGIN_ABI_VERSION
                )));
            }
        }

        // SAFETY: `_plugin_create` returns a pointer obtained from `Box::into_raw`.
        let plugin: PluginHandle = unsafe {
            let constructor: Symbol<'_, PluginCreate> = library
                .get(b"_plugin_create")
                .map_err(|e| Error::load_failed(format!("missing constructor symbol: {}", e)))?;

            let raw = constructor();
            if raw.is_null() {
                return Err(Error::load_failed("plugin constructor returned null"));
            }
            Arc::from(Box::from_raw(raw))
        };

        Ok((plugin, library))
    }

    fn sidecar(path: &Path) -> Option<PathBuf> {
        ["toml", "json"]
            .iter()
            .map(|ext| path.with_extension(ext))
            .find(|p| p.is_file())
    }
}

impl PluginLoader for DylibLoader {
    fn can_load(&self, path: &Path) -> bool {
        path.is_file() && matches_extension(path, &self.config.extensions)
    }

    fn load(&self, path: &Path) -> Result<PluginHandle> {
        if !path.exists() {
            return Err(Error::file_not_found(path.display()));
        }

        let (plugin, library) = self.open(path)?;
        let id = plugin.id();

        let mut libraries = self.libraries.lock();
        if libraries.contains_key(&id) {
            drop(plugin);
            drop(library);
            return Err(Error::load_failed(format!("plugin id {} is already loaded", id))
                .with_plugin(id));
        }

        libraries.insert(
            id.clone(),
            LoadedLibrary {
                plugin: plugin.clone(),
                library,
            },
        );
        tracing::debug!(plugin_id = %id, path = %path.display(), "opened plugin library");

        Ok(plugin)
    }

    fn unload(&self, plugin_id: &str) -> Result<()> {
        let entry = self.libraries.lock().remove(plugin_id).ok_or_else(|| {
            Error::new(ErrorCode::UnloadFailed, format!("{} was not loaded", plugin_id))
                .with_plugin(plugin_id)
        })?;

        let LoadedLibrary { plugin, library } = entry;
        if Arc::strong_count(&plugin) > 1 {
            // Someone still holds the instance; its code must stay mapped.
            tracing::warn!(plugin_id, "plugin still referenced, keeping library mapped");
            drop(plugin);
            self.retired.lock().push(library);
        } else {
            drop(plugin);
            drop(library);
        }

        Ok(())
    }

    fn supported_extensions(&self) -> Vec<String> {
        self.config.extensions.clone()
    }

    fn name(&self) -> &str {
        "dylib"
    }

    fn supports_hot_reload(&self) -> bool {
        self.config.hot_reload
    }

    fn read_metadata(&self, path: &Path) -> Result<PluginMetadata> {
        let sidecar = Self::sidecar(path).ok_or_else(|| {
            Error::file_not_found(format!("metadata sidecar for {}", path.display()))
        })?;
        let modified = std::fs::metadata(&sidecar)?.modified()?;

        if let Some(entry) = self.metadata_cache.get(&sidecar) {
            if entry.0 == modified {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.1.clone());
            }
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let metadata = PluginMetadata::from_file(&sidecar)?;
        self.metadata_cache
            .insert(sidecar, (modified, metadata.clone()));
        Ok(metadata)
    }

    fn load_batch(&self, paths: &[PathBuf]) -> Vec<Result<PluginHandle>> {
        let chunk = paths.len().div_ceil(self.config.parallelism.max(1)).max(1);

        std::thread::scope(|scope| {
            let workers: Vec<_> = paths
                .chunks(chunk)
                .map(|slice| scope.spawn(move || slice.iter().map(|p| self.load(p)).collect::<Vec<_>>()))
                .collect();

            workers
                .into_iter()
                .flat_map(|w| {
                    w.join().unwrap_or_else(|_| {
                        vec![Err(Error::load_failed("batch load worker panicked"))]
                    })
                })
                .collect()
        })
    }

    fn cache_stats(&self) -> LoaderCacheStats {
        LoaderCacheStats {
            hits: self.cache_hits.load(Ordering::Relaxed),
            misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for DylibLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DylibLoader")
            .field("config", &self.config)
            .field("open_libraries", &self.open_libraries())
            .finish()
    }
}

impl Drop for DylibLoader {
    fn drop(&mut self) {
        // Instances may still be alive elsewhere; unmapping their code is unsound.
        for library in self.retired.lock().drain(..) {
            std::mem::forget(library);
        }
        for (_, entry) in self.libraries.lock().drain() {
            let LoadedLibrary { plugin, library } = entry;
            let shared = Arc::strong_count(&plugin) > 1;
            drop(plugin);
            if shared {
                std::mem::forget(library);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPlugin;
    use std::io::Write;

    #[test]
    fn test_loader_config_builder() {
        let config = LoaderConfig::new()
            .with_abi_check(false)
            .with_parallelism(0)
            .with_extensions(vec!["plug".into()]);

        assert!(!config.check_abi_version);
        assert_eq!(config.parallelism, 1);
        assert_eq!(config.extensions, vec!["plug".to_string()]);
    }

    #[test]
    fn test_factory_loader_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha.plug");
        std::fs::write(&path, b"alpha").unwrap();

        let loader = FactoryLoader::new(vec!["plug".into()]);
        assert!(!loader.can_load(&path));

        loader.register(&path, || Ok(MockPlugin::new("alpha").into_handle()));
        assert!(loader.can_load(&path));

        let plugin = loader.load(&path).unwrap();
        assert_eq!(plugin.id(), "alpha");
        assert_eq!(loader.loaded_ids(), vec!["alpha".to_string()]);

        loader.unload("alpha").unwrap();
        assert!(loader.unload("alpha").is_err());
    }

    #[test]
    fn test_factory_loader_rejects_wrong_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha.txt");
        std::fs::write(&path, b"alpha").unwrap();

        let loader = FactoryLoader::new(vec!["plug".into()]);
        loader.register(&path, || Ok(MockPlugin::new("alpha").into_handle()));
        assert!(!loader.can_load(&path));
    }

    #[test]
    fn test_factory_panic_becomes_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boom.plug");
        std::fs::write(&path, b"boom").unwrap();

        let loader = FactoryLoader::new(vec!["plug".into()]);
        loader.register(&path, || panic!("constructor exploded"));

        let err = loader.load(&path).err().unwrap();
        assert_eq!(err.code(), ErrorCode::LoadFailed);
    }

    #[test]
    fn test_dylib_loader_missing_file() {
        let loader = DylibLoader::new(LoaderConfig::default());
        let err = loader.load(Path::new("/definitely/not/here.so")).err().unwrap();
        assert_eq!(err.code(), ErrorCode::FileNotFound);
    }

    #[test]
    fn test_dylib_loader_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join(format!("garbage.{}", std::env::consts::DLL_EXTENSION));
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"not a library")
            .unwrap();

        let loader = DylibLoader::new(LoaderConfig::default());
        assert!(loader.can_load(&path));
        let err = loader.load(&path).err().unwrap();
        assert_eq!(err.code(), ErrorCode::LoadFailed);
        assert_eq!(loader.open_libraries(), 0);
    }

    #[test]
    fn test_dylib_metadata_cache() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("meta.so");
        std::fs::write(&lib, b"").unwrap();
        std::fs::write(
            dir.path().join("meta.toml"),
            "name = \"meta\"\nversion = \"1.0.0\"\n",
        )
        .unwrap();

        let loader = DylibLoader::new(LoaderConfig::default());
        let first = loader.read_metadata(&lib).unwrap();
        let second = loader.read_metadata(&lib).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.name, "meta");
        assert_eq!(loader.cache_stats(), LoaderCacheStats { hits: 1, misses: 1 });
    }
}
