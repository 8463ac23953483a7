//! Hot reload: maps file changes to plugin reloads.
//!
//! Changes arrive either from the `notify` backend (feature `watch`) or from
//! an embedder calling [`HotReloadWatcher::handle_path_change`] directly.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};

/// Configuration for the hot-reload watcher.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchConfig {
    /// Changes to the same path closer together than this are dropped.
    pub debounce: Duration,
    /// Watch directories recursively.
    pub recursive: bool,
    /// Extensions that count as plugin files. Empty means any.
    pub extensions: Vec<String>,
    /// Invoke the reload callback on change.
    pub auto_reload: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            recursive: true,
            extensions: Vec::new(),
            auto_reload: true,
        }
    }
}

impl WatchConfig {
    /// Create a new watch configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the debounce duration.
    pub fn with_debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    /// Set recursive watching.
    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Set file extensions to watch.
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Set auto-reload behavior.
    pub fn with_auto_reload(mut self, auto: bool) -> Self {
        self.auto_reload = auto;
        self
    }
}

/// A file-system change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A file was created.
    Created {
        /// Path to the created file.
        path: PathBuf,
    },
    /// A file was modified.
    Modified {
        /// Path to the modified file.
        path: PathBuf,
    },
    /// A file was removed.
    Removed {
        /// Path to the removed file.
        path: PathBuf,
    },
    /// A file was renamed.
    Renamed {
        /// Old path.
        from: PathBuf,
        /// New path.
        to: PathBuf,
    },
}

impl WatchEvent {
    /// Get the primary path for this event.
    pub fn path(&self) -> &Path {
        match self {
            Self::Created { path } | Self::Modified { path } | Self::Removed { path } => path,
            Self::Renamed { to, .. } => to,
        }
    }

    /// Check if this event affects a file with one of the given extensions.
    /// An empty list matches everything.
    pub fn matches_extension(&self, extensions: &[String]) -> bool {
        if extensions.is_empty() {
            return true;
        }
        self.path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| extensions.iter().any(|e| e == ext))
            .unwrap_or(false)
    }
}

/// Invoked with a plugin id when its file changes.
pub type ReloadCallback = Arc<dyn Fn(&str) -> Result<()> + Send + Sync>;

type EventHandler = Arc<dyn Fn(&WatchEvent) + Send + Sync>;

#[derive(Debug, Clone)]
struct WatchedPlugin {
    id: String,
    path: PathBuf,
    enabled: bool,
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

struct Inner {
    config: RwLock<WatchConfig>,
    by_path: DashMap<PathBuf, WatchedPlugin>,
    by_id: DashMap<String, PathBuf>,
    directories: RwLock<Vec<PathBuf>>,
    last_events: Mutex<HashMap<PathBuf, Instant>>,
    reload: RwLock<Option<ReloadCallback>>,
    handlers: RwLock<Vec<EventHandler>>,
}

impl Inner {
    fn debounced(&self, path: &Path) -> bool {
        let debounce = self.config.read().debounce;
        let mut last = self.last_events.lock();
        let now = Instant::now();
        if let Some(at) = last.get(path) {
            if now.duration_since(*at) < debounce {
                return true;
            }
        }
        last.insert(path.to_path_buf(), now);
        false
    }

    fn notify_handlers(&self, event: &WatchEvent) {
        let handlers: Vec<EventHandler> = self.handlers.read().clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!(path = %event.path().display(), "watch handler panicked");
            }
        }
    }

    fn handle_path_change(&self, path: &Path) -> Option<String> {
        let key = normalize(path);
        let watched = self.by_path.get(&key).map(|w| w.clone())?;

        if !watched.enabled {
            tracing::debug!(plugin_id = %watched.id, "hot reload disabled; ignoring change");
            return None;
        }
        if self.debounced(&key) {
            tracing::debug!(plugin_id = %watched.id, "change debounced");
            return None;
        }
        if !self.config.read().auto_reload {
            return None;
        }

        let callback = self.reload.read().clone()?;
        tracing::info!(plugin_id = %watched.id, path = %key.display(), "plugin file changed, reloading");

        match catch_unwind(AssertUnwindSafe(|| callback(&watched.id))) {
            Ok(Ok(())) => Some(watched.id),
            Ok(Err(e)) => {
                tracing::error!(plugin_id = %watched.id, error = %e, "hot reload failed");
                None
            }
            Err(_) => {
                tracing::error!(plugin_id = %watched.id, "reload callback panicked");
                None
            }
        }
    }

    fn handle_event(&self, event: &WatchEvent) -> Option<String> {
        if !event.matches_extension(&self.config.read().extensions) {
            return None;
        }
        self.notify_handlers(event);

        match event {
            WatchEvent::Created { path } | WatchEvent::Modified { path } => {
                self.handle_path_change(path)
            }
            WatchEvent::Renamed { to, .. } => self.handle_path_change(to),
            WatchEvent::Removed { path } => {
                if let Some(w) = self.by_path.get(&normalize(path)) {
                    tracing::warn!(plugin_id = %w.id, path = %path.display(), "plugin file removed");
                }
                None
            }
        }
    }
}

/// Watches plugin files and directories and reloads plugins on change.
pub struct HotReloadWatcher {
    inner: Arc<Inner>,
    running: AtomicBool,
    #[cfg(feature = "watch")]
    backend: Mutex<Option<notify::RecommendedWatcher>>,
}

impl HotReloadWatcher {
    /// Create a new watcher.
    pub fn new(config: WatchConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                by_path: DashMap::new(),
                by_id: DashMap::new(),
                directories: RwLock::new(Vec::new()),
                last_events: Mutex::new(HashMap::new()),
                reload: RwLock::new(None),
                handlers: RwLock::new(Vec::new()),
            }),
            running: AtomicBool::new(false),
            #[cfg(feature = "watch")]
            backend: Mutex::new(None),
        }
    }

    /// Create with default configuration.
    pub fn default_config() -> Self {
        Self::new(WatchConfig::default())
    }

    /// Current configuration.
    pub fn config(&self) -> WatchConfig {
        self.inner.config.read().clone()
    }

    /// Check if the file-system backend is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Set the callback invoked with a plugin id when its file changes.
    pub fn set_reload_callback<F>(&self, callback: F)
    where
        F: Fn(&str) -> Result<()> + Send + Sync + 'static,
    {
        *self.inner.reload.write() = Some(Arc::new(callback));
    }

    /// Observe every matching file-system event.
    pub fn on_change<F>(&self, handler: F)
    where
        F: Fn(&WatchEvent) + Send + Sync + 'static,
    {
        self.inner.handlers.write().push(Arc::new(handler));
    }

    /// Track a plugin file.
    pub fn register_plugin(&self, id: &str, path: &Path) -> Result<()> {
        let path = normalize(path);
        if let Some(previous) = self.inner.by_id.insert(id.to_string(), path.clone()) {
            self.inner.by_path.remove(&previous);
        }
        self.inner.by_path.insert(
            path.clone(),
            WatchedPlugin {
                id: id.to_string(),
                path: path.clone(),
                enabled: true,
            },
        );

        if self.is_running() {
            self.backend_watch(&path, false)?;
        }
        tracing::debug!(plugin_id = id, path = %path.display(), "watching plugin file");
        Ok(())
    }

    /// Stop tracking a plugin. Returns whether it was tracked.
    pub fn unregister_plugin(&self, id: &str) -> bool {
        let Some((_, path)) = self.inner.by_id.remove(id) else {
            return false;
        };
        self.inner.by_path.remove(&path);
        self.inner.last_events.lock().remove(&path);
        if self.is_running() {
            self.backend_unwatch(&path);
        }
        true
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let path = self
            .inner
            .by_id
            .get(id)
            .map(|p| p.clone())
            .ok_or_else(|| Error::plugin_not_found(id))?;
        if let Some(mut watched) = self.inner.by_path.get_mut(&path) {
            watched.enabled = enabled;
        }
        Ok(())
    }

    /// Resume reloading a tracked plugin.
    pub fn enable(&self, id: &str) -> Result<()> {
        self.set_enabled(id, true)
    }

    /// Pause reloading a tracked plugin without forgetting it.
    pub fn disable(&self, id: &str) -> Result<()> {
        self.set_enabled(id, false)
    }

    /// Whether a tracked plugin reloads on change.
    pub fn is_enabled(&self, id: &str) -> bool {
        self.inner
            .by_id
            .get(id)
            .and_then(|p| self.inner.by_path.get(&*p).map(|w| w.enabled))
            .unwrap_or(false)
    }

    /// Whether a plugin is tracked.
    pub fn is_watching(&self, id: &str) -> bool {
        self.inner.by_id.contains_key(id)
    }

    /// Tracked plugin files.
    pub fn watched_files(&self) -> Vec<PathBuf> {
        self.inner.by_path.iter().map(|w| w.path.clone()).collect()
    }

    /// Watch a directory for new and changed files.
    pub fn watch_directory(&self, dir: &Path) -> Result<()> {
        if !dir.is_dir() {
            return Err(Error::file_not_found(dir.display()));
        }
        let dir = normalize(dir);
        {
            let mut dirs = self.inner.directories.write();
            if dirs.contains(&dir) {
                return Ok(());
            }
            dirs.push(dir.clone());
        }
        if self.is_running() {
            self.backend_watch(&dir, true)?;
        }
        tracing::debug!(path = %dir.display(), "watching plugin directory");
        Ok(())
    }

    /// Stop watching a directory.
    pub fn unwatch_directory(&self, dir: &Path) -> bool {
        let dir = normalize(dir);
        let removed = {
            let mut dirs = self.inner.directories.write();
            let before = dirs.len();
            dirs.retain(|d| *d != dir);
            dirs.len() != before
        };
        if removed && self.is_running() {
            self.backend_unwatch(&dir);
        }
        removed
    }

    /// Watched directories.
    pub fn watched_directories(&self) -> Vec<PathBuf> {
        self.inner.directories.read().clone()
    }

    /// Report a change to `path`. Returns the id of the plugin that was
    /// reloaded, if any.
    pub fn handle_path_change(&self, path: &Path) -> Option<String> {
        self.inner.handle_path_change(path)
    }

    /// Dispatch a file-system event.
    pub fn handle_event(&self, event: &WatchEvent) -> Option<String> {
        self.inner.handle_event(event)
    }

    /// Start the file-system backend.
    #[cfg(feature = "watch")]
    pub fn start(&self) -> Result<()> {
        use notify::{Config, Event, RecommendedWatcher, Watcher};

        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let inner = Arc::downgrade(&self.inner);
        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                match res {
                    Ok(event) => {
                        if let Some(event) = translate(event) {
                            inner.handle_event(&event);
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "file watcher error"),
                }
            },
            Config::default(),
        )
        .map_err(|e| {
            self.running.store(false, Ordering::SeqCst);
            watch_error(e)
        })?;

        *self.backend.lock() = Some(watcher);

        let files = self.watched_files();
        let dirs = self.watched_directories();
        for file in files {
            self.backend_watch(&file, false)?;
        }
        for dir in dirs {
            self.backend_watch(&dir, true)?;
        }

        tracing::info!("hot-reload watcher started");
        Ok(())
    }

    /// Without a file-system backend, changes must be reported through
    /// [`handle_path_change`](Self::handle_path_change).
    #[cfg(not(feature = "watch"))]
    pub fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        tracing::debug!("hot-reload watcher started without a file-system backend");
        Ok(())
    }

    /// Stop the file-system backend. Tracked plugins are kept.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        #[cfg(feature = "watch")]
        {
            *self.backend.lock() = None;
        }
        tracing::info!("hot-reload watcher stopped");
    }

    #[cfg(feature = "watch")]
    fn backend_watch(&self, path: &Path, directory: bool) -> Result<()> {
        use notify::{RecursiveMode, Watcher};

        let mode = if directory && self.inner.config.read().recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        if let Some(watcher) = self.backend.lock().as_mut() {
            watcher.watch(path, mode).map_err(watch_error)?;
        }
        Ok(())
    }

    #[cfg(not(feature = "watch"))]
    fn backend_watch(&self, _path: &Path, _directory: bool) -> Result<()> {
        Ok(())
    }

    #[cfg(feature = "watch")]
    fn backend_unwatch(&self, path: &Path) {
        use notify::Watcher;

        if let Some(watcher) = self.backend.lock().as_mut() {
            if let Err(e) = watcher.unwatch(path) {
                tracing::debug!(path = %path.display(), error = %e, "unwatch failed");
            }
        }
    }

    #[cfg(not(feature = "watch"))]
    fn backend_unwatch(&self, _path: &Path) {}
}

#[cfg(feature = "watch")]
fn watch_error(e: notify::Error) -> Error {
    Error::new(crate::error::ErrorCode::SystemError, format!("file watcher: {}", e))
}

#[cfg(feature = "watch")]
fn translate(event: notify::Event) -> Option<WatchEvent> {
    use notify::event::{ModifyKind, RenameMode};
    use notify::EventKind;

    let first = event.paths.first()?.clone();
    match event.kind {
        EventKind::Create(_) => Some(WatchEvent::Created { path: first }),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            Some(WatchEvent::Renamed {
                from: first,
                to: event.paths[1].clone(),
            })
        }
        EventKind::Modify(_) => Some(WatchEvent::Modified { path: first }),
        EventKind::Remove(_) => Some(WatchEvent::Removed { path: first }),
        _ => None,
    }
}

impl Default for HotReloadWatcher {
    fn default() -> Self {
        Self::default_config()
    }
}

impl std::fmt::Debug for HotReloadWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotReloadWatcher")
            .field("config", &*self.inner.config.read())
            .field("running", &self.is_running())
            .field("plugins", &self.inner.by_id.len())
            .field("directories", &self.inner.directories.read().len())
            .finish()
    }
}

impl Drop for HotReloadWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
