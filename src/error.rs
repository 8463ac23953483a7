//! Error types for plugin host operations.

use std::fmt;

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of every failure the host can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A file or directory does not exist.
    FileNotFound,
    /// Malformed input (version string, JSON, TOML, metadata).
    InvalidFormat,
    /// The loader or registry refused to load a plugin.
    LoadFailed,
    /// The loader failed to release a plugin.
    UnloadFailed,
    /// Illegal state transition.
    StateError,
    /// A plugin failed to initialize.
    InitializationFailed,
    /// A plugin command failed.
    ExecutionFailed,
    /// A plugin rejected its configuration.
    ConfigurationError,
    /// Configuration did not have the expected shape.
    InvalidConfiguration,
    /// A declared dependency is absent, or dependents block an unload.
    DependencyMissing,
    /// The dependency graph contains a cycle.
    CircularDependency,
    /// No plugin with the given id.
    PluginNotFound,
    /// The plugin does not support a command.
    CommandNotFound,
    /// Parameters rejected by a command or an operation.
    InvalidParameters,
    /// The entity already exists.
    AlreadyExists,
    /// The entity does not exist.
    NotFound,
    /// An integrity or validator check failed.
    SecurityViolation,
    /// An operation did not finish in time.
    Timeout,
    /// Unexpected system failure.
    SystemError,
    /// The requested behavior is reserved.
    NotImplemented,
    /// Requested plugin version is not installed.
    VersionNotFound,
    /// The version is already installed.
    VersionAlreadyExists,
    /// Versions cannot coexist.
    IncompatibleVersion,
    /// A data migration failed.
    MigrationFailed,
    /// Restoring a previous version failed.
    RollbackFailed,
    /// Creating a backup failed.
    BackupFailed,
    /// Installed files are missing or damaged.
    CorruptedInstallation,
    /// Version dependencies conflict.
    DependencyConflict,
    /// The process lacks filesystem permissions.
    InsufficientPermissions,
    /// Reading or writing version storage failed.
    StorageError,
    /// A migration script is malformed.
    InvalidMigrationScript,
    /// The operation targets the active version.
    ActiveVersionConflict,
}

impl ErrorCode {
    /// Name of the code as used in logs and messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileNotFound => "FileNotFound",
            Self::InvalidFormat => "InvalidFormat",
            Self::LoadFailed => "LoadFailed",
            Self::UnloadFailed => "UnloadFailed",
            Self::StateError => "StateError",
            Self::InitializationFailed => "InitializationFailed",
            Self::ExecutionFailed => "ExecutionFailed",
            Self::ConfigurationError => "ConfigurationError",
            Self::InvalidConfiguration => "InvalidConfiguration",
            Self::DependencyMissing => "DependencyMissing",
            Self::CircularDependency => "CircularDependency",
            Self::PluginNotFound => "PluginNotFound",
            Self::CommandNotFound => "CommandNotFound",
            Self::InvalidParameters => "InvalidParameters",
            Self::AlreadyExists => "AlreadyExists",
            Self::NotFound => "NotFound",
            Self::SecurityViolation => "SecurityViolation",
            Self::Timeout => "Timeout",
            Self::SystemError => "SystemError",
            Self::NotImplemented => "NotImplemented",
            Self::VersionNotFound => "VersionNotFound",
            Self::VersionAlreadyExists => "VersionAlreadyExists",
            Self::IncompatibleVersion => "IncompatibleVersion",
            Self::MigrationFailed => "MigrationFailed",
            Self::RollbackFailed => "RollbackFailed",
            Self::BackupFailed => "BackupFailed",
            Self::CorruptedInstallation => "CorruptedInstallation",
            Self::DependencyConflict => "DependencyConflict",
            Self::InsufficientPermissions => "InsufficientPermissions",
            Self::StorageError => "StorageError",
            Self::InvalidMigrationScript => "InvalidMigrationScript",
            Self::ActiveVersionConflict => "ActiveVersionConflict",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by every fallible host operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct Error {
    /// Failure classification.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Plugin the failure relates to, if any.
    pub plugin_id: Option<String>,
    /// Additional diagnostic text.
    pub details: Option<String>,
}

impl Error {
    /// Create an error with a code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            plugin_id: None,
            details: None,
        }
    }

    /// Attach the related plugin id.
    pub fn with_plugin(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }

    /// Attach diagnostic details.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// The error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Create a plugin not found error.
    pub fn plugin_not_found(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(ErrorCode::PluginNotFound, format!("plugin not found: {}", id)).with_plugin(id)
    }

    /// Create a file not found error.
    pub fn file_not_found(path: impl fmt::Display) -> Self {
        Self::new(ErrorCode::FileNotFound, format!("file not found: {}", path))
    }

    /// Create an invalid format error.
    pub fn invalid_format(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidFormat, msg)
    }

    /// Create a load failed error.
    pub fn load_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::LoadFailed, msg)
    }

    /// Create an illegal state transition error.
    pub fn state_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::StateError, msg)
    }

    /// Create an initialization failed error.
    pub fn init_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InitializationFailed, msg)
    }

    /// Create an execution failed error.
    pub fn execution_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExecutionFailed, msg)
    }

    /// Create a command not found error.
    pub fn command_not_found(command: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::CommandNotFound,
            format!("command not supported: {}", command.into()),
        )
    }

    /// Create a dependency missing error.
    pub fn dependency_missing(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::DependencyMissing, msg)
    }

    /// Create a security violation error.
    pub fn security_violation(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::SecurityViolation, msg)
    }

    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::StorageError, msg)
    }

    /// Create a version not found error.
    pub fn version_not_found(id: &str, version: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::VersionNotFound,
            format!("version {} of {} is not installed", version, id),
        )
        .with_plugin(id)
    }

    /// Create a migration failed error.
    pub fn migration_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::MigrationFailed, msg)
    }

    /// Create a not implemented error.
    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotImplemented, msg)
    }

    /// Returns true if the caller may retry or continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::PluginNotFound
                | ErrorCode::CommandNotFound
                | ErrorCode::StateError
                | ErrorCode::Timeout
                | ErrorCode::NotFound
                | ErrorCode::InvalidParameters
        )
    }

    /// Returns true if this error should trigger a reload of the plugin.
    pub fn should_reload(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::ExecutionFailed | ErrorCode::InitializationFailed
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            std::io::ErrorKind::PermissionDenied => ErrorCode::InsufficientPermissions,
            _ => ErrorCode::SystemError,
        };
        Self::new(code, format!("io error: {}", err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_format(format!("json error: {}", err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::invalid_format(format!("toml error: {}", err))
    }
}
