//! Error types for buildbuddy

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Result type alias using BuildError
pub type Result<T> = std::result::Result<T, BuildError>;

/// Main error type for build operations.
///
/// Build results travel through shared futures, so the error must be `Clone`.
/// Sources that are not `Clone` themselves are held behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum BuildError {
    /// Graph registration errors
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Configuration-related errors
    #[error(transparent)]
    Config(Arc<ConfigError>),

    /// A build step raised an error while producing its output
    #[error("Build step '{id}' failed: {error:#}")]
    Step { id: String, error: Arc<anyhow::Error> },

    /// A step declined to publish but there is no previous output to fall back to
    #[error("Build step '{0}' did not publish and no consistent previous output exists")]
    NotPublished(String),

    /// A node's task panicked or was cancelled by the runtime
    #[error("Task '{id}' aborted: {message}")]
    Panicked { id: String, message: String },

    /// IO errors
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// Checksum record (de)serialization errors
    #[error("Checksum record error at {path}: {message}")]
    Record { path: PathBuf, message: String },
}

impl BuildError {
    /// Wrap a step failure
    pub fn step(id: impl Into<String>, error: anyhow::Error) -> Self {
        Self::Step {
            id: id.into(),
            error: Arc::new(error),
        }
    }

    /// Whether this error stems from how the build was set up rather than
    /// from running it. Such errors are never worth retrying.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Graph(_) | Self::Config(_) | Self::NotPublished(_)
        )
    }
}

impl From<std::io::Error> for BuildError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<ConfigError> for BuildError {
    fn from(e: ConfigError) -> Self {
        Self::Config(Arc::new(e))
    }
}

/// Errors raised while registering nodes in a task graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Identity registered twice
    #[error("Node '{0}' is already registered")]
    DuplicateNode(String),

    /// Dependency was not registered before its dependent
    #[error("Node '{id}' depends on unregistered node '{dependency}'")]
    UnknownDependency { id: String, dependency: String },

    /// Replacing a node that does not exist
    #[error("Node '{0}' is not registered")]
    UnknownNode(String),

    /// Identity that cannot name a folder below the build root
    #[error("Invalid identity '{id}': {message}")]
    InvalidIdentity { id: String, message: String },
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    NotFound(PathBuf),

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {message}")]
    InvalidValue { field: String, message: String },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// IO error
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}
