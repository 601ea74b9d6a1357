//! Error types for configuration operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading, saving or checking configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A container or scenario file could not be read, written or placed.
    #[error("cannot {action} '{path}': {source}")]
    File {
        /// `"read"`, `"write"` or `"create directory"`.
        action: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Not valid TOML, or not the expected shape
    #[error("malformed TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The value could not be written as TOML
    #[error("cannot encode TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A scenario step cannot be turned into a command
    #[error("step {index} ({op}): {reason}")]
    InvalidStep {
        /// Zero-based step index.
        index: usize,
        /// Step operation name.
        op: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// The container section breaks a rule
    #[error("invalid container config: {0}")]
    Validation(#[from] crate::validation::ValidationError),
}

impl ConfigError {
    /// A file that could not be read.
    pub fn read_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::file("read", path, source)
    }

    /// A file that could not be written.
    pub fn write_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::file("write", path, source)
    }

    /// A parent directory that could not be created.
    pub fn create_dir(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::file("create directory", path, source)
    }

    fn file(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::File {
            action,
            path: path.into(),
            source,
        }
    }

    /// A step rejected by [`Scenario::validate`](crate::Scenario::validate).
    pub fn invalid_step(index: usize, op: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidStep {
            index,
            op,
            reason: reason.into(),
        }
    }
}
