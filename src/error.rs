//! Error types for the compilation cache
//!
//! Configuration and compiler failures always reach the caller. Cache failures
//! are reported as [`CacheError`] and only become an [`Error`] when the
//! orchestrator is configured to raise them.

use std::path::PathBuf;

use thiserror::Error;

/// Boxed error produced by a compiler backend
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used across the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Invalid configuration. Never recovered internally.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Device assignment shape does not match `(num_replicas, num_partitions)`
    #[error("device_assignment has shape {actual:?}, expected ({replicas}, {partitions})")]
    DeviceAssignmentShape {
        actual: Vec<usize>,
        replicas: usize,
        partitions: usize,
    },

    /// Replica or partition count is zero
    #[error("{what} must be positive, got {value}")]
    InvalidCount { what: &'static str, value: usize },

    /// Device assignment rows have different lengths
    #[error("device_assignment is not rectangular: {0}")]
    RaggedDeviceAssignment(String),

    /// Environment variable could not be parsed
    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },

    /// Configuration file could not be read
    #[error("failed to read config file {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed
    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Invariant violated after validation; indicates a bug
    #[error("internal error: {0}")]
    Internal(String),
}

/// Failure inside the persistent cache subsystem
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Stored entry is truncated or otherwise unreadable
    #[error("corrupt cache entry '{key}': {reason}")]
    CorruptEntry { key: String, reason: String },

    /// Backend failed to serialize an executable for storage
    #[error("failed to serialize executable: {0}")]
    Serialize(#[source] BoxError),

    /// Backend failed to load a stored executable
    #[error("failed to deserialize executable: {0}")]
    Deserialize(#[source] BoxError),

    /// Store-specific failure
    #[error("{0}")]
    Store(String),
}

/// Crate-level error returned by compile requests
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Native compiler failure, passed through untouched
    #[error(transparent)]
    Compile(BoxError),

    #[error("error reading persistent compilation cache entry for '{module_name}': {source}")]
    CacheRead {
        module_name: String,
        #[source]
        source: CacheError,
    },

    #[error("error writing persistent compilation cache entry for '{module_name}': {source}")]
    CacheWrite {
        module_name: String,
        #[source]
        source: CacheError,
    },
}
