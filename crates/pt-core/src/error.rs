//! Core error types for podtun

use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Namespace or application name that cannot be used
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {field} {value:?}: must be a lowercase RFC 1123 name")]
pub struct NameError {
    pub field: &'static str,
    pub value: String,
}

/// Errors raised by the per-application profile store
#[derive(Error, Debug)]
pub enum StoreError {
    /// The database file could not be opened
    #[error("Failed to open profile database {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// SQLite failure after the database was opened
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The stored profile document could not be decoded
    #[error("Failed to decode profile document: {0}")]
    Decode(#[source] serde_yaml::Error),

    /// The profile document could not be encoded
    #[error("Failed to encode profile document: {0}")]
    Encode(#[source] serde_yaml::Error),

    /// The application cannot be mapped to a database path
    #[error(transparent)]
    InvalidName(#[from] NameError),

    /// No profile exists for the application
    #[error("Profile not found for {namespace}/{application}")]
    ProfileNotFound {
        namespace: String,
        application: String,
    },

    /// A record for the key already exists
    #[error("Port-forward {local_port}:{remote_port} already exists")]
    RecordExists { local_port: u16, remote_port: u16 },

    /// Filesystem error around the database directory
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The blocking store task panicked or was cancelled
    #[error("Store task failed: {0}")]
    Task(String),
}
