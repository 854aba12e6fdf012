//! Errors returned by forward commands

use thiserror::Error;

use pt_core::error::StoreError;
use pt_core::ipc::ErrorKind;
use pt_core::{AppRef, ForwardKey};

#[derive(Error, Debug)]
pub enum ForwardError {
    /// Missing or out-of-range command fields
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The local port is held by something else
    #[error("Unable to listen on port {port}: {source}")]
    PortUnavailable {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// A record for the key exists and re-registration was not requested
    #[error("Port-forward {key} already exists for {app}")]
    AlreadyExists { app: AppRef, key: ForwardKey },

    /// The daemon no longer accepts tunnels
    #[error("Daemon is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ForwardError {
    /// Category reported to clients
    pub fn kind(&self) -> ErrorKind {
        match self {
            ForwardError::InvalidCommand(_) => ErrorKind::InvalidCommand,
            ForwardError::PortUnavailable { .. } => ErrorKind::PortUnavailable,
            ForwardError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            ForwardError::ShuttingDown => ErrorKind::Internal,
            ForwardError::Store(StoreError::RecordExists { .. }) => ErrorKind::AlreadyExists,
            ForwardError::Store(_) => ErrorKind::Store,
        }
    }
}
