//! IPC client for communicating with the daemon
//!
//! Uses newline-delimited JSON over TCP on localhost.

mod client;

pub use client::{DaemonClient, DaemonError};

pub use pt_core::ipc::{
    DaemonCommand, DaemonInfo, DaemonResponse, DaemonStatus, ErrorKind, PortForwardCommand,
    TunnelInfo, DEFAULT_IPC_PORT, DEFAULT_PRIVILEGED_IPC_PORT,
};
