//! Command protocol between the CLI and the port-forward daemon
//!
//! Messages are JSON documents, one per line, over TCP on localhost
//! (127.0.0.1). A line may not exceed [`MAX_COMMAND_LEN`] bytes.

use serde::{Deserialize, Serialize};

use crate::types::{AppRef, ForwardKey, PrivilegeLevel};

pub use crate::config::daemon::{DEFAULT_IPC_PORT, DEFAULT_PRIVILEGED_IPC_PORT};

/// Maximum length of one framed command or response
pub const MAX_COMMAND_LEN: usize = 64 * 1024;

/// Command sent from a client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "commandType")]
pub enum DaemonCommand {
    /// Establish and supervise a tunnel
    StartPortForward(PortForwardCommand),

    /// Replace a tunnel, keeping its persisted record
    RestartPortForward(PortForwardCommand),

    /// Stop a tunnel and delete its record
    StopPortForward(PortForwardCommand),

    /// Snapshot of the running tunnels
    GetDaemonServerStatus,

    /// Static daemon information
    GetDaemonServerInfo,

    /// Detach every tunnel and exit
    StopDaemonServer,

    /// Keepalive
    Ping,
}

impl DaemonCommand {
    /// Name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            DaemonCommand::StartPortForward(_) => "StartPortForward",
            DaemonCommand::RestartPortForward(_) => "RestartPortForward",
            DaemonCommand::StopPortForward(_) => "StopPortForward",
            DaemonCommand::GetDaemonServerStatus => "GetDaemonServerStatus",
            DaemonCommand::GetDaemonServerInfo => "GetDaemonServerInfo",
            DaemonCommand::StopDaemonServer => "StopDaemonServer",
            DaemonCommand::Ping => "Ping",
        }
    }
}

/// Payload of the Start/Restart/Stop commands
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardCommand {
    #[serde(alias = "nameSpace")]
    pub namespace: String,

    #[serde(alias = "appName")]
    pub application: String,

    #[serde(default)]
    pub service: String,

    #[serde(default)]
    pub service_type: String,

    #[serde(default)]
    pub pod_name: String,

    pub local_port: u16,

    pub remote_port: u16,

    #[serde(default)]
    pub role: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nid: Option<String>,
}

impl PortForwardCommand {
    pub fn key(&self) -> ForwardKey {
        ForwardKey::new(self.local_port, self.remote_port)
    }

    pub fn app_ref(&self) -> AppRef {
        AppRef::new(self.namespace.clone(), self.application.clone())
    }
}

/// Response sent from the daemon to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonResponse {
    /// Generic success
    Ok,

    /// Error response
    Error { message: String, kind: ErrorKind },

    /// Daemon status
    Status(DaemonStatus),

    /// Daemon information
    Info(DaemonInfo),

    /// Pong response
    Pong,
}

impl DaemonResponse {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        DaemonResponse::Error {
            message: message.into(),
            kind,
        }
    }
}

/// Failure category visible to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The local port is already bound by something else
    PortUnavailable,
    /// A record for the key already exists
    AlreadyExists,
    /// The command could not be parsed or is incomplete
    InvalidCommand,
    /// The persistent store failed
    Store,
    /// Anything else
    Internal,
}

/// Running tunnel as reported by `GetDaemonServerStatus`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub namespace: String,
    pub application: String,
    pub service: String,
    pub service_type: String,
    pub pod_name: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nid: Option<String>,
    /// Unix timestamp (seconds) when the tunnel was launched
    pub started_at: u64,
}

/// Daemon status information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub privilege: PrivilegeLevel,
    pub pid: u32,
    pub uptime_secs: u64,
    pub version: String,
    pub port_forwards: Vec<TunnelInfo>,
}

/// Static daemon information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonInfo {
    pub version: String,
    pub pid: u32,
    pub privilege: PrivilegeLevel,
    pub data_dir: String,
}
