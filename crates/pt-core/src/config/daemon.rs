//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::types::PrivilegeLevel;

/// Default command port of the unprivileged daemon
pub const DEFAULT_IPC_PORT: u16 = 30123;

/// Default command port of the privileged daemon
pub const DEFAULT_PRIVILEGED_IPC_PORT: u16 = 30124;

/// Configuration for the port-forward daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Root of the per-application profile databases
    pub data_dir: PathBuf,

    /// Loopback command port of the unprivileged daemon
    pub ipc_port: u16,

    /// Loopback command port of the privileged daemon
    pub privileged_ipc_port: u16,

    /// Address the forwarded local ports listen on
    pub listen_address: IpAddr,

    /// kubectl binary used to reach the cluster
    pub kubectl: PathBuf,

    /// Interval between heartbeat probes of a ready tunnel
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Fixed delay before re-establishing a closed stream
    #[serde(with = "duration_secs")]
    pub reconnect_backoff: Duration,

    /// Upper bound on one heartbeat probe
    #[serde(with = "duration_secs")]
    pub heartbeat_timeout: Duration,

    /// How long a stopping tunnel may take to release its stream
    #[serde(with = "duration_secs")]
    pub stop_timeout: Duration,

    /// Free SQLite pages tolerated before a profile database is vacuumed
    pub compact_free_pages: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: super::default_data_dir(),
            ipc_port: DEFAULT_IPC_PORT,
            privileged_ipc_port: DEFAULT_PRIVILEGED_IPC_PORT,
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            kubectl: PathBuf::from("kubectl"),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_backoff: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
            compact_free_pages: 256,
        }
    }
}

impl DaemonConfig {
    /// Command port for the given daemon instance
    pub fn ipc_port_for(&self, privilege: PrivilegeLevel) -> u16 {
        match privilege {
            PrivilegeLevel::Unprivileged => self.ipc_port,
            PrivilegeLevel::Privileged => self.privileged_ipc_port,
        }
    }

    /// Command address (localhost only) for the given daemon instance
    pub fn ipc_address(&self, privilege: PrivilegeLevel) -> SocketAddr {
        SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            self.ipc_port_for(privilege),
        )
    }

    /// Pid file of the given daemon instance
    pub fn pid_path(&self, privilege: PrivilegeLevel) -> PathBuf {
        match privilege {
            PrivilegeLevel::Unprivileged => self.data_dir.join("daemon.pid"),
            PrivilegeLevel::Privileged => self.data_dir.join("daemon-sudo.pid"),
        }
    }
}
