//! Daemon state shared by the IPC server and startup

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use pt_core::config::DaemonConfig;
use pt_core::ipc::{DaemonInfo, DaemonStatus};
use pt_core::store::ProfileStore;
use pt_core::PrivilegeLevel;

use crate::cluster::ClusterClient;
use crate::forward::{ForwardManager, SupervisorSettings};

/// State of one daemon instance
pub struct DaemonState {
    /// Configuration
    pub config: DaemonConfig,
    /// Which tunnels this instance owns
    pub privilege: PrivilegeLevel,
    /// Profile store under `config.data_dir`
    pub store: Arc<ProfileStore>,
    /// Running tunnels
    pub forwards: Arc<ForwardManager>,
    /// Cancelled to stop the daemon
    pub shutdown: CancellationToken,
    started: Instant,
}

impl DaemonState {
    pub fn new(
        config: DaemonConfig,
        privilege: PrivilegeLevel,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        let store = Arc::new(
            ProfileStore::new(config.data_dir.clone())
                .with_compact_threshold(config.compact_free_pages),
        );
        let forwards = Arc::new(ForwardManager::new(
            Arc::clone(&store),
            cluster,
            SupervisorSettings::from_config(&config),
            privilege,
        ));
        Self {
            config,
            privilege,
            store,
            forwards,
            shutdown: CancellationToken::new(),
            started: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn status(&self) -> DaemonStatus {
        DaemonStatus {
            privilege: self.privilege,
            pid: std::process::id(),
            uptime_secs: self.uptime_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            port_forwards: self.forwards.list_running(),
        }
    }

    pub fn info(&self) -> DaemonInfo {
        DaemonInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            privilege: self.privilege,
            data_dir: self.config.data_dir.display().to_string(),
        }
    }
}
