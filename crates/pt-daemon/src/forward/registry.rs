//! Registry of running tunnels

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use pt_core::ipc::{PortForwardCommand, TunnelInfo};
use pt_core::time::current_time_secs;
use pt_core::{AppRef, ForwardKey};

/// Live supervision state of one tunnel
pub struct RunningTunnel {
    /// Distinguishes successive tunnels on the same key
    pub id: u64,
    pub key: ForwardKey,
    pub app: AppRef,
    pub service: String,
    pub service_type: String,
    pub pod_name: String,
    pub role: String,
    pub nid: Option<String>,
    pub started_at: u64,
    /// Cancels the whole supervision tree and deletes the record
    pub cancel: CancellationToken,
    /// Cancelled by the supervisor once it has fully stopped
    pub stopped: CancellationToken,
}

impl RunningTunnel {
    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            namespace: self.app.namespace.clone(),
            application: self.app.application.clone(),
            service: self.service.clone(),
            service_type: self.service_type.clone(),
            pod_name: self.pod_name.clone(),
            local_port: self.key.local_port,
            remote_port: self.key.remote_port,
            role: self.role.clone(),
            nid: self.nid.clone(),
            started_at: self.started_at,
        }
    }

    /// Wait until the supervisor has released everything
    pub async fn wait_stopped(&self) {
        self.stopped.cancelled().await
    }
}

/// Tunnels running in this daemon, keyed by port pair
///
/// The map lock is only held for single map operations, never across I/O.
pub struct Registry {
    tunnels: DashMap<ForwardKey, Arc<RunningTunnel>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Build a tunnel entry for a command; not yet registered
    pub fn prepare(&self, cmd: &PortForwardCommand, service_type: &str) -> Arc<RunningTunnel> {
        Arc::new(RunningTunnel {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key: cmd.key(),
            app: cmd.app_ref(),
            service: cmd.service.clone(),
            service_type: service_type.to_string(),
            pod_name: cmd.pod_name.clone(),
            role: cmd.role.clone(),
            nid: cmd.nid.clone(),
            started_at: current_time_secs(),
            cancel: CancellationToken::new(),
            stopped: CancellationToken::new(),
        })
    }

    /// Register a tunnel, returning any entry it displaced
    pub fn insert(&self, tunnel: Arc<RunningTunnel>) -> Option<Arc<RunningTunnel>> {
        self.tunnels.insert(tunnel.key, tunnel)
    }

    pub fn get(&self, key: &ForwardKey) -> Option<Arc<RunningTunnel>> {
        self.tunnels.get(key).map(|r| Arc::clone(&r))
    }

    /// Remove the entry for `key` only if it is still tunnel `id`
    ///
    /// A supervisor exiting late must not unregister its replacement.
    pub fn remove_if_current(&self, key: &ForwardKey, id: u64) -> Option<Arc<RunningTunnel>> {
        self.tunnels
            .remove_if(key, |_, tunnel| tunnel.id == id)
            .map(|(_, tunnel)| tunnel)
    }

    /// Remove and return every entry
    pub fn drain(&self) -> Vec<Arc<RunningTunnel>> {
        let keys: Vec<ForwardKey> = self.tunnels.iter().map(|r| *r.key()).collect();
        keys.into_iter()
            .filter_map(|key| self.tunnels.remove(&key).map(|(_, t)| t))
            .collect()
    }

    /// Snapshot of every running tunnel, ordered by key
    pub fn list(&self) -> Vec<TunnelInfo> {
        let mut infos: Vec<TunnelInfo> = self.tunnels.iter().map(|r| r.info()).collect();
        infos.sort_by_key(|t| (t.local_port, t.remote_port));
        infos
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
