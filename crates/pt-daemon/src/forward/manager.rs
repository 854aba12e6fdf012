//! Command handling for port-forwards
//!
//! [`ForwardManager`] owns the registry and is the only entry point that
//! starts or stops tunnels, whether the request comes from a client or from
//! recovery at startup. Commands are serialized by one lock so a stop can
//! never race a start of the same key.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use pt_core::error::StoreError;
use pt_core::ipc::{PortForwardCommand, TunnelInfo};
use pt_core::profile::{PortForwardRecord, DEFAULT_SERVICE_TYPE};
use pt_core::store::ProfileStore;
use pt_core::time::now_timestamp;
use pt_core::{PortForwardStatus, PrivilegeLevel};

use super::error::ForwardError;
use super::probe::probe_local_port;
use super::registry::{Registry, RunningTunnel};
use super::supervisor::{Supervisor, SupervisorSettings};
use crate::cluster::{ClusterClient, PodTarget};

/// Whether a start may reuse an existing persisted record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Refuse when a record for the key exists
    Fresh,
    /// Reuse (and reset) an existing record; used by restart and recovery
    Reregister,
}

pub struct ForwardManager {
    registry: Arc<Registry>,
    store: Arc<ProfileStore>,
    cluster: Arc<dyn ClusterClient>,
    settings: SupervisorSettings,
    privilege: PrivilegeLevel,
    pid: u32,
    commands: Mutex<()>,
    shutdown: CancellationToken,
}

impl ForwardManager {
    pub fn new(
        store: Arc<ProfileStore>,
        cluster: Arc<dyn ClusterClient>,
        settings: SupervisorSettings,
        privilege: PrivilegeLevel,
    ) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            store,
            cluster,
            settings,
            privilege,
            pid: std::process::id(),
            commands: Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn privilege(&self) -> PrivilegeLevel {
        self.privilege
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Start supervising a tunnel
    ///
    /// A tunnel already running on the same ports is stopped first. When
    /// this returns `Ok`, the record is persisted and the tunnel registered.
    pub async fn start(&self, cmd: &PortForwardCommand, mode: StartMode) -> Result<(), ForwardError> {
        validate(cmd)?;
        let _guard = self.commands.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(ForwardError::ShuttingDown);
        }

        let key = cmd.key();
        let app = cmd.app_ref();

        if let Some(existing) = self.registry.get(&key) {
            tracing::info!(
                local_port = key.local_port,
                remote_port = key.remote_port,
                "Replacing running port-forward"
            );
            self.stop_tunnel(&existing).await;
        }

        let existing = self.store.find_record(&app, key).await?;
        if mode == StartMode::Fresh && existing.is_some() {
            return Err(ForwardError::AlreadyExists { app, key });
        }

        probe_local_port(self.settings.listen_address, key.local_port).map_err(|source| {
            ForwardError::PortUnavailable {
                port: key.local_port,
                source,
            }
        })?;

        let service_type = [
            cmd.service_type.as_str(),
            existing
                .as_ref()
                .map(|(_, r)| r.service_type.as_str())
                .unwrap_or_default(),
        ]
        .into_iter()
        .find(|t| !t.is_empty())
        .unwrap_or(DEFAULT_SERVICE_TYPE)
        .to_string();

        let record = PortForwardRecord {
            local_port: key.local_port,
            remote_port: key.remote_port,
            pod_name: cmd.pod_name.clone(),
            service_type: service_type.clone(),
            service_name: cmd.service.clone(),
            role: cmd.role.clone(),
            status: PortForwardStatus::New,
            reason: String::new(),
            updated_at: now_timestamp(),
            owner_is_privileged: self.privilege.is_privileged(),
            owner_process_id: self.pid,
        };
        match mode {
            StartMode::Fresh => self
                .store
                .add_record(&app, &cmd.service, &service_type, record)
                .await
                .map_err(|e| match e {
                    StoreError::RecordExists { .. } => ForwardError::AlreadyExists { app: app.clone(), key },
                    other => other.into(),
                })?,
            StartMode::Reregister => {
                self.store
                    .upsert_record(&app, &cmd.service, &service_type, record)
                    .await?
            }
        }

        let target = PodTarget {
            namespace: app.namespace.clone(),
            pod: cmd.pod_name.clone(),
            kubeconfig: self.store.kubeconfig(&app).await?,
        };

        // Registered before the supervisor runs so its own exit path always
        // finds the entry
        let tunnel = self.registry.prepare(cmd, &service_type);
        self.registry.insert(Arc::clone(&tunnel));
        let supervisor = Supervisor::new(
            tunnel,
            target,
            Arc::clone(&self.store),
            Arc::clone(&self.cluster),
            Arc::clone(&self.registry),
            self.settings.clone(),
            self.shutdown.clone(),
        );
        tokio::spawn(supervisor.run());

        tracing::info!(
            namespace = %app.namespace,
            application = %app.application,
            local_port = key.local_port,
            remote_port = key.remote_port,
            "Port-forward started"
        );
        Ok(())
    }

    /// Stop a tunnel and delete its record
    ///
    /// Returns once the supervisor has fully stopped. Without a running
    /// tunnel, any stray record for the key is deleted directly.
    pub async fn stop(&self, cmd: &PortForwardCommand) -> Result<(), ForwardError> {
        validate_names(cmd)?;
        let _guard = self.commands.lock().await;
        let key = cmd.key();
        let app = cmd.app_ref();

        // Same ports under another application belong to someone else
        match self.registry.get(&key).filter(|t| t.app == app) {
            Some(tunnel) => {
                self.stop_tunnel(&tunnel).await;
                tracing::info!(
                    local_port = key.local_port,
                    remote_port = key.remote_port,
                    "Port-forward stop completed"
                );
            }
            None => {
                if self.store.remove_record(&app, key).await? {
                    tracing::info!(
                        local_port = key.local_port,
                        remote_port = key.remote_port,
                        "Removed stray port-forward record"
                    );
                }
            }
        }
        Ok(())
    }

    async fn stop_tunnel(&self, tunnel: &Arc<RunningTunnel>) {
        tunnel.cancel.cancel();
        tunnel.wait_stopped().await;
        self.registry.remove_if_current(&tunnel.key, tunnel.id);
    }

    /// Snapshot of running tunnels
    pub fn list_running(&self) -> Vec<TunnelInfo> {
        self.registry.list()
    }

    /// Detach every tunnel, keeping records for the next daemon
    pub async fn shutdown(&self) {
        let _guard = self.commands.lock().await;
        self.shutdown.cancel();

        let tunnels = self.registry.drain();
        let count = tunnels.len();
        join_all(tunnels.iter().map(|t| t.wait_stopped())).await;
        tracing::info!("Detached {} port-forwards", count);
    }
}

fn validate(cmd: &PortForwardCommand) -> Result<(), ForwardError> {
    let missing = [
        ("namespace", cmd.namespace.is_empty()),
        ("application", cmd.application.is_empty()),
        ("service", cmd.service.is_empty()),
        ("podName", cmd.pod_name.is_empty()),
        ("localPort", cmd.local_port == 0),
        ("remotePort", cmd.remote_port == 0),
    ];
    if let Some((field, _)) = missing.iter().find(|(_, is_missing)| *is_missing) {
        return Err(ForwardError::InvalidCommand(format!("{} is required", field)));
    }
    validate_names(cmd)
}

/// Namespace and application become file names under the data dir
fn validate_names(cmd: &PortForwardCommand) -> Result<(), ForwardError> {
    cmd.app_ref()
        .validate()
        .map_err(|e| ForwardError::InvalidCommand(e.to_string()))
}
