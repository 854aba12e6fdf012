//! Per-tunnel supervision loop
//!
//! One supervisor keeps one tunnel alive. Each attempt probes the local port,
//! checks the pod, runs the forwarding stream on its own task and, once the
//! stream is ready, a heartbeat task. The supervisor then waits on the stream
//! result and on its cancellation signals:
//!
//! ```text
//! New --ready--> LISTEN <--probe ok / probe failed--> HeartBeatLoss
//!  |               |                                      |
//!  +---------------+---- stream closed (retryable) -------+--> RECONNECTING --backoff--> next attempt
//!  +---------------+---- port taken / pod gone -----------+--> DISCONNECTED (record deleted, no retry)
//! ```
//!
//! Status is written only from the heartbeat task and from this loop, and the
//! heartbeat task is always joined before the loop writes, so transitions of
//! one tunnel never interleave.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pt_core::config::DaemonConfig;
use pt_core::store::ProfileStore;
use pt_core::{AppRef, ForwardKey, PortForwardStatus};

use super::classify::{classify, mentions_ports, FailureKind};
use super::probe::probe_local_port;
use super::registry::{Registry, RunningTunnel};
use crate::cluster::{ClusterClient, ClusterError, ForwardRequest, PodTarget};

const HEARTBEAT_REASON: &str = "Heart Beat";

/// Timing and addressing shared by every supervisor
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub listen_address: IpAddr,
    pub heartbeat_interval: Duration,
    pub reconnect_backoff: Duration,
    /// How long a stopped stream may take to return
    pub stop_timeout: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            listen_address: config.listen_address,
            heartbeat_interval: config.heartbeat_interval,
            reconnect_backoff: config.reconnect_backoff,
            stop_timeout: config.stop_timeout,
        }
    }

    /// Address the heartbeat dials for a forwarded port
    fn probe_address(&self, port: u16) -> SocketAddr {
        let ip = match self.listen_address {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        SocketAddr::new(ip, port)
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&DaemonConfig::default())
    }
}

/// Writes status changes of one record
#[derive(Clone)]
struct StatusWriter {
    store: Arc<ProfileStore>,
    app: AppRef,
    key: ForwardKey,
}

impl StatusWriter {
    async fn set(&self, status: PortForwardStatus, reason: &str) {
        match self
            .store
            .update_status(&self.app, self.key, status, reason)
            .await
        {
            Ok(true) => tracing::debug!(
                local_port = self.key.local_port,
                remote_port = self.key.remote_port,
                status = %status,
                "Port-forward status updated"
            ),
            Ok(false) => {}
            Err(e) => tracing::warn!(
                local_port = self.key.local_port,
                remote_port = self.key.remote_port,
                "Failed to record status {}: {}",
                status,
                e
            ),
        }
    }

    async fn delete(&self) {
        if let Err(e) = self.store.remove_record(&self.app, self.key).await {
            tracing::warn!(
                local_port = self.key.local_port,
                remote_port = self.key.remote_port,
                "Failed to delete port-forward record: {}",
                e
            );
        }
    }
}

/// How one attempt ended
enum AttemptEnd {
    Cancelled,
    Shutdown,
    Retry(String),
    Terminal(FailureKind, String),
}

/// How the supervisor ended
enum Exit {
    /// Explicit stop: record deleted
    Cancelled,
    /// Daemon shutdown: record kept for recovery
    Shutdown,
    /// Terminal failure: record deleted, entry unregistered
    Disconnected(FailureKind, String),
}

pub(crate) struct Supervisor {
    tunnel: Arc<RunningTunnel>,
    target: PodTarget,
    cluster: Arc<dyn ClusterClient>,
    registry: Arc<Registry>,
    settings: SupervisorSettings,
    shutdown: CancellationToken,
    status: StatusWriter,
}

impl Supervisor {
    pub(crate) fn new(
        tunnel: Arc<RunningTunnel>,
        target: PodTarget,
        store: Arc<ProfileStore>,
        cluster: Arc<dyn ClusterClient>,
        registry: Arc<Registry>,
        settings: SupervisorSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let status = StatusWriter {
            store,
            app: tunnel.app.clone(),
            key: tunnel.key,
        };
        Self {
            tunnel,
            target,
            cluster,
            registry,
            settings,
            shutdown,
            status,
        }
    }

    /// Supervise until stopped, shut down or terminally failed
    pub(crate) async fn run(self) {
        let key = self.tunnel.key;
        tracing::info!(
            namespace = %self.tunnel.app.namespace,
            application = %self.tunnel.app.application,
            local_port = key.local_port,
            remote_port = key.remote_port,
            pod = %self.target.pod,
            "Supervising port-forward"
        );

        match self.supervise().await {
            Exit::Cancelled => {
                self.status.delete().await;
                tracing::info!(
                    local_port = key.local_port,
                    remote_port = key.remote_port,
                    "Port-forward stopped"
                );
            }
            Exit::Shutdown => {
                tracing::info!(
                    local_port = key.local_port,
                    remote_port = key.remote_port,
                    "Port-forward detached for daemon shutdown"
                );
            }
            Exit::Disconnected(kind, reason) => {
                tracing::warn!(
                    local_port = key.local_port,
                    remote_port = key.remote_port,
                    status = %PortForwardStatus::Disconnected,
                    "Port-forward disconnected ({}): {}",
                    kind,
                    reason
                );
                // Record goes first so a replacement started after the
                // registry entry disappears never loses its own record
                self.status.delete().await;
                self.registry.remove_if_current(&key, self.tunnel.id);
            }
        }

        self.tunnel.stopped.cancel();
    }

    async fn supervise(&self) -> Exit {
        loop {
            let reason = match self.attempt().await {
                AttemptEnd::Cancelled => return Exit::Cancelled,
                AttemptEnd::Shutdown => return Exit::Shutdown,
                AttemptEnd::Terminal(kind, reason) => return Exit::Disconnected(kind, reason),
                AttemptEnd::Retry(reason) => reason,
            };

            tracing::warn!(
                local_port = self.tunnel.key.local_port,
                remote_port = self.tunnel.key.remote_port,
                "Port-forward closed, reconnecting after {:?}: {}",
                self.settings.reconnect_backoff,
                reason
            );
            self.status
                .set(PortForwardStatus::Reconnecting, &reason)
                .await;

            tokio::select! {
                biased;
                _ = self.tunnel.cancel.cancelled() => return Exit::Cancelled,
                _ = self.shutdown.cancelled() => return Exit::Shutdown,
                _ = tokio::time::sleep(self.settings.reconnect_backoff) => {}
            }
            tracing::info!(
                local_port = self.tunnel.key.local_port,
                remote_port = self.tunnel.key.remote_port,
                "Reconnecting port-forward"
            );
        }
    }

    async fn attempt(&self) -> AttemptEnd {
        let key = self.tunnel.key;

        if let Err(e) = probe_local_port(self.settings.listen_address, key.local_port) {
            return AttemptEnd::Terminal(
                FailureKind::PortUnavailable,
                format!("Unable to listen on port {}: {}", key.local_port, e),
            );
        }

        let lookup = tokio::select! {
            biased;
            _ = self.tunnel.cancel.cancelled() => return AttemptEnd::Cancelled,
            _ = self.shutdown.cancelled() => return AttemptEnd::Shutdown,
            lookup = self.cluster.get_pod(&self.target) => lookup,
        };
        if let Err(e) = lookup {
            return failure(e);
        }

        let stop = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let request = ForwardRequest {
            target: self.target.clone(),
            local_port: key.local_port,
            remote_port: key.remote_port,
            listen_address: self.settings.listen_address,
            ready: ready_tx,
            stop: stop.clone(),
            output: output_tx,
        };
        let cluster = Arc::clone(&self.cluster);
        let mut forward = tokio::spawn(async move { cluster.forward(request).await });

        tokio::spawn(watch_output(output_rx, key, stop.clone()));

        let heartbeat_token = self.tunnel.cancel.child_token();
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.cluster),
            self.status.clone(),
            self.settings.probe_address(key.local_port),
            self.settings.heartbeat_interval,
            ready_rx,
            heartbeat_token.clone(),
        ));

        let mut forward_done = false;
        let end = tokio::select! {
            biased;
            _ = self.tunnel.cancel.cancelled() => AttemptEnd::Cancelled,
            _ = self.shutdown.cancelled() => AttemptEnd::Shutdown,
            result = &mut forward => {
                forward_done = true;
                match result {
                    Ok(Ok(())) => AttemptEnd::Retry("Reconnecting after stream restart".to_string()),
                    Ok(Err(e)) => failure(e),
                    Err(e) => AttemptEnd::Retry(format!("Port-forward task failed: {}", e)),
                }
            }
        };

        heartbeat_token.cancel();
        stop.cancel();
        if let Err(e) = heartbeat.await {
            tracing::warn!("Heartbeat task failed: {}", e);
        }
        if !forward_done {
            self.release_stream(forward).await;
        }

        end
    }

    /// Wait for a stopped stream to return, aborting it when it hangs
    async fn release_stream(&self, mut forward: JoinHandle<Result<(), ClusterError>>) {
        match tokio::time::timeout(self.settings.stop_timeout, &mut forward).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::debug!("Stream ended with error while stopping: {}", e),
            Ok(Err(e)) => tracing::warn!("Port-forward task failed while stopping: {}", e),
            Err(_) => {
                tracing::warn!(
                    local_port = self.tunnel.key.local_port,
                    remote_port = self.tunnel.key.remote_port,
                    "Port-forward did not stop within {:?}, aborting",
                    self.settings.stop_timeout
                );
                forward.abort();
            }
        }
    }
}

fn failure(error: ClusterError) -> AttemptEnd {
    let kind = error.kind();
    if kind.is_terminal() {
        AttemptEnd::Terminal(kind, error.message().to_string())
    } else {
        AttemptEnd::Retry(format!("Port-forward failed: {}", error.message()))
    }
}

/// Log stream output and restart the stream on the known setup bug
async fn watch_output(
    mut output: mpsc::UnboundedReceiver<String>,
    key: ForwardKey,
    stop: CancellationToken,
) {
    while let Some(line) = output.recv().await {
        tracing::debug!(
            local_port = key.local_port,
            remote_port = key.remote_port,
            "{}",
            line
        );
        if classify(&line) == FailureKind::RecoverableStreamBug
            && mentions_ports(&line, key.local_port, key.remote_port)
            && !stop.is_cancelled()
        {
            tracing::warn!(
                local_port = key.local_port,
                remote_port = key.remote_port,
                "Port-forward failed to create stream, restarting it"
            );
            stop.cancel();
        }
    }
}

/// Wait for readiness, then probe on every interval
///
/// Status is written only when it differs from the previous probe.
async fn heartbeat_loop(
    cluster: Arc<dyn ClusterClient>,
    status: StatusWriter,
    address: SocketAddr,
    interval: Duration,
    ready: oneshot::Receiver<()>,
    token: CancellationToken,
) {
    tokio::select! {
        _ = token.cancelled() => return,
        result = ready => {
            // Sender dropped: the stream ended before becoming ready
            if result.is_err() {
                return;
            }
        }
    }
    tracing::info!(
        local_port = status.key.local_port,
        remote_port = status.key.remote_port,
        "Port-forward is ready"
    );

    let mut last: Option<PortForwardStatus> = None;
    loop {
        let (current, reason) = tokio::select! {
            _ = token.cancelled() => return,
            result = cluster.send_heartbeat_probe(address) => match result {
                Ok(()) => (PortForwardStatus::Listen, HEARTBEAT_REASON.to_string()),
                Err(e) => {
                    tracing::warn!(
                        local_port = status.key.local_port,
                        remote_port = status.key.remote_port,
                        "Heartbeat failed: {}",
                        e
                    );
                    (PortForwardStatus::HeartBeatLoss, e.message().to_string())
                }
            },
        };

        if last != Some(current) {
            last = Some(current);
            status.set(current, &reason).await;
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_address_maps_unspecified_to_loopback() {
        let mut settings = SupervisorSettings::default();
        assert_eq!(settings.probe_address(8080).to_string(), "127.0.0.1:8080");

        settings.listen_address = IpAddr::V6(Ipv6Addr::UNSPECIFIED);
        assert_eq!(settings.probe_address(8080).to_string(), "[::1]:8080");

        settings.listen_address = "192.168.1.5".parse().unwrap();
        assert_eq!(settings.probe_address(8080).to_string(), "192.168.1.5:8080");
    }

    #[test]
    fn test_failure_mapping() {
        assert!(matches!(
            failure(ClusterError::new("pods \"web\" not found")),
            AttemptEnd::Terminal(FailureKind::PodNotFound, _)
        ));
        assert!(matches!(
            failure(ClusterError::new("lost connection to pod")),
            AttemptEnd::Retry(_)
        ));
        assert!(matches!(
            failure(ClusterError::new("mystery")),
            AttemptEnd::Retry(_)
        ));
    }
}
