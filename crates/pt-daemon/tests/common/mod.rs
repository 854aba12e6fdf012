//! Shared fixtures for daemon integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::watch;

use pt_core::profile::PortForwardRecord;
use pt_core::store::ProfileStore;
use pt_core::time::now_timestamp;
use pt_core::{ForwardKey, PortForwardStatus};
use pt_daemon::cluster::{
    tcp_heartbeat, ClusterClient, ClusterError, ForwardRequest, PodInfo, PodTarget,
};
use pt_daemon::forward::SupervisorSettings;

pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// In-memory cluster whose forwards are real loopback listeners
pub struct MockCluster {
    pods: Mutex<HashSet<String>>,
    pod_events: watch::Sender<u64>,
    forward_calls: AtomicUsize,
    heartbeat_failing: AtomicBool,
    pending_output: Mutex<Vec<String>>,
    stream_failure: Mutex<Option<String>>,
}

impl MockCluster {
    pub fn new() -> Arc<Self> {
        let (pod_events, _) = watch::channel(0);
        Arc::new(Self {
            pods: Mutex::new(HashSet::new()),
            pod_events,
            forward_calls: AtomicUsize::new(0),
            heartbeat_failing: AtomicBool::new(false),
            pending_output: Mutex::new(Vec::new()),
            stream_failure: Mutex::new(None),
        })
    }

    pub fn add_pod(&self, name: &str) {
        self.pods.lock().unwrap().insert(name.to_string());
    }

    pub fn delete_pod(&self, name: &str) {
        self.pods.lock().unwrap().remove(name);
        self.pod_events.send_modify(|n| *n += 1);
    }

    pub fn has_pod(&self, name: &str) -> bool {
        self.pods.lock().unwrap().contains(name)
    }

    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::SeqCst)
    }

    pub fn set_heartbeat_failing(&self, failing: bool) {
        self.heartbeat_failing.store(failing, Ordering::SeqCst);
    }

    /// Line the next ready stream prints once
    pub fn emit_after_ready(&self, line: &str) {
        self.pending_output.lock().unwrap().push(line.to_string());
    }

    /// End the live stream once with `message`, leaving the pod in place
    pub fn break_stream(&self, message: &str) {
        *self.stream_failure.lock().unwrap() = Some(message.to_string());
        self.pod_events.send_modify(|n| *n += 1);
    }

    fn not_found(pod: &str) -> ClusterError {
        ClusterError::new(format!(
            "Error from server (NotFound): pods \"{}\" not found",
            pod
        ))
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn get_pod(&self, target: &PodTarget) -> Result<PodInfo, ClusterError> {
        if self.has_pod(&target.pod) {
            Ok(PodInfo {
                name: target.pod.clone(),
            })
        } else {
            Err(Self::not_found(&target.pod))
        }
    }

    async fn forward(&self, request: ForwardRequest) -> Result<(), ClusterError> {
        self.forward_calls.fetch_add(1, Ordering::SeqCst);
        let pod = request.target.pod.clone();
        if !self.has_pod(&pod) {
            return Err(Self::not_found(&pod));
        }

        let listener = TcpListener::bind(SocketAddr::new(request.listen_address, request.local_port))
            .await
            .map_err(|e| {
                ClusterError::new(format!(
                    "unable to listen on any of the requested ports: {}",
                    e
                ))
            })?;

        let mut pod_events = self.pod_events.subscribe();
        let _ = request.output.send(format!(
            "Forwarding from {}:{} -> {}",
            request.listen_address, request.local_port, request.remote_port
        ));
        let _ = request.ready.send(());
        let pending: Vec<String> = self.pending_output.lock().unwrap().drain(..).collect();
        for line in pending {
            let _ = request.output.send(line);
        }

        loop {
            tokio::select! {
                _ = request.stop.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    if let Ok((socket, _)) = accepted {
                        drop(socket);
                    }
                }
                changed = pod_events.changed() => {
                    if let Some(message) = self.stream_failure.lock().unwrap().take() {
                        return Err(ClusterError::new(message));
                    }
                    if changed.is_err() || !self.has_pod(&pod) {
                        return Err(ClusterError::new(
                            "E0101 portforward.go:400] lost connection to pod",
                        ));
                    }
                }
            }
        }
    }

    async fn send_heartbeat_probe(&self, address: SocketAddr) -> Result<(), ClusterError> {
        if self.heartbeat_failing.load(Ordering::SeqCst) {
            return Err(ClusterError::new(format!("heartbeat to {} refused", address)));
        }
        tcp_heartbeat(address, Duration::from_secs(1)).await
    }
}

/// Fast timings on loopback
pub fn test_settings() -> SupervisorSettings {
    SupervisorSettings {
        listen_address: LOOPBACK,
        heartbeat_interval: Duration::from_millis(50),
        reconnect_backoff: Duration::from_millis(100),
        stop_timeout: Duration::from_secs(2),
    }
}

/// A loopback port nobody is listening on right now
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll `check` until it holds or the deadline passes
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

pub async fn status_of(
    store: &ProfileStore,
    app: &pt_core::AppRef,
    key: ForwardKey,
) -> Option<PortForwardStatus> {
    store
        .find_record(app, key)
        .await
        .unwrap()
        .map(|(_, r)| r.status)
}

pub fn record(local: u16, remote: u16, pod: &str, privileged: bool) -> PortForwardRecord {
    PortForwardRecord {
        local_port: local,
        remote_port: remote,
        pod_name: pod.to_string(),
        service_type: String::new(),
        service_name: "web".to_string(),
        role: String::new(),
        status: PortForwardStatus::Listen,
        reason: String::new(),
        updated_at: now_timestamp(),
        owner_is_privileged: privileged,
        owner_process_id: 1,
    }
}
