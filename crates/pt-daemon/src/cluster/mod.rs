//! Cluster collaborator
//!
//! The supervisor only needs three things from the cluster: look a pod up,
//! hold a forwarding stream open until told to stop, and probe a forwarded
//! local address. [`ClusterClient`] is that seam; [`KubectlClient`] drives
//! the `kubectl` binary and tests provide their own implementation.

mod heartbeat;
mod kubectl;

pub use heartbeat::tcp_heartbeat;
pub use kubectl::KubectlClient;

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::forward::classify::{classify, FailureKind};

/// Pod addressed by a forwarding request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTarget {
    pub namespace: String,
    pub pod: String,
    /// Kubeconfig recorded in the application profile
    pub kubeconfig: Option<PathBuf>,
}

/// What the cluster reports about a pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
}

/// One forwarding stream
pub struct ForwardRequest {
    pub target: PodTarget,
    pub local_port: u16,
    pub remote_port: u16,
    /// Local address the forwarded port listens on
    pub listen_address: IpAddr,
    /// Fired once when the stream can carry traffic
    pub ready: oneshot::Sender<()>,
    /// Cancelled to end the stream gracefully
    pub stop: CancellationToken,
    /// Diagnostic output lines of the stream
    pub output: mpsc::UnboundedSender<String>,
}

/// Untyped failure reported by the cluster
///
/// The message is whatever the underlying tool printed; [`ClusterError::kind`]
/// is the only place it is interpreted.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ClusterError {
    message: String,
}

impl ClusterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> FailureKind {
        classify(&self.message)
    }
}

/// Access to the cluster hosting the forwarded pods
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Look up a pod; a missing pod is an error that classifies as `PodNotFound`
    async fn get_pod(&self, target: &PodTarget) -> Result<PodInfo, ClusterError>;

    /// Run a forwarding stream until `request.stop` is cancelled or it fails
    ///
    /// Returns `Ok(())` only for a stop requested through the token.
    async fn forward(&self, request: ForwardRequest) -> Result<(), ClusterError>;

    /// Probe a forwarded local address
    async fn send_heartbeat_probe(&self, address: SocketAddr) -> Result<(), ClusterError>;
}
