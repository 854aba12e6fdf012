//! `kubectl`-backed cluster client

use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::{tcp_heartbeat, ClusterClient, ClusterError, ForwardRequest, PodInfo, PodTarget};

/// Line kubectl prints once a port-forward accepts connections
const READY_MARKER: &str = "Forwarding from";

/// Cluster client shelling out to `kubectl`
pub struct KubectlClient {
    kubectl: PathBuf,
    heartbeat_timeout: Duration,
}

impl KubectlClient {
    pub fn new(kubectl: impl Into<PathBuf>, heartbeat_timeout: Duration) -> Self {
        Self {
            kubectl: kubectl.into(),
            heartbeat_timeout,
        }
    }

    fn command(&self, target: &PodTarget) -> Command {
        let mut cmd = Command::new(&self.kubectl);
        if let Some(kubeconfig) = &target.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        cmd.arg("-n")
            .arg(&target.namespace)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> ClusterError {
        ClusterError::new(format!("failed to run {}: {}", self.kubectl.display(), e))
    }
}

enum StreamEnd {
    Exited(std::io::Result<ExitStatus>),
    Stopped,
}

#[async_trait]
impl ClusterClient for KubectlClient {
    async fn get_pod(&self, target: &PodTarget) -> Result<PodInfo, ClusterError> {
        let output = self
            .command(target)
            .args(["get", "pod", &target.pod, "-o", "name"])
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClusterError::new(last_line(&stderr).unwrap_or_else(|| {
                format!("kubectl get pod exited with {}", output.status)
            })));
        }

        Ok(PodInfo {
            name: target.pod.clone(),
        })
    }

    async fn forward(&self, request: ForwardRequest) -> Result<(), ClusterError> {
        let ForwardRequest {
            target,
            local_port,
            remote_port,
            listen_address,
            ready,
            stop,
            output,
        } = request;

        let mut child = self
            .command(&target)
            .arg("port-forward")
            .arg(format!("pod/{}", target.pod))
            .arg(format!("{}:{}", local_port, remote_port))
            .arg("--address")
            .arg(listen_address.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ClusterError::new("kubectl port-forward has no output pipes"));
        };
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut ready = Some(ready);
        let mut last_error: Option<String> = None;

        let end = loop {
            tokio::select! {
                line = stdout.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        if line.contains(READY_MARKER) {
                            if let Some(tx) = ready.take() {
                                let _ = tx.send(());
                            }
                        }
                        let _ = output.send(line);
                    }
                    _ => stdout_open = false,
                },
                line = stderr.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => {
                        if !line.trim().is_empty() {
                            last_error = Some(line.clone());
                        }
                        let _ = output.send(line);
                    }
                    _ => stderr_open = false,
                },
                status = child.wait() => break StreamEnd::Exited(status),
                _ = stop.cancelled() => break StreamEnd::Stopped,
            }
        };

        let status = match end {
            StreamEnd::Stopped => {
                if let Err(e) = child.kill().await {
                    tracing::debug!("kubectl port-forward already gone: {}", e);
                }
                return Ok(());
            }
            StreamEnd::Exited(status) => status,
        };

        // The child is gone; pick up what it printed on the way out
        if stderr_open {
            while let Ok(Some(line)) = stderr.next_line().await {
                if !line.trim().is_empty() {
                    last_error = Some(line.clone());
                }
                let _ = output.send(line);
            }
        }

        let message = match status {
            Ok(status) => last_error
                .unwrap_or_else(|| format!("kubectl port-forward exited with {}", status)),
            Err(e) => format!("failed to wait for kubectl port-forward: {}", e),
        };
        Err(ClusterError::new(message))
    }

    async fn send_heartbeat_probe(&self, address: SocketAddr) -> Result<(), ClusterError> {
        tcp_heartbeat(address, self.heartbeat_timeout).await
    }
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(String::from)
}
