//! IPC client for communicating with the daemon

use std::net::SocketAddr;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

use pt_core::ipc::{
    DaemonCommand, DaemonInfo, DaemonResponse, DaemonStatus, ErrorKind, PortForwardCommand,
    MAX_COMMAND_LEN,
};

/// Failure reported by the daemon itself
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct DaemonError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Client for one daemon instance
pub struct DaemonClient {
    address: SocketAddr,
    framed: Option<Framed<TcpStream, LinesCodec>>,
}

impl DaemonClient {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            framed: None,
        }
    }

    /// Get the address
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Connect to the daemon if not already connected
    pub async fn connect(&mut self) -> Result<()> {
        if self.framed.is_some() {
            return Ok(());
        }

        tracing::debug!("Connecting to daemon at {}", self.address);

        let stream = TcpStream::connect(self.address).await.with_context(|| {
            format!("Failed to connect to daemon at {}. Is it running?", self.address)
        })?;

        self.framed = Some(Framed::new(
            stream,
            LinesCodec::new_with_max_length(MAX_COMMAND_LEN),
        ));
        Ok(())
    }

    /// Check if the daemon is running
    pub async fn ping(&mut self) -> Result<bool> {
        if self.connect().await.is_err() {
            return Ok(false);
        }

        match self.send_request(&DaemonCommand::Ping).await {
            Ok(DaemonResponse::Pong) => Ok(true),
            _ => Ok(false),
        }
    }

    /// Start a new tunnel
    pub async fn start_port_forward(&mut self, cmd: PortForwardCommand) -> Result<()> {
        let response = self
            .request(DaemonCommand::StartPortForward(cmd))
            .await?;
        expect_ok(response)
    }

    /// Replace a tunnel, keeping its record
    pub async fn restart_port_forward(&mut self, cmd: PortForwardCommand) -> Result<()> {
        let response = self
            .request(DaemonCommand::RestartPortForward(cmd))
            .await?;
        expect_ok(response)
    }

    /// Stop a tunnel and delete its record
    pub async fn stop_port_forward(&mut self, cmd: PortForwardCommand) -> Result<()> {
        let response = self.request(DaemonCommand::StopPortForward(cmd)).await?;
        expect_ok(response)
    }

    /// Get daemon status
    pub async fn status(&mut self) -> Result<DaemonStatus> {
        match self.request(DaemonCommand::GetDaemonServerStatus).await? {
            DaemonResponse::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Get static daemon information
    pub async fn info(&mut self) -> Result<DaemonInfo> {
        match self.request(DaemonCommand::GetDaemonServerInfo).await? {
            DaemonResponse::Info(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    /// Request daemon shutdown
    pub async fn shutdown(&mut self) -> Result<()> {
        let response = self.request(DaemonCommand::StopDaemonServer).await?;
        expect_ok(response)
    }

    async fn request(&mut self, command: DaemonCommand) -> Result<DaemonResponse> {
        self.connect().await?;
        self.send_request(&command).await
    }

    async fn send_request(&mut self, command: &DaemonCommand) -> Result<DaemonResponse> {
        let framed = self
            .framed
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Not connected"))?;

        framed.send(serde_json::to_string(command)?).await?;

        let line = framed
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("Daemon closed the connection"))??;

        let response: DaemonResponse = serde_json::from_str(&line)
            .with_context(|| format!("Invalid response from daemon: {}", line))?;
        Ok(response)
    }
}

fn expect_ok(response: DaemonResponse) -> Result<()> {
    match response {
        DaemonResponse::Ok => Ok(()),
        DaemonResponse::Error { message, kind } => Err(DaemonError { kind, message }.into()),
        other => Err(unexpected(other)),
    }
}

fn unexpected(response: DaemonResponse) -> anyhow::Error {
    match response {
        DaemonResponse::Error { message, kind } => DaemonError { kind, message }.into(),
        other => anyhow::anyhow!("Unexpected response: {:?}", other),
    }
}
