//! IPC server implementation
//!
//! Listens on localhost TCP for newline-delimited JSON commands.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use pt_core::ipc::{DaemonCommand, DaemonResponse, ErrorKind, MAX_COMMAND_LEN};

use crate::forward::StartMode;
use crate::state::DaemonState;

/// IPC server for CLI communication
///
/// Listens on localhost only; connections from other hosts are dropped.
pub struct IpcServer {
    address: SocketAddr,
    state: Arc<DaemonState>,
}

impl IpcServer {
    pub fn new(address: SocketAddr, state: Arc<DaemonState>) -> Self {
        Self { address, state }
    }

    /// Bind the listening socket
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.address)
            .await
            .with_context(|| format!("Failed to bind IPC server to {}", self.address))
    }

    /// Bind and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until the daemon shuts down
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("IPC server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = self.state.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        if !peer_addr.ip().is_loopback() {
                            tracing::warn!("Rejected non-localhost connection from {}", peer_addr);
                            continue;
                        }

                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, state).await {
                                tracing::warn!("IPC client error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept IPC connection: {}", e);
                    }
                },
            }
        }

        tracing::info!("IPC server stopped");
        Ok(())
    }
}

async fn handle_client(stream: TcpStream, state: Arc<DaemonState>) -> Result<()> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_COMMAND_LEN));

    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                let response = DaemonResponse::error(
                    ErrorKind::InvalidCommand,
                    format!("Command exceeds {} bytes", MAX_COMMAND_LEN),
                );
                framed.send(serde_json::to_string(&response)?).await?;
                break;
            }
            Err(LinesCodecError::Io(e)) => return Err(e.into()),
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<DaemonCommand>(trimmed) {
            Ok(command) => handle_request(command, &state).await,
            Err(e) => DaemonResponse::error(ErrorKind::InvalidCommand, format!("Invalid command: {}", e)),
        };

        framed.send(serde_json::to_string(&response)?).await?;
    }

    Ok(())
}

/// Execute one command against the daemon
pub async fn handle_request(command: DaemonCommand, state: &DaemonState) -> DaemonResponse {
    tracing::debug!("Handling {}", command.name());

    let result = match command {
        DaemonCommand::StartPortForward(cmd) => state.forwards.start(&cmd, StartMode::Fresh).await,
        DaemonCommand::RestartPortForward(cmd) => {
            state.forwards.start(&cmd, StartMode::Reregister).await
        }
        DaemonCommand::StopPortForward(cmd) => state.forwards.stop(&cmd).await,

        DaemonCommand::GetDaemonServerStatus => return DaemonResponse::Status(state.status()),
        DaemonCommand::GetDaemonServerInfo => return DaemonResponse::Info(state.info()),
        DaemonCommand::StopDaemonServer => {
            tracing::info!("Shutdown requested via IPC");
            state.shutdown.cancel();
            return DaemonResponse::Ok;
        }
        DaemonCommand::Ping => return DaemonResponse::Pong,
    };

    match result {
        Ok(()) => DaemonResponse::Ok,
        Err(e) => {
            tracing::warn!("Port-forward command failed: {}", e);
            DaemonResponse::error(e.kind(), e.to_string())
        }
    }
}
