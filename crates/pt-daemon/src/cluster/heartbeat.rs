//! TCP heartbeat probe

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::ClusterError;

const PING: &[u8] = b"ping";

/// Dial `address`, write a ping and close
///
/// A tunnel whose stream is wedged still accepts the local connection, but
/// the write fails once kubectl tears the relay down.
pub async fn tcp_heartbeat(address: SocketAddr, limit: Duration) -> Result<(), ClusterError> {
    let probe = async {
        let mut stream = TcpStream::connect(address).await?;
        stream.write_all(PING).await?;
        stream.shutdown().await
    };

    match timeout(limit, probe).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ClusterError::new(format!(
            "heartbeat to {} failed: {}",
            address, e
        ))),
        Err(_) => Err(ClusterError::new(format!(
            "heartbeat to {} timed out after {:?}",
            address, limit
        ))),
    }
}
