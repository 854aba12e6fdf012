//! Local port availability probe

use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener};

/// Bind and immediately release `address:port`
///
/// Fails with the bind error when something else holds the port.
pub fn probe_local_port(address: IpAddr, port: u16) -> io::Result<()> {
    let listener = TcpListener::bind(SocketAddr::new(address, port))?;
    drop(listener);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_probe_free_and_taken_port() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let err = probe_local_port(loopback, port).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        drop(held);
        probe_local_port(loopback, port).unwrap();
    }
}
