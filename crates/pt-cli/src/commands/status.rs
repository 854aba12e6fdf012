//! Daemon status, ping and shutdown commands

use anyhow::Result;

use crate::ipc::DaemonClient;
use crate::output::{format_status, format_tunnels, print_error, print_success, print_warning};

/// Execute the status command
pub async fn status_command(client: &mut DaemonClient) -> Result<()> {
    let status = match client.status().await {
        Ok(s) => s,
        Err(e) => {
            print_error(&format!("Failed to get daemon status: {}", e));
            print_error("Is the daemon running? Try: podtund");
            return Err(e);
        }
    };

    println!("{}", format_status(&status));
    println!("{}", format_tunnels(&status.port_forwards));

    Ok(())
}

/// Execute the ping command
pub async fn ping_command(client: &mut DaemonClient) -> Result<()> {
    if client.ping().await? {
        print_success(&format!("Daemon at {} is running", client.address()));
        Ok(())
    } else {
        print_warning(&format!("No daemon answering at {}", client.address()));
        anyhow::bail!("Daemon is not running")
    }
}

/// Execute the shutdown command
///
/// Running tunnels are detached; their records stay so the next daemon
/// relaunches them.
pub async fn shutdown_command(client: &mut DaemonClient) -> Result<()> {
    match client.shutdown().await {
        Ok(()) => {
            print_success("Daemon stopping");
            Ok(())
        }
        Err(e) => {
            if e.to_string().contains("Is it running") {
                print_warning("Daemon is not running");
                Ok(())
            } else {
                print_error(&format!("Failed to stop daemon: {}", e));
                Err(e)
            }
        }
    }
}
