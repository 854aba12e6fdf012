//! Port-forward commands

use std::path::Path;

use anyhow::{bail, Context, Result};

use pt_core::ipc::{ErrorKind, PortForwardCommand};
use pt_core::store::ProfileStore;
use pt_core::AppRef;

use crate::ipc::{DaemonClient, DaemonError};
use crate::output::{format_records, print_error, print_success, print_warning};

/// Tunnel description shared by start, restart and stop
#[derive(Debug, Clone)]
pub struct ForwardArgs {
    pub namespace: String,
    pub application: String,
    pub service: String,
    pub service_type: String,
    pub pod: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub role: String,
    pub nid: Option<String>,
}

impl ForwardArgs {
    fn command(&self) -> PortForwardCommand {
        PortForwardCommand {
            namespace: self.namespace.clone(),
            application: self.application.clone(),
            service: self.service.clone(),
            service_type: self.service_type.clone(),
            pod_name: self.pod.clone(),
            local_port: self.local_port,
            remote_port: self.remote_port,
            role: self.role.clone(),
            nid: self.nid.clone(),
        }
    }

    fn describe(&self) -> String {
        format!(
            "{}:{} -> {}/{}",
            self.local_port, self.remote_port, self.namespace, self.pod
        )
    }
}

/// Execute `forward start`
pub async fn forward_start_command(client: &mut DaemonClient, args: &ForwardArgs) -> Result<()> {
    match client.start_port_forward(args.command()).await {
        Ok(()) => {
            print_success(&format!("Port-forward started: {}", args.describe()));
            Ok(())
        }
        Err(e) => {
            report_failure("start", args, &e);
            Err(e)
        }
    }
}

/// Execute `forward restart`
pub async fn forward_restart_command(client: &mut DaemonClient, args: &ForwardArgs) -> Result<()> {
    match client.restart_port_forward(args.command()).await {
        Ok(()) => {
            print_success(&format!("Port-forward restarted: {}", args.describe()));
            Ok(())
        }
        Err(e) => {
            report_failure("restart", args, &e);
            Err(e)
        }
    }
}

/// Execute `forward stop`
pub async fn forward_stop_command(client: &mut DaemonClient, args: &ForwardArgs) -> Result<()> {
    match client.stop_port_forward(args.command()).await {
        Ok(()) => {
            print_success(&format!("Port-forward stopped: {}", args.describe()));
            Ok(())
        }
        Err(e) => {
            report_failure("stop", args, &e);
            Err(e)
        }
    }
}

/// Execute `forward list`
///
/// Reads the persisted records directly; the daemon does not need to run.
pub async fn forward_list_command(data_dir: &Path, namespace: &str, application: &str) -> Result<()> {
    let store = ProfileStore::new(data_dir);
    let app = AppRef::new(namespace, application);

    let profile = store
        .load(&app)
        .await
        .with_context(|| format!("Failed to read profile for {}", app))?;

    match profile {
        Some(profile) => println!("{}", format_records(&profile)),
        None => println!("No port-forwards for {}", app),
    }
    Ok(())
}

fn report_failure(action: &str, args: &ForwardArgs, err: &anyhow::Error) {
    print_error(&format!("Failed to {} port-forward {}: {}", action, args.describe(), err));

    match err.downcast_ref::<DaemonError>().map(|e| e.kind) {
        Some(ErrorKind::PortUnavailable) => {
            print_warning(&format!(
                "Local port {} is in use. Pick another with -p :{}",
                args.local_port, args.remote_port
            ));
        }
        Some(ErrorKind::AlreadyExists) => {
            print_warning("A record already exists for these ports. Use `forward restart` to replace it.");
        }
        _ => {}
    }
}

/// Parse `LOCAL:REMOTE`
///
/// An empty `LOCAL` picks a free local port; a bare port maps to itself.
pub fn parse_port_pair(s: &str) -> Result<(u16, u16)> {
    let (local, remote) = match s.split_once(':') {
        Some((local, remote)) => (local.trim(), remote.trim()),
        None => (s.trim(), s.trim()),
    };

    let remote = parse_port(remote).with_context(|| format!("Invalid remote port in {:?}", s))?;
    let local = if local.is_empty() {
        free_local_port()?
    } else {
        parse_port(local).with_context(|| format!("Invalid local port in {:?}", s))?
    };
    Ok((local, remote))
}

fn parse_port(s: &str) -> Result<u16> {
    let port: u16 = s.parse()?;
    if port == 0 {
        bail!("port must be between 1 and 65535");
    }
    Ok(port)
}

fn free_local_port() -> Result<u16> {
    let listener =
        std::net::TcpListener::bind("127.0.0.1:0").context("Failed to find a free local port")?;
    Ok(listener.local_addr()?.port())
}
