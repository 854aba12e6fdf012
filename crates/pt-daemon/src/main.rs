//! podtun daemon
//!
//! Runs in the background, accepts port-forward commands on a loopback port
//! and keeps the requested tunnels alive. On startup it relaunches every
//! tunnel persisted for its privilege level.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pt_core::config::{self, DaemonConfig, DATA_DIR_ENV};
use pt_core::pidfile::{is_privileged_user, PidFile};
use pt_core::PrivilegeLevel;
use pt_daemon::cluster::KubectlClient;
use pt_daemon::ipc::IpcServer;
use pt_daemon::{recover_all, DaemonState};

#[derive(Parser)]
#[command(name = "podtund")]
#[command(about = "podtun port-forward daemon")]
#[command(version)]
struct Args {
    /// Run as the privileged instance (tunnels on privileged ports)
    #[arg(long, alias = "sudo")]
    privileged: bool,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory holding profiles and pid files (overrides config)
    #[arg(long, env = DATA_DIR_ENV)]
    data_dir: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let privilege = PrivilegeLevel::from_flag(args.privileged);
    tracing::info!("podtun daemon ({}) starting...", privilege);

    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                DaemonConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            DaemonConfig::default()
        }
    };
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    if privilege.is_privileged() && !is_privileged_user() {
        bail!("The privileged daemon must run as root");
    }

    let pid_file = PidFile::new(config.pid_path(privilege));
    let _pid_guard = match pid_file.clone().acquire(std::process::id()) {
        Ok(guard) => guard,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            bail!("A {} daemon is already running: {}", privilege, e)
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to claim pid file {:?}", pid_file.path()));
        }
    };

    let cluster = Arc::new(KubectlClient::new(
        config.kubectl.clone(),
        config.heartbeat_timeout,
    ));
    let address = config.ipc_address(privilege);
    let state = Arc::new(DaemonState::new(config, privilege, cluster));

    spawn_signal_handler(state.shutdown.clone());

    let server = IpcServer::new(address, Arc::clone(&state));
    let listener = server.bind().await?;
    let server_task = tokio::spawn(async move { server.serve(listener).await });

    let report = recover_all(&state.forwards, &state.store).await;
    tracing::info!(
        recovered = report.recovered,
        skipped_foreign = report.skipped_foreign,
        failed = report.failed,
        "Recovery complete"
    );

    state.shutdown.cancelled().await;
    tracing::info!("Shutting down, detaching port-forwards...");
    state.forwards.shutdown().await;

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("IPC server error: {}", e),
        Err(e) => tracing::warn!("IPC server task failed: {}", e),
    }

    tracing::info!("podtun daemon shutdown complete");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
            _ = shutdown.cancelled() => return,
        }

        shutdown.cancel();
    });
}
