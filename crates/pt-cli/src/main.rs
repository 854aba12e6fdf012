//! podtun CLI
//!
//! Talks to the port-forward daemon (`podtund`) over its loopback command
//! port and reads persisted tunnel state from the data directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use podtun::commands::{self, parse_port_pair, ForwardArgs};
use podtun::ipc::DaemonClient;
use pt_core::config::{self, DaemonConfig, DATA_DIR_ENV};
use pt_core::profile::DEFAULT_SERVICE_TYPE;
use pt_core::PrivilegeLevel;

#[derive(Parser)]
#[command(name = "podtun")]
#[command(author, version, about = "Persistent port-forwards into Kubernetes pods")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory holding profiles (overrides config)
    #[arg(long, global = true, env = DATA_DIR_ENV)]
    data_dir: Option<PathBuf>,

    /// Talk to the privileged daemon
    #[arg(long, global = true, alias = "sudo")]
    privileged: bool,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage port-forwards
    #[command(subcommand)]
    Forward(ForwardCommands),

    /// Show daemon status and running port-forwards
    Status,

    /// Check whether the daemon is running
    Ping,

    /// Stop the daemon, keeping port-forwards for its next start
    Shutdown,
}

#[derive(Subcommand)]
enum ForwardCommands {
    /// Start a port-forward
    Start(ForwardTarget),

    /// Restart a port-forward, reusing its record
    Restart(ForwardTarget),

    /// Stop a port-forward and forget it
    Stop(ForwardTarget),

    /// List persisted port-forwards of an application
    #[command(alias = "ls")]
    List {
        /// Namespace
        #[arg(short, long)]
        namespace: String,

        /// Application name
        #[arg(short, long = "app")]
        application: String,
    },
}

#[derive(Args)]
struct ForwardTarget {
    /// Namespace
    #[arg(short, long)]
    namespace: String,

    /// Application name
    #[arg(short, long = "app")]
    application: String,

    /// Service (workload) name
    #[arg(short, long)]
    service: String,

    /// Service type
    #[arg(short = 't', long = "type", default_value = DEFAULT_SERVICE_TYPE)]
    service_type: String,

    /// Pod to forward to
    #[arg(long)]
    pod: String,

    /// Ports as LOCAL:REMOTE (":REMOTE" picks a free local port)
    #[arg(short, long = "port", value_parser = parse_ports)]
    ports: (u16, u16),

    /// Role label stored with the record
    #[arg(long, default_value = "")]
    role: String,

    /// Network id
    #[arg(long)]
    nid: Option<String>,
}

impl From<ForwardTarget> for ForwardArgs {
    fn from(t: ForwardTarget) -> Self {
        ForwardArgs {
            namespace: t.namespace,
            application: t.application,
            service: t.service,
            service_type: t.service_type,
            pod: t.pod,
            local_port: t.ports.0,
            remote_port: t.ports.1,
            role: t.role,
            nid: t.nid,
        }
    }
}

fn parse_ports(s: &str) -> std::result::Result<(u16, u16), String> {
    parse_port_pair(s).map_err(|e| format!("{:#}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut config = load_daemon_config(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    let privilege = PrivilegeLevel::from_flag(cli.privileged);
    let mut client = DaemonClient::new(config.ipc_address(privilege));

    match cli.command {
        Commands::Forward(ForwardCommands::Start(target)) => {
            commands::forward_start_command(&mut client, &target.into()).await?;
        }
        Commands::Forward(ForwardCommands::Restart(target)) => {
            commands::forward_restart_command(&mut client, &target.into()).await?;
        }
        Commands::Forward(ForwardCommands::Stop(target)) => {
            commands::forward_stop_command(&mut client, &target.into()).await?;
        }
        Commands::Forward(ForwardCommands::List {
            namespace,
            application,
        }) => {
            commands::forward_list_command(&config.data_dir, &namespace, &application).await?;
        }
        Commands::Status => commands::status_command(&mut client).await?,
        Commands::Ping => commands::ping_command(&mut client).await?,
        Commands::Shutdown => commands::shutdown_command(&mut client).await?,
    }

    Ok(())
}

fn load_daemon_config(path: Option<&Path>) -> Result<DaemonConfig> {
    if let Some(path) = path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }

    let default_path = config::default_config_path();
    if !default_path.exists() {
        return Ok(DaemonConfig::default());
    }
    Ok(config::load_config(&default_path).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
        DaemonConfig::default()
    }))
}
