//! Output formatting utilities for the CLI
//!
//! Tables for persisted records and running tunnels, the daemon status
//! block, and colored status messages.

use tabled::{
    settings::{Style, Width},
    Table, Tabled,
};

use pt_core::ipc::{DaemonStatus, TunnelInfo};
use pt_core::profile::ApplicationProfile;
use pt_core::time::current_time_secs;
use pt_core::PrivilegeLevel;

/// Format the persisted records of one application as a table
pub fn format_records(profile: &ApplicationProfile) -> String {
    #[derive(Tabled)]
    struct RecordRow {
        #[tabled(rename = "SERVICE")]
        service: String,
        #[tabled(rename = "TYPE")]
        service_type: String,
        #[tabled(rename = "PORTS")]
        ports: String,
        #[tabled(rename = "POD")]
        pod: String,
        #[tabled(rename = "STATUS")]
        status: String,
        #[tabled(rename = "REASON")]
        reason: String,
        #[tabled(rename = "UPDATED")]
        updated: String,
        #[tabled(rename = "OWNER")]
        owner: String,
    }

    let rows: Vec<RecordRow> = profile
        .records()
        .map(|(svc, r)| RecordRow {
            service: svc.actual_name.clone(),
            service_type: if r.service_type.is_empty() {
                svc.service_type.clone()
            } else {
                r.service_type.clone()
            },
            ports: r.key().to_string(),
            pod: r.pod_name.clone(),
            status: r.status.as_str().to_string(),
            reason: dash_if_empty(&r.reason),
            updated: dash_if_empty(&r.updated_at),
            owner: r.owner().to_string(),
        })
        .collect();

    if rows.is_empty() {
        return format!("No port-forwards for {}/{}", profile.namespace, profile.name);
    }

    Table::new(rows)
        .with(Style::rounded())
        .with(Width::wrap(120))
        .to_string()
}

/// Format running tunnels as a table
pub fn format_tunnels(tunnels: &[TunnelInfo]) -> String {
    if tunnels.is_empty() {
        return "No running port-forwards".to_string();
    }

    #[derive(Tabled)]
    struct TunnelRow {
        #[tabled(rename = "APPLICATION")]
        application: String,
        #[tabled(rename = "SERVICE")]
        service: String,
        #[tabled(rename = "PORTS")]
        ports: String,
        #[tabled(rename = "POD")]
        pod: String,
        #[tabled(rename = "AGE")]
        age: String,
    }

    let now = current_time_secs();
    let rows: Vec<TunnelRow> = tunnels
        .iter()
        .map(|t| TunnelRow {
            application: format!("{}/{}", t.namespace, t.application),
            service: format!("{}/{}", t.service_type, t.service),
            ports: format!("{}:{}", t.local_port, t.remote_port),
            pod: t.pod_name.clone(),
            age: format_duration(now.saturating_sub(t.started_at)),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Format daemon status as a human-readable string
pub fn format_status(status: &DaemonStatus) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "Daemon: {} (pid {})\n",
        privilege_label(status.privilege),
        status.pid
    ));
    output.push_str(&format!("Version: {}\n", status.version));
    output.push_str(&format!("Uptime: {}\n", format_duration(status.uptime_secs)));
    output.push_str(&format!("Port-forwards: {}\n", status.port_forwards.len()));

    output
}

fn privilege_label(privilege: PrivilegeLevel) -> &'static str {
    match privilege {
        PrivilegeLevel::Unprivileged => "Running",
        PrivilegeLevel::Privileged => "Running (privileged)",
    }
}

/// Format duration in human-readable form
fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

fn dash_if_empty(s: &str) -> String {
    if s.is_empty() {
        "-".to_string()
    } else {
        s.to_string()
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix
///
/// Goes to stderr.
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}
