//! Recovery of persisted tunnels at daemon startup

use pt_core::ipc::PortForwardCommand;
use pt_core::profile::DEFAULT_SERVICE_TYPE;
use pt_core::store::ProfileStore;
use pt_core::types::PortForwardStatus;

use crate::forward::{ForwardError, ForwardManager, StartMode};

/// Outcome of one recovery pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records relaunched by this daemon
    pub recovered: usize,
    /// Records owned by the other privilege level
    pub skipped_foreign: usize,
    /// Records whose relaunch failed. A record whose local port is taken
    /// is deleted; other failures leave it persisted
    pub failed: usize,
}

/// Relaunch every persisted tunnel owned by this daemon's privilege level
///
/// Failures are per record: they are logged and counted, never abort the
/// pass.
pub async fn recover_all(manager: &ForwardManager, store: &ProfileStore) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    let apps = match store.list_all_applications().await {
        Ok(apps) => apps,
        Err(e) => {
            tracing::error!("Failed to enumerate applications for recovery: {}", e);
            return report;
        }
    };

    for app in apps {
        let profile = match store.load(&app).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                tracing::warn!(app = %app, "Profile not found, skipping recovery");
                continue;
            }
            Err(e) => {
                tracing::warn!(app = %app, "Failed to read profile, skipping recovery: {}", e);
                continue;
            }
        };

        for (svc, record) in profile.records() {
            if record.owner() != manager.privilege() {
                report.skipped_foreign += 1;
                continue;
            }

            let service_type = [record.service_type.as_str(), svc.service_type.as_str()]
                .into_iter()
                .find(|t| !t.is_empty())
                .unwrap_or(DEFAULT_SERVICE_TYPE);
            let service = if record.service_name.is_empty() {
                &svc.actual_name
            } else {
                &record.service_name
            };

            let cmd = PortForwardCommand {
                namespace: app.namespace.clone(),
                application: app.application.clone(),
                service: service.clone(),
                service_type: service_type.to_string(),
                pod_name: record.pod_name.clone(),
                local_port: record.local_port,
                remote_port: record.remote_port,
                role: record.role.clone(),
                nid: None,
            };

            match manager.start(&cmd, StartMode::Reregister).await {
                Ok(()) => {
                    tracing::info!(
                        app = %app,
                        local_port = record.local_port,
                        remote_port = record.remote_port,
                        "Recovered port-forward"
                    );
                    report.recovered += 1;
                }
                Err(e @ ForwardError::PortUnavailable { .. }) => {
                    tracing::warn!(
                        app = %app,
                        local_port = record.local_port,
                        remote_port = record.remote_port,
                        status = %PortForwardStatus::Disconnected,
                        "Failed to recover port-forward: {}",
                        e
                    );
                    if let Err(e) = store.remove_record(&app, record.key()).await {
                        tracing::warn!(app = %app, "Failed to delete unrecoverable record: {}", e);
                    }
                    report.failed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        app = %app,
                        local_port = record.local_port,
                        remote_port = record.remote_port,
                        "Failed to recover port-forward: {}",
                        e
                    );
                    report.failed += 1;
                }
            }
        }
    }

    report
}
