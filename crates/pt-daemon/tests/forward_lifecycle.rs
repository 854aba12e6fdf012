//! Tunnel lifecycle tests
//!
//! Drive the forward manager against a mock cluster whose streams are real
//! loopback listeners.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use common::{free_port, record, status_of, test_settings, wait_until, MockCluster};
use pt_core::ipc::{ErrorKind, PortForwardCommand};
use pt_core::store::ProfileStore;
use pt_core::{AppRef, ForwardKey, PortForwardStatus, PrivilegeLevel};
use pt_daemon::forward::probe::probe_local_port;
use pt_daemon::forward::{ForwardError, SupervisorSettings};
use pt_daemon::{ForwardManager, StartMode};

struct Fixture {
    _dir: TempDir,
    store: Arc<ProfileStore>,
    cluster: Arc<MockCluster>,
    manager: ForwardManager,
}

fn fixture() -> Fixture {
    fixture_with(test_settings())
}

fn fixture_with(settings: SupervisorSettings) -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ProfileStore::new(dir.path()));
    let cluster = MockCluster::new();
    let manager = ForwardManager::new(
        Arc::clone(&store),
        cluster.clone(),
        settings,
        PrivilegeLevel::Unprivileged,
    );
    Fixture {
        _dir: dir,
        store,
        cluster,
        manager,
    }
}

fn command(local: u16, remote: u16, pod: &str) -> PortForwardCommand {
    PortForwardCommand {
        namespace: "dev".to_string(),
        application: "shop".to_string(),
        service: "web".to_string(),
        service_type: "deployment".to_string(),
        pod_name: pod.to_string(),
        local_port: local,
        remote_port: remote,
        role: String::new(),
        nid: None,
    }
}

fn app() -> AppRef {
    AppRef::new("dev", "shop")
}

async fn record_count(store: &ProfileStore, app: &AppRef) -> usize {
    store
        .load(app)
        .await
        .unwrap()
        .map(|p| p.records().count())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_listen_then_pod_deleted_disconnects() {
    let f = fixture();
    f.cluster.add_pod("nginx-aaa");
    let port = free_port();
    let key = ForwardKey::new(port, 80);
    let app = app();

    f.manager
        .start(&command(port, 80, "nginx-aaa"), StartMode::Fresh)
        .await
        .unwrap();
    assert_eq!(f.manager.list_running().len(), 1);
    assert!(f.store.find_record(&app, key).await.unwrap().is_some());

    let (store, app_ref) = (&f.store, &app);
    wait_until("LISTEN", || async move {
        status_of(store, app_ref, key).await == Some(PortForwardStatus::Listen)
    })
    .await;

    f.cluster.delete_pod("nginx-aaa");

    let manager = &f.manager;
    wait_until("tunnel unregistered", || async move {
        manager.registry().is_empty()
    })
    .await;
    assert!(f.store.find_record(&app, key).await.unwrap().is_none());

    // No attempt is made after the terminal failure
    let calls = f.cluster.forward_calls();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(f.cluster.forward_calls(), calls);
    assert_eq!(calls, 1);
    probe_local_port(common::LOOPBACK, port).unwrap();
}

#[tokio::test]
async fn test_stream_reset_reconnects_same_tunnel() {
    let f = fixture_with(SupervisorSettings {
        reconnect_backoff: Duration::from_millis(500),
        ..test_settings()
    });
    f.cluster.add_pod("web-abc");
    let port = free_port();
    let key = ForwardKey::new(port, 80);
    let app = app();
    let (store, app_ref) = (&f.store, &app);

    f.manager
        .start(&command(port, 80, "web-abc"), StartMode::Fresh)
        .await
        .unwrap();
    wait_until("LISTEN", || async move {
        status_of(store, app_ref, key).await == Some(PortForwardStatus::Listen)
    })
    .await;
    let tunnel_id = f.manager.registry().get(&key).unwrap().id;

    f.cluster.break_stream("error: read tcp: connection reset by peer");
    wait_until("Reconnecting", || async move {
        status_of(store, app_ref, key).await == Some(PortForwardStatus::Reconnecting)
    })
    .await;
    let (_, reconnecting) = f.store.find_record(&app, key).await.unwrap().unwrap();
    assert!(reconnecting.reason.contains("connection reset by peer"));

    let cluster = &f.cluster;
    wait_until("second stream", || async move {
        cluster.forward_calls() >= 2
    })
    .await;
    wait_until("LISTEN again", || async move {
        status_of(store, app_ref, key).await == Some(PortForwardStatus::Listen)
    })
    .await;

    assert_eq!(f.cluster.forward_calls(), 2);
    assert_eq!(f.manager.registry().len(), 1);
    assert_eq!(f.manager.registry().get(&key).unwrap().id, tunnel_id);
    assert_eq!(record_count(&f.store, &app).await, 1);
}

#[tokio::test]
async fn test_heartbeat_loss_keeps_tunnel_running() {
    let f = fixture();
    f.cluster.add_pod("web-abc");
    let port = free_port();
    let key = ForwardKey::new(port, 8080);
    let app = app();
    let (store, app_ref) = (&f.store, &app);

    f.manager
        .start(&command(port, 8080, "web-abc"), StartMode::Fresh)
        .await
        .unwrap();
    wait_until("LISTEN", || async move {
        status_of(store, app_ref, key).await == Some(PortForwardStatus::Listen)
    })
    .await;

    f.cluster.set_heartbeat_failing(true);
    wait_until("HeartBeatLoss", || async move {
        status_of(store, app_ref, key).await == Some(PortForwardStatus::HeartBeatLoss)
    })
    .await;
    assert_eq!(f.manager.list_running().len(), 1);
    assert_eq!(f.cluster.forward_calls(), 1);

    f.cluster.set_heartbeat_failing(false);
    wait_until("LISTEN again", || async move {
        status_of(store, app_ref, key).await == Some(PortForwardStatus::Listen)
    })
    .await;
    assert_eq!(f.cluster.forward_calls(), 1);
}

#[tokio::test]
async fn test_start_on_bound_port_fails_without_record() {
    let f = fixture();
    f.cluster.add_pod("web-abc");
    let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = held.local_addr().unwrap().port();

    let err = f
        .manager
        .start(&command(port, port, "web-abc"), StartMode::Fresh)
        .await
        .unwrap_err();
    assert!(matches!(err, ForwardError::PortUnavailable { .. }));
    assert_eq!(err.kind(), ErrorKind::PortUnavailable);

    assert!(f
        .store
        .find_record(&app(), ForwardKey::new(port, port))
        .await
        .unwrap()
        .is_none());
    assert!(f.manager.list_running().is_empty());
    assert_eq!(f.cluster.forward_calls(), 0);
}

#[tokio::test]
async fn test_second_start_replaces_running_tunnel() {
    let f = fixture();
    f.cluster.add_pod("web-abc");
    f.cluster.add_pod("web-def");
    let port = free_port();
    let key = ForwardKey::new(port, 80);
    let app = app();

    f.manager
        .start(&command(port, 80, "web-abc"), StartMode::Fresh)
        .await
        .unwrap();
    f.manager
        .start(&command(port, 80, "web-def"), StartMode::Fresh)
        .await
        .unwrap();

    let running = f.manager.list_running();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].pod_name, "web-def");
    assert_eq!(record_count(&f.store, &app).await, 1);

    let (store, app_ref) = (&f.store, &app);
    wait_until("LISTEN", || async move {
        status_of(store, app_ref, key).await == Some(PortForwardStatus::Listen)
    })
    .await;
    let (_, rec) = f.store.find_record(&app, key).await.unwrap().unwrap();
    assert_eq!(rec.pod_name, "web-def");
}

#[tokio::test]
async fn test_fresh_start_rejects_existing_record_restart_accepts() {
    let f = fixture();
    f.cluster.add_pod("web-abc");
    let port = free_port();
    let key = ForwardKey::new(port, 80);
    let app = app();

    f.store
        .add_record(&app, "web", "deployment", record(port, 80, "web-abc", false))
        .await
        .unwrap();

    let err = f
        .manager
        .start(&command(port, 80, "web-abc"), StartMode::Fresh)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert!(f.manager.list_running().is_empty());

    f.manager
        .start(&command(port, 80, "web-abc"), StartMode::Reregister)
        .await
        .unwrap();
    assert_eq!(f.manager.list_running().len(), 1);
    assert_eq!(record_count(&f.store, &app).await, 1);
    let status = status_of(&f.store, &app, key).await.unwrap();
    assert!(matches!(
        status,
        PortForwardStatus::New | PortForwardStatus::Listen
    ));
}

#[tokio::test]
async fn test_stop_removes_stray_record() {
    let f = fixture();
    let port = free_port();
    let app = app();

    f.store
        .add_record(&app, "web", "deployment", record(port, 80, "web-abc", false))
        .await
        .unwrap();

    f.manager
        .stop(&command(port, 80, "web-abc"))
        .await
        .unwrap();
    assert!(f
        .store
        .find_record(&app, ForwardKey::new(port, 80))
        .await
        .unwrap()
        .is_none());

    // Nothing to stop at all is still a success
    f.manager
        .stop(&command(port, 80, "web-abc"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_stop_for_other_app_leaves_running_tunnel() {
    let f = fixture();
    f.cluster.add_pod("web-abc");
    let port = free_port();
    let key = ForwardKey::new(port, 80);
    let app = app();
    let (store, app_ref) = (&f.store, &app);

    f.manager
        .start(&command(port, 80, "web-abc"), StartMode::Fresh)
        .await
        .unwrap();
    wait_until("LISTEN", || async move {
        status_of(store, app_ref, key).await == Some(PortForwardStatus::Listen)
    })
    .await;

    let blog = AppRef::new("dev", "blog");
    f.store
        .add_record(&blog, "web", "deployment", record(port, 80, "web-abc", false))
        .await
        .unwrap();

    let mut other = command(port, 80, "web-abc");
    other.application = "blog".to_string();
    f.manager.stop(&other).await.unwrap();

    // Only the named app's stray record goes
    assert!(f.store.find_record(&blog, key).await.unwrap().is_none());
    assert_eq!(f.manager.list_running().len(), 1);
    assert_eq!(
        status_of(&f.store, &app, key).await,
        Some(PortForwardStatus::Listen)
    );
    assert_eq!(f.cluster.forward_calls(), 1);
}

#[tokio::test]
async fn test_stop_running_tunnel_deletes_record_and_frees_port() {
    let f = fixture();
    f.cluster.add_pod("web-abc");
    let port = free_port();
    let key = ForwardKey::new(port, 80);
    let app = app();
    let (store, app_ref) = (&f.store, &app);

    f.manager
        .start(&command(port, 80, "web-abc"), StartMode::Fresh)
        .await
        .unwrap();
    wait_until("LISTEN", || async move {
        status_of(store, app_ref, key).await == Some(PortForwardStatus::Listen)
    })
    .await;

    f.manager.stop(&command(port, 80, "web-abc")).await.unwrap();

    assert!(f.manager.list_running().is_empty());
    assert!(f.store.find_record(&app, key).await.unwrap().is_none());
    probe_local_port(common::LOOPBACK, port).unwrap();
}

#[tokio::test]
async fn test_shutdown_detaches_and_keeps_records() {
    let f = fixture();
    f.cluster.add_pod("web-abc");
    let ports = [free_port(), free_port()];
    let app = app();

    for port in ports {
        f.manager
            .start(&command(port, 80, "web-abc"), StartMode::Fresh)
            .await
            .unwrap();
    }
    assert_eq!(f.manager.list_running().len(), 2);

    f.manager.shutdown().await;

    assert!(f.manager.list_running().is_empty());
    assert_eq!(record_count(&f.store, &app).await, 2);

    let err = f
        .manager
        .start(&command(free_port(), 80, "web-abc"), StartMode::Fresh)
        .await
        .unwrap_err();
    assert!(matches!(err, ForwardError::ShuttingDown));
}

#[tokio::test]
async fn test_stream_bug_restarts_matching_tunnel_only() {
    let f = fixture();
    f.cluster.add_pod("web-abc");
    let port = free_port();
    let key = ForwardKey::new(port, 80);
    let app = app();
    let (store, app_ref) = (&f.store, &app);

    // A line about another tunnel is ignored
    f.cluster.emit_after_ready(&format!(
        "E0101 portforward.go:234] error creating error stream for port {} -> 81: Timeout occurred",
        port
    ));
    f.manager
        .start(&command(port, 80, "web-abc"), StartMode::Fresh)
        .await
        .unwrap();
    wait_until("LISTEN", || async move {
        status_of(store, app_ref, key).await == Some(PortForwardStatus::Listen)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(f.cluster.forward_calls(), 1);

    // A matching line forces a clean restart
    f.cluster.emit_after_ready(&format!(
        "E0101 portforward.go:234] error creating error stream for port {} -> 80: Timeout occurred",
        port
    ));
    f.manager
        .start(&command(port, 80, "web-abc"), StartMode::Reregister)
        .await
        .unwrap();
    let cluster = &f.cluster;
    wait_until("stream restarted", || async move {
        cluster.forward_calls() >= 3
    })
    .await;
    assert_eq!(f.manager.list_running().len(), 1);
    wait_until("LISTEN after restart", || async move {
        status_of(store, app_ref, key).await == Some(PortForwardStatus::Listen)
    })
    .await;
}

#[tokio::test]
async fn test_invalid_command_rejected() {
    let f = fixture();
    let mut cmd = command(free_port(), 80, "web-abc");
    cmd.namespace.clear();

    let err = f.manager.start(&cmd, StartMode::Fresh).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidCommand);
}

#[tokio::test]
async fn test_path_like_names_rejected() {
    let f = fixture();
    f.cluster.add_pod("web-abc");
    let port = free_port();

    let mut cmd = command(port, 80, "web-abc");
    cmd.namespace = "../../escaped".to_string();
    let err = f.manager.start(&cmd, StartMode::Fresh).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidCommand);

    let mut cmd = command(port, 80, "web-abc");
    cmd.application = "shop/../../x".to_string();
    let err = f.manager.stop(&cmd).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidCommand);

    assert!(f.manager.list_running().is_empty());
    assert_eq!(f.cluster.forward_calls(), 0);
    let escaped = f._dir.path().parent().unwrap().join("escaped");
    assert!(!escaped.exists());
}
