mod common;

use std::sync::Arc;

use tempfile::TempDir;

use common::{free_port, record, status_of, test_settings, wait_until, MockCluster};
use pt_core::store::ProfileStore;
use pt_core::{AppRef, ForwardKey, PortForwardStatus, PrivilegeLevel};
use pt_daemon::{recover_all, ForwardManager, RecoveryReport};

fn manager(store: &Arc<ProfileStore>, cluster: &Arc<MockCluster>) -> ForwardManager {
    ForwardManager::new(
        Arc::clone(store),
        cluster.clone(),
        test_settings(),
        PrivilegeLevel::Unprivileged,
    )
}

#[tokio::test]
async fn test_recovers_own_records_and_skips_foreign() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ProfileStore::new(dir.path()));
    let cluster = MockCluster::new();
    cluster.add_pod("web-abc");

    let shop = AppRef::new("dev", "shop");
    let blog = AppRef::new("staging", "blog");
    let own = [free_port(), free_port(), free_port()];

    store
        .add_record(&shop, "web", "deployment", record(own[0], 80, "web-abc", false))
        .await
        .unwrap();
    store
        .add_record(&shop, "api", "deployment", record(own[1], 8080, "web-abc", false))
        .await
        .unwrap();
    store
        .add_record(&blog, "web", "statefulset", record(own[2], 80, "web-abc", false))
        .await
        .unwrap();
    store
        .add_record(&shop, "web", "deployment", record(free_port(), 443, "web-abc", true))
        .await
        .unwrap();
    store
        .add_record(&blog, "web", "statefulset", record(free_port(), 22, "web-abc", true))
        .await
        .unwrap();

    let manager = manager(&store, &cluster);
    let report = recover_all(&manager, &store).await;

    assert_eq!(
        report,
        RecoveryReport {
            recovered: 3,
            skipped_foreign: 2,
            failed: 0,
        }
    );
    assert_eq!(manager.list_running().len(), 3);

    let (store_ref, shop_ref) = (&store, &shop);
    let key = ForwardKey::new(own[0], 80);
    wait_until("recovered tunnel listens", || async move {
        status_of(store_ref, shop_ref, key).await == Some(PortForwardStatus::Listen)
    })
    .await;

    manager.shutdown().await;
}

#[tokio::test]
async fn test_recovery_on_taken_port_deletes_record() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ProfileStore::new(dir.path()));
    let cluster = MockCluster::new();
    cluster.add_pod("web-abc");

    let shop = AppRef::new("dev", "shop");
    let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = held.local_addr().unwrap().port();
    let open = free_port();

    store
        .add_record(&shop, "web", "deployment", record(taken, 80, "web-abc", false))
        .await
        .unwrap();
    store
        .add_record(&shop, "web", "deployment", record(open, 81, "web-abc", false))
        .await
        .unwrap();

    let manager = manager(&store, &cluster);
    let report = recover_all(&manager, &store).await;

    assert_eq!(report.recovered, 1);
    assert_eq!(report.failed, 1);
    assert!(store
        .find_record(&shop, ForwardKey::new(taken, 80))
        .await
        .unwrap()
        .is_none());
    assert!(store
        .find_record(&shop, ForwardKey::new(open, 81))
        .await
        .unwrap()
        .is_some());
    assert_eq!(manager.list_running().len(), 1);

    manager.shutdown().await;
    drop(held);
}

#[tokio::test]
async fn test_recovery_with_no_data_is_empty() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ProfileStore::new(dir.path()));
    let cluster = MockCluster::new();

    let manager = manager(&store, &cluster);
    let report = recover_all(&manager, &store).await;
    assert_eq!(report, RecoveryReport::default());
}
