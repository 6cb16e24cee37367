//! Single-node cluster bring-up: the replicated store, the registry, and
//! the reconciler working against real consensus.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use wag_core::ClusteringConfig;
use wag_raft::ClusterHealth;
use wag_raft::HealthMonitor;
use wag_raft::RaftNode;
use wag_reconciler::DataplaneCall;
use wag_reconciler::Reconciler;
use wag_reconciler::SessionTracker;
use wag_reconciler::TrackingDataplane;
use wag_registry::EventDispatcher;
use wag_registry::Registry;
use wag_store::EventKind;
use wag_store::SortOrder;
use wag_store::Store;

fn single_node_config(port: u16, database_location: &Path) -> ClusteringConfig {
    ClusteringConfig {
        name: "node1".to_string(),
        listen_address: format!("127.0.0.1:{port}"),
        peers: BTreeMap::new(),
        database_location: database_location.to_path_buf(),
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

#[tokio::test]
async fn single_node_cluster_serves_reads_writes_and_watches() {
    let dir = tempfile::tempdir().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let node = RaftNode::start(&single_node_config(free_port(), dir.path()), shutdown_rx).await.unwrap();
    node.wait_ready(Duration::from_secs(10)).await.unwrap();

    let store = node.store();
    let mut watch_stream = store.watch("users-");

    let revision = store.put("users-alice", r#"{"username":"alice"}"#).await.unwrap();
    assert!(revision > 0);

    let entry = store.get("users-alice").await.unwrap().unwrap();
    assert_eq!(entry.value, r#"{"username":"alice"}"#);

    let event = tokio::time::timeout(Duration::from_secs(5), watch_stream.next()).await.unwrap().unwrap();
    assert_eq!(event.kind, EventKind::Created);
    assert_eq!(event.key, "users-alice");

    store.delete("users-alice").await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), watch_stream.next()).await.unwrap().unwrap();
    assert_eq!(event.kind, EventKind::Deleted);

    node.shutdown().await;
}

#[tokio::test]
async fn registry_transactions_commit_through_consensus() {
    let dir = tempfile::tempdir().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let node = RaftNode::start(&single_node_config(free_port(), dir.path()), shutdown_rx).await.unwrap();
    node.wait_ready(Duration::from_secs(10)).await.unwrap();

    let store: Arc<dyn Store> = node.store();
    let registry = Registry::new(store.clone(), node.node_id());

    registry.create_user("alice").await.unwrap();
    registry.add_device("alice", "10.0.0.5", "KA==", "psk").await.unwrap();

    let reference = store.get("deviceref-KA==").await.unwrap().unwrap();
    assert_eq!(reference.value, "devices-alice-10.0.0.5");

    registry.delete_user("alice").await.unwrap();
    assert!(store.list("devices-alice-", SortOrder::Ascending).await.unwrap().is_empty());
    assert!(store.list("deviceref-", SortOrder::Ascending).await.unwrap().is_empty());

    node.shutdown().await;
}

#[tokio::test]
async fn reconciler_rebuilds_the_dataplane_over_a_real_store() {
    let dir = tempfile::tempdir().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let node = RaftNode::start(&single_node_config(free_port(), dir.path()), shutdown_rx).await.unwrap();
    node.wait_ready(Duration::from_secs(10)).await.unwrap();

    let store: Arc<dyn Store> = node.store();
    let registry = Registry::new(store.clone(), node.node_id());
    registry.set_setting(wag_core::keys::LOCKOUT_KEY, &5u32).await.unwrap();
    registry.add_device("alice", "10.0.0.5", "KA==", "").await.unwrap();

    let dispatcher = EventDispatcher::new(store);
    let dataplane = Arc::new(TrackingDataplane::recording());
    let sessions = SessionTracker::new(registry.clone());
    let reconciler = Reconciler::new(registry.clone(), dispatcher, dataplane.clone(), sessions);

    // The device existed before the reconciler started: the replay must
    // still install it.
    reconciler.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let calls = dataplane.take_calls();
    assert!(calls.contains(&DataplaneCall::Setup { rejoin: false }));
    assert!(calls.contains(&DataplaneCall::AddPeer {
        public_key: "KA==".into(),
        username: "alice".into(),
        address: "10.0.0.5".into(),
    }));

    node.shutdown().await;
}

#[tokio::test]
async fn a_single_node_cluster_reports_healthy() {
    let dir = tempfile::tempdir().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let node = RaftNode::start(&single_node_config(free_port(), dir.path()), shutdown_rx).await.unwrap();
    node.wait_ready(Duration::from_secs(10)).await.unwrap();

    let monitor = HealthMonitor::new(node.node_id(), node.status_channel());
    // Either the initial status already reflects the elected leader or the
    // first transition does; poll briefly.
    let mut health = monitor.current();
    for _ in 0..50 {
        if health == ClusterHealth::Healthy {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        health = node.status_channel().borrow().health_of(node.node_id());
    }
    assert_eq!(health, ClusterHealth::Healthy);

    node.shutdown().await;
}
