//! Multi-node membership scenarios over an in-process network

use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{wait_for_tables, Reconnect, WaitConfig};
use crate::error::Error;
use crate::node::{ClusterNode, NodeOptions};
use crate::role::Role;
use crate::rpc::LocalNetwork;
use crate::shard::ShardRegistry;
use crate::storage::{StorageBackend, StorageStatus};
use crate::types::{
    CopyType, NodeFilter, NodeName, NodeStatus, Record, Shard, TableOptions, TxCall, Value,
};

fn name(s: &str) -> NodeName {
    NodeName::from(s)
}

async fn spawn(net: &Arc<LocalNetwork>, node: &str, role: Role) -> Arc<ClusterNode> {
    let mut options = NodeOptions::new(node, role);
    options.heartbeat_interval = Duration::from_millis(100);
    options.core_node_wait = Duration::from_millis(200);
    options.wait = WaitConfig {
        poll_interval: Duration::from_millis(10),
        table_wait_timeout: Duration::from_millis(200),
        table_wait_rounds: 3,
    };

    let node = Arc::new(ClusterNode::build(options, net.clone()));
    net.register(node.name().clone(), Arc::clone(node.dispatcher()));
    node.start().await.unwrap();
    node
}

/// Two joined core nodes; `b` owns table `orders` in shard `sh1`
async fn two_cores(net: &Arc<LocalNetwork>) -> (Arc<ClusterNode>, Arc<ClusterNode>) {
    let a = spawn(net, "a:4370", Role::Core).await;
    let b = spawn(net, "b:4370", Role::Core).await;
    b.router()
        .create_table("orders", &TableOptions::sharded("sh1"))
        .await
        .unwrap();
    a.membership().join_cluster(b.name()).await.unwrap();
    (a, b)
}

/// `two_cores` plus `c`, joined through `a`
async fn three_cores(
    net: &Arc<LocalNetwork>,
) -> (Arc<ClusterNode>, Arc<ClusterNode>, Arc<ClusterNode>) {
    let (a, b) = two_cores(net).await;
    let c = spawn(net, "c:4370", Role::Core).await;
    c.membership().join_cluster(a.name()).await.unwrap();
    (a, b, c)
}

fn kv(procedure: &str, args: serde_json::Value) -> TxCall {
    TxCall::new(procedure, Value::from(args))
}

#[tokio::test]
async fn test_join_copies_remote_tables() {
    let net = Arc::new(LocalNetwork::new());
    let a = spawn(&net, "a:4370", Role::Core).await;
    let b = spawn(&net, "b:4370", Role::Core).await;

    a.router()
        .create_table("scratch", &TableOptions::sharded("tmp"))
        .await
        .unwrap();
    b.router()
        .create_table("orders", &TableOptions::sharded("sh1"))
        .await
        .unwrap();
    b.storage()
        .dirty_write("orders", Record::new(1, "paid"))
        .await
        .unwrap();

    a.membership().join_cluster(b.name()).await.unwrap();

    // Local schema was replaced by the cluster's, contents included
    assert_eq!(a.storage().local_tables().await, vec!["orders".to_string()]);
    assert_eq!(
        a.storage().dirty_read("orders", &Value::Int(1)).await.unwrap(),
        Some(Record::new(1, "paid"))
    );
    assert_eq!(a.shards().shard_of("orders").await, Some(Shard::named("sh1")));
    assert_eq!(a.shards().shard_of("scratch").await, None);
    assert_eq!(a.storage().schema_copy_type().await, CopyType::Disc);

    let expected = vec![name("a:4370"), name("b:4370")];
    assert_eq!(a.membership().cluster_nodes(NodeFilter::All).await, expected);
    assert_eq!(b.membership().cluster_nodes(NodeFilter::All).await, expected);
    assert!(a.membership().is_node_in_cluster(a.name()).await);
    assert_eq!(
        b.membership().cluster_status(a.name()).await,
        Some(NodeStatus::Running)
    );
}

#[tokio::test]
async fn test_third_core_joins_whole_cluster() {
    let net = Arc::new(LocalNetwork::new());
    let (a, b) = two_cores(&net).await;
    let c = spawn(&net, "c:4370", Role::Core).await;

    c.membership().join_cluster(a.name()).await.unwrap();

    let expected = vec![name("a:4370"), name("b:4370"), name("c:4370")];
    for node in [&a, &b, &c] {
        assert_eq!(node.membership().cluster_nodes(NodeFilter::All).await, expected);
    }
}

#[tokio::test]
async fn test_join_involving_replicant_is_noop() {
    let net = Arc::new(LocalNetwork::new());
    let core = spawn(&net, "core:4370", Role::Core).await;
    let replicant = spawn(&net, "rep:4370", Role::Replicant).await;

    replicant
        .router()
        .create_table("cache", &TableOptions::local_content())
        .await
        .unwrap();

    replicant.membership().join_cluster(core.name()).await.unwrap();
    assert_eq!(replicant.storage().local_tables().await, vec!["cache".to_string()]);

    core.router()
        .create_table("orders", &TableOptions::sharded("sh1"))
        .await
        .unwrap();
    core.membership().join_cluster(replicant.name()).await.unwrap();
    assert_eq!(core.storage().local_tables().await, vec!["orders".to_string()]);
    assert_eq!(
        core.membership().cluster_nodes(NodeFilter::All).await,
        vec![name("core:4370")]
    );
}

#[tokio::test]
async fn test_replicant_join_does_not_contact_target() {
    let net = Arc::new(LocalNetwork::new());
    let replicant = spawn(&net, "rep:4370", Role::Replicant).await;
    replicant
        .router()
        .create_table("cache", &TableOptions::local_content())
        .await
        .unwrap();

    // Nothing is registered under this name, so any call to it fails
    replicant
        .membership()
        .join_cluster(&name("gone:4370"))
        .await
        .unwrap();

    assert_eq!(replicant.storage().status().await, StorageStatus::Running);
    assert_eq!(replicant.storage().local_tables().await, vec!["cache".to_string()]);
}

#[tokio::test]
async fn test_join_self_is_rejected() {
    let net = Arc::new(LocalNetwork::new());
    let a = spawn(&net, "a:4370", Role::Core).await;

    let result = a.membership().join_cluster(a.name()).await;
    assert!(matches!(result, Err(Error::SelfTarget(_))));
}

#[tokio::test]
async fn test_join_unreachable_target_is_not_rolled_back() {
    let net = Arc::new(LocalNetwork::new());
    let a = spawn(&net, "a:4370", Role::Core).await;
    let b = spawn(&net, "b:4370", Role::Core).await;
    a.router()
        .create_table("scratch", &TableOptions::sharded("tmp"))
        .await
        .unwrap();

    // Learn b's role, then lose it
    a.membership().probe_peers(&[b.name().clone()]).await;
    net.set_down(b.name(), true);

    let result = a.membership().join_cluster(b.name()).await;
    assert!(matches!(result, Err(Error::FailedToConnectNode(n)) if n == *b.name()));

    // The schema was already wiped when the connect step failed
    assert_eq!(a.storage().status().await, StorageStatus::Running);
    assert!(a.storage().local_tables().await.is_empty());
}

#[tokio::test]
async fn test_leave_cluster() {
    let net = Arc::new(LocalNetwork::new());
    let (a, b) = two_cores(&net).await;

    a.membership().leave_cluster().await.unwrap();

    assert_eq!(a.storage().status().await, StorageStatus::Stopped);
    assert!(!a.membership().is_node_in_cluster(a.name()).await);
    assert_eq!(
        b.membership().cluster_nodes(NodeFilter::All).await,
        vec![name("b:4370")]
    );
    assert_eq!(b.membership().cluster_status(a.name()).await, None);
}

#[tokio::test]
async fn test_leave_alone_is_not_in_cluster() {
    let net = Arc::new(LocalNetwork::new());
    let a = spawn(&net, "a:4370", Role::Core).await;

    assert!(!a.membership().is_node_in_cluster(a.name()).await);
    assert!(matches!(
        a.membership().leave_cluster().await,
        Err(Error::NodeNotInCluster)
    ));
}

#[tokio::test]
async fn test_leave_via_node_not_running() {
    let net = Arc::new(LocalNetwork::new());
    let (a, _b) = two_cores(&net).await;

    let result = a.membership().leave_cluster_via(&name("x:4370")).await;
    assert!(matches!(result, Err(Error::NodeNotRunning(n)) if n == name("x:4370")));
    assert_eq!(a.storage().status().await, StorageStatus::Running);
}

#[tokio::test]
async fn test_leave_fails_when_every_peer_fails() {
    let net = Arc::new(LocalNetwork::new());
    let (a, b) = two_cores(&net).await;

    // Peer still looks running but no longer answers
    net.set_down(b.name(), true);

    match a.membership().leave_cluster().await {
        Err(Error::FailedToLeave { remaining }) => assert_eq!(remaining, vec![name("b:4370")]),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_leave_falls_through_to_next_peer() {
    let net = Arc::new(LocalNetwork::new());
    let (a, b, c) = three_cores(&net).await;

    // b sorts first and still looks running, but no longer answers
    net.set_down(b.name(), true);

    a.membership().leave_cluster().await.unwrap();

    assert_eq!(a.storage().status().await, StorageStatus::Stopped);
    assert_eq!(
        c.storage().db_nodes().await,
        vec![name("b:4370"), name("c:4370")]
    );
}

#[tokio::test]
async fn test_remove_unknown_node() {
    let net = Arc::new(LocalNetwork::new());
    let (a, _b) = two_cores(&net).await;
    let before = a.storage().db_nodes().await;

    let result = a.membership().remove_from_cluster(&name("x:4370")).await;
    assert!(matches!(result, Err(Error::NodeNotInCluster)));
    assert_eq!(a.storage().db_nodes().await, before);
}

#[tokio::test]
async fn test_remove_running_node() {
    let net = Arc::new(LocalNetwork::new());
    let (a, b) = two_cores(&net).await;

    a.membership().remove_from_cluster(b.name()).await.unwrap();

    assert_eq!(b.storage().status().await, StorageStatus::Stopped);
    assert!(b.storage().local_tables().await.is_empty());
    assert_eq!(
        a.membership().cluster_nodes(NodeFilter::All).await,
        vec![name("a:4370")]
    );
}

#[tokio::test]
async fn test_remove_stopped_node() {
    let net = Arc::new(LocalNetwork::new());
    let (a, b) = two_cores(&net).await;

    net.set_down(b.name(), true);
    a.membership().probe_peers(&[]).await;

    let running = a.membership().cluster_nodes(NodeFilter::Running).await;
    let stopped = a.membership().cluster_nodes(NodeFilter::Stopped).await;
    let all = a.membership().cluster_nodes(NodeFilter::All).await;
    assert_eq!(running, vec![name("a:4370")]);
    assert_eq!(stopped, vec![name("b:4370")]);
    assert!(running.iter().chain(stopped.iter()).all(|n| all.contains(n)));
    assert!(running.iter().all(|n| !stopped.contains(n)));
    assert_eq!(
        a.membership().cluster_status(b.name()).await,
        Some(NodeStatus::Stopped)
    );

    a.membership().remove_from_cluster(b.name()).await.unwrap();
    assert_eq!(
        a.membership().cluster_nodes(NodeFilter::All).await,
        vec![name("a:4370")]
    );
}

#[tokio::test]
async fn test_remove_running_replicant() {
    let net = Arc::new(LocalNetwork::new());
    let a = spawn(&net, "a:4370", Role::Core).await;
    let r = spawn(&net, "r:4370", Role::Replicant).await;
    r.membership().probe_peers(&[a.name().clone()]).await;
    assert_eq!(
        a.membership().cluster_status(r.name()).await,
        Some(NodeStatus::Running)
    );

    // A replicant has no schema copy to drop, only storage to stop
    a.membership().remove_from_cluster(r.name()).await.unwrap();

    assert_eq!(r.storage().status().await, StorageStatus::Stopped);
    assert_eq!(a.storage().db_nodes().await, vec![name("a:4370")]);
}

#[tokio::test]
async fn test_table_wait_copies_tables_created_after_join() {
    let net = Arc::new(LocalNetwork::new());
    let (a, b) = two_cores(&net).await;

    b.router()
        .create_table("users", &TableOptions::sharded("sh2"))
        .await
        .unwrap();
    b.storage()
        .dirty_write("users", Record::new("ann", "admin"))
        .await
        .unwrap();
    assert!(a.storage().local_tables().await.iter().all(|t| t != "users"));

    let wait = WaitConfig {
        poll_interval: Duration::from_millis(10),
        table_wait_timeout: Duration::from_millis(20),
        table_wait_rounds: 3,
    };
    wait_for_tables(
        a.storage().as_ref(),
        vec!["users".to_string()],
        a.membership().as_ref(),
        &wait,
    )
    .await
    .unwrap();

    assert_eq!(a.shards().shard_of("users").await, Some(Shard::named("sh2")));
    assert_eq!(
        a.storage().dirty_read("users", &Value::from("ann")).await.unwrap(),
        Some(Record::new("ann", "admin"))
    );

    // Nothing is missing any more, so another pass changes nothing
    a.membership().reconnect(&[]).await.unwrap();
    assert_eq!(a.storage().table_records("users").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_copy_table_loads_contents_from_peer() {
    let net = Arc::new(LocalNetwork::new());
    let (a, b) = two_cores(&net).await;

    b.router()
        .create_table("users", &TableOptions::sharded("sh2"))
        .await
        .unwrap();
    b.storage()
        .dirty_write("users", Record::new("ann", "admin"))
        .await
        .unwrap();
    a.shards().merge_tables(b.shards().tables().await).await.unwrap();

    a.router().copy_table("users", CopyType::Ram).await.unwrap();

    assert_eq!(
        a.storage().dirty_read("users", &Value::from("ann")).await.unwrap(),
        Some(Record::new("ann", "admin"))
    );
}

#[tokio::test]
async fn test_running_nodes_include_attached_replicants() {
    let net = Arc::new(LocalNetwork::new());
    let (a, b) = two_cores(&net).await;
    let r = spawn(&net, "r:4370", Role::Replicant).await;

    r.membership().probe_peers(&[a.name().clone()]).await;

    let expected = vec![name("a:4370"), name("b:4370"), name("r:4370")];
    assert_eq!(a.membership().running_nodes().await, expected);
    // b learns about r through the fan-out to a
    assert_eq!(b.membership().running_nodes().await, expected);

    // Without an up shard the replicant knows nothing
    assert!(r.membership().running_nodes().await.is_empty());
    r.shards().connect_session(&Shard::named("sh1"), a.name());
    assert_eq!(r.membership().running_nodes().await, expected);

    // An unreachable core is skipped by the fan-out
    net.set_down(b.name(), true);
    assert_eq!(a.membership().running_nodes().await, expected);
}

#[tokio::test]
async fn test_stopped_replicant_is_invisible() {
    let net = Arc::new(LocalNetwork::new());
    let a = spawn(&net, "a:4370", Role::Core).await;
    let r = spawn(&net, "r:4370", Role::Replicant).await;

    r.membership().probe_peers(&[a.name().clone()]).await;
    assert!(a
        .membership()
        .cluster_nodes(NodeFilter::All)
        .await
        .contains(r.name()));

    // The attachment lease (3 heartbeats) runs out
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!a
        .membership()
        .cluster_nodes(NodeFilter::All)
        .await
        .contains(r.name()));
    assert!(a
        .membership()
        .cluster_nodes(NodeFilter::Stopped)
        .await
        .is_empty());
}

#[tokio::test]
async fn test_replicant_transactions_reach_core() {
    let net = Arc::new(LocalNetwork::new());
    let a = spawn(&net, "a:4370", Role::Core).await;
    let r = spawn(&net, "r:4370", Role::Replicant).await;
    let sh1 = Shard::named("sh1");

    a.router()
        .create_table("orders", &TableOptions::sharded("sh1"))
        .await
        .unwrap();
    r.membership().probe_peers(&[a.name().clone()]).await;
    assert_eq!(r.shards().shard_of("orders").await, Some(sh1.clone()));

    r.router()
        .transaction(
            &sh1,
            &kv("kv.put", serde_json::json!({ "table": "orders", "key": 1, "value": "paid" })),
        )
        .await
        .unwrap();
    r.router()
        .dirty_write("orders", Record::new(2, "pending"))
        .await
        .unwrap();

    assert_eq!(
        a.storage().dirty_read("orders", &Value::Int(1)).await.unwrap(),
        Some(Record::new(1, "paid"))
    );
    assert_eq!(
        a.storage().dirty_read("orders", &Value::Int(2)).await.unwrap(),
        Some(Record::new(2, "pending"))
    );

    // Disconnected shard: reads go over RPC to the core
    let value = r
        .router()
        .ro_transaction(&sh1, &kv("kv.get", serde_json::json!({ "table": "orders", "key": 1 })))
        .await
        .unwrap();
    assert_eq!(value, Value::from("paid"));

    // Core down: the RPC failure surfaces as a transport error
    net.set_down(a.name(), true);
    let result = r
        .router()
        .ro_transaction(&sh1, &kv("kv.get", serde_json::json!({ "table": "orders", "key": 1 })))
        .await;
    assert!(matches!(result, Err(Error::Transport(_))));
}
