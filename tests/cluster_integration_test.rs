//! Multi-replica scenarios against an in-process fake consensus cluster:
//! convergence after a write burst, fresh-replica join with snapshot
//! transfer, and HA lock handover.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::FakeEngine;
use common::FakeRaft;
use r_store::BackendConfig;
use r_store::Peer;
use r_store::RaftBackend;
use r_store::StaticAddressResolver;
use r_store::StorageEntry;
use r_store::TxnOp;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn new_replica(
    cluster: &FakeRaft,
    attach: bool,
) -> (RaftBackend<FakeEngine>, Arc<FakeEngine>, TempDir) {
    let dir = tempfile::tempdir().expect("should succeed");
    let engine = cluster.engine();
    let backend =
        RaftBackend::new(BackendConfig::new(dir.path()), engine.clone()).expect("should succeed");
    if attach {
        cluster.attach(&engine);
    }
    backend
        .setup_cluster(Arc::new(StaticAddressResolver::default()))
        .await
        .expect("should succeed");
    (backend, engine, dir)
}

/// Recursively collect the full key/value set through the public read API.
fn dump(
    backend: &RaftBackend<FakeEngine>,
    prefix: &str,
) -> BTreeMap<String, Vec<u8>> {
    let mut out = BTreeMap::new();
    for entry in backend.list(prefix).expect("should succeed") {
        let full = format!("{prefix}{entry}");
        if entry.ends_with('/') {
            out.extend(dump(backend, &full));
        } else {
            let value = backend.get(&full).expect("should succeed").expect("entry present");
            out.insert(full, value.value);
        }
    }
    out
}

#[tokio::test]
async fn test_three_replica_convergence() {
    let cluster = FakeRaft::new();

    let (leader, leader_engine, _d1) = new_replica(&cluster, true).await;
    leader
        .bootstrap(vec![Peer::new(leader.node_id(), leader.node_id())])
        .expect("should succeed");
    cluster.set_leader(&leader_engine);

    let (follower_a, _ea, _d2) = new_replica(&cluster, true).await;
    let (follower_b, _eb, _d3) = new_replica(&cluster, true).await;

    leader
        .add_peer(Peer::new(follower_a.node_id(), follower_a.node_id()))
        .await
        .expect("should succeed");
    leader
        .add_peer(Peer::new(follower_b.node_id(), follower_b.node_id()))
        .await
        .expect("should succeed");

    // Burst of writes through the leader, mixing singles, deletes and batches
    for i in 0..50u32 {
        leader
            .put(StorageEntry::new(
                format!("data/key-{i:03}"),
                format!("value-{i}").into_bytes(),
            ))
            .await
            .expect("should succeed");
    }
    leader.delete("data/key-007").await.expect("should succeed");
    leader
        .transaction(vec![
            TxnOp::Put {
                key: "txn/a".to_string(),
                value: b"1".to_vec(),
            },
            TxnOp::Delete {
                key: "data/key-008".to_string(),
            },
        ])
        .await
        .expect("should succeed");

    // Quiescent: every replica holds the identical key set and applied triple
    let expected = dump(&leader, "");
    assert_eq!(dump(&follower_a, ""), expected);
    assert_eq!(dump(&follower_b, ""), expected);

    let state = leader.latest_state();
    assert_eq!(follower_a.latest_state(), state);
    assert_eq!(follower_b.latest_state(), state);
    assert_eq!(state.configuration.peers.len(), 3);
}

#[tokio::test]
async fn test_fresh_replica_joins_via_snapshot_transfer() {
    let cluster = FakeRaft::new();

    let (leader, leader_engine, _d1) = new_replica(&cluster, true).await;
    leader
        .bootstrap(vec![Peer::new(leader.node_id(), leader.node_id())])
        .expect("should succeed");
    cluster.set_leader(&leader_engine);

    let (follower, _ef, _d2) = new_replica(&cluster, true).await;
    leader
        .add_peer(Peer::new(follower.node_id(), follower.node_id()))
        .await
        .expect("should succeed");

    for i in 0..30u32 {
        leader
            .put(StorageEntry::new(format!("secret/{i}"), vec![i as u8; 64]))
            .await
            .expect("should succeed");
    }

    // A fresh replica joins the two-node cluster: the membership change is
    // committed first, then the far-behind joiner receives a full snapshot
    // and only afterwards follows the log.
    let (joiner, joiner_engine, _d3) = new_replica(&cluster, false).await;
    leader
        .add_peer(Peer::new(joiner.node_id(), joiner.node_id()))
        .await
        .expect("should succeed");
    cluster
        .transfer_snapshot(&leader_engine, &joiner_engine)
        .expect("should succeed");
    cluster.attach(&joiner_engine);

    // Writes after the join reach the joiner through the log
    leader
        .put(StorageEntry::new("secret/after-join", b"fresh".to_vec()))
        .await
        .expect("should succeed");

    assert_eq!(dump(&joiner, ""), dump(&leader, ""));
    assert_eq!(joiner.latest_state(), leader.latest_state());
    assert!(joiner.latest_state().configuration.contains(joiner.node_id()));

    // Removal follows the symmetric path
    leader.remove_peer(follower.node_id()).await.expect("should succeed");
    assert!(!leader.latest_state().configuration.contains(follower.node_id()));
}

#[tokio::test]
async fn test_ha_lock_handover() {
    let cluster = FakeRaft::new();

    let (first, first_engine, _d1) = new_replica(&cluster, true).await;
    first
        .bootstrap(vec![Peer::new(first.node_id(), first.node_id())])
        .expect("should succeed");
    cluster.set_leader(&first_engine);

    let (second, second_engine, _d2) = new_replica(&cluster, true).await;
    first
        .add_peer(Peer::new(second.node_id(), second.node_id()))
        .await
        .expect("should succeed");

    let cancel = CancellationToken::new();
    let mut lost = first.lock(&cancel).await.expect("should succeed");
    assert!(first.has_leader_lock());
    assert!(!second.has_leader_lock());

    // Leadership moves: the old holder observes involuntary loss, the new
    // leader can acquire.
    cluster.set_leader(&second_engine);
    lost.changed().await.expect("should succeed");
    assert!(!first.has_leader_lock());
    first.release();

    let cancel = CancellationToken::new();
    second.lock(&cancel).await.expect("should succeed");
    assert!(second.has_leader_lock());

    // Writes now only succeed through the new leader
    assert!(first.put(StorageEntry::new("k", b"v".to_vec())).await.is_err());
    second.put(StorageEntry::new("k", b"v".to_vec())).await.expect("should succeed");
}
