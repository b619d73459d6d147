// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end replication tests over in-memory nodes.
//!
//! Each test builds a [`MemoryCluster`], runs one supervisor per receiving
//! node and drives client writes through the nodes directly.
//!
//! Run with: cargo test --test replication -- --nocapture

mod common;

use bson::{doc, Bson};
use common::*;
use multimaster::{
    bootstrap, Checkpoint, MemoryCluster, OpSet, RuleConfig, SourceState, SqliteConfigStore,
    SupervisorState,
};
use std::sync::Arc;
use tempfile::tempdir;

const TAG: &str = "__mmm";

fn cluster(names: &[&str]) -> Arc<MemoryCluster> {
    init_tracing();
    Arc::new(MemoryCluster::with_nodes(names))
}

// =============================================================================
// Basic flow
// =============================================================================

/// Inserts, updates and deletes on a.db1.foo arrive in b.db2.bar.
#[tokio::test]
async fn insert_update_delete_flow_to_destination() {
    let cluster = cluster(&["a", "b"]);
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();
    let src = ns("db1.foo");
    let dst = ns("db2.bar");

    let supervisor = supervisor_for(&cluster, "b").await;
    supervisor
        .set_replication("a", dst.clone(), src.clone(), OpSet::ALL)
        .await
        .unwrap();
    supervisor.start(None).await.unwrap();
    wait_running(&supervisor).await;

    a.insert(&src, doc! { "_id": 1, "x": 1 }).await.unwrap();
    wait_until("insert replicated", || async {
        b.find_one(&dst, &doc! { "_id": 1 }).await.is_some()
    })
    .await;
    let replicated = b.find_one(&dst, &doc! { "_id": 1 }).await.unwrap();
    assert_eq!(replicated.get_i32("x").unwrap(), 1);
    assert_eq!(replicated.get_str(TAG).unwrap(), "a");

    a.update_one(&src, &doc! { "_id": 1 }, &doc! { "$set": { "x": 2 }, "$inc": { "n": 5 } }, false)
        .await
        .unwrap();
    wait_until("update replicated", || async {
        b.find_one(&dst, &doc! { "_id": 1, "x": 2 }).await.is_some()
    })
    .await;
    let replicated = b.find_one(&dst, &doc! { "_id": 1 }).await.unwrap();
    assert_eq!(replicated.get_i32("n").unwrap(), 5);

    a.update_one(&src, &doc! { "_id": 1 }, &doc! { "y": "replaced" }, false)
        .await
        .unwrap();
    wait_until("replacement replicated", || async {
        b.find_one(&dst, &doc! { "_id": 1, "y": "replaced" }).await.is_some()
    })
    .await;
    let replicated = b.find_one(&dst, &doc! { "_id": 1 }).await.unwrap();
    assert!(replicated.get("x").is_none());
    assert_eq!(replicated.get_str(TAG).unwrap(), "a");

    a.delete_many(&src, &doc! { "_id": 1 }).await;
    wait_until("delete replicated", || async { b.count(&dst).await == 0 }).await;

    assert_eq!(supervisor.source_state("a").await, Some(SourceState::Running));
    supervisor.shutdown().await;
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}

/// Upserts on the source are logged as inserts and replicate as such.
#[tokio::test]
async fn upsert_replicates_as_insert() {
    let cluster = cluster(&["a", "b"]);
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();
    let foo = ns("db.foo");

    let supervisor = supervisor_for(&cluster, "b").await;
    supervisor
        .set_replication("a", foo.clone(), foo.clone(), OpSet::parse("i").unwrap())
        .await
        .unwrap();
    supervisor.start(None).await.unwrap();
    wait_running(&supervisor).await;

    a.update_one(&foo, &doc! { "_id": "u1" }, &doc! { "$set": { "v": 1 } }, true)
        .await
        .unwrap();
    wait_until("upsert replicated", || async {
        b.find_one(&foo, &doc! { "_id": "u1", "v": 1 }).await.is_some()
    })
    .await;
    supervisor.shutdown().await;
}

/// Writes to namespaces without a rule are never copied.
#[tokio::test]
async fn unmapped_namespaces_are_ignored() {
    let cluster = cluster(&["a", "b"]);
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();

    let supervisor = supervisor_for(&cluster, "b").await;
    supervisor
        .set_replication("a", ns("db.foo"), ns("db.foo"), OpSet::ALL)
        .await
        .unwrap();
    supervisor.start(None).await.unwrap();
    wait_running(&supervisor).await;

    a.insert(&ns("db.other"), doc! { "_id": 1 }).await.unwrap();
    a.insert(&ns("db.foo"), doc! { "_id": 2 }).await.unwrap();
    wait_until("mapped insert replicated", || async {
        b.count(&ns("db.foo")).await == 1
    })
    .await;
    assert_eq!(b.count(&ns("db.other")).await, 0);
    supervisor.shutdown().await;
}

// =============================================================================
// Origin tags and loops
// =============================================================================

/// a <-> b: writes are applied on the peer and replication stops after at
/// most one echo.
#[tokio::test]
async fn bidirectional_writes_do_not_loop() {
    let cluster = cluster(&["a", "b"]);
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();
    let foo = ns("db.foo");

    let sup_a = supervisor_for(&cluster, "a").await;
    let sup_b = supervisor_for(&cluster, "b").await;
    sup_a
        .set_replication("b", foo.clone(), foo.clone(), OpSet::ALL)
        .await
        .unwrap();
    sup_b
        .set_replication("a", foo.clone(), foo.clone(), OpSet::ALL)
        .await
        .unwrap();
    sup_a.start(None).await.unwrap();
    wait_running(&sup_a).await;
    sup_b.start(None).await.unwrap();
    wait_running(&sup_b).await;

    a.insert(&foo, doc! { "_id": "from_a" }).await.unwrap();
    b.insert(&foo, doc! { "_id": "from_b" }).await.unwrap();
    wait_until("both inserts crossed over", || async {
        a.count(&foo).await == 2 && b.count(&foo).await == 2
    })
    .await;
    settle().await;

    // One client insert plus one replicated insert per node.
    assert_eq!(a.oplog_len().await, 2);
    assert_eq!(b.oplog_len().await, 2);

    let on_b = b.find_one(&foo, &doc! { "_id": "from_a" }).await.unwrap();
    assert_eq!(on_b.get_str(TAG).unwrap(), "a");
    let on_a = a.find_one(&foo, &doc! { "_id": "from_a" }).await.unwrap();
    assert!(on_a.get(TAG).is_none());

    a.update_one(&foo, &doc! { "_id": "from_a" }, &doc! { "$set": { "x": 1 } }, false)
        .await
        .unwrap();
    wait_until("update crossed over", || async {
        b.find_one(&foo, &doc! { "_id": "from_a", "x": 1 }).await.is_some()
    })
    .await;
    // b's tag did not change, so its logged diff carries none and the update
    // comes back to a once. There it only adds b's tag, which b skips.
    let mut echoed = doc! { "_id": "from_a" };
    echoed.insert(TAG, "b");
    wait_until("update echo settled on a", || async {
        a.find_one(&foo, &echoed).await.is_some()
    })
    .await;
    settle().await;
    assert_eq!(a.oplog_len().await, 4);
    assert_eq!(b.oplog_len().await, 3);

    a.delete_many(&foo, &doc! { "_id": "from_a" }).await;
    wait_until("delete crossed over", || async { b.count(&foo).await == 1 }).await;
    settle().await;
    // b's delete comes back to a and matches nothing, so a logs nothing more.
    assert_eq!(a.oplog_len().await, 5);
    assert_eq!(b.oplog_len().await, 4);

    assert_eq!(sup_a.source_state("b").await, Some(SourceState::Running));
    assert_eq!(sup_b.source_state("a").await, Some(SourceState::Running));
    sup_a.shutdown().await;
    sup_b.shutdown().await;
}

/// a -> b -> c: the tag still names a when the document reaches c.
#[tokio::test]
async fn chained_replication_preserves_origin() {
    let cluster = cluster(&["a", "b", "c"]);
    let a = cluster.node("a").unwrap();
    let c = cluster.node("c").unwrap();
    let foo = ns("db.foo");

    let sup_b = supervisor_for(&cluster, "b").await;
    let sup_c = supervisor_for(&cluster, "c").await;
    sup_b
        .set_replication("a", foo.clone(), foo.clone(), OpSet::ALL)
        .await
        .unwrap();
    sup_c
        .set_replication("b", foo.clone(), foo.clone(), OpSet::ALL)
        .await
        .unwrap();
    sup_b.start(None).await.unwrap();
    wait_running(&sup_b).await;
    sup_c.start(None).await.unwrap();
    wait_running(&sup_c).await;

    a.insert(&foo, doc! { "_id": 1 }).await.unwrap();
    wait_until("insert reached c", || async {
        c.find_one(&foo, &doc! { "_id": 1 }).await.is_some()
    })
    .await;
    let on_c = c.find_one(&foo, &doc! { "_id": 1 }).await.unwrap();
    assert_eq!(on_c.get_str(TAG).unwrap(), "a");

    sup_b.shutdown().await;
    sup_c.shutdown().await;
}

/// a -> b -> c -> a: the write stops when it would re-enter a.
#[tokio::test]
async fn three_node_ring_terminates() {
    let cluster = cluster(&["a", "b", "c"]);
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();
    let c = cluster.node("c").unwrap();
    let foo = ns("db.foo");

    let sup_a = supervisor_for(&cluster, "a").await;
    let sup_b = supervisor_for(&cluster, "b").await;
    let sup_c = supervisor_for(&cluster, "c").await;
    for (sup, from) in [(&sup_a, "c"), (&sup_b, "a"), (&sup_c, "b")] {
        sup.set_replication(from, foo.clone(), foo.clone(), OpSet::ALL)
            .await
            .unwrap();
        sup.start(None).await.unwrap();
        wait_running(&sup).await;
    }

    a.insert(&foo, doc! { "_id": 1 }).await.unwrap();
    wait_until("insert went around the ring", || async {
        c.count(&foo).await == 1
    })
    .await;
    settle().await;

    assert_eq!(a.count(&foo).await, 1);
    assert_eq!(a.oplog_len().await, 1);
    assert_eq!(b.oplog_len().await, 1);
    assert_eq!(c.oplog_len().await, 1);

    for sup in [&sup_a, &sup_b, &sup_c] {
        sup.shutdown().await;
    }
}

// =============================================================================
// Idempotence
// =============================================================================

/// An insert whose `_id` already exists is skipped and replication goes on.
#[tokio::test]
async fn duplicate_insert_is_skipped() {
    let cluster = cluster(&["a", "b"]);
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();
    let foo = ns("db.foo");

    b.insert(&foo, doc! { "_id": 1, "owner": "b" }).await.unwrap();

    let supervisor = supervisor_for(&cluster, "b").await;
    supervisor
        .set_replication("a", foo.clone(), foo.clone(), OpSet::ALL)
        .await
        .unwrap();
    supervisor.start(None).await.unwrap();
    wait_running(&supervisor).await;

    a.insert(&foo, doc! { "_id": 1, "owner": "a" }).await.unwrap();
    a.insert(&foo, doc! { "_id": 2 }).await.unwrap();
    wait_until("second insert replicated", || async {
        b.count(&foo).await == 2
    })
    .await;

    let kept = b.find_one(&foo, &doc! { "_id": 1 }).await.unwrap();
    assert_eq!(kept.get_str("owner").unwrap(), "b");
    assert_eq!(supervisor.source_state("a").await, Some(SourceState::Running));
    supervisor.shutdown().await;
}

/// Deleting a document the destination never had is harmless.
#[tokio::test]
async fn delete_of_absent_document_is_harmless() {
    let cluster = cluster(&["a", "b"]);
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();
    let foo = ns("db.foo");

    // Written before replication starts, so b never sees it.
    a.insert(&foo, doc! { "_id": "old" }).await.unwrap();

    let supervisor = supervisor_for(&cluster, "b").await;
    supervisor
        .set_replication("a", foo.clone(), foo.clone(), OpSet::ALL)
        .await
        .unwrap();
    supervisor.start(None).await.unwrap();
    wait_running(&supervisor).await;

    a.delete_many(&foo, &doc! { "_id": "old" }).await;
    a.insert(&foo, doc! { "_id": "new" }).await.unwrap();
    wait_until("later insert replicated", || async {
        b.count(&foo).await == 1
    })
    .await;
    assert_eq!(supervisor.source_state("a").await, Some(SourceState::Running));
    supervisor.shutdown().await;
}

// =============================================================================
// Checkpoints
// =============================================================================

/// The in-memory checkpoint never moves backwards and catches up to the
/// source's head.
#[tokio::test]
async fn checkpoint_is_monotonic() {
    let cluster = cluster(&["a", "b"]);
    let a = cluster.node("a").unwrap();
    let foo = ns("db.foo");

    let supervisor = supervisor_for(&cluster, "b").await;
    supervisor
        .set_replication("a", foo.clone(), foo.clone(), OpSet::ALL)
        .await
        .unwrap();
    supervisor.start(None).await.unwrap();
    wait_running(&supervisor).await;

    let mut last = supervisor.source_checkpoint("a").await.unwrap();
    for i in 0..50 {
        a.insert(&foo, doc! { "_id": i }).await.unwrap();
        if i % 5 == 0 {
            a.append_noop().await;
        }
        let current = supervisor.source_checkpoint("a").await.unwrap();
        assert!(current >= last, "checkpoint went back: {} -> {}", last, current);
        last = current;
    }

    let head = a.latest_position().await.unwrap();
    wait_until("checkpoint reached head", || async {
        supervisor.source_checkpoint("a").await == Some(head)
    })
    .await;
    supervisor.shutdown().await;
}

/// Only the kinds a rule names are applied.
#[tokio::test]
async fn rule_ops_limit_applied_kinds() {
    let cluster = cluster(&["a", "b"]);
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();
    let foo = ns("db.foo");

    let supervisor = supervisor_for(&cluster, "b").await;
    supervisor
        .set_replication("a", foo.clone(), foo.clone(), OpSet::parse("i").unwrap())
        .await
        .unwrap();
    supervisor.start(None).await.unwrap();
    wait_running(&supervisor).await;

    a.insert(&foo, doc! { "_id": 1, "x": 1 }).await.unwrap();
    wait_until("insert replicated", || async { b.count(&foo).await == 1 }).await;

    a.update_one(&foo, &doc! { "_id": 1 }, &doc! { "$set": { "x": 2 } }, false)
        .await
        .unwrap();
    a.delete_many(&foo, &doc! { "_id": 1 }).await;
    let head = a.latest_position().await.unwrap();
    wait_until("reader passed the update and delete", || async {
        supervisor.source_checkpoint("a").await >= Some(head)
    })
    .await;

    let doc = b.find_one(&foo, &doc! { "_id": 1 }).await.unwrap();
    assert_eq!(doc.get_i32("x").unwrap(), 1);
    supervisor.shutdown().await;
}

/// After a restart on the same store, replication resumes where it stopped:
/// writes made while down arrive and nothing is applied twice.
#[tokio::test]
async fn restart_resumes_from_stored_checkpoint() {
    let cluster = cluster(&["a", "b"]);
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();
    let foo = ns("db.foo");
    let dir = tempdir().unwrap();
    let path = dir.path().join("mmm.db");

    let store = Arc::new(SqliteConfigStore::new(&path).await.unwrap());
    let supervisor = supervisor_with_store(&cluster, "b", Arc::clone(&store)).await;
    supervisor
        .set_replication("a", foo.clone(), foo.clone(), OpSet::ALL)
        .await
        .unwrap();
    supervisor.start(None).await.unwrap();
    wait_running(&supervisor).await;

    a.insert(&foo, doc! { "_id": 1 }).await.unwrap();
    wait_until("first insert replicated", || async { b.count(&foo).await == 1 }).await;
    supervisor.shutdown().await;
    store.close().await;
    drop(supervisor);

    a.insert(&foo, doc! { "_id": 2 }).await.unwrap();
    a.update_one(&foo, &doc! { "_id": 1 }, &doc! { "$set": { "later": true } }, false)
        .await
        .unwrap();

    let store = Arc::new(SqliteConfigStore::new(&path).await.unwrap());
    let supervisor = supervisor_with_store(&cluster, "b", store).await;
    let dump = supervisor.dump_config().await.unwrap();
    assert_eq!(dump["a"].len(), 1);

    supervisor.start(None).await.unwrap();

    wait_running(&supervisor).await;
    wait_until("writes made while down replicated", || async {
        b.find_one(&foo, &doc! { "_id": 1, "later": true }).await.is_some()
            && b.count(&foo).await == 2
    })
    .await;

    // b logged exactly one entry per applied write.
    assert_eq!(b.oplog_len().await, 3);
    supervisor.shutdown().await;
}

/// An explicit start checkpoint overrides the stored one and replays.
#[tokio::test]
async fn start_with_checkpoint_replays_history() {
    let cluster = cluster(&["a", "b"]);
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();
    let foo = ns("db.foo");

    for i in 0..5 {
        a.insert(&foo, doc! { "_id": i }).await.unwrap();
    }

    let supervisor = supervisor_for(&cluster, "b").await;
    supervisor
        .set_replication("a", foo.clone(), foo.clone(), OpSet::ALL)
        .await
        .unwrap();
    supervisor.start(Some(Checkpoint::ZERO)).await.unwrap();

    wait_until("history replayed", || async { b.count(&foo).await == 5 }).await;
    supervisor.shutdown().await;
}

/// `checkpoint()` persists the current positions immediately.
#[tokio::test]
async fn manual_checkpoint_persists_position() {
    let cluster = cluster(&["a", "b"]);
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();
    let foo = ns("db.foo");
    let dir = tempdir().unwrap();
    let path = dir.path().join("mmm.db");

    let store = Arc::new(SqliteConfigStore::new(&path).await.unwrap());
    let supervisor = supervisor_with_store(&cluster, "b", Arc::clone(&store)).await;
    supervisor
        .set_replication("a", foo.clone(), foo.clone(), OpSet::ALL)
        .await
        .unwrap();
    supervisor.start(None).await.unwrap();
    wait_running(&supervisor).await;

    a.insert(&foo, doc! { "_id": 1 }).await.unwrap();
    wait_until("insert replicated", || async { b.count(&foo).await == 1 }).await;
    supervisor.checkpoint(Some("a")).await.unwrap();

    let stored = multimaster::ConfigStore::load_all(store.as_ref()).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].checkpoint, a.latest_position().await);
    supervisor.shutdown().await;
}

// =============================================================================
// Configuration changes while running
// =============================================================================

/// A rule added to a running source takes effect without a restart.
#[tokio::test]
async fn hot_add_rule_on_running_source() {
    let cluster = cluster(&["a", "b"]);
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();

    let supervisor = supervisor_for(&cluster, "b").await;
    supervisor
        .set_replication("a", ns("db.foo"), ns("db.foo"), OpSet::ALL)
        .await
        .unwrap();
    supervisor.start(None).await.unwrap();
    wait_running(&supervisor).await;

    a.insert(&ns("db.foo"), doc! { "_id": 1 }).await.unwrap();
    wait_until("first rule active", || async {
        b.count(&ns("db.foo")).await == 1
    })
    .await;
    let before = supervisor.source_checkpoint("a").await.unwrap();

    supervisor
        .set_replication("a", ns("db.copy"), ns("db.bar"), OpSet::ALL)
        .await
        .unwrap();
    // The reader kept its position.
    assert!(supervisor.source_checkpoint("a").await.unwrap() >= before);

    a.insert(&ns("db.bar"), doc! { "_id": 2 }).await.unwrap();
    a.insert(&ns("db.foo"), doc! { "_id": 3 }).await.unwrap();
    wait_until("both rules active", || async {
        b.count(&ns("db.copy")).await == 1 && b.count(&ns("db.foo")).await == 2
    })
    .await;

    assert_eq!(supervisor.source_state("a").await, Some(SourceState::Running));
    assert_eq!(supervisor.dump_config().await.unwrap()["a"].len(), 2);
    supervisor.shutdown().await;
}

/// One source can feed the same namespace into several destinations.
#[tokio::test]
async fn fan_out_to_multiple_destinations() {
    let cluster = cluster(&["a", "b"]);
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();

    let supervisor = supervisor_for(&cluster, "b").await;
    supervisor
        .set_replication("a", ns("db.one"), ns("db.foo"), OpSet::ALL)
        .await
        .unwrap();
    supervisor
        .set_replication("a", ns("db.two"), ns("db.foo"), OpSet::ALL)
        .await
        .unwrap();
    supervisor.start(None).await.unwrap();
    wait_running(&supervisor).await;

    a.insert(&ns("db.foo"), doc! { "_id": 1 }).await.unwrap();
    wait_until("both copies written", || async {
        b.count(&ns("db.one")).await == 1 && b.count(&ns("db.two")).await == 1
    })
    .await;
    supervisor.shutdown().await;
}

/// Removing a rule stops its writes; removing the last rule drops the source.
#[tokio::test]
async fn unset_replication_stops_copying() {
    let cluster = cluster(&["a", "b"]);
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();

    let supervisor = supervisor_for(&cluster, "b").await;
    supervisor
        .set_replication("a", ns("db.foo"), ns("db.foo"), OpSet::ALL)
        .await
        .unwrap();
    supervisor
        .set_replication("a", ns("db.bar"), ns("db.bar"), OpSet::ALL)
        .await
        .unwrap();
    supervisor.start(None).await.unwrap();
    wait_running(&supervisor).await;

    supervisor
        .unset_replication("a", Some(ns("db.foo")), Some(ns("db.foo")))
        .await
        .unwrap();
    a.insert(&ns("db.foo"), doc! { "_id": 1 }).await.unwrap();
    a.insert(&ns("db.bar"), doc! { "_id": 1 }).await.unwrap();
    wait_until("remaining rule still active", || async {
        b.count(&ns("db.bar")).await == 1
    })
    .await;
    assert_eq!(b.count(&ns("db.foo")).await, 0);

    supervisor.unset_replication("a", None, None).await.unwrap();
    assert_eq!(supervisor.source_state("a").await, None);
    assert!(supervisor.dump_config().await.unwrap().is_empty());

    a.insert(&ns("db.bar"), doc! { "_id": 2 }).await.unwrap();
    settle().await;
    assert_eq!(b.count(&ns("db.bar")).await, 1);
    supervisor.shutdown().await;
}

/// `clear_config` stops everything and forgets every rule.
#[tokio::test]
async fn clear_config_stops_all_sources() {
    let cluster = cluster(&["a", "b", "c"]);
    let a = cluster.node("a").unwrap();
    let c = cluster.node("c").unwrap();
    let foo = ns("db.foo");

    let supervisor = supervisor_for(&cluster, "b").await;
    for source in ["a", "c"] {
        supervisor
            .set_replication(source, foo.clone(), foo.clone(), OpSet::ALL)
            .await
            .unwrap();
    }
    supervisor.start(None).await.unwrap();
    wait_running(&supervisor).await;
    assert_eq!(supervisor.dump_config().await.unwrap().len(), 2);

    supervisor.clear_config().await.unwrap();
    assert!(supervisor.dump_config().await.unwrap().is_empty());
    assert_eq!(supervisor.source_state("a").await, None);
    assert_eq!(supervisor.source_state("c").await, None);

    a.insert(&foo, doc! { "_id": 1 }).await.unwrap();
    c.insert(&foo, doc! { "_id": 2 }).await.unwrap();
    settle().await;
    assert_eq!(cluster.node("b").unwrap().count(&foo).await, 0);
    supervisor.shutdown().await;
}

// =============================================================================
// Bootstrap
// =============================================================================

/// Rules declared in the config are applied and running after `bootstrap`.
#[tokio::test]
async fn bootstrap_applies_declared_rules() {
    let cluster = cluster(&["a", "b"]);
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();

    let mut config = config_for("b", &["a"]);
    config.replication.push(RuleConfig {
        source: "a".to_string(),
        src: ns("db1.foo"),
        dst: ns("db2.bar"),
        ops: OpSet::ALL,
    });
    let connector = Arc::new(cluster.connector("b").unwrap());
    let supervisor = bootstrap(config, connector, memory_store().await)
        .await
        .unwrap();
    assert!(supervisor.is_running());
    wait_running(&supervisor).await;

    a.insert(&ns("db1.foo"), doc! { "_id": 1, "v": Bson::Int64(7) }).await.unwrap();
    wait_until("declared rule active", || async {
        b.find_one(&ns("db2.bar"), &doc! { "_id": 1 }).await.is_some()
    })
    .await;
    supervisor.shutdown().await;
}

/// A config naming a source outside the topology is rejected up front.
#[tokio::test]
async fn bootstrap_rejects_unknown_source() {
    let cluster = cluster(&["a", "b"]);
    let mut config = config_for("b", &["a"]);
    config.replication.push(RuleConfig {
        source: "nowhere".to_string(),
        src: ns("db.foo"),
        dst: ns("db.foo"),
        ops: OpSet::ALL,
    });
    let connector = Arc::new(cluster.connector("b").unwrap());
    let result = bootstrap(config, connector, memory_store().await).await;
    assert!(matches!(
        result,
        Err(multimaster::ReplicationError::UnknownSource(_))
    ));
}
