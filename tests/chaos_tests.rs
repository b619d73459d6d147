// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: inject failures and verify they stay contained.
//!
//! These tests verify that a failing source, oplog or destination never
//! takes down its siblings, and that the supervisor always shuts down.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use bson::{doc, Document};
use common::*;
use multimaster::backend::{BoxFuture, WriteFuture};
use multimaster::entry::oplog_position;
use multimaster::{
    Checkpoint, ConfigStore, Connector, Destination, MemoryCluster, MemoryConnector, Namespace, NodeConfig,
    OpSet, OplogSource, ReplicationSupervisor, SourceState, SupervisorState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

// =============================================================================
// Oplog failures
// =============================================================================

/// Transient read errors are retried without failing the source.
#[tokio::test]
async fn transient_read_failures_are_retried() {
    init_tracing();
    let cluster = Arc::new(MemoryCluster::with_nodes(&["a", "b"]));
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();
    let foo = ns("db.foo");

    let supervisor = supervisor_for(&cluster, "b").await;
    supervisor
        .set_replication("a", foo.clone(), foo.clone(), OpSet::ALL)
        .await
        .unwrap();
    supervisor.start(None).await.unwrap();
    wait_running(&supervisor).await;

    a.fail_next_reads(5);
    a.insert(&foo, doc! { "_id": 1 }).await.unwrap();
    wait_until("insert replicated after read errors", || async {
        b.count(&foo).await == 1
    })
    .await;

    assert_eq!(supervisor.source_state("a").await, Some(SourceState::Running));
    let mut failures = supervisor.take_failures().await.unwrap();
    assert!(failures.try_recv().is_err());
    supervisor.shutdown().await;
}

/// A failed head lookup at start is retried; the source is not failed.
#[tokio::test]
async fn transient_head_failure_at_start_is_retried() {
    init_tracing();
    let cluster = Arc::new(MemoryCluster::with_nodes(&["a", "b"]));
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();
    let foo = ns("db.foo");

    let supervisor = supervisor_for(&cluster, "b").await;
    supervisor
        .set_replication("a", foo.clone(), foo.clone(), OpSet::ALL)
        .await
        .unwrap();
    a.fail_next_heads(1);
    supervisor.start(None).await.unwrap();
    assert_ne!(supervisor.source_state("a").await, Some(SourceState::Failed));

    wait_running(&supervisor).await;
    let start = supervisor.source_checkpoint("a").await.unwrap();
    assert_ne!(start, Checkpoint::ZERO);

    a.insert(&foo, doc! { "_id": 1 }).await.unwrap();
    wait_until("insert replicated after head retry", || async {
        b.count(&foo).await == 1
    })
    .await;

    let mut failures = supervisor.take_failures().await.unwrap();
    assert!(failures.try_recv().is_err());
    supervisor.shutdown().await;
}

/// An update that cannot be parsed in a replicated namespace fails the source
/// instead of being skipped, and the checkpoint stays in front of it.
#[tokio::test]
async fn unparseable_replicated_entry_fails_source() {
    init_tracing();
    let cluster = Arc::new(MemoryCluster::with_nodes(&["a", "b"]));
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();
    let foo = ns("db.foo");

    let supervisor = supervisor_for(&cluster, "b").await;
    let mut failures = supervisor.take_failures().await.unwrap();
    supervisor
        .set_replication("a", foo.clone(), foo.clone(), OpSet::ALL)
        .await
        .unwrap();
    supervisor.start(None).await.unwrap();
    wait_running(&supervisor).await;

    a.insert(&foo, doc! { "_id": 1, "arr": [1, 2, 3] }).await.unwrap();
    let before = a.latest_position().await.unwrap();
    a.append_raw(
        "u",
        &foo,
        doc! { "$v": 2, "diff": { "sarr": { "a": true, "l": 2 } } },
        Some(doc! { "_id": 1 }),
    )
    .await;
    a.insert(&foo, doc! { "_id": 2 }).await.unwrap();

    let failure = timeout(Duration::from_secs(5), failures.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failure.source, "a");
    assert_eq!(failure.error_type(), "entry_parse");
    assert_eq!(supervisor.source_state("a").await, Some(SourceState::Failed));
    assert_eq!(supervisor.source_checkpoint("a").await, Some(before));
    assert_eq!(b.count(&foo).await, 1);

    supervisor.shutdown().await;
}

/// A source whose history was trimmed past the start position fails alone.
#[tokio::test]
async fn history_lost_fails_only_that_source() {
    init_tracing();
    let cluster = Arc::new(MemoryCluster::with_nodes(&["a", "b", "c"]));
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();
    let c = cluster.node("c").unwrap();

    a.insert(&ns("db.foo"), doc! { "_id": 1 }).await.unwrap();
    let trimmed = a.latest_position().await.unwrap();
    a.insert(&ns("db.foo"), doc! { "_id": 2 }).await.unwrap();
    a.trim_oplog_through(trimmed).await;

    let supervisor = supervisor_for(&cluster, "b").await;
    let mut failures = supervisor.take_failures().await.unwrap();
    supervisor
        .set_replication("a", ns("db.foo"), ns("db.foo"), OpSet::ALL)
        .await
        .unwrap();
    supervisor
        .set_replication("c", ns("db.bar"), ns("db.bar"), OpSet::ALL)
        .await
        .unwrap();
    supervisor.start(Some(Checkpoint::new(1, 0))).await.unwrap();

    let failure = timeout(Duration::from_secs(5), failures.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failure.source, "a");
    assert_eq!(failure.error_type(), "history_lost");
    assert_eq!(supervisor.source_state("a").await, Some(SourceState::Failed));
    assert_eq!(b.count(&ns("db.foo")).await, 0);

    c.insert(&ns("db.bar"), doc! { "_id": 1 }).await.unwrap();
    wait_until("healthy source still replicating", || async {
        b.count(&ns("db.bar")).await == 1
    })
    .await;
    assert_eq!(supervisor.source_state("c").await, Some(SourceState::Running));
    assert_eq!(supervisor.state(), SupervisorState::Running);

    supervisor.shutdown().await;
    assert_eq!(supervisor.source_state("a").await, Some(SourceState::Failed));
}

// =============================================================================
// Destination failures
// =============================================================================

/// A destination that rejects writes fails its own source; the others keep
/// going, and a rule change brings the failed source back.
#[tokio::test]
async fn failing_destination_is_contained() {
    init_tracing();
    let cluster = Arc::new(MemoryCluster::with_nodes(&["a", "b", "c"]));
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();
    let c = cluster.node("c").unwrap();

    let supervisor = supervisor_for(&cluster, "b").await;
    let mut failures = supervisor.take_failures().await.unwrap();
    supervisor
        .set_replication("a", ns("db.foo"), ns("db.foo"), OpSet::ALL)
        .await
        .unwrap();
    supervisor
        .set_replication("c", ns("db.bar"), ns("db.bar"), OpSet::ALL)
        .await
        .unwrap();
    supervisor.start(None).await.unwrap();
    wait_running(&supervisor).await;

    b.set_failing_writes(&ns("db.foo"), true).await;
    a.insert(&ns("db.foo"), doc! { "_id": "lost" }).await.unwrap();

    let failure = timeout(Duration::from_secs(5), failures.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failure.source, "a");
    assert_eq!(failure.error_type(), "destination");
    assert_eq!(supervisor.source_state("a").await, Some(SourceState::Failed));

    c.insert(&ns("db.bar"), doc! { "_id": 1 }).await.unwrap();
    wait_until("other source unaffected", || async {
        b.count(&ns("db.bar")).await == 1
    })
    .await;

    // A rule change restarts the failed source from its checkpoint.
    b.set_failing_writes(&ns("db.foo"), false).await;
    supervisor
        .set_replication("a", ns("db.baz"), ns("db.baz"), OpSet::ALL)
        .await
        .unwrap();
    wait_until("failed source restarted", || async {
        supervisor.source_state("a").await == Some(SourceState::Running)
    })
    .await;

    a.insert(&ns("db.foo"), doc! { "_id": "after" }).await.unwrap();
    wait_until("restarted source replicating", || async {
        b.find_one(&ns("db.foo"), &doc! { "_id": "after" }).await.is_some()
    })
    .await;
    // The entry whose write failed is not retried.
    assert!(b.find_one(&ns("db.foo"), &doc! { "_id": "lost" }).await.is_none());

    supervisor.shutdown().await;
}

/// A destination that never answers cannot block shutdown.
#[tokio::test]
async fn hung_destination_does_not_block_shutdown() {
    init_tracing();
    let cluster = Arc::new(MemoryCluster::with_nodes(&["a", "b"]));
    let a = cluster.node("a").unwrap();
    let stuck = ns("db.stuck");

    let mut config = config_for("b", &["a"]);
    config.settings.stop_timeout = "100ms".to_string();
    let connector = Arc::new(HangingConnector {
        inner: cluster.connector("b").unwrap(),
        hang_on: stuck.clone(),
    });
    let supervisor = ReplicationSupervisor::new(config, connector, memory_store().await).unwrap();
    supervisor
        .set_replication("a", stuck.clone(), ns("db.foo"), OpSet::ALL)
        .await
        .unwrap();
    supervisor.start(None).await.unwrap();
    wait_running(&supervisor).await;

    a.insert(&ns("db.foo"), doc! { "_id": 1 }).await.unwrap();
    let head = a.latest_position().await.unwrap();
    wait_until("reader reached the hung write", || async {
        supervisor.source_checkpoint("a").await == Some(head)
    })
    .await;

    timeout(Duration::from_secs(2), supervisor.shutdown())
        .await
        .expect("shutdown finished despite the hung write");
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert_eq!(supervisor.source_state("a").await, Some(SourceState::Stopped));
}

// =============================================================================
// Concurrency
// =============================================================================

/// Rule churn from several tasks while writes flow never deadlocks and
/// leaves a consistent configuration.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_rule_changes_do_not_deadlock() {
    init_tracing();
    let cluster = Arc::new(MemoryCluster::with_nodes(&["a", "b"]));
    let a = cluster.node("a").unwrap();
    let supervisor = Arc::new(supervisor_for(&cluster, "b").await);
    supervisor
        .set_replication("a", ns("db.keep"), ns("db.keep"), OpSet::ALL)
        .await
        .unwrap();
    supervisor.start(None).await.unwrap();
    wait_running(&supervisor).await;

    let writer = {
        let a = Arc::clone(&a);
        tokio::spawn(async move {
            for i in 0..200 {
                a.insert(&ns("db.keep"), doc! { "_id": i }).await.unwrap();
                a.insert(&ns(&format!("db.c{}", i % 4)), doc! { "_id": i })
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let churners: Vec<_> = (0..4)
        .map(|n| {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move {
                let coll = ns(&format!("db.c{}", n));
                for _ in 0..20 {
                    supervisor
                        .set_replication("a", coll.clone(), coll.clone(), OpSet::ALL)
                        .await
                        .unwrap();
                    supervisor
                        .unset_replication("a", Some(coll.clone()), Some(coll.clone()))
                        .await
                        .unwrap();
                }
            })
        })
        .collect();

    timeout(Duration::from_secs(10), async {
        writer.await.unwrap();
        for churner in churners {
            churner.await.unwrap();
        }
    })
    .await
    .expect("rule churn finished");

    let dump = supervisor.dump_config().await.unwrap();
    assert_eq!(dump["a"].len(), 1);
    assert_eq!(dump["a"][0].src, ns("db.keep"));

    let b = cluster.node("b").unwrap();
    wait_until("kept rule caught up", || async {
        b.count(&ns("db.keep")).await == 200
    })
    .await;

    timeout(Duration::from_secs(5), supervisor.shutdown())
        .await
        .expect("shutdown finished");
}

/// Shutdown while sources are busy still flushes and stops everything.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_under_load() {
    init_tracing();
    let cluster = Arc::new(MemoryCluster::with_nodes(&["a", "b"]));
    let a = cluster.node("a").unwrap();
    let foo = ns("db.foo");

    for i in 0..1000 {
        a.insert(&foo, doc! { "_id": i }).await.unwrap();
    }

    let store = memory_store().await;
    let supervisor = supervisor_with_store(&cluster, "b", Arc::clone(&store)).await;
    supervisor
        .set_replication("a", foo.clone(), foo.clone(), OpSet::ALL)
        .await
        .unwrap();
    supervisor.start(Some(Checkpoint::ZERO)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    timeout(Duration::from_secs(5), supervisor.shutdown())
        .await
        .expect("shutdown finished");
    assert_eq!(supervisor.state(), SupervisorState::Stopped);

    // The final position was flushed, and exactly the entries up to it
    // were applied.
    let last = supervisor.source_checkpoint("a").await.unwrap();
    let stored = store.load_all().await.unwrap();
    assert_eq!(stored[0].checkpoint, Some(last));

    let through_last = a
        .oplog()
        .await
        .iter()
        .filter(|raw| oplog_position(raw).unwrap() <= last)
        .count();
    assert_eq!(cluster.node("b").unwrap().count(&foo).await, through_last);
}

// =============================================================================
// Helpers
// =============================================================================

/// Opens memory collections, except that writes to `hang_on` never finish.
struct HangingConnector {
    inner: MemoryConnector,
    hang_on: Namespace,
}

impl Connector for HangingConnector {
    fn open_oplog<'a>(
        &'a self,
        name: &'a str,
        node: &'a NodeConfig,
    ) -> BoxFuture<'a, Arc<dyn OplogSource>> {
        self.inner.open_oplog(name, node)
    }

    fn open_collection<'a>(
        &'a self,
        namespace: &'a Namespace,
    ) -> BoxFuture<'a, Arc<dyn Destination>> {
        if *namespace == self.hang_on {
            let hung = Arc::new(HungDestination(namespace.clone())) as Arc<dyn Destination>;
            return Box::pin(async move { Ok(hung) });
        }
        self.inner.open_collection(namespace)
    }
}

struct HungDestination(Namespace);

impl Destination for HungDestination {
    fn namespace(&self) -> &Namespace {
        &self.0
    }

    fn insert(&self, _document: Document) -> WriteFuture<'_, ()> {
        Box::pin(std::future::pending())
    }

    fn update(&self, _filter: Document, _update: Document, _upsert: bool) -> WriteFuture<'_, ()> {
        Box::pin(std::future::pending())
    }

    fn delete(&self, _filter: Document) -> WriteFuture<'_, u64> {
        Box::pin(std::future::pending())
    }
}
