//! Shared test utilities for the integration and chaos tests.
//!
//! This module provides:
//! - In-memory cluster, store and supervisor builders
//! - A recording handler for reader-level assertions
//! - Polling helpers for eventually-consistent checks

#![allow(dead_code)]

pub mod mock_handler;

use multimaster::{
    config::StoreConfig, MemoryCluster, Namespace, NodeConfig, ReplicationConfig,
    ReplicationSupervisor, SourceState, SqliteConfigStore,
};
use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

/// How long `wait_until` polls before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn ns(s: &str) -> Namespace {
    Namespace::parse(s).unwrap()
}

/// Route test logs through `RUST_LOG` (e.g. `RUST_LOG=multimaster=debug`).
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Config for `local` with every node in `nodes` in its topology.
pub fn config_for(local: &str, nodes: &[&str]) -> ReplicationConfig {
    let mut config = ReplicationConfig::for_testing(local);
    for name in nodes {
        config
            .topology
            .insert(name.to_string(), NodeConfig::for_testing(name));
    }
    config
}

pub async fn memory_store() -> Arc<SqliteConfigStore> {
    Arc::new(
        SqliteConfigStore::open(&StoreConfig::in_memory())
            .await
            .unwrap(),
    )
}

/// A supervisor for `local` over `cluster`, with an in-memory store.
pub async fn supervisor_for(
    cluster: &Arc<MemoryCluster>,
    local: &str,
) -> ReplicationSupervisor {
    let store = memory_store().await;
    supervisor_with_store(cluster, local, store).await
}

/// A supervisor for `local` over `cluster` persisting into `store`.
pub async fn supervisor_with_store(
    cluster: &Arc<MemoryCluster>,
    local: &str,
    store: Arc<SqliteConfigStore>,
) -> ReplicationSupervisor {
    let names = cluster.node_names();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let connector = Arc::new(cluster.connector(local).unwrap());
    ReplicationSupervisor::new(config_for(local, &names), connector, store).unwrap()
}

/// Poll `check` every 10ms until it returns true. Panics with `what` after
/// [`WAIT_TIMEOUT`].
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until every configured source of `supervisor` has fixed its start
/// position and is tailing.
pub async fn wait_running(supervisor: &ReplicationSupervisor) {
    let sources: Vec<String> = supervisor.dump_config().await.unwrap().into_keys().collect();
    for source in &sources {
        wait_until(&format!("source {} running", source), || async {
            supervisor.source_state(source).await == Some(SourceState::Running)
        })
        .await;
    }
}

/// Give running readers a few idle intervals to (not) act.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
