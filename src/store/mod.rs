// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistence for per-source configuration and checkpoints.
//!
//! A [`ConfigStore`] holds one [`MasterConfig`] per source node, keyed by the
//! source's id. The supervisor is the only writer, and it serializes writes
//! per source, so implementations only need each call to be atomic on its
//! own.
//!
//! | Store | Backing | Notes |
//! |-------|---------|-------|
//! | [`SqliteConfigStore`] | SQLite file (WAL) | Default; survives restarts of the database nodes |
//! | [`MongoConfigStore`] | `local.mmm` collection | Lives on the local node, outside the replicated set |
//!
//! # Checkpoint Semantics
//!
//! The stored checkpoint is the position of the last entry the source's
//! reader had **dispatched** when the supervisor last flushed. On restart the
//! reader resumes strictly after it, so entries dispatched after the last
//! flush are read again and applied idempotently.

mod mongo;
mod sqlite;

pub use mongo::MongoConfigStore;
pub use sqlite::SqliteConfigStore;

use crate::backend::BoxFuture;
use crate::checkpoint::Checkpoint;
use crate::rules::{MasterConfig, NodeId, ReplicationRule, RuleFilter};

/// Durable storage of [`MasterConfig`]s.
pub trait ConfigStore: Send + Sync + 'static {
    /// Every stored config, rules in insertion order.
    fn load_all(&self) -> BoxFuture<'_, Vec<MasterConfig>>;

    /// Insert the rule, replacing any rule with the same `(src, dst)`.
    ///
    /// Creates the source's config if it does not exist yet.
    fn upsert_rule<'a>(
        &'a self,
        source_id: &'a NodeId,
        rule: &'a ReplicationRule,
    ) -> BoxFuture<'a, ()>;

    /// Remove the rules matching `filter`. Returns how many rules remain.
    fn pull_rules<'a>(
        &'a self,
        source_id: &'a NodeId,
        filter: &'a RuleFilter,
    ) -> BoxFuture<'a, usize>;

    /// Delete the source's config entirely.
    fn remove<'a>(&'a self, source_id: &'a NodeId) -> BoxFuture<'a, ()>;

    /// Record the source's checkpoint. No-op if the source has no config.
    fn set_checkpoint<'a>(
        &'a self,
        source_id: &'a NodeId,
        checkpoint: Checkpoint,
    ) -> BoxFuture<'a, ()>;

    /// Delete every stored config.
    fn clear(&self) -> BoxFuture<'_, ()>;
}
