// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Config store in the local node's `local.mmm` collection.
//!
//! One document per source:
//!
//! ```text
//! { _id: "<source id>",
//!   checkpoint: Timestamp(t, i),
//!   replication: [ { dst: "db2.bar", src: "db1.foo", ops: "iud" }, ... ] }
//! ```
//!
//! The `local` database is never replicated by MongoDB itself, so each node
//! keeps its own copy.

use crate::backend::BoxFuture;
use crate::checkpoint::Checkpoint;
use crate::entry::{Namespace, OpSet};
use crate::error::{ReplicationError, Result};
use crate::rules::{MasterConfig, NodeId, ReplicationRule, RuleFilter};
use crate::store::ConfigStore;
use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongodb::options::ReturnDocument;
use mongodb::{Client, Collection};
use tracing::{debug, info};

const CONFIG_DATABASE: &str = "local";
const CONFIG_COLLECTION: &str = "mmm";

/// Config store backed by a MongoDB collection.
pub struct MongoConfigStore {
    collection: Collection<Document>,
}

impl MongoConfigStore {
    /// Use `local.mmm` on the node `client` is connected to.
    pub fn new(client: &Client) -> Self {
        Self::with_collection(client.database(CONFIG_DATABASE).collection(CONFIG_COLLECTION))
    }

    /// Use an arbitrary collection (tests point this at a scratch database).
    pub fn with_collection(collection: Collection<Document>) -> Self {
        Self { collection }
    }

    /// Connect to `uri` and use its `local.mmm`.
    pub async fn connect(uri: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| ReplicationError::mongo("connect config store", e))?;
        Ok(Self::new(&client))
    }

    async fn load_all_inner(&self) -> Result<Vec<MasterConfig>> {
        let mut cursor = self
            .collection
            .find(doc! {})
            .sort(doc! { "_id": 1 })
            .await
            .map_err(|e| ReplicationError::mongo("load master configs", e))?;

        let mut configs = Vec::new();
        while let Some(raw) = cursor
            .try_next()
            .await
            .map_err(|e| ReplicationError::mongo("load master configs", e))?
        {
            configs.push(master_from_document(&raw)?);
        }
        debug!(count = configs.len(), "Loaded master configs");
        Ok(configs)
    }

    async fn upsert_rule_inner(&self, source_id: &NodeId, rule: &ReplicationRule) -> Result<()> {
        let src = rule.src.to_string();
        let dst = rule.dst.to_string();
        let ops = rule.ops.to_string();

        // Replace in place if the route exists.
        let replaced = self
            .collection
            .update_one(
                doc! {
                    "_id": source_id.as_str(),
                    "replication": { "$elemMatch": { "src": src.as_str(), "dst": dst.as_str() } },
                },
                doc! { "$set": { "replication.$.ops": ops.as_str() } },
            )
            .await
            .map_err(|e| ReplicationError::mongo("upsert rule", e))?;

        if replaced.matched_count == 0 {
            self.collection
                .find_one_and_update(
                    doc! { "_id": source_id.as_str() },
                    doc! { "$push": { "replication": { "dst": dst.as_str(), "src": src.as_str(), "ops": ops.as_str() } } },
                )
                .upsert(true)
                .return_document(ReturnDocument::After)
                .await
                .map_err(|e| ReplicationError::mongo("upsert rule", e))?;
        }

        debug!(source_id = %source_id, rule = %rule, "Stored rule");
        Ok(())
    }

    async fn pull_rules_inner(&self, source_id: &NodeId, filter: &RuleFilter) -> Result<usize> {
        let mut matcher = Document::new();
        if let Some(src) = &filter.src {
            matcher.insert("src", src.to_string());
        }
        if let Some(dst) = &filter.dst {
            matcher.insert("dst", dst.to_string());
        }

        let after = self
            .collection
            .find_one_and_update(
                doc! { "_id": source_id.as_str() },
                doc! { "$pull": { "replication": matcher } },
            )
            .return_document(ReturnDocument::After)
            .await
            .map_err(|e| ReplicationError::mongo("pull rules", e))?;

        Ok(after
            .and_then(|d| d.get_array("replication").ok().map(|a| a.len()))
            .unwrap_or(0))
    }

    async fn remove_inner(&self, source_id: &NodeId) -> Result<()> {
        self.collection
            .delete_one(doc! { "_id": source_id.as_str() })
            .await
            .map_err(|e| ReplicationError::mongo("remove master config", e))?;
        info!(source_id = %source_id, "Deleted master config");
        Ok(())
    }

    async fn set_checkpoint_inner(&self, source_id: &NodeId, checkpoint: Checkpoint) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": source_id.as_str() },
                doc! { "$set": { "checkpoint": checkpoint.to_bson_timestamp() } },
            )
            .await
            .map_err(|e| ReplicationError::mongo("set checkpoint", e))?;
        debug!(source_id = %source_id, checkpoint = %checkpoint, "Checkpoint persisted");
        Ok(())
    }

    async fn clear_inner(&self) -> Result<()> {
        self.collection
            .delete_many(doc! {})
            .await
            .map_err(|e| ReplicationError::mongo("clear master configs", e))?;
        info!("Cleared all master configs");
        Ok(())
    }
}

/// Parse one `local.mmm` document.
pub(crate) fn master_from_document(raw: &Document) -> Result<MasterConfig> {
    let source_id = match raw.get("_id") {
        Some(Bson::String(s)) => NodeId::new(s.clone()),
        Some(other) => NodeId::new(other.to_string()),
        None => {
            return Err(ReplicationError::EntryParse(
                "master config without _id".to_string(),
            ))
        }
    };

    let mut config = MasterConfig::new(source_id);
    config.checkpoint = raw.get_timestamp("checkpoint").ok().map(Checkpoint::from);

    if let Ok(rules) = raw.get_array("replication") {
        for item in rules {
            let rule = match item {
                Bson::Document(d) => d,
                _ => {
                    return Err(ReplicationError::EntryParse(format!(
                        "malformed replication rule for {}",
                        config.source_id
                    )))
                }
            };
            let field = |name: &str| -> Result<String> {
                rule.get_str(name).map(str::to_string).map_err(|_| {
                    ReplicationError::EntryParse(format!(
                        "replication rule for {} is missing '{}'",
                        config.source_id, name
                    ))
                })
            };
            let ops = match rule.get_str("ops") {
                Ok(codes) => OpSet::parse(codes)?,
                Err(_) => OpSet::ALL,
            };
            let parsed = ReplicationRule::new(
                Namespace::parse(&field("src")?)?,
                Namespace::parse(&field("dst")?)?,
                ops,
            );
            config.rules.push(parsed);
        }
    }
    Ok(config)
}

impl ConfigStore for MongoConfigStore {
    fn load_all(&self) -> BoxFuture<'_, Vec<MasterConfig>> {
        Box::pin(self.load_all_inner())
    }

    fn upsert_rule<'a>(
        &'a self,
        source_id: &'a NodeId,
        rule: &'a ReplicationRule,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.upsert_rule_inner(source_id, rule))
    }

    fn pull_rules<'a>(
        &'a self,
        source_id: &'a NodeId,
        filter: &'a RuleFilter,
    ) -> BoxFuture<'a, usize> {
        Box::pin(self.pull_rules_inner(source_id, filter))
    }

    fn remove<'a>(&'a self, source_id: &'a NodeId) -> BoxFuture<'a, ()> {
        Box::pin(self.remove_inner(source_id))
    }

    fn set_checkpoint<'a>(
        &'a self,
        source_id: &'a NodeId,
        checkpoint: Checkpoint,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.set_checkpoint_inner(source_id, checkpoint))
    }

    fn clear(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.clear_inner())
    }
}
