// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! MongoDB backend.
//!
//! - [`MongoOplog`] tails `local.oplog.rs` on a replica-set member
//! - [`MongoCollection`] applies replicated writes to a local collection
//! - [`MongoConnector`] opens both from topology URIs
//!
//! # Rolled-Over History
//!
//! The oplog is a capped collection. If the checkpoint we resume from is
//! older than the oldest entry still retained, the entries in between are
//! gone and replaying from the oldest would silently skip writes. Every read
//! first compares the checkpoint with the oldest retained `ts` and reports
//! [`ReadResult::HistoryLost`] instead. A checkpoint of
//! [`Checkpoint::ZERO`] means "from the beginning" and is always accepted.

use crate::backend::{
    BoxFuture, Connector, Destination, OplogSource, ReadResult, WriteError, WriteFuture,
};
use crate::checkpoint::Checkpoint;
use crate::config::NodeConfig;
use crate::document::DocumentExt;
use crate::entry::{oplog_position, LogEntry, Namespace, UnparsedEntry};
use crate::error::{ReplicationError, Result};
use bson::{doc, Document};
use futures::TryStreamExt;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::{Client, Collection};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

const DUPLICATE_KEY_CODE: i32 = 11000;

// ═══════════════════════════════════════════════════════════════════════════════
// Oplog
// ═══════════════════════════════════════════════════════════════════════════════

/// The oplog of one replica-set member.
pub struct MongoOplog {
    source_name: String,
    oplog: Collection<Document>,
}

impl MongoOplog {
    pub fn new(source_name: impl Into<String>, client: &Client) -> Self {
        Self {
            source_name: source_name.into(),
            oplog: client.database("local").collection("oplog.rs"),
        }
    }

    async fn edge(&self, direction: i32, operation: &str) -> Result<Option<Checkpoint>> {
        let raw = self
            .oplog
            .find_one(doc! {})
            .sort(doc! { "$natural": direction })
            .projection(doc! { "ts": 1 })
            .await
            .map_err(|e| ReplicationError::mongo(operation, e))?;
        raw.as_ref().map(oplog_position).transpose()
    }

    async fn read_after_inner(&self, after: Checkpoint, limit: usize) -> Result<ReadResult> {
        if after != Checkpoint::ZERO {
            if let Some(oldest) = self.edge(1, "find oldest oplog entry").await? {
                if after < oldest {
                    warn!(
                        source = %self.source_name,
                        checkpoint = %after,
                        oldest = %oldest,
                        "Oplog rolled over past our checkpoint"
                    );
                    return Ok(ReadResult::HistoryLost {
                        requested: after,
                        oldest,
                    });
                }
            }
        }

        let start = Instant::now();
        let mut cursor = self
            .oplog
            .find(doc! { "ts": { "$gt": after.to_bson_timestamp() } })
            .sort(doc! { "$natural": 1 })
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .await
            .map_err(|e| ReplicationError::mongo("find oplog", e))?;

        let mut entries = Vec::new();
        let mut scanned_through = None;
        let mut unparsed = None;
        while let Some(raw) = cursor
            .try_next()
            .await
            .map_err(|e| ReplicationError::mongo("iterate oplog", e))?
        {
            let position = oplog_position(&raw)?;
            match LogEntry::from_oplog(&raw) {
                Ok(Some(entry)) => {
                    trace!(
                        source = %self.source_name,
                        position = %position,
                        op = %entry.op,
                        namespace = %entry.namespace,
                        "Parsed oplog entry"
                    );
                    entries.push(entry);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        source = %self.source_name,
                        position = %position,
                        error = %e,
                        "Failed to parse oplog entry"
                    );
                    unparsed = Some(UnparsedEntry::from_raw(&raw, position, e));
                    break;
                }
            }
            scanned_through = Some(position);
        }

        crate::metrics::record_oplog_read(&self.source_name, entries.len(), start.elapsed());
        Ok(ReadResult::Batch {
            entries,
            scanned_through,
            unparsed,
        })
    }
}

impl OplogSource for MongoOplog {
    fn read_after(&self, after: Checkpoint, limit: usize) -> BoxFuture<'_, ReadResult> {
        Box::pin(self.read_after_inner(after, limit))
    }

    fn head(&self) -> BoxFuture<'_, Option<Checkpoint>> {
        Box::pin(self.edge(-1, "find newest oplog entry"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Destination collection
// ═══════════════════════════════════════════════════════════════════════════════

/// Whether a driver error is a unique index violation.
pub fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    match e.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == DUPLICATE_KEY_CODE,
        ErrorKind::Command(ce) => ce.code == DUPLICATE_KEY_CODE,
        _ => false,
    }
}

fn write_error(e: mongodb::error::Error) -> WriteError {
    if is_duplicate_key(&e) {
        WriteError::DuplicateKey
    } else {
        WriteError::Failed(e.to_string())
    }
}

/// A collection on the local node.
pub struct MongoCollection {
    namespace: Namespace,
    collection: Collection<Document>,
}

impl MongoCollection {
    pub fn new(client: &Client, namespace: Namespace) -> Self {
        let collection = client
            .database(namespace.database())
            .collection(namespace.collection());
        Self {
            namespace,
            collection,
        }
    }
}

impl Destination for MongoCollection {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn insert(&self, document: Document) -> WriteFuture<'_, ()> {
        Box::pin(async move {
            self.collection
                .insert_one(document)
                .await
                .map(|_| ())
                .map_err(write_error)
        })
    }

    fn update(&self, filter: Document, update: Document, upsert: bool) -> WriteFuture<'_, ()> {
        Box::pin(async move {
            let result = if update.has_modifiers() {
                self.collection
                    .update_one(filter, update)
                    .upsert(upsert)
                    .await
            } else {
                self.collection
                    .replace_one(filter, update)
                    .upsert(upsert)
                    .await
            };
            result.map(|_| ()).map_err(write_error)
        })
    }

    fn delete(&self, filter: Document) -> WriteFuture<'_, u64> {
        Box::pin(async move {
            self.collection
                .delete_many(filter)
                .await
                .map(|r| r.deleted_count)
                .map_err(write_error)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Connector
// ═══════════════════════════════════════════════════════════════════════════════

/// Opens oplogs and collections over the `mongodb` driver.
///
/// One client is kept per URI.
pub struct MongoConnector {
    local: Client,
    clients: Mutex<HashMap<String, Client>>,
}

impl MongoConnector {
    /// Connect to the local node (where replicated writes land).
    pub async fn new(local_uri: &str) -> Result<Self> {
        let local = Client::with_uri_str(local_uri)
            .await
            .map_err(|e| ReplicationError::mongo("connect local node", e))?;
        let mut clients = HashMap::new();
        clients.insert(local_uri.to_string(), local.clone());
        Ok(Self {
            local,
            clients: Mutex::new(clients),
        })
    }

    /// The client for the local node.
    pub fn local_client(&self) -> &Client {
        &self.local
    }

    async fn client_for(&self, uri: &str) -> Result<Client> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(uri) {
            return Ok(client.clone());
        }
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| ReplicationError::mongo("connect source node", e))?;
        debug!(uri = %uri, "Connected to source node");
        clients.insert(uri.to_string(), client.clone());
        Ok(client)
    }
}

impl Connector for MongoConnector {
    fn open_oplog<'a>(
        &'a self,
        name: &'a str,
        node: &'a NodeConfig,
    ) -> BoxFuture<'a, Arc<dyn OplogSource>> {
        Box::pin(async move {
            let client = self.client_for(&node.uri).await?;
            Ok(Arc::new(MongoOplog::new(name, &client)) as Arc<dyn OplogSource>)
        })
    }

    fn open_collection<'a>(
        &'a self,
        namespace: &'a Namespace,
    ) -> BoxFuture<'a, Arc<dyn Destination>> {
        Box::pin(async move {
            Ok(Arc::new(MongoCollection::new(&self.local, namespace.clone()))
                as Arc<dyn Destination>)
        })
    }
}
