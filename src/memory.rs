// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process nodes.
//!
//! A [`MemoryNode`] is a tiny document store with an oplog, close enough to
//! a replica-set member for the engine to run against it unchanged: writes
//! are logged as raw oplog documents (`ts`, `op`, `ns`, `o`, `o2`) and read
//! back through the same parser the MongoDB backend uses.
//!
//! Supported:
//!
//! - unique `_id` (assigned as an `ObjectId` when missing)
//! - equality filters on top-level or dotted fields
//! - `$set`, `$unset`, `$inc` and whole-document replacement
//! - upserts, logged as inserts the way MongoDB does
//! - oplog trimming (to provoke [`ReadResult::HistoryLost`]) and no-op entries
//! - injected read and write failures
//!
//! Modifier updates are logged as `$v: 2` diffs listing every top-level
//! field the update touched, with its value after the update.

use crate::backend::{
    BoxFuture, Connector, Destination, OplogSource, ReadResult, WriteError, WriteFuture,
};
use crate::checkpoint::Checkpoint;
use crate::config::NodeConfig;
use crate::document::DocumentExt;
use crate::entry::{oplog_position, LogEntry, Namespace, UnparsedEntry};
use crate::error::{ReplicationError, Result};
use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{trace, warn};

/// Result of [`MemoryNode::update_one`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// An existing document was modified.
    Updated,
    /// No document matched and none was inserted.
    NoMatch,
    /// No document matched; one was inserted with this `_id`.
    Upserted(Bson),
}

#[derive(Default)]
struct NodeState {
    collections: HashMap<Namespace, Vec<Document>>,
    oplog: Vec<Document>,
    last_position: Checkpoint,
    /// Newest position removed by trimming.
    trimmed_through: Option<Checkpoint>,
}

impl NodeState {
    fn next_position(&mut self) -> Checkpoint {
        let now = Checkpoint::now().timestamp;
        let next = if now > self.last_position.timestamp {
            Checkpoint::new(now, 1)
        } else {
            Checkpoint::new(
                self.last_position.timestamp,
                self.last_position.ordinal.saturating_add(1),
            )
        };
        self.last_position = next;
        next
    }

    fn log(&mut self, op: &str, ns: &str, o: Document, o2: Option<Document>) -> Checkpoint {
        let position = self.next_position();
        let mut raw = doc! {
            "ts": position.to_bson_timestamp(),
            "op": op,
            "ns": ns,
            "o": o,
        };
        if let Some(o2) = o2 {
            raw.insert("o2", o2);
        }
        self.oplog.push(raw);
        position
    }

    fn insert(&mut self, ns: &Namespace, mut document: Document) -> std::result::Result<Bson, WriteError> {
        if !document.contains_key("_id") {
            document.insert("_id", ObjectId::new());
        }
        let id = document.get("_id").cloned().unwrap_or(Bson::Null);
        let docs = self.collections.entry(ns.clone()).or_default();
        if docs.iter().any(|d| d.get("_id") == Some(&id)) {
            return Err(WriteError::DuplicateKey);
        }
        docs.push(document.clone());
        self.log("i", &ns.to_string(), document, None);
        Ok(id)
    }
}

/// An in-process node with collections and an oplog.
pub struct MemoryNode {
    name: String,
    state: RwLock<NodeState>,
    failing_reads: AtomicU32,
    failing_heads: AtomicU32,
    failing_writes: RwLock<HashSet<Namespace>>,
}

impl MemoryNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(NodeState::default()),
            failing_reads: AtomicU32::new(0),
            failing_heads: AtomicU32::new(0),
            failing_writes: RwLock::new(HashSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Client writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a document. Returns its `_id`.
    pub async fn insert(
        &self,
        ns: &Namespace,
        document: Document,
    ) -> std::result::Result<Bson, WriteError> {
        self.state.write().await.insert(ns, document)
    }

    /// Update the first document matching `filter`.
    pub async fn update_one(
        &self,
        ns: &Namespace,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> std::result::Result<UpdateOutcome, WriteError> {
        let mut state = self.state.write().await;
        let docs = state.collections.entry(ns.clone()).or_default();

        let Some(index) = docs.iter().position(|d| matches_filter(d, filter)) else {
            if !upsert {
                return Ok(UpdateOutcome::NoMatch);
            }
            let document = build_upsert(filter, update)?;
            let id = state.insert(ns, document)?;
            return Ok(UpdateOutcome::Upserted(id));
        };

        let before = docs[index].clone();
        let id = before.get("_id").cloned().unwrap_or(Bson::Null);

        let logged = if update.has_modifiers() {
            let mut after = before.clone();
            let touched = apply_modifiers(&mut after, update)?;
            if after.get("_id") != Some(&id) {
                return Err(WriteError::Failed("the _id field is immutable".to_string()));
            }
            let diff = touched_diff(&before, &after, &touched);
            docs[index] = after;
            if diff.is_empty() {
                return Ok(UpdateOutcome::Updated);
            }
            doc! { "$v": 2, "diff": diff }
        } else {
            let mut replacement = update.clone();
            match replacement.get("_id") {
                Some(new_id) if new_id != &id => {
                    return Err(WriteError::Failed("the _id field is immutable".to_string()))
                }
                Some(_) => {}
                None => {
                    let mut with_id = doc! { "_id": id.clone() };
                    with_id.extend(replacement);
                    replacement = with_id;
                }
            }
            docs[index] = replacement.clone();
            replacement
        };

        state.log("u", &ns.to_string(), logged, Some(doc! { "_id": id }));
        Ok(UpdateOutcome::Updated)
    }

    /// Delete every document matching `filter`. Returns how many were removed.
    pub async fn delete_many(&self, ns: &Namespace, filter: &Document) -> u64 {
        let mut state = self.state.write().await;
        let Some(docs) = state.collections.get_mut(ns) else {
            return 0;
        };
        let (removed, kept): (Vec<Document>, Vec<Document>) =
            std::mem::take(docs).into_iter().partition(|d| matches_filter(d, filter));
        *docs = kept;

        let ns_str = ns.to_string();
        for document in &removed {
            let id = document.get("_id").cloned().unwrap_or(Bson::Null);
            state.log("d", &ns_str, doc! { "_id": id }, None);
        }
        removed.len() as u64
    }

    /// Append an oplog entry without touching any collection.
    pub async fn append_raw(
        &self,
        op: &str,
        ns: &Namespace,
        o: Document,
        o2: Option<Document>,
    ) -> Checkpoint {
        self.state.write().await.log(op, &ns.to_string(), o, o2)
    }

    /// Append a no-op entry, like a primary's periodic heartbeat write.
    pub async fn append_noop(&self) -> Checkpoint {
        self.state
            .write()
            .await
            .log("n", "", doc! { "msg": "periodic noop" }, None)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn find(&self, ns: &Namespace, filter: &Document) -> Vec<Document> {
        let state = self.state.read().await;
        state
            .collections
            .get(ns)
            .map(|docs| {
                docs.iter()
                    .filter(|d| matches_filter(d, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn find_one(&self, ns: &Namespace, filter: &Document) -> Option<Document> {
        self.find(ns, filter).await.into_iter().next()
    }

    pub async fn count(&self, ns: &Namespace) -> usize {
        self.state
            .read()
            .await
            .collections
            .get(ns)
            .map_or(0, Vec::len)
    }

    /// Number of retained oplog entries.
    pub async fn oplog_len(&self) -> usize {
        self.state.read().await.oplog.len()
    }

    /// Retained raw oplog documents, oldest first.
    pub async fn oplog(&self) -> Vec<Document> {
        self.state.read().await.oplog.clone()
    }

    /// Position of the newest oplog entry.
    pub async fn latest_position(&self) -> Option<Checkpoint> {
        let state = self.state.read().await;
        state.oplog.last().and_then(|raw| oplog_position(raw).ok())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fault injection
    // ─────────────────────────────────────────────────────────────────────────

    /// Drop every oplog entry at or before `through`.
    pub async fn trim_oplog_through(&self, through: Checkpoint) {
        let mut state = self.state.write().await;
        let before = state.oplog.len();
        state
            .oplog
            .retain(|raw| oplog_position(raw).map_or(false, |p| p > through));
        if state.oplog.len() < before {
            state.trimmed_through = Some(state.trimmed_through.map_or(through, |t| t.max(through)));
        }
    }

    /// Make the next `count` oplog reads fail with a transient error.
    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` head lookups fail with a transient error.
    pub fn fail_next_heads(&self, count: u32) {
        self.failing_heads.store(count, Ordering::SeqCst);
    }

    /// Make replicated writes into `namespace` fail (or succeed again).
    ///
    /// Client writes through the node's own methods are unaffected.
    pub async fn set_failing_writes(&self, namespace: &Namespace, failing: bool) {
        let mut failing_writes = self.failing_writes.write().await;
        if failing {
            failing_writes.insert(namespace.clone());
        } else {
            failing_writes.remove(namespace);
        }
    }

    fn take_read_failure(&self) -> bool {
        take_one(&self.failing_reads)
    }

    async fn head_inner(&self) -> Result<Option<Checkpoint>> {
        if take_one(&self.failing_heads) {
            return Err(ReplicationError::mongo_msg(
                "find newest oplog entry",
                format!("injected head failure on {}", self.name),
            ));
        }
        Ok(self.latest_position().await)
    }

    async fn read_after_inner(&self, after: Checkpoint, limit: usize) -> Result<ReadResult> {
        if self.take_read_failure() {
            return Err(ReplicationError::mongo_msg(
                "read oplog",
                format!("injected read failure on {}", self.name),
            ));
        }

        let start = Instant::now();
        let state = self.state.read().await;

        if let Some(trimmed) = state.trimmed_through {
            if after < trimmed {
                let oldest = state
                    .oplog
                    .first()
                    .and_then(|raw| oplog_position(raw).ok())
                    .unwrap_or(trimmed);
                return Ok(ReadResult::HistoryLost {
                    requested: after,
                    oldest,
                });
            }
        }

        let mut entries = Vec::new();
        let mut scanned_through = None;
        let mut unparsed = None;
        let newer = state
            .oplog
            .iter()
            .filter(|raw| oplog_position(raw).map_or(false, |p| p > after))
            .take(limit);

        for raw in newer {
            let position = oplog_position(raw)?;
            match LogEntry::from_oplog(raw) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => trace!(node = %self.name, position = %position, "Skipping non-CRUD entry"),
                Err(e) => {
                    warn!(node = %self.name, position = %position, error = %e, "Failed to parse oplog entry");
                    unparsed = Some(UnparsedEntry::from_raw(raw, position, e));
                    break;
                }
            }
            scanned_through = Some(position);
        }

        crate::metrics::record_oplog_read(&self.name, entries.len(), start.elapsed());
        Ok(ReadResult::Batch {
            entries,
            scanned_through,
            unparsed,
        })
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl OplogSource for MemoryNode {
    fn read_after(&self, after: Checkpoint, limit: usize) -> BoxFuture<'_, ReadResult> {
        Box::pin(self.read_after_inner(after, limit))
    }

    fn head(&self) -> BoxFuture<'_, Option<Checkpoint>> {
        Box::pin(self.head_inner())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Destination adapter, cluster and connector
// ═══════════════════════════════════════════════════════════════════════════════

/// One collection of a [`MemoryNode`], as a replication destination.
pub struct MemoryCollection {
    node: Arc<MemoryNode>,
    namespace: Namespace,
}

impl MemoryCollection {
    pub fn new(node: Arc<MemoryNode>, namespace: Namespace) -> Self {
        Self { node, namespace }
    }

    async fn check_failing(&self) -> std::result::Result<(), WriteError> {
        if self.node.failing_writes.read().await.contains(&self.namespace) {
            return Err(WriteError::Failed(format!(
                "injected write failure on {}",
                self.node.name
            )));
        }
        Ok(())
    }
}

impl Destination for MemoryCollection {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn insert(&self, document: Document) -> WriteFuture<'_, ()> {
        Box::pin(async move {
            self.check_failing().await?;
            self.node.insert(&self.namespace, document).await.map(|_| ())
        })
    }

    fn update(&self, filter: Document, update: Document, upsert: bool) -> WriteFuture<'_, ()> {
        Box::pin(async move {
            self.check_failing().await?;
            self.node
                .update_one(&self.namespace, &filter, &update, upsert)
                .await
                .map(|_| ())
        })
    }

    fn delete(&self, filter: Document) -> WriteFuture<'_, u64> {
        Box::pin(async move {
            self.check_failing().await?;
            Ok(self.node.delete_many(&self.namespace, &filter).await)
        })
    }
}

/// A set of named [`MemoryNode`]s.
#[derive(Default)]
pub struct MemoryCluster {
    nodes: BTreeMap<String, Arc<MemoryNode>>,
}

impl MemoryCluster {
    pub fn with_nodes(names: &[&str]) -> Self {
        let mut cluster = Self::default();
        for name in names {
            cluster.add_node(name);
        }
        cluster
    }

    pub fn add_node(&mut self, name: &str) -> Arc<MemoryNode> {
        self.nodes
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryNode::new(name)))
            .clone()
    }

    pub fn node(&self, name: &str) -> Option<Arc<MemoryNode>> {
        self.nodes.get(name).cloned()
    }

    /// Node names in sorted order.
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// A connector that writes into `local`.
    pub fn connector(self: &Arc<Self>, local: &str) -> Result<MemoryConnector> {
        let node = self
            .node(local)
            .ok_or_else(|| ReplicationError::UnknownSource(local.to_string()))?;
        Ok(MemoryConnector {
            cluster: Arc::clone(self),
            local: node,
        })
    }
}

/// Opens oplogs and collections on a [`MemoryCluster`].
pub struct MemoryConnector {
    cluster: Arc<MemoryCluster>,
    local: Arc<MemoryNode>,
}

impl Connector for MemoryConnector {
    fn open_oplog<'a>(
        &'a self,
        name: &'a str,
        _node: &'a NodeConfig,
    ) -> BoxFuture<'a, Arc<dyn OplogSource>> {
        Box::pin(async move {
            let node = self
                .cluster
                .node(name)
                .ok_or_else(|| ReplicationError::UnknownSource(name.to_string()))?;
            Ok(node as Arc<dyn OplogSource>)
        })
    }

    fn open_collection<'a>(
        &'a self,
        namespace: &'a Namespace,
    ) -> BoxFuture<'a, Arc<dyn Destination>> {
        Box::pin(async move {
            Ok(Arc::new(MemoryCollection::new(Arc::clone(&self.local), namespace.clone()))
                as Arc<dyn Destination>)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Document helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = document.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Bson::Document(d) => d.get(part)?,
            Bson::Array(a) => a.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn matches_filter(document: &Document, filter: &Document) -> bool {
    filter
        .iter()
        .all(|(path, expected)| get_path(document, path) == Some(expected))
}

fn set_path(document: &mut Document, path: &str, value: Bson) -> std::result::Result<(), WriteError> {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            let child = document
                .entry(head.to_string())
                .or_insert_with(|| Bson::Document(Document::new()));
            set_in(child, rest, value)
        }
    }
}

fn set_in(target: &mut Bson, path: &str, value: Bson) -> std::result::Result<(), WriteError> {
    match target {
        Bson::Document(d) => set_path(d, path, value),
        Bson::Array(items) => {
            let (head, rest) = match path.split_once('.') {
                Some((h, r)) => (h, Some(r)),
                None => (path, None),
            };
            let index: usize = head.parse().map_err(|_| {
                WriteError::Failed(format!("cannot use '{}' as an array index", head))
            })?;
            while items.len() <= index {
                items.push(Bson::Null);
            }
            match rest {
                None => {
                    items[index] = value;
                    Ok(())
                }
                Some(rest) => {
                    if !matches!(items[index], Bson::Document(_) | Bson::Array(_)) {
                        items[index] = Bson::Document(Document::new());
                    }
                    set_in(&mut items[index], rest, value)
                }
            }
        }
        other => Err(WriteError::Failed(format!(
            "cannot create field '{}' in element of type {:?}",
            path,
            other.element_type()
        ))),
    }
}

fn unset_path(document: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            document.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(child)) = document.get_mut(head) {
                unset_path(child, rest);
            }
        }
    }
}

fn add_numbers(current: Option<&Bson>, delta: &Bson) -> std::result::Result<Bson, WriteError> {
    let not_numeric = || WriteError::Failed("cannot apply $inc to a non-numeric value".to_string());
    Ok(match (current, delta) {
        (None, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) => delta.clone(),
        (Some(Bson::Int32(a)), Bson::Int32(b)) => a
            .checked_add(*b)
            .map(Bson::Int32)
            .unwrap_or(Bson::Int64(i64::from(*a) + i64::from(*b))),
        (Some(Bson::Int32(a)), Bson::Int64(b)) => Bson::Int64(i64::from(*a) + b),
        (Some(Bson::Int64(a)), Bson::Int32(b)) => Bson::Int64(a + i64::from(*b)),
        (Some(Bson::Int64(a)), Bson::Int64(b)) => Bson::Int64(a + b),
        (Some(Bson::Double(a)), Bson::Int32(b)) => Bson::Double(a + f64::from(*b)),
        (Some(Bson::Double(a)), Bson::Int64(b)) => Bson::Double(a + *b as f64),
        (Some(Bson::Double(a)), Bson::Double(b)) => Bson::Double(a + b),
        (Some(Bson::Int32(a)), Bson::Double(b)) => Bson::Double(f64::from(*a) + b),
        (Some(Bson::Int64(a)), Bson::Double(b)) => Bson::Double(*a as f64 + b),
        _ => return Err(not_numeric()),
    })
}

/// Apply `$set` / `$unset` / `$inc`. Returns the top-level fields touched.
fn apply_modifiers(
    document: &mut Document,
    update: &Document,
) -> std::result::Result<BTreeSet<String>, WriteError> {
    let mut touched = BTreeSet::new();
    for (operator, args) in update {
        let Bson::Document(args) = args else {
            return Err(WriteError::Failed(format!(
                "argument of {} must be a document",
                operator
            )));
        };
        for (path, value) in args {
            match operator.as_str() {
                "$set" => set_path(document, path, value.clone())?,
                "$unset" => unset_path(document, path),
                "$inc" => {
                    let next = add_numbers(get_path(document, path), value)?;
                    set_path(document, path, next)?;
                }
                other => {
                    return Err(WriteError::Failed(format!(
                        "unsupported update operator {}",
                        other
                    )))
                }
            }
            let top = path.split('.').next().unwrap_or(path);
            touched.insert(top.to_string());
        }
    }
    Ok(touched)
}

/// The v2 diff of the touched top-level fields. Fields whose value did not
/// change are left out.
fn touched_diff(before: &Document, after: &Document, touched: &BTreeSet<String>) -> Document {
    let mut updated = Document::new();
    let mut inserted = Document::new();
    let mut deleted = Document::new();
    for field in touched {
        match (before.get(field), after.get(field)) {
            (Some(old), Some(value)) if old == value => {}
            (Some(_), Some(value)) => {
                updated.insert(field.clone(), value.clone());
            }
            (None, Some(value)) => {
                inserted.insert(field.clone(), value.clone());
            }
            (Some(_), None) => {
                deleted.insert(field.clone(), false);
            }
            (None, None) => {}
        }
    }

    let mut diff = Document::new();
    if !deleted.is_empty() {
        diff.insert("d", deleted);
    }
    if !updated.is_empty() {
        diff.insert("u", updated);
    }
    if !inserted.is_empty() {
        diff.insert("i", inserted);
    }
    diff
}

/// The document an upsert inserts: the filter's equality fields, then the
/// update applied on top.
fn build_upsert(filter: &Document, update: &Document) -> std::result::Result<Document, WriteError> {
    let mut base = Document::new();
    for (path, value) in filter {
        if path.starts_with('$') {
            continue;
        }
        if let Bson::Document(d) = value {
            if d.has_modifiers() {
                continue;
            }
        }
        set_path(&mut base, path, value.clone())?;
    }

    if update.has_modifiers() {
        apply_modifiers(&mut base, update)?;
        Ok(base)
    } else {
        let mut replacement = update.clone();
        if !replacement.contains_key("_id") {
            if let Some(id) = base.get("_id") {
                let mut with_id = doc! { "_id": id.clone() };
                with_id.extend(replacement);
                replacement = with_id;
            }
        }
        Ok(replacement)
    }
}
