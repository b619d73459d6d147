// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Applying source entries to a local collection.
//!
//! # Origin Tags
//!
//! Every replicated insert and update carries the node it first came from
//! under [`OriginTag::field`]. The tag is set only if absent, so a document
//! that travels A → B → C still names A when it reaches C.
//!
//! A write whose tag names the node about to receive it has come full
//! circle and is dropped ([`ApplyOutcome::SkippedLoop`]). Deletes carry no
//! document to tag and are always applied; deleting an absent document is
//! harmless.
//!
//! | Entry | Tag lives in | Loop check | Duplicate key |
//! |-------|--------------|------------|---------------|
//! | insert | the document | yes | `Duplicate` |
//! | update (modifiers) | the `$set` clause (created if absent) | yes | `Duplicate` |
//! | update (replacement) | the replacement document | yes | `Duplicate` |
//! | delete | - | no | - |

use crate::backend::{BoxFuture, Destination, WriteError};
use crate::document::DocumentExt;
use crate::entry::{LogEntry, OpKind};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::reader::{ApplyOutcome, Handler};
use crate::rules::NodeId;
use bson::{Bson, Document};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Where the origin tag lives and which identities it compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginTag {
    /// Field name, `"__mmm"` by default.
    pub field: String,
    /// The node receiving replicated writes.
    pub local: NodeId,
    /// The node entries are read from; stamped when no tag is present.
    pub source: NodeId,
}

impl OriginTag {
    pub fn new(field: impl Into<String>, local: NodeId, source: NodeId) -> Self {
        Self {
            field: field.into(),
            local,
            source,
        }
    }

    /// Whether `document` already originated at the local node.
    fn is_loop(&self, document: &Document) -> bool {
        document
            .get(&self.field)
            .map_or(false, |tag| self.local.matches(tag))
    }
}

/// Applies entries of one source namespace to one destination collection.
pub struct Replicator {
    tag: OriginTag,
    destination: Arc<dyn Destination>,
    label: String,
}

impl Replicator {
    pub fn new(tag: OriginTag, destination: Arc<dyn Destination>) -> Self {
        let label = destination.namespace().to_string();
        Self {
            tag,
            destination,
            label,
        }
    }

    pub fn tag(&self) -> &OriginTag {
        &self.tag
    }

    /// Apply one entry.
    pub async fn apply_entry(&self, entry: &LogEntry) -> Result<ApplyOutcome> {
        let start = Instant::now();
        let result = match entry.op {
            OpKind::Insert => self.insert(entry).await,
            OpKind::Update => self.update(entry).await,
            OpKind::Delete => self.delete(entry).await,
        };

        let outcome = match &result {
            Ok(outcome) => outcome.as_str(),
            Err(_) => "failed",
        };
        metrics::record_apply(&self.label, entry.op.as_str(), outcome);
        metrics::record_apply_latency(&self.label, start.elapsed());
        result
    }

    async fn insert(&self, entry: &LogEntry) -> Result<ApplyOutcome> {
        if self.tag.is_loop(&entry.document) {
            trace!(destination = %self.label, position = %entry.position, "Insert originated here, skipping");
            return Ok(ApplyOutcome::SkippedLoop);
        }

        let mut document = entry.document.clone();
        document.set_if_absent(&self.tag.field, self.tag.source.to_bson());
        self.write_outcome(self.destination.insert(document).await)
    }

    async fn update(&self, entry: &LogEntry) -> Result<ApplyOutcome> {
        let filter = entry.match_spec.clone().ok_or_else(|| {
            ReplicationError::EntryParse(format!(
                "update at {} has no match spec",
                entry.position
            ))
        })?;

        let mut update = entry.document.clone();
        let target = tag_target(&mut update)?;
        if self.tag.is_loop(target) {
            trace!(destination = %self.label, position = %entry.position, "Update originated here, skipping");
            return Ok(ApplyOutcome::SkippedLoop);
        }
        target.set_if_absent(&self.tag.field, self.tag.source.to_bson());

        self.write_outcome(self.destination.update(filter, update, entry.upsert).await)
    }

    async fn delete(&self, entry: &LogEntry) -> Result<ApplyOutcome> {
        match self.destination.delete(entry.document.clone()).await {
            Ok(removed) => {
                trace!(destination = %self.label, removed, "Applied delete");
                Ok(ApplyOutcome::Applied)
            }
            Err(e) => Err(self.failed(e)),
        }
    }

    fn write_outcome(&self, result: std::result::Result<(), WriteError>) -> Result<ApplyOutcome> {
        match result {
            Ok(()) => Ok(ApplyOutcome::Applied),
            Err(WriteError::DuplicateKey) => {
                debug!(destination = %self.label, "Document already present");
                Ok(ApplyOutcome::Duplicate)
            }
            Err(e) => Err(self.failed(e)),
        }
    }

    fn failed(&self, e: WriteError) -> ReplicationError {
        ReplicationError::Destination {
            namespace: self.label.clone(),
            message: e.to_string(),
        }
    }
}

impl Handler for Replicator {
    fn apply<'a>(&'a self, entry: &'a LogEntry) -> BoxFuture<'a, ApplyOutcome> {
        Box::pin(self.apply_entry(entry))
    }
}

/// The document an update's tag belongs in.
fn tag_target(update: &mut Document) -> Result<&mut Document> {
    if update.has_modifiers() {
        if !update.contains_key("$set") {
            update.insert("$set", Document::new());
        }
        match update.get_mut("$set") {
            Some(Bson::Document(set)) => Ok(set),
            _ => Err(ReplicationError::EntryParse(
                "$set clause is not a document".to_string(),
            )),
        }
    } else {
        Ok(update)
    }
}
