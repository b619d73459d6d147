// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Oplog tailing and dispatch.
//!
//! A [`ChangeFeedReader`] follows one source's oplog and hands each entry to
//! the [`Handler`]s registered for its `(namespace, kind)`.
//!
//! # Loop
//!
//! ```text
//! resolve start ──→ read_after(checkpoint, batch_size)
//!                        │
//!          ┌─────────────┼──────────────────┬───────────────┐
//!          ↓             ↓                  ↓               ↓
//!     non-empty        empty           transient err     fatal / HistoryLost
//!     advance +        sleep idle      sleep idle        return Err
//!     dispatch,        interval        interval
//!     yield
//! ```
//!
//! The checkpoint is advanced to an entry's position *before* its handlers
//! run, and to the batch's `scanned_through` afterwards so that no-ops and
//! commands are not re-read. Every wait races the shutdown signal.
//!
//! # Hot Registration
//!
//! The dispatch table lives behind a shared [`HandlerRegistry`]. Handlers can
//! be added and removed while [`ChangeFeedReader::run`] is in progress; the
//! loop clones the handler list for a key before awaiting any of them, so no
//! lock is held across a handler call.

use crate::backend::{BoxFuture, OplogSource, ReadResult};
use crate::checkpoint::Checkpoint;
use crate::config::ReaderConfig;
use crate::entry::{LogEntry, Namespace, OpKind, OpSet, UnparsedEntry};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, trace, warn};

/// What a handler did with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The write was applied to the destination.
    Applied,
    /// The write originated at the destination node and was dropped.
    SkippedLoop,
    /// The destination already had the document.
    Duplicate,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::SkippedLoop => "skipped_loop",
            ApplyOutcome::Duplicate => "duplicate",
        }
    }
}

impl std::fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that consumes oplog entries.
///
/// An `Err` is fatal to the reader that invoked it.
pub trait Handler: Send + Sync + 'static {
    fn apply<'a>(&'a self, entry: &'a LogEntry) -> BoxFuture<'a, ApplyOutcome>;
}

/// Identifies one registration, for [`HandlerRegistry::unregister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

type DispatchKey = (Namespace, OpKind);

#[derive(Default)]
struct DispatchTable {
    next_id: u64,
    handlers: HashMap<DispatchKey, Vec<(HandlerId, Arc<dyn Handler>)>>,
}

/// Shared, mutable dispatch table of one reader.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    table: Arc<RwLock<DispatchTable>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the dispatch list of `(namespace, op)` for every
    /// `op` in `ops`.
    pub async fn register(
        &self,
        namespace: Namespace,
        ops: OpSet,
        handler: Arc<dyn Handler>,
    ) -> HandlerId {
        let mut table = self.table.write().await;
        table.next_id += 1;
        let id = HandlerId(table.next_id);
        for op in ops.iter() {
            table
                .handlers
                .entry((namespace.clone(), op))
                .or_default()
                .push((id, Arc::clone(&handler)));
        }
        id
    }

    /// Remove a registration from every key it was added to.
    ///
    /// Returns `false` if `id` was not registered.
    pub async fn unregister(&self, id: HandlerId) -> bool {
        let mut table = self.table.write().await;
        let mut found = false;
        table.handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(hid, _)| *hid != id);
            found |= list.len() < before;
            !list.is_empty()
        });
        found
    }

    /// Snapshot of the handlers for one key, in registration order.
    pub async fn handlers_for(&self, namespace: &Namespace, op: OpKind) -> Vec<Arc<dyn Handler>> {
        let table = self.table.read().await;
        table
            .handlers
            .get(&(namespace.clone(), op))
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Number of `(namespace, kind)` keys with at least one handler.
    pub async fn key_count(&self) -> usize {
        self.table.read().await.handlers.len()
    }
}

/// Tails one source's oplog.
pub struct ChangeFeedReader {
    source_name: String,
    source: Arc<dyn OplogSource>,
    start: Option<Checkpoint>,
    config: ReaderConfig,
    registry: HandlerRegistry,
    checkpoint_tx: watch::Sender<Checkpoint>,
}

impl ChangeFeedReader {
    /// Create a reader. With `start = None` the reader begins at the
    /// source's current head.
    pub fn new(
        source_name: impl Into<String>,
        source: Arc<dyn OplogSource>,
        start: Option<Checkpoint>,
        config: ReaderConfig,
    ) -> Self {
        let (checkpoint_tx, _) = watch::channel(start.unwrap_or(Checkpoint::ZERO));
        Self {
            source_name: source_name.into(),
            source,
            start,
            config,
            registry: HandlerRegistry::new(),
            checkpoint_tx,
        }
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Handle to this reader's dispatch table.
    pub fn registry(&self) -> HandlerRegistry {
        self.registry.clone()
    }

    pub async fn register(
        &self,
        namespace: Namespace,
        ops: OpSet,
        handler: Arc<dyn Handler>,
    ) -> HandlerId {
        self.registry.register(namespace, ops, handler).await
    }

    pub async fn unregister(&self, id: HandlerId) -> bool {
        self.registry.unregister(id).await
    }

    /// Position of the last entry handed to handlers (or scanned past).
    pub fn checkpoint(&self) -> Checkpoint {
        *self.checkpoint_tx.borrow()
    }

    pub fn checkpoint_receiver(&self) -> watch::Receiver<Checkpoint> {
        self.checkpoint_tx.subscribe()
    }

    /// Fix the start position: the explicit checkpoint, else the source's
    /// head, else the current wall-clock second.
    pub async fn resolve_start(&mut self) -> Result<Checkpoint> {
        let start = match self.start {
            Some(checkpoint) => checkpoint,
            None => match self.source.head().await? {
                Some(head) => head,
                None => Checkpoint::now(),
            },
        };
        self.start = Some(start);
        self.checkpoint_tx.send_replace(start);
        Ok(start)
    }

    /// Resolve the start position, retrying transient head lookups every idle
    /// interval. Returns `None` if shutdown arrives first.
    pub async fn wait_for_start(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Checkpoint>> {
        let idle = self.config.idle_interval_duration();
        loop {
            match self.resolve_start().await {
                Ok(start) => return Ok(Some(start)),
                Err(e) if e.is_retryable() => {
                    warn!(source = %self.source_name, error = %e, "Failed to read oplog head, retrying");
                    metrics::record_read_error(&self.source_name, true);
                    if wait_or_shutdown(shutdown, idle).await {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Tail until `shutdown` flips to `true`.
    ///
    /// Returns `Ok(())` on shutdown and `Err` on a fatal source or handler
    /// failure.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let idle = self.config.idle_interval_duration();
        let batch_size = self.config.batch_size.max(1);

        let Some(mut checkpoint) = self.wait_for_start(&mut shutdown).await? else {
            return Ok(());
        };

        info!(source = %self.source_name, checkpoint = %checkpoint, "Tailing oplog");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let read = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                read = self.source.read_after(checkpoint, batch_size) => read,
            };

            match read {
                Ok(ReadResult::Batch {
                    entries,
                    scanned_through,
                    unparsed,
                }) => {
                    let count = entries.len();
                    for entry in &entries {
                        if *shutdown.borrow() {
                            debug!(source = %self.source_name, "Shutdown mid-batch");
                            return Ok(());
                        }
                        checkpoint = entry.position;
                        self.checkpoint_tx.send_replace(checkpoint);
                        self.dispatch(entry).await?;
                    }

                    if let Some(scanned) = scanned_through {
                        if scanned > checkpoint {
                            checkpoint = scanned;
                            self.checkpoint_tx.send_replace(checkpoint);
                        }
                    }

                    let skipped = match unparsed {
                        Some(unparsed) => {
                            self.skip_unparsed(&unparsed).await?;
                            checkpoint = unparsed.position;
                            self.checkpoint_tx.send_replace(checkpoint);
                            true
                        }
                        None => false,
                    };

                    if count > 0 {
                        debug!(
                            source = %self.source_name,
                            entries = count,
                            checkpoint = %checkpoint,
                            "Processed batch"
                        );
                        metrics::record_checkpoint_lag(
                            &self.source_name,
                            checkpoint.lag_secs(&Checkpoint::now()),
                        );
                    }

                    if scanned_through.is_some() || skipped {
                        tokio::task::yield_now().await;
                    } else {
                        metrics::record_idle_poll(&self.source_name);
                        if wait_or_shutdown(&mut shutdown, idle).await {
                            break;
                        }
                    }
                }
                Ok(ReadResult::HistoryLost { requested, oldest }) => {
                    error!(
                        source = %self.source_name,
                        requested = %requested,
                        oldest = %oldest,
                        "Checkpoint is older than the retained oplog"
                    );
                    metrics::record_history_lost(&self.source_name);
                    return Err(ReplicationError::HistoryLost {
                        source_name: self.source_name.clone(),
                        requested,
                        oldest,
                    });
                }
                Err(e) if e.is_retryable() => {
                    warn!(source = %self.source_name, error = %e, "Oplog read failed, retrying");
                    metrics::record_read_error(&self.source_name, true);
                    if wait_or_shutdown(&mut shutdown, idle).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(source = %self.source_name, error = %e, "Oplog read failed");
                    metrics::record_read_error(&self.source_name, false);
                    return Err(e);
                }
            }
        }

        info!(source = %self.source_name, checkpoint = %checkpoint, "Reader stopped");
        Ok(())
    }

    /// Move past an entry that failed to parse, unless a handler is
    /// registered for its namespace and kind (or they are unknown).
    async fn skip_unparsed(&self, unparsed: &UnparsedEntry) -> Result<()> {
        let wanted = match (&unparsed.namespace, unparsed.op) {
            (Some(namespace), Some(op)) => {
                !self.registry.handlers_for(namespace, op).await.is_empty()
            }
            _ => true,
        };
        if wanted {
            error!(
                source = %self.source_name,
                position = %unparsed.position,
                reason = %unparsed.reason,
                "Unparseable oplog entry in a replicated namespace"
            );
            return Err(ReplicationError::EntryParse(format!(
                "entry at {} on {}: {}",
                unparsed.position, self.source_name, unparsed.reason
            )));
        }

        warn!(
            source = %self.source_name,
            position = %unparsed.position,
            reason = %unparsed.reason,
            "Skipping unparseable oplog entry"
        );
        metrics::record_entry_skipped(&self.source_name, "parse_error");
        Ok(())
    }

    async fn dispatch(&self, entry: &LogEntry) -> Result<()> {
        let handlers = self.registry.handlers_for(&entry.namespace, entry.op).await;
        if handlers.is_empty() {
            return Ok(());
        }

        metrics::record_entry_dispatched(&self.source_name, entry.op.as_str());
        for handler in handlers {
            let outcome = handler.apply(entry).await?;
            trace!(
                source = %self.source_name,
                position = %entry.position,
                op = %entry.op,
                namespace = %entry.namespace,
                outcome = %outcome,
                "Dispatched entry"
            );
        }
        Ok(())
    }
}

/// Sleep for `duration` unless shutdown is signalled first.
///
/// Returns `true` if the caller should stop.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(duration) => false,
    }
}
