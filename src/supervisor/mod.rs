// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication supervisor.
//!
//! Owns the per-source configuration and the tasks that act on it:
//! - one reader task per source node, built from its [`MasterConfig`]
//! - one periodic task flushing in-memory checkpoints to the [`ConfigStore`]
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────────────── ReplicationSupervisor ─────────────────┐
//!  set_replication ─►│ sources: RwLock<HashMap<name, Arc<Mutex<SourceEntry>>>>        │
//!  unset_replication │                                                                │
//!                    │   SourceEntry ── MasterConfig (rules, checkpoint)              │
//!                    │        │                                                       │
//!                    │        └── task: ChangeFeedReader ──► Replicator per rule      │
//!                    │                      │ checkpoint (watch)                      │
//!                    │                      ▼                                         │
//!                    │              flush task ──► ConfigStore                        │
//!                    └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Locking
//!
//! A source's rule changes, task start/stop and flushes hold that source's
//! `Mutex`. The map lock is only held briefly and never while waiting for a
//! source's `Mutex`; the reverse order (source first, then map) is allowed.
//!
//! # Failures
//!
//! A source task that hits a fatal error moves to [`SourceState::Failed`],
//! and a [`SourceFailure`] is published on the channel from
//! [`ReplicationSupervisor::take_failures`]. Other sources keep running.
//! Failed sources are not restarted automatically; the next `start()` or a
//! rule change for the source restarts it.

mod tailer;
mod types;

pub use types::{SourceFailure, SourceState, SupervisorState};

use crate::backend::Connector;
use crate::checkpoint::Checkpoint;
use crate::config::{NodeConfig, ReplicationConfig};
use crate::entry::{Namespace, OpSet};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::reader::{ChangeFeedReader, HandlerId, HandlerRegistry};
use crate::replicator::{OriginTag, Replicator};
use crate::rules::{MasterConfig, NodeId, ReplicationRule, RuleFilter};
use crate::store::ConfigStore;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A spawned task and its shutdown signal.
struct BackgroundTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Signal shutdown and wait up to `timeout`, aborting the task after that.
    ///
    /// Returns `Err` only if the task panicked.
    async fn stop(self, timeout: Duration, label: &str) -> Result<()> {
        let BackgroundTask {
            shutdown_tx,
            mut handle,
        } = self;
        // The task may already have exited.
        let _ = shutdown_tx.send(true);

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => debug!(task = %label, "Task stopped"),
            Ok(Err(e)) if e.is_panic() => {
                warn!(task = %label, error = %e, "Task panicked");
                return Err(ReplicationError::Internal(format!(
                    "task '{}' panicked: {}",
                    label, e
                )));
            }
            Ok(Err(e)) => debug!(task = %label, error = %e, "Task cancelled"),
            Err(_) => {
                warn!(task = %label, timeout = ?timeout, "Task did not stop in time, aborting");
                handle.abort();
            }
        }
        Ok(())
    }
}

/// A source's running reader.
struct RunningSource {
    task: BackgroundTask,
    registry: HandlerRegistry,
    checkpoint_rx: watch::Receiver<Checkpoint>,
    /// Started without a checkpoint, so the task looks up the head itself.
    from_head: bool,
    /// One registration per rule route.
    handlers: Vec<(ReplicationRule, HandlerId)>,
}

impl RunningSource {
    /// The reader's position, or `None` while a head-started reader has not
    /// resolved its start yet.
    fn checkpoint(&self) -> Option<Checkpoint> {
        let checkpoint = *self.checkpoint_rx.borrow();
        (!self.from_head || checkpoint != Checkpoint::ZERO).then_some(checkpoint)
    }
}

/// Everything the supervisor holds for one source node.
struct SourceEntry {
    name: String,
    node: NodeConfig,
    master: MasterConfig,
    /// Last checkpoint written to the store.
    flushed: Option<Checkpoint>,
    state: Arc<watch::Sender<SourceState>>,
    task: Option<RunningSource>,
}

impl SourceEntry {
    fn new(name: &str, node: &NodeConfig) -> Self {
        Self {
            name: name.to_string(),
            node: node.clone(),
            master: MasterConfig::new(node.id.clone()),
            flushed: None,
            state: Arc::new(watch::channel(SourceState::Stopped).0),
            task: None,
        }
    }

    /// The reader's live position, else the last known one.
    fn current_checkpoint(&self) -> Option<Checkpoint> {
        self.task
            .as_ref()
            .and_then(RunningSource::checkpoint)
            .or(self.master.checkpoint)
    }

    fn is_live(&self) -> bool {
        self.task.is_some()
            && matches!(
                *self.state.borrow(),
                SourceState::Starting | SourceState::Running
            )
    }

    fn set_state(&self, state: SourceState) {
        self.state.send_replace(state);
        metrics::set_source_state(&self.name, &state.to_string());
    }
}

type SourceSlot = Arc<Mutex<SourceEntry>>;

struct Inner {
    config: ReplicationConfig,
    local_id: NodeId,
    connector: Arc<dyn Connector>,
    store: Arc<dyn ConfigStore>,
    sources: RwLock<HashMap<String, SourceSlot>>,
    state_tx: watch::Sender<SupervisorState>,
    flush_task: Mutex<Option<BackgroundTask>>,
    /// Serializes start / shutdown / clear.
    lifecycle: Mutex<()>,
    failures_tx: mpsc::UnboundedSender<SourceFailure>,
    failures_rx: Mutex<Option<mpsc::UnboundedReceiver<SourceFailure>>>,
}

/// Runs replication from every configured source into the local node.
pub struct ReplicationSupervisor {
    inner: Arc<Inner>,
}

impl ReplicationSupervisor {
    /// Create a supervisor for `config.local_node`.
    ///
    /// Starts in [`SupervisorState::Created`]; rules may be set before
    /// [`start()`](Self::start) and take effect when it runs.
    pub fn new(
        config: ReplicationConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn ConfigStore>,
    ) -> Result<Self> {
        let local_id = config.local()?.id.clone();
        let (state_tx, _) = watch::channel(SupervisorState::Created);
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                local_id,
                connector,
                store,
                sources: RwLock::new(HashMap::new()),
                state_tx,
                flush_task: Mutex::new(None),
                lifecycle: Mutex::new(()),
                failures_tx,
                failures_rx: Mutex::new(Some(failures_rx)),
            }),
        })
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<SupervisorState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SupervisorState::Running
    }

    /// This node's identity, compared against incoming origin tags.
    pub fn local_id(&self) -> &NodeId {
        &self.inner.local_id
    }

    /// Replicate `ops` on `src` from the node named `source` into `dst`.
    ///
    /// Replaces any rule with the same `(src, dst)`. Persisted before it
    /// takes effect. If the source is already running the new replicator is
    /// added without restarting it.
    pub async fn set_replication(
        &self,
        source: &str,
        dst: Namespace,
        src: Namespace,
        ops: OpSet,
    ) -> Result<()> {
        self.inner
            .set_replication(source, ReplicationRule::new(src, dst, ops))
            .await
    }

    /// Remove replication from `source`.
    ///
    /// With both namespaces exactly that rule is removed; with one, every
    /// rule matching it; with neither, all of the source's replication.
    pub async fn unset_replication(
        &self,
        source: &str,
        dst: Option<Namespace>,
        src: Option<Namespace>,
    ) -> Result<()> {
        self.inner
            .unset_replication(source, RuleFilter { src, dst })
            .await
    }

    /// (Re)start every stored source, optionally overriding all start
    /// checkpoints.
    ///
    /// A source with no checkpoint starts at the oplog head its task observes
    /// and stays `Starting` until that lookup succeeds.
    pub async fn start(&self, checkpoint: Option<Checkpoint>) -> Result<()> {
        self.inner.start(checkpoint).await
    }

    /// Persist in-memory checkpoints for one source (by name) or all.
    pub async fn checkpoint(&self, source: Option<&str>) -> Result<()> {
        self.inner.checkpoint(source).await
    }

    /// Stop all tasks and flush final checkpoints.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }

    /// Stored rules per source name. Sources missing from the topology are
    /// listed by id.
    pub async fn dump_config(&self) -> Result<BTreeMap<String, Vec<ReplicationRule>>> {
        self.inner.dump_config().await
    }

    /// Stop every source and delete all stored configuration.
    pub async fn clear_config(&self) -> Result<()> {
        self.inner.clear_config().await
    }

    pub async fn source_state(&self, source: &str) -> Option<SourceState> {
        let slot = self.inner.slot(source).await?;
        let entry = slot.lock().await;
        let state = *entry.state.borrow();
        Some(state)
    }

    /// In-memory checkpoint of a source.
    pub async fn source_checkpoint(&self, source: &str) -> Option<Checkpoint> {
        let slot = self.inner.slot(source).await?;
        let entry = slot.lock().await;
        entry.current_checkpoint()
    }

    /// The channel of source failures. Returns `None` after the first call.
    pub async fn take_failures(&self) -> Option<mpsc::UnboundedReceiver<SourceFailure>> {
        self.inner.failures_rx.lock().await.take()
    }
}

impl Inner {
    fn state(&self) -> SupervisorState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: SupervisorState) {
        self.state_tx.send_replace(state);
        metrics::set_supervisor_state(&state.to_string());
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.state() == SupervisorState::ShuttingDown {
            return Err(ReplicationError::Shutdown);
        }
        Ok(())
    }

    fn node(&self, name: &str) -> Result<&NodeConfig> {
        let node = self
            .config
            .topology
            .get(name)
            .ok_or_else(|| ReplicationError::UnknownSource(name.to_string()))?;
        if name == self.config.local_node {
            return Err(ReplicationError::Config(format!(
                "'{}' is the local node and cannot be a replication source",
                name
            )));
        }
        Ok(node)
    }

    fn name_for(&self, id: &NodeId) -> Option<(&String, &NodeConfig)> {
        self.config.topology.iter().find(|(_, node)| &node.id == id)
    }

    async fn slot(&self, name: &str) -> Option<SourceSlot> {
        self.sources.read().await.get(name).cloned()
    }

    async fn slot_or_create(&self, name: &str, node: &NodeConfig) -> SourceSlot {
        let mut sources = self.sources.write().await;
        Arc::clone(
            sources
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SourceEntry::new(name, node)))),
        )
    }

    /// Whether `slot` is still the map's entry for `name`.
    async fn is_current(&self, name: &str, slot: &SourceSlot) -> bool {
        self.sources
            .read()
            .await
            .get(name)
            .map_or(false, |current| Arc::ptr_eq(current, slot))
    }

    async fn all_slots(&self) -> Vec<SourceSlot> {
        self.sources.read().await.values().cloned().collect()
    }

    async fn refresh_running_gauge(&self) {
        let mut running = 0;
        for slot in self.all_slots().await {
            if slot.lock().await.task.is_some() {
                running += 1;
            }
        }
        metrics::set_running_sources(running);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Rules
    // ─────────────────────────────────────────────────────────────────────────

    async fn set_replication(&self, source: &str, rule: ReplicationRule) -> Result<()> {
        self.ensure_accepting()?;
        let node = self.node(source)?.clone();

        loop {
            let slot = self.slot_or_create(source, &node).await;
            let mut guard = slot.lock().await;
            if !self.is_current(source, &slot).await {
                continue;
            }
            let entry = &mut *guard;

            if let Err(e) = self.store.upsert_rule(&node.id, &rule).await {
                if entry.master.rules.is_empty() && entry.task.is_none() {
                    self.sources.write().await.remove(source);
                }
                return Err(e);
            }
            let replaced = entry.master.upsert_rule(rule.clone());
            metrics::record_rule_change(source, "add");
            info!(
                source = %source,
                rule = %rule,
                replaced = replaced.is_some(),
                "Replication rule set"
            );

            if entry.is_live() {
                self.hot_add(entry, &rule).await?;
            } else if self.state() == SupervisorState::Running {
                self.stop_source(entry).await;
                self.start_source(entry, None).await;
                drop(guard);
                self.refresh_running_gauge().await;
            }
            return Ok(());
        }
    }

    async fn unset_replication(&self, source: &str, filter: RuleFilter) -> Result<()> {
        self.ensure_accepting()?;
        let node = self.node(source)?.clone();

        let Some(slot) = self.slot(source).await else {
            // Not loaded (before start): edit the store directly.
            if filter.is_all() || self.store.pull_rules(&node.id, &filter).await? == 0 {
                self.store.remove(&node.id).await?;
            }
            info!(source = %source, "Replication rules removed from store");
            return Ok(());
        };

        let mut guard = slot.lock().await;
        if !self.is_current(source, &slot).await {
            return Ok(());
        }
        let entry = &mut *guard;

        let remove_all = if filter.is_all() {
            true
        } else {
            let remaining = self.store.pull_rules(&node.id, &filter).await?;
            let removed = entry.master.pull_rules(&filter);
            if let Some(running) = entry.task.as_mut() {
                let mut kept = Vec::with_capacity(running.handlers.len());
                for (rule, id) in running.handlers.drain(..) {
                    if filter.matches(&rule) {
                        running.registry.unregister(id).await;
                    } else {
                        kept.push((rule, id));
                    }
                }
                running.handlers = kept;
            }
            for rule in &removed {
                metrics::record_rule_change(source, "remove");
                info!(source = %source, rule = %rule, "Replication rule removed");
            }
            remaining == 0 || entry.master.rules.is_empty()
        };

        if remove_all {
            self.stop_source(entry).await;
            self.store.remove(&node.id).await?;
            self.sources.write().await.remove(source);
            metrics::record_rule_change(source, "remove_all");
            info!(source = %source, "All replication from source removed");
            drop(guard);
            self.refresh_running_gauge().await;
        }
        Ok(())
    }

    async fn register_rule(
        &self,
        registry: &HandlerRegistry,
        source_id: &NodeId,
        rule: &ReplicationRule,
    ) -> Result<HandlerId> {
        let destination = self.connector.open_collection(&rule.dst).await?;
        let tag = OriginTag::new(
            self.config.settings.tag_field.clone(),
            self.local_id.clone(),
            source_id.clone(),
        );
        let replicator = Arc::new(Replicator::new(tag, destination));
        Ok(registry
            .register(rule.src.clone(), rule.ops, replicator)
            .await)
    }

    /// Add (or replace) a rule's replicator on a running reader.
    async fn hot_add(&self, entry: &mut SourceEntry, rule: &ReplicationRule) -> Result<()> {
        let Some(running) = entry.task.as_mut() else {
            return Ok(());
        };
        if let Some(index) = running.handlers.iter().position(|(r, _)| r.same_route(rule)) {
            let (_, old) = running.handlers.remove(index);
            running.registry.unregister(old).await;
        }
        let id = self
            .register_rule(&running.registry, &entry.master.source_id, rule)
            .await?;
        running.handlers.push((rule.clone(), id));
        debug!(source = %entry.name, rule = %rule, "Replicator added to running source");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Source tasks
    // ─────────────────────────────────────────────────────────────────────────

    /// Start a source, reporting any failure through the failure channel.
    async fn start_source(&self, entry: &mut SourceEntry, checkpoint: Option<Checkpoint>) {
        if let Err(e) = self.try_start_source(entry, checkpoint).await {
            error!(source = %entry.name, error = %e, "Failed to start source");
            entry.set_state(SourceState::Failed);
            let failure = SourceFailure {
                source: entry.name.clone(),
                error: e,
            };
            metrics::record_source_failure(&failure.source, failure.error_type());
            let _ = self.failures_tx.send(failure);
        }
    }

    async fn try_start_source(
        &self,
        entry: &mut SourceEntry,
        checkpoint: Option<Checkpoint>,
    ) -> Result<()> {
        entry.set_state(SourceState::Starting);

        let oplog = self.connector.open_oplog(&entry.name, &entry.node).await?;
        let start = checkpoint.or(entry.master.checkpoint);
        let reader = ChangeFeedReader::new(
            entry.name.clone(),
            oplog,
            start,
            self.config.settings.reader.clone(),
        );

        let registry = reader.registry();
        let mut handlers = Vec::with_capacity(entry.master.rules.len());
        for rule in &entry.master.rules {
            let id = self
                .register_rule(&registry, &entry.master.source_id, rule)
                .await?;
            handlers.push((rule.clone(), id));
        }

        let checkpoint_rx = reader.checkpoint_receiver();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(tailer::run_source(
            reader,
            shutdown_rx,
            Arc::clone(&entry.state),
            self.failures_tx.clone(),
        ));

        entry.task = Some(RunningSource {
            task: BackgroundTask {
                shutdown_tx,
                handle,
            },
            registry,
            checkpoint_rx,
            from_head: start.is_none(),
            handlers,
        });
        info!(
            source = %entry.name,
            checkpoint = ?start,
            rules = entry.master.rules.len(),
            "Source started"
        );
        Ok(())
    }

    /// Stop a source's task. Returns its final checkpoint.
    async fn stop_source(&self, entry: &mut SourceEntry) -> Option<Checkpoint> {
        let running = entry.task.take()?;
        let stopped = running
            .task
            .stop(self.config.settings.stop_timeout_duration(), &entry.name)
            .await;

        // `running.task` was moved above, so read the remaining fields directly.
        let checkpoint = *running.checkpoint_rx.borrow();
        if !running.from_head || checkpoint != Checkpoint::ZERO {
            entry.master.checkpoint = Some(checkpoint);
        }
        if let Err(e) = stopped {
            entry.set_state(SourceState::Failed);
            let failure = SourceFailure {
                source: entry.name.clone(),
                error: e,
            };
            metrics::record_source_failure(&failure.source, failure.error_type());
            let _ = self.failures_tx.send(failure);
        } else if *entry.state.borrow() != SourceState::Failed {
            entry.set_state(SourceState::Stopped);
        }
        debug!(source = %entry.name, checkpoint = ?entry.master.checkpoint, "Source stopped");
        entry.master.checkpoint
    }

    /// Stop every source, optionally flushing final checkpoints.
    async fn stop_all(&self, flush: bool) {
        for slot in self.all_slots().await {
            let mut guard = slot.lock().await;
            let entry = &mut *guard;
            if self.stop_source(entry).await.is_some() && flush {
                if let Err(e) = self.flush_entry(entry).await {
                    warn!(source = %entry.name, error = %e, "Failed to flush final checkpoint");
                }
            }
        }
        metrics::set_running_sources(0);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Checkpoints
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist a source's checkpoint if it moved. Returns whether it wrote.
    async fn flush_entry(&self, entry: &mut SourceEntry) -> Result<bool> {
        let Some(checkpoint) = entry.current_checkpoint() else {
            return Ok(false);
        };
        if entry.flushed == Some(checkpoint) {
            return Ok(false);
        }
        self.store
            .set_checkpoint(&entry.master.source_id, checkpoint)
            .await?;
        entry.flushed = Some(checkpoint);
        entry.master.checkpoint = Some(checkpoint);
        debug!(source = %entry.name, checkpoint = %checkpoint, "Checkpoint flushed");
        Ok(true)
    }

    /// Flush every source. Attempts all, returns the first error.
    async fn flush_all(&self) -> Result<usize> {
        let mut flushed = 0;
        let mut errors = 0;
        let mut first_error = None;

        for slot in self.all_slots().await {
            let mut guard = slot.lock().await;
            let entry = &mut *guard;
            match self.flush_entry(entry).await {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(source = %entry.name, error = %e, "Checkpoint flush failed");
                    errors += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        metrics::record_checkpoint_flush(flushed, errors);
        match first_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    async fn checkpoint(&self, source: Option<&str>) -> Result<()> {
        match source {
            None => self.flush_all().await.map(|_| ()),
            Some(name) => {
                self.node(name)?;
                let slot = self.slot(name).await.ok_or_else(|| {
                    ReplicationError::Config(format!(
                        "no replication is configured from '{}'",
                        name
                    ))
                })?;
                let mut guard = slot.lock().await;
                self.flush_entry(&mut guard).await.map(|_| ())
            }
        }
    }

    fn spawn_flush_task(self: &Arc<Self>) -> BackgroundTask {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let period = self.config.settings.checkpoint.flush_interval_duration();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        if let Err(e) = inner.flush_all().await {
                            warn!(error = %e, "Periodic checkpoint flush failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Checkpoint flush task stopping");
                            break;
                        }
                    }
                }
            }
        });

        debug!(period = ?period, "Spawned checkpoint flush task");
        BackgroundTask {
            shutdown_tx,
            handle,
        }
    }

    async fn stop_flush_task(&self) {
        if let Some(task) = self.flush_task.lock().await.take() {
            if let Err(e) = task
                .stop(self.config.settings.stop_timeout_duration(), "checkpoint_flush")
                .await
            {
                error!(error = %e, "Checkpoint flush task failed");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    async fn start(self: &Arc<Self>, checkpoint: Option<Checkpoint>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.ensure_accepting()?;
        if self.state() == SupervisorState::Stopped {
            return Err(ReplicationError::InvalidState {
                expected: "Created or Running".to_string(),
                actual: SupervisorState::Stopped.to_string(),
            });
        }

        info!(
            local_node = %self.config.local_node,
            local_id = %self.local_id,
            checkpoint_override = ?checkpoint,
            "Starting replication supervisor"
        );

        self.stop_flush_task().await;
        self.stop_all(true).await;

        let masters = self.store.load_all().await?;
        let mut loaded = HashSet::new();
        for master in masters {
            let Some((name, node)) = self.name_for(&master.source_id) else {
                warn!(
                    source_id = %master.source_id,
                    "Stored config names a node missing from the topology, skipping"
                );
                continue;
            };
            if name == &self.config.local_node {
                warn!(source_id = %master.source_id, "Stored config names the local node, skipping");
                continue;
            }
            loaded.insert(name.clone());

            let slot = self.slot_or_create(name, node).await;
            let mut entry = slot.lock().await;
            entry.flushed = master.checkpoint;
            entry.master = master;
        }

        self.sources
            .write()
            .await
            .retain(|name, _| loaded.contains(name));

        for slot in self.all_slots().await {
            let mut guard = slot.lock().await;
            self.start_source(&mut guard, checkpoint).await;
        }

        *self.flush_task.lock().await = Some(self.spawn_flush_task());
        self.set_state(SupervisorState::Running);
        self.refresh_running_gauge().await;
        info!(sources = loaded.len(), "Replication supervisor running");
        Ok(())
    }

    async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == SupervisorState::Stopped {
            return;
        }

        info!("Shutting down replication supervisor");
        self.set_state(SupervisorState::ShuttingDown);

        self.stop_flush_task().await;
        self.stop_all(true).await;

        self.set_state(SupervisorState::Stopped);
        info!("Replication supervisor stopped");
    }

    async fn dump_config(&self) -> Result<BTreeMap<String, Vec<ReplicationRule>>> {
        let masters = self.store.load_all().await?;
        Ok(masters
            .into_iter()
            .map(|master| {
                let name = self
                    .name_for(&master.source_id)
                    .map(|(name, _)| name.clone())
                    .unwrap_or_else(|| master.source_id.to_string());
                (name, master.rules)
            })
            .collect())
    }

    async fn clear_config(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.ensure_accepting()?;

        self.stop_all(false).await;
        self.sources.write().await.clear();
        self.store.clear().await?;
        info!("All replication configuration cleared");
        Ok(())
    }
}

/// Validate `config`, apply its declared mappings and start replicating.
pub async fn bootstrap(
    config: ReplicationConfig,
    connector: Arc<dyn Connector>,
    store: Arc<dyn ConfigStore>,
) -> Result<ReplicationSupervisor> {
    config.validate()?;
    let declared = config.replication.clone();
    let supervisor = ReplicationSupervisor::new(config, connector, store)?;

    for rule in declared {
        supervisor
            .set_replication(&rule.source, rule.dst, rule.src, rule.ops)
            .await?;
    }

    supervisor.start(None).await?;
    Ok(supervisor)
}
