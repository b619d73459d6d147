//! Recording [`Handler`] for reader-level tests.
//!
//! Records every entry it is handed, in call order, and can be told to fail
//! from a point on to exercise the fatal-handler path.

use multimaster::backend::BoxFuture;
use multimaster::{ApplyOutcome, Checkpoint, Handler, LogEntry, Namespace, OpKind, ReplicationError};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// A handler that records calls for later assertions.
///
/// # Example
/// ```rust,ignore
/// let recorder = Arc::new(RecordingHandler::new());
/// reader.register(ns("db.foo"), OpSet::ALL, recorder.clone()).await;
///
/// // Run the reader...
///
/// assert_eq!(recorder.positions().await.len(), 3);
/// ```
#[derive(Default)]
pub struct RecordingHandler {
    entries: RwLock<Vec<LogEntry>>,
    fail: AtomicBool,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail.
    pub fn fail_from_now(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub async fn entries(&self) -> Vec<LogEntry> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn positions(&self) -> Vec<Checkpoint> {
        self.entries.read().await.iter().map(|e| e.position).collect()
    }

    /// Whether every recorded entry matches `namespace` and one of `ops`.
    pub async fn all_match(&self, namespace: &Namespace, ops: &[OpKind]) -> bool {
        self.entries
            .read()
            .await
            .iter()
            .all(|e| &e.namespace == namespace && ops.contains(&e.op))
    }
}

impl Handler for RecordingHandler {
    fn apply<'a>(&'a self, entry: &'a LogEntry) -> BoxFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ReplicationError::Destination {
                    namespace: entry.namespace.to_string(),
                    message: "recording handler told to fail".to_string(),
                });
            }
            self.entries.write().await.push(entry.clone());
            Ok(ApplyOutcome::Applied)
        })
    }
}
