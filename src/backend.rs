// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backend traits.
//!
//! The engine never talks to a database directly. It reads oplogs through
//! [`OplogSource`], writes through [`Destination`], and opens both through a
//! [`Connector`]. Two implementations ship with the crate:
//!
//! - [`crate::mongo`]: the `mongodb` driver against real replica-set members
//! - [`crate::memory`]: an in-process node used by the test suites
//!
//! # Example
//!
//! ```rust,no_run
//! use multimaster::backend::{BoxFuture, OplogSource, ReadResult};
//! use multimaster::Checkpoint;
//!
//! struct EmptyLog;
//!
//! impl OplogSource for EmptyLog {
//!     fn read_after(&self, _after: Checkpoint, _limit: usize) -> BoxFuture<'_, ReadResult> {
//!         Box::pin(async move {
//!             Ok(ReadResult::Batch {
//!                 entries: vec![],
//!                 scanned_through: None,
//!                 unparsed: None,
//!             })
//!         })
//!     }
//!
//!     fn head(&self) -> BoxFuture<'_, Option<Checkpoint>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//! }
//! ```

use crate::checkpoint::Checkpoint;
use crate::config::NodeConfig;
use crate::entry::{LogEntry, Namespace, UnparsedEntry};
use crate::error::Result;
use bson::Document;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for boxed async futures (keeps trait signatures readable).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Outcome of one oplog query.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadResult {
    /// Entries strictly after the requested position, in log order.
    Batch {
        entries: Vec<LogEntry>,
        /// Last position the source examined, including entries that were
        /// not surfaced (no-ops, commands). `None` if nothing was scanned.
        scanned_through: Option<Checkpoint>,
        /// An insert, update or delete that failed to parse. The batch ends
        /// in front of it, so it sits right after `scanned_through`.
        unparsed: Option<UnparsedEntry>,
    },
    /// The requested position is older than the oldest retained entry.
    HistoryLost {
        requested: Checkpoint,
        oldest: Checkpoint,
    },
}

/// A node's operation log.
pub trait OplogSource: Send + Sync + 'static {
    /// Up to `limit` entries with position strictly greater than `after`.
    fn read_after(&self, after: Checkpoint, limit: usize) -> BoxFuture<'_, ReadResult>;

    /// Position of the newest entry, if the log is non-empty.
    fn head(&self) -> BoxFuture<'_, Option<Checkpoint>>;
}

/// Failure of a single destination write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// A unique index (usually `_id`) rejected the write.
    DuplicateKey,
    /// Anything else.
    Failed(String),
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteError::DuplicateKey => write!(f, "duplicate key"),
            WriteError::Failed(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for WriteError {}

/// Boxed future for destination writes.
pub type WriteFuture<'a, T> =
    Pin<Box<dyn Future<Output = std::result::Result<T, WriteError>> + Send + 'a>>;

/// A collection on the local node that replicated writes land in.
pub trait Destination: Send + Sync + 'static {
    fn namespace(&self) -> &Namespace;

    fn insert(&self, document: Document) -> WriteFuture<'_, ()>;

    /// Update the first document matching `filter`.
    ///
    /// `update` is either a modifier document (`$set`, ...) or a replacement.
    fn update(&self, filter: Document, update: Document, upsert: bool) -> WriteFuture<'_, ()>;

    /// Delete every document matching `filter`. Returns the number removed.
    fn delete(&self, filter: Document) -> WriteFuture<'_, u64>;
}

/// Opens oplogs on remote nodes and collections on the local node.
pub trait Connector: Send + Sync + 'static {
    /// Open the oplog of the topology node `name`.
    fn open_oplog<'a>(
        &'a self,
        name: &'a str,
        node: &'a NodeConfig,
    ) -> BoxFuture<'a, Arc<dyn OplogSource>>;

    /// Open a collection on the local node.
    fn open_collection<'a>(&'a self, namespace: &'a Namespace)
        -> BoxFuture<'a, Arc<dyn Destination>>;
}
