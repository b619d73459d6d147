// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Multimaster
//!
//! Multimaster replication between MongoDB replica sets by tailing each
//! source node's oplog and re-applying its writes on the local node.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                       ReplicationSupervisor (node A)                     │
//! │                                                                          │
//! │  ┌───────────────┐    ┌──────────────────┐    ┌───────────────────────┐  │
//! │  │ OplogSource   │───►│ ChangeFeedReader │───►│ Replicator (per rule) │──┼──► A's collections
//! │  │ (node B)      │    │ (dispatch table) │    │ origin tag + loop chk │  │
//! │  └───────────────┘    └──────────────────┘    └───────────────────────┘  │
//! │                               │ checkpoint                               │
//! │                               ▼                                          │
//! │                        ┌─────────────┐                                   │
//! │                        │ ConfigStore │  rules + checkpoints per source   │
//! │                        │ (SQLite)    │                                   │
//! │                        └─────────────┘                                   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each node runs its own supervisor and pulls from the nodes it replicates.
//! Writes are tagged with the node they came from (`__mmm` by default), so
//! in a cycle A → B → A a write is dropped when it arrives back at its origin.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use multimaster::{bootstrap, MongoConnector, ReplicationConfig, SqliteConfigStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> multimaster::Result<()> {
//!     let raw = std::fs::read_to_string("mmm.json").expect("config file");
//!     let config = ReplicationConfig::from_json(&raw)?;
//!
//!     let connector = MongoConnector::new(&config.local()?.uri).await?;
//!     let store = SqliteConfigStore::open(&config.store).await?;
//!
//!     let supervisor = bootstrap(config, Arc::new(connector), Arc::new(store)).await?;
//!     tokio::signal::ctrl_c().await.ok();
//!     supervisor.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod document;
pub mod entry;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod mongo;
pub mod reader;
pub mod replicator;
pub mod rules;
pub mod store;
pub mod supervisor;

// Re-exports for convenience
pub use backend::{Connector, Destination, OplogSource, ReadResult, WriteError};
pub use checkpoint::Checkpoint;
pub use config::{NodeConfig, ReplicationConfig, ReplicationSettings, RuleConfig};
pub use document::DocumentExt;
pub use entry::{LogEntry, Namespace, OpKind, OpSet, UnparsedEntry};
pub use error::{ReplicationError, Result};
pub use memory::{MemoryCluster, MemoryConnector, MemoryNode};
pub use mongo::{MongoCollection, MongoConnector, MongoOplog};
pub use reader::{ApplyOutcome, ChangeFeedReader, Handler, HandlerId, HandlerRegistry};
pub use replicator::{OriginTag, Replicator};
pub use rules::{MasterConfig, NodeId, ReplicationRule, RuleFilter};
pub use store::{ConfigStore, MongoConfigStore, SqliteConfigStore};
pub use supervisor::{
    bootstrap, ReplicationSupervisor, SourceFailure, SourceState, SupervisorState,
};
