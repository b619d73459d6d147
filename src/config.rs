// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replication engine.
//!
//! This module defines the configuration needed to run replication on one
//! node. Configuration is passed to [`bootstrap()`](crate::bootstrap) or to
//! [`ReplicationSupervisor::new()`](crate::ReplicationSupervisor::new) and
//! can be built programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use multimaster::config::{NodeConfig, ReplicationConfig};
//!
//! let mut config = ReplicationConfig::for_testing("a");
//! config.topology.insert("b".into(), NodeConfig::for_testing("b"));
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── local_node: String               # Topology name of this node
//! ├── topology: {name: NodeConfig}     # Every node: id + connection URI
//! ├── settings: ReplicationSettings
//! │   ├── reader: ReaderConfig         # Oplog polling
//! │   ├── checkpoint: CheckpointConfig # Periodic flush
//! │   ├── tag_field                    # Origin tag field name
//! │   └── stop_timeout                 # Grace period when stopping a source
//! ├── store: StoreConfig               # SQLite config store
//! └── replication: Vec<RuleConfig>     # Mappings applied at bootstrap
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! local_node: "london"
//!
//! topology:
//!   london:
//!     id: "6f1c2a5e-8d7b-4f1e-9a53-0c2d9e8b7a41"
//!     uri: "mongodb://london-1:27017/?replicaSet=rs0"
//!   leeds:
//!     id: "b0e7d3c4-1a2f-4c8e-b6d9-5e4f3a2b1c0d"
//!     uri: "mongodb://leeds-1:27017/?replicaSet=rs0"
//!
//! settings:
//!   reader:
//!     batch_size: 500
//!     idle_interval: "1s"
//!   checkpoint:
//!     flush_interval: "5s"
//!
//! replication:
//!   - source: "leeds"
//!     src: "db1.foo"
//!     dst: "db2.bar"
//!     ops: "iud"
//!
//! store:
//!   sqlite_path: "/var/lib/mmm/config.db"
//! ```

use crate::entry::{Namespace, OpSet};
use crate::error::{ReplicationError, Result};
use crate::rules::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Topology name of the node this process writes to.
    pub local_node: String,

    /// Every known node by name. Rules address sources by these names.
    pub topology: BTreeMap<String, NodeConfig>,

    #[serde(default)]
    pub settings: ReplicationSettings,

    /// Config store persistence settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Mappings applied by `bootstrap()` on top of what is already stored.
    #[serde(default)]
    pub replication: Vec<RuleConfig>,
}

impl ReplicationConfig {
    /// Create a minimal config for testing: a one-node topology whose id
    /// equals its name, fast timers and an in-memory store.
    pub fn for_testing(local_node: &str) -> Self {
        let mut topology = BTreeMap::new();
        topology.insert(local_node.to_string(), NodeConfig::for_testing(local_node));
        Self {
            local_node: local_node.to_string(),
            topology,
            settings: ReplicationSettings::for_testing(),
            store: StoreConfig::in_memory(),
            replication: Vec::new(),
        }
    }

    /// Parse a JSON config and validate it.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| ReplicationError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// The local node's entry in the topology.
    pub fn local(&self) -> Result<&NodeConfig> {
        self.topology.get(&self.local_node).ok_or_else(|| {
            ReplicationError::Config(format!(
                "local node '{}' is not in the topology",
                self.local_node
            ))
        })
    }

    /// Check the whole configuration, reporting the first inconsistency.
    pub fn validate(&self) -> Result<()> {
        self.local()?;

        let mut ids = HashSet::new();
        for (name, node) in &self.topology {
            if node.id.as_str().is_empty() {
                return Err(ReplicationError::Config(format!(
                    "node '{}' has an empty id",
                    name
                )));
            }
            if !ids.insert(node.id.clone()) {
                return Err(ReplicationError::Config(format!(
                    "node id '{}' is used by more than one node",
                    node.id
                )));
            }
        }

        self.settings.validate()?;

        for rule in &self.replication {
            if !self.topology.contains_key(&rule.source) {
                return Err(ReplicationError::UnknownSource(rule.source.clone()));
            }
            if rule.source == self.local_node {
                return Err(ReplicationError::Config(format!(
                    "rule {} -> {} replicates the local node into itself",
                    rule.src, rule.dst
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NodeConfig: one entry per topology node
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity and address of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stamped into origin tags. Stable across restarts.
    pub id: NodeId,

    /// Connection string, e.g. `"mongodb://host:27017/?replicaSet=rs0"`.
    pub uri: String,
}

impl NodeConfig {
    /// A node whose id is its name, with a placeholder URI.
    pub fn for_testing(name: &str) -> Self {
        Self {
            id: NodeId::new(name),
            uri: format!("memory://{}", name),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RuleConfig: declared mappings
// ═══════════════════════════════════════════════════════════════════════════════

/// A mapping declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Topology name of the source node.
    pub source: String,
    pub src: Namespace,
    pub dst: Namespace,
    #[serde(default)]
    pub ops: OpSet,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunable parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub reader: ReaderConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Field carrying the origin tag in replicated documents.
    #[serde(default = "default_tag_field")]
    pub tag_field: String,

    /// How long to wait for a source task to stop before aborting it.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: String,
}

fn default_tag_field() -> String {
    "__mmm".to_string()
}

fn default_stop_timeout() -> String {
    "10s".to_string()
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            reader: ReaderConfig::default(),
            checkpoint: CheckpointConfig::default(),
            tag_field: default_tag_field(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

impl ReplicationSettings {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            reader: ReaderConfig::for_testing(),
            checkpoint: CheckpointConfig {
                flush_interval: "50ms".to_string(),
            },
            tag_field: default_tag_field(),
            stop_timeout: "2s".to_string(),
        }
    }

    pub fn stop_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.stop_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn validate(&self) -> Result<()> {
        if self.reader.batch_size == 0 {
            return Err(ReplicationError::Config(
                "reader.batch_size must be greater than zero".to_string(),
            ));
        }
        parse_positive_duration("reader.idle_interval", &self.reader.idle_interval)?;
        parse_positive_duration("checkpoint.flush_interval", &self.checkpoint.flush_interval)?;
        parse_positive_duration("stop_timeout", &self.stop_timeout)?;

        if self.tag_field.is_empty()
            || self.tag_field.starts_with('$')
            || self.tag_field.contains('.')
        {
            return Err(ReplicationError::Config(format!(
                "tag_field '{}' must be a plain top-level field name",
                self.tag_field
            )));
        }
        Ok(())
    }
}

fn parse_positive_duration(field: &str, value: &str) -> Result<Duration> {
    let d = humantime::parse_duration(value).map_err(|e| {
        ReplicationError::Config(format!("{} '{}' is not a duration: {}", field, value, e))
    })?;
    if d.is_zero() {
        return Err(ReplicationError::Config(format!("{} must be non-zero", field)));
    }
    Ok(d)
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReaderConfig: oplog polling
// ═══════════════════════════════════════════════════════════════════════════════

/// Oplog polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Maximum entries fetched per query.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Sleep after an empty poll or a transient error, e.g. `"1s"`.
    #[serde(default = "default_idle_interval")]
    pub idle_interval: String,
}

fn default_batch_size() -> usize {
    500
}

fn default_idle_interval() -> String {
    "1s".to_string()
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            idle_interval: default_idle_interval(),
        }
    }
}

impl ReaderConfig {
    pub fn for_testing() -> Self {
        Self {
            batch_size: 100,
            idle_interval: "10ms".to_string(),
        }
    }

    /// Parse the idle_interval string to a Duration.
    pub fn idle_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.idle_interval).unwrap_or(Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Periodic checkpoint flush configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

fn default_flush_interval() -> String {
    "5s".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
        }
    }
}

impl CheckpointConfig {
    pub fn flush_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.flush_interval).unwrap_or(Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: SQLite config store
// ═══════════════════════════════════════════════════════════════════════════════

/// Config store persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database holding rules and checkpoints.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "mmm_config.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
