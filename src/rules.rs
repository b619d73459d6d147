// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication rules and per-source configuration.

use crate::checkpoint::Checkpoint;
use crate::entry::{Namespace, OpSet};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a node, as stamped into origin tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random UUID identity.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_bson(&self) -> bson::Bson {
        bson::Bson::String(self.0.clone())
    }

    /// Whether a tag value read from a document names this node.
    pub fn matches(&self, tag: &bson::Bson) -> bool {
        matches!(tag, bson::Bson::String(s) if s == &self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Forward `ops` on `src` (on the source node) to `dst` (on the local node).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationRule {
    pub src: Namespace,
    pub dst: Namespace,
    #[serde(default)]
    pub ops: OpSet,
}

impl ReplicationRule {
    pub fn new(src: Namespace, dst: Namespace, ops: OpSet) -> Self {
        Self { src, dst, ops }
    }

    /// Two rules with the same `(src, dst)` pair replace each other.
    pub fn same_route(&self, other: &ReplicationRule) -> bool {
        self.src == other.src && self.dst == other.dst
    }
}

impl fmt::Display for ReplicationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} [{}]", self.src, self.dst, self.ops)
    }
}

/// Selects rules to remove. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleFilter {
    pub src: Option<Namespace>,
    pub dst: Option<Namespace>,
}

impl RuleFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_all(&self) -> bool {
        self.src.is_none() && self.dst.is_none()
    }

    pub fn matches(&self, rule: &ReplicationRule) -> bool {
        self.src.as_ref().map_or(true, |s| s == &rule.src)
            && self.dst.as_ref().map_or(true, |d| d == &rule.dst)
    }
}

/// Everything stored about one source node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterConfig {
    pub source_id: NodeId,
    pub checkpoint: Option<Checkpoint>,
    pub rules: Vec<ReplicationRule>,
}

impl MasterConfig {
    pub fn new(source_id: NodeId) -> Self {
        Self {
            source_id,
            checkpoint: None,
            rules: Vec::new(),
        }
    }

    /// Insert or replace the rule for `rule`'s route.
    ///
    /// Returns the rule it replaced, if any. A replaced rule keeps its slot.
    pub fn upsert_rule(&mut self, rule: ReplicationRule) -> Option<ReplicationRule> {
        match self.rules.iter_mut().find(|r| r.same_route(&rule)) {
            Some(existing) => Some(std::mem::replace(existing, rule)),
            None => {
                self.rules.push(rule);
                None
            }
        }
    }

    /// Remove the rules matching `filter`, returning them.
    pub fn pull_rules(&mut self, filter: &RuleFilter) -> Vec<ReplicationRule> {
        let (removed, kept) = std::mem::take(&mut self.rules)
            .into_iter()
            .partition(|r| filter.matches(r));
        self.rules = kept;
        removed
    }
}
