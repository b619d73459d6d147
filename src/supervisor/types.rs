// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Supervisor and source task states.
//!
//! # Supervisor
//!
//! ```text
//!            start()                 shutdown()
//! Created ───────────→ Running ───────────────→ ShuttingDown ──→ Stopped
//!    │                   ↑  │                                      │
//!    │                   └──┘ start() (restart)                    │
//!    └──────────────── shutdown() ────────────────────────────────→┘
//! ```
//!
//! # Source Task
//!
//! ```text
//! Stopped ──→ Starting ──→ Running ──→ Stopped   (stopped by the supervisor)
//!                 │            │
//!                 └────────────┴────→ Failed     (fatal source or handler error)
//! ```
//!
//! A failed source stays `Failed` until the next `start()` or rule change
//! restarts it. There is no automatic restart.

use crate::error::ReplicationError;

/// State of the [`ReplicationSupervisor`](super::ReplicationSupervisor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Built, not started. Rules can be added; no tasks run.
    Created,
    /// Source tasks and the flush task are running.
    Running,
    /// `shutdown()` in progress.
    ShuttingDown,
    /// All tasks stopped and checkpoints flushed. Final: `start()` is
    /// rejected from here.
    Stopped,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::Created => write!(f, "Created"),
            SupervisorState::Running => write!(f, "Running"),
            SupervisorState::ShuttingDown => write!(f, "ShuttingDown"),
            SupervisorState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// State of one source's reader task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Stopped,
    /// Oplog opened, start position being resolved.
    Starting,
    Running,
    /// Ended on a fatal error, reported through the failure channel.
    Failed,
}

impl std::fmt::Display for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceState::Stopped => write!(f, "Stopped"),
            SourceState::Starting => write!(f, "Starting"),
            SourceState::Running => write!(f, "Running"),
            SourceState::Failed => write!(f, "Failed"),
        }
    }
}

/// A source task that ended on a fatal error.
#[derive(Debug)]
pub struct SourceFailure {
    /// Topology name of the source.
    pub source: String,
    pub error: ReplicationError,
}

impl SourceFailure {
    /// Short label for metrics.
    pub fn error_type(&self) -> &'static str {
        match &self.error {
            ReplicationError::HistoryLost { .. } => "history_lost",
            ReplicationError::Destination { .. } => "destination",
            ReplicationError::Mongo { .. } => "mongo",
            ReplicationError::EntryParse(_) => "entry_parse",
            ReplicationError::UnknownSource(_) | ReplicationError::Config(_) => "config",
            _ => "other",
        }
    }
}
