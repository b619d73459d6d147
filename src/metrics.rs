// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Oplog tailing (entries read, dispatched, poll latency)
//! - Replicated writes by outcome
//! - Checkpoint flushes and lag
//! - Source and supervisor state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `mmm_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! The crate only records through the `metrics` facade. Installing an
//! exporter is up to the embedding process.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Reader
// =============================================================================

/// Record one oplog query: how many entries it surfaced and how long it took.
pub fn record_oplog_read(source: &str, entries: usize, duration: Duration) {
    counter!("mmm_entries_read_total", "source" => source.to_string()).increment(entries as u64);
    histogram!("mmm_read_duration_seconds", "source" => source.to_string())
        .record(duration.as_secs_f64());
    histogram!("mmm_read_batch_size", "source" => source.to_string()).record(entries as f64);
}

/// Record an entry handed to at least one handler.
pub fn record_entry_dispatched(source: &str, op: &str) {
    counter!(
        "mmm_entries_dispatched_total",
        "source" => source.to_string(),
        "op" => op.to_string()
    )
    .increment(1);
}

/// Record a poll that returned nothing.
pub fn record_idle_poll(source: &str) {
    counter!("mmm_idle_polls_total", "source" => source.to_string()).increment(1);
}

/// Record a failed oplog query.
pub fn record_read_error(source: &str, retryable: bool) {
    let kind = if retryable { "transient" } else { "fatal" };
    counter!("mmm_read_errors_total", "source" => source.to_string(), "kind" => kind).increment(1);
}

/// Record an oplog entry that could not be parsed and was skipped.
pub fn record_entry_skipped(source: &str, reason: &str) {
    counter!(
        "mmm_entries_skipped_total",
        "source" => source.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a checkpoint that fell out of the source's retained history.
pub fn record_history_lost(source: &str) {
    counter!("mmm_history_lost_total", "source" => source.to_string()).increment(1);
}

// =============================================================================
// Replicator
// =============================================================================

/// Record the outcome of one replicated write.
///
/// `outcome` is one of `applied`, `skipped_loop`, `duplicate`, `failed`.
pub fn record_apply(destination: &str, op: &str, outcome: &str) {
    counter!(
        "mmm_apply_total",
        "destination" => destination.to_string(),
        "op" => op.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record destination write latency.
pub fn record_apply_latency(destination: &str, duration: Duration) {
    histogram!("mmm_apply_duration_seconds", "destination" => destination.to_string())
        .record(duration.as_secs_f64());
}

// =============================================================================
// Checkpoints and store
// =============================================================================

/// Record a flush pass over in-memory checkpoints.
pub fn record_checkpoint_flush(flushed: usize, errors: usize) {
    counter!("mmm_checkpoint_flushes_total").increment(1);
    counter!("mmm_checkpoint_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("mmm_checkpoint_flush_errors_total").increment(errors as u64);
    }
}

/// Record how far (in seconds) a source's checkpoint trails its oplog head.
pub fn record_checkpoint_lag(source: &str, lag_secs: u64) {
    gauge!("mmm_checkpoint_lag_seconds", "source" => source.to_string()).set(lag_secs as f64);
}

/// Record config store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn store_retries_total(operation: &str) {
    counter!("mmm_store_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Supervisor
// =============================================================================

/// Gauge for a source task's state.
pub fn set_source_state(source: &str, state: &str) {
    let value = match state {
        "Stopped" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "Failed" => 3.0,
        _ => -1.0,
    };
    gauge!("mmm_source_state", "source" => source.to_string()).set(value);
}

/// Gauge for supervisor state.
pub fn set_supervisor_state(state: &str) {
    // Encode state as numeric for alerting
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("mmm_supervisor_state").set(value);
}

/// Gauge for the number of running source tasks.
pub fn set_running_sources(count: usize) {
    gauge!("mmm_running_sources").set(count as f64);
}

/// Record a source task that stopped on a fatal error.
pub fn record_source_failure(source: &str, error_type: &str) {
    counter!(
        "mmm_source_failures_total",
        "source" => source.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a rule added or removed.
pub fn record_rule_change(source: &str, action: &str) {
    counter!(
        "mmm_rule_changes_total",
        "source" => source.to_string(),
        "action" => action.to_string()
    )
    .increment(1);
}
