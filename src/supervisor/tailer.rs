// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The per-source task body.
//!
//! Wraps [`ChangeFeedReader::run`] with state transitions, a tracing span and
//! failure reporting. The source stays `Starting` until its start position is
//! resolved. The supervisor keeps the reader's checkpoint receiver, so the
//! final position survives the task.

use super::types::{SourceFailure, SourceState};
use crate::metrics;
use crate::reader::ChangeFeedReader;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, info_span, Instrument};

/// Run one source until shutdown or a fatal error.
pub(super) async fn run_source(
    mut reader: ChangeFeedReader,
    mut shutdown_rx: watch::Receiver<bool>,
    state: Arc<watch::Sender<SourceState>>,
    failures: mpsc::UnboundedSender<SourceFailure>,
) {
    let source = reader.source_name().to_string();
    let span = info_span!("source", source = %source);

    async move {
        let outcome = match reader.wait_for_start(&mut shutdown_rx).await {
            Ok(Some(start)) => {
                state.send_replace(SourceState::Running);
                metrics::set_source_state(&source, "Running");
                info!(checkpoint = %start, "Source task started");
                reader.run(shutdown_rx).await
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                state.send_replace(SourceState::Stopped);
                metrics::set_source_state(&source, "Stopped");
                info!(checkpoint = %reader.checkpoint(), "Source task stopped");
            }
            Err(e) => {
                error!(error = %e, checkpoint = %reader.checkpoint(), "Source task failed");
                state.send_replace(SourceState::Failed);
                metrics::set_source_state(&source, "Failed");
                let failure = SourceFailure { source, error: e };
                metrics::record_source_failure(&failure.source, failure.error_type());
                // The receiver may have been dropped.
                let _ = failures.send(failure);
            }
        }
    }
    .instrument(span)
    .await
}
