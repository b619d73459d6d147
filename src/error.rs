// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are categorized by their source (MongoDB, SQLite, configuration,
//! destination writes) and carry enough context to tell which source or
//! namespace failed.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Mongo` | Yes, except auth | Network errors, timeouts, server selection failures |
//! | `ConfigStore` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `UnknownSource` | No | Rule names a node missing from the topology |
//! | `HistoryLost` | No | Checkpoint aged out of the source's oplog |
//! | `Destination` | No | A replicated write failed for a reason other than duplicate key |
//! | `EntryParse` | No | Malformed oplog entry |
//! | `InvalidState` | No | Supervisor state machine violation |
//! | `Shutdown` | No | Supervisor is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! The tailing loop uses [`ReplicationError::is_retryable()`] to decide
//! between "back off and poll again" and "stop this source". Everything that
//! is not retryable ends the source's task and is reported to the
//! supervisor's failure channel.

use crate::checkpoint::Checkpoint;
use mongodb::error::ErrorKind;
use thiserror::Error;

/// Server error codes for `Unauthorized` and `AuthenticationFailed`.
const AUTH_ERROR_CODES: [i32; 2] = [13, 18];

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// MongoDB driver or server error.
    ///
    /// Occurs when querying a source oplog or talking to a config store
    /// collection. Treated as transient: the tailing loop retries after its
    /// idle interval. Authentication failures are the exception.
    #[error("MongoDB error ({operation}): {message}")]
    Mongo {
        operation: String,
        message: String,
        #[source]
        source: Option<mongodb::error::Error>,
    },

    /// SQLite error in the config store.
    #[error("Config store error: {0}")]
    ConfigStore(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    ///
    /// Reported at the call that introduced it (`set_replication`,
    /// `validate`), never deferred to runtime.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rule or request referenced a node that is not in the topology.
    #[error("Unknown source node: {0}")]
    UnknownSource(String),

    /// The requested checkpoint is older than the oldest entry the source
    /// still retains, so entries in between are gone.
    #[error("Oplog history lost for {source_name}: requested {requested}, oldest retained {oldest}")]
    HistoryLost {
        source_name: String,
        requested: Checkpoint,
        oldest: Checkpoint,
    },

    /// A replicated write failed on the destination.
    #[error("Destination write error ({namespace}): {message}")]
    Destination { namespace: String, message: String },

    /// An oplog entry had an unexpected shape.
    #[error("Oplog entry parse error: {0}")]
    EntryParse(String),

    /// Supervisor state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a MongoDB error from a driver error.
    pub fn mongo(operation: impl Into<String>, source: mongodb::error::Error) -> Self {
        Self::Mongo {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a MongoDB error without a driver source.
    pub fn mongo_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Mongo {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Mongo { source: Some(e), .. } => !is_auth_failure(e),
            Self::Mongo { source: None, .. } => true,
            Self::ConfigStore(_) => false,
            Self::Config(_) => false,
            Self::UnknownSource(_) => false,
            Self::HistoryLost { .. } => false,
            Self::Destination { .. } => false,
            Self::EntryParse(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

/// Whether a driver error means the credentials were rejected.
fn is_auth_failure(e: &mongodb::error::Error) -> bool {
    match e.kind.as_ref() {
        ErrorKind::Authentication { .. } => true,
        ErrorKind::Command(ce) => is_auth_code(ce.code),
        _ => false,
    }
}

fn is_auth_code(code: i32) -> bool {
    AUTH_ERROR_CODES.contains(&code)
}

impl From<mongodb::error::Error> for ReplicationError {
    fn from(e: mongodb::error::Error) -> Self {
        Self::mongo("unknown", e)
    }
}

impl From<bson::de::Error> for ReplicationError {
    fn from(e: bson::de::Error) -> Self {
        Self::EntryParse(e.to_string())
    }
}

impl From<bson::ser::Error> for ReplicationError {
    fn from(e: bson::ser::Error) -> Self {
        Self::Internal(format!("bson serialization: {}", e))
    }
}
