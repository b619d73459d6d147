// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Oplog positions.
//!
//! A [`Checkpoint`] is a `(timestamp, ordinal)` pair, the same shape as a
//! MongoDB oplog `ts` (`Timestamp { time, increment }`). Ordering is
//! numeric on the timestamp first and the ordinal second, never textual.
//!
//! The textual form is `"<timestamp>:<ordinal>"`, e.g. `"1700000000:3"`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// A totally ordered position in a source's operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Seconds since the Unix epoch (oplog `ts.t`).
    pub timestamp: u64,
    /// Discriminator among entries sharing a timestamp (oplog `ts.i`).
    pub ordinal: u32,
}

impl Checkpoint {
    /// The position before every entry.
    pub const ZERO: Checkpoint = Checkpoint {
        timestamp: 0,
        ordinal: 0,
    };

    pub const fn new(timestamp: u64, ordinal: u32) -> Self {
        Self { timestamp, ordinal }
    }

    /// The position representing the current wall-clock second.
    ///
    /// Every entry appended after this second compares greater.
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::new(secs, 0)
    }

    /// Seconds between this position and a later one (0 if `later` is not later).
    pub fn lag_secs(&self, later: &Checkpoint) -> u64 {
        later.timestamp.saturating_sub(self.timestamp)
    }

    /// Convert to a BSON timestamp.
    ///
    /// BSON timestamps carry 32-bit seconds; larger values saturate.
    pub fn to_bson_timestamp(self) -> bson::Timestamp {
        bson::Timestamp {
            time: u32::try_from(self.timestamp).unwrap_or(u32::MAX),
            increment: self.ordinal,
        }
    }
}

impl From<bson::Timestamp> for Checkpoint {
    fn from(ts: bson::Timestamp) -> Self {
        Self::new(u64::from(ts.time), ts.increment)
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.timestamp, self.ordinal)
    }
}

/// Error returned when parsing a checkpoint string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCheckpointError(String);

impl fmt::Display for ParseCheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid checkpoint '{}': expected <timestamp>:<ordinal>", self.0)
    }
}

impl std::error::Error for ParseCheckpointError {}

impl FromStr for Checkpoint {
    type Err = ParseCheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseCheckpointError(s.to_string());
        let (ts, ord) = s.trim().split_once(':').ok_or_else(err)?;
        let timestamp = ts.parse().map_err(|_| err())?;
        let ordinal = ord.parse().map_err(|_| err())?;
        Ok(Self::new(timestamp, ordinal))
    }
}
