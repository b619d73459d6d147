// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed config store.
//!
//! Two tables:
//!
//! ```text
//! masters(source_id PK, checkpoint_ts, checkpoint_ord, updated_at)
//! rules(source_id, src, dst, ops, seq, PK(source_id, src, dst))
//! ```
//!
//! `seq` keeps rules in the order they were first added; replacing a rule's
//! operation set keeps its slot.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Every statement (or transaction) is retried with exponential
//! backoff, up to 5 attempts.

use crate::backend::BoxFuture;
use crate::checkpoint::Checkpoint;
use crate::config::StoreConfig;
use crate::entry::{Namespace, OpSet};
use crate::error::{ReplicationError, Result};
use crate::rules::{MasterConfig, NodeId, ReplicationRule, RuleFilter};
use crate::store::ConfigStore;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Config store backed by a local SQLite database.
pub struct SqliteConfigStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteConfigStore {
    /// Open (creating if needed) the database described by `config`.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        info!(path = %config.sqlite_path, "Initializing config store");

        let pool = if config.is_in_memory() {
            // One connection that never recycles: each in-memory connection
            // would otherwise see its own empty database.
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?;
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            let mut options =
                SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", config.sqlite_path))
                    .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
                    .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                    .create_if_missing(true);
            if config.wal_mode {
                options = options.journal_mode(SqliteJournalMode::Wal);
            }
            SqlitePoolOptions::new()
                .max_connections(2) // Low concurrency needed
                .connect_with(options)
                .await?
        };

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS masters (
                source_id TEXT PRIMARY KEY,
                checkpoint_ts INTEGER,
                checkpoint_ord INTEGER,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rules (
                source_id TEXT NOT NULL,
                src TEXT NOT NULL,
                dst TEXT NOT NULL,
                ops TEXT NOT NULL,
                seq INTEGER NOT NULL,
                PRIMARY KEY (source_id, src, dst)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            path: config.sqlite_path.clone(),
        })
    }

    /// Open a file-backed store at `path` with WAL enabled.
    pub async fn new(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::open(&StoreConfig {
            sqlite_path: path.as_ref().to_string_lossy().to_string(),
            wal_mode: true,
        })
        .await
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        let pool = &self.pool;
        if let Err(e) = execute_with_retry("wal_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await
        {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Config store closed");
    }

    async fn load_all_inner(&self) -> Result<Vec<MasterConfig>> {
        let pool = &self.pool;

        let masters: Vec<(String, Option<i64>, Option<i64>)> =
            execute_with_retry("load_masters", || async {
                sqlx::query_as(
                    "SELECT source_id, checkpoint_ts, checkpoint_ord FROM masters ORDER BY source_id",
                )
                .fetch_all(pool)
                .await
            })
            .await?;

        let rules: Vec<(String, String, String, String)> =
            execute_with_retry("load_rules", || async {
                sqlx::query_as("SELECT source_id, src, dst, ops FROM rules ORDER BY source_id, seq")
                    .fetch_all(pool)
                    .await
            })
            .await?;

        let mut configs: BTreeMap<String, MasterConfig> = BTreeMap::new();
        for (source_id, ts, ord) in masters {
            let mut config = MasterConfig::new(NodeId::new(source_id.clone()));
            if let (Some(ts), Some(ord)) = (ts, ord) {
                config.checkpoint = Some(Checkpoint::new(ts as u64, ord as u32));
            }
            configs.insert(source_id, config);
        }

        for (source_id, src, dst, ops) in rules {
            let rule = ReplicationRule::new(
                Namespace::parse(&src)?,
                Namespace::parse(&dst)?,
                OpSet::parse(&ops)?,
            );
            match configs.get_mut(&source_id) {
                Some(config) => config.rules.push(rule),
                None => warn!(source_id = %source_id, rule = %rule, "Ignoring rule without master row"),
            }
        }

        debug!(count = configs.len(), "Loaded master configs");
        Ok(configs.into_values().collect())
    }

    async fn upsert_rule_inner(&self, source_id: &NodeId, rule: &ReplicationRule) -> Result<()> {
        let pool = &self.pool;
        let id = source_id.as_str();
        let src = rule.src.to_string();
        let dst = rule.dst.to_string();
        let ops = rule.ops.to_string();
        let now = chrono::Utc::now().timestamp_millis();

        execute_with_retry("upsert_rule", || async {
            let mut tx = pool.begin().await?;
            sqlx::query(
                r#"
                INSERT INTO masters (source_id, checkpoint_ts, checkpoint_ord, updated_at)
                VALUES (?, NULL, NULL, ?)
                ON CONFLICT(source_id) DO UPDATE SET updated_at = excluded.updated_at
                "#,
            )
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO rules (source_id, src, dst, ops, seq)
                VALUES (?, ?, ?, ?,
                        (SELECT COALESCE(MAX(seq), 0) + 1 FROM rules WHERE source_id = ?))
                ON CONFLICT(source_id, src, dst) DO UPDATE SET ops = excluded.ops
                "#,
            )
            .bind(id)
            .bind(&src)
            .bind(&dst)
            .bind(&ops)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await
        })
        .await?;

        debug!(source_id = %source_id, rule = %rule, "Stored rule");
        Ok(())
    }

    async fn pull_rules_inner(&self, source_id: &NodeId, filter: &RuleFilter) -> Result<usize> {
        let pool = &self.pool;
        let id = source_id.as_str();
        let src = filter.src.as_ref().map(|s| s.to_string());
        let dst = filter.dst.as_ref().map(|d| d.to_string());

        let remaining: i64 = execute_with_retry("pull_rules", || async {
            let mut tx = pool.begin().await?;
            sqlx::query(
                r#"
                DELETE FROM rules
                WHERE source_id = ?
                  AND (? IS NULL OR src = ?)
                  AND (? IS NULL OR dst = ?)
                "#,
            )
            .bind(id)
            .bind(&src)
            .bind(&src)
            .bind(&dst)
            .bind(&dst)
            .execute(&mut *tx)
            .await?;

            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM rules WHERE source_id = ?")
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(count)
        })
        .await?;

        Ok(remaining as usize)
    }

    async fn remove_inner(&self, source_id: &NodeId) -> Result<()> {
        let pool = &self.pool;
        let id = source_id.as_str();

        execute_with_retry("remove_master", || async {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM rules WHERE source_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM masters WHERE source_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await
        })
        .await?;

        info!(source_id = %source_id, "Deleted master config");
        Ok(())
    }

    async fn set_checkpoint_inner(&self, source_id: &NodeId, checkpoint: Checkpoint) -> Result<()> {
        let pool = &self.pool;
        let id = source_id.as_str();
        let ts = checkpoint.timestamp as i64;
        let ord = i64::from(checkpoint.ordinal);
        let now = chrono::Utc::now().timestamp_millis();

        execute_with_retry("set_checkpoint", || async {
            sqlx::query(
                r#"
                UPDATE masters
                SET checkpoint_ts = ?, checkpoint_ord = ?, updated_at = ?
                WHERE source_id = ?
                "#,
            )
            .bind(ts)
            .bind(ord)
            .bind(now)
            .bind(id)
            .execute(pool)
            .await
        })
        .await?;

        debug!(source_id = %source_id, checkpoint = %checkpoint, "Checkpoint persisted");
        Ok(())
    }

    async fn clear_inner(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("clear", || async {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM rules").execute(&mut *tx).await?;
            sqlx::query("DELETE FROM masters").execute(&mut *tx).await?;
            tx.commit().await
        })
        .await?;
        info!("Cleared all master configs");
        Ok(())
    }
}

impl ConfigStore for SqliteConfigStore {
    fn load_all(&self) -> BoxFuture<'_, Vec<MasterConfig>> {
        Box::pin(self.load_all_inner())
    }

    fn upsert_rule<'a>(
        &'a self,
        source_id: &'a NodeId,
        rule: &'a ReplicationRule,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.upsert_rule_inner(source_id, rule))
    }

    fn pull_rules<'a>(
        &'a self,
        source_id: &'a NodeId,
        filter: &'a RuleFilter,
    ) -> BoxFuture<'a, usize> {
        Box::pin(self.pull_rules_inner(source_id, filter))
    }

    fn remove<'a>(&'a self, source_id: &'a NodeId) -> BoxFuture<'a, ()> {
        Box::pin(self.remove_inner(source_id))
    }

    fn set_checkpoint<'a>(
        &'a self,
        source_id: &'a NodeId,
        checkpoint: Checkpoint,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.set_checkpoint_inner(source_id, checkpoint))
    }

    fn clear(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.clear_inner())
    }
}
