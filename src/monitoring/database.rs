use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use crate::core::{MonitorError, MonitorResult};
use crate::listing::{ChangeKind, Listing};

/// SQLite caps bound parameters per statement; stay well below it.
const LOOKUP_CHUNK: usize = 500;

const HISTORY_COLUMNS: &str =
    "identity_key, content_hash, first_seen_at, last_seen_at, notified, updated, payload";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct HistoryRecord {
    pub identity_key: String,
    pub content_hash: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub notified: bool,
    /// The stored version replaced an earlier one.
    pub updated: bool,
    pub payload: String, // last-seen Listing as JSON
}

impl HistoryRecord {
    /// Record for a listing observed now.
    ///
    /// `first_seen_at` is carried over from `previous`. `notified` survives
    /// only when the content hash is unchanged; otherwise it becomes
    /// `notified_if_changed`. `updated` is set once a known listing changes
    /// and stays with that version.
    pub fn observe(
        listing: &Listing,
        previous: Option<&HistoryRecord>,
        seen_at: DateTime<Utc>,
        notified_if_changed: bool,
    ) -> MonitorResult<Self> {
        let (first_seen_at, notified, updated) = match previous {
            Some(prev) if prev.content_hash == listing.content_hash => {
                (prev.first_seen_at, prev.notified, prev.updated)
            }
            Some(prev) => (prev.first_seen_at, notified_if_changed, true),
            None => (seen_at, notified_if_changed, false),
        };

        Ok(Self {
            identity_key: listing.identity_key.clone(),
            content_hash: listing.content_hash.clone(),
            first_seen_at,
            last_seen_at: seen_at,
            notified,
            updated,
            payload: serde_json::to_string(listing)?,
        })
    }

    /// How a still-undelivered record should be announced.
    pub fn pending_kind(&self) -> ChangeKind {
        if self.updated {
            ChangeKind::Updated
        } else {
            ChangeKind::New
        }
    }

    pub fn listing(&self) -> MonitorResult<Listing> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// One row of the `cycle_stats` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CycleStats {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: String,
    pub total_found: i64,
    pub new_found: i64,
    pub updated_found: i64,
    pub unchanged_found: i64,
    pub notified: i64,
    pub delivery_errors: i64,
    pub failed_pages: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStatistics {
    pub tracked_listings: usize,
    pub pending_notifications: usize,
    pub total_cycles: usize,
    pub failed_cycles: usize,
    pub total_new_found: usize,
    pub total_notified: usize,
    pub total_delivery_errors: usize,
}

/// Durable listing history. The batch upsert is the only multi-row write
/// and runs as one transaction.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn get(&self, identity_key: &str) -> MonitorResult<Option<HistoryRecord>>;

    async fn get_many(&self, identity_keys: &[String]) -> MonitorResult<HashMap<String, HistoryRecord>>;

    /// All-or-nothing: either every record is written or none is.
    async fn upsert_batch(&self, records: &[HistoryRecord]) -> MonitorResult<()>;

    /// Returns false (not an error) when the stored hash has moved on.
    async fn mark_notified(&self, identity_key: &str, content_hash: &str) -> MonitorResult<bool>;

    /// Undelivered records, oldest first. `None` returns all of them.
    async fn pending_notifications(&self, limit: Option<usize>) -> MonitorResult<Vec<HistoryRecord>>;

    async fn count(&self) -> MonitorResult<u64>;

    async fn record_cycle(&self, stats: &CycleStats) -> MonitorResult<()>;
}

pub struct HistoryDatabase {
    pool: SqlitePool,
}

impl HistoryDatabase {
    pub async fn new(database_path: &str) -> MonitorResult<Self> {
        if let Some(parent) = Path::new(database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    MonitorError::Configuration(format!(
                        "cannot create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let connection_string = if database_path.starts_with("sqlite:") {
            database_path.to_string()
        } else {
            format!("sqlite://{}?mode=rwc", database_path)
        };

        let options = SqliteConnectOptions::from_str(&connection_string)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.initialize_schema().await?;

        Ok(db)
    }

    /// Private in-memory database; a single pinned connection keeps it alive.
    pub async fn in_memory() -> MonitorResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.initialize_schema().await?;

        Ok(db)
    }

    async fn initialize_schema(&self) -> MonitorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS listing_history (
                identity_key TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL,
                first_seen_at DATETIME NOT NULL,
                last_seen_at DATETIME NOT NULL,
                notified BOOLEAN NOT NULL DEFAULT 0,
                updated BOOLEAN NOT NULL DEFAULT 0,
                payload TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // databases created before the updated flag existed
        let columns: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM pragma_table_info('listing_history')")
                .fetch_all(&self.pool)
                .await?;
        if !columns.iter().any(|(name,)| name == "updated") {
            sqlx::query("ALTER TABLE listing_history ADD COLUMN updated BOOLEAN NOT NULL DEFAULT 0")
                .execute(&self.pool)
                .await?;
            tracing::info!("Added updated column to listing_history");
        }

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_listing_history_pending
            ON listing_history(notified, first_seen_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cycle_stats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id TEXT NOT NULL,
                started_at DATETIME NOT NULL,
                finished_at DATETIME NOT NULL,
                outcome TEXT NOT NULL,
                total_found INTEGER NOT NULL DEFAULT 0,
                new_found INTEGER NOT NULL DEFAULT 0,
                updated_found INTEGER NOT NULL DEFAULT 0,
                unchanged_found INTEGER NOT NULL DEFAULT 0,
                notified INTEGER NOT NULL DEFAULT 0,
                delivery_errors INTEGER NOT NULL DEFAULT 0,
                failed_pages INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("✅ Listing history schema initialized");

        Ok(())
    }

    pub async fn get_last_cycle(&self) -> MonitorResult<Option<CycleStats>> {
        let stats = sqlx::query_as::<_, CycleStats>(
            r#"
            SELECT cycle_id, started_at, finished_at, outcome, total_found, new_found,
                   updated_found, unchanged_found, notified, delivery_errors, failed_pages
            FROM cycle_stats ORDER BY id DESC LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(stats)
    }

    pub async fn get_statistics(&self) -> MonitorResult<HistoryStatistics> {
        #[derive(sqlx::FromRow)]
        struct Listings {
            total: i64,
            pending: i64,
        }

        #[derive(sqlx::FromRow)]
        struct Cycles {
            total: i64,
            failed: i64,
            new_found: i64,
            notified: i64,
            delivery_errors: i64,
        }

        let listings = sqlx::query_as::<_, Listings>(
            r#"
            SELECT
                COUNT(*) as total,
                COALESCE(SUM(CASE WHEN notified = 0 THEN 1 ELSE 0 END), 0) as pending
            FROM listing_history
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let cycles = sqlx::query_as::<_, Cycles>(
            r#"
            SELECT
                COUNT(*) as total,
                COALESCE(SUM(CASE WHEN outcome != 'success' AND outcome != 'degraded' THEN 1 ELSE 0 END), 0) as failed,
                COALESCE(SUM(new_found), 0) as new_found,
                COALESCE(SUM(notified), 0) as notified,
                COALESCE(SUM(delivery_errors), 0) as delivery_errors
            FROM cycle_stats
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(HistoryStatistics {
            tracked_listings: listings.total as usize,
            pending_notifications: listings.pending as usize,
            total_cycles: cycles.total as usize,
            failed_cycles: cycles.failed as usize,
            total_new_found: cycles.new_found as usize,
            total_notified: cycles.notified as usize,
            total_delivery_errors: cycles.delivery_errors as usize,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl HistoryStore for HistoryDatabase {
    async fn get(&self, identity_key: &str) -> MonitorResult<Option<HistoryRecord>> {
        let record = sqlx::query_as::<_, HistoryRecord>(&format!(
            "SELECT {} FROM listing_history WHERE identity_key = ?",
            HISTORY_COLUMNS
        ))
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_many(&self, identity_keys: &[String]) -> MonitorResult<HashMap<String, HistoryRecord>> {
        let mut records = HashMap::with_capacity(identity_keys.len());

        for chunk in identity_keys.chunks(LOOKUP_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {} FROM listing_history WHERE identity_key IN (",
                HISTORY_COLUMNS
            ));
            let mut separated = builder.separated(", ");
            for key in chunk {
                separated.push_bind(key);
            }
            separated.push_unseparated(")");

            let rows = builder
                .build_query_as::<HistoryRecord>()
                .fetch_all(&self.pool)
                .await?;

            for row in rows {
                records.insert(row.identity_key.clone(), row);
            }
        }

        Ok(records)
    }

    async fn upsert_batch(&self, records: &[HistoryRecord]) -> MonitorResult<()> {
        let mut tx = self.pool.begin().await?;

        for record in records {
            // notified survives only while the stored hash matches
            sqlx::query(
                r#"
                INSERT INTO listing_history (
                    identity_key, content_hash, first_seen_at, last_seen_at, notified, updated, payload
                )
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(identity_key) DO UPDATE SET
                    notified = CASE
                        WHEN listing_history.content_hash = excluded.content_hash
                        THEN listing_history.notified
                        ELSE excluded.notified
                    END,
                    updated = CASE
                        WHEN listing_history.content_hash = excluded.content_hash
                        THEN listing_history.updated
                        ELSE excluded.updated
                    END,
                    content_hash = excluded.content_hash,
                    last_seen_at = excluded.last_seen_at,
                    payload = excluded.payload
                "#,
            )
            .bind(&record.identity_key)
            .bind(&record.content_hash)
            .bind(record.first_seen_at)
            .bind(record.last_seen_at)
            .bind(record.notified)
            .bind(record.updated)
            .bind(&record.payload)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    async fn mark_notified(&self, identity_key: &str, content_hash: &str) -> MonitorResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE listing_history SET notified = 1
            WHERE identity_key = ? AND content_hash = ?
            "#,
        )
        .bind(identity_key)
        .bind(content_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn pending_notifications(&self, limit: Option<usize>) -> MonitorResult<Vec<HistoryRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM listing_history WHERE notified = 0 ORDER BY first_seen_at ASC",
            HISTORY_COLUMNS
        ));
        if let Some(limit) = limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let records = builder
            .build_query_as::<HistoryRecord>()
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn count(&self) -> MonitorResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM listing_history")
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }

    async fn record_cycle(&self, stats: &CycleStats) -> MonitorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cycle_stats (
                cycle_id, started_at, finished_at, outcome, total_found, new_found,
                updated_found, unchanged_found, notified, delivery_errors, failed_pages
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&stats.cycle_id)
        .bind(stats.started_at)
        .bind(stats.finished_at)
        .bind(&stats.outcome)
        .bind(stats.total_found)
        .bind(stats.new_found)
        .bind(stats.updated_found)
        .bind(stats.unchanged_found)
        .bind(stats.notified)
        .bind(stats.delivery_errors)
        .bind(stats.failed_pages)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
