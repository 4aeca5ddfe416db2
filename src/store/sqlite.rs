//! SQLite-backed counters and history, shared by every process on the host.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, ErrorCode, OptionalExtension};

use crate::store::{schema, CounterStore, HistoryStore, RateSample, StoreError, WindowState};
use crate::window::{Clock, SystemClock};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a migrated connection pool.
pub fn open_pool(path: &Path, busy_timeout_ms: u64) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(move |c| {
        c.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;
             PRAGMA busy_timeout = {busy_timeout_ms};"
        ))
    });

    let pool = R2D2Pool::builder()
        .connection_timeout(std::time::Duration::from_millis(busy_timeout_ms.max(250)))
        .build(manager)
        .with_context(|| format!("failed to open database {}", path.display()))?;

    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::CannotOpen
                        | ErrorCode::SystemIoFailure
                ) =>
            {
                StoreError::Transport(e.to_string())
            }
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::Transport(e.to_string())
    }
}

fn to_count(raw: i64) -> Result<u64, StoreError> {
    u64::try_from(raw).map_err(|_| StoreError::Backend(format!("negative counter value {raw}")))
}

pub struct SqliteStore {
    pool: Pool,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    pub fn new(pool: Pool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Open the database at `path` using the wall clock.
    pub fn open(path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        Ok(Self::new(open_pool(path, busy_timeout_ms)?, Arc::new(SystemClock)))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

impl CounterStore for SqliteStore {
    fn window_state(&self, success_key: &str, failure_key: &str) -> Result<WindowState, StoreError> {
        let conn = self.pool.get()?;
        let live: i64 = conn.query_row(
            "SELECT COUNT(*) FROM counters
             WHERE key IN (?1, ?2)
             AND (expires_at_ms IS NULL OR expires_at_ms > ?3)",
            params![success_key, failure_key, self.now_ms()],
            |row| row.get(0),
        )?;
        Ok(if live == 0 { WindowState::Fresh } else { WindowState::Active })
    }

    fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let conn = self.pool.get()?;
        // One statement: an expired row restarts at 1, a live row keeps its expiry.
        let value: i64 = conn.query_row(
            "INSERT INTO counters (key, value, expires_at_ms) VALUES (?1, 1, ?2 + ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = CASE
                    WHEN counters.expires_at_ms IS NOT NULL AND counters.expires_at_ms <= ?2 THEN 1
                    ELSE counters.value + 1
                END,
                expires_at_ms = CASE
                    WHEN counters.expires_at_ms IS NULL OR counters.expires_at_ms <= ?2 THEN ?2 + ?3
                    ELSE counters.expires_at_ms
                END
             RETURNING value",
            params![key, self.now_ms(), ttl.num_milliseconds()],
            |row| row.get(0),
        )?;
        to_count(value)
    }

    fn get(&self, key: &str) -> Result<u64, StoreError> {
        let conn = self.pool.get()?;
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM counters
                 WHERE key = ?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?2)",
                params![key, self.now_ms()],
                |row| row.get(0),
            )
            .optional()?;
        value.map_or(Ok(0), to_count)
    }

    fn expires_at(&self, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.pool.get()?;
        let ms: Option<Option<i64>> = conn
            .query_row(
                "SELECT expires_at_ms FROM counters
                 WHERE key = ?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?2)",
                params![key, self.now_ms()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ms.flatten().and_then(DateTime::from_timestamp_millis))
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM counters WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?1",
            params![self.now_ms()],
        )?;
        Ok(removed)
    }
}

impl HistoryStore for SqliteStore {
    fn push_capped(&self, key: &str, sample: &RateSample, cap: usize) -> Result<bool, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO rate_history (series, bucket_id, rate_percent, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                key,
                sample.bucket_id,
                sample.rate_percent,
                sample.recorded_at.to_rfc3339()
            ],
        )?;

        if inserted > 0 {
            tx.execute(
                "DELETE FROM rate_history
                 WHERE series = ?1
                 AND id NOT IN (
                    SELECT id FROM rate_history WHERE series = ?1 ORDER BY id DESC LIMIT ?2
                 )",
                params![key, cap as i64],
            )?;
        }

        tx.commit()?;
        Ok(inserted > 0)
    }

    fn range(&self, key: &str) -> Result<Vec<RateSample>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT bucket_id, rate_percent, recorded_at FROM rate_history
             WHERE series = ?1 ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![key], |row| {
            let recorded_at: String = row.get(2)?;
            let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?
                .with_timezone(&Utc);
            Ok(RateSample {
                bucket_id: row.get(0)?,
                rate_percent: row.get(1)?,
                recorded_at,
            })
        })?;

        let mut samples = Vec::new();
        for r in rows {
            samples.push(r?);
        }
        Ok(samples)
    }

    fn len(&self, key: &str) -> Result<usize, StoreError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM rate_history WHERE series = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn clear(&self, key: &str) -> Result<usize, StoreError> {
        let conn = self.pool.get()?;
        Ok(conn.execute("DELETE FROM rate_history WHERE series = ?1", params![key])?)
    }
}
