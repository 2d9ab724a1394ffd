use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;

use crate::events::SessionSummary;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// One row of watering history.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SessionRecord {
    pub session_id: i64,
    pub ts_start: i64,
    pub ts_end: i64,
    pub reason: String,
    pub result: String,
    pub planned_sec: i64,
    pub ran_sec: i64,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/watering/watering.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Watering sessions
    // ----------------------------

    /// Record a session that switched the pump on.  `result` is the status
    /// event kind it ended with.
    pub async fn insert_session(&self, s: &SessionSummary, result: &str) -> Result<()> {
        let ts_start = s.started_at.timestamp();
        let ts_end = Utc::now().timestamp().max(ts_start);
        sqlx::query(
            r#"
            INSERT INTO watering_sessions
              (session_id, ts_start, ts_end, reason, result, planned_sec, ran_sec)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(s.id as i64)
        .bind(ts_start)
        .bind(ts_end)
        .bind(s.reason.as_str())
        .bind(result)
        .bind(s.planned_secs as i64)
        .bind(s.ran_secs as i64)
        .execute(&self.pool)
        .await
        .context("insert_session failed")?;
        Ok(())
    }

    /// Unix time the pump last started, if ever.
    pub async fn last_watered_at(&self) -> Result<Option<i64>> {
        let ts: Option<i64> = sqlx::query_scalar("SELECT MAX(ts_start) FROM watering_sessions")
            .fetch_one(&self.pool)
            .await
            .context("last_watered_at failed")?;
        Ok(ts)
    }

    /// Newest sessions first.
    pub async fn recent_sessions(&self, limit: i64) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT session_id, ts_start, ts_end, reason, result, planned_sec, ran_sec
            FROM watering_sessions
            ORDER BY ts_start DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_sessions failed")?;
        Ok(rows)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
