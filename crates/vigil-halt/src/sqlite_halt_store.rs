//! SQLite-backed durable halt store (§6: "Halt state record (persisted)").
//! Exactly one logical row, updated in place transactionally, matching
//! the ledger and scheduler crates' migrate-then-pool pattern.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use vigil_types::{EventId, VigilError, VigilResult};

use crate::state::{DurableHaltStore, HaltRecord};

/// Durable, SQLite-backed halt store.
pub struct SqliteHaltStore {
    pool: SqlitePool,
}

impl SqliteHaltStore {
    /// Open (creating if absent) a database file at `path` and run
    /// migrations.
    pub async fn open(path: &str) -> VigilResult<Self> {
        let url = format!("sqlite://{path}?mode=rwc");
        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| VigilError::Transient(format!("opening halt database: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Open a private in-memory database. Used by tests.
    pub async fn in_memory() -> VigilResult<Self> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(|e| VigilError::Transient(format!("opening in-memory halt database: {e}")))?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> VigilResult<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> VigilResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS halt_state (
                singleton INTEGER PRIMARY KEY CHECK (singleton = 0),
                halted INTEGER NOT NULL,
                reason TEXT,
                witnessed_event_id TEXT,
                onset TEXT,
                recovery_earliest TEXT
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Transient(format!("migrating halt_state schema: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl DurableHaltStore for SqliteHaltStore {
    async fn load(&self) -> VigilResult<Option<HaltRecord>> {
        let row = sqlx::query("SELECT * FROM halt_state WHERE singleton = 0")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| VigilError::Transient(format!("reading halt state: {e}")))?;

        let Some(row) = row else { return Ok(None) };

        let witnessed_event_id: Option<String> = row.get("witnessed_event_id");
        let onset: Option<String> = row.get("onset");
        let recovery_earliest: Option<String> = row.get("recovery_earliest");

        Ok(Some(HaltRecord {
            halted: row.get::<i64, _>("halted") != 0,
            reason: row.get("reason"),
            witnessed_event_id: witnessed_event_id
                .map(|s| s.parse::<EventId>())
                .transpose()
                .map_err(|e| VigilError::Validation(format!("stored witnessed_event_id is not a uuid: {e}")))?,
            onset: onset.map(|s| parse_timestamp(&s)).transpose()?,
            recovery_earliest: recovery_earliest.map(|s| parse_timestamp(&s)).transpose()?,
        }))
    }

    async fn save(&self, record: &HaltRecord) -> VigilResult<()> {
        sqlx::query(
            r#"
            INSERT INTO halt_state (singleton, halted, reason, witnessed_event_id, onset, recovery_earliest)
            VALUES (0, ?, ?, ?, ?, ?)
            ON CONFLICT(singleton) DO UPDATE SET
                halted = excluded.halted,
                reason = excluded.reason,
                witnessed_event_id = excluded.witnessed_event_id,
                onset = excluded.onset,
                recovery_earliest = excluded.recovery_earliest
            "#,
        )
        .bind(record.halted as i64)
        .bind(&record.reason)
        .bind(record.witnessed_event_id.map(|id| id.to_string()))
        .bind(record.onset.map(|ts| ts.to_rfc3339()))
        .bind(record.recovery_earliest.map(|ts| ts.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Transient(format!("persisting halt state: {e}")))?;
        Ok(())
    }
}

fn parse_timestamp(s: &str) -> VigilResult<vigil_types::Timestamp> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| VigilError::Validation(format!("stored timestamp is invalid: {e}")))
}
