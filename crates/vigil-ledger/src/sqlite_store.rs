//! SQLite-backed durable ledger store, grounded on the teacher's
//! sqlite storage driver: a migrated schema, a connection pool, and a
//! broadcast channel for live event subscription.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast;
use tracing::debug;
use vigil_types::{EventId, VigilError, VigilResult};

use crate::chain::Event;
use crate::store::LedgerStore;

const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Durable, SQLite-backed event store (§4.C, §5 "durable store").
pub struct SqliteLedgerStore {
    pool: SqlitePool,
    broadcast_tx: broadcast::Sender<Event>,
}

impl SqliteLedgerStore {
    /// Open (creating if absent) a database file at `path` and run
    /// migrations.
    pub async fn open(path: &str) -> VigilResult<Self> {
        let url = format!("sqlite://{path}?mode=rwc");
        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| VigilError::Transient(format!("opening ledger database: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Open a private in-memory database. Used by tests.
    pub async fn in_memory() -> VigilResult<Self> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(|e| VigilError::Transient(format!("opening in-memory ledger database: {e}")))?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> VigilResult<Self> {
        let store = Self {
            pool,
            broadcast_tx: broadcast::channel(DEFAULT_BROADCAST_CAPACITY).0,
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> VigilResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_events (
                event_id TEXT PRIMARY KEY,
                sequence INTEGER NOT NULL UNIQUE,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                prev_hash TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                signature BLOB NOT NULL,
                signer_key_id TEXT NOT NULL,
                witness_id TEXT NOT NULL,
                witness_signature BLOB NOT NULL,
                local_timestamp TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Transient(format!("migrating ledger schema: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_ledger_events_sequence ON ledger_events(sequence)")
            .execute(&self.pool)
            .await
            .map_err(|e| VigilError::Transient(format!("creating sequence index: {e}")))?;

        Ok(())
    }

    /// Subscribe to the live stream of appended events, e.g. for fork
    /// monitoring without re-scanning the store (§4.G).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast_tx.subscribe()
    }

    fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> VigilResult<Event> {
        let event_id: String = row.get("event_id");
        let payload: String = row.get("payload");
        let local_timestamp: String = row.get("local_timestamp");

        Ok(Event {
            event_id: event_id
                .parse()
                .map_err(|e| VigilError::Validation(format!("stored event_id is not a uuid: {e}")))?,
            sequence: row.get::<i64, _>("sequence") as u64,
            event_type: row.get("event_type"),
            payload: serde_json::from_str(&payload)
                .map_err(|e| VigilError::Validation(format!("stored payload is not valid json: {e}")))?,
            prev_hash: row.get("prev_hash"),
            content_hash: row.get("content_hash"),
            signature: row.get("signature"),
            signer_key_id: row.get("signer_key_id"),
            witness_id: row.get("witness_id"),
            witness_signature: row.get("witness_signature"),
            local_timestamp: chrono::DateTime::parse_from_rfc3339(&local_timestamp)
                .map_err(|e| VigilError::Validation(format!("stored timestamp is invalid: {e}")))?
                .with_timezone(&chrono::Utc),
        })
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn append(&self, event: &Event) -> VigilResult<()> {
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| VigilError::Validation(format!("serializing payload: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO ledger_events
            (event_id, sequence, event_type, payload, prev_hash, content_hash,
             signature, signer_key_id, witness_id, witness_signature, local_timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.event_id.to_string())
        .bind(event.sequence as i64)
        .bind(&event.event_type)
        .bind(payload)
        .bind(&event.prev_hash)
        .bind(&event.content_hash)
        .bind(&event.signature)
        .bind(&event.signer_key_id)
        .bind(&event.witness_id)
        .bind(&event.witness_signature)
        .bind(event.local_timestamp.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Transient(format!("appending event: {e}")))?;

        debug!(sequence = event.sequence, "persisted event to sqlite ledger store");
        let _ = self.broadcast_tx.send(event.clone());
        Ok(())
    }

    async fn last(&self) -> VigilResult<Option<Event>> {
        let row = sqlx::query("SELECT * FROM ledger_events ORDER BY sequence DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| VigilError::Transient(format!("reading last event: {e}")))?;
        row.map(|r| Self::row_to_event(&r)).transpose()
    }

    async fn get(&self, id: EventId) -> VigilResult<Option<Event>> {
        let row = sqlx::query("SELECT * FROM ledger_events WHERE event_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| VigilError::Transient(format!("reading event {id}: {e}")))?;
        row.map(|r| Self::row_to_event(&r)).transpose()
    }

    async fn all(&self) -> VigilResult<Vec<Event>> {
        let rows = sqlx::query("SELECT * FROM ledger_events ORDER BY sequence ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| VigilError::Transient(format!("scanning ledger: {e}")))?;
        rows.iter().map(Self::row_to_event).collect()
    }
}
