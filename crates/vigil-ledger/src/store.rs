//! Storage contract for the append-only event ledger.

use async_trait::async_trait;
use vigil_types::{EventId, VigilResult};

use crate::chain::Event;

/// Persistence contract for committed events (§5: "readers are
/// concurrent"; writers are serialized upstream by `LedgerChain`'s
/// writer mutex, so implementations need not add their own write lock).
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Durably append `event`. Called only after it has been witnessed.
    async fn append(&self, event: &Event) -> VigilResult<()>;

    /// The most recently appended event, if any (used to compute the
    /// next `prev_hash`).
    async fn last(&self) -> VigilResult<Option<Event>>;

    /// Look up a single event by id.
    async fn get(&self, id: EventId) -> VigilResult<Option<Event>>;

    /// All events in ascending sequence order. Used by fork detection
    /// and chain verification scans.
    async fn all(&self) -> VigilResult<Vec<Event>>;
}

/// In-memory ledger store. The reference implementation used by tests
/// and single-process deployments; production deployments would swap in
/// the sqlx-backed [`crate::sqlite_store::SqliteLedgerStore`].
#[derive(Default)]
pub struct InMemoryLedgerStore {
    events: parking_lot::RwLock<Vec<Event>>,
}

impl InMemoryLedgerStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn append(&self, event: &Event) -> VigilResult<()> {
        self.events.write().push(event.clone());
        Ok(())
    }

    async fn last(&self) -> VigilResult<Option<Event>> {
        Ok(self.events.read().last().cloned())
    }

    async fn get(&self, id: EventId) -> VigilResult<Option<Event>> {
        Ok(self.events.read().iter().find(|e| e.event_id == id).cloned())
    }

    async fn all(&self) -> VigilResult<Vec<Event>> {
        Ok(self.events.read().clone())
    }
}
