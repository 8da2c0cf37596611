//! Witnessed-halt writer (§4.E): writes the constitutional-crisis event
//! to the ledger before the halt flag flips; on witness or ledger
//! failure, records an unwitnessed-halt sentinel and proceeds to halt
//! anyway — integrity outranks availability.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::error;
use vigil_ledger::{LedgerChain, Signer, Witness};
use vigil_types::{AgentId, EventId, HaltToken, Timestamp, VigilResult};

/// The outcome of attempting a witnessed write of a crisis event.
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    /// The crisis event was written and witnessed.
    Written(EventId),
    /// Writing failed; an [`UnwitnessedHalt`] sentinel was recorded
    /// instead. Callers proceed to halt regardless (§4.E, §4.H).
    Unwitnessed,
}

/// A persistent record of a crisis that could not be written as a
/// witnessed ledger event.
#[derive(Debug, Clone)]
pub struct UnwitnessedHalt {
    /// The crisis payload that could not be witnessed.
    pub crisis_payload: serde_json::Value,
    /// Why the witnessed write failed.
    pub failure_reason: String,
    /// When the failure was recorded.
    pub recorded_at: Timestamp,
}

/// Append-only store for [`UnwitnessedHalt`] sentinels. Dedicated and
/// separate from the main ledger, since by definition these records
/// could not be written to it.
#[async_trait]
pub trait UnwitnessedHaltStore: Send + Sync {
    /// Record a sentinel. Never fails silently: if this itself fails,
    /// the caller has exhausted every durability option and must log
    /// loudly and halt anyway.
    async fn record(&self, entry: UnwitnessedHalt) -> VigilResult<()>;

    /// All recorded sentinels, oldest first.
    async fn all(&self) -> VigilResult<Vec<UnwitnessedHalt>>;
}

/// In-memory sentinel store.
#[derive(Default)]
pub struct InMemoryUnwitnessedHaltStore {
    entries: RwLock<Vec<UnwitnessedHalt>>,
}

impl InMemoryUnwitnessedHaltStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UnwitnessedHaltStore for InMemoryUnwitnessedHaltStore {
    async fn record(&self, entry: UnwitnessedHalt) -> VigilResult<()> {
        self.entries.write().push(entry);
        Ok(())
    }

    async fn all(&self) -> VigilResult<Vec<UnwitnessedHalt>> {
        Ok(self.entries.read().clone())
    }
}

/// Writes constitutional-crisis events through the ledger, falling back
/// to an [`UnwitnessedHaltStore`] sentinel when the witnessed write
/// cannot be completed.
pub struct WitnessedHaltWriter {
    chain: std::sync::Arc<LedgerChain>,
    sentinels: Box<dyn UnwitnessedHaltStore>,
}

impl WitnessedHaltWriter {
    /// Construct a writer over `chain`, recording failures into
    /// `sentinels`.
    pub fn new(chain: std::sync::Arc<LedgerChain>, sentinels: Box<dyn UnwitnessedHaltStore>) -> Self {
        Self { chain, sentinels }
    }

    /// Attempt the full witnessed write of `crisis_payload` as an event
    /// of type `event_type` (e.g. `constitutional.fork_detected`).
    ///
    /// `halt_token` proves the caller checked `is_halted() == false`
    /// immediately before the crisis was detected — true in practice
    /// because a crisis is, by definition, discovered before the halt
    /// it causes has taken effect.
    pub async fn write_halt_event(
        &self,
        event_type: &str,
        crisis_payload: serde_json::Value,
        agent_id: &AgentId,
        signer: &dyn Signer,
        witness: &dyn Witness,
        halt_token: HaltToken,
    ) -> WriteOutcome {
        let now = Utc::now();
        match self
            .chain
            .write_event(event_type, crisis_payload.clone(), agent_id, now, signer, witness, halt_token)
            .await
        {
            Ok(event) => WriteOutcome::Written(event.event_id),
            Err(err) => {
                error!(error = %err, "witnessed crisis write failed, recording unwitnessed-halt sentinel");
                let sentinel = UnwitnessedHalt {
                    crisis_payload,
                    failure_reason: err.to_string(),
                    recorded_at: now,
                };
                if let Err(store_err) = self.sentinels.record(sentinel).await {
                    error!(error = %store_err, "failed to record unwitnessed-halt sentinel; halting anyway");
                }
                WriteOutcome::Unwitnessed
            }
        }
    }

    /// Sentinels recorded so far (for operator inspection / alerting).
    pub async fn unwitnessed_halts(&self) -> VigilResult<Vec<UnwitnessedHalt>> {
        self.sentinels.all().await
    }
}
