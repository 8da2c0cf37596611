//! Halt state (§4.D): dual-channel, sticky, durable-store-authoritative.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use parking_lot::RwLock;
use tracing::{info, warn};
use vigil_ledger::LedgerStore;
use vigil_types::{EventId, HaltToken, Timestamp, VigilError, VigilResult};

/// The halt record (§3 Halt state). Exactly one logical instance exists
/// per deployment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HaltRecord {
    /// Current halt flag.
    pub halted: bool,
    /// The reason recorded when the halt began. Sticky: the *first*
    /// reason is preserved across idempotent `begin_halt` calls.
    pub reason: Option<String>,
    /// The ledger event id of the witnessed crisis event, if one was
    /// written.
    pub witnessed_event_id: Option<EventId>,
    /// When the halt began.
    pub onset: Option<Timestamp>,
    /// Earliest instant at which recovery may be attempted
    /// (`onset + 48h`).
    pub recovery_earliest: Option<Timestamp>,
}

/// Durable channel: the source of truth across restarts (§4.D,
/// "dual-channel").
#[async_trait]
pub trait DurableHaltStore: Send + Sync {
    /// Load the persisted record, if any has ever been written.
    async fn load(&self) -> VigilResult<Option<HaltRecord>>;

    /// Persist `record`, replacing whatever was there before. A single
    /// logical row, updated in place.
    async fn save(&self, record: &HaltRecord) -> VigilResult<()>;
}

/// In-memory durable store. Used by tests and single-process
/// deployments where "durable" means "outlives this struct, not this
/// process" is an acceptable relaxation.
#[derive(Default)]
pub struct InMemoryDurableHaltStore {
    record: RwLock<Option<HaltRecord>>,
}

impl InMemoryDurableHaltStore {
    /// Construct an empty store (no halt record has ever been written).
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableHaltStore for InMemoryDurableHaltStore {
    async fn load(&self) -> VigilResult<Option<HaltRecord>> {
        Ok(self.record.read().clone())
    }

    async fn save(&self, record: &HaltRecord) -> VigilResult<()> {
        *self.record.write() = Some(record.clone());
        Ok(())
    }
}

/// The halt-checker capability port (§5: "passed explicitly, no ambient
/// context"). Every writer in the kernel depends on this trait, never
/// on a concrete `HaltState`.
#[async_trait]
pub trait HaltChecker: Send + Sync {
    /// O(1) read of the fast channel.
    fn is_halted(&self) -> bool;

    /// The recorded halt reason, if halted.
    fn reason(&self) -> Option<String>;

    /// The full current record (for diagnostics and RT-2 checks).
    fn record(&self) -> HaltRecord;

    /// Observe `is_halted() == false` and mint a [`HaltToken`]. Fails
    /// with [`VigilError::Halted`] if the system is currently halted.
    /// This is the only supported way to obtain a token (§5).
    fn check(&self) -> VigilResult<HaltToken> {
        if self.is_halted() {
            Err(VigilError::Halted { reason: self.reason() })
        } else {
            Ok(HaltToken::new_unchecked())
        }
    }

    /// Engage the halt (§4.D transition table). Idempotent: if already
    /// halted, the first reason and onset are preserved.
    async fn begin_halt(&self, reason: String, witnessed_event_id: Option<EventId>) -> VigilResult<()>;

    /// Attempt recovery. Requires `now >= recovery_earliest` and proof,
    /// in the form of an already-witnessed ledger event id, that a
    /// recovery command was appended.
    async fn attempt_recovery(
        &self,
        now: Timestamp,
        requester: &str,
        recovery_event_id: EventId,
    ) -> VigilResult<()>;
}

/// Dual-channel halt state: a lock-free-read fast channel backed by a
/// durable channel that is the authority on restart (§4.D).
///
/// Recovery verification resolves the open question in spec §9 this way:
/// a ledger event only ever exists in the store once [`vigil_ledger::LedgerChain::write_event`]
/// has obtained a witness signature (CT-12) — so "the recovery command
/// was appended as a witnessed event" reduces to "the event exists in
/// the ledger with the expected type", no separate witness check needed.
pub struct HaltState {
    fast: RwLock<HaltRecord>,
    durable: Box<dyn DurableHaltStore>,
    ledger: Arc<dyn LedgerStore>,
}

/// Event type recorded for a successful recovery command.
pub const RECOVERY_EVENT_TYPE: &str = "constitutional.halt_recovery";

impl HaltState {
    /// Hydrate the fast channel from `durable` (default `Normal` on an
    /// empty store) and construct the dual-channel state.
    pub async fn new(durable: Box<dyn DurableHaltStore>, ledger: Arc<dyn LedgerStore>) -> VigilResult<Self> {
        let record = durable.load().await?.unwrap_or_default();
        Ok(Self {
            fast: RwLock::new(record),
            durable,
            ledger,
        })
    }
}

#[async_trait]
impl HaltChecker for HaltState {
    fn is_halted(&self) -> bool {
        self.fast.read().halted
    }

    fn reason(&self) -> Option<String> {
        self.fast.read().reason.clone()
    }

    fn record(&self) -> HaltRecord {
        self.fast.read().clone()
    }

    async fn begin_halt(&self, reason: String, witnessed_event_id: Option<EventId>) -> VigilResult<()> {
        let snapshot = {
            let mut fast = self.fast.write();
            if fast.halted {
                info!(reason = %fast.reason.clone().unwrap_or_default(), "begin_halt is idempotent, already halted");
                return Ok(());
            }
            let now = chrono::Utc::now();
            fast.halted = true;
            fast.reason = Some(reason.clone());
            fast.witnessed_event_id = witnessed_event_id;
            fast.onset = Some(now);
            fast.recovery_earliest = Some(now + ChronoDuration::from_std(vigil_types::RECOVERY_WAITING_PERIOD).expect("constant duration fits"));
            fast.clone()
        };
        self.durable.save(&snapshot).await?;
        warn!(reason = %reason, "platform halted");
        Ok(())
    }

    async fn attempt_recovery(
        &self,
        now: Timestamp,
        requester: &str,
        recovery_event_id: EventId,
    ) -> VigilResult<()> {
        let recovery_earliest = {
            let fast = self.fast.read();
            if !fast.halted {
                return Err(VigilError::Conflict("not halted".into()));
            }
            fast.recovery_earliest
        };

        let Some(recovery_earliest) = recovery_earliest else {
            return Err(VigilError::Conflict("halt record missing onset".into()));
        };
        if now < recovery_earliest {
            return Err(VigilError::Conflict(format!(
                "waiting period: recovery not permitted before {recovery_earliest}"
            )));
        }

        let event = self
            .ledger
            .get(recovery_event_id)
            .await?
            .ok_or_else(|| VigilError::Validation("recovery_event_id does not resolve to a written event".into()))?;
        if event.event_type != RECOVERY_EVENT_TYPE {
            return Err(VigilError::Validation(format!(
                "recovery event has type {}, expected {RECOVERY_EVENT_TYPE}",
                event.event_type
            )));
        }

        *self.fast.write() = HaltRecord::default();
        self.durable.save(&HaltRecord::default()).await?;
        info!(requester, "platform recovered from halt");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vigil_ledger::{InMemoryLedgerStore, InMemoryKeyRegistry, KeyRegistry, KeyedWitness, KeypairSigner, LedgerChain, NewAgentKey, Signer};
    use std::sync::Arc;

    async fn write_recovery_event(store: Arc<dyn LedgerStore>) -> EventId {
        let registry = Arc::new(InMemoryKeyRegistry::new());
        let now = Utc::now();
        let signer = KeypairSigner::generate("op-1");
        registry
            .register(NewAgentKey {
                agent_id: "operator-1".into(),
                key_id: "op-1".into(),
                public_key: signer.public_key(),
                active_from: now - chrono::Duration::hours(1),
                active_until: None,
                rotates: None,
            })
            .await
            .unwrap();
        let witness_signer = KeypairSigner::generate("witness-1");
        registry
            .register(NewAgentKey {
                agent_id: "SYSTEM:witness".into(),
                key_id: "witness-1".into(),
                public_key: witness_signer.public_key(),
                active_from: now - chrono::Duration::hours(1),
                active_until: None,
                rotates: None,
            })
            .await
            .unwrap();

        let chain = LedgerChain::new(store.clone(), registry as Arc<dyn vigil_ledger::KeyRegistry>);
        let witness = KeyedWitness::new("SYSTEM:witness", witness_signer, store);
        let event = chain
            .write_event(
                RECOVERY_EVENT_TYPE,
                serde_json::json!({}),
                &"operator-1".to_string(),
                now,
                &signer,
                &witness,
                HaltToken::new_unchecked(),
            )
            .await
            .unwrap();
        event.event_id
    }

    fn ledger_store() -> Arc<dyn LedgerStore> {
        Arc::new(InMemoryLedgerStore::new())
    }

    #[tokio::test]
    async fn unhalted_by_default() {
        let state = HaltState::new(Box::new(InMemoryDurableHaltStore::new()), ledger_store())
            .await
            .unwrap();
        assert!(!state.is_halted());
        assert!(state.check().is_ok());
    }

    #[tokio::test]
    async fn begin_halt_is_sticky_and_idempotent() {
        let state = HaltState::new(Box::new(InMemoryDurableHaltStore::new()), ledger_store())
            .await
            .unwrap();
        state.begin_halt("first reason".into(), None).await.unwrap();
        assert!(state.is_halted());
        state.begin_halt("second reason".into(), None).await.unwrap();
        assert_eq!(state.reason(), Some("first reason".into()));
        assert!(state.check().is_err());
    }

    #[tokio::test]
    async fn recovery_rejected_before_waiting_period() {
        let state = HaltState::new(Box::new(InMemoryDurableHaltStore::new()), ledger_store())
            .await
            .unwrap();
        state.begin_halt("crisis".into(), None).await.unwrap();
        let now = Utc::now();
        let err = state.attempt_recovery(now, "op", uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, VigilError::Conflict(_)));
    }

    #[tokio::test]
    async fn recovery_rejected_without_witnessed_event() {
        let store = ledger_store();
        let state = HaltState::new(Box::new(InMemoryDurableHaltStore::new()), store)
            .await
            .unwrap();
        state.begin_halt("crisis".into(), None).await.unwrap();
        let far_future = Utc::now() + chrono::Duration::hours(49);
        let err = state
            .attempt_recovery(far_future, "op", uuid::Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, VigilError::Validation(_)));
    }

    #[tokio::test]
    async fn recovery_succeeds_after_waiting_period_with_witnessed_event() {
        let store = ledger_store();
        let recovery_event_id = write_recovery_event(store.clone()).await;
        let state = HaltState::new(Box::new(InMemoryDurableHaltStore::new()), store)
            .await
            .unwrap();
        state.begin_halt("crisis".into(), None).await.unwrap();
        let far_future = Utc::now() + chrono::Duration::hours(49);
        state
            .attempt_recovery(far_future, "op", recovery_event_id)
            .await
            .unwrap();
        assert!(!state.is_halted());
        assert!(state.check().is_ok());
    }
}
