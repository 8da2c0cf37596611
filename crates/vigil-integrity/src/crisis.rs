//! Crisis trigger (§4.H): the single entry point that turns a detected
//! integrity crisis into a witnessed ledger event, then a halt. Ordering
//! is mandatory — the witnessed write is always attempted before the
//! halt flag flips, so the ledger's own history records the halt's
//! cause whenever that is at all possible.

use serde_json::json;
use tracing::info;
use vigil_canon::CanonValue;
use vigil_halt::{HaltChecker, WitnessedHaltWriter, WriteOutcome};
use vigil_ledger::{Signer, Witness};
use vigil_types::{AgentId, EventId, HaltToken, VigilResult};

use crate::fork::ForkPayload;

/// The three crisis kinds the trigger recognizes (§4.H).
#[derive(Debug, Clone)]
pub enum Crisis {
    /// Two events share `prev_hash` but disagree on `content_hash`.
    ForkDetected(ForkPayload),
    /// A gap was found in the ledger's sequence numbers.
    SequenceGap {
        /// Sequence number expected.
        expected: u64,
        /// Sequence number actually found.
        found: u64,
    },
    /// A stored event's `content_hash` did not match its recomputed
    /// value.
    HashMismatch {
        /// The event whose hash did not verify.
        event_id: EventId,
    },
}

impl Crisis {
    fn event_type(&self) -> &'static str {
        match self {
            Crisis::ForkDetected(_) => "constitutional.fork_detected",
            Crisis::SequenceGap { .. } => "constitutional.sequence_gap_detected",
            Crisis::HashMismatch { .. } => "constitutional.hash_mismatch_detected",
        }
    }

    fn reason(&self) -> String {
        match self {
            Crisis::ForkDetected(payload) => format!(
                "FR123: fork detected at prev_hash {}",
                payload.prev_hash
            ),
            Crisis::SequenceGap { expected, found } => {
                format!("FR124: sequence gap, expected {expected}, found {found}")
            }
            Crisis::HashMismatch { event_id } => {
                format!("FR125: hash mismatch on event {event_id}")
            }
        }
    }

    fn payload_json(&self) -> serde_json::Value {
        match self {
            Crisis::ForkDetected(payload) => {
                let CanonValue::Map(map) = payload.canonical() else {
                    unreachable!("ForkPayload::canonical always returns a map");
                };
                json!({
                    "kind": "fork_detected",
                    "prev_hash": payload.prev_hash,
                    "conflicting_event_ids": map.contains_key("conflicting_event_ids"),
                    "content_hashes": payload.content_hashes,
                })
            }
            Crisis::SequenceGap { expected, found } => {
                json!({ "kind": "sequence_gap", "expected": expected, "found": found })
            }
            Crisis::HashMismatch { event_id } => {
                json!({ "kind": "hash_mismatch", "event_id": event_id })
            }
        }
    }
}

/// Orchestrates the crisis response: witness, then halt (§4.H).
pub struct CrisisTrigger<H: HaltChecker> {
    writer: WitnessedHaltWriter,
    halt: std::sync::Arc<H>,
    agent_id: AgentId,
}

impl<H: HaltChecker> CrisisTrigger<H> {
    /// Construct a trigger that writes crisis events as `agent_id`
    /// (typically `SYSTEM:crisis-trigger`).
    pub fn new(writer: WitnessedHaltWriter, halt: std::sync::Arc<H>, agent_id: AgentId) -> Self {
        Self { writer, halt, agent_id }
    }

    /// Handle `crisis`: write the witnessed event, then engage the
    /// halt, then log the decision (§4.H steps 1-3). Runs unconditionally
    /// even if the system is already halted from an earlier, distinct
    /// crisis. `begin_halt` is idempotent, and a second crisis still
    /// gets its own witnessed event and log line instead of being
    /// dropped silently.
    pub async fn handle(&self, crisis: Crisis, signer: &dyn Signer, witness: &dyn Witness) -> VigilResult<()> {
        let reason = crisis.reason();
        let already_halted = self.halt.is_halted();

        let outcome = self
            .writer
            .write_halt_event(
                crisis.event_type(),
                crisis.payload_json(),
                &self.agent_id,
                signer,
                witness,
                HaltToken::new_unchecked(),
            )
            .await;

        let witnessed_event_id = match outcome {
            WriteOutcome::Written(id) => Some(id),
            WriteOutcome::Unwitnessed => None,
        };

        self.halt.begin_halt(reason.clone(), witnessed_event_id).await?;
        info!(
            reason = %reason,
            witnessed = witnessed_event_id.is_some(),
            already_halted,
            "crisis trigger engaged halt"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use uuid::Uuid;
    use vigil_halt::{HaltState, InMemoryDurableHaltStore, InMemoryUnwitnessedHaltStore};
    use vigil_ledger::{InMemoryKeyRegistry, InMemoryLedgerStore, KeyRegistry, KeyedWitness, KeypairSigner, LedgerChain, LedgerStore, NewAgentKey};

    async fn setup() -> (CrisisTrigger<HaltState>, KeypairSigner, KeypairSigner, Arc<HaltState>) {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedgerStore::new());
        let registry = Arc::new(InMemoryKeyRegistry::new());
        let now = Utc::now();
        let signer = KeypairSigner::generate("crisis-trigger");
        registry
            .register(NewAgentKey {
                agent_id: "SYSTEM:crisis-trigger".into(),
                key_id: "crisis-trigger".into(),
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

        let chain = Arc::new(LedgerChain::new(store.clone(), registry as Arc<dyn KeyRegistry>));
        let writer = WitnessedHaltWriter::new(chain, Box::new(InMemoryUnwitnessedHaltStore::new()));
        let halt = Arc::new(HaltState::new(Box::new(InMemoryDurableHaltStore::new()), store).await.unwrap());
        let trigger = CrisisTrigger::new(writer, halt.clone(), "SYSTEM:crisis-trigger".into());
        (trigger, signer, witness_signer, halt)
    }

    #[tokio::test]
    async fn fork_crisis_writes_witnessed_event_and_halts() {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedgerStore::new());
        let registry = Arc::new(InMemoryKeyRegistry::new());
        let now = Utc::now();
        let signer = KeypairSigner::generate("crisis-trigger");
        registry
            .register(NewAgentKey {
                agent_id: "SYSTEM:crisis-trigger".into(),
                key_id: "crisis-trigger".into(),
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
        let chain = Arc::new(LedgerChain::new(store.clone(), registry as Arc<dyn KeyRegistry>));
        let writer = WitnessedHaltWriter::new(chain, Box::new(InMemoryUnwitnessedHaltStore::new()));
        let halt = Arc::new(HaltState::new(Box::new(InMemoryDurableHaltStore::new()), store.clone()).await.unwrap());
        let trigger = CrisisTrigger::new(writer, halt.clone(), "SYSTEM:crisis-trigger".into());
        let witness = KeyedWitness::new("SYSTEM:witness", witness_signer, store);

        let payload = ForkPayload {
            conflicting_event_ids: [Uuid::nil(), Uuid::max()],
            prev_hash: "a".repeat(64),
            content_hashes: ["b".repeat(64), "c".repeat(64)],
            detection_timestamp: Utc::now(),
            detecting_service_id: "fork-monitor-1".into(),
        };

        trigger.handle(Crisis::ForkDetected(payload), &signer, &witness).await.unwrap();
        assert!(halt.is_halted());
        assert!(halt.reason().unwrap().contains("FR123"));
        assert!(halt.record().witnessed_event_id.is_some());
    }

    #[tokio::test]
    async fn sequence_gap_crisis_halts_with_fr124() {
        let (trigger, signer, _witness_signer, halt) = setup().await;
        let declining = vigil_ledger::DecliningWitness::new("SYSTEM:witness");
        trigger
            .handle(Crisis::SequenceGap { expected: 3, found: 5 }, &signer, &declining)
            .await
            .unwrap();
        assert!(halt.is_halted());
        assert!(halt.reason().unwrap().contains("FR124"));
    }

    #[tokio::test]
    async fn second_distinct_crisis_while_already_halted_still_writes_and_logs() {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedgerStore::new());
        let registry = Arc::new(InMemoryKeyRegistry::new());
        let now = Utc::now();
        let signer = KeypairSigner::generate("crisis-trigger");
        registry
            .register(NewAgentKey {
                agent_id: "SYSTEM:crisis-trigger".into(),
                key_id: "crisis-trigger".into(),
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
        let chain = Arc::new(LedgerChain::new(store.clone(), registry as Arc<dyn KeyRegistry>));
        let writer = WitnessedHaltWriter::new(chain, Box::new(InMemoryUnwitnessedHaltStore::new()));
        let halt = Arc::new(HaltState::new(Box::new(InMemoryDurableHaltStore::new()), store.clone()).await.unwrap());
        let trigger = CrisisTrigger::new(writer, halt.clone(), "SYSTEM:crisis-trigger".into());
        let witness = KeyedWitness::new("SYSTEM:witness", witness_signer, store.clone());

        // First crisis halts the system.
        trigger
            .handle(Crisis::SequenceGap { expected: 3, found: 5 }, &signer, &witness)
            .await
            .unwrap();
        assert!(halt.is_halted());
        let first_reason = halt.reason().unwrap();
        assert!(first_reason.contains("FR124"));

        // A second, distinct crisis arrives while already halted. It
        // must not be dropped: its own witnessed event is still written
        // and `handle` still returns Ok, even though `begin_halt` keeps
        // the original reason and onset.
        trigger
            .handle(Crisis::HashMismatch { event_id: Uuid::nil() }, &signer, &witness)
            .await
            .unwrap();

        assert!(halt.is_halted());
        assert_eq!(halt.reason().unwrap(), first_reason, "begin_halt keeps the first reason");

        let events = store.all().await.unwrap();
        assert_eq!(events.len(), 2, "both crises get their own witnessed event");
        assert_eq!(events[0].event_type, "constitutional.sequence_gap_detected");
        assert_eq!(events[1].event_type, "constitutional.hash_mismatch_detected");
    }
}
