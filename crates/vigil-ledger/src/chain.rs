//! Event & hash chain (§4.C): the immutable, witnessed, sequence-ordered
//! append operation every other constitutional component is built on.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use vigil_canon::{canonical_hash, CanonValue};
use vigil_types::{AgentId, EventId, HaltToken, KeyId, Timestamp, VigilError, VigilResult};

use crate::keyring::KeyRegistry;
use crate::signing::{verify_signature, Signer};
use crate::store::LedgerStore;

/// An immutable, signed, witnessed ledger event (§3 Event).
///
/// No method named `delete`, `remove`, `scrub`, or `modify` exists on
/// this type, nor anywhere in this crate — there is no symbol to call.
/// The only way an `Event` comes into being is [`LedgerChain::write_event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub event_id: EventId,
    /// Monotonic, gap-free sequence number within this ledger partition.
    pub sequence: u64,
    /// Dotted event-type string, e.g. `constitutional.fork_detected`.
    pub event_type: String,
    /// Application payload, canonically serializable.
    pub payload: serde_json::Value,
    /// Hex content hash of the previous event, or [`vigil_types::GENESIS_PREV_HASH`].
    pub prev_hash: String,
    /// Hex SHA-256 of the canonical signable content.
    pub content_hash: String,
    /// Signer's signature over `content_hash`.
    pub signature: Vec<u8>,
    /// Key id that produced `signature`.
    pub signer_key_id: KeyId,
    /// Identity of the witness that countersigned this event.
    pub witness_id: String,
    /// Witness's signature over `signature`.
    pub witness_signature: Vec<u8>,
    /// Wall-clock commit time, UTC.
    pub local_timestamp: Timestamp,
}

impl Event {
    /// Canonical signable content: every field except `content_hash`,
    /// `signature`, and `witness_signature` (§3 Event).
    fn signable(&self) -> CanonValue {
        CanonValue::map([
            ("event_id", CanonValue::Uuid(self.event_id)),
            ("sequence", CanonValue::Int(self.sequence as i64)),
            ("event_type", CanonValue::Str(self.event_type.clone())),
            ("payload", CanonValue::from_json(self.payload.clone())),
            ("prev_hash", CanonValue::Str(self.prev_hash.clone())),
            ("signer_key_id", CanonValue::Str(self.signer_key_id.clone())),
            ("witness_id", CanonValue::Str(self.witness_id.clone())),
            ("local_timestamp", CanonValue::Timestamp(self.local_timestamp)),
        ])
    }

    /// Recompute the content hash from the event's fields.
    pub fn recompute_content_hash(&self) -> VigilResult<String> {
        canonical_hash(&self.signable())
    }
}

/// Independent countersigning service (§4.C step 5).
///
/// A witness re-verifies the writer's view of `prev_hash` before
/// countersigning, so a compromised writer alone cannot fabricate a
/// witnessed event. Declining or being unreachable must surface as an
/// error — the writer treats that as [`VigilError::Unwitnessed`] and
/// does not persist the event.
#[async_trait]
pub trait Witness: Send + Sync {
    /// Stable identity of this witness, stored in `Event::witness_id`.
    fn witness_id(&self) -> &str;

    /// Independently confirm `prev_hash` is the witness's own view of
    /// the chain tip, then countersign `signer_signature`.
    async fn witness(&self, prev_hash: &str, signer_signature: &[u8]) -> VigilResult<Vec<u8>>;
}

/// A witness backed by its own keypair and its own view of the ledger
/// tip, obtained through the same [`LedgerStore`] the writer uses. In a
/// multi-process deployment the witness would instead be a separate
/// service reachable over the network; this type models the "independent
/// service" contract for single-process tests and deployments.
pub struct KeyedWitness<S: Signer> {
    id: String,
    signer: S,
    store: Arc<dyn LedgerStore>,
}

impl<S: Signer> KeyedWitness<S> {
    /// Construct a witness identified by `id`, signing with `signer`, and
    /// re-deriving the chain tip from `store`.
    pub fn new(id: impl Into<String>, signer: S, store: Arc<dyn LedgerStore>) -> Self {
        Self { id: id.into(), signer, store }
    }
}

#[async_trait]
impl<S: Signer + Send + Sync> Witness for KeyedWitness<S> {
    fn witness_id(&self) -> &str {
        &self.id
    }

    async fn witness(&self, prev_hash: &str, signer_signature: &[u8]) -> VigilResult<Vec<u8>> {
        let own_view = self
            .store
            .last()
            .await?
            .map(|e| e.content_hash)
            .unwrap_or_else(|| vigil_types::GENESIS_PREV_HASH.to_string());

        if own_view != prev_hash {
            return Err(VigilError::Unwitnessed(format!(
                "witness {} disagrees on chain tip: writer claims {prev_hash}, witness sees {own_view}",
                self.id
            )));
        }

        self.signer.sign(signer_signature)
    }
}

/// A declining witness, used to exercise the "unwitnessed write" path.
pub struct DecliningWitness {
    id: String,
}

impl DecliningWitness {
    /// Construct a witness that always declines.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl Witness for DecliningWitness {
    fn witness_id(&self) -> &str {
        &self.id
    }

    async fn witness(&self, _prev_hash: &str, _signer_signature: &[u8]) -> VigilResult<Vec<u8>> {
        Err(VigilError::Unwitnessed(format!(
            "witness {} declined to countersign",
            self.id
        )))
    }
}

/// Internal writer-mutex state: a single lock serializes sequence
/// assignment and prev_hash lookup across all appends (§5).
struct WriterState;

/// The hash-chained, witnessed event ledger (§4.C).
pub struct LedgerChain {
    store: Arc<dyn LedgerStore>,
    registry: Arc<dyn KeyRegistry>,
    writer_lock: Mutex<WriterState>,
}

impl LedgerChain {
    /// Construct a chain over `store`, authenticating signers against
    /// `registry`.
    pub fn new(store: Arc<dyn LedgerStore>, registry: Arc<dyn KeyRegistry>) -> Self {
        Self {
            store,
            registry,
            writer_lock: Mutex::new(WriterState),
        }
    }

    /// Append a new event (§4.C operation `write_event`).
    ///
    /// `_halt_token` proves the caller observed `is_halted() == false`
    /// before calling; it carries no data and is never inspected here —
    /// its only job is to make "forgot to check halt" a compile error at
    /// call sites (§5).
    pub async fn write_event(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        agent_id: &AgentId,
        local_timestamp: Timestamp,
        signer: &dyn Signer,
        witness: &dyn Witness,
        _halt_token: HaltToken,
    ) -> VigilResult<Event> {
        // 1. Resolve signer key.
        let key = self
            .registry
            .get_active_for_agent(agent_id, local_timestamp)
            .await?
            .ok_or_else(|| VigilError::Validation(format!("no active key for agent {agent_id}")))?;
        if key.key_id != *signer.key_id() {
            return Err(VigilError::Validation(format!(
                "signer key id {} does not match registry's active key {} for agent {agent_id}",
                signer.key_id(),
                key.key_id
            )));
        }

        // 2. Sequence + prev_hash under the writer lock.
        let _guard = self.writer_lock.lock().await;
        let last = self.store.last().await?;
        let (sequence, prev_hash) = match &last {
            Some(ev) => (ev.sequence + 1, ev.content_hash.clone()),
            None => (0, vigil_types::GENESIS_PREV_HASH.to_string()),
        };

        let mut event = Event {
            event_id: uuid::Uuid::new_v4(),
            sequence,
            event_type: event_type.to_string(),
            payload,
            prev_hash,
            content_hash: String::new(),
            signature: Vec::new(),
            signer_key_id: key.key_id.clone(),
            witness_id: witness.witness_id().to_string(),
            witness_signature: Vec::new(),
            local_timestamp,
        };

        // 3. Canonical content hash.
        event.content_hash = event.recompute_content_hash()?;

        // 4. Signer signature over content_hash.
        event.signature = signer.sign(event.content_hash.as_bytes())?;

        // 5. Witness countersignature over the signer signature.
        event.witness_signature = witness
            .witness(&event.prev_hash, &event.signature)
            .await?;

        // 6. Persist atomically.
        self.store.append(&event).await?;
        debug!(
            sequence = event.sequence,
            event_type = %event.event_type,
            "appended witnessed event"
        );

        Ok(event)
    }

    /// Read access to the underlying store (verification, scans).
    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Read access to the key registry.
    pub fn registry(&self) -> &Arc<dyn KeyRegistry> {
        &self.registry
    }
}

/// Purely structural chain verification (§4.C Verification, the
/// non-cryptographic half): sequence contiguity and hash-chain linkage.
/// Does not check signatures — see [`verify_signatures`] for that.
pub fn verify_structural(events: &[Event]) -> VigilResult<()> {
    for (i, event) in events.iter().enumerate() {
        if event.sequence != i as u64 {
            return Err(VigilError::HashChainBroken(format!(
                "sequence gap: expected {i}, found {}",
                event.sequence
            )));
        }

        let expected_prev = if i == 0 {
            vigil_types::GENESIS_PREV_HASH.to_string()
        } else {
            events[i - 1].content_hash.clone()
        };
        if event.prev_hash != expected_prev {
            return Err(VigilError::HashChainBroken(format!(
                "event {} prev_hash does not match predecessor's content_hash",
                event.event_id
            )));
        }

        let recomputed = event.recompute_content_hash()?;
        if recomputed != event.content_hash {
            return Err(VigilError::HashMismatch(format!(
                "event {} content_hash does not match recomputed value",
                event.event_id
            )));
        }
    }
    Ok(())
}

/// Cryptographic verification: signer and witness signatures, checked
/// against the key registry's view of who was active at each event's
/// `local_timestamp` (§4.C Verification).
pub async fn verify_signatures(events: &[Event], registry: &dyn KeyRegistry) -> VigilResult<()> {
    for event in events {
        let signer_key = registry
            .get_by_key_id(&event.signer_key_id)
            .await?
            .ok_or_else(|| VigilError::Validation(format!("unknown signer key {}", event.signer_key_id)))?;
        if !signer_key.covers(event.local_timestamp) {
            return Err(VigilError::Validation(format!(
                "signer key {} was not active at {}",
                event.signer_key_id, event.local_timestamp
            )));
        }
        verify_signature(&signer_key.public_key, event.content_hash.as_bytes(), &event.signature)?;

        // The witness is authenticated the same way as any other agent:
        // it must have an active key registered under its witness_id at
        // the time it countersigned.
        if let Some(witness_key) = registry
            .get_active_for_agent(&event.witness_id, event.local_timestamp)
            .await?
        {
            verify_signature(&witness_key.public_key, &event.signature, &event.witness_signature)?;
        }
    }
    info!(count = events.len(), "chain verification complete");
    Ok(())
}

/// Convenience wrapper combining structural and cryptographic
/// verification over the whole chain (§8 property 1).
pub async fn verify_chain(events: &[Event], registry: &dyn KeyRegistry) -> VigilResult<()> {
    verify_structural(events)?;
    verify_signatures(events, registry).await
}
