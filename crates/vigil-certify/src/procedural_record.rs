//! Procedural-record generator (§4.J): produces a signed, hashed,
//! immutable record of an entire deliberation.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use vigil_canon::CanonValue;
use vigil_ledger::Signer;
use vigil_types::{DeliberationId, Timestamp, VigilError, VigilResult};

/// A single entry in a deliberation's timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEvent {
    /// When the event occurred.
    pub at: Timestamp,
    /// Dotted event-type string.
    pub kind: String,
    /// Free-form detail.
    pub detail: serde_json::Value,
}

/// Read-only view of a deliberation's collected facts, as seen by the
/// generator. Collaborator services own the mutable deliberation state;
/// this crate only ever reads it.
#[async_trait]
pub trait DeliberationSource: Send + Sync {
    /// Agenda item strings, in order.
    async fn agenda_items(&self, deliberation_id: DeliberationId) -> VigilResult<Vec<String>>;
    /// Participant identifiers.
    async fn participant_ids(&self, deliberation_id: DeliberationId) -> VigilResult<Vec<String>>;
    /// Vote tallies, option -> count.
    async fn vote_summary(&self, deliberation_id: DeliberationId) -> VigilResult<std::collections::BTreeMap<String, i64>>;
    /// Timeline of the deliberation, in order.
    async fn timeline(&self, deliberation_id: DeliberationId) -> VigilResult<Vec<TimelineEvent>>;
    /// Final decisions reached.
    async fn decisions(&self, deliberation_id: DeliberationId) -> VigilResult<Vec<String>>;
}

/// An immutable, signed procedural record (§3 Procedural record). All
/// collection fields are sealed at construction; nothing in this crate
/// mutates them afterward.
#[derive(Debug, Clone, PartialEq)]
pub struct ProceduralRecord {
    /// Unique identifier.
    pub record_id: uuid::Uuid,
    /// The deliberation this record documents.
    pub deliberation_id: DeliberationId,
    /// Sealed agenda.
    pub agenda_items: Vec<String>,
    /// Sealed participant list.
    pub participant_ids: Vec<String>,
    /// Sealed vote tallies.
    pub vote_summary: std::collections::BTreeMap<String, i64>,
    /// Sealed timeline.
    pub timeline_events: Vec<TimelineEvent>,
    /// Sealed decisions.
    pub decisions: Vec<String>,
    /// SHA-256 over the canonical serialization of the fields above.
    pub record_hash: String,
    /// Signature over `record_hash`.
    pub signature: Vec<u8>,
}

impl ProceduralRecord {
    fn canonical(
        deliberation_id: DeliberationId,
        agenda_items: &[String],
        participant_ids: &[String],
        vote_summary: &std::collections::BTreeMap<String, i64>,
        timeline: &[TimelineEvent],
        decisions: &[String],
    ) -> CanonValue {
        CanonValue::map([
            ("deliberation_id", CanonValue::Uuid(deliberation_id)),
            (
                "agenda_items",
                CanonValue::Seq(agenda_items.iter().cloned().map(CanonValue::Str).collect()),
            ),
            (
                "participant_ids",
                CanonValue::Seq(participant_ids.iter().cloned().map(CanonValue::Str).collect()),
            ),
            (
                "vote_summary",
                CanonValue::map(vote_summary.iter().map(|(k, v)| (k.clone(), CanonValue::Int(*v)))),
            ),
            (
                "timeline_events",
                CanonValue::Seq(
                    timeline
                        .iter()
                        .map(|e| {
                            CanonValue::map([
                                ("at", CanonValue::Timestamp(e.at)),
                                ("kind", CanonValue::Str(e.kind.clone())),
                                ("detail", CanonValue::from_json(e.detail.clone())),
                            ])
                        })
                        .collect(),
                ),
            ),
            (
                "decisions",
                CanonValue::Seq(decisions.iter().cloned().map(CanonValue::Str).collect()),
            ),
        ])
    }
}

/// Durable store for [`ProceduralRecord`]s.
#[async_trait]
pub trait ProceduralRecordStore: Send + Sync {
    /// Persist a new record.
    async fn insert(&self, record: ProceduralRecord) -> VigilResult<()>;
    /// Look up by record id.
    async fn get(&self, record_id: uuid::Uuid) -> VigilResult<Option<ProceduralRecord>>;
    /// Look up by deliberation id.
    async fn get_by_deliberation(&self, deliberation_id: DeliberationId) -> VigilResult<Option<ProceduralRecord>>;
}

/// In-memory procedural-record store.
#[derive(Default)]
pub struct InMemoryProceduralRecordStore {
    records: RwLock<Vec<ProceduralRecord>>,
}

impl InMemoryProceduralRecordStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProceduralRecordStore for InMemoryProceduralRecordStore {
    async fn insert(&self, record: ProceduralRecord) -> VigilResult<()> {
        self.records.write().push(record);
        Ok(())
    }

    async fn get(&self, record_id: uuid::Uuid) -> VigilResult<Option<ProceduralRecord>> {
        Ok(self.records.read().iter().find(|r| r.record_id == record_id).cloned())
    }

    async fn get_by_deliberation(&self, deliberation_id: DeliberationId) -> VigilResult<Option<ProceduralRecord>> {
        Ok(self.records.read().iter().find(|r| r.deliberation_id == deliberation_id).cloned())
    }
}

/// Generates procedural records from a [`DeliberationSource`] (§4.J).
///
/// Timeline ordering is validated before sealing: a record whose
/// timeline is not non-decreasing in `at` still gets generated (the
/// source is read-only and not ours to reject), but a warning is
/// logged, since an out-of-order timeline usually means the upstream
/// collaborator has a bug worth chasing.
pub struct ProceduralRecordGenerator {
    source: Box<dyn DeliberationSource>,
    store: Box<dyn ProceduralRecordStore>,
}

impl ProceduralRecordGenerator {
    /// Construct a generator reading from `source` and writing to
    /// `store`.
    pub fn new(source: Box<dyn DeliberationSource>, store: Box<dyn ProceduralRecordStore>) -> Self {
        Self { source, store }
    }

    /// Generate, seal, sign, and store a record for `deliberation_id`.
    pub async fn generate(&self, deliberation_id: DeliberationId, signer: &dyn Signer) -> VigilResult<ProceduralRecord> {
        let agenda_items = self.source.agenda_items(deliberation_id).await?;
        let participant_ids = self.source.participant_ids(deliberation_id).await?;
        let vote_summary = self.source.vote_summary(deliberation_id).await?;
        let mut timeline_events = self.source.timeline(deliberation_id).await?;
        let decisions = self.source.decisions(deliberation_id).await?;

        if !timeline_events.windows(2).all(|w| w[0].at <= w[1].at) {
            tracing::warn!(%deliberation_id, "timeline from deliberation source was not chronologically ordered, sorting defensively");
            timeline_events.sort_by_key(|e| e.at);
        }

        let canonical = ProceduralRecord::canonical(
            deliberation_id,
            &agenda_items,
            &participant_ids,
            &vote_summary,
            &timeline_events,
            &decisions,
        );
        let record_hash = vigil_canon::canonical_hash(&canonical)?;
        let signature = signer.sign(record_hash.as_bytes())?;

        let record = ProceduralRecord {
            record_id: uuid::Uuid::new_v4(),
            deliberation_id,
            agenda_items,
            participant_ids,
            vote_summary,
            timeline_events,
            decisions,
            record_hash,
            signature,
        };

        self.store.insert(record.clone()).await?;
        Ok(record)
    }

    /// Recompute `record_hash` from the stored record and confirm the
    /// signature verifies against `public_key`.
    pub async fn verify(&self, record_id: uuid::Uuid, public_key: &[u8; 32]) -> VigilResult<bool> {
        let Some(record) = self.store.get(record_id).await? else {
            return Err(VigilError::NotFound(format!("procedural record {record_id}")));
        };
        let canonical = ProceduralRecord::canonical(
            record.deliberation_id,
            &record.agenda_items,
            &record.participant_ids,
            &record.vote_summary,
            &record.timeline_events,
            &record.decisions,
        );
        let recomputed = vigil_canon::canonical_hash(&canonical)?;
        if recomputed != record.record_hash {
            return Ok(false);
        }
        Ok(vigil_ledger::verify_signature(public_key, record.record_hash.as_bytes(), &record.signature).is_ok())
    }
}
