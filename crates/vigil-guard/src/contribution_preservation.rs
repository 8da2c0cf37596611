//! Contribution preservation (§4.Q): mark-as-preserved is flag-only.
//! There is no delete and no scrub method anywhere in this module —
//! the same structural-prohibition idiom as [`crate::contact_prevention`].

use async_trait::async_trait;
use parking_lot::RwLock;
use vigil_types::{Timestamp, VigilResult};

/// A contribution record tracked for a cluster. `preserved_at` is the
/// only field this module ever writes after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct ContributionRecord {
    /// Unique identifier.
    pub record_id: uuid::Uuid,
    /// The cluster this contribution belongs to.
    pub cluster_id: String,
    /// Opaque content reference; this module never reads or alters it.
    pub content_ref: String,
    /// When the record was created.
    pub created_at: Timestamp,
    /// Set by [`ContributionGuard::mark_preserved`]; `None` until then.
    pub preserved_at: Option<Timestamp>,
}

/// The contribution-preservation port (§4.Q). `mark_preserved` is the
/// only mutating method this trait defines.
#[async_trait]
pub trait ContributionGuard: Send + Sync {
    /// Register a new contribution record, unpreserved.
    async fn register(&self, cluster_id: &str, content_ref: &str, created_at: Timestamp) -> VigilResult<ContributionRecord>;

    /// Set `preserved_at` on an existing record without altering any
    /// other field. No-op (not an error) if already preserved.
    async fn mark_preserved(&self, record_id: uuid::Uuid, at: Timestamp) -> VigilResult<()>;

    /// All records for `cluster_id`, preserved or not.
    async fn get_for_cluster(&self, cluster_id: &str) -> VigilResult<Vec<ContributionRecord>>;

    /// All records with `preserved_at != None`.
    async fn get_preserved(&self) -> VigilResult<Vec<ContributionRecord>>;
}

/// In-memory contribution guard.
#[derive(Default)]
pub struct InMemoryContributionGuard {
    records: RwLock<Vec<ContributionRecord>>,
}

impl InMemoryContributionGuard {
    /// Construct a guard with no records.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContributionGuard for InMemoryContributionGuard {
    async fn register(&self, cluster_id: &str, content_ref: &str, created_at: Timestamp) -> VigilResult<ContributionRecord> {
        let record = ContributionRecord {
            record_id: uuid::Uuid::new_v4(),
            cluster_id: cluster_id.to_string(),
            content_ref: content_ref.to_string(),
            created_at,
            preserved_at: None,
        };
        self.records.write().push(record.clone());
        Ok(record)
    }

    async fn mark_preserved(&self, record_id: uuid::Uuid, at: Timestamp) -> VigilResult<()> {
        let mut records = self.records.write();
        if let Some(record) = records.iter_mut().find(|r| r.record_id == record_id) {
            if record.preserved_at.is_none() {
                record.preserved_at = Some(at);
            }
        }
        Ok(())
    }

    async fn get_for_cluster(&self, cluster_id: &str) -> VigilResult<Vec<ContributionRecord>> {
        Ok(self.records.read().iter().filter(|r| r.cluster_id == cluster_id).cloned().collect())
    }

    async fn get_preserved(&self) -> VigilResult<Vec<ContributionRecord>> {
        Ok(self.records.read().iter().filter(|r| r.preserved_at.is_some()).cloned().collect())
    }
}
