//! Result certifier (§4.I): canonical-hash a deliberation's result
//! content, sign it, and store the certification tuple.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use vigil_canon::CanonValue;
use vigil_ledger::Signer;
use vigil_types::{DeliberationId, Timestamp, VigilError, VigilResult};

/// A certified deliberation result (§3 Certification result).
#[derive(Debug, Clone, PartialEq)]
pub struct CertificationResult {
    /// Unique identifier for this certification.
    pub result_id: uuid::Uuid,
    /// The deliberation this result belongs to.
    pub deliberation_id: DeliberationId,
    /// SHA-256 of the canonical serialization of `result_content` alone.
    pub result_hash: String,
    /// Number of deliberation participants.
    pub participant_count: u32,
    /// When certification occurred.
    pub certification_timestamp: Timestamp,
    /// Key id used to sign.
    pub certification_key_id: String,
    /// Signature over `result_hash`.
    pub certification_signature: Vec<u8>,
    /// Application-defined result type (e.g. `"petition_outcome"`).
    pub result_type: String,
}

/// Durable store for [`CertificationResult`]s.
#[async_trait]
pub trait CertificationStore: Send + Sync {
    /// Persist a new certification.
    async fn insert(&self, result: CertificationResult) -> VigilResult<()>;

    /// Look up by deliberation id.
    async fn get_by_deliberation(&self, deliberation_id: DeliberationId) -> VigilResult<Option<CertificationResult>>;

    /// Look up by result id.
    async fn get_by_result_id(&self, result_id: uuid::Uuid) -> VigilResult<Option<CertificationResult>>;
}

/// In-memory certification store.
#[derive(Default)]
pub struct InMemoryCertificationStore {
    results: RwLock<Vec<CertificationResult>>,
}

impl InMemoryCertificationStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CertificationStore for InMemoryCertificationStore {
    async fn insert(&self, result: CertificationResult) -> VigilResult<()> {
        self.results.write().push(result);
        Ok(())
    }

    async fn get_by_deliberation(&self, deliberation_id: DeliberationId) -> VigilResult<Option<CertificationResult>> {
        Ok(self.results.read().iter().find(|r| r.deliberation_id == deliberation_id).cloned())
    }

    async fn get_by_result_id(&self, result_id: uuid::Uuid) -> VigilResult<Option<CertificationResult>> {
        Ok(self.results.read().iter().find(|r| r.result_id == result_id).cloned())
    }
}

/// Certifies deliberation results (§4.I).
pub struct ResultCertifier {
    store: Box<dyn CertificationStore>,
}

impl ResultCertifier {
    /// Construct a certifier backed by `store`.
    pub fn new(store: Box<dyn CertificationStore>) -> Self {
        Self { store }
    }

    /// Certify `result_content` for `deliberation_id`: canonicalize,
    /// hash, sign, store, return.
    pub async fn certify(
        &self,
        deliberation_id: DeliberationId,
        result_content: &CanonValue,
        participant_count: u32,
        result_type: &str,
        signer: &dyn Signer,
    ) -> VigilResult<CertificationResult> {
        let result_hash = vigil_canon::canonical_hash(result_content)?;
        let signature = signer.sign(result_hash.as_bytes())?;

        let result = CertificationResult {
            result_id: uuid::Uuid::new_v4(),
            deliberation_id,
            result_hash,
            participant_count,
            certification_timestamp: Utc::now(),
            certification_key_id: signer.key_id().clone(),
            certification_signature: signature,
            result_type: result_type.to_string(),
        };

        self.store.insert(result.clone()).await?;
        Ok(result)
    }

    /// Verify that `signature` matches the stored certification for
    /// `result_id` *and* that re-deriving the hash from `result_content`
    /// reproduces the stored `result_hash`.
    pub async fn verify(
        &self,
        result_id: uuid::Uuid,
        result_content: &CanonValue,
        signature: &[u8],
        public_key: &[u8; 32],
    ) -> VigilResult<bool> {
        let Some(stored) = self.store.get_by_result_id(result_id).await? else {
            return Err(VigilError::NotFound(format!("certification {result_id}")));
        };
        if stored.certification_signature != signature {
            return Ok(false);
        }
        let recomputed = vigil_canon::canonical_hash(result_content)?;
        if recomputed != stored.result_hash {
            return Ok(false);
        }
        Ok(vigil_ledger::verify_signature(public_key, stored.result_hash.as_bytes(), signature).is_ok())
    }

    /// Look up by deliberation id.
    pub async fn get_by_deliberation(&self, deliberation_id: DeliberationId) -> VigilResult<Option<CertificationResult>> {
        self.store.get_by_deliberation(deliberation_id).await
    }

    /// Look up by result id.
    pub async fn get_by_result_id(&self, result_id: uuid::Uuid) -> VigilResult<Option<CertificationResult>> {
        self.store.get_by_result_id(result_id).await
    }
}
