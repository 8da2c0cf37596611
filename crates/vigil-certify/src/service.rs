//! Certification service façade (§4.K): the halt-checked entry point
//! collaborators actually call. Wraps [`ResultCertifier`] and
//! [`ProceduralRecordGenerator`] behind a single halt discipline — every
//! write path refuses immediately (and never retries) while the system
//! is halted; read paths proceed regardless.

use vigil_canon::CanonValue;
use vigil_halt::HaltChecker;
use vigil_ledger::Signer;
use vigil_types::{DeliberationId, VigilResult};

use crate::certifier::{CertificationResult, ResultCertifier};
use crate::procedural_record::{ProceduralRecord, ProceduralRecordGenerator};

/// Halt-checked façade over certification and procedural-record
/// generation (§4.K).
pub struct CertificationService<H: HaltChecker> {
    certifier: ResultCertifier,
    records: ProceduralRecordGenerator,
    halt: std::sync::Arc<H>,
}

impl<H: HaltChecker> CertificationService<H> {
    /// Construct a service wrapping `certifier` and `records`, checking
    /// `halt` before every write.
    pub fn new(certifier: ResultCertifier, records: ProceduralRecordGenerator, halt: std::sync::Arc<H>) -> Self {
        Self { certifier, records, halt }
    }

    /// Certify a deliberation result. Fails immediately with
    /// [`vigil_types::VigilError::Halted`] if the system is halted;
    /// never retries internally.
    pub async fn certify_result(
        &self,
        deliberation_id: DeliberationId,
        result_content: &CanonValue,
        participant_count: u32,
        result_type: &str,
        signer: &dyn Signer,
    ) -> VigilResult<CertificationResult> {
        let _token = self.halt.check()?;
        self.certifier
            .certify(deliberation_id, result_content, participant_count, result_type, signer)
            .await
    }

    /// Generate a procedural record. Halt-checked the same way as
    /// [`Self::certify_result`].
    pub async fn generate_record(
        &self,
        deliberation_id: DeliberationId,
        signer: &dyn Signer,
    ) -> VigilResult<ProceduralRecord> {
        let _token = self.halt.check()?;
        self.records.generate(deliberation_id, signer).await
    }

    /// Read-only: fetch a certification by deliberation id. Proceeds
    /// even while halted, since reads don't create new constitutional
    /// state.
    pub async fn get_certification(&self, deliberation_id: DeliberationId) -> VigilResult<Option<CertificationResult>> {
        self.certifier.get_by_deliberation(deliberation_id).await
    }

    /// Read-only: verify a stored certification against `result_content`.
    pub async fn verify_certification(
        &self,
        result_id: uuid::Uuid,
        result_content: &CanonValue,
        signature: &[u8],
        public_key: &[u8; 32],
    ) -> VigilResult<bool> {
        self.certifier.verify(result_id, result_content, signature, public_key).await
    }

    /// Read-only: verify a stored procedural record's signature.
    pub async fn verify_record(&self, record_id: uuid::Uuid, public_key: &[u8; 32]) -> VigilResult<bool> {
        self.records.verify(record_id, public_key).await
    }
}
