#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **vigil-certify** – Result certification and procedural-record
//! generation, behind a halt-checked service façade (§4.I, §4.J, §4.K).

pub mod certifier;
pub mod procedural_record;
pub mod service;

pub use certifier::{CertificationResult, CertificationStore, InMemoryCertificationStore, ResultCertifier};
pub use procedural_record::{
    DeliberationSource, InMemoryProceduralRecordStore, ProceduralRecord, ProceduralRecordGenerator,
    ProceduralRecordStore, TimelineEvent,
};
pub use service::CertificationService;
