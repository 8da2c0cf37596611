#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **vigil-worker** – The cooperative job worker and the dead-letter
//! queue alert monitor (§4.M, §4.N).

pub mod dlq_monitor;
pub mod worker;

pub use dlq_monitor::{DlqAlert, DlqAlertMonitor, DlqAlertSink, DEFAULT_DLQ_POLL_INTERVAL};
pub use worker::{JobHandler, JobWorker, JobWorkerConfig, DEFAULT_BATCH_SIZE, DEFAULT_POLL_INTERVAL, DEFAULT_STOP_GRACE_PERIOD};
