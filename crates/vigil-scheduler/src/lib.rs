#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **vigil-scheduler** – The deadline-driven job scheduler and its
//! dead-letter queue (§4.L).

pub mod job;
pub mod sqlite_scheduler;

pub use job::{DeadLetterRecord, InMemoryJobScheduler, JobScheduler, JobStatus, ScheduledJob};
pub use sqlite_scheduler::SqliteJobScheduler;
