#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **vigil-halt** – The sticky, dual-channel halt state and the
//! witnessed-halt writer (§4.D, §4.E). Every writing component in the
//! kernel depends on [`HaltChecker`]; nothing depends on the concrete
//! [`HaltState`] directly.

pub mod sqlite_halt_store;
pub mod state;
pub mod witnessed_writer;

pub use sqlite_halt_store::SqliteHaltStore;
pub use state::{DurableHaltStore, HaltChecker, HaltRecord, HaltState, InMemoryDurableHaltStore, RECOVERY_EVENT_TYPE};
pub use witnessed_writer::{InMemoryUnwitnessedHaltStore, UnwitnessedHalt, UnwitnessedHaltStore, WitnessedHaltWriter, WriteOutcome};
