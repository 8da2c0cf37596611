#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **vigil-ledger** – Agent-key registry and the signed, witnessed,
//! hash-chained event ledger at the base of the Vigil constitutional
//! kernel (§4.B, §4.C).
//!
//! Every other component that needs durable, tamper-evident state
//! (halt, scheduler, certification, integrity monitoring) writes
//! through [`chain::LedgerChain`] rather than owning its own store.

pub mod chain;
pub mod keyring;
pub mod signing;
pub mod sqlite_store;
pub mod store;

pub use chain::{DecliningWitness, Event, KeyedWitness, LedgerChain, Witness};
pub use keyring::{AgentKey, InMemoryKeyRegistry, KeyRegistry, NewAgentKey};
pub use signing::{verify_signature, KeypairSigner, Signer};
pub use sqlite_store::SqliteLedgerStore;
pub use store::{InMemoryLedgerStore, LedgerStore};
