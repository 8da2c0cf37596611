#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **vigil-guard** – Structural-prohibition primitives: permanent
//! contact blocks (§4.O) and append-only contribution preservation
//! (§4.Q). Both ports forbid a destructive operation by never defining
//! a method for it, not by guarding one at runtime.

pub mod contact_prevention;
pub mod contribution_preservation;

pub use contact_prevention::{BlockStatus, ContactAttempt, ContactBlock, ContactGuard, InMemoryContactGuard};
pub use contribution_preservation::{ContributionGuard, ContributionRecord, InMemoryContributionGuard};
