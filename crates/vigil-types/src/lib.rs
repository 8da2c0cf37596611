#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **vigil-types** – Shared identifiers and error taxonomy for the Vigil
//! constitutional kernel.
//!
//! This crate sits at the bottom of the dependency graph: it makes no
//! assumptions about storage, cryptography, or I/O so that every other
//! crate in the workspace can depend on it without risk of a cycle.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifier for an event in the append-only ledger.
pub type EventId = Uuid;

/// Identifier for an agent (or system service) participating in the
/// platform. System agents use the reserved `SYSTEM:<name>` form; see
/// [`is_system_agent`].
pub type AgentId = String;

/// Identifier for a specific signing key belonging to an [`AgentId`].
pub type KeyId = String;

/// Identifier for a deliberation / decision process.
pub type DeliberationId = Uuid;

/// Returns true if `agent_id` uses the reserved system-agent prefix.
pub fn is_system_agent(agent_id: &str) -> bool {
    agent_id.starts_with("SYSTEM:")
}

/// Wall-clock timestamp, always UTC.
pub type Timestamp = DateTime<Utc>;

/// The maximum number of attempts a scheduled job is given before it is
/// moved to the dead-letter queue (§3 Scheduled job).
pub const MAX_JOB_ATTEMPTS: i32 = 3;

/// Mandatory waiting period between halt onset and the earliest legal
/// recovery attempt (§3 Halt state).
pub const RECOVERY_WAITING_PERIOD: Duration = Duration::from_secs(48 * 3600);

/// Per-source sliding-window threshold for fork-signal rate limiting
/// (§4.G, §4.P).
pub const FORK_SIGNAL_RATE_LIMIT: u32 = 3;

/// Sliding window over which [`FORK_SIGNAL_RATE_LIMIT`] is enforced.
pub const FORK_SIGNAL_RATE_WINDOW: Duration = Duration::from_secs(3600);

/// Minimum permitted interval between fork-monitor poll cycles (§4.G: "at
/// least every 10 seconds").
pub const FORK_MONITOR_MIN_INTERVAL: Duration = Duration::from_secs(10);

/// The well-known `prev_hash` value used by the first event in a ledger
/// partition (§3 Event, invariant i).
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Stable error taxonomy shared across the kernel (§7).
///
/// Every variant's `Display` implementation embeds the identifier quoted
/// in spec.md verbatim so operators can grep logs for it. Variants are
/// grouped by the propagation policy spec.md assigns them: halt and
/// constitutional-violation errors are always surfaced unchanged and are
/// never retried by kernel code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VigilError {
    /// CT-11: a write was rejected because the platform is halted. Never
    /// retried internally.
    #[error("CT-11: System is halted{}", reason.as_ref().map(|r| format!(" ({r})")).unwrap_or_default())]
    Halted {
        /// The recorded halt reason, if one was set.
        reason: Option<String>,
    },

    /// FR26: an attempt was made to suppress or bypass witnessing of an
    /// event.
    #[error("FR26: witnessing suppression attempted: {0}")]
    WitnessSuppressed(String),

    /// FR125: a recomputed content hash did not match the stored value.
    #[error("FR125: hash mismatch: {0}")]
    HashMismatch(String),

    /// FR124: the hash chain is broken (`prev_hash` does not match the
    /// previous event's `content_hash`).
    #[error("FR124: hash chain broken: {0}")]
    HashChainBroken(String),

    /// FR123: a fork was detected (two events share `prev_hash` but carry
    /// distinct `content_hash`).
    #[error("FR123: fork detected: {0}")]
    ForkDetected(String),

    /// CT-12: an event could not be proven witnessed.
    #[error("CT-12: unwitnessed write: {0}")]
    Unwitnessed(String),

    /// FR-1.4: intake capacity has been exceeded.
    #[error("FR-1.4: queue overflow: {0}")]
    QueueOverflow(String),

    /// FR85: a sliding-window rate limit was exceeded.
    #[error("FR85: rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds the caller should wait before retrying.
        retry_after_secs: u64,
    },

    /// FR-2: structural or semantic input validation failed.
    #[error("FR-2: validation failed: {0}")]
    Validation(String),

    /// FR-3: the requested entity does not exist.
    #[error("FR-3: not found: {0}")]
    NotFound(String),

    /// FR-4: a state precondition was violated (already exists, already
    /// deactivated, already claimed, …).
    #[error("FR-4: conflict: {0}")]
    Conflict(String),

    /// FR-5: a transient I/O, network, database, or signer failure.
    #[error("FR-5: transient failure: {0}")]
    Transient(String),
}

impl VigilError {
    /// True for the error classes spec.md §7 forbids any internal retry
    /// of (halt, constitutional violation, rate limit).
    pub fn is_non_retryable(&self) -> bool {
        matches!(
            self,
            VigilError::Halted { .. }
                | VigilError::WitnessSuppressed(_)
                | VigilError::HashMismatch(_)
                | VigilError::HashChainBroken(_)
                | VigilError::ForkDetected(_)
                | VigilError::Unwitnessed(_)
                | VigilError::RateLimited { .. }
        )
    }
}

/// Crate-wide result alias.
pub type VigilResult<T> = Result<T, VigilError>;

/// A value whose mere existence proves its holder observed
/// `is_halted() == false` at the instant of construction.
///
/// Every function that writes to the ledger, scheduler, or certification
/// store takes a `HaltToken` by value. The token carries no data and has
/// no public constructor outside the `vigil-halt` crate — "forgot to
/// check halt" is therefore unrepresentable at the type level (§5).
#[derive(Debug, Clone, Copy)]
pub struct HaltToken {
    _private: (),
}

impl HaltToken {
    /// Construct a token. Restricted to crates that implement the actual
    /// halt check (`vigil-halt`); downstream code can only obtain a
    /// `HaltToken` by calling through that crate's halt checker.
    #[doc(hidden)]
    pub fn new_unchecked() -> Self {
        Self { _private: () }
    }
}

/// Severity levels used by the DLQ alert monitor (§4.N).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSeverity {
    /// Queue is empty.
    Ok,
    /// `0 < depth < 10`.
    Warning,
    /// `depth >= 10`.
    Critical,
}

impl AlertSeverity {
    /// Classify a DLQ depth per the thresholds in §4.N.
    pub fn from_depth(depth: u64) -> Self {
        match depth {
            0 => AlertSeverity::Ok,
            1..=9 => AlertSeverity::Warning,
            _ => AlertSeverity::Critical,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_agent_prefix() {
        assert!(is_system_agent("SYSTEM:fork-monitor"));
        assert!(!is_system_agent("agent-42"));
    }

    #[test]
    fn error_messages_embed_identifiers() {
        assert!(VigilError::Halted { reason: None }.to_string().contains("CT-11"));
        assert!(VigilError::WitnessSuppressed("x".into()).to_string().contains("FR26"));
        assert!(VigilError::HashMismatch("x".into()).to_string().contains("FR125"));
        assert!(VigilError::QueueOverflow("x".into()).to_string().contains("FR-1.4"));
    }

    #[test]
    fn severity_thresholds() {
        assert_eq!(AlertSeverity::from_depth(0), AlertSeverity::Ok);
        assert_eq!(AlertSeverity::from_depth(5), AlertSeverity::Warning);
        assert_eq!(AlertSeverity::from_depth(10), AlertSeverity::Critical);
    }
}
