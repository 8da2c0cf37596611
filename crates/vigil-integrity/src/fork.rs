//! Fork detection (§4.F, pure) and signed fork signals (§6 wire format).

use chrono::Utc;
use vigil_canon::{canonical_hash, CanonValue};
use vigil_ledger::{Event, Signer};
use vigil_types::{EventId, Timestamp, VigilResult};

/// The payload describing a detected fork (§3 Fork detection payload).
#[derive(Debug, Clone, PartialEq)]
pub struct ForkPayload {
    /// The two (or more) events sharing `prev_hash` but disagreeing on
    /// `content_hash`. Always exactly two in this implementation — §4.F
    /// early-exits on the first conflicting pair found.
    pub conflicting_event_ids: [EventId; 2],
    /// The shared predecessor hash.
    pub prev_hash: String,
    /// The disagreeing content hashes, same order as
    /// `conflicting_event_ids`.
    pub content_hashes: [String; 2],
    /// When detection ran.
    pub detection_timestamp: Timestamp,
    /// Identity of the service that ran detection.
    pub detecting_service_id: String,
}

impl ForkPayload {
    /// Canonical form used both for hashing/signing and for the §6
    /// wire format: conflicting ids and content hashes are sorted
    /// lexicographically before encoding, independent of detection
    /// order.
    pub fn canonical(&self) -> CanonValue {
        let mut ids = self.conflicting_event_ids;
        ids.sort();
        let mut hashes = self.content_hashes.clone();
        hashes.sort();

        CanonValue::map([
            ("prev_hash", CanonValue::Str(self.prev_hash.clone())),
            (
                "conflicting_event_ids",
                CanonValue::Seq(ids.into_iter().map(CanonValue::Uuid).collect()),
            ),
            (
                "content_hashes",
                CanonValue::Seq(hashes.into_iter().map(CanonValue::Str).collect()),
            ),
            ("detection_timestamp", CanonValue::Timestamp(self.detection_timestamp)),
            ("detecting_service_id", CanonValue::Str(self.detecting_service_id.clone())),
        ])
    }
}

/// A fork signal a service has signed and may safely publish to
/// external observers (§6 Signed fork signal).
#[derive(Debug, Clone)]
pub struct SignedForkSignal {
    /// The detected payload.
    pub payload: ForkPayload,
    /// Signature over the payload's canonical bytes.
    pub signature: Vec<u8>,
    /// Key id that produced `signature`.
    pub signing_key_id: String,
    /// Version of the signature scheme, for forward compatibility.
    pub signature_algorithm_version: u32,
}

/// Current signal scheme version.
pub const SIGNATURE_ALGORITHM_VERSION: u32 = 1;

/// Sign `payload` with `signer`, producing a publishable
/// [`SignedForkSignal`].
pub fn sign_fork_payload(payload: ForkPayload, signer: &dyn Signer) -> VigilResult<SignedForkSignal> {
    let bytes = vigil_canon::canonicalize(&payload.canonical())?;
    let signature = signer.sign(&bytes)?;
    Ok(SignedForkSignal {
        payload,
        signature,
        signing_key_id: signer.key_id().clone(),
        signature_algorithm_version: SIGNATURE_ALGORITHM_VERSION,
    })
}

/// Verify a [`SignedForkSignal`]'s signature against `public_key`.
pub fn verify_fork_signal(signal: &SignedForkSignal, public_key: &[u8; 32]) -> VigilResult<()> {
    let bytes = vigil_canon::canonicalize(&signal.payload.canonical())?;
    vigil_ledger::verify_signature(public_key, &bytes, &signal.signature)
}

/// Detect a fork among `events` (§4.F).
///
/// Groups events by `prev_hash`; returns the first group containing two
/// events with distinct `content_hash`. Same `prev_hash` and same
/// `content_hash` is treated as a harmless duplicate, not a fork.
/// Deterministic tie-break: the lexicographically smaller `event_id`
/// is placed first.
pub fn detect_fork(events: &[Event], detecting_service_id: &str) -> Option<ForkPayload> {
    use std::collections::HashMap;

    let mut by_prev: HashMap<&str, Vec<&Event>> = HashMap::new();
    for event in events {
        by_prev.entry(event.prev_hash.as_str()).or_default().push(event);
    }

    for (prev_hash, group) in by_prev {
        for i in 0..group.len() {
            for j in (i + 1)..group.len() {
                let (a, b) = (group[i], group[j]);
                if a.content_hash != b.content_hash {
                    let (first, second) = if a.event_id <= b.event_id { (a, b) } else { (b, a) };
                    return Some(ForkPayload {
                        conflicting_event_ids: [first.event_id, second.event_id],
                        prev_hash: prev_hash.to_string(),
                        content_hashes: [first.content_hash.clone(), second.content_hash.clone()],
                        detection_timestamp: Utc::now(),
                        detecting_service_id: detecting_service_id.to_string(),
                    });
                }
            }
        }
    }
    None
}

/// Recompute `canonical_hash` over a fork payload; exposed for tests
/// and for verification flows that need the content hash rather than a
/// signature.
pub fn fork_payload_hash(payload: &ForkPayload) -> VigilResult<String> {
    canonical_hash(&payload.canonical())
}
