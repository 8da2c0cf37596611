//! Agent-key registry (§4.B): an append-only store of `(agent_id, key_id,
//! public_key, active_from, active_until)` tuples. No delete of any kind
//! exists; deactivation only narrows a key's `active_until`.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use vigil_types::{AgentId, KeyId, Timestamp, VigilError, VigilResult};

/// A registered agent signing key.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentKey {
    /// Internal row identifier.
    pub id: uuid::Uuid,
    /// Owning agent (or `SYSTEM:<name>` service).
    pub agent_id: AgentId,
    /// Unique key identifier.
    pub key_id: KeyId,
    /// 32-byte Ed25519 public key.
    pub public_key: [u8; 32],
    /// Start of the key's active interval (inclusive).
    pub active_from: Timestamp,
    /// End of the key's active interval (exclusive). `None` means active
    /// until further notice (`active_until = ∞`).
    pub active_until: Option<Timestamp>,
    /// Row creation time.
    pub created_at: Timestamp,
}

impl AgentKey {
    /// True if `at` falls within `[active_from, active_until)`.
    pub fn covers(&self, at: Timestamp) -> bool {
        at >= self.active_from && self.active_until.map_or(true, |until| at < until)
    }

    fn overlaps(&self, other_from: Timestamp, other_until: Option<Timestamp>) -> bool {
        let self_end = self.active_until.unwrap_or(far_future());
        let other_end = other_until.unwrap_or(far_future());
        self.active_from < other_end && other_from < self_end
    }
}

/// A sentinel timestamp standing in for "unbounded" (`active_until = ∞`)
/// when two intervals need to be compared numerically.
fn far_future() -> Timestamp {
    use chrono::TimeZone;
    chrono::Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap()
}

/// Parameters for registering a new key.
#[derive(Debug, Clone)]
pub struct NewAgentKey {
    /// Owning agent.
    pub agent_id: AgentId,
    /// Unique key identifier; `register` fails if already seen.
    pub key_id: KeyId,
    /// 32-byte Ed25519 public key.
    pub public_key: [u8; 32],
    /// Start of the active interval.
    pub active_from: Timestamp,
    /// End of the active interval, or `None` for unbounded.
    pub active_until: Option<Timestamp>,
    /// Optional predecessor key id to deactivate atomically at
    /// `active_from` as part of this registration (§SPEC_FULL 2, key
    /// rotation sugar). Not part of spec.md's core contract.
    pub rotates: Option<KeyId>,
}

/// Append-only agent-key registry contract (§4.B).
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    /// Register a new key. Fails with [`VigilError::Conflict`] if
    /// `key_id` already exists, or if `[active_from, active_until)`
    /// overlaps another active interval already registered for the same
    /// agent.
    async fn register(&self, key: NewAgentKey) -> VigilResult<AgentKey>;

    /// Narrow an existing key's `active_until` to `at`. Idempotent if the
    /// key is already deactivated at exactly `at`; conflicts if it was
    /// already deactivated at a different instant.
    async fn deactivate(&self, key_id: &str, at: Timestamp) -> VigilResult<()>;

    /// Look up a key by its unique id.
    async fn get_by_key_id(&self, key_id: &str) -> VigilResult<Option<AgentKey>>;

    /// Return the unique key for `agent_id` whose interval contains `at`,
    /// if any.
    async fn get_active_for_agent(&self, agent_id: &str, at: Timestamp) -> VigilResult<Option<AgentKey>>;

    /// True if `key_id` has ever been registered.
    async fn exists(&self, key_id: &str) -> VigilResult<bool>;
}

/// In-memory append-only key registry. Every registered key is retained
/// forever; `deactivate` only ever narrows `active_until`.
#[derive(Default)]
pub struct InMemoryKeyRegistry {
    keys: RwLock<HashMap<KeyId, AgentKey>>,
}

impl InMemoryKeyRegistry {
    /// Construct an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyRegistry for InMemoryKeyRegistry {
    async fn register(&self, key: NewAgentKey) -> VigilResult<AgentKey> {
        let record = {
            let mut keys = self.keys.write();

            if keys.contains_key(&key.key_id) {
                return Err(VigilError::Conflict(format!(
                    "key {} already exists",
                    key.key_id
                )));
            }

            for existing in keys.values() {
                if existing.agent_id == key.agent_id
                    && existing.overlaps(key.active_from, key.active_until)
                {
                    return Err(VigilError::Conflict(format!(
                        "key interval for agent {} overlaps existing key {}",
                        key.agent_id, existing.key_id
                    )));
                }
            }

            let now = chrono::Utc::now();
            let record = AgentKey {
                id: uuid::Uuid::new_v4(),
                agent_id: key.agent_id,
                key_id: key.key_id.clone(),
                public_key: key.public_key,
                active_from: key.active_from,
                active_until: key.active_until,
                created_at: now,
            };
            keys.insert(record.key_id.clone(), record.clone());
            record
        };

        if let Some(predecessor) = key.rotates {
            self.deactivate(&predecessor, key.active_from).await?;
        }

        Ok(record)
    }

    async fn deactivate(&self, key_id: &str, at: Timestamp) -> VigilResult<()> {
        let mut keys = self.keys.write();
        let Some(existing) = keys.get_mut(key_id) else {
            return Err(VigilError::NotFound(format!("key {key_id}")));
        };

        match existing.active_until {
            None => {
                existing.active_until = Some(at);
                Ok(())
            }
            Some(current) if current == at => Ok(()), // idempotent
            Some(_) => Err(VigilError::Conflict(format!(
                "key {key_id} already deactivated"
            ))),
        }
    }

    async fn get_by_key_id(&self, key_id: &str) -> VigilResult<Option<AgentKey>> {
        Ok(self.keys.read().get(key_id).cloned())
    }

    async fn get_active_for_agent(&self, agent_id: &str, at: Timestamp) -> VigilResult<Option<AgentKey>> {
        Ok(self
            .keys
            .read()
            .values()
            .find(|k| k.agent_id == agent_id && k.covers(at))
            .cloned())
    }

    async fn exists(&self, key_id: &str) -> VigilResult<bool> {
        Ok(self.keys.read().contains_key(key_id))
    }
}
