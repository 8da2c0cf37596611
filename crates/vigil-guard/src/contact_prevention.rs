//! Contact-prevention primitives (§4.O): a structural-prohibition
//! exemplar. Permanence is enforced by never defining an unblock
//! method, not by a runtime check guarding one. There is no `remove_block`,
//! no `set_status`, no way to mutate a block after it is created —
//! the trait simply has no such member, so the prohibition holds at
//! compile time for every implementation, present and future.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use vigil_types::{Timestamp, VigilResult};

/// A cluster's block status. `PermanentlyBlocked` is the only variant
/// that exists — there is no `Unblocked` to transition to, so the type
/// itself rules out un-blocking, independent of any check in the code
/// that uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// The only status a [`ContactBlock`] can ever hold.
    PermanentlyBlocked,
}

/// A permanent contact block (§3 Contact block).
#[derive(Debug, Clone, PartialEq)]
pub struct ContactBlock {
    /// Unique identifier.
    pub block_id: uuid::Uuid,
    /// The blocked cluster.
    pub cluster_id: String,
    /// When the block was created.
    pub blocked_at: Timestamp,
    /// Why the block was created.
    pub reason: String,
    /// Always [`BlockStatus::PermanentlyBlocked`].
    pub status: BlockStatus,
}

/// A recorded attempt to contact a (possibly blocked) cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactAttempt {
    /// Unique identifier.
    pub attempt_id: uuid::Uuid,
    /// The cluster that was the target of the attempt.
    pub cluster_id: String,
    /// When the attempt was recorded.
    pub attempted_at: Timestamp,
    /// Whether `cluster_id` was blocked at the time of the attempt.
    pub blocked: bool,
}

/// The contact-prevention port (§4.O). Exposes exactly these five
/// methods on both the trait and every implementation — nothing else.
/// Adding a sixth method here that could remove or weaken a block
/// would be the defect, not an omission to fix.
#[async_trait]
pub trait ContactGuard: Send + Sync {
    /// Create a permanent block on `cluster_id`.
    async fn add_block(&self, cluster_id: &str, reason: &str) -> VigilResult<ContactBlock>;

    /// Whether `cluster_id` currently has a block.
    async fn is_blocked(&self, cluster_id: &str) -> VigilResult<bool>;

    /// The block on `cluster_id`, if any.
    async fn get_block(&self, cluster_id: &str) -> VigilResult<Option<ContactBlock>>;

    /// All blocks ever created.
    async fn get_all_blocked(&self) -> VigilResult<Vec<ContactBlock>>;

    /// Record an attempt to contact `cluster_id`. `blocked` is derived
    /// from the current block state, not supplied by the caller.
    async fn record_contact_attempt(&self, cluster_id: &str) -> VigilResult<ContactAttempt>;
}

/// In-memory contact guard.
#[derive(Default)]
pub struct InMemoryContactGuard {
    blocks: RwLock<Vec<ContactBlock>>,
    attempts: RwLock<Vec<ContactAttempt>>,
}

impl InMemoryContactGuard {
    /// Construct a guard with no blocks.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContactGuard for InMemoryContactGuard {
    async fn add_block(&self, cluster_id: &str, reason: &str) -> VigilResult<ContactBlock> {
        let block = ContactBlock {
            block_id: uuid::Uuid::new_v4(),
            cluster_id: cluster_id.to_string(),
            blocked_at: Utc::now(),
            reason: reason.to_string(),
            status: BlockStatus::PermanentlyBlocked,
        };
        self.blocks.write().push(block.clone());
        Ok(block)
    }

    async fn is_blocked(&self, cluster_id: &str) -> VigilResult<bool> {
        Ok(self.blocks.read().iter().any(|b| b.cluster_id == cluster_id))
    }

    async fn get_block(&self, cluster_id: &str) -> VigilResult<Option<ContactBlock>> {
        Ok(self.blocks.read().iter().find(|b| b.cluster_id == cluster_id).cloned())
    }

    async fn get_all_blocked(&self) -> VigilResult<Vec<ContactBlock>> {
        Ok(self.blocks.read().clone())
    }

    async fn record_contact_attempt(&self, cluster_id: &str) -> VigilResult<ContactAttempt> {
        let blocked = self.is_blocked(cluster_id).await?;
        let attempt = ContactAttempt {
            attempt_id: uuid::Uuid::new_v4(),
            cluster_id: cluster_id.to_string(),
            attempted_at: Utc::now(),
            blocked,
        };
        self.attempts.write().push(attempt.clone());
        Ok(attempt)
    }
}
