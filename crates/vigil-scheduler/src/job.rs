//! Job scheduler (§4.L): persist, claim, complete, retry, or dead-letter
//! scheduled jobs.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use vigil_types::{Timestamp, VigilError, VigilResult, MAX_JOB_ATTEMPTS};

/// A scheduled job's lifecycle state (§3 Scheduled job state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker, not yet resolved.
    Processing,
    /// Ran to completion.
    Completed,
    /// Retryable failure recorded; status resets to `Pending` unless
    /// `attempts` has reached [`MAX_JOB_ATTEMPTS`].
    Failed,
}

/// A scheduled job (§3 Scheduled job).
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledJob {
    /// Unique identifier.
    pub id: uuid::Uuid,
    /// Dispatch key the worker uses to pick a handler.
    pub job_type: String,
    /// Opaque handler input.
    pub payload: serde_json::Value,
    /// Timezone-aware instant the job becomes eligible to run.
    pub scheduled_for: Timestamp,
    /// When the job was first scheduled.
    pub created_at: Timestamp,
    /// Number of completed attempts so far.
    pub attempts: i32,
    /// When the most recent attempt concluded, if any.
    pub last_attempt_at: Option<Timestamp>,
    /// Current lifecycle state.
    pub status: JobStatus,
}

/// A dead-letter record (§3 Dead-letter record), created when a job
/// exhausts [`MAX_JOB_ATTEMPTS`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterRecord {
    /// Unique identifier of this dead-letter row.
    pub id: uuid::Uuid,
    /// The job id this row was created from.
    pub original_job_id: uuid::Uuid,
    /// The original job's dispatch key.
    pub job_type: String,
    /// The original job's payload.
    pub payload: serde_json::Value,
    /// The failure reason recorded on the final attempt.
    pub failure_reason: String,
    /// When the job was dead-lettered.
    pub failed_at: Timestamp,
    /// Total attempts made before dead-lettering.
    pub attempts: i32,
}

/// The job-scheduler port (§4.L). Claiming is the only mutation expected
/// to race under concurrent workers; every other transition is owned by
/// whichever caller already holds the job (a worker that just claimed
/// it).
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Schedule a new job. `run_at` must be timezone-aware; callers
    /// working from a naive timestamp should reject before calling this.
    async fn schedule(&self, job_type: &str, payload: serde_json::Value, run_at: Timestamp) -> VigilResult<uuid::Uuid>;

    /// Cancel a pending job. Returns `false` (not an error) if the job
    /// is unknown or no longer pending.
    async fn cancel(&self, job_id: uuid::Uuid) -> VigilResult<bool>;

    /// Up to `limit` pending jobs due at or before `now`, ordered by
    /// `scheduled_for` ascending.
    async fn get_pending(&self, limit: usize, now: Timestamp) -> VigilResult<Vec<ScheduledJob>>;

    /// Atomic compare-and-set `Pending -> Processing`. Returns `None` on
    /// lost contention or unknown id, never an error for that case.
    async fn claim(&self, job_id: uuid::Uuid) -> VigilResult<Option<ScheduledJob>>;

    /// `Processing -> Completed`. Errors if the job is unknown.
    async fn mark_completed(&self, job_id: uuid::Uuid) -> VigilResult<()>;

    /// Record a failed attempt. Increments `attempts` and sets
    /// `last_attempt_at`. If `attempts >= MAX_JOB_ATTEMPTS`, atomically
    /// moves the job to the dead-letter queue (insert DLQ row, delete
    /// job row) and returns the new record; otherwise resets the job to
    /// `Pending` for retry and returns `None`.
    async fn mark_failed(&self, job_id: uuid::Uuid, reason: &str) -> VigilResult<Option<DeadLetterRecord>>;

    /// A single job by id, regardless of status.
    async fn get_job(&self, job_id: uuid::Uuid) -> VigilResult<Option<ScheduledJob>>;

    /// Current dead-letter queue depth.
    async fn dlq_depth(&self) -> VigilResult<u64>;

    /// A page of dead-letter records, most recent first, plus the total
    /// row count across the whole queue (not just this page).
    async fn get_dlq(&self, limit: usize, offset: usize) -> VigilResult<(Vec<DeadLetterRecord>, u64)>;
}

/// In-memory job scheduler. Used by tests and single-process
/// deployments; `vigil-scheduler::sqlite_scheduler` provides the durable
/// equivalent.
#[derive(Default)]
pub struct InMemoryJobScheduler {
    jobs: Mutex<Vec<ScheduledJob>>,
    dlq: Mutex<Vec<DeadLetterRecord>>,
}

impl InMemoryJobScheduler {
    /// Construct an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobScheduler for InMemoryJobScheduler {
    async fn schedule(&self, job_type: &str, payload: serde_json::Value, run_at: Timestamp) -> VigilResult<uuid::Uuid> {
        let id = uuid::Uuid::new_v4();
        let job = ScheduledJob {
            id,
            job_type: job_type.to_string(),
            payload,
            scheduled_for: run_at,
            created_at: Utc::now(),
            attempts: 0,
            last_attempt_at: None,
            status: JobStatus::Pending,
        };
        self.jobs.lock().push(job);
        Ok(id)
    }

    async fn cancel(&self, job_id: uuid::Uuid) -> VigilResult<bool> {
        let mut jobs = self.jobs.lock();
        let Some(idx) = jobs.iter().position(|j| j.id == job_id && j.status == JobStatus::Pending) else {
            return Ok(false);
        };
        jobs.remove(idx);
        Ok(true)
    }

    async fn get_pending(&self, limit: usize, now: Timestamp) -> VigilResult<Vec<ScheduledJob>> {
        let jobs = self.jobs.lock();
        let mut due: Vec<ScheduledJob> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending && j.scheduled_for <= now)
            .cloned()
            .collect();
        due.sort_by_key(|j| j.scheduled_for);
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(&self, job_id: uuid::Uuid) -> VigilResult<Option<ScheduledJob>> {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Pending {
            return Ok(None);
        }
        job.status = JobStatus::Processing;
        Ok(Some(job.clone()))
    }

    async fn mark_completed(&self, job_id: uuid::Uuid) -> VigilResult<()> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| VigilError::NotFound(format!("job {job_id}")))?;
        job.status = JobStatus::Completed;
        Ok(())
    }

    async fn mark_failed(&self, job_id: uuid::Uuid, reason: &str) -> VigilResult<Option<DeadLetterRecord>> {
        let mut jobs = self.jobs.lock();
        let idx = jobs
            .iter()
            .position(|j| j.id == job_id)
            .ok_or_else(|| VigilError::NotFound(format!("job {job_id}")))?;

        jobs[idx].attempts += 1;
        jobs[idx].last_attempt_at = Some(Utc::now());

        if jobs[idx].attempts >= MAX_JOB_ATTEMPTS {
            let job = jobs.remove(idx);
            let record = DeadLetterRecord {
                id: uuid::Uuid::new_v4(),
                original_job_id: job.id,
                job_type: job.job_type,
                payload: job.payload,
                failure_reason: reason.to_string(),
                failed_at: Utc::now(),
                attempts: job.attempts,
            };
            drop(jobs);
            self.dlq.lock().push(record.clone());
            Ok(Some(record))
        } else {
            jobs[idx].status = JobStatus::Pending;
            Ok(None)
        }
    }

    async fn get_job(&self, job_id: uuid::Uuid) -> VigilResult<Option<ScheduledJob>> {
        Ok(self.jobs.lock().iter().find(|j| j.id == job_id).cloned())
    }

    async fn dlq_depth(&self) -> VigilResult<u64> {
        Ok(self.dlq.lock().len() as u64)
    }

    async fn get_dlq(&self, limit: usize, offset: usize) -> VigilResult<(Vec<DeadLetterRecord>, u64)> {
        let mut dlq = self.dlq.lock().clone();
        dlq.reverse();
        let total = dlq.len() as u64;
        let page = dlq.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }
}
