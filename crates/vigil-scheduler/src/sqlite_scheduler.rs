//! SQLite-backed durable job scheduler, grounded on the same migrated-
//! schema-plus-pool pattern as the ledger's sqlite store. Claim uses a
//! single `UPDATE ... WHERE status = 'pending'` statement so contention
//! is resolved by the database, not by an in-process lock.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use vigil_types::{Timestamp, VigilError, VigilResult, MAX_JOB_ATTEMPTS};

use crate::job::{DeadLetterRecord, JobScheduler, JobStatus, ScheduledJob};

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Processing => "processing",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
    }
}

fn parse_status(s: &str) -> VigilResult<JobStatus> {
    match s {
        "pending" => Ok(JobStatus::Pending),
        "processing" => Ok(JobStatus::Processing),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        other => Err(VigilError::Validation(format!("unknown job status {other}"))),
    }
}

/// Durable, SQLite-backed job scheduler (§4.L, §6 scheduled-job table).
pub struct SqliteJobScheduler {
    pool: SqlitePool,
}

impl SqliteJobScheduler {
    /// Open (creating if absent) a database file at `path` and run
    /// migrations.
    pub async fn open(path: &str) -> VigilResult<Self> {
        let url = format!("sqlite://{path}?mode=rwc");
        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| VigilError::Transient(format!("opening scheduler database: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Open a private in-memory database. Used by tests.
    pub async fn in_memory() -> VigilResult<Self> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(|e| VigilError::Transient(format!("opening in-memory scheduler database: {e}")))?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> VigilResult<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> VigilResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                scheduled_for TEXT NOT NULL,
                created_at TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                last_attempt_at TEXT,
                status TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Transient(format!("migrating scheduled_jobs schema: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_pending \
             ON scheduled_jobs(scheduled_for) WHERE status = 'pending'",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Transient(format!("creating pending index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dead_letter_jobs (
                id TEXT PRIMARY KEY,
                original_job_id TEXT NOT NULL,
                job_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                failure_reason TEXT NOT NULL,
                failed_at TEXT NOT NULL,
                attempts INTEGER NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Transient(format!("migrating dead_letter_jobs schema: {e}")))?;

        Ok(())
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> VigilResult<ScheduledJob> {
        let id: String = row.get("id");
        let payload: String = row.get("payload");
        let scheduled_for: String = row.get("scheduled_for");
        let created_at: String = row.get("created_at");
        let last_attempt_at: Option<String> = row.get("last_attempt_at");
        let status: String = row.get("status");

        Ok(ScheduledJob {
            id: id.parse().map_err(|e| VigilError::Validation(format!("stored job id is not a uuid: {e}")))?,
            job_type: row.get("job_type"),
            payload: serde_json::from_str(&payload).map_err(|e| VigilError::Validation(format!("stored payload is not valid json: {e}")))?,
            scheduled_for: parse_timestamp(&scheduled_for)?,
            created_at: parse_timestamp(&created_at)?,
            attempts: row.get::<i64, _>("attempts") as i32,
            last_attempt_at: last_attempt_at.map(|s| parse_timestamp(&s)).transpose()?,
            status: parse_status(&status)?,
        })
    }

    fn row_to_dlq(row: &sqlx::sqlite::SqliteRow) -> VigilResult<DeadLetterRecord> {
        let id: String = row.get("id");
        let original_job_id: String = row.get("original_job_id");
        let payload: String = row.get("payload");
        let failed_at: String = row.get("failed_at");

        Ok(DeadLetterRecord {
            id: id.parse().map_err(|e| VigilError::Validation(format!("stored dlq id is not a uuid: {e}")))?,
            original_job_id: original_job_id
                .parse()
                .map_err(|e| VigilError::Validation(format!("stored original_job_id is not a uuid: {e}")))?,
            job_type: row.get("job_type"),
            payload: serde_json::from_str(&payload).map_err(|e| VigilError::Validation(format!("stored dlq payload is not valid json: {e}")))?,
            failure_reason: row.get("failure_reason"),
            failed_at: parse_timestamp(&failed_at)?,
            attempts: row.get::<i64, _>("attempts") as i32,
        })
    }
}

fn parse_timestamp(s: &str) -> VigilResult<Timestamp> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| VigilError::Validation(format!("stored timestamp is invalid: {e}")))
}

#[async_trait]
impl JobScheduler for SqliteJobScheduler {
    async fn schedule(&self, job_type: &str, payload: serde_json::Value, run_at: Timestamp) -> VigilResult<uuid::Uuid> {
        let id = uuid::Uuid::new_v4();
        let payload_str = serde_json::to_string(&payload).map_err(|e| VigilError::Validation(format!("serializing payload: {e}")))?;
        sqlx::query(
            "INSERT INTO scheduled_jobs (id, job_type, payload, scheduled_for, created_at, attempts, last_attempt_at, status) \
             VALUES (?, ?, ?, ?, ?, 0, NULL, 'pending')",
        )
        .bind(id.to_string())
        .bind(job_type)
        .bind(payload_str)
        .bind(run_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Transient(format!("scheduling job: {e}")))?;
        Ok(id)
    }

    async fn cancel(&self, job_id: uuid::Uuid) -> VigilResult<bool> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = ? AND status = 'pending'")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| VigilError::Transient(format!("cancelling job: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_pending(&self, limit: usize, now: Timestamp) -> VigilResult<Vec<ScheduledJob>> {
        let rows = sqlx::query(
            "SELECT * FROM scheduled_jobs WHERE status = 'pending' AND scheduled_for <= ? \
             ORDER BY scheduled_for ASC LIMIT ?",
        )
        .bind(now.to_rfc3339())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| VigilError::Transient(format!("listing pending jobs: {e}")))?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn claim(&self, job_id: uuid::Uuid) -> VigilResult<Option<ScheduledJob>> {
        let result = sqlx::query("UPDATE scheduled_jobs SET status = 'processing' WHERE id = ? AND status = 'pending'")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| VigilError::Transient(format!("claiming job: {e}")))?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_job(job_id).await
    }

    async fn mark_completed(&self, job_id: uuid::Uuid) -> VigilResult<()> {
        let result = sqlx::query("UPDATE scheduled_jobs SET status = 'completed' WHERE id = ?")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| VigilError::Transient(format!("completing job: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(VigilError::NotFound(format!("job {job_id}")));
        }
        Ok(())
    }

    async fn mark_failed(&self, job_id: uuid::Uuid, reason: &str) -> VigilResult<Option<DeadLetterRecord>> {
        let mut job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| VigilError::NotFound(format!("job {job_id}")))?;
        job.attempts += 1;
        let now = Utc::now();

        if job.attempts >= MAX_JOB_ATTEMPTS {
            let record = DeadLetterRecord {
                id: uuid::Uuid::new_v4(),
                original_job_id: job.id,
                job_type: job.job_type.clone(),
                payload: job.payload.clone(),
                failure_reason: reason.to_string(),
                failed_at: now,
                attempts: job.attempts,
            };
            let payload_str = serde_json::to_string(&record.payload).map_err(|e| VigilError::Validation(format!("serializing dlq payload: {e}")))?;
            sqlx::query(
                "INSERT INTO dead_letter_jobs (id, original_job_id, job_type, payload, failure_reason, failed_at, attempts) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(record.id.to_string())
            .bind(record.original_job_id.to_string())
            .bind(&record.job_type)
            .bind(payload_str)
            .bind(&record.failure_reason)
            .bind(record.failed_at.to_rfc3339())
            .bind(record.attempts as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| VigilError::Transient(format!("dead-lettering job: {e}")))?;

            sqlx::query("DELETE FROM scheduled_jobs WHERE id = ?")
                .bind(job_id.to_string())
                .execute(&self.pool)
                .await
                .map_err(|e| VigilError::Transient(format!("removing dead-lettered job: {e}")))?;

            tracing::warn!(job_id = %job_id, attempts = job.attempts, "job dead-lettered");
            Ok(Some(record))
        } else {
            sqlx::query("UPDATE scheduled_jobs SET status = 'pending', attempts = ?, last_attempt_at = ? WHERE id = ?")
                .bind(job.attempts as i64)
                .bind(now.to_rfc3339())
                .bind(job_id.to_string())
                .execute(&self.pool)
                .await
                .map_err(|e| VigilError::Transient(format!("recording failed attempt: {e}")))?;
            Ok(None)
        }
    }

    async fn get_job(&self, job_id: uuid::Uuid) -> VigilResult<Option<ScheduledJob>> {
        let row = sqlx::query("SELECT * FROM scheduled_jobs WHERE id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| VigilError::Transient(format!("reading job {job_id}: {e}")))?;
        row.map(|r| Self::row_to_job(&r)).transpose()
    }

    async fn dlq_depth(&self) -> VigilResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) as n FROM dead_letter_jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| VigilError::Transient(format!("counting dlq depth: {e}")))?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    async fn get_dlq(&self, limit: usize, offset: usize) -> VigilResult<(Vec<DeadLetterRecord>, u64)> {
        let rows = sqlx::query("SELECT * FROM dead_letter_jobs ORDER BY failed_at DESC LIMIT ? OFFSET ?")
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| VigilError::Transient(format!("listing dlq: {e}")))?;
        let page = rows.iter().map(Self::row_to_dlq).collect::<VigilResult<Vec<_>>>()?;

        let count_row = sqlx::query("SELECT COUNT(*) as n FROM dead_letter_jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| VigilError::Transient(format!("counting dlq: {e}")))?;
        let total = count_row.get::<i64, _>("n") as u64;

        Ok((page, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn schedule_claim_complete_round_trip() {
        let scheduler = SqliteJobScheduler::in_memory().await.unwrap();
        let now = Utc::now();
        let id = scheduler.schedule("send_email", serde_json::json!({"to": "a"}), now - Duration::seconds(1)).await.unwrap();

        let pending = scheduler.get_pending(10, now).await.unwrap();
        assert_eq!(pending.len(), 1);

        let claimed = scheduler.claim(id).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert!(scheduler.claim(id).await.unwrap().is_none());

        scheduler.mark_completed(id).await.unwrap();
        assert_eq!(scheduler.get_job(id).await.unwrap().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn mark_failed_dead_letters_after_max_attempts() {
        let scheduler = SqliteJobScheduler::in_memory().await.unwrap();
        let now = Utc::now();
        let id = scheduler.schedule("send_email", serde_json::json!({}), now).await.unwrap();

        for _ in 0..MAX_JOB_ATTEMPTS - 1 {
            scheduler.claim(id).await.unwrap();
            assert!(scheduler.mark_failed(id, "boom").await.unwrap().is_none());
        }
        scheduler.claim(id).await.unwrap();
        let record = scheduler.mark_failed(id, "boom").await.unwrap().unwrap();
        assert_eq!(record.attempts, MAX_JOB_ATTEMPTS);
        assert!(scheduler.get_job(id).await.unwrap().is_none());
        assert_eq!(scheduler.dlq_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancel_fails_once_claimed() {
        let scheduler = SqliteJobScheduler::in_memory().await.unwrap();
        let now = Utc::now();
        let id = scheduler.schedule("send_email", serde_json::json!({}), now).await.unwrap();
        scheduler.claim(id).await.unwrap();
        assert!(!scheduler.cancel(id).await.unwrap());
    }
}
