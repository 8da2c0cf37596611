//! Job worker (§4.M): polls the scheduler, consults halt, dispatches
//! claimed jobs to registered handlers by job-type, and emits a
//! heartbeat once per cycle. Cooperative stop with a bounded grace
//! period, matching the fork monitor's `tokio::select!` shutdown shape.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil_halt::HaltChecker;
use vigil_scheduler::{JobScheduler, ScheduledJob};
use vigil_types::VigilResult;

/// Default grace period a worker waits for its in-flight cycle to
/// finish before force-cancelling (§5: "default 30 s").
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Default poll interval between worker cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default number of due jobs claimed per cycle.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Handles one `job_type`'s payload. Implementors decide what
/// "success" and "failure" mean for their job; the worker only needs a
/// `Result`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job. An `Err` is recorded via `mark_failed` with the
    /// error's `Display` as the reason.
    async fn handle(&self, job: &ScheduledJob) -> VigilResult<()>;
}

/// Configuration for a [`JobWorker`].
pub struct JobWorkerConfig {
    /// How often to poll for due jobs.
    pub poll_interval: Duration,
    /// Maximum jobs claimed per cycle.
    pub batch_size: usize,
    /// Grace period for cooperative stop (§5).
    pub stop_grace_period: Duration,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            stop_grace_period: DEFAULT_STOP_GRACE_PERIOD,
        }
    }
}

/// The cooperative job-worker loop (§4.M).
pub struct JobWorker<H: HaltChecker> {
    config: JobWorkerConfig,
    scheduler: Arc<dyn JobScheduler>,
    halt: Arc<H>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    running: AtomicBool,
    shutdown: Arc<Notify>,
    handler_cancel: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<H: HaltChecker + 'static> JobWorker<H> {
    /// Construct a worker dispatching claimed jobs to `handlers`, keyed
    /// by `job_type`.
    pub fn new(
        config: JobWorkerConfig,
        scheduler: Arc<dyn JobScheduler>,
        halt: Arc<H>,
        handlers: HashMap<String, Arc<dyn JobHandler>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            scheduler,
            halt,
            handlers,
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            handler_cancel: Arc::new(Notify::new()),
            task: Mutex::new(None),
        })
    }

    /// Idempotent: launches the cooperative polling task if not already
    /// running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run().await });
        *self.task.lock() = Some(handle);
        info!("job worker started");
    }

    /// Cooperative cancellation, bounded by `stop_grace_period`; past
    /// that the task is aborted.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_one();
        self.handler_cancel.notify_waiters();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            match tokio::time::timeout(self.config.stop_grace_period, handle).await {
                Ok(_) => info!("job worker stopped"),
                Err(_) => {
                    warn!("job worker exceeded stop grace period, forcing cancellation");
                    abort.abort();
                }
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    debug!("job worker received shutdown");
                    break;
                }
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
            }
        }
    }

    async fn run_cycle(&self) {
        debug!("job worker heartbeat");

        if self.halt.is_halted() {
            info!(reason = ?self.halt.reason(), "job worker skipping cycle, platform halted");
            return;
        }

        let now = Utc::now();
        let due = match self.scheduler.get_pending(self.config.batch_size, now).await {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(error = %err, "job worker failed to list pending jobs");
                return;
            }
        };

        for job in due {
            self.process_one(job).await;
        }
    }

    async fn process_one(&self, job: ScheduledJob) {
        let claimed = match self.scheduler.claim(job.id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, job_id = %job.id, "job worker failed to claim job");
                return;
            }
        };

        let Some(handler) = self.handlers.get(&claimed.job_type) else {
            self.fail(&claimed, "no handler").await;
            return;
        };

        // A handler may be interrupted at any suspension point by a
        // concurrent `stop()`; treat that as a failed attempt rather than
        // leaving the job stuck in `Processing`.
        let outcome = tokio::select! {
            biased;
            _ = self.handler_cancel.notified() => None,
            result = handler.handle(&claimed) => Some(result),
        };

        match outcome {
            None => self.fail(&claimed, "cancelled").await,
            Some(Ok(())) => {
                if let Err(err) = self.scheduler.mark_completed(claimed.id).await {
                    warn!(error = %err, job_id = %claimed.id, "job worker failed to mark job completed");
                }
            }
            Some(Err(err)) => self.fail(&claimed, &err.to_string()).await,
        }
    }

    async fn fail(&self, job: &ScheduledJob, reason: &str) {
        match self.scheduler.mark_failed(job.id, reason).await {
            Ok(Some(dlq)) => warn!(job_id = %job.id, reason, "job dead-lettered after max attempts, dlq_id = {}", dlq.id),
            Ok(None) => debug!(job_id = %job.id, reason, "job failed, will retry"),
            Err(err) => warn!(error = %err, job_id = %job.id, "job worker failed to record failure"),
        }
    }

    /// Whether the loop's task is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
