//! DLQ alert monitor (§4.N): periodically reads dead-letter queue depth
//! and emits an alert on severity escalation, depth change, or clearing
//! back to zero.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use vigil_scheduler::JobScheduler;
use vigil_types::AlertSeverity;

/// Default poll interval for the DLQ alert monitor (§4.N).
pub const DEFAULT_DLQ_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// An alert emitted by the [`DlqAlertMonitor`].
#[derive(Debug, Clone, PartialEq)]
pub enum DlqAlert {
    /// Severity escalated, or depth changed while staying nonzero.
    Severity {
        /// Current dead-letter queue depth.
        depth: u64,
        /// Severity bucket for the current depth.
        severity: AlertSeverity,
    },
    /// Depth returned to zero from a nonzero value.
    Cleared,
}

/// Receives alerts from the [`DlqAlertMonitor`].
#[async_trait]
pub trait DlqAlertSink: Send + Sync {
    /// Handle one alert.
    async fn on_alert(&self, alert: DlqAlert);
}

/// The cooperative DLQ-depth polling loop (§4.N).
pub struct DlqAlertMonitor {
    poll_interval: Duration,
    scheduler: Arc<dyn JobScheduler>,
    sink: Arc<dyn DlqAlertSink>,
    last_alert_depth: Mutex<u64>,
    running: AtomicBool,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DlqAlertMonitor {
    /// Construct a monitor polling `scheduler`'s DLQ depth every
    /// `poll_interval`, routing alerts to `sink`.
    pub fn new(poll_interval: Duration, scheduler: Arc<dyn JobScheduler>, sink: Arc<dyn DlqAlertSink>) -> Arc<Self> {
        Arc::new(Self {
            poll_interval,
            scheduler,
            sink,
            last_alert_depth: Mutex::new(0),
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
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
        info!("dlq alert monitor started");
    }

    /// Cooperative cancellation.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_one();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("dlq alert monitor stopped");
    }

    async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    debug!("dlq alert monitor received shutdown");
                    break;
                }
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
            }
        }
    }

    async fn run_cycle(&self) {
        let depth = match self.scheduler.dlq_depth().await {
            Ok(depth) => depth,
            Err(err) => {
                tracing::warn!(error = %err, "dlq alert monitor failed to read depth");
                return;
            }
        };

        let should_clear = {
            let mut last = self.last_alert_depth.lock();
            if depth == 0 {
                if *last != 0 {
                    *last = 0;
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };

        if depth == 0 {
            if should_clear {
                self.sink.on_alert(DlqAlert::Cleared).await;
            }
            return;
        }

        let severity_to_alert = {
            let mut last = self.last_alert_depth.lock();
            let severity = AlertSeverity::from_depth(depth);
            let previous_severity = AlertSeverity::from_depth(*last);
            let escalated = severity_rank(severity) > severity_rank(previous_severity);
            let changed_from_nonzero = *last != 0 && depth != *last;

            if escalated || changed_from_nonzero || *last == 0 {
                *last = depth;
                Some(severity)
            } else {
                None
            }
        };

        if let Some(severity) = severity_to_alert {
            self.sink.on_alert(DlqAlert::Severity { depth, severity }).await;
        }
    }

    /// Whether the loop's task is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn severity_rank(severity: AlertSeverity) -> u8 {
    match severity {
        AlertSeverity::Ok => 0,
        AlertSeverity::Warning => 1,
        AlertSeverity::Critical => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;
    use vigil_scheduler::InMemoryJobScheduler;

    struct RecordingSink {
        alerts: AsyncMutex<Vec<DlqAlert>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self { alerts: AsyncMutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl DlqAlertSink for RecordingSink {
        async fn on_alert(&self, alert: DlqAlert) {
            self.alerts.lock().await.push(alert);
        }
    }

    async fn dead_letter_n(scheduler: &Arc<dyn JobScheduler>, n: usize) {
        for _ in 0..n {
            let id = scheduler.schedule("x", serde_json::json!({}), chrono::Utc::now()).await.unwrap();
            for _ in 0..vigil_types::MAX_JOB_ATTEMPTS {
                scheduler.claim(id).await.unwrap();
                scheduler.mark_failed(id, "boom").await.unwrap();
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn escalation_to_warning_emits_one_alert() {
        let scheduler: Arc<dyn JobScheduler> = Arc::new(InMemoryJobScheduler::new());
        dead_letter_n(&scheduler, 1).await;

        let sink = RecordingSink::new();
        let monitor = DlqAlertMonitor::new(Duration::from_millis(10), scheduler, sink.clone());
        monitor.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop().await;

        let alerts = sink.alerts.lock().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0], DlqAlert::Severity { depth: 1, severity: AlertSeverity::Warning });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn quiet_dlq_never_alerts() {
        let scheduler: Arc<dyn JobScheduler> = Arc::new(InMemoryJobScheduler::new());
        let sink = RecordingSink::new();
        let monitor = DlqAlertMonitor::new(Duration::from_millis(10), scheduler, sink.clone());
        monitor.start();
        tokio::time::sleep(Duration::from_millis(40)).await;
        monitor.stop().await;
        assert!(sink.alerts.lock().await.is_empty());
    }
}
