//! Fork monitor loop (§4.G): polls fork detection on a fixed interval,
//! optionally signs and rate-limits the resulting signal, and always
//! routes a detected fork into the crisis trigger regardless of whether
//! the external signal was rate-limited.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil_ledger::{LedgerStore, Signer};
use vigil_types::VigilResult;

use crate::fork::{detect_fork, sign_fork_payload, ForkPayload, SignedForkSignal};
use crate::rate_limiter::SlidingWindowLimiter;

/// Receives crises detected by the monitor loop. Implemented by
/// [`crate::crisis::CrisisTrigger`] in production; a test double may
/// record calls instead.
#[async_trait]
pub trait ForkHandler: Send + Sync {
    /// Handle a detected fork.
    async fn on_fork(&self, payload: ForkPayload) -> VigilResult<()>;
}

/// Configuration for a [`ForkMonitorLoop`].
pub struct ForkMonitorConfig {
    /// Poll interval; clamped up to [`vigil_types::FORK_MONITOR_MIN_INTERVAL`].
    pub check_interval: Duration,
    /// This monitor instance's identity, recorded as `detecting_service_id`.
    pub service_id: String,
}

impl ForkMonitorConfig {
    /// Construct a config, clamping `check_interval` to the
    /// constitutional minimum of "at least every 10 seconds".
    pub fn new(service_id: impl Into<String>, check_interval: Duration) -> Self {
        Self {
            check_interval: check_interval.max(vigil_types::FORK_MONITOR_MIN_INTERVAL),
            service_id: service_id.into(),
        }
    }
}

impl Default for ForkMonitorConfig {
    fn default() -> Self {
        Self::new("SYSTEM:fork-monitor", Duration::from_secs(10))
    }
}

/// The cooperative fork-detection loop (§4.G).
pub struct ForkMonitorLoop {
    config: ForkMonitorConfig,
    store: Arc<dyn LedgerStore>,
    handler: Arc<dyn ForkHandler>,
    signer: Option<Arc<dyn Signer>>,
    limiter: Option<Arc<SlidingWindowLimiter>>,
    running: AtomicBool,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ForkMonitorLoop {
    /// Construct a monitor over `store`, routing detected forks to
    /// `handler`. Signing and rate limiting are optional — when both
    /// are present, each detection also produces a [`SignedForkSignal`]
    /// subject to the per-source rate limit.
    pub fn new(
        config: ForkMonitorConfig,
        store: Arc<dyn LedgerStore>,
        handler: Arc<dyn ForkHandler>,
        signer: Option<Arc<dyn Signer>>,
        limiter: Option<Arc<SlidingWindowLimiter>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            handler,
            signer,
            limiter,
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            task: Mutex::new(None),
        })
    }

    /// Idempotent: launches the cooperative polling task if it is not
    /// already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run().await });
        *self.task.lock() = Some(handle);
        info!(service_id = %self.config.service_id, "fork monitor started");
    }

    /// Cooperative cancellation: signals the loop to stop after its
    /// current in-flight check finishes, and awaits that completion.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_one();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(service_id = %self.config.service_id, "fork monitor stopped");
    }

    async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.check_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    debug!("fork monitor received shutdown");
                    break;
                }
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
            }
        }
    }

    async fn run_cycle(&self) {
        let start = Instant::now();
        let events = match self.store.all().await {
            Ok(events) => events,
            Err(err) => {
                warn!(error = %err, "fork monitor: failed to read ledger, skipping cycle");
                return;
            }
        };

        let fork = detect_fork(&events, &self.config.service_id);
        let latency = start.elapsed();
        debug!(latency_ms = latency.as_millis(), fork_found = fork.is_some(), "fork monitor cycle complete");

        let Some(payload) = fork else { return };

        if let (Some(signer), Some(limiter)) = (&self.signer, &self.limiter) {
            match self.handle_rate_limited_signal(payload.clone(), signer.as_ref(), limiter.as_ref()) {
                Ok(Some(_signal)) => {}
                Ok(None) => info!(service_id = %self.config.service_id, "fork signal rate_limited, dropping external signal"),
                Err(err) => warn!(error = %err, "fork signal signing failed"),
            }
        }

        if let Err(err) = self.handler.on_fork(payload).await {
            warn!(error = %err, "fork handler failed");
        }
    }

    /// Rate-limited signal flow (§4.G): independent of the halt path.
    /// `Ok(None)` means the signal was dropped due to rate limiting;
    /// the caller must still invoke the halt-bound handler regardless.
    fn handle_rate_limited_signal(
        &self,
        payload: ForkPayload,
        signer: &dyn Signer,
        limiter: &SlidingWindowLimiter,
    ) -> VigilResult<Option<SignedForkSignal>> {
        let now = Utc::now();
        if !limiter.check(&payload.detecting_service_id, now) {
            return Ok(None);
        }
        limiter.record(&payload.detecting_service_id, now);
        Ok(Some(sign_fork_payload(payload, signer)?))
    }

    /// Whether the loop's task is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as AsyncMutex;
    use vigil_ledger::{InMemoryLedgerStore, KeypairSigner};

    struct RecordingHandler {
        forks: AsyncMutex<Vec<ForkPayload>>,
        calls: AtomicUsize,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self { forks: AsyncMutex::new(Vec::new()), calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl ForkHandler for RecordingHandler {
        async fn on_fork(&self, payload: ForkPayload) -> VigilResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.forks.lock().await.push(payload);
            Ok(())
        }
    }

    fn forked_event(id: uuid::Uuid, prev_hash: &str, content_hash: &str) -> vigil_ledger::Event {
        vigil_ledger::Event {
            event_id: id,
            sequence: 0,
            event_type: "test".into(),
            payload: serde_json::json!({}),
            prev_hash: prev_hash.to_string(),
            content_hash: content_hash.to_string(),
            signature: vec![],
            signer_key_id: "k".into(),
            witness_id: "w".into(),
            witness_signature: vec![],
            local_timestamp: Utc::now(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_stop_is_idempotent_and_detects_fork() {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedgerStore::new());
        store
            .append(&forked_event(uuid::Uuid::nil(), &"a".repeat(64), &"b".repeat(64)))
            .await
            .unwrap();
        store
            .append(&forked_event(uuid::Uuid::max(), &"a".repeat(64), &"c".repeat(64)))
            .await
            .unwrap();

        let handler = RecordingHandler::new();
        let signer: Arc<dyn Signer> = Arc::new(KeypairSigner::generate("fm-1"));
        let limiter = Arc::new(SlidingWindowLimiter::for_fork_signals());
        let monitor = ForkMonitorLoop::new(
            ForkMonitorConfig::new("fm-1", Duration::from_millis(10)),
            store,
            handler.clone() as Arc<dyn ForkHandler>,
            Some(signer),
            Some(limiter),
        );

        monitor.start();
        monitor.start(); // idempotent, does not spawn a second task
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop().await;
        monitor.stop().await; // idempotent

        assert!(handler.calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn quiet_ledger_never_calls_handler() {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedgerStore::new());
        let handler = RecordingHandler::new();
        let monitor = ForkMonitorLoop::new(
            ForkMonitorConfig::new("fm-1", Duration::from_millis(10)),
            store,
            handler.clone() as Arc<dyn ForkHandler>,
            None,
            None,
        );
        monitor.start();
        tokio::time::sleep(Duration::from_millis(40)).await;
        monitor.stop().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }
}
