//! Vigil CLI – entry points for the kernel's cooperative background
//! loops (§6: "CLI/entry-points provided by collaborators").
//!
//! `fork-monitor` runs the integrity-crisis detection loop; `job-runner`
//! runs the scheduler's worker loop. Both start their loop, wait for
//! SIGINT/SIGTERM, stop cooperatively, and exit 0. A failure to start
//! (e.g. an unopenable database) exits non-zero before either loop is
//! launched.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use vigil_halt::{HaltState, SqliteHaltStore};
use vigil_integrity::{CrisisTrigger, ForkHandler, ForkMonitorConfig, ForkMonitorLoop, SlidingWindowLimiter};
use vigil_ledger::{InMemoryKeyRegistry, KeyRegistry, KeyedWitness, KeypairSigner, NewAgentKey, Signer, SqliteLedgerStore};
use vigil_scheduler::SqliteJobScheduler;
use vigil_worker::{JobWorker, JobWorkerConfig};

#[derive(Parser)]
#[command(
    name = "vigil",
    version = env!("CARGO_PKG_VERSION"),
    about = "Vigil – constitutional kernel background services",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fork-detection and crisis-halt loop.
    ForkMonitor {
        /// Path to the ledger's SQLite database file.
        #[arg(long, default_value = "vigil-ledger.db")]
        ledger_db: String,
        /// Path to the halt state's SQLite database file.
        #[arg(long, default_value = "vigil-halt.db")]
        halt_db: String,
        /// Poll interval in seconds.
        #[arg(long, default_value_t = 10)]
        interval_secs: u64,
    },
    /// Run the job worker loop.
    JobRunner {
        /// Path to the scheduler's SQLite database file.
        #[arg(long, default_value = "vigil-scheduler.db")]
        scheduler_db: String,
        /// Path to the halt state's SQLite database file.
        #[arg(long, default_value = "vigil-halt.db")]
        halt_db: String,
        /// Path to the ledger's SQLite database file, consulted only
        /// for recovery-event verification (§4.D).
        #[arg(long, default_value = "vigil-ledger.db")]
        ledger_db: String,
        /// Poll interval in seconds.
        #[arg(long, default_value_t = 10)]
        interval_secs: u64,
    },
}

/// Adapts [`CrisisTrigger`] to [`ForkHandler`] by supplying the signer
/// and witness every detected fork needs to become a witnessed event.
struct CrisisForkHandler<H: vigil_halt::HaltChecker> {
    trigger: CrisisTrigger<H>,
    signer: KeypairSigner,
    witness: KeyedWitness<KeypairSigner>,
}

#[async_trait::async_trait]
impl<H: vigil_halt::HaltChecker> ForkHandler for CrisisForkHandler<H> {
    async fn on_fork(&self, payload: vigil_integrity::ForkPayload) -> vigil_types::VigilResult<()> {
        self.trigger
            .handle(vigil_integrity::Crisis::ForkDetected(payload), &self.signer, &self.witness)
            .await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::ForkMonitor { ledger_db, halt_db, interval_secs } => {
            run_fork_monitor(&ledger_db, &halt_db, interval_secs).await
        }
        Commands::JobRunner { scheduler_db, halt_db, ledger_db, interval_secs } => {
            run_job_runner(&scheduler_db, &halt_db, &ledger_db, interval_secs).await
        }
    };

    match exit_code {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::error!(error = %err, "failed to start");
            std::process::exit(1);
        }
    }
}

async fn run_fork_monitor(ledger_db: &str, halt_db: &str, interval_secs: u64) -> Result<()> {
    let store = Arc::new(
        SqliteLedgerStore::open(ledger_db)
            .await
            .context("opening ledger database")?,
    ) as Arc<dyn vigil_ledger::LedgerStore>;
    let halt_durable = SqliteHaltStore::open(halt_db).await.context("opening halt database")?;
    let halt = Arc::new(
        HaltState::new(Box::new(halt_durable), store.clone())
            .await
            .context("hydrating halt state")?,
    );

    let registry = Arc::new(InMemoryKeyRegistry::new());
    let signer = KeypairSigner::generate("fork-monitor-signer");
    let witness_signer = KeypairSigner::generate("fork-monitor-witness");
    let now = chrono::Utc::now();
    registry
        .register(NewAgentKey {
            agent_id: "SYSTEM:fork-monitor".into(),
            key_id: signer.key_id().clone(),
            public_key: signer.public_key(),
            active_from: now,
            active_until: None,
            rotates: None,
        })
        .await
        .context("registering fork-monitor signing key")?;
    registry
        .register(NewAgentKey {
            agent_id: "SYSTEM:witness".into(),
            key_id: witness_signer.key_id().clone(),
            public_key: witness_signer.public_key(),
            active_from: now,
            active_until: None,
            rotates: None,
        })
        .await
        .context("registering witness key")?;

    let chain = Arc::new(vigil_ledger::LedgerChain::new(store.clone(), registry as Arc<dyn KeyRegistry>));
    let witness = KeyedWitness::new("SYSTEM:witness", witness_signer, store.clone());
    let writer = vigil_halt::WitnessedHaltWriter::new(chain, Box::new(vigil_halt::InMemoryUnwitnessedHaltStore::default()));
    let trigger = CrisisTrigger::new(writer, halt.clone(), "SYSTEM:crisis-trigger".into());
    let handler = Arc::new(CrisisForkHandler { trigger, signer: signer, witness });

    let limiter = Arc::new(SlidingWindowLimiter::for_fork_signals());
    let fork_signer: Arc<dyn Signer> = Arc::new(KeypairSigner::generate("fork-signal-signer"));
    let monitor = ForkMonitorLoop::new(
        ForkMonitorConfig::new("SYSTEM:fork-monitor", Duration::from_secs(interval_secs)),
        store,
        handler as Arc<dyn ForkHandler>,
        Some(fork_signer),
        Some(limiter),
    );

    monitor.start();
    wait_for_shutdown_signal().await;
    monitor.stop().await;
    Ok(())
}

async fn run_job_runner(scheduler_db: &str, halt_db: &str, ledger_db: &str, interval_secs: u64) -> Result<()> {
    let scheduler = Arc::new(
        SqliteJobScheduler::open(scheduler_db)
            .await
            .context("opening scheduler database")?,
    ) as Arc<dyn vigil_scheduler::JobScheduler>;

    let ledger = Arc::new(
        SqliteLedgerStore::open(ledger_db).await.context("opening ledger database")?,
    ) as Arc<dyn vigil_ledger::LedgerStore>;
    let halt_durable = SqliteHaltStore::open(halt_db).await.context("opening halt database")?;
    let halt = Arc::new(
        HaltState::new(Box::new(halt_durable), ledger)
            .await
            .context("hydrating halt state")?,
    );

    let worker = JobWorker::new(
        JobWorkerConfig { poll_interval: Duration::from_secs(interval_secs), ..Default::default() },
        scheduler,
        halt,
        std::collections::HashMap::new(),
    );

    worker.start();
    wait_for_shutdown_signal().await;
    worker.stop().await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("installing SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
