//! Underwriting pipeline worker
//!
//! # Usage
//!
//! ```bash
//! # Orchestrator and every stage in one process
//! WORKER_DATABASE_URL=postgres://... cargo run --bin underwriting-worker
//!
//! # A process consuming only the slow stages
//! WORKER_ROLE=worker WORKER_STAGES=dmv,credit cargo run --bin underwriting-worker
//! ```
//!
//! # Environment Variables
//!
//! * `WORKER_DATABASE_URL` - PostgreSQL connection string
//! * `WORKER_ROLE` - all, orchestrator or worker (default: all)
//! * `WORKER_STAGES` - comma separated stages to consume (default: every stage)
//! * `WORKER_CONCURRENCY` - deliveries handled at once per stage (default: 1)
//! * `WORKER_RETRY_ATTEMPTS` / `WORKER_RETRY_BACKOFF_MS` - stage retry policy
//! * `WORKER_LOG_LEVEL` - trace, debug, info, warn, error (default: info)
//! * `WORKER_LOG_JSON` - emit JSON log lines (default: false)

use interface_worker::{init_tracing, shutdown_signal, Runtime, WorkerConfig};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (useful for local development)
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env()?;
    init_tracing(&config.log_level, config.log_json);

    tracing::info!(
        role = ?config.role,
        stages = ?config.stages,
        "Starting underwriting pipeline worker"
    );

    let runtime = Runtime::connect(config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    runtime.run(shutdown_rx).await?;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
