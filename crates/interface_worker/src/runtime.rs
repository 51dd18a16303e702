//! Process wiring
//!
//! Connects to PostgreSQL, applies the schema and starts whatever the
//! configured role asks for: the orchestrator, stage consumers, or both.
//! The orchestrator role also runs the retention sweep. Every task watches
//! the same shutdown flag.

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use core_kernel::{HealthCheckResult, HealthCheckable};
use domain_application::ApplicationStore;
use domain_workflow::{
    run_consumer, Intake, Orchestrator, SignalChannel, StageQueues, StageWorker, Verifiers,
};
use infra_db::{
    create_pool, run_migrations, DatabaseConfig, DatabasePool, PostgresApplicationStore,
    PostgresJobQueue, PostgresSignalChannel, RetentionSweeper,
};

use crate::config::WorkerConfig;
use crate::verifiers::SimulatedVerifier;

/// Everything a pipeline process needs, connected
pub struct Runtime {
    config: WorkerConfig,
    pool: DatabasePool,
    store: Arc<dyn ApplicationStore>,
    queues: StageQueues,
    signals: Arc<dyn SignalChannel>,
    orchestrator: Arc<Orchestrator>,
    verifiers: Verifiers,
    probes: Vec<Arc<dyn HealthCheckable>>,
}

impl Runtime {
    /// Connects with simulated verifiers
    pub async fn connect(config: WorkerConfig) -> anyhow::Result<Self> {
        let verifiers = SimulatedVerifier::all(config.verifier_latency());
        Self::connect_with(config, verifiers).await
    }

    pub async fn connect_with(config: WorkerConfig, verifiers: Verifiers) -> anyhow::Result<Self> {
        let pool = create_pool(
            DatabaseConfig::new(&config.database_url).max_connections(config.max_connections),
        )
        .await
        .context("connecting to the database")?;
        run_migrations(&pool).await.context("applying the schema")?;
        Ok(Self::from_pool(config, pool, verifiers))
    }

    /// Wires the adapters over an existing pool
    pub fn from_pool(config: WorkerConfig, pool: DatabasePool, verifiers: Verifiers) -> Self {
        let postgres_store = Arc::new(PostgresApplicationStore::new(pool.clone()));
        let postgres_signals = Arc::new(PostgresSignalChannel::new(pool.clone()));
        let probes = vec![
            Arc::clone(&postgres_store) as Arc<dyn HealthCheckable>,
            Arc::clone(&postgres_signals) as Arc<dyn HealthCheckable>,
        ];

        let store: Arc<dyn ApplicationStore> = postgres_store;
        let signals: Arc<dyn SignalChannel> = postgres_signals;
        let queues = PostgresJobQueue::stage_queues(pool.clone(), config.retry_policy(), config.job_lock());
        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&store), queues.clone()));
        Self {
            config,
            pool,
            store,
            queues,
            signals,
            orchestrator,
            verifiers,
            probes,
        }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    pub fn store(&self) -> Arc<dyn ApplicationStore> {
        Arc::clone(&self.store)
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator)
    }

    /// Intake bound to this process's store and orchestrator
    pub fn intake(&self) -> Intake {
        Intake::new(self.store(), self.orchestrator()).with_start_delay(self.config.start_delay())
    }

    /// Probes the store and the signal channel
    pub async fn health(&self) -> Vec<HealthCheckResult> {
        let mut results = Vec::with_capacity(self.probes.len());
        for probe in &self.probes {
            results.push(probe.health_check().await);
        }
        results
    }

    /// Runs until `shutdown` flips or a task fails
    ///
    /// Refuses to start while any adapter reports unhealthy.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        for result in self.health().await {
            if !result.is_healthy() {
                warn!(adapter = %result.adapter_id, message = ?result.message, "Adapter unhealthy");
                bail!("adapter {} is unhealthy", result.adapter_id);
            }
            info!(adapter = %result.adapter_id, latency_ms = result.latency_ms, "Adapter healthy");
        }

        let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

        if self.config.role.runs_orchestrator() {
            // subscribe before resuming so no completion of a resumed job is missed
            let stream = self
                .signals
                .subscribe()
                .await
                .context("subscribing to step signals")?;
            let resumed = self
                .orchestrator
                .resume_in_flight(self.config.resume_limit)
                .await
                .context("resuming in-flight applications")?;
            info!(resumed, "Orchestrator ready");

            let orchestrator = Arc::clone(&self.orchestrator);
            let orchestrator_shutdown = shutdown.clone();
            tasks.spawn(async move {
                orchestrator
                    .drive(stream, orchestrator_shutdown)
                    .await
                    .context("orchestrator stopped")
            });

            if let Some(policy) = self.config.retention() {
                let sweeper = RetentionSweeper::new(self.pool.clone(), policy);
                let shutdown = shutdown.clone();
                tasks.spawn(async move {
                    sweeper.run(shutdown).await;
                    Ok(())
                });
            }
        }

        if self.config.role.runs_workers() {
            for stage in self.config.stages.iter().copied() {
                let worker = StageWorker::new(
                    stage,
                    self.verifiers.get(stage),
                    Arc::clone(&self.store),
                    Arc::clone(&self.signals),
                )
                .with_guard(Arc::clone(&self.store), self.config.guard());
                let queue = Arc::clone(self.queues.get(stage));
                let options = self.config.consumer_options();
                let shutdown = shutdown.clone();
                tasks.spawn(async move {
                    run_consumer(queue, Arc::new(worker), options, shutdown).await;
                    Ok(())
                });
            }
        }

        info!(role = ?self.config.role, tasks = tasks.len(), "Pipeline process running");

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(error = %err, "Pipeline task failed");
                    return Err(err);
                }
                Err(err) => {
                    error!(error = %err, "Pipeline task panicked");
                    return Err(err).context("pipeline task panicked");
                }
            }
        }
        info!("Pipeline process stopped");
        Ok(())
    }
}
