//! In-Process Workflow Harness
//!
//! Wires the whole pipeline over in-memory adapters: one store, one broker,
//! one signal channel, an orchestrator and a consumer per stage. The
//! orchestrator subscribes before anything is submitted, so no signal of a
//! harness run can be missed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;

use core_kernel::ApplicationId;
use domain_application::{Application, ApplicationStatus, InMemoryApplicationStore, UserData, STAGE_ORDER};
use domain_workflow::{
    run_consumer, ConsumerOptions, GuardConfig, InMemoryBroker, Intake, JobQueue,
    LocalSignalChannel, Orchestrator, RecordingObserver, RetryPolicy, SignalChannel, StageWorker,
    WorkflowObserver, WorkflowResult,
};

use crate::verifiers::VerifierSet;

/// Knobs for a harness run; defaults keep every wait in the millisecond range
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub retry: RetryPolicy,
    pub guard: GuardConfig,
    /// Reads each new application stays invisible for
    pub visibility_lag: u32,
    pub consumer: ConsumerOptions,
    pub start_delay: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::new(10, Duration::from_millis(1)),
            guard: GuardConfig {
                max_attempts: 40,
                interval: Duration::from_millis(2),
            },
            visibility_lag: 0,
            consumer: ConsumerOptions {
                concurrency: 4,
                poll_interval: Duration::from_millis(2),
            },
            start_delay: Duration::ZERO,
        }
    }
}

impl HarnessConfig {
    pub fn with_visibility_lag(mut self, reads: u32) -> Self {
        self.visibility_lag = reads;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }
}

/// A running pipeline
pub struct WorkflowHarness {
    pub store: Arc<InMemoryApplicationStore>,
    pub broker: InMemoryBroker,
    pub signals: Arc<LocalSignalChannel>,
    pub observer: Arc<RecordingObserver>,
    pub orchestrator: Arc<Orchestrator>,
    pub intake: Intake,
    pub verifiers: VerifierSet,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl WorkflowHarness {
    /// Starts a pipeline with default settings
    pub async fn start(verifiers: VerifierSet) -> Self {
        Self::start_with(verifiers, HarnessConfig::default()).await
    }

    pub async fn start_with(verifiers: VerifierSet, config: HarnessConfig) -> Self {
        let store = Arc::new(InMemoryApplicationStore::with_visibility_lag(config.visibility_lag));
        let broker = InMemoryBroker::new(config.retry);
        let signals = Arc::new(LocalSignalChannel::default());
        let observer = Arc::new(RecordingObserver::new());
        let orchestrator = Arc::new(
            Orchestrator::new(store.clone(), broker.stage_queues())
                .with_observer(observer.clone() as Arc<dyn WorkflowObserver>),
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        let stream = signals
            .subscribe()
            .await
            .expect("local signal channel always subscribes");
        {
            let orchestrator = Arc::clone(&orchestrator);
            let shutdown_rx = shutdown_rx.clone();
            tasks.spawn(async move {
                let _ = orchestrator.drive(stream, shutdown_rx).await;
            });
        }

        for stage in STAGE_ORDER {
            let worker = StageWorker::new(
                stage,
                verifiers.verifiers().get(stage),
                store.clone(),
                signals.clone(),
            )
            .with_guard(store.clone(), config.guard)
            .with_observer(observer.clone());
            tasks.spawn(run_consumer(
                broker.queue(stage) as Arc<dyn JobQueue>,
                Arc::new(worker),
                config.consumer,
                shutdown_rx.clone(),
            ));
        }

        let intake = Intake::new(store.clone(), Arc::clone(&orchestrator))
            .with_start_delay(config.start_delay);

        Self {
            store,
            broker,
            signals,
            observer,
            orchestrator,
            intake,
            verifiers,
            shutdown,
            tasks,
        }
    }

    /// Submits an application through intake
    pub async fn submit(&self, user_data: UserData) -> WorkflowResult<ApplicationId> {
        self.intake.submit(user_data).await
    }

    /// The stored application, ignoring visibility lag
    pub async fn application(&self, id: ApplicationId) -> Application {
        self.store.get(id).await.expect("application was submitted")
    }

    /// Every status written for an application, oldest first
    pub async fn status_history(&self, id: ApplicationId) -> Vec<ApplicationStatus> {
        self.store.snapshots(id).await
    }

    /// Polls until the application settles or `timeout` passes
    ///
    /// # Panics
    ///
    /// Panics on timeout, printing the last status seen
    pub async fn wait_until_settled(&self, id: ApplicationId, timeout: Duration) -> Application {
        self.wait_until(id, timeout, |app| app.status.is_settled()).await
    }

    /// Polls until `done` holds for the application or `timeout` passes
    pub async fn wait_until(
        &self,
        id: ApplicationId,
        timeout: Duration,
        done: impl Fn(&Application) -> bool,
    ) -> Application {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let app = self.application(id).await;
            if done(&app) {
                return app;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("application {} did not reach the expected state: {:?}", id, app.status);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Lets queued work drain for a moment
    pub async fn settle_for(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Stops the orchestrator and every consumer, waiting for them to finish
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        while self.tasks.join_next().await.is_some() {}
    }
}
