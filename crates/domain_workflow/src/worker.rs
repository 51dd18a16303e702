//! Stage workers and the queue consumer loop
//!
//! A stage worker handles one delivery of its stage's job:
//!
//! ```text
//! guard (await visibility) -> processing -> verifier
//!     ok  -> complete + merge result -> publish step:complete
//!     err -> note attempt (failed on the last one) -> publish step:error -> Err
//! ```
//!
//! Errors go back to the broker, whose retry policy decides whether the job
//! is redelivered. The worker keeps no retry counter of its own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use domain_application::{
    stage_result, ApplicationError, ApplicationStore, ResultFields, Stage, StepStatus,
};

use crate::aggregator::StatusAggregator;
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::{TracingObserver, WorkflowEvent, WorkflowObserver};
use crate::guard::{ConsistencyGuard, GuardConfig};
use crate::queue::{Delivery, FailureOutcome, JobQueue};
use crate::signal::{SignalChannel, StepSignal};
use crate::verifier::Verifier;

/// Processes deliveries of one stage's queue
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn stage(&self) -> Stage;

    async fn handle(&self, delivery: &Delivery) -> WorkflowResult<()>;
}

/// What a handled delivery amounted to
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// The verifier ran and the step is complete
    Completed(Value),
    /// The step was already complete; its stored result was re-published
    Republished,
    /// The step or the application is settled; nothing was done
    Skipped,
}

pub struct StageWorker {
    stage: Stage,
    verifier: Arc<dyn Verifier>,
    guard: ConsistencyGuard,
    aggregator: StatusAggregator,
    signals: Arc<dyn SignalChannel>,
    observer: Arc<dyn WorkflowObserver>,
}

impl StageWorker {
    pub fn new(
        stage: Stage,
        verifier: Arc<dyn Verifier>,
        store: Arc<dyn ApplicationStore>,
        signals: Arc<dyn SignalChannel>,
    ) -> Self {
        Self {
            stage,
            verifier,
            guard: ConsistencyGuard::new(store.clone(), GuardConfig::default()),
            aggregator: StatusAggregator::new(store),
            signals,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_guard(mut self, store: Arc<dyn ApplicationStore>, config: GuardConfig) -> Self {
        self.guard = ConsistencyGuard::new(store, config);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn WorkflowObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Runs one delivery through the stage
    #[instrument(
        skip(self, delivery),
        fields(
            application_id = %delivery.job.application_id,
            stage = %self.stage,
            attempt = delivery.attempt,
            job_id = %delivery.job.id,
        )
    )]
    pub async fn process(&self, delivery: &Delivery) -> WorkflowResult<StageOutcome> {
        let id = delivery.job.application_id;
        let application = self.guard.await_visible(id).await?;

        if application.status.completed || application.status.error.is_some() {
            debug!("Application already settled");
            return Ok(StageOutcome::Skipped);
        }
        match application.status.step_status(self.stage) {
            Some(StepStatus::Complete) => {
                let data = application.result_for(self.stage).cloned().unwrap_or(Value::Null);
                info!("Step already complete, re-publishing completion");
                self.publish(StepSignal::complete(id, self.stage, data)).await?;
                return Ok(StageOutcome::Republished);
            }
            Some(StepStatus::Failed) => {
                debug!("Step already failed");
                return Ok(StageOutcome::Skipped);
            }
            Some(StepStatus::Pending) | Some(StepStatus::Processing) => {}
            None => return Err(ApplicationError::MissingStep(self.stage).into()),
        }

        self.aggregator
            .set_step_status(id, self.stage, StepStatus::Processing, ResultFields::new())
            .await?;
        self.observer.on_event(&WorkflowEvent::StageStarted {
            application_id: id,
            stage: self.stage,
            attempt: delivery.attempt,
        });

        match self.verifier.verify(id).await {
            Ok(data) => {
                let fields = stage_result(self.stage, data.clone());
                self.aggregator
                    .set_step_status(id, self.stage, StepStatus::Complete, fields)
                    .await?;
                self.observer.on_event(&WorkflowEvent::StageComplete {
                    application_id: id,
                    stage: self.stage,
                    attempt: delivery.attempt,
                });
                self.publish(StepSignal::complete(id, self.stage, data.clone()))
                    .await?;
                Ok(StageOutcome::Completed(data))
            }
            Err(source) => {
                let exhausted = delivery.is_final_attempt();
                let message = source.to_string();
                warn!(error = %message, exhausted, "Verifier failed");

                self.aggregator
                    .record_attempt_failure(id, self.stage, delivery.attempt, &message, exhausted)
                    .await?;
                self.observer.on_event(&WorkflowEvent::StageFailed {
                    application_id: id,
                    stage: self.stage,
                    attempt: delivery.attempt,
                    error: message.clone(),
                    exhausted,
                });
                let signal = StepSignal::error(id, self.stage, message, delivery.attempt, exhausted);
                if let Err(err) = self.publish(signal).await {
                    warn!(error = %err, "Could not publish step error");
                }
                Err(WorkflowError::Verifier {
                    stage: self.stage,
                    attempt: delivery.attempt,
                    source,
                })
            }
        }
    }

    async fn publish(&self, signal: StepSignal) -> WorkflowResult<()> {
        self.signals
            .publish(&signal)
            .await
            .map_err(WorkflowError::Signal)
    }
}

#[async_trait]
impl JobHandler for StageWorker {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn handle(&self, delivery: &Delivery) -> WorkflowResult<()> {
        self.process(delivery).await.map(|_| ())
    }
}

/// Consumer loop settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Deliveries handled at once
    pub concurrency: usize,
    /// Wait between polls of an empty queue
    pub poll_interval: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Registers `handler` as the consumer of `queue` until `shutdown` flips
///
/// Successful deliveries are acknowledged; failures are reported back to the
/// queue so its retry policy applies, except for errors no redelivery can
/// fix, which are dead-lettered at once. In-flight deliveries are drained
/// before returning.
pub async fn run_consumer(
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    options: ConsumerOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    let stage = queue.stage();
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut in_flight = JoinSet::new();
    info!(%stage, concurrency = options.concurrency, "Consumer started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        while let Some(joined) = in_flight.try_join_next() {
            if let Err(err) = joined {
                error!(%stage, error = %err, "Delivery task panicked");
            }
        }

        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        match queue.reserve().await {
            Ok(Some(delivery)) => {
                let queue = Arc::clone(&queue);
                let handler = Arc::clone(&handler);
                in_flight.spawn(async move {
                    settle(queue.as_ref(), handler.as_ref(), delivery).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                idle(&mut shutdown, options.poll_interval).await;
            }
            Err(err) => {
                drop(permit);
                warn!(%stage, error = %err, "Could not reserve a job");
                idle(&mut shutdown, options.poll_interval).await;
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(err) = joined {
            error!(%stage, error = %err, "Delivery task panicked");
        }
    }
    info!(%stage, "Consumer stopped");
}

async fn idle(shutdown: &mut watch::Receiver<bool>, interval: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        _ = shutdown.changed() => {}
    }
}

async fn settle(queue: &dyn JobQueue, handler: &dyn JobHandler, delivery: Delivery) {
    let job_id = delivery.job.id;
    let stage = delivery.job.stage;
    let application_id = delivery.job.application_id;

    let acknowledged = match handler.handle(&delivery).await {
        Ok(()) => queue.complete(job_id).await,
        Err(err) if !err.is_retryable() => {
            error!(%stage, %application_id, %job_id, error = %err, "Job cannot succeed, dead-lettering");
            queue.dead_letter(job_id, &err.to_string()).await
        }
        Err(err) => match queue.fail(job_id, &err.to_string()).await {
            Ok(FailureOutcome::Retrying { next_attempt, delay }) => {
                info!(
                    %stage,
                    %application_id,
                    %job_id,
                    next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Job will be retried"
                );
                Ok(())
            }
            Ok(FailureOutcome::DeadLettered) => {
                error!(%stage, %application_id, %job_id, error = %err, "Job attempts exhausted");
                Ok(())
            }
            Err(port_err) => Err(port_err),
        },
    };
    if let Err(err) = acknowledged {
        error!(%stage, %application_id, %job_id, error = %err, "Could not settle job with the queue");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VerifierError;
    use crate::queue::mock::InMemoryJobQueue;
    use crate::queue::RetryPolicy;
    use crate::signal::LocalSignalChannel;
    use core_kernel::ApplicationId;
    use domain_application::{Application, InMemoryApplicationStore, UserData};
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyVerifier {
        calls: AtomicU32,
        failures: u32,
    }

    #[async_trait]
    impl Verifier for FlakyVerifier {
        async fn verify(&self, _application_id: ApplicationId) -> Result<Value, VerifierError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(VerifierError::unavailable(format!("call {}", call)))
            } else {
                Ok(json!({"call": call}))
            }
        }
    }

    fn fast_guard() -> GuardConfig {
        GuardConfig {
            max_attempts: 5,
            interval: Duration::from_millis(1),
        }
    }

    async fn fixture(
        failures: u32,
    ) -> (Arc<InMemoryApplicationStore>, Arc<FlakyVerifier>, StageWorker, ApplicationId) {
        let store = Arc::new(InMemoryApplicationStore::new());
        let app = Application::new(UserData::default());
        store.insert(&app).await.unwrap();
        let verifier = Arc::new(FlakyVerifier {
            calls: AtomicU32::new(0),
            failures,
        });
        let worker = StageWorker::new(
            Stage::Policy,
            verifier.clone(),
            store.clone(),
            Arc::new(LocalSignalChannel::default()),
        )
        .with_guard(store.clone(), fast_guard());
        (store, verifier, worker, app.id)
    }

    async fn delivery_for(queue: &InMemoryJobQueue, id: ApplicationId) -> Delivery {
        queue.enqueue(id, Value::Null).await.unwrap();
        queue.reserve().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_process_completes_step() {
        let (store, _verifier, worker, id) = fixture(0).await;
        let queue = InMemoryJobQueue::new(Stage::Policy, RetryPolicy::default());
        let delivery = delivery_for(&queue, id).await;

        let outcome = worker.process(&delivery).await.unwrap();
        assert_eq!(outcome, StageOutcome::Completed(json!({"call": 1})));

        let stored = store.get(id).await.unwrap();
        assert_eq!(stored.status.step_status(Stage::Policy), Some(StepStatus::Complete));
        assert_eq!(stored.result_for(Stage::Policy), Some(&json!({"call": 1})));
        assert_eq!(stored.status.percent_complete, 20);
    }

    #[tokio::test]
    async fn test_redelivery_republishes_without_rerunning() {
        let (store, verifier, worker, id) = fixture(0).await;
        let queue = InMemoryJobQueue::new(Stage::Policy, RetryPolicy::default());
        let delivery = delivery_for(&queue, id).await;
        worker.process(&delivery).await.unwrap();

        let signals = Arc::new(LocalSignalChannel::default());
        let worker = StageWorker::new(Stage::Policy, verifier.clone(), store.clone(), signals.clone())
            .with_guard(store.clone(), fast_guard());
        let mut received = signals.subscribe().await.unwrap();

        let outcome = worker.process(&delivery).await.unwrap();
        assert_eq!(outcome, StageOutcome::Republished);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            received.next().await.unwrap().unwrap(),
            StepSignal::complete(id, Stage::Policy, json!({"call": 1}))
        );
        assert_eq!(store.snapshots(id).await.len(), 3);
    }

    #[tokio::test]
    async fn test_failure_before_budget_keeps_processing() {
        let (store, _verifier, worker, id) = fixture(1).await;
        let queue = InMemoryJobQueue::new(Stage::Policy, RetryPolicy::new(3, Duration::ZERO));
        let delivery = delivery_for(&queue, id).await;

        let err = worker.process(&delivery).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Verifier { attempt: 1, .. }));

        let step = store.get(id).await.unwrap().status.step(Stage::Policy).cloned().unwrap();
        assert_eq!(step.status, StepStatus::Processing);
        assert_eq!(step.last_error.as_deref(), Some("verification service unavailable: call 1"));
    }

    #[tokio::test]
    async fn test_failure_on_final_attempt_marks_failed() {
        let (store, _verifier, worker, id) = fixture(5).await;
        let queue = InMemoryJobQueue::new(Stage::Policy, RetryPolicy::new(1, Duration::ZERO));
        let delivery = delivery_for(&queue, id).await;

        worker.process(&delivery).await.unwrap_err();
        assert_eq!(
            store.get(id).await.unwrap().status.step_status(Stage::Policy),
            Some(StepStatus::Failed)
        );

        let again = worker.process(&delivery).await.unwrap();
        assert_eq!(again, StageOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_missing_application_is_not_found() {
        let (_store, _verifier, worker, _id) = fixture(0).await;
        let queue = InMemoryJobQueue::new(Stage::Policy, RetryPolicy::default());
        let delivery = delivery_for(&queue, ApplicationId::new()).await;
        let err = worker.process(&delivery).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_consumer_retries_until_success() {
        let (store, verifier, worker, id) = fixture(2).await;
        let queue = Arc::new(InMemoryJobQueue::new(Stage::Policy, RetryPolicy::new(5, Duration::ZERO)));
        queue.enqueue(id, Value::Null).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer = tokio::spawn(run_consumer(
            queue.clone(),
            Arc::new(worker),
            ConsumerOptions {
                concurrency: 2,
                poll_interval: Duration::from_millis(5),
            },
            shutdown_rx,
        ));

        for _ in 0..200 {
            if queue.completed_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown_tx.send(true).unwrap();
        consumer.await.unwrap();

        assert_eq!(queue.completed_count().await, 1);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            store.get(id).await.unwrap().status.step_status(Stage::Policy),
            Some(StepStatus::Complete)
        );
    }
}
