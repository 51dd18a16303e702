//! Workflow orchestrator
//!
//! Decides which stage runs next. The pipeline is strictly linear: a
//! completed stage enqueues its successor, the last stage stops the
//! workflow, and a stage name outside the pipeline errors it. The outcome
//! of a stage is passed along as the next job's input but never inspected.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use core_kernel::{ApplicationId, JobId, PortError};
use domain_application::{ApplicationError, ApplicationStore, Stage, StepStatus, Transition};

use crate::aggregator::StatusAggregator;
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::{TracingObserver, WorkflowEvent, WorkflowObserver};
use crate::queue::{Enqueued, StageQueues};
use crate::signal::{SignalChannel, SignalStream, StepSignal};

/// What the orchestrator did in response to a completion or a resume
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// A job for `stage` was enqueued
    Enqueued { stage: Stage, job_id: JobId },
    /// `stage` had already left `pending`, so no job was enqueued
    Skipped { stage: Stage, status: StepStatus },
    /// A job for `stage` was already waiting or reserved
    AlreadyQueued { stage: Stage, job_id: JobId },
    /// The workflow reached STOP
    Completed,
    /// The workflow is finished, errored, or has a failed step
    Settled,
}

pub struct Orchestrator {
    store: Arc<dyn ApplicationStore>,
    queues: StageQueues,
    aggregator: StatusAggregator,
    observer: Arc<dyn WorkflowObserver>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn ApplicationStore>, queues: StageQueues) -> Self {
        Self {
            aggregator: StatusAggregator::new(store.clone()),
            store,
            queues,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn WorkflowObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Enqueues the first stage's job
    ///
    /// Starting twice yields the job already queued by the first call.
    #[instrument(skip(self), fields(application_id = %id))]
    pub async fn start(&self, id: ApplicationId) -> WorkflowResult<JobId> {
        let enqueued = self.enqueue(id, Stage::first(), Value::Null).await?;
        if enqueued.is_created() {
            self.observer.on_event(&WorkflowEvent::WorkflowStarted {
                application_id: id,
                job_id: enqueued.job_id(),
            });
        }
        Ok(enqueued.job_id())
    }

    /// Moves the workflow past `completed_stage`
    ///
    /// Does not wait for the next stage to run.
    #[instrument(skip(self, outcome), fields(application_id = %id))]
    pub async fn advance(
        &self,
        id: ApplicationId,
        completed_stage: &str,
        outcome: Value,
    ) -> WorkflowResult<Advance> {
        match Transition::after(completed_stage) {
            Ok(Transition::Run(next)) => self.run_stage(id, next, outcome).await,
            Ok(Transition::Stop) => self.stop(id).await,
            Err(ApplicationError::UnknownStage(name)) => {
                let reason = format!("unknown stage '{}'", name);
                let change = self.aggregator.mark_errored(id, &reason).await?;
                if change.changed {
                    self.observer.on_event(&WorkflowEvent::WorkflowErrored {
                        application_id: id,
                        reason,
                    });
                }
                Err(WorkflowError::UnknownStage(name))
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Rebuilds a run from its persisted status
    ///
    /// Re-enqueues the first incomplete stage when it is pending or was in
    /// flight, and performs STOP when every stage completed but the workflow
    /// was never marked complete. A stage whose job is still queued is left
    /// to that job.
    #[instrument(skip(self), fields(application_id = %id))]
    pub async fn resume(&self, id: ApplicationId) -> WorkflowResult<Advance> {
        let application = self
            .store
            .find_by_id(id)
            .await
            .map_err(WorkflowError::StoreRead)?
            .ok_or(WorkflowError::NotFound(id))?;

        if application.status.is_settled() {
            return Ok(Advance::Settled);
        }
        let Some(stage) = application.status.current_stage() else {
            return self.stop(id).await;
        };
        let input = stage
            .previous()
            .and_then(|previous| application.result_for(previous).cloned())
            .unwrap_or(Value::Null);
        let advance = Self::queued(stage, self.enqueue(id, stage, input).await?);
        match &advance {
            Advance::Enqueued { job_id, .. } => info!(%stage, %job_id, "Resumed workflow"),
            _ => debug!(%stage, "Stage job still queued, nothing to resume"),
        }
        Ok(advance)
    }

    /// Resumes every unfinished application, returning how many were resumed
    pub async fn resume_in_flight(&self, limit: u32) -> WorkflowResult<usize> {
        let ids = self
            .store
            .find_in_flight(limit)
            .await
            .map_err(WorkflowError::StoreRead)?;
        let mut resumed = 0;
        for id in ids {
            match self.resume(id).await {
                Ok(Advance::Enqueued { .. }) | Ok(Advance::Completed) => resumed += 1,
                Ok(_) => {}
                Err(err) => warn!(application_id = %id, error = %err, "Could not resume workflow"),
            }
        }
        info!(resumed, "Resumed in-flight workflows");
        Ok(resumed)
    }

    /// Subscribes to `signals` and advances workflows until `shutdown` flips
    pub async fn run(
        &self,
        signals: &dyn SignalChannel,
        shutdown: watch::Receiver<bool>,
    ) -> WorkflowResult<()> {
        let stream = signals.subscribe().await.map_err(WorkflowError::Signal)?;
        self.drive(stream, shutdown).await
    }

    /// Advances workflows from an existing subscription
    pub async fn drive(
        &self,
        mut stream: SignalStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> WorkflowResult<()> {
        info!("Orchestrator listening for step signals");
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = shutdown.changed() => break,
            };
            match next {
                Some(Ok(signal)) => self.on_signal(signal).await,
                Some(Err(err)) => warn!(error = %err, "Could not receive step signal"),
                None => {
                    return Err(WorkflowError::Signal(PortError::connection(
                        "signal stream closed",
                    )))
                }
            }
        }
        info!("Orchestrator stopped");
        Ok(())
    }

    async fn on_signal(&self, signal: StepSignal) {
        match signal {
            StepSignal::Complete {
                application_id,
                current_stage,
                data,
            } => match self.advance(application_id, &current_stage, data).await {
                Ok(advance) => debug!(%application_id, ?advance, "Advanced workflow"),
                Err(err) => error!(
                    %application_id,
                    stage = %current_stage,
                    error = %err,
                    "Could not advance workflow"
                ),
            },
            StepSignal::Error {
                application_id,
                stage,
                error,
                attempt,
                exhausted,
            } => {
                if exhausted {
                    error!(%application_id, %stage, attempt, %error, "Stage failed for good");
                } else {
                    debug!(%application_id, %stage, attempt, %error, "Stage attempt failed");
                }
            }
        }
    }

    async fn run_stage(&self, id: ApplicationId, next: Stage, input: Value) -> WorkflowResult<Advance> {
        let current = self
            .store
            .find_by_id(id)
            .await
            .map_err(WorkflowError::StoreRead)?;
        if let Some(application) = current {
            if application.status.error.is_some() || application.status.completed {
                return Ok(Advance::Settled);
            }
            match application.status.step_status(next) {
                Some(StepStatus::Pending) | None => {}
                Some(status) => {
                    debug!(stage = %next, ?status, "Next stage already started, ignoring duplicate");
                    return Ok(Advance::Skipped { stage: next, status });
                }
            }
        }
        Ok(Self::queued(next, self.enqueue(id, next, input).await?))
    }

    /// STOP; an errored workflow or one with a failed step stays as it is
    async fn stop(&self, id: ApplicationId) -> WorkflowResult<Advance> {
        let change = self.aggregator.mark_completed(id).await?;
        if change.changed {
            self.observer.on_event(&WorkflowEvent::WorkflowCompleted { application_id: id });
            return Ok(Advance::Completed);
        }
        if let Some(reason) = &change.application.status.error {
            warn!(application_id = %id, %reason, "Errored workflow reached STOP, left errored");
        }
        Ok(Advance::Settled)
    }

    fn queued(stage: Stage, enqueued: Enqueued) -> Advance {
        match enqueued {
            Enqueued::Created(job_id) => Advance::Enqueued { stage, job_id },
            Enqueued::AlreadyLive(job_id) => Advance::AlreadyQueued { stage, job_id },
        }
    }

    async fn enqueue(&self, id: ApplicationId, stage: Stage, input: Value) -> WorkflowResult<Enqueued> {
        let enqueued = self
            .queues
            .get(stage)
            .enqueue(id, input)
            .await
            .map_err(WorkflowError::Queue)?;
        match enqueued {
            Enqueued::Created(job_id) => debug!(application_id = %id, %stage, %job_id, "Enqueued stage job"),
            Enqueued::AlreadyLive(job_id) => {
                debug!(application_id = %id, %stage, %job_id, "Stage job already queued")
            }
        }
        Ok(enqueued)
    }
}
