//! PostgreSQL Job Queue Adapter
//!
//! One `PostgresJobQueue` per stage, all sharing the `stage_jobs` table.
//! Reserving a job takes a lease; if the consumer dies mid-job the lease
//! runs out and the job is claimed again as its next attempt, or buried
//! when that stalled attempt was its last.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, instrument, warn};

use core_kernel::{ApplicationId, DomainPort, HealthCheckable, HealthCheckResult, JobId, PortError};
use domain_application::Stage;
use domain_workflow::{
    Delivery, Enqueued, FailureOutcome, Job, JobQueue, RetryPolicy, StageQueues, LEASE_EXPIRED,
};

use crate::adapters::ping;
use crate::repositories::{JobRepository, JobRow};

/// Default time a reserved job stays invisible to other consumers
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

/// Insert attempts when the live job finishes between insert and lookup
const ENQUEUE_RACE_RETRIES: usize = 3;

/// PostgreSQL-backed implementation of the JobQueue trait
#[derive(Debug, Clone)]
pub struct PostgresJobQueue {
    repository: JobRepository,
    pool: PgPool,
    stage: Stage,
    policy: RetryPolicy,
    lease: Duration,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool, stage: Stage, policy: RetryPolicy) -> Self {
        Self {
            repository: JobRepository::new(pool.clone()),
            pool,
            stage,
            policy,
            lease: DEFAULT_LEASE,
        }
    }

    /// Sets how long a reserved job is held before it becomes due again
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn repository(&self) -> &JobRepository {
        &self.repository
    }

    /// Builds one queue per stage over the same pool
    pub fn stage_queues(pool: PgPool, policy: RetryPolicy, lease: Duration) -> StageQueues {
        StageQueues::from_fn(|stage| {
            Arc::new(Self::new(pool.clone(), stage, policy).with_lease(lease)) as Arc<dyn JobQueue>
        })
    }

    fn row_to_delivery(&self, row: JobRow) -> Result<Delivery, PortError> {
        let stage: Stage = row
            .queue
            .parse()
            .map_err(|_| PortError::internal(format!("job {} sits on unknown queue '{}'", row.id, row.queue)))?;
        Ok(Delivery {
            job: Job {
                id: JobId::from(row.id),
                application_id: ApplicationId::from(row.application_id),
                stage,
                input: row.input,
                enqueued_at: row.enqueued_at,
            },
            attempt: u32::try_from(row.attempts_made).unwrap_or(0) + 1,
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(self.policy.max_attempts),
        })
    }
}

impl DomainPort for PostgresJobQueue {}

#[async_trait]
impl HealthCheckable for PostgresJobQueue {
    async fn health_check(&self) -> HealthCheckResult {
        ping(&self.pool, &format!("postgres-job-queue-{}", self.stage)).await
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    fn stage(&self) -> Stage {
        self.stage
    }

    #[instrument(skip(self, input), fields(stage = %self.stage))]
    async fn enqueue(&self, application_id: ApplicationId, input: Value) -> Result<Enqueued, PortError> {
        let max_attempts = i32::try_from(self.policy.max_attempts).unwrap_or(i32::MAX);
        for _ in 0..ENQUEUE_RACE_RETRIES {
            let id = JobId::new();
            let inserted = self
                .repository
                .insert(id.into(), self.stage.as_str(), application_id.into(), &input, max_attempts)
                .await?;
            if inserted {
                debug!(job_id = %id, "Enqueued job");
                return Ok(Enqueued::Created(id));
            }
            if let Some(live) = self
                .repository
                .find_live(self.stage.as_str(), application_id.into())
                .await?
            {
                debug!(job_id = %live, "Job already live");
                return Ok(Enqueued::AlreadyLive(JobId::from(live)));
            }
        }
        Err(PortError::conflict(format!(
            "live {} job of application {} kept changing",
            self.stage, application_id
        )))
    }

    #[instrument(skip(self), fields(stage = %self.stage))]
    async fn reserve(&self) -> Result<Option<Delivery>, PortError> {
        let buried = self
            .repository
            .bury_stalled(self.stage.as_str(), LEASE_EXPIRED)
            .await?;
        for (job_id, application_id) in buried {
            warn!(%job_id, %application_id, "Stalled job exhausted its attempts, moved to dead letters");
        }
        let row = self.repository.claim_next(self.stage.as_str(), self.lease).await?;
        row.map(|row| self.row_to_delivery(row)).transpose()
    }

    #[instrument(skip(self), fields(stage = %self.stage))]
    async fn complete(&self, job_id: JobId) -> Result<(), PortError> {
        if self.repository.mark_completed(job_id.into()).await? {
            Ok(())
        } else {
            Err(PortError::not_found("Job", job_id))
        }
    }

    #[instrument(skip(self, error), fields(stage = %self.stage))]
    async fn fail(&self, job_id: JobId, error: &str) -> Result<FailureOutcome, PortError> {
        let backoff = self.policy.backoff;
        let decide = |attempts_made: i32, max_attempts: i32| {
            let policy = RetryPolicy::new(max_attempts.max(1) as u32, backoff);
            match policy.outcome_after(attempts_made.max(0) as u32) {
                FailureOutcome::Retrying { delay, .. } => Some(delay),
                FailureOutcome::DeadLettered => None,
            }
        };

        let attempt = self
            .repository
            .record_failure(job_id.into(), error, decide)
            .await?
            .ok_or_else(|| PortError::not_found("Job", job_id))?;

        let outcome = match attempt.retry_in {
            Some(delay) => FailureOutcome::Retrying {
                next_attempt: attempt.attempts_made as u32 + 1,
                delay,
            },
            None => {
                warn!(job_id = %job_id, attempts = attempt.attempts_made, "Job exhausted its attempts");
                FailureOutcome::DeadLettered
            }
        };
        Ok(outcome)
    }

    #[instrument(skip(self, error), fields(stage = %self.stage))]
    async fn dead_letter(&self, job_id: JobId, error: &str) -> Result<(), PortError> {
        if self.repository.bury(job_id.into(), error).await? {
            warn!(job_id = %job_id, error, "Job moved to dead letters");
            Ok(())
        } else {
            Err(PortError::not_found("Job", job_id))
        }
    }
}
