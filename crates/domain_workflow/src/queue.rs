//! Stage job queues
//!
//! Each stage owns one durable queue, named after the stage. Delivery is
//! at-least-once: a job is redelivered until a consumer acknowledges it or
//! its attempt budget runs out, with exponential backoff between attempts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use core_kernel::{ApplicationId, DomainPort, JobId, PortError};
use domain_application::{Stage, STAGE_ORDER};

/// A unit of work for one stage and one application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub application_id: ApplicationId,
    pub stage: Stage,
    /// Outcome of the previous stage, or null for the first stage
    pub input: Value,
    pub enqueued_at: DateTime<Utc>,
}

/// One attempt at processing a job
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub job: Job,
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
}

impl Delivery {
    /// True when a failure of this attempt exhausts the budget
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Broker-side retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubled after each further one
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self { max_attempts, backoff }
    }

    /// Delay before the next attempt after `attempts_made` failures
    pub fn backoff_for(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(31);
        self.backoff.saturating_mul(1u32 << exponent)
    }

    /// Decides what follows a failed attempt
    pub fn outcome_after(&self, attempts_made: u32) -> FailureOutcome {
        if attempts_made >= self.max_attempts {
            FailureOutcome::DeadLettered
        } else {
            FailureOutcome::Retrying {
                next_attempt: attempts_made + 1,
                delay: self.backoff_for(attempts_made),
            }
        }
    }
}

/// Error recorded on a job whose consumer stopped renewing it
pub const LEASE_EXPIRED: &str = "lease expired";

/// What an enqueue call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A new job was added
    Created(JobId),
    /// The application already had a waiting or reserved job on this queue
    AlreadyLive(JobId),
}

impl Enqueued {
    pub fn job_id(self) -> JobId {
        match self {
            Enqueued::Created(id) | Enqueued::AlreadyLive(id) => id,
        }
    }

    pub fn is_created(self) -> bool {
        matches!(self, Enqueued::Created(_))
    }
}

/// What the broker does with a failed delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { next_attempt: u32, delay: Duration },
    DeadLettered,
}

/// A durable per-stage job queue
#[async_trait]
pub trait JobQueue: DomainPort {
    /// The stage this queue feeds
    fn stage(&self) -> Stage;

    /// Adds a job for an application
    ///
    /// At most one job per application is waiting or reserved on a queue at
    /// any time; while one is, this returns its id instead of adding another.
    async fn enqueue(&self, application_id: ApplicationId, input: Value) -> Result<Enqueued, PortError>;

    /// Takes the oldest due job, if any
    async fn reserve(&self) -> Result<Option<Delivery>, PortError>;

    /// Acknowledges a processed job
    async fn complete(&self, job_id: JobId) -> Result<(), PortError>;

    /// Reports a failed attempt and schedules a retry if the budget allows
    async fn fail(&self, job_id: JobId, error: &str) -> Result<FailureOutcome, PortError>;

    /// Moves a job straight to the dead letters, skipping any remaining attempts
    async fn dead_letter(&self, job_id: JobId, error: &str) -> Result<(), PortError>;
}

/// One queue per stage
#[derive(Clone)]
pub struct StageQueues {
    queues: [Arc<dyn JobQueue>; STAGE_ORDER.len()],
}

impl StageQueues {
    /// Builds the queue set by asking `build` for each stage's queue
    pub fn from_fn(mut build: impl FnMut(Stage) -> Arc<dyn JobQueue>) -> Self {
        Self {
            queues: std::array::from_fn(|index| build(STAGE_ORDER[index])),
        }
    }

    /// The queue bound to a stage
    pub fn get(&self, stage: Stage) -> &Arc<dyn JobQueue> {
        &self.queues[stage.position()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Stage, &Arc<dyn JobQueue>)> {
        STAGE_ORDER.iter().copied().zip(self.queues.iter())
    }
}

impl std::fmt::Debug for StageQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.queues.iter().map(|queue| queue.stage()))
            .finish()
    }
}

/// In-memory broker for tests and single-process runs
#[cfg(any(test, feature = "mock"))]
pub mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use tokio::sync::Mutex;
    use tokio::time::Instant;

    use core_kernel::{AdapterHealth, HealthCheckResult, HealthCheckable};

    #[derive(Debug)]
    struct QueuedJob {
        job: Job,
        attempts_made: u32,
        available_at: Instant,
    }

    #[derive(Debug, Default)]
    struct QueueState {
        waiting: VecDeque<JobId>,
        jobs: HashMap<JobId, QueuedJob>,
        dead_letters: Vec<(Job, String)>,
        completed: Vec<JobId>,
        enqueued: usize,
    }

    /// In-memory mock implementation of JobQueue
    #[derive(Debug)]
    pub struct InMemoryJobQueue {
        stage: Stage,
        policy: RetryPolicy,
        state: Mutex<QueueState>,
    }

    impl InMemoryJobQueue {
        pub fn new(stage: Stage, policy: RetryPolicy) -> Self {
            Self {
                stage,
                policy,
                state: Mutex::new(QueueState::default()),
            }
        }

        /// Total number of jobs ever enqueued
        pub async fn enqueued_count(&self) -> usize {
            self.state.lock().await.enqueued
        }

        /// Jobs enqueued for one application, in enqueue order
        pub async fn jobs_for(&self, application_id: ApplicationId) -> Vec<Job> {
            let state = self.state.lock().await;
            let mut jobs: Vec<Job> = state
                .jobs
                .values()
                .map(|queued| queued.job.clone())
                .chain(state.dead_letters.iter().map(|(job, _)| job.clone()))
                .filter(|job| job.application_id == application_id)
                .collect();
            jobs.sort_by_key(|job| job.enqueued_at);
            jobs
        }

        pub async fn dead_letters(&self) -> Vec<(Job, String)> {
            self.state.lock().await.dead_letters.clone()
        }

        pub async fn completed_count(&self) -> usize {
            self.state.lock().await.completed.len()
        }

        /// Jobs waiting or reserved
        pub async fn outstanding(&self) -> usize {
            self.state.lock().await.jobs.len()
        }

        /// Acts as if the consumer holding `job_id` died
        ///
        /// The stalled attempt counts against the budget: the job is either
        /// due again at once or, with the budget spent, dead-lettered.
        pub async fn expire_lease(&self, job_id: JobId) -> Option<FailureOutcome> {
            let mut state = self.state.lock().await;
            if state.waiting.contains(&job_id) {
                return None;
            }
            let queued = state.jobs.get_mut(&job_id)?;
            queued.attempts_made += 1;
            if queued.attempts_made >= self.policy.max_attempts {
                let queued = state.jobs.remove(&job_id)?;
                state.dead_letters.push((queued.job, LEASE_EXPIRED.to_string()));
                return Some(FailureOutcome::DeadLettered);
            }
            queued.available_at = Instant::now();
            let next_attempt = queued.attempts_made + 1;
            state.waiting.push_front(job_id);
            Some(FailureOutcome::Retrying {
                next_attempt,
                delay: Duration::ZERO,
            })
        }
    }

    impl DomainPort for InMemoryJobQueue {}

    #[async_trait]
    impl HealthCheckable for InMemoryJobQueue {
        async fn health_check(&self) -> HealthCheckResult {
            HealthCheckResult::new(
                format!("in-memory-queue-{}", self.stage),
                AdapterHealth::Healthy,
                0,
            )
        }
    }

    #[async_trait]
    impl JobQueue for InMemoryJobQueue {
        fn stage(&self) -> Stage {
            self.stage
        }

        async fn enqueue(&self, application_id: ApplicationId, input: Value) -> Result<Enqueued, PortError> {
            let mut state = self.state.lock().await;
            if let Some(live) = state
                .jobs
                .values()
                .find(|queued| queued.job.application_id == application_id)
            {
                return Ok(Enqueued::AlreadyLive(live.job.id));
            }
            let job = Job {
                id: JobId::new(),
                application_id,
                stage: self.stage,
                input,
                enqueued_at: Utc::now(),
            };
            let id = job.id;
            state.jobs.insert(
                id,
                QueuedJob {
                    job,
                    attempts_made: 0,
                    available_at: Instant::now(),
                },
            );
            state.waiting.push_back(id);
            state.enqueued += 1;
            Ok(Enqueued::Created(id))
        }

        async fn reserve(&self) -> Result<Option<Delivery>, PortError> {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let due = state.waiting.iter().position(|id| {
                state
                    .jobs
                    .get(id)
                    .map(|queued| queued.available_at <= now)
                    .unwrap_or(false)
            });
            let Some(index) = due else {
                return Ok(None);
            };
            let Some(id) = state.waiting.remove(index) else {
                return Ok(None);
            };
            Ok(state.jobs.get(&id).map(|queued| Delivery {
                job: queued.job.clone(),
                attempt: queued.attempts_made + 1,
                max_attempts: self.policy.max_attempts,
            }))
        }

        async fn complete(&self, job_id: JobId) -> Result<(), PortError> {
            let mut state = self.state.lock().await;
            state
                .jobs
                .remove(&job_id)
                .ok_or_else(|| PortError::not_found("Job", job_id))?;
            state.completed.push(job_id);
            Ok(())
        }

        async fn fail(&self, job_id: JobId, error: &str) -> Result<FailureOutcome, PortError> {
            let mut state = self.state.lock().await;
            let queued = state
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| PortError::not_found("Job", job_id))?;
            queued.attempts_made += 1;
            let outcome = self.policy.outcome_after(queued.attempts_made);
            match outcome {
                FailureOutcome::Retrying { delay, .. } => {
                    queued.available_at = Instant::now() + delay;
                    state.waiting.push_back(job_id);
                }
                FailureOutcome::DeadLettered => {
                    if let Some(queued) = state.jobs.remove(&job_id) {
                        state.dead_letters.push((queued.job, error.to_string()));
                    }
                }
            }
            Ok(outcome)
        }

        async fn dead_letter(&self, job_id: JobId, error: &str) -> Result<(), PortError> {
            let mut state = self.state.lock().await;
            let queued = state
                .jobs
                .remove(&job_id)
                .ok_or_else(|| PortError::not_found("Job", job_id))?;
            state.waiting.retain(|id| *id != job_id);
            state.dead_letters.push((queued.job, error.to_string()));
            Ok(())
        }
    }

    /// One in-memory queue per stage, sharing a retry policy
    #[derive(Debug, Clone)]
    pub struct InMemoryBroker {
        queues: Vec<Arc<InMemoryJobQueue>>,
    }

    impl InMemoryBroker {
        pub fn new(policy: RetryPolicy) -> Self {
            Self {
                queues: STAGE_ORDER
                    .iter()
                    .map(|stage| Arc::new(InMemoryJobQueue::new(*stage, policy)))
                    .collect(),
            }
        }

        /// The concrete queue of a stage
        pub fn queue(&self, stage: Stage) -> Arc<InMemoryJobQueue> {
            Arc::clone(&self.queues[stage.position()])
        }

        /// The queues as ports
        pub fn stage_queues(&self) -> StageQueues {
            StageQueues::from_fn(|stage| self.queue(stage) as Arc<dyn JobQueue>)
        }

        pub async fn enqueued_count(&self, stage: Stage) -> usize {
            self.queue(stage).enqueued_count().await
        }
    }

    impl Default for InMemoryBroker {
        fn default() -> Self {
            Self::new(RetryPolicy::default())
        }
    }
}
