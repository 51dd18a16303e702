//! Worker process configuration

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use domain_application::{Stage, STAGE_ORDER};
use domain_workflow::{ConsumerOptions, GuardConfig, RetryPolicy};
use infra_db::RetentionPolicy;

/// Which parts of the pipeline this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Orchestrator and every configured stage worker
    All,
    /// Only the orchestrator, driven by step signals
    Orchestrator,
    /// Only the configured stage workers
    Worker,
}

impl Role {
    pub fn runs_orchestrator(self) -> bool {
        matches!(self, Role::All | Role::Orchestrator)
    }

    pub fn runs_workers(self) -> bool {
        matches!(self, Role::All | Role::Worker)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Worker configuration
///
/// Every field has a default; `WORKER_*` environment variables override them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Database URL
    pub database_url: String,
    /// Pool size for queries; each signal subscriber adds one connection
    pub max_connections: u32,
    /// Log level
    pub log_level: String,
    /// Emit logs as JSON lines
    pub log_json: bool,
    pub role: Role,
    /// Stages this process consumes, when it runs workers
    pub stages: Vec<Stage>,
    /// Deliveries handled at once per stage
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub retry_attempts: u32,
    /// Delay after the first failed attempt, doubled after each further one
    pub retry_backoff_ms: u64,
    pub guard_max_attempts: u32,
    pub guard_interval_ms: u64,
    /// Pause between inserting an application and starting it
    pub start_delay_ms: u64,
    /// Lease on a reserved job before it is handed out again
    pub job_lock_secs: u64,
    /// Artificial latency of the simulated verifiers
    pub verifier_latency_ms: u64,
    /// Applications resumed when the orchestrator starts
    pub resume_limit: u32,
    /// Age after which finished jobs and signals are deleted; 0 keeps them
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/underwriting".to_string(),
            max_connections: 10,
            log_level: "info".to_string(),
            log_json: false,
            role: Role::All,
            stages: STAGE_ORDER.to_vec(),
            concurrency: 1,
            poll_interval_ms: 250,
            retry_attempts: 10,
            retry_backoff_ms: 2000,
            guard_max_attempts: 40,
            guard_interval_ms: 500,
            start_delay_ms: 0,
            job_lock_secs: 60,
            verifier_latency_ms: 0,
            resume_limit: 1000,
            retention_secs: 7 * 24 * 3600,
            sweep_interval_secs: 3600,
        }
    }
}

impl WorkerConfig {
    /// Loads configuration from `WORKER_*` environment variables
    ///
    /// `WORKER_STAGES` takes a comma separated list, e.g. `dmv,credit`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let source = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("WORKER")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("stages"),
            )
            .build()?;
        Self::from_config(source)
    }

    /// Deserializes and validates an already built configuration
    pub fn from_config(source: config::Config) -> Result<Self, ConfigError> {
        let config: WorkerConfig = source.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_attempts == 0 {
            return Err(ConfigError::Invalid("retry_attempts must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.guard_max_attempts == 0 {
            return Err(ConfigError::Invalid("guard_max_attempts must be at least 1".into()));
        }
        if self.role.runs_workers() && self.stages.is_empty() {
            return Err(ConfigError::Invalid("no stages configured for a worker process".into()));
        }
        if self.retention_secs > 0 && self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep_interval_secs must be at least 1".into()));
        }
        if self.database_url.is_empty() {
            return Err(ConfigError::Invalid("database_url is empty".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, Duration::from_millis(self.retry_backoff_ms))
    }

    pub fn guard(&self) -> GuardConfig {
        GuardConfig {
            max_attempts: self.guard_max_attempts,
            interval: Duration::from_millis(self.guard_interval_ms),
        }
    }

    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            concurrency: self.concurrency,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn job_lock(&self) -> Duration {
        Duration::from_secs(self.job_lock_secs)
    }

    /// The retention sweep, unless disabled
    pub fn retention(&self) -> Option<RetentionPolicy> {
        (self.retention_secs > 0).then(|| RetentionPolicy {
            max_age: Duration::from_secs(self.retention_secs),
            interval: Duration::from_secs(self.sweep_interval_secs),
        })
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn verifier_latency(&self) -> Duration {
        Duration::from_millis(self.verifier_latency_ms)
    }
}
