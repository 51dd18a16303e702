//! PostgreSQL Signal Channel Adapter
//!
//! Carries step signals between processes with LISTEN/NOTIFY. Publishing
//! stores the signal in `step_signals` and notifies its id; each subscriber
//! owns a dedicated listener connection and loads the row it is told about.
//!
//! NOTIFY is not durable: a subscriber that is disconnected misses what was
//! published meanwhile. The orchestrator resumes in-flight applications on
//! start to cover that gap.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use core_kernel::{DomainPort, HealthCheckable, HealthCheckResult, PortError, SignalId};
use domain_workflow::{SignalChannel, SignalStream, StepSignal};

use crate::adapters::ping;
use crate::error::DatabaseError;
use crate::repositories::SignalRepository;

/// Default NOTIFY channel for step signals
pub const SIGNAL_CHANNEL: &str = "step_signals";

/// PostgreSQL-backed implementation of the SignalChannel trait
#[derive(Debug, Clone)]
pub struct PostgresSignalChannel {
    repository: SignalRepository,
    pool: PgPool,
    channel: String,
}

impl PostgresSignalChannel {
    pub fn new(pool: PgPool) -> Self {
        Self::with_channel(pool, SIGNAL_CHANNEL)
    }

    /// Uses a different NOTIFY channel, isolating one deployment from another
    pub fn with_channel(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            repository: SignalRepository::new(pool.clone()),
            pool,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn repository(&self) -> &SignalRepository {
        &self.repository
    }
}

impl DomainPort for PostgresSignalChannel {}

#[async_trait]
impl HealthCheckable for PostgresSignalChannel {
    async fn health_check(&self) -> HealthCheckResult {
        ping(&self.pool, "postgres-signal-channel").await
    }
}

/// Loads the signal a notification points at
async fn load_signal(repository: &SignalRepository, payload: &str) -> Result<Option<StepSignal>, PortError> {
    let id = Uuid::parse_str(payload)
        .map_err(|e| PortError::serialization(format!("bad signal id '{}': {}", payload, e)))?;
    let Some(value) = repository.find_payload(id).await? else {
        return Ok(None);
    };
    let signal = serde_json::from_value(value).map_err(DatabaseError::from)?;
    Ok(Some(signal))
}

#[async_trait]
impl SignalChannel for PostgresSignalChannel {
    #[instrument(skip(self, signal), fields(application_id = %signal.application_id(), event = signal.name()))]
    async fn publish(&self, signal: &StepSignal) -> Result<(), PortError> {
        let id = SignalId::new();
        let payload = serde_json::to_value(signal).map_err(DatabaseError::from)?;
        self.repository
            .insert_and_notify(
                &self.channel,
                id.into(),
                signal.application_id().into(),
                signal.name(),
                &payload,
            )
            .await?;
        debug!(signal_id = %id, "Published step signal");
        Ok(())
    }

    async fn subscribe(&self) -> Result<SignalStream, PortError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| PortError::connection(format!("failed to open listener: {}", e)))?;
        listener
            .listen(&self.channel)
            .await
            .map_err(|e| PortError::connection(format!("failed to listen on '{}': {}", self.channel, e)))?;
        debug!(channel = %self.channel, "Subscribed to step signals");

        let state = Some((listener, self.repository.clone()));
        let stream = stream::unfold(state, |state| async move {
            let (mut listener, repository) = state?;
            loop {
                let notification = match listener.recv().await {
                    Ok(notification) => notification,
                    Err(e) => {
                        error!(error = %e, "Signal listener failed");
                        let err = PortError::connection(format!("signal listener failed: {}", e));
                        return Some((Err(err), None));
                    }
                };
                match load_signal(&repository, notification.payload()).await {
                    Ok(Some(signal)) => return Some((Ok(signal), Some((listener, repository)))),
                    Ok(None) => {
                        warn!(signal_id = notification.payload(), "Notified signal not found");
                    }
                    Err(e) => return Some((Err(e), Some((listener, repository)))),
                }
            }
        });
        Ok(stream.boxed())
    }
}
