//! Retention sweep
//!
//! Finished jobs and delivered signals are only kept for inspection. The
//! sweep deletes completed and dead jobs, and signals, once they are older
//! than the configured age. Live jobs are never touched.

use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::repositories::{JobRepository, SignalRepository};

/// How long finished rows are kept, and how often to look
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(7 * 24 * 3600),
            interval: Duration::from_secs(3600),
        }
    }
}

/// Rows deleted by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub jobs: u64,
    pub signals: u64,
}

#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    jobs: JobRepository,
    signals: SignalRepository,
    policy: RetentionPolicy,
}

impl RetentionSweeper {
    pub fn new(pool: PgPool, policy: RetentionPolicy) -> Self {
        Self {
            jobs: JobRepository::new(pool.clone()),
            signals: SignalRepository::new(pool),
            policy,
        }
    }

    /// Deletes everything past the retention age once
    pub async fn sweep(&self) -> Result<SweepReport, DatabaseError> {
        // ages beyond chrono's range keep everything
        let max_age = chrono::Duration::from_std(self.policy.max_age)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - max_age;
        let report = SweepReport {
            jobs: self.jobs.prune_finished(cutoff).await?,
            signals: self.signals.prune_older_than(cutoff).await?,
        };
        debug!(jobs = report.jobs, signals = report.signals, %cutoff, "Retention sweep done");
        Ok(report)
    }

    /// Sweeps every `interval` until `shutdown` flips
    ///
    /// A failed sweep is logged and retried on the next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            max_age_secs = self.policy.max_age.as_secs(),
            interval_secs = self.policy.interval.as_secs(),
            "Retention sweeper started"
        );
        let mut ticker = tokio::time::interval(self.policy.interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            match self.sweep().await {
                Ok(report) if report.jobs + report.signals > 0 => {
                    info!(jobs = report.jobs, signals = report.signals, "Pruned finished rows");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "Retention sweep failed"),
            }
        }
        info!("Retention sweeper stopped");
    }
}
