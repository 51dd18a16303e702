//! Stage job repository
//!
//! Jobs live in `stage_jobs`, one row per job, with the stage name as the
//! queue. Workers claim due jobs with `FOR UPDATE SKIP LOCKED` and hold a
//! lease; an expired lease makes the job due again and costs it an attempt.
//! A partial unique index keeps one live job per application and queue.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::DatabaseError;

/// A claimed row of `stage_jobs`
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: Uuid,
    pub queue: String,
    pub application_id: Uuid,
    pub input: Value,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub enqueued_at: DateTime<Utc>,
}

impl JobRow {
    fn from_row(row: &PgRow) -> Result<Self, DatabaseError> {
        Ok(Self {
            id: row.try_get("id")?,
            queue: row.try_get("queue")?,
            application_id: row.try_get("application_id")?,
            input: row.try_get("input")?,
            attempts_made: row.try_get("attempts_made")?,
            max_attempts: row.try_get("max_attempts")?,
            enqueued_at: row.try_get("enqueued_at")?,
        })
    }
}

/// Attempt counters of a job after a recorded failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedAttempt {
    pub attempts_made: i32,
    pub max_attempts: i32,
    /// Set when the job was rescheduled rather than buried
    pub retry_in: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct JobRepository {
    pool: PgPool,
}

impl JobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts a waiting job; false if the application already has a live
    /// job on `queue`
    pub async fn insert(
        &self,
        id: Uuid,
        queue: &str,
        application_id: Uuid,
        input: &Value,
        max_attempts: i32,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r#"
            INSERT INTO stage_jobs (id, queue, application_id, input, max_attempts)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (application_id, queue) WHERE state IN ('waiting', 'active')
            DO NOTHING
            "#,
        )
        .bind(id)
        .bind(queue)
        .bind(application_id)
        .bind(input)
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// The waiting or active job of an application on `queue`
    pub async fn find_live(&self, queue: &str, application_id: Uuid) -> Result<Option<Uuid>, DatabaseError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id
            FROM stage_jobs
            WHERE queue = $1 AND application_id = $2 AND state IN ('waiting', 'active')
            "#,
        )
        .bind(queue)
        .bind(application_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    /// Buries expired jobs of `queue` whose stalled attempt was their last
    ///
    /// Returns `(job id, application id)` of each buried job.
    pub async fn bury_stalled(&self, queue: &str, error: &str) -> Result<Vec<(Uuid, Uuid)>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            UPDATE stage_jobs
            SET state = 'dead',
                attempts_made = attempts_made + 1,
                locked_until = NULL,
                last_error = $2,
                finished_at = NOW()
            WHERE queue = $1
              AND state = 'active'
              AND locked_until < NOW()
              AND attempts_made + 1 >= max_attempts
            RETURNING id, application_id
            "#,
        )
        .bind(queue)
        .bind(error)
        .fetch_all(&self.pool)
        .await?;

        let mut buried = Vec::with_capacity(rows.len());
        for row in &rows {
            buried.push((row.try_get("id")?, row.try_get("application_id")?));
        }
        Ok(buried)
    }

    /// Claims the oldest due job of `queue` for `lease`
    ///
    /// Reclaiming an expired lease counts the stalled attempt; run
    /// `bury_stalled` first so no job is reclaimed past its budget.
    pub async fn claim_next(&self, queue: &str, lease: Duration) -> Result<Option<JobRow>, DatabaseError> {
        let row = sqlx::query(
            r#"
            WITH next_job AS (
                SELECT id
                FROM stage_jobs
                WHERE queue = $1
                  AND ((state = 'waiting' AND run_at <= NOW())
                       OR (state = 'active' AND locked_until < NOW()))
                ORDER BY run_at, enqueued_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE stage_jobs j
            SET state = 'active',
                attempts_made = CASE WHEN j.state = 'active'
                                     THEN j.attempts_made + 1
                                     ELSE j.attempts_made END,
                locked_until = NOW() + make_interval(secs => $2)
            FROM next_job
            WHERE j.id = next_job.id
            RETURNING j.id, j.queue, j.application_id, j.input,
                      j.attempts_made, j.max_attempts, j.enqueued_at
            "#,
        )
        .bind(queue)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(JobRow::from_row).transpose()
    }

    /// Marks an active job completed; false if it was not active
    pub async fn mark_completed(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE stage_jobs
            SET state = 'completed', locked_until = NULL, finished_at = NOW()
            WHERE id = $1 AND state = 'active'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Counts a failed attempt and either reschedules or buries the job
    ///
    /// `retry_in` receives `(attempts_made, max_attempts)` after the failure
    /// and returns the delay before the next attempt, or `None` to bury.
    pub async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        retry_in: impl FnOnce(i32, i32) -> Option<Duration>,
    ) -> Result<Option<FailedAttempt>, DatabaseError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;

        let counters = sqlx::query(
            r#"
            SELECT attempts_made, max_attempts
            FROM stage_jobs
            WHERE id = $1 AND state = 'active'
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(counters) = counters else {
            return Ok(None);
        };
        let attempts_made: i32 = counters.try_get::<i32, _>("attempts_made")? + 1;
        let max_attempts: i32 = counters.try_get("max_attempts")?;
        let delay = retry_in(attempts_made, max_attempts);

        match delay {
            Some(delay) => {
                sqlx::query(
                    r#"
                    UPDATE stage_jobs
                    SET state = 'waiting',
                        attempts_made = $2,
                        run_at = NOW() + make_interval(secs => $3),
                        locked_until = NULL,
                        last_error = $4
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(attempts_made)
                .bind(delay.as_secs_f64())
                .bind(error)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE stage_jobs
                    SET state = 'dead',
                        attempts_made = $2,
                        locked_until = NULL,
                        last_error = $3,
                        finished_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(attempts_made)
                .bind(error)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;

        Ok(Some(FailedAttempt {
            attempts_made,
            max_attempts,
            retry_in: delay,
        }))
    }

    /// Buries a job regardless of its remaining attempts
    pub async fn bury(&self, id: Uuid, error: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE stage_jobs
            SET state = 'dead', locked_until = NULL, last_error = $2, finished_at = NOW()
            WHERE id = $1 AND state IN ('waiting', 'active')
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Deletes completed and dead jobs finished before `cutoff`
    pub async fn prune_finished(&self, cutoff: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            r#"
            DELETE FROM stage_jobs
            WHERE state IN ('completed', 'dead') AND finished_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Number of jobs of a queue in a given state
    pub async fn count(&self, queue: &str, state: &str) -> Result<i64, DatabaseError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM stage_jobs WHERE queue = $1 AND state = $2",
        )
        .bind(queue)
        .bind(state)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
