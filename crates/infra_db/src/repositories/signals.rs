//! Step signal repository
//!
//! NOTIFY payloads are capped at 8000 bytes, so a signal is stored as a row
//! and only its id is sent on the channel.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::DatabaseError;

#[derive(Debug, Clone)]
pub struct SignalRepository {
    pool: PgPool,
}

impl SignalRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Stores a signal and notifies `channel` with its id
    ///
    /// Both happen in one transaction; listeners are woken on commit, when
    /// the row is already visible to them.
    pub async fn insert_and_notify(
        &self,
        channel: &str,
        id: Uuid,
        application_id: Uuid,
        event: &str,
        payload: &Value,
    ) -> Result<(), DatabaseError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO step_signals (id, application_id, event, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(application_id)
        .bind(event)
        .bind(payload)
        .execute(&mut *tx)
        .await?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;
        Ok(())
    }

    pub async fn find_payload(&self, id: Uuid) -> Result<Option<Value>, DatabaseError> {
        let payload = sqlx::query_scalar::<_, Value>("SELECT payload FROM step_signals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(payload)
    }

    /// Deletes signals recorded before `cutoff`
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM step_signals WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Events recorded for an application, oldest first
    pub async fn events_for(&self, application_id: Uuid) -> Result<Vec<String>, DatabaseError> {
        let events = sqlx::query_scalar::<_, String>(
            "SELECT event FROM step_signals WHERE application_id = $1 ORDER BY created_at",
        )
        .bind(application_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}
