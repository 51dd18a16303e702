//! Application repository
//!
//! Applications are stored as one row with JSONB columns. Updates are
//! conditional on the row version; results and history are merged and
//! appended in SQL so a write never has to resend what is already stored.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::DatabaseError;

/// A row of the `applications` table
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationRow {
    pub id: Uuid,
    pub user_data: Value,
    pub submitted_at: DateTime<Utc>,
    pub status: Value,
    pub results: Value,
    pub history: Value,
    pub version: i64,
}

impl ApplicationRow {
    fn from_row(row: &PgRow) -> Result<Self, DatabaseError> {
        Ok(Self {
            id: row.try_get("id")?,
            user_data: row.try_get("user_data")?,
            submitted_at: row.try_get("submitted_at")?,
            status: row.try_get("status")?,
            results: row.try_get("results")?,
            history: row.try_get("history")?,
            version: row.try_get("version")?,
        })
    }
}

/// Denormalized flags kept next to the status document for indexing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusFlags {
    pub completed: bool,
    pub errored: bool,
    /// No further progress without outside help; excluded from resumption
    pub settled: bool,
}

/// Column values written by a versioned update
#[derive(Debug, Clone)]
pub struct ApplicationChanges {
    pub status: Value,
    pub flags: StatusFlags,
    /// JSON object merged into `results`
    pub fields: Value,
    /// JSON array appended to `history`
    pub history: Value,
}

#[derive(Debug, Clone)]
pub struct ApplicationRepository {
    pool: PgPool,
}

impl ApplicationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts a new application row
    ///
    /// # Errors
    ///
    /// `DatabaseError::DuplicateEntry` if the id is taken
    pub async fn insert(&self, row: &ApplicationRow, flags: StatusFlags) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO applications
                (id, user_data, submitted_at, status, results, history, version,
                 completed, errored, settled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(row.id)
        .bind(&row.user_data)
        .bind(row.submitted_at)
        .bind(&row.status)
        .bind(&row.results)
        .bind(&row.history)
        .bind(row.version)
        .bind(flags.completed)
        .bind(flags.errored)
        .bind(flags.settled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<ApplicationRow>, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_data, submitted_at, status, results, history, version
            FROM applications
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(ApplicationRow::from_row).transpose()
    }

    /// Applies `changes` if the row is still at `expected_version`
    ///
    /// # Returns
    ///
    /// The new version, or `None` when the row is missing or has moved on
    pub async fn update_versioned(
        &self,
        id: Uuid,
        expected_version: i64,
        changes: &ApplicationChanges,
    ) -> Result<Option<i64>, DatabaseError> {
        let version = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE applications
            SET status = $3,
                completed = $4,
                errored = $5,
                settled = $6,
                results = results || $7,
                history = history || $8,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(&changes.status)
        .bind(changes.flags.completed)
        .bind(changes.flags.errored)
        .bind(changes.flags.settled)
        .bind(&changes.fields)
        .bind(&changes.history)
        .fetch_optional(&self.pool)
        .await?;
        Ok(version)
    }

    pub async fn exists(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM applications WHERE id = $1)",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Oldest unsettled applications first
    pub async fn find_in_flight(&self, limit: i64) -> Result<Vec<Uuid>, DatabaseError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id
            FROM applications
            WHERE NOT settled
            ORDER BY submitted_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}
