//! Schema setup

use sqlx::PgPool;
use tracing::info;

use crate::error::DatabaseError;

/// Initial schema: applications, stage jobs and step signals
pub const INITIAL_SCHEMA: &str =
    include_str!("../../../migrations/20240101_000001_initial_schema.sql");

/// Tables owned by the pipeline, in truncation order
pub const TABLES: [&str; 3] = ["step_signals", "stage_jobs", "applications"];

/// Applies the schema; every statement is idempotent
pub async fn run_migrations(pool: &PgPool) -> Result<(), DatabaseError> {
    info!("Applying pipeline schema");
    sqlx::raw_sql(INITIAL_SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
    info!("Pipeline schema ready");
    Ok(())
}
