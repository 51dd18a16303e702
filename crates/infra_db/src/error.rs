//! Database errors and their mapping onto `PortError`

use thiserror::Error;

use core_kernel::PortError;

// https://www.postgresql.org/docs/current/errcodes-appendix.html
const UNIQUE_VIOLATION: &str = "23505";
const CHECK_VIOLATION: &str = "23514";
const SERIALIZATION_FAILURE: &str = "40001";

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// No connection became free before the acquire timeout
    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("{0} not found")]
    NotFound(String),

    /// Unique key taken, e.g. an application id inserted twice
    #[error("Duplicate entry: {0}")]
    DuplicateEntry(String),

    /// A CHECK constraint refused the row, e.g. an unknown job state
    #[error("Rejected by constraint: {0}")]
    ConstraintViolation(String),

    /// PostgreSQL aborted the transaction to keep it serializable
    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A JSONB column did not hold what the row type expects
    #[error("Malformed JSON column: {0}")]
    SerializationError(String),

    #[error("SQL error: {0}")]
    SqlError(#[source] sqlx::Error),
}

impl DatabaseError {
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        DatabaseError::NotFound(format!("{} '{}'", entity, id))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DatabaseError::NotFound(_))
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("row".to_string()),
            sqlx::Error::PoolTimedOut => DatabaseError::PoolExhausted,
            sqlx::Error::Io(io) => DatabaseError::ConnectionFailed(io.to_string()),
            sqlx::Error::Database(db) => {
                let message = db.message().to_string();
                match db.code().as_deref() {
                    Some(UNIQUE_VIOLATION) => DatabaseError::DuplicateEntry(message),
                    Some(CHECK_VIOLATION) => DatabaseError::ConstraintViolation(message),
                    Some(SERIALIZATION_FAILURE) => DatabaseError::SerializationFailure(message),
                    _ => DatabaseError::SqlError(error),
                }
            }
            _ => DatabaseError::SqlError(error),
        }
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(error: serde_json::Error) -> Self {
        DatabaseError::SerializationError(error.to_string())
    }
}

/// Workflow code only sees `PortError`; lost races surface as conflicts
/// so the aggregator re-reads and retries them.
impl From<DatabaseError> for PortError {
    fn from(error: DatabaseError) -> Self {
        match error {
            DatabaseError::NotFound(what) => PortError::NotFound {
                entity_type: "Record".to_string(),
                id: what,
            },
            DatabaseError::DuplicateEntry(message) | DatabaseError::SerializationFailure(message) => {
                PortError::conflict(message)
            }
            DatabaseError::ConstraintViolation(message) => PortError::write_rejected(message),
            DatabaseError::ConnectionFailed(message) => PortError::connection(message),
            DatabaseError::PoolExhausted => PortError::Timeout {
                operation: "acquire connection".to_string(),
                duration_ms: 0,
            },
            DatabaseError::SerializationError(message) => PortError::serialization(message),
            other => PortError::Internal {
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_names_entity() {
        let error = DatabaseError::not_found("Job", "0190");
        assert!(error.is_not_found());
        assert_eq!(error.to_string(), "Job '0190' not found");
    }

    #[test]
    fn test_lost_races_become_conflicts() {
        let serialization: PortError = DatabaseError::SerializationFailure("retry".into()).into();
        assert!(serialization.is_conflict());

        let duplicate: PortError = DatabaseError::DuplicateEntry("applications_pkey".into()).into();
        assert!(duplicate.is_conflict());
    }

    #[test]
    fn test_pool_exhaustion_is_transient() {
        let pool: PortError = DatabaseError::PoolExhausted.into();
        assert!(pool.is_transient());
        assert!(!PortError::from(DatabaseError::MigrationFailed("x".into())).is_transient());
    }

    #[test]
    fn test_sqlx_classification() {
        assert!(DatabaseError::from(sqlx::Error::RowNotFound).is_not_found());
        assert!(matches!(
            DatabaseError::from(sqlx::Error::PoolTimedOut),
            DatabaseError::PoolExhausted
        ));
    }
}
