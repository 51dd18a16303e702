//! Infrastructure Database Layer
//!
//! PostgreSQL adapters for the verification pipeline, built on SQLx:
//!
//! - [`PostgresApplicationStore`]: application records with optimistic
//!   versioning
//! - [`PostgresJobQueue`]: durable per-stage job queues with leases,
//!   retries and dead letters
//! - [`PostgresSignalChannel`]: step signals across processes via
//!   LISTEN/NOTIFY
//! - [`RetentionSweeper`]: prunes finished jobs and old signals
//!
//! # Architecture
//!
//! Repositories own the SQL and speak in rows; adapters implement the
//! domain ports on top of them.
//!
//! # Example
//!
//! ```rust,ignore
//! use infra_db::{create_pool, run_migrations, DatabaseConfig, PostgresApplicationStore};
//!
//! let pool = create_pool(DatabaseConfig::new("postgres://localhost/underwriting")).await?;
//! run_migrations(&pool).await?;
//! let store = PostgresApplicationStore::new(pool);
//! ```

pub mod adapters;
pub mod error;
pub mod migrations;
pub mod pool;
pub mod repositories;
pub mod retention;

pub use adapters::{
    PostgresApplicationStore, PostgresJobQueue, PostgresSignalChannel, DEFAULT_LEASE,
    SIGNAL_CHANNEL,
};
pub use error::DatabaseError;
pub use migrations::{run_migrations, TABLES};
pub use pool::{create_pool, DatabaseConfig, DatabasePool};
pub use retention::{RetentionPolicy, RetentionSweeper, SweepReport};
