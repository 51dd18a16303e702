//! Port Adapters
//!
//! PostgreSQL implementations of the ports declared in the domain crates.
//! Each adapter:
//! - Implements the domain's port trait
//! - Translates between domain models and repository rows
//! - Maps `DatabaseError` to `PortError`
//!
//! # Usage
//!
//! ```rust,ignore
//! use infra_db::adapters::{PostgresApplicationStore, PostgresSignalChannel};
//!
//! let store = PostgresApplicationStore::new(pool.clone());
//! let signals = PostgresSignalChannel::new(pool);
//! ```

pub mod application_store;
pub mod job_queue;
pub mod signal_channel;

pub use application_store::PostgresApplicationStore;
pub use job_queue::{PostgresJobQueue, DEFAULT_LEASE};
pub use signal_channel::{PostgresSignalChannel, SIGNAL_CHANNEL};

use core_kernel::{AdapterHealth, HealthCheckResult};
use sqlx::PgPool;

/// Checks database connectivity with `SELECT 1`
pub(crate) async fn ping(pool: &PgPool, adapter_id: &str) -> HealthCheckResult {
    let start = std::time::Instant::now();

    let result = sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool).await;

    let latency_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(_) => HealthCheckResult::new(adapter_id, AdapterHealth::Healthy, latency_ms),
        Err(e) => HealthCheckResult::new(adapter_id, AdapterHealth::Unhealthy, latency_ms)
            .with_message(format!("Database error: {}", e)),
    }
}
