//! Pipeline process
//!
//! Hosts the orchestrator and stage workers of the verification pipeline
//! against PostgreSQL. One binary serves every role; `WORKER_ROLE` picks
//! whether a process drives workflows, consumes stage queues, or both.
//! Several worker processes may share the database, each consuming a
//! subset of stages.

pub mod config;
pub mod runtime;
pub mod telemetry;
pub mod verifiers;

pub use config::{ConfigError, Role, WorkerConfig};
pub use runtime::Runtime;
pub use telemetry::{init_tracing, shutdown_signal};
pub use verifiers::SimulatedVerifier;
