//! Verification Workflow
//!
//! Drives submitted applications through the verification stages.
//!
//! # Components
//!
//! ```text
//!  Intake ──submit──▶ Store            Orchestrator ◀── step:complete ──┐
//!     │                 ▲                   │                           │
//!     └── start ──▶ [policy queue]          └── enqueue next ──▶ [queue] │
//!                       │                                          │    │
//!                  StageWorker ── guard ── verifier ── Aggregator ─┴────┘
//! ```
//!
//! - [`orchestrator::Orchestrator`] decides which stage runs next
//! - [`worker::StageWorker`] runs one stage for one delivery
//! - [`aggregator::StatusAggregator`] is the only writer of status
//! - [`guard`] waits out read-after-write lag in the store
//! - [`signal::SignalChannel`] carries completions between processes
//! - [`queue::JobQueue`] is the per-stage durable queue
//!
//! Ports have in-memory adapters behind the `mock` feature and PostgreSQL
//! adapters in `infra_db`.

pub mod aggregator;
pub mod error;
pub mod events;
pub mod guard;
pub mod intake;
pub mod orchestrator;
pub mod queue;
pub mod signal;
pub mod verifier;
pub mod worker;

pub use aggregator::{StatusAggregator, StatusChange, DEFAULT_CONFLICT_RETRIES};
pub use error::{VerifierError, WorkflowError, WorkflowResult};
pub use events::{TracingObserver, WorkflowEvent, WorkflowObserver};
#[cfg(any(test, feature = "mock"))]
pub use events::mock::RecordingObserver;
pub use guard::{await_visible, ConsistencyGuard, GuardConfig};
pub use intake::Intake;
pub use orchestrator::{Advance, Orchestrator};
pub use queue::{
    Delivery, Enqueued, FailureOutcome, Job, JobQueue, RetryPolicy, StageQueues, LEASE_EXPIRED,
};
#[cfg(any(test, feature = "mock"))]
pub use queue::mock::{InMemoryBroker, InMemoryJobQueue};
pub use signal::{LocalSignalChannel, SignalChannel, SignalStream, StepSignal};
pub use verifier::{Verifier, Verifiers};
pub use worker::{run_consumer, ConsumerOptions, JobHandler, StageOutcome, StageWorker};
