//! Repository implementations
//!
//! Repositories own the SQL. They speak in rows, UUIDs and JSON values and
//! know nothing about the port traits; the adapters translate.

pub mod applications;
pub mod jobs;
pub mod signals;

pub use applications::{ApplicationChanges, ApplicationRepository, ApplicationRow, StatusFlags};
pub use jobs::{FailedAttempt, JobRepository, JobRow};
pub use signals::SignalRepository;
