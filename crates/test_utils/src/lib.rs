//! Test Utilities Crate
//!
//! Shared test infrastructure for the verification pipeline.
//!
//! # Modules
//!
//! - `fixtures`: Fixed applicant data and stage payloads
//! - `builders`: Applications in any pipeline state
//! - `verifiers`: Scripted stage verifiers with call counting
//! - `harness`: The whole pipeline wired over in-memory adapters
//! - `database`: PostgreSQL testcontainers with the schema applied
//! - `assertions`: Checks over status histories and workflow events
//! - `generators`: Property-based test data generators

pub mod fixtures;
pub mod builders;
pub mod verifiers;
pub mod harness;
pub mod database;
pub mod assertions;
pub mod generators;

pub use fixtures::*;
pub use builders::*;
pub use verifiers::*;
pub use harness::*;
pub use database::*;
pub use assertions::*;
pub use generators::*;
