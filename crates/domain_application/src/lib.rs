//! Application Domain
//!
//! This crate models a submitted insurance application as it moves through
//! the verification pipeline.
//!
//! # Stage Order
//!
//! ```text
//! START -> policy -> license -> dmv -> credit -> underwriting -> STOP
//!                                                        \-> ERROR
//! ```
//!
//! Each stage owns one entry in the status step map. A step only moves
//! `pending -> processing -> complete | failed`, and the completion
//! percentage is always derived from the full step map.

pub mod application;
pub mod error;
pub mod ports;
pub mod stage;
pub mod status;

pub use application::{
    Application, UserData, DocumentRef, HistoryEntry, HistoryEvent, ResultFields, stage_result,
};
pub use error::ApplicationError;
pub use ports::{ApplicationStore, ApplicationUpdate};
#[cfg(any(test, feature = "mock"))]
pub use ports::mock::InMemoryApplicationStore;
pub use stage::{Stage, Transition, STAGE_ORDER};
pub use status::{ApplicationStatus, StepState, StepStatus, StepChange, percent_of};
