//! Core Kernel - Foundational types for the application verification pipeline
//!
//! This crate provides the building blocks shared by every other crate:
//! - Strongly-typed identifiers for applications, jobs, and signals
//! - The port error type and marker traits for the ports-and-adapters layout

pub mod identifiers;
pub mod ports;

pub use identifiers::{ApplicationId, JobId, SignalId};
pub use ports::{
    PortError, DomainPort, AdapterHealth, HealthCheckResult, HealthCheckable,
};
