//! Workflow errors

use thiserror::Error;

use core_kernel::{ApplicationId, PortError};
use domain_application::{ApplicationError, Stage};

/// Errors raised while driving an application through the pipeline
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The application never became visible, or does not exist
    #[error("Application {0} not found")]
    NotFound(ApplicationId),

    /// A stage verifier failed; the broker decides whether to redeliver
    #[error("{stage} verifier failed on attempt {attempt}: {source}")]
    Verifier {
        stage: Stage,
        attempt: u32,
        #[source]
        source: VerifierError,
    },

    /// A stage name arrived that is not part of the pipeline
    #[error("Unknown workflow stage: {0}")]
    UnknownStage(String),

    /// The store refused a status write
    #[error("Status write rejected: {0}")]
    StoreWrite(#[source] PortError),

    /// Optimistic retries were exhausted
    #[error("Concurrent modification of application {id} after {attempts} attempts")]
    Conflict { id: ApplicationId, attempts: u32 },

    /// The requested change violates the step lifecycle
    #[error(transparent)]
    Application(ApplicationError),

    /// The job queue failed
    #[error("Queue error: {0}")]
    Queue(#[source] PortError),

    /// The signal channel failed
    #[error("Signal channel error: {0}")]
    Signal(#[source] PortError),

    /// The store could not be read
    #[error("Store read failed: {0}")]
    StoreRead(#[source] PortError),
}

impl WorkflowError {
    /// Returns true if a redelivery of the same job could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            WorkflowError::UnknownStage(_) | WorkflowError::Application(_)
        )
    }
}

impl From<ApplicationError> for WorkflowError {
    fn from(err: ApplicationError) -> Self {
        match err {
            ApplicationError::UnknownStage(name) => WorkflowError::UnknownStage(name),
            other => WorkflowError::Application(other),
        }
    }
}

/// Failure reported by a stage verifier
#[derive(Debug, Clone, Error)]
pub enum VerifierError {
    /// The verification service could not be reached
    #[error("verification service unavailable: {0}")]
    Unavailable(String),

    /// The service rejected the request
    #[error("verification rejected: {0}")]
    Rejected(String),
}

impl VerifierError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        VerifierError::Unavailable(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        VerifierError::Rejected(message.into())
    }
}

/// Result type for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;
