//! Application domain errors

use thiserror::Error;

use crate::stage::Stage;
use crate::status::StepStatus;

/// Errors that can occur in the application domain
#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("Unknown workflow stage: {0}")]
    UnknownStage(String),

    #[error("Invalid step transition for {stage} from {from:?} to {to:?}")]
    InvalidStepTransition {
        stage: Stage,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("Stage {0} is missing from the status step map")]
    MissingStep(Stage),
}
