//! Workflow observability events

use core_kernel::{ApplicationId, JobId};
use domain_application::Stage;
use tracing::{error, info, warn};

/// Something noteworthy that happened while driving a workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowEvent {
    WorkflowStarted {
        application_id: ApplicationId,
        job_id: JobId,
    },
    StageStarted {
        application_id: ApplicationId,
        stage: Stage,
        attempt: u32,
    },
    StageComplete {
        application_id: ApplicationId,
        stage: Stage,
        attempt: u32,
    },
    StageFailed {
        application_id: ApplicationId,
        stage: Stage,
        attempt: u32,
        error: String,
        exhausted: bool,
    },
    WorkflowCompleted {
        application_id: ApplicationId,
    },
    WorkflowErrored {
        application_id: ApplicationId,
        reason: String,
    },
}

impl WorkflowEvent {
    pub fn application_id(&self) -> ApplicationId {
        match self {
            WorkflowEvent::WorkflowStarted { application_id, .. }
            | WorkflowEvent::StageStarted { application_id, .. }
            | WorkflowEvent::StageComplete { application_id, .. }
            | WorkflowEvent::StageFailed { application_id, .. }
            | WorkflowEvent::WorkflowCompleted { application_id }
            | WorkflowEvent::WorkflowErrored { application_id, .. } => *application_id,
        }
    }
}

/// Receives workflow events
pub trait WorkflowObserver: Send + Sync {
    fn on_event(&self, event: &WorkflowEvent);
}

/// Logs every event through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl WorkflowObserver for TracingObserver {
    fn on_event(&self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::WorkflowStarted { application_id, job_id } => {
                info!(%application_id, %job_id, "Workflow started");
            }
            WorkflowEvent::StageStarted { application_id, stage, attempt } => {
                info!(%application_id, %stage, attempt, "Stage started");
            }
            WorkflowEvent::StageComplete { application_id, stage, attempt } => {
                info!(%application_id, %stage, attempt, "Stage complete");
            }
            WorkflowEvent::StageFailed { application_id, stage, attempt, error, exhausted } => {
                if *exhausted {
                    error!(%application_id, %stage, attempt, %error, "Stage failed, attempts exhausted");
                } else {
                    warn!(%application_id, %stage, attempt, %error, "Stage attempt failed");
                }
            }
            WorkflowEvent::WorkflowCompleted { application_id } => {
                info!(%application_id, "Workflow completed");
            }
            WorkflowEvent::WorkflowErrored { application_id, reason } => {
                error!(%application_id, %reason, "Workflow errored");
            }
        }
    }
}

#[cfg(any(test, feature = "mock"))]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Keeps every event for later assertions
    #[derive(Debug, Default)]
    pub struct RecordingObserver {
        events: Mutex<Vec<WorkflowEvent>>,
    }

    impl RecordingObserver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<WorkflowEvent> {
            self.events
                .lock()
                .map(|events| events.clone())
                .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
        }

        pub fn events_for(&self, application_id: ApplicationId) -> Vec<WorkflowEvent> {
            self.events()
                .into_iter()
                .filter(|event| event.application_id() == application_id)
                .collect()
        }
    }

    impl WorkflowObserver for RecordingObserver {
        fn on_event(&self, event: &WorkflowEvent) {
            match self.events.lock() {
                Ok(mut events) => events.push(event.clone()),
                Err(poisoned) => poisoned.into_inner().push(event.clone()),
            }
        }
    }
}
