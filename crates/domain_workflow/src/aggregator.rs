//! Status aggregator
//!
//! The only component that mutates an application's status. Each operation
//! is a read-modify-write guarded by the record version: load, apply the
//! change to a draft, recompute the percentage over the full step map, then
//! write the difference with the loaded version as precondition. A lost race
//! reloads and tries again.

use std::sync::Arc;

use tracing::{debug, warn};

use core_kernel::ApplicationId;
use domain_application::{
    Application, ApplicationError, ApplicationStore, ResultFields, Stage, StepStatus,
};

use crate::error::{WorkflowError, WorkflowResult};

/// Default number of reloads after a version conflict
pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;

/// Result of a status operation
#[derive(Debug, Clone)]
pub struct StatusChange {
    /// The application as stored after the operation
    pub application: Application,
    /// False when the operation was a no-op and nothing was written
    pub changed: bool,
}

#[derive(Clone)]
pub struct StatusAggregator {
    store: Arc<dyn ApplicationStore>,
    conflict_retries: u32,
}

impl StatusAggregator {
    pub fn new(store: Arc<dyn ApplicationStore>) -> Self {
        Self {
            store,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    /// Moves a stage's step to `status`, merging `fields` into the results
    ///
    /// A terminal step is left alone and nothing is written.
    pub async fn set_step_status(
        &self,
        id: ApplicationId,
        stage: Stage,
        status: StepStatus,
        fields: ResultFields,
    ) -> WorkflowResult<StatusChange> {
        self.modify(id, |app| app.transition_step(stage, status, &fields))
            .await
    }

    /// Records a failed attempt; on the final attempt the step becomes `failed`
    pub async fn record_attempt_failure(
        &self,
        id: ApplicationId,
        stage: Stage,
        attempt: u32,
        error: &str,
        final_attempt: bool,
    ) -> WorkflowResult<StatusChange> {
        self.modify(id, |app| {
            let noted = app.note_attempt_failure(stage, attempt, error)?;
            if !final_attempt {
                return Ok(noted);
            }
            let failed = app.transition_step(stage, StepStatus::Failed, &ResultFields::new())?;
            Ok(noted || failed)
        })
        .await
    }

    /// Terminal STOP transition
    pub async fn mark_completed(&self, id: ApplicationId) -> WorkflowResult<StatusChange> {
        self.modify(id, |app| Ok(app.complete())).await
    }

    /// Terminal ERROR transition
    pub async fn mark_errored(&self, id: ApplicationId, reason: &str) -> WorkflowResult<StatusChange> {
        self.modify(id, |app| Ok(app.fail_workflow(reason))).await
    }

    async fn modify<F>(&self, id: ApplicationId, mut mutate: F) -> WorkflowResult<StatusChange>
    where
        F: FnMut(&mut Application) -> Result<bool, ApplicationError> + Send,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let current = self
                .store
                .find_by_id(id)
                .await
                .map_err(WorkflowError::StoreRead)?
                .ok_or(WorkflowError::NotFound(id))?;

            let mut draft = current.clone();
            if !mutate(&mut draft)? {
                return Ok(StatusChange {
                    application: current,
                    changed: false,
                });
            }

            match self
                .store
                .update(id, current.version, draft.diff_since(&current))
                .await
            {
                Ok(version) => {
                    draft.version = version;
                    debug!(
                        application_id = %id,
                        version,
                        percent_complete = draft.status.percent_complete,
                        "Status written"
                    );
                    return Ok(StatusChange {
                        application: draft,
                        changed: true,
                    });
                }
                Err(err) if err.is_conflict() && attempts <= self.conflict_retries => {
                    debug!(application_id = %id, attempts, "Version conflict, reloading");
                }
                Err(err) if err.is_conflict() => {
                    warn!(application_id = %id, attempts, "Giving up after repeated version conflicts");
                    return Err(WorkflowError::Conflict { id, attempts });
                }
                Err(err) if err.is_not_found() => return Err(WorkflowError::NotFound(id)),
                Err(err) => return Err(WorkflowError::StoreWrite(err)),
            }
        }
    }
}
