//! Application intake
//!
//! Creates an application with every step pending and kicks off its
//! workflow. Status queries read straight from the store, so a reader behind
//! a lagging replica may briefly get `NotFound` for a fresh submission.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use core_kernel::ApplicationId;
use domain_application::{Application, ApplicationStatus, ApplicationStore, UserData};

use crate::error::{WorkflowError, WorkflowResult};
use crate::orchestrator::Orchestrator;

pub struct Intake {
    store: Arc<dyn ApplicationStore>,
    orchestrator: Arc<Orchestrator>,
    start_delay: Duration,
}

impl Intake {
    pub fn new(store: Arc<dyn ApplicationStore>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            store,
            orchestrator,
            start_delay: Duration::ZERO,
        }
    }

    /// Waits this long between persisting an application and starting it
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Persists a new application and starts its workflow
    #[instrument(skip(self, user_data))]
    pub async fn submit(&self, user_data: UserData) -> WorkflowResult<ApplicationId> {
        let application = Application::new(user_data);
        let id = application.id;
        self.store
            .insert(&application)
            .await
            .map_err(WorkflowError::StoreWrite)?;
        info!(application_id = %id, "Application submitted");

        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        self.orchestrator.start(id).await?;
        Ok(id)
    }

    /// Current status snapshot of an application
    pub async fn status(&self, id: ApplicationId) -> WorkflowResult<ApplicationStatus> {
        self.store
            .find_by_id(id)
            .await
            .map_err(WorkflowError::StoreRead)?
            .map(|application| application.status)
            .ok_or(WorkflowError::NotFound(id))
    }
}
