//! Test Data Builders
//!
//! Builders for applications in a given pipeline state. Every state change
//! goes through the domain methods, so a built application is one the real
//! pipeline could have produced.

use chrono::{DateTime, Utc};
use serde_json::Value;

use domain_application::{
    stage_result, Application, ResultFields, Stage, StepStatus, UserData, STAGE_ORDER,
};

use crate::fixtures::{StageResultFixtures, UserDataFixtures};

#[derive(Debug, Clone, PartialEq)]
enum StepPlan {
    Processing,
    Complete(Value),
    Failed(String),
}

/// Builder for constructing applications part-way through the pipeline
#[derive(Debug, Clone)]
pub struct ApplicationBuilder {
    user_data: UserData,
    submitted_at: Option<DateTime<Utc>>,
    steps: Vec<(Stage, StepPlan)>,
    completed: bool,
    error: Option<String>,
}

impl Default for ApplicationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplicationBuilder {
    /// Creates a builder for a freshly submitted standard application
    pub fn new() -> Self {
        Self {
            user_data: UserDataFixtures::standard(),
            submitted_at: None,
            steps: Vec::new(),
            completed: false,
            error: None,
        }
    }

    pub fn with_user_data(mut self, user_data: UserData) -> Self {
        self.user_data = user_data;
        self
    }

    pub fn submitted_at(mut self, at: DateTime<Utc>) -> Self {
        self.submitted_at = Some(at);
        self
    }

    /// Marks a stage complete with the fixture payload
    pub fn with_stage_complete(self, stage: Stage) -> Self {
        self.with_stage_result(stage, StageResultFixtures::for_stage(stage))
    }

    /// Marks a stage complete with the given payload
    pub fn with_stage_result(mut self, stage: Stage, data: Value) -> Self {
        self.steps.push((stage, StepPlan::Complete(data)));
        self
    }

    /// Completes every stage before `stage`, in order
    pub fn completed_through(mut self, stage: Stage) -> Self {
        for earlier in STAGE_ORDER.iter().copied().take_while(|s| *s <= stage) {
            self = self.with_stage_complete(earlier);
        }
        self
    }

    pub fn with_stage_processing(mut self, stage: Stage) -> Self {
        self.steps.push((stage, StepPlan::Processing));
        self
    }

    pub fn with_stage_failed(mut self, stage: Stage, error: impl Into<String>) -> Self {
        self.steps.push((stage, StepPlan::Failed(error.into())));
        self
    }

    /// Every stage complete and the workflow stopped
    pub fn finished(self) -> Self {
        let mut builder = self.completed_through(Stage::Underwriting);
        builder.completed = true;
        builder
    }

    pub fn errored(mut self, reason: impl Into<String>) -> Self {
        self.error = Some(reason.into());
        self
    }

    /// Builds the application
    ///
    /// # Panics
    ///
    /// Panics if the planned steps are not a legal sequence of transitions
    pub fn build(self) -> Application {
        let mut app = Application::new(self.user_data);
        if let Some(at) = self.submitted_at {
            app.submitted_at = at;
        }
        for (stage, plan) in self.steps {
            app.transition_step(stage, StepStatus::Processing, &ResultFields::new())
                .expect("step can start");
            match plan {
                StepPlan::Processing => {}
                StepPlan::Complete(data) => {
                    app.transition_step(stage, StepStatus::Complete, &stage_result(stage, data))
                        .expect("step can complete");
                }
                StepPlan::Failed(error) => {
                    app.note_attempt_failure(stage, 1, &error)
                        .expect("step can record a failure");
                    app.transition_step(stage, StepStatus::Failed, &ResultFields::new())
                        .expect("step can fail");
                }
            }
        }
        if self.completed {
            app.complete();
        }
        if let Some(reason) = self.error {
            app.fail_workflow(&reason);
        }
        app
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_builds_pending_application() {
        let app = ApplicationBuilder::new().build();
        assert_eq!(app.status.percent_complete, 0);
        assert!(app.status.steps.values().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn test_completed_through_marks_prefix() {
        let app = ApplicationBuilder::new().completed_through(Stage::License).build();
        assert_eq!(app.status.step_status(Stage::Policy), Some(StepStatus::Complete));
        assert_eq!(app.status.step_status(Stage::License), Some(StepStatus::Complete));
        assert_eq!(app.status.step_status(Stage::Dmv), Some(StepStatus::Pending));
        assert_eq!(app.status.percent_complete, 40);
        assert!(app.result_for(Stage::License).is_some());
    }

    #[test]
    fn test_finished_application() {
        let app = ApplicationBuilder::new().finished().build();
        assert!(app.status.completed);
        assert_eq!(app.status.percent_complete, 100);
    }

    #[test]
    fn test_failed_step_settles_application() {
        let app = ApplicationBuilder::new()
            .completed_through(Stage::Dmv)
            .with_stage_failed(Stage::Credit, "bureau offline")
            .build();
        assert_eq!(app.status.step_status(Stage::Credit), Some(StepStatus::Failed));
        assert!(app.status.is_settled());
        assert_eq!(app.status.percent_complete, 80);
    }
}
