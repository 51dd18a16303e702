//! Per-stage status snapshot

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ApplicationError;
use crate::stage::{Stage, STAGE_ORDER};

/// Status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl StepStatus {
    /// Complete and failed steps never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Complete | StepStatus::Failed)
    }

    /// Checks if transition is valid
    ///
    /// `Processing -> Processing` is the re-entry of a redelivered attempt.
    pub fn can_transition_to(self, target: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, target),
            (Pending, Processing)
                | (Processing, Processing)
                | (Processing, Complete)
                | (Processing, Failed)
        )
    }
}

/// A step in the status map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    /// Progress label
    pub label: String,
    /// Current status
    pub status: StepStatus,
    /// Error of the most recent failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StepState {
    /// A pending step for the given stage
    pub fn pending(stage: Stage) -> Self {
        Self {
            label: stage.label().to_string(),
            status: StepStatus::Pending,
            last_error: None,
        }
    }
}

/// Outcome of applying a step status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepChange {
    /// The step moved between two statuses
    Applied { from: StepStatus, to: StepStatus },
    /// Nothing to write; carries the status the step already has
    Unchanged(StepStatus),
}

impl StepChange {
    pub fn is_applied(&self) -> bool {
        matches!(self, StepChange::Applied { .. })
    }
}

/// Status snapshot persisted with the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    /// Set only by the terminal STOP transition
    pub completed: bool,
    /// round(100 * non-pending steps / all steps)
    pub percent_complete: u8,
    /// One entry per stage, in pipeline order
    pub steps: BTreeMap<Stage, StepState>,
    /// Set only by the ERROR transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for ApplicationStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplicationStatus {
    /// A fresh status with every stage pending
    pub fn new() -> Self {
        Self {
            completed: false,
            percent_complete: 0,
            steps: STAGE_ORDER
                .iter()
                .map(|stage| (*stage, StepState::pending(*stage)))
                .collect(),
            error: None,
        }
    }

    /// Returns the step for a stage
    pub fn step(&self, stage: Stage) -> Option<&StepState> {
        self.steps.get(&stage)
    }

    /// Returns the status of a stage's step
    pub fn step_status(&self, stage: Stage) -> Option<StepStatus> {
        self.step(stage).map(|step| step.status)
    }

    /// Applies a new status to a stage's step and recomputes the percentage
    ///
    /// A terminal step is left untouched and reported as `Unchanged`, which
    /// makes redelivered requests no-ops.
    pub fn apply(&mut self, stage: Stage, target: StepStatus) -> Result<StepChange, ApplicationError> {
        let step = self
            .steps
            .get_mut(&stage)
            .ok_or(ApplicationError::MissingStep(stage))?;

        let from = step.status;
        if from.is_terminal() || (from == target && target == StepStatus::Processing) {
            return Ok(StepChange::Unchanged(from));
        }
        if !from.can_transition_to(target) {
            return Err(ApplicationError::InvalidStepTransition {
                stage,
                from,
                to: target,
            });
        }

        step.status = target;
        if target == StepStatus::Complete {
            step.last_error = None;
        }
        self.recompute_percent();
        Ok(StepChange::Applied { from, to: target })
    }

    /// Records the error of a failed attempt on a non-terminal step
    pub fn note_failure(&mut self, stage: Stage, error: &str) -> Result<bool, ApplicationError> {
        let step = self
            .steps
            .get_mut(&stage)
            .ok_or(ApplicationError::MissingStep(stage))?;
        if step.status.is_terminal() {
            return Ok(false);
        }
        step.last_error = Some(error.to_string());
        Ok(true)
    }

    /// Terminal STOP transition
    ///
    /// Refused once the workflow errored or a step failed.
    pub fn mark_completed(&mut self) -> bool {
        if self.is_settled() {
            return false;
        }
        self.completed = true;
        self.percent_complete = 100;
        true
    }

    /// Terminal ERROR transition
    pub fn mark_errored(&mut self, reason: &str) -> bool {
        if self.error.is_some() {
            return false;
        }
        self.error = Some(reason.to_string());
        true
    }

    /// Recomputes the percentage from the full step map
    pub fn recompute_percent(&mut self) {
        if !self.completed {
            self.percent_complete = self.expected_percent();
        }
    }

    /// The percentage the step map implies
    pub fn expected_percent(&self) -> u8 {
        let started = self
            .steps
            .values()
            .filter(|step| step.status != StepStatus::Pending)
            .count();
        percent_of(started, self.steps.len())
    }

    /// First stage in pipeline order that has not completed
    pub fn current_stage(&self) -> Option<Stage> {
        STAGE_ORDER
            .iter()
            .copied()
            .find(|stage| self.step_status(*stage) != Some(StepStatus::Complete))
    }

    /// True once no further progress can happen without outside intervention
    pub fn is_settled(&self) -> bool {
        self.completed
            || self.error.is_some()
            || self.steps.values().any(|step| step.status == StepStatus::Failed)
    }
}

/// `round(100 * done / total)` with halves rounded up
pub fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((200 * done + total) / (2 * total)).min(100) as u8
}
