//! Application aggregate

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use core_kernel::ApplicationId;
use crate::error::ApplicationError;
use crate::ports::ApplicationUpdate;
use crate::stage::Stage;
use crate::status::{ApplicationStatus, StepChange, StepStatus};

/// Result payloads merged into the application, keyed by field name
pub type ResultFields = BTreeMap<String, Value>;

/// Wraps a stage's result payload under the stage's result key
pub fn stage_result(stage: Stage, data: Value) -> ResultFields {
    let mut fields = ResultFields::new();
    fields.insert(stage.result_key().to_string(), data);
    fields
}

/// Reference to an uploaded document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRef {
    /// Storage path of the document
    pub path: String,
    /// MIME type reported at upload time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Fields submitted by the applicant
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserData {
    pub first_name: String,
    pub last_name: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zipcode: String,
    /// Photo of the driver's license
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_document: Option<DocumentRef>,
    /// Any further submitted fields
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Something that happened to an application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    StepStatusChanged {
        stage: Stage,
        from: StepStatus,
        to: StepStatus,
    },
    AttemptFailed {
        stage: Stage,
        attempt: u32,
        error: String,
    },
    WorkflowCompleted,
    WorkflowErrored {
        reason: String,
    },
}

/// Append-only history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub event: HistoryEvent,
}

/// A submitted application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// Unique identifier, immutable
    pub id: ApplicationId,
    /// Submitted fields
    pub user_data: UserData,
    /// Submission timestamp
    pub submitted_at: DateTime<Utc>,
    /// Status snapshot
    pub status: ApplicationStatus,
    /// Accumulated stage results
    pub results: ResultFields,
    /// Append-only history
    pub history: Vec<HistoryEntry>,
    /// Optimistic concurrency version, bumped by every store update
    pub version: u64,
}

impl Application {
    /// Creates a new application with every stage pending
    pub fn new(user_data: UserData) -> Self {
        Self {
            id: ApplicationId::new(),
            user_data,
            submitted_at: Utc::now(),
            status: ApplicationStatus::new(),
            results: ResultFields::new(),
            history: Vec::new(),
            version: 0,
        }
    }

    /// Returns the stored result payload of a stage
    pub fn result_for(&self, stage: Stage) -> Option<&Value> {
        self.results.get(stage.result_key())
    }

    /// Moves a step to a new status, merging fields when the move happens
    ///
    /// Returns false when the step was already terminal, in which case the
    /// fields are not merged either.
    pub fn transition_step(
        &mut self,
        stage: Stage,
        status: StepStatus,
        fields: &ResultFields,
    ) -> Result<bool, ApplicationError> {
        match self.status.apply(stage, status)? {
            StepChange::Applied { from, to } => {
                self.merge_fields(fields);
                self.record(HistoryEvent::StepStatusChanged { stage, from, to });
                Ok(true)
            }
            StepChange::Unchanged(_) => Ok(false),
        }
    }

    /// Records a failed attempt on a step that is still running
    pub fn note_attempt_failure(
        &mut self,
        stage: Stage,
        attempt: u32,
        error: &str,
    ) -> Result<bool, ApplicationError> {
        if !self.status.note_failure(stage, error)? {
            return Ok(false);
        }
        self.record(HistoryEvent::AttemptFailed {
            stage,
            attempt,
            error: error.to_string(),
        });
        Ok(true)
    }

    /// Terminal STOP transition
    pub fn complete(&mut self) -> bool {
        if !self.status.mark_completed() {
            return false;
        }
        self.record(HistoryEvent::WorkflowCompleted);
        true
    }

    /// Terminal ERROR transition
    pub fn fail_workflow(&mut self, reason: &str) -> bool {
        if !self.status.mark_errored(reason) {
            return false;
        }
        self.record(HistoryEvent::WorkflowErrored {
            reason: reason.to_string(),
        });
        true
    }

    /// Merges result fields into the top-level results
    pub fn merge_fields(&mut self, fields: &ResultFields) {
        for (key, value) in fields {
            self.results.insert(key.clone(), value.clone());
        }
    }

    /// Appends a history entry
    pub fn record(&mut self, event: HistoryEvent) {
        self.history.push(HistoryEntry { at: Utc::now(), event });
    }

    /// The field set that turns `base` into `self`
    pub fn diff_since(&self, base: &Application) -> ApplicationUpdate {
        let fields = self
            .results
            .iter()
            .filter(|(key, value)| base.results.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let history = self
            .history
            .get(base.history.len()..)
            .map(|entries| entries.to_vec())
            .unwrap_or_default();

        ApplicationUpdate {
            status: self.status.clone(),
            fields,
            history,
        }
    }
}
