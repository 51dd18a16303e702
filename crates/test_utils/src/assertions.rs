//! Custom Test Assertions
//!
//! Checks over status histories and observer events that report what went
//! wrong in pipeline terms.

use domain_application::{percent_of, Application, ApplicationStatus, Stage, StepStatus, STAGE_ORDER};
use domain_workflow::WorkflowEvent;

/// Asserts every status agrees with its own step map
///
/// Before completion the percentage must equal the share of started steps;
/// after completion it must be 100.
pub fn assert_percent_consistent(history: &[ApplicationStatus]) {
    for (index, status) in history.iter().enumerate() {
        let expected = if status.completed {
            100
        } else {
            status.expected_percent()
        };
        assert_eq!(
            status.percent_complete, expected,
            "snapshot {} has percent {} but its steps imply {}: {:?}",
            index, status.percent_complete, expected, status
        );
    }
}

/// Asserts the percentage never goes down across a status history
pub fn assert_percent_monotonic(history: &[ApplicationStatus]) {
    for pair in history.windows(2) {
        assert!(
            pair[1].percent_complete >= pair[0].percent_complete,
            "percent went from {} to {}",
            pair[0].percent_complete,
            pair[1].percent_complete
        );
    }
}

/// Asserts no stage left pending while a later stage had started
pub fn assert_stages_started_in_order(history: &[ApplicationStatus]) {
    for status in history {
        let mut pending_seen: Option<Stage> = None;
        for stage in STAGE_ORDER {
            match status.step_status(stage) {
                Some(StepStatus::Pending) | None => {
                    pending_seen.get_or_insert(stage);
                }
                Some(other) => {
                    if let Some(pending) = pending_seen {
                        panic!(
                            "stage {} is {:?} while earlier stage {} is still pending",
                            stage, other, pending
                        );
                    }
                }
            }
        }
    }
}

/// Asserts stage workers started in pipeline order, each after the previous completed
pub fn assert_processed_in_order(events: &[WorkflowEvent]) {
    let mut completed: Vec<Stage> = Vec::new();
    for event in events {
        match event {
            WorkflowEvent::StageStarted { stage, .. } => {
                let required = &STAGE_ORDER[..stage.position()];
                assert!(
                    required.iter().all(|earlier| completed.contains(earlier)),
                    "stage {} started before {:?} completed (completed so far: {:?})",
                    stage,
                    required,
                    completed
                );
            }
            WorkflowEvent::StageComplete { stage, .. } => {
                if !completed.contains(stage) {
                    completed.push(*stage);
                }
            }
            _ => {}
        }
    }
}

/// Asserts an application ran to completion with every result stored
pub fn assert_completed(application: &Application) {
    assert!(
        application.status.completed,
        "application {} not completed: {:?}",
        application.id, application.status
    );
    assert_eq!(application.status.percent_complete, 100);
    assert!(application.status.error.is_none());
    for stage in STAGE_ORDER {
        assert_eq!(
            application.status.step_status(stage),
            Some(StepStatus::Complete),
            "stage {} not complete",
            stage
        );
        assert!(
            application.result_for(stage).is_some(),
            "stage {} has no stored result",
            stage
        );
    }
}

/// Asserts the percentage of a status given how many steps have started
pub fn assert_percent_for_started(status: &ApplicationStatus, started: usize) {
    assert_eq!(
        status.percent_complete,
        percent_of(started, STAGE_ORDER.len()),
        "unexpected percent for {} started steps",
        started
    );
}
