//! Application domain tests
//!
//! # Test Organization
//!
//! - `stage_order_tests` - pipeline order and the string boundary
//! - `step_lifecycle_tests` - step transitions, redelivery no-ops, history
//! - `percent_property_tests` - the completion percentage invariant
//! - `store_tests` - the in-memory store adapter

use serde_json::json;

use domain_application::{
    stage_result, Application, ApplicationStatus, HistoryEvent, ResultFields, Stage, StepStatus,
    UserData, STAGE_ORDER,
};

fn applicant() -> UserData {
    UserData {
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        address: "1 Analytical Way".to_string(),
        city: "London".to_string(),
        state: "LN".to_string(),
        zipcode: "10001".to_string(),
        ..UserData::default()
    }
}

/// Runs a stage to completion on an in-memory application
fn run_stage(app: &mut Application, stage: Stage) {
    app.transition_step(stage, StepStatus::Processing, &ResultFields::new())
        .expect("processing should be valid");
    app.transition_step(
        stage,
        StepStatus::Complete,
        &stage_result(stage, json!({ "stage": stage.as_str() })),
    )
    .expect("complete should be valid");
}

// ============= STAGE ORDER TESTS =============
mod stage_order_tests {
    use super::*;
    use std::collections::HashSet;
    use domain_application::{ApplicationError, Transition};

    #[test]
    fn test_every_stage_has_distinct_queue_and_result_key() {
        let names: HashSet<_> = STAGE_ORDER.iter().map(|s| s.as_str()).collect();
        let keys: HashSet<_> = STAGE_ORDER.iter().map(|s| s.result_key()).collect();
        assert_eq!(names.len(), 5);
        assert_eq!(keys.len(), 5);
    }

    #[test]
    fn test_transition_after_each_name() {
        assert_eq!(Transition::after("policy").unwrap(), Transition::Run(Stage::License));
        assert_eq!(Transition::after("credit").unwrap(), Transition::Run(Stage::Underwriting));
        assert_eq!(Transition::after("underwriting").unwrap(), Transition::Stop);
    }

    #[test]
    fn test_transition_after_unrecognized_name() {
        match Transition::after("") {
            Err(ApplicationError::UnknownStage(name)) => assert_eq!(name, ""),
            other => panic!("Expected UnknownStage, got {:?}", other),
        }
    }

    #[test]
    fn test_labels() {
        assert_eq!(Stage::Policy.label(), "Checking for Existing Home & Life Policies...");
        assert_eq!(Stage::Credit.label(), "Fetching Credit Score...");
    }
}

// ============= STEP LIFECYCLE TESTS =============
mod step_lifecycle_tests {
    use super::*;

    #[test]
    fn test_full_run_reaches_one_hundred_before_stop() {
        let mut app = Application::new(applicant());
        for stage in STAGE_ORDER {
            run_stage(&mut app, stage);
        }
        assert_eq!(app.status.percent_complete, 100);
        assert!(!app.status.completed);

        assert!(app.complete());
        assert!(app.status.completed);
        assert_eq!(app.status.current_stage(), None);
        assert!(app.status.is_settled());
    }

    #[test]
    fn test_redelivered_processing_is_unchanged() {
        let mut app = Application::new(applicant());
        assert!(app
            .transition_step(Stage::Policy, StepStatus::Processing, &ResultFields::new())
            .unwrap());
        assert!(!app
            .transition_step(Stage::Policy, StepStatus::Processing, &ResultFields::new())
            .unwrap());
        assert_eq!(app.history.len(), 1);
    }

    #[test]
    fn test_failed_step_never_changes() {
        let mut app = Application::new(applicant());
        app.transition_step(Stage::Policy, StepStatus::Processing, &ResultFields::new())
            .unwrap();
        app.transition_step(Stage::Policy, StepStatus::Failed, &ResultFields::new())
            .unwrap();

        let late = stage_result(Stage::Policy, json!({"late": true}));
        assert!(!app.transition_step(Stage::Policy, StepStatus::Complete, &late).unwrap());
        assert_eq!(app.status.step_status(Stage::Policy), Some(StepStatus::Failed));
        assert!(app.result_for(Stage::Policy).is_none());
        assert!(app.status.is_settled());
    }

    #[test]
    fn test_attempt_failure_keeps_step_processing() {
        let mut app = Application::new(applicant());
        app.transition_step(Stage::License, StepStatus::Processing, &ResultFields::new())
            .unwrap();
        assert!(app.note_attempt_failure(Stage::License, 3, "ocr timeout").unwrap());

        let step = app.status.step(Stage::License).unwrap();
        assert_eq!(step.status, StepStatus::Processing);
        assert_eq!(step.last_error.as_deref(), Some("ocr timeout"));
        assert!(matches!(
            app.history.last().map(|entry| &entry.event),
            Some(HistoryEvent::AttemptFailed { attempt: 3, .. })
        ));

        app.transition_step(Stage::License, StepStatus::Complete, &ResultFields::new())
            .unwrap();
        assert!(app.status.step(Stage::License).unwrap().last_error.is_none());
    }

    #[test]
    fn test_current_stage_tracks_first_incomplete() {
        let mut app = Application::new(applicant());
        assert_eq!(app.status.current_stage(), Some(Stage::Policy));
        run_stage(&mut app, Stage::Policy);
        run_stage(&mut app, Stage::License);
        assert_eq!(app.status.current_stage(), Some(Stage::Dmv));
    }

    #[test]
    fn test_application_json_shape() {
        let mut app = Application::new(applicant());
        run_stage(&mut app, Stage::Policy);

        let value = serde_json::to_value(&app).unwrap();
        assert_eq!(value["status"]["steps"]["policy"]["status"], "complete");
        assert_eq!(value["results"]["policyData"]["stage"], "policy");
        assert_eq!(value["userData"]["firstName"], "Ada");
        assert_eq!(value["history"][0]["event"]["type"], "step_status_changed");

        let back: Application = serde_json::from_value(value).unwrap();
        assert_eq!(back, app);
    }
}

// ============= PERCENT PROPERTY TESTS =============
mod percent_property_tests {
    use super::*;
    use domain_application::percent_of;
    use proptest::prelude::*;

    fn status_strategy() -> impl Strategy<Value = StepStatus> {
        prop_oneof![
            Just(StepStatus::Processing),
            Just(StepStatus::Complete),
            Just(StepStatus::Failed),
        ]
    }

    proptest! {
        #[test]
        fn percent_matches_non_pending_share(
            targets in proptest::collection::vec(status_strategy(), 0..=5)
        ) {
            let mut status = ApplicationStatus::new();
            for (stage, target) in STAGE_ORDER.iter().zip(targets.iter()) {
                status.apply(*stage, StepStatus::Processing).unwrap();
                status.apply(*stage, *target).unwrap();

                let started = status
                    .steps
                    .values()
                    .filter(|step| step.status != StepStatus::Pending)
                    .count();
                let expected = (100.0 * started as f64 / 5.0).round() as u8;
                prop_assert_eq!(status.percent_complete, expected);
            }
        }

        #[test]
        fn percent_of_is_bounded_and_monotonic(total in 1usize..50, done in 0usize..50) {
            let done = done.min(total);
            let percent = percent_of(done, total);
            prop_assert!(percent <= 100);
            if done < total {
                prop_assert!(percent_of(done + 1, total) >= percent);
            }
        }
    }
}

// ============= STORE TESTS =============
mod store_tests {
    use super::*;
    use domain_application::{ApplicationStore, InMemoryApplicationStore};

    #[tokio::test]
    async fn test_snapshots_record_every_write() {
        let store = InMemoryApplicationStore::new();
        let app = Application::new(applicant());
        store.insert(&app).await.unwrap();

        let mut draft = app.clone();
        draft
            .transition_step(Stage::Policy, StepStatus::Processing, &ResultFields::new())
            .unwrap();
        let version = store.update(app.id, app.version, draft.diff_since(&app)).await.unwrap();
        assert_eq!(version, 1);

        let snapshots = store.snapshots(app.id).await;
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].percent_complete, 0);
        assert_eq!(snapshots[1].percent_complete, 20);
    }

    #[tokio::test]
    async fn test_injected_conflicts_are_consumed() {
        let store = InMemoryApplicationStore::new();
        let app = Application::new(applicant());
        store.insert(&app).await.unwrap();
        store.inject_conflicts(1);

        let update = app.diff_since(&app);
        assert!(store.update(app.id, 0, update.clone()).await.unwrap_err().is_conflict());
        assert_eq!(store.update(app.id, 0, update).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejected_writes() {
        let store = InMemoryApplicationStore::new();
        store.reject_writes(true);
        let app = Application::new(applicant());
        let err = store.insert(&app).await.unwrap_err();
        assert!(matches!(err, core_kernel::PortError::WriteRejected { .. }));
    }
}
