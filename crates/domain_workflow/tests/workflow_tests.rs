//! End-to-end workflow tests over in-memory adapters
//!
//! # Test Organization
//!
//! - `pipeline_tests` - full runs, retries and exhausted stages
//! - `ordering_tests` - stage order and percent invariants across many runs
//! - `idempotence_tests` - duplicate deliveries and duplicate signals
//! - `consistency_tests` - replication lag and version conflicts
//! - `routing_tests` - unknown stages, isolated channels, resumption

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::watch;

use domain_application::{
    ApplicationStore, HistoryEvent, InMemoryApplicationStore, Stage, StepStatus, STAGE_ORDER,
};
use domain_workflow::{
    run_consumer, Advance, ConsumerOptions, GuardConfig, InMemoryBroker, JobQueue,
    LocalSignalChannel, Orchestrator, RetryPolicy, SignalChannel, StageOutcome, StageWorker,
    StepSignal, WorkflowError, WorkflowEvent,
};
use test_utils::{
    assert_completed, assert_percent_consistent, assert_percent_monotonic,
    assert_processed_in_order, assert_stages_started_in_order, ApplicationBuilder, HarnessConfig,
    ScriptedVerifier, StageResultFixtures, UserDataFixtures, VerifierSet, WorkflowHarness,
};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

fn attempt_failures(history: &[domain_application::HistoryEntry], stage: Stage) -> usize {
    history
        .iter()
        .filter(|entry| matches!(entry.event, HistoryEvent::AttemptFailed { stage: s, .. } if s == stage))
        .count()
}

// ============= PIPELINE TESTS =============

mod pipeline_tests {
    use super::*;

    #[tokio::test]
    async fn test_full_run_completes() {
        let harness = WorkflowHarness::start(VerifierSet::new()).await;
        let id = harness.submit(UserDataFixtures::standard()).await.unwrap();

        let app = harness.wait_until_settled(id, SETTLE_TIMEOUT).await;
        assert_completed(&app);
        for stage in STAGE_ORDER {
            assert_eq!(harness.verifiers.calls(stage), 1, "stage {} ran more than once", stage);
            assert_eq!(app.result_for(stage), Some(&StageResultFixtures::for_stage(stage)));
        }

        let history = harness.status_history(id).await;
        assert_percent_consistent(&history);
        assert_percent_monotonic(&history);
        assert_eq!(history.first().map(|s| s.percent_complete), Some(0));

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_is_bracketed_by_start_and_completion_events() {
        let harness = WorkflowHarness::start(VerifierSet::new()).await;
        let id = harness.submit(UserDataFixtures::standard()).await.unwrap();
        harness.wait_until_settled(id, SETTLE_TIMEOUT).await;
        // acknowledgements and observer events trail the final status write
        harness.settle_for(Duration::from_millis(50)).await;

        for stage in STAGE_ORDER {
            assert_eq!(harness.broker.enqueued_count(stage).await, 1);
            assert_eq!(harness.broker.queue(stage).completed_count().await, 1);
        }

        let events = harness.observer.events_for(id);
        assert!(matches!(events.first(), Some(WorkflowEvent::WorkflowStarted { .. })));
        assert!(matches!(events.last(), Some(WorkflowEvent::WorkflowCompleted { .. })));

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_license_succeeds_on_final_attempt() {
        let verifiers = VerifierSet::new().with(
            Stage::License,
            ScriptedVerifier::failing_first(9, StageResultFixtures::for_stage(Stage::License)),
        );
        let harness = WorkflowHarness::start(verifiers).await;
        let id = harness.submit(UserDataFixtures::standard()).await.unwrap();

        let app = harness.wait_until_settled(id, SETTLE_TIMEOUT).await;
        assert_completed(&app);
        assert_eq!(harness.verifiers.calls(Stage::License), 10);
        assert_eq!(harness.verifiers.calls(Stage::Dmv), 1);
        assert_eq!(attempt_failures(&app.history, Stage::License), 9);
        assert!(app.status.step(Stage::License).unwrap().last_error.is_none());

        // the step never left processing while attempts remained
        let history = harness.status_history(id).await;
        assert!(history
            .iter()
            .all(|status| status.step_status(Stage::License) != Some(StepStatus::Failed)));
        assert_percent_consistent(&history);

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_credit_exhausts_attempts() {
        let verifiers =
            VerifierSet::new().with(Stage::Credit, ScriptedVerifier::always_failing("bureau offline"));
        let harness = WorkflowHarness::start(verifiers).await;
        let id = harness.submit(UserDataFixtures::standard()).await.unwrap();

        let app = harness.wait_until_settled(id, SETTLE_TIMEOUT).await;
        assert_eq!(app.status.step_status(Stage::Credit), Some(StepStatus::Failed));
        assert!(!app.status.completed);
        assert_eq!(app.status.percent_complete, 80);
        assert_eq!(
            app.status.step(Stage::Credit).unwrap().last_error.as_deref(),
            Some("verification service unavailable: bureau offline")
        );

        // give a stray successor a chance to show up
        harness.settle_for(Duration::from_millis(50)).await;
        assert_eq!(harness.verifiers.calls(Stage::Credit), 10);
        assert_eq!(harness.broker.enqueued_count(Stage::Underwriting).await, 0);
        assert_eq!(harness.verifiers.calls(Stage::Underwriting), 0);
        assert_eq!(harness.broker.queue(Stage::Credit).dead_letters().await.len(), 1);

        let exhausted: Vec<_> = harness
            .observer
            .events_for(id)
            .into_iter()
            .filter(|event| matches!(event, WorkflowEvent::StageFailed { exhausted: true, .. }))
            .collect();
        assert_eq!(exhausted.len(), 1);

        harness.shutdown().await;
    }
}

// ============= ORDERING TESTS =============

mod ordering_tests {
    use super::*;

    #[tokio::test]
    async fn test_many_applications_run_in_stage_order() {
        let verifiers = VerifierSet::new()
            .with(Stage::Dmv, ScriptedVerifier::failing_first(3, json!({"violations": 0})));
        let harness = WorkflowHarness::start(verifiers).await;

        let mut ids = Vec::new();
        for n in 0..6 {
            ids.push(harness.submit(UserDataFixtures::numbered(n)).await.unwrap());
        }

        for id in &ids {
            let app = harness.wait_until_settled(*id, SETTLE_TIMEOUT).await;
            assert_completed(&app);

            let history = harness.status_history(*id).await;
            assert_stages_started_in_order(&history);
            assert_percent_consistent(&history);
            assert_percent_monotonic(&history);
            assert_processed_in_order(&harness.observer.events_for(*id));
        }

        harness.shutdown().await;
    }
}

// ============= IDEMPOTENCE TESTS =============

mod idempotence_tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_job_after_completion_does_not_rerun() {
        let harness = WorkflowHarness::start(VerifierSet::new()).await;
        let id = harness.submit(UserDataFixtures::standard()).await.unwrap();
        harness.wait_until_settled(id, SETTLE_TIMEOUT).await;
        let versions_before = harness.status_history(id).await.len();

        harness
            .broker
            .queue(Stage::Dmv)
            .enqueue(id, Value::Null)
            .await
            .unwrap();
        let queue = harness.broker.queue(Stage::Dmv);
        for _ in 0..200 {
            if queue.outstanding().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(queue.outstanding().await, 0);
        assert_eq!(harness.verifiers.calls(Stage::Dmv), 1);
        assert_eq!(harness.status_history(id).await.len(), versions_before);
        assert!(harness.application(id).await.status.completed);

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_redelivered_complete_step_republishes_stored_result() {
        let store = Arc::new(InMemoryApplicationStore::new());
        let app = ApplicationBuilder::new().completed_through(Stage::Dmv).build();
        store.insert(&app).await.unwrap();

        let signals = Arc::new(LocalSignalChannel::default());
        let mut stream = signals.subscribe().await.unwrap();
        let verifier = Arc::new(ScriptedVerifier::succeeding(json!({"fresh": true})));
        let worker = StageWorker::new(Stage::Dmv, verifier.clone(), store.clone(), signals.clone());

        let queue = domain_workflow::InMemoryJobQueue::new(Stage::Dmv, RetryPolicy::default());
        queue.enqueue(app.id, Value::Null).await.unwrap();
        let delivery = queue.reserve().await.unwrap().unwrap();

        let outcome = worker.process(&delivery).await.unwrap();
        assert_eq!(outcome, StageOutcome::Republished);
        assert_eq!(verifier.calls(), 0);

        let signal = stream.next().await.unwrap().unwrap();
        assert_eq!(
            signal,
            StepSignal::complete(app.id, Stage::Dmv, StageResultFixtures::for_stage(Stage::Dmv))
        );
        assert_eq!(store.get(app.id).await.unwrap().version, app.version);
    }

    #[tokio::test]
    async fn test_two_orchestrators_on_one_channel_enqueue_each_stage_once() {
        let harness = WorkflowHarness::start(VerifierSet::new()).await;
        let second = Arc::new(Orchestrator::new(harness.store.clone(), harness.broker.stage_queues()));
        let (stop_second, stop_rx) = watch::channel(false);
        let stream = harness.signals.subscribe().await.unwrap();
        let driver = {
            let second = Arc::clone(&second);
            tokio::spawn(async move { second.drive(stream, stop_rx).await })
        };

        let id = harness.submit(UserDataFixtures::standard()).await.unwrap();
        let app = harness.wait_until_settled(id, SETTLE_TIMEOUT).await;
        assert_completed(&app);

        for stage in STAGE_ORDER {
            assert_eq!(harness.broker.enqueued_count(stage).await, 1, "{stage} enqueued twice");
            assert_eq!(harness.verifiers.calls(stage), 1);
        }

        stop_second.send(true).unwrap();
        driver.await.unwrap().unwrap();
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_completion_signal_enqueues_once() {
        let harness = WorkflowHarness::start(VerifierSet::new()).await;
        let id = harness.submit(UserDataFixtures::standard()).await.unwrap();
        harness.wait_until_settled(id, SETTLE_TIMEOUT).await;

        let advance = harness
            .orchestrator
            .advance(id, "policy", StageResultFixtures::for_stage(Stage::Policy))
            .await
            .unwrap();
        assert_eq!(advance, Advance::Settled);
        assert_eq!(harness.broker.enqueued_count(Stage::License).await, 1);

        harness.shutdown().await;
    }
}

// ============= CONSISTENCY TESTS =============

mod consistency_tests {
    use super::*;

    #[tokio::test]
    async fn test_worker_waits_out_replication_lag() {
        let harness =
            WorkflowHarness::start_with(VerifierSet::new(), HarnessConfig::default().with_visibility_lag(5))
                .await;
        let id = harness.submit(UserDataFixtures::standard()).await.unwrap();

        let app = harness.wait_until_settled(id, SETTLE_TIMEOUT).await;
        assert_completed(&app);
        assert!(harness.store.find_calls() >= 6);

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_invisible_application_fails_the_attempt() {
        let config = HarnessConfig {
            guard: GuardConfig {
                max_attempts: 2,
                interval: Duration::from_millis(1),
            },
            ..HarnessConfig::default().with_visibility_lag(1_000).with_max_attempts(2)
        };
        let harness = WorkflowHarness::start_with(VerifierSet::new(), config).await;
        let id = harness.submit(UserDataFixtures::standard()).await.unwrap();

        let queue = harness.broker.queue(Stage::Policy);
        for _ in 0..400 {
            if !queue.dead_letters().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(queue.dead_letters().await.len(), 1);
        assert_eq!(harness.verifiers.calls(Stage::Policy), 0);
        assert_eq!(
            harness.application(id).await.status.step_status(Stage::Policy),
            Some(StepStatus::Pending)
        );

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_version_conflicts_are_retried() {
        let harness = WorkflowHarness::start(VerifierSet::new()).await;
        harness.store.inject_conflicts(2);
        let id = harness.submit(UserDataFixtures::standard()).await.unwrap();

        let app = harness.wait_until_settled(id, SETTLE_TIMEOUT).await;
        assert_completed(&app);
        assert_percent_consistent(&harness.status_history(id).await);

        harness.shutdown().await;
    }
}

// ============= ROUTING TESTS =============

mod routing_tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_stage_signal_errors_application() {
        let harness = WorkflowHarness::start(VerifierSet::new()).await;
        let app = ApplicationBuilder::new().completed_through(Stage::Policy).build();
        harness.store.insert(&app).await.unwrap();

        harness
            .signals
            .publish(&StepSignal::Complete {
                application_id: app.id,
                current_stage: "appraisal".to_string(),
                data: Value::Null,
            })
            .await
            .unwrap();

        let errored = harness
            .wait_until(app.id, SETTLE_TIMEOUT, |app| app.status.error.is_some())
            .await;
        assert_eq!(errored.status.error.as_deref(), Some("unknown stage 'appraisal'"));
        assert_eq!(harness.broker.enqueued_count(Stage::License).await, 0);

        let err = harness
            .orchestrator
            .advance(app.id, "appraisal", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownStage(ref name) if name == "appraisal"));
        assert!(!err.is_retryable());

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_separate_local_channels_stall_after_first_stage() {
        let store = Arc::new(InMemoryApplicationStore::new());
        let broker = InMemoryBroker::new(RetryPolicy::new(10, Duration::from_millis(1)));
        let orchestrator = Arc::new(Orchestrator::new(store.clone(), broker.stage_queues()));
        let orchestrator_channel = LocalSignalChannel::default();
        let worker_channel = Arc::new(LocalSignalChannel::default());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let stream = orchestrator_channel.subscribe().await.unwrap();
        let driver = {
            let orchestrator = Arc::clone(&orchestrator);
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move { orchestrator.drive(stream, shutdown_rx).await })
        };
        let worker = StageWorker::new(
            Stage::Policy,
            Arc::new(ScriptedVerifier::for_stage(Stage::Policy)),
            store.clone(),
            worker_channel.clone(),
        );
        let consumer = tokio::spawn(run_consumer(
            broker.queue(Stage::Policy) as Arc<dyn JobQueue>,
            Arc::new(worker),
            ConsumerOptions {
                concurrency: 1,
                poll_interval: Duration::from_millis(2),
            },
            shutdown_rx,
        ));

        let app = ApplicationBuilder::new().build();
        store.insert(&app).await.unwrap();
        orchestrator.start(app.id).await.unwrap();

        for _ in 0..200 {
            if store.get(app.id).await.unwrap().status.step_status(Stage::Policy)
                == Some(StepStatus::Complete)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stored = store.get(app.id).await.unwrap();
        assert_eq!(stored.status.step_status(Stage::Policy), Some(StepStatus::Complete));
        assert_eq!(stored.status.step_status(Stage::License), Some(StepStatus::Pending));
        assert_eq!(stored.status.percent_complete, 20);
        assert_eq!(broker.enqueued_count(Stage::License).await, 0);

        shutdown.send(true).unwrap();
        driver.await.unwrap().unwrap();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn test_resume_in_flight_picks_up_where_it_stopped() {
        let harness = WorkflowHarness::start(VerifierSet::new()).await;
        let interrupted = ApplicationBuilder::new()
            .completed_through(Stage::License)
            .with_stage_processing(Stage::Dmv)
            .build();
        let finished = ApplicationBuilder::new().finished().build();
        harness.store.insert(&interrupted).await.unwrap();
        harness.store.insert(&finished).await.unwrap();

        let resumed = harness.orchestrator.resume_in_flight(100).await.unwrap();
        assert_eq!(resumed, 1);

        let app = harness.wait_until_settled(interrupted.id, SETTLE_TIMEOUT).await;
        assert_completed(&app);
        assert_eq!(harness.verifiers.calls(Stage::Policy), 0);
        assert_eq!(harness.verifiers.calls(Stage::Dmv), 1);
        assert_eq!(
            app.result_for(Stage::License),
            Some(&StageResultFixtures::for_stage(Stage::License))
        );

        harness.shutdown().await;
    }
}
