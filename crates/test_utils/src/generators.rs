//! Property-Based Test Generators
//!
//! Proptest strategies for pipeline data.

use proptest::collection::{btree_map, vec};
use proptest::prelude::*;
use serde_json::{json, Value};

use domain_application::{Stage, StepStatus, UserData, STAGE_ORDER};

/// Strategy for any stage
pub fn stage_strategy() -> impl Strategy<Value = Stage> {
    prop::sample::select(STAGE_ORDER.to_vec())
}

/// Strategy for any step status
pub fn step_status_strategy() -> impl Strategy<Value = StepStatus> {
    prop_oneof![
        Just(StepStatus::Pending),
        Just(StepStatus::Processing),
        Just(StepStatus::Complete),
        Just(StepStatus::Failed),
    ]
}

/// Strategy for a sequence of status requests against random stages
pub fn status_requests_strategy(max_len: usize) -> impl Strategy<Value = Vec<(Stage, StepStatus)>> {
    vec((stage_strategy(), step_status_strategy()), 0..max_len)
}

/// Strategy for small JSON payloads like those verifiers return
pub fn payload_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z]{0,12}".prop_map(Value::from),
        (any::<u16>(), "[a-z]{1,8}").prop_map(|(score, bureau)| json!({"score": score, "bureau": bureau})),
    ]
}

/// Strategy for applicant data, including unmodelled extra fields
pub fn user_data_strategy() -> impl Strategy<Value = UserData> {
    (
        "[A-Z][a-z]{1,10}",
        "[A-Z][a-z]{1,12}",
        "[0-9]{1,4} [A-Z][a-z]{2,10} St",
        "[A-Z][a-z]{2,12}",
        "[A-Z]{2}",
        "[0-9]{5}",
        btree_map("x[A-Z][a-z]{2,8}", payload_strategy(), 0..3),
    )
        .prop_map(|(first_name, last_name, address, city, state, zipcode, extra)| UserData {
            first_name,
            last_name,
            address,
            city,
            state,
            zipcode,
            license_document: None,
            extra,
        })
}

/// Strategy for how many times a stage fails before succeeding
pub fn failures_before_success_strategy(max_attempts: u32) -> impl Strategy<Value = u32> {
    0..max_attempts
}
