//! Scripted Verifiers
//!
//! Stand-ins for the stage verification services. Each one counts its calls
//! so tests can check how often a stage actually ran.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use core_kernel::ApplicationId;
use domain_application::Stage;
use domain_workflow::{Verifier, VerifierError, Verifiers};

use crate::fixtures::StageResultFixtures;

/// Replays a scripted list of outcomes, then succeeds with a fixed payload
#[derive(Debug)]
pub struct ScriptedVerifier {
    script: Mutex<VecDeque<Result<Value, VerifierError>>>,
    fallback: Value,
    calls: AtomicU32,
    seen: Mutex<Vec<ApplicationId>>,
}

impl ScriptedVerifier {
    /// Always succeeds with `payload`
    pub fn succeeding(payload: Value) -> Self {
        Self::with_script(Vec::new(), payload)
    }

    /// Succeeds with the fixture payload of `stage`
    pub fn for_stage(stage: Stage) -> Self {
        Self::succeeding(StageResultFixtures::for_stage(stage))
    }

    /// Fails the first `failures` calls as unavailable, then succeeds
    pub fn failing_first(failures: u32, payload: Value) -> Self {
        let script = (1..=failures)
            .map(|n| Err(VerifierError::unavailable(format!("service unavailable (call {})", n))))
            .collect();
        Self::with_script(script, payload)
    }

    /// Never succeeds
    pub fn always_failing(message: &str) -> Self {
        let script = std::iter::repeat_with(|| Err(VerifierError::unavailable(message)))
            .take(10_000)
            .collect();
        Self::with_script(script, Value::Null)
    }

    pub fn with_script(script: Vec<Result<Value, VerifierError>>, fallback: Value) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Number of times `verify` was called
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Applications verified, in call order
    pub fn seen(&self) -> Vec<ApplicationId> {
        self.seen.lock().expect("verifier lock poisoned").clone()
    }
}

#[async_trait]
impl Verifier for ScriptedVerifier {
    async fn verify(&self, application_id: ApplicationId) -> Result<Value, VerifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .expect("verifier lock poisoned")
            .push(application_id);
        let next = self.script.lock().expect("verifier lock poisoned").pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

/// A verifier per stage that tests keep handles to
#[derive(Debug, Clone)]
pub struct VerifierSet {
    by_stage: Vec<(Stage, Arc<ScriptedVerifier>)>,
}

impl Default for VerifierSet {
    fn default() -> Self {
        Self::new()
    }
}

impl VerifierSet {
    /// Every stage succeeds with its fixture payload
    pub fn new() -> Self {
        Self {
            by_stage: domain_application::STAGE_ORDER
                .iter()
                .map(|stage| (*stage, Arc::new(ScriptedVerifier::for_stage(*stage))))
                .collect(),
        }
    }

    /// Replaces the verifier of one stage
    pub fn with(mut self, stage: Stage, verifier: ScriptedVerifier) -> Self {
        if let Some(slot) = self.by_stage.iter_mut().find(|(s, _)| *s == stage) {
            slot.1 = Arc::new(verifier);
        }
        self
    }

    pub fn get(&self, stage: Stage) -> Arc<ScriptedVerifier> {
        self.by_stage
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, verifier)| Arc::clone(verifier))
            .expect("every stage has a verifier")
    }

    /// Call count of one stage's verifier
    pub fn calls(&self, stage: Stage) -> u32 {
        self.get(stage).calls()
    }

    /// The set as the workflow's verifier registry
    pub fn verifiers(&self) -> Verifiers {
        Verifiers::from_fn(|stage| self.get(stage) as Arc<dyn Verifier>)
    }
}
