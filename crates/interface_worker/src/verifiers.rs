//! Simulated stage verifiers
//!
//! The real verification services (policy lookup, license OCR, DMV, credit
//! bureau, underwriting) are not part of this system. The process ships with
//! stand-ins that wait a configurable latency and report a fixed outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

use core_kernel::ApplicationId;
use domain_application::Stage;
use domain_workflow::{Verifier, VerifierError, Verifiers};

#[derive(Debug, Clone)]
pub struct SimulatedVerifier {
    stage: Stage,
    latency: Duration,
}

impl SimulatedVerifier {
    pub fn new(stage: Stage, latency: Duration) -> Self {
        Self { stage, latency }
    }

    /// One simulated verifier per stage
    pub fn all(latency: Duration) -> Verifiers {
        Verifiers::from_fn(|stage| Arc::new(Self::new(stage, latency)) as Arc<dyn Verifier>)
    }

    fn outcome(&self) -> Value {
        let details = match self.stage {
            Stage::Policy => json!({"existingPolicies": []}),
            Stage::License => json!({"documentRead": true}),
            Stage::Dmv => json!({"violations": 0}),
            Stage::Credit => json!({"tier": "standard"}),
            Stage::Underwriting => json!({"decision": "refer"}),
        };
        json!({
            "stage": self.stage.as_str(),
            "simulated": true,
            "verifiedAt": Utc::now().to_rfc3339(),
            "details": details,
        })
    }
}

#[async_trait]
impl Verifier for SimulatedVerifier {
    async fn verify(&self, application_id: ApplicationId) -> Result<Value, VerifierError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        debug!(%application_id, stage = %self.stage, "Simulated verification done");
        Ok(self.outcome())
    }
}
