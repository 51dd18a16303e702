//! Stage verifier port
//!
//! The verification logic behind each stage (policy lookup, license OCR,
//! DMV record check, credit check, underwriting) lives outside this crate.
//! Workers only see the opaque JSON payload a verifier returns.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use core_kernel::ApplicationId;
use domain_application::{Stage, STAGE_ORDER};

use crate::error::VerifierError;

/// Verification logic for one stage
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, application_id: ApplicationId) -> Result<Value, VerifierError>;
}

/// One verifier per stage
#[derive(Clone)]
pub struct Verifiers {
    verifiers: [Arc<dyn Verifier>; STAGE_ORDER.len()],
}

impl Verifiers {
    pub fn from_fn(mut build: impl FnMut(Stage) -> Arc<dyn Verifier>) -> Self {
        Self {
            verifiers: std::array::from_fn(|index| build(STAGE_ORDER[index])),
        }
    }

    pub fn get(&self, stage: Stage) -> Arc<dyn Verifier> {
        Arc::clone(&self.verifiers[stage.position()])
    }
}

impl std::fmt::Debug for Verifiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifiers").finish_non_exhaustive()
    }
}
