//! Verification stages and their fixed order

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ApplicationError;

/// A verification stage
///
/// Variants are declared in pipeline order, so the derived `Ord` matches
/// [`STAGE_ORDER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Lookup of existing home and life policies
    Policy,
    /// Extraction of data from the driver's license document
    License,
    /// Driving record check
    Dmv,
    /// Credit check
    Credit,
    /// Final underwriting risk evaluation
    Underwriting,
}

/// The fixed total order every application runs through
pub const STAGE_ORDER: [Stage; 5] = [
    Stage::Policy,
    Stage::License,
    Stage::Dmv,
    Stage::Credit,
    Stage::Underwriting,
];

/// What follows a completed stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Enqueue the given stage
    Run(Stage),
    /// The last stage finished; perform the terminal status mutation
    Stop,
}

impl Transition {
    /// Resolves the transition after a stage given by name
    ///
    /// This is the only place where an unrecognized stage can surface, since
    /// stage names cross process boundaries as strings.
    pub fn after(stage_name: &str) -> Result<Self, ApplicationError> {
        stage_name.parse::<Stage>().map(Stage::next)
    }
}

impl Stage {
    /// The stage every workflow starts with
    pub fn first() -> Stage {
        STAGE_ORDER[0]
    }

    /// Zero-based index in [`STAGE_ORDER`]
    pub fn position(self) -> usize {
        match self {
            Stage::Policy => 0,
            Stage::License => 1,
            Stage::Dmv => 2,
            Stage::Credit => 3,
            Stage::Underwriting => 4,
        }
    }

    /// The transition that follows this stage's completion
    pub fn next(self) -> Transition {
        match STAGE_ORDER.get(self.position() + 1) {
            Some(stage) => Transition::Run(*stage),
            None => Transition::Stop,
        }
    }

    /// The stage that must complete before this one may start
    pub fn previous(self) -> Option<Stage> {
        self.position().checked_sub(1).map(|i| STAGE_ORDER[i])
    }

    /// Wire name, also used as the queue name
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Policy => "policy",
            Stage::License => "license",
            Stage::Dmv => "dmv",
            Stage::Credit => "credit",
            Stage::Underwriting => "underwriting",
        }
    }

    /// Human readable progress label shown for the step
    pub fn label(self) -> &'static str {
        match self {
            Stage::Policy => "Checking for Existing Home & Life Policies...",
            Stage::License => "Checking License...",
            Stage::Dmv => "Checking DMV Records...",
            Stage::Credit => "Fetching Credit Score...",
            Stage::Underwriting => "Performing Underwriting Risk Evaluation...",
        }
    }

    /// Key under which the stage's result payload is merged into the application
    pub fn result_key(self) -> &'static str {
        match self {
            Stage::Policy => "policyData",
            Stage::License => "licenseData",
            Stage::Dmv => "dmvData",
            Stage::Credit => "creditData",
            Stage::Underwriting => "underwritingData",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ApplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        STAGE_ORDER
            .iter()
            .copied()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ApplicationError::UnknownStage(s.to_string()))
    }
}
