//! Pre-built Test Fixtures
//!
//! Ready-to-use applicant data and stage payloads. Fixtures are fixed values
//! so tests can assert on them directly.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use domain_application::{DocumentRef, Stage, UserData};

/// Fixture for submitted applicant data
pub struct UserDataFixtures;

impl UserDataFixtures {
    /// A complete, ordinary submission
    pub fn standard() -> UserData {
        UserData {
            first_name: "Grace".to_string(),
            last_name: "Hopper".to_string(),
            address: "1 Harbor Way".to_string(),
            city: "Arlington".to_string(),
            state: "VA".to_string(),
            zipcode: "22201".to_string(),
            license_document: Some(Self::license_photo()),
            ..Default::default()
        }
    }

    /// A submission without the license photo
    pub fn without_license() -> UserData {
        UserData {
            license_document: None,
            ..Self::standard()
        }
    }

    /// A submission carrying fields the pipeline does not interpret
    pub fn with_extra_fields() -> UserData {
        let mut data = Self::standard();
        data.extra.insert("vehicleVin".to_string(), json!("1HGCM82633A004352"));
        data.extra.insert("priorClaims".to_string(), json!(0));
        data
    }

    /// A numbered applicant, for runs with many applications
    pub fn numbered(n: usize) -> UserData {
        UserData {
            first_name: format!("Applicant{}", n),
            ..Self::standard()
        }
    }

    pub fn license_photo() -> DocumentRef {
        DocumentRef {
            path: "uploads/licenses/grace-hopper.jpg".to_string(),
            content_type: Some("image/jpeg".to_string()),
        }
    }
}

/// Fixture for stage outcomes
pub struct StageResultFixtures;

impl StageResultFixtures {
    /// A plausible verifier payload for each stage
    pub fn for_stage(stage: Stage) -> Value {
        match stage {
            Stage::Policy => json!({"priorPolicy": false, "carrier": null}),
            Stage::License => json!({"licenseNumber": "H1234567", "class": "C", "expires": "2029-12-09"}),
            Stage::Dmv => json!({"violations": 0, "suspended": false}),
            Stage::Credit => json!({"score": 742, "bureau": "simulated"}),
            Stage::Underwriting => json!({"decision": "approve", "monthlyPremium": 112}),
        }
    }
}

/// Fixture for timestamps
pub struct TemporalFixtures;

impl TemporalFixtures {
    /// A fixed submission time (Mar 1, 2024 09:00 UTC)
    pub fn submitted_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0)
            .single()
            .expect("valid fixture timestamp")
    }
}
