//! Pipeline identifiers
//!
//! Every id is a UUIDv7, so ids sort by creation time. Display adds a short
//! tag (`APP-…`, `JOB-…`, `SIG-…`) for logs; serde and the database see the
//! bare UUID.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! pipeline_id {
    ($(#[$doc:meta])* $name:ident, $tag:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Tag shown in front of the UUID when displayed
            pub const TAG: &'static str = $tag;

            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", Self::TAG, self.0)
            }
        }

        /// Accepts the displayed form or a bare UUID
        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bare = s
                    .strip_prefix(Self::TAG)
                    .and_then(|rest| rest.strip_prefix('-'))
                    .unwrap_or(s);
                Uuid::parse_str(bare).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Uuid {
                id.0
            }
        }
    };
}

pipeline_id!(
    /// A submitted application
    ApplicationId,
    "APP"
);
pipeline_id!(
    /// A stage job on one of the queues
    JobId,
    "JOB"
);
pipeline_id!(
    /// A published step signal
    SignalId,
    "SIG"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_tag() {
        assert!(ApplicationId::new().to_string().starts_with("APP-"));
    }

    #[test]
    fn test_display_parses_back() {
        let original = JobId::new();
        let parsed: JobId = original.to_string().parse().unwrap();
        assert_eq!(original, parsed);
    }
}
