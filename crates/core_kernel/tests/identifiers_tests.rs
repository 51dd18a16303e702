//! Identifier behaviour seen from other crates: ordering, parsing and the
//! serialized form stored in JSON columns.

use core_kernel::{ApplicationId, JobId, SignalId};
use uuid::Uuid;

// ============= APPLICATION ID TESTS =============

mod application_id_tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ApplicationId::new(), ApplicationId::new());
    }

    #[test]
    fn test_later_ids_sort_after_earlier_ones() {
        let first = ApplicationId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = ApplicationId::new();
        assert!(first.as_uuid() < second.as_uuid());
    }

    #[test]
    fn test_parses_bare_uuid() {
        let uuid = Uuid::now_v7();
        let parsed: ApplicationId = uuid.to_string().parse().unwrap();
        assert_eq!(*parsed.as_uuid(), uuid);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("APP-not-a-uuid".parse::<ApplicationId>().is_err());
        assert!("".parse::<ApplicationId>().is_err());
    }

    #[test]
    fn test_serializes_as_bare_uuid() {
        let uuid = Uuid::now_v7();
        let id = ApplicationId::from(uuid);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", uuid));

        let back: ApplicationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}

// ============= PIPELINE ID TESTS =============

mod pipeline_id_tests {
    use super::*;

    #[test]
    fn test_tags() {
        assert_eq!(JobId::TAG, "JOB");
        assert_eq!(SignalId::TAG, "SIG");
        assert!(SignalId::new().to_string().starts_with("SIG-"));
    }

    #[test]
    fn test_same_uuid_displays_differently_per_kind() {
        let job = JobId::new();
        let signal = SignalId::from(Uuid::from(job));
        assert_ne!(job.to_string(), signal.to_string());
        assert_eq!(job.as_uuid(), signal.as_uuid());
    }

    #[test]
    fn test_other_kinds_tag_is_not_stripped() {
        let job = JobId::new();
        assert!(job.to_string().parse::<SignalId>().is_err());
    }
}
