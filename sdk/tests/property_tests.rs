use proptest::prelude::*;
use sdk::errors::{EngineError, InfrabotErrorExt};
use sdk::types::{Artifact, RiskLevel};

// Error user hints never echo the payload back
proptest! {
    #[test]
    fn test_error_user_hint_completeness(error_str in "[a-zA-Z0-9/_.-]{8,40}") {
        let errs = vec![
            EngineError::Config(error_str.clone()),
            EngineError::Database(error_str.clone()),
            EngineError::Persistence(error_str.clone()),
            EngineError::GatewayUnavailable(error_str.clone()),
            EngineError::GatewayResponse(error_str.clone()),
            EngineError::Planning(error_str.clone()),
            EngineError::ArtifactValidation(error_str.clone()),
            EngineError::ExecutorUnreachable(error_str.clone()),
            EngineError::ExecutorFailed(error_str.clone()),
            EngineError::InvalidArgument(error_str.clone()),
        ];

        for err in errs {
            let hint = err.user_hint();
            prop_assert!(!hint.is_empty());
            prop_assert!(!hint.contains(&error_str));
        }
    }
}

// Digests depend on both selector and content
proptest! {
    #[test]
    fn test_artifact_digest_binds_selector(
        content in "[ -~]{0,200}",
        a in "[a-z0-9]{1,12}",
        b in "[a-z0-9]{1,12}",
    ) {
        prop_assume!(a != b);
        let left = Artifact::new(content.clone(), a);
        let right = Artifact::new(content, b);
        prop_assert_ne!(&left.digest, &right.digest);
        prop_assert!(left.verify_digest());
    }
}

proptest! {
    #[test]
    fn test_risk_level_display_parses_back(idx in 0usize..3) {
        let level = [RiskLevel::Low, RiskLevel::Medium, RiskLevel::High][idx];
        prop_assert_eq!(level.to_string().parse::<RiskLevel>().unwrap(), level);
    }
}
