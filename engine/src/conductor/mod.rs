//! Conductor System
//!
//! The agents (planner, generator, reviewer) and the orchestrator that
//! sequences them: plan, generate, execute, review and remember.

pub mod context;
pub mod generator;
pub mod orchestrator;
pub mod planner;
pub mod retry;
pub mod reviewer;

pub use context::ContextAssembler;
pub use generator::Generator;
pub use orchestrator::{Orchestrator, PipelineReport, PipelineSettings, PipelineState};
pub use planner::Planner;
pub use retry::RetryPolicy;
pub use reviewer::Reviewer;

use crate::llm::GatewayError;
use sdk::errors::EngineError;
use sdk::types::Artifact;

/// Reasons a generated artifact is rejected before execution
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArtifactValidationError {
    #[error("malformed playbook: {0}")]
    Malformed(String),

    #[error("playbook targets [{}] but the step targets [{}]", found.join(", "), expected.join(", "))]
    TargetMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
}

/// A generated artifact together with the reason it was rejected
///
/// The artifact is kept so that a regeneration continues its version lineage.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct RejectedArtifact {
    pub artifact: Artifact,
    pub reason: ArtifactValidationError,
}

/// Errors returned by the planning and generation agents
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("{0}")]
    Planning(String),

    #[error(transparent)]
    Validation(Box<RejectedArtifact>),

    #[error("{0}")]
    Compose(ArtifactValidationError),
}

impl From<AgentError> for EngineError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Gateway(e) => e.into(),
            AgentError::Planning(msg) => EngineError::Planning(msg),
            AgentError::Validation(rejected) => {
                EngineError::ArtifactValidation(rejected.reason.to_string())
            }
            AgentError::Compose(reason) => EngineError::ArtifactValidation(reason.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatch_message_names_both_sides() {
        let err = ArtifactValidationError::TargetMismatch {
            expected: vec!["web1".into()],
            found: vec!["db1".into()],
        };
        assert_eq!(
            err.to_string(),
            "playbook targets [db1] but the step targets [web1]"
        );
    }

    #[test]
    fn test_agent_error_mapping() {
        let rejected = RejectedArtifact {
            artifact: Artifact::new("- hosts: db1\n", "db1"),
            reason: ArtifactValidationError::Malformed("no plays".into()),
        };
        assert!(matches!(
            EngineError::from(AgentError::Validation(Box::new(rejected))),
            EngineError::ArtifactValidation(_)
        ));
        assert!(matches!(
            EngineError::from(AgentError::Planning("empty".into())),
            EngineError::Planning(_)
        ));
        assert!(matches!(
            EngineError::from(AgentError::Gateway(GatewayError::Timeout(1))),
            EngineError::GatewayTimeout(1)
        ));
    }
}
