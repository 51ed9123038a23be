//! Error types and handling
//!
//! This module provides the error taxonomy used throughout the infrabot engine.
//! All errors implement the `InfrabotErrorExt` trait which provides user-friendly
//! hints and indicates whether the pipeline may retry the failed stage.
//!
//! # Security
//!
//! User hints are static strings. They never echo model output, inventory
//! contents or file paths back to the user.

use thiserror::Error;

/// Trait for infrabot error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait InfrabotErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and does not contain:
    /// - Model output or generated artifacts
    /// - File paths
    /// - Internal implementation details
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors are transient: the orchestrator re-enters the same
    /// stage after a backoff. Everything else is terminal for the current
    /// attempt and is either regenerated once or escalated.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Configuration**: Invalid or missing configuration
/// - **Persistence**: Memory store failures
/// - **Gateway**: Language-model transport and response errors
/// - **Agents**: Planning and artifact validation failures
/// - **Executor**: Timeouts, unreachable inventories and spawn failures
/// - **Pipeline**: Risk rejection, cancellation and double-execution guards
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, InfrabotErrorExt};
///
/// let error = EngineError::GatewayTimeout(120);
/// println!("Hint: {}", error.user_hint());
/// assert!(error.is_recoverable());
///
/// let fatal_error = EngineError::Planning("empty plan".to_string());
/// assert!(!fatal_error.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    // Gateway errors
    #[error("Language model gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Language model gateway timed out after {0}s")]
    GatewayTimeout(u64),

    #[error("Invalid response from language model gateway: {0}")]
    GatewayResponse(String),

    // Agent errors
    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("Artifact validation failed: {0}")]
    ArtifactValidation(String),

    #[error("Risk level {actual} exceeds the allowed maximum {allowed}")]
    RiskRejected { actual: String, allowed: String },

    // Executor errors
    #[error("Execution exceeded its deadline of {0}s")]
    ExecutorTimeout(u64),

    #[error("Inventory unreachable: {0}")]
    ExecutorUnreachable(String),

    #[error("Executor failed: {0}")]
    ExecutorFailed(String),

    #[error("Artifact {0} was already executed")]
    ArtifactAlreadyExecuted(String),

    // Argument errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation cancelled")]
    Cancelled,

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl InfrabotErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            // Configuration errors
            Self::Config(_) => "Check your config.toml file for errors",

            // Storage errors
            Self::Database(_) => "Memory database could not be opened. Check the data directory",
            Self::Persistence(_) => "The run could not be recorded in memory",

            // Gateway errors
            Self::GatewayUnavailable(_) => {
                "Language model unavailable. Is Ollama running? Try 'infrabot doctor'"
            }
            Self::GatewayTimeout(_) => "Language model took too long to respond. Try again",
            Self::GatewayResponse(_) => "Language model returned an unusable response",

            // Agent errors
            Self::Planning(_) => "Could not build a plan. Try rephrasing the task",
            Self::ArtifactValidation(_) => "Generated playbook was invalid. Try rephrasing the task",
            Self::RiskRejected { .. } => {
                "Task was rejected by the risk policy. Raise security.max_risk_level to allow it"
            }

            // Executor errors
            Self::ExecutorTimeout(_) => "Execution took too long. Increase executor.timeout_secs",
            Self::ExecutorUnreachable(_) => "Target hosts could not be reached. Check the inventory",
            Self::ExecutorFailed(_) => "The executor could not run. Is ansible-playbook installed?",
            Self::ArtifactAlreadyExecuted(_) => "This artifact has already been executed",

            // Argument errors
            Self::InvalidArgument(_) => "Invalid argument supplied",
            Self::Cancelled => "The run was cancelled",

            // Generic IO error
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::GatewayUnavailable(_) | Self::GatewayTimeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_gateway_transport_errors_are_recoverable() {
        assert!(EngineError::GatewayUnavailable("down".into()).is_recoverable());
        assert!(EngineError::GatewayTimeout(5).is_recoverable());

        assert!(!EngineError::GatewayResponse("garbage".into()).is_recoverable());
        assert!(!EngineError::Planning("empty".into()).is_recoverable());
        assert!(!EngineError::ArtifactValidation("bad".into()).is_recoverable());
        assert!(!EngineError::ExecutorTimeout(300).is_recoverable());
        assert!(!EngineError::ExecutorUnreachable("all".into()).is_recoverable());
        assert!(!EngineError::Persistence("disk".into()).is_recoverable());
        assert!(!EngineError::Cancelled.is_recoverable());
    }

    #[test]
    fn test_risk_rejected_message() {
        let err = EngineError::RiskRejected {
            actual: "high".into(),
            allowed: "medium".into(),
        };
        assert_eq!(
            err.to_string(),
            "Risk level high exceeds the allowed maximum medium"
        );
    }
}
