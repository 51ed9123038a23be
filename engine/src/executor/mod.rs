//! Artifact Executor
//!
//! The single point of irreversible side effect in the pipeline. An
//! executor runs one artifact version against one inventory and reports a
//! status per host. It never retries: a playbook that deletes data must not
//! run twice because a caller hit a timeout.
//!
//! Per-host failures are data, returned inside a successful
//! [`ExecutionResult`]. Errors are reserved for runs that produced no usable
//! per-host outcome at all.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::{Artifact, ExecutionResult, InventoryRef};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod playbook;
pub mod recap;

pub use playbook::PlaybookExecutor;

/// Errors that abort an execution without per-host results
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("execution exceeded its {0}s deadline before any host reported")]
    Timeout(u64),

    #[error("inventory unreachable: {0}")]
    InventoryUnreachable(String),

    #[error("executor failed: {0}")]
    Failed(String),

    #[error("execution cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExecutorError> for EngineError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Timeout(secs) => EngineError::ExecutorTimeout(secs),
            ExecutorError::InventoryUnreachable(msg) => EngineError::ExecutorUnreachable(msg),
            ExecutorError::Failed(msg) => EngineError::ExecutorFailed(msg),
            ExecutorError::Cancelled => EngineError::Cancelled,
            ExecutorError::Io(e) => EngineError::Io(e),
        }
    }
}

/// Runs artifacts against an inventory
#[async_trait]
pub trait ArtifactExecutor: Send + Sync {
    /// Execute `artifact` once
    ///
    /// When `timeout` elapses the underlying process is terminated and hosts
    /// that had not reported a final outcome are marked `Timeout`. When
    /// `cancel` fires the process is terminated and `Cancelled` is returned.
    async fn execute(
        &self,
        artifact: &Artifact,
        inventory: &InventoryRef,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutorError>;

    /// Check `artifact` without running it
    ///
    /// `Ok(Some(reason))` means the artifact was rejected. `Err` means the
    /// check itself could not be carried out.
    async fn syntax_check(
        &self,
        _artifact: &Artifact,
        _inventory: &InventoryRef,
    ) -> Result<Option<String>, ExecutorError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            EngineError::from(ExecutorError::Timeout(300)),
            EngineError::ExecutorTimeout(300)
        ));
        assert!(matches!(
            EngineError::from(ExecutorError::InventoryUnreachable("all hosts".into())),
            EngineError::ExecutorUnreachable(_)
        ));
        assert!(matches!(
            EngineError::from(ExecutorError::Cancelled),
            EngineError::Cancelled
        ));
    }
}
