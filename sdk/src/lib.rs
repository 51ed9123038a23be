//! Infrabot SDK
//!
//! Shared data model and error taxonomy for the infrabot engine.
//! This crate performs no I/O.

/// Error types and handling
pub mod errors;

/// Pipeline data model
pub mod types;

// Re-export commonly used types
pub use errors::{EngineError, InfrabotErrorExt};
pub use types::{
    Artifact, ExecutionResult, HostStatus, InventoryRef, MemoryRecord, Plan, PlanStep, RecordFilter,
    RecordId, Request, RiskLevel, ScoredRecord, Verdict,
};
