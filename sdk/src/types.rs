//! Pipeline data model
//!
//! Every value that flows between the planning, generation, execution,
//! review and memory stages is defined here so that the engine and its
//! tests share one vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Identifier returned by the memory store for a committed record
pub type RecordId = String;

/// Where an artifact should be executed
///
/// The path is opaque to the pipeline and is handed to the executor verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum InventoryRef {
    /// The local machine only
    DefaultLocal,
    /// An inventory file supplied by the operator
    Path(String),
}

impl InventoryRef {
    /// Build an inventory reference from an optional CLI argument
    pub fn from_arg(arg: Option<&str>) -> Self {
        match arg.map(str::trim) {
            Some(path) if !path.is_empty() => Self::Path(path.to_string()),
            _ => Self::DefaultLocal,
        }
    }

    /// Selector used when a plan step does not name its own target
    pub fn default_selector(&self) -> &'static str {
        match self {
            Self::DefaultLocal => "localhost",
            Self::Path(_) => "all",
        }
    }
}

impl fmt::Display for InventoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DefaultLocal => write!(f, "default-local"),
            Self::Path(path) => write!(f, "{}", path),
        }
    }
}

/// A natural-language operations request
///
/// Fields are private: a request cannot change once it enters the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    id: String,
    raw_text: String,
    inventory: InventoryRef,
    model_hint: Option<String>,
    created_at: DateTime<Utc>,
}

impl Request {
    /// Create a new request with a fresh id
    pub fn new(
        raw_text: impl Into<String>,
        inventory: InventoryRef,
        model_hint: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            raw_text: raw_text.into(),
            inventory,
            model_hint,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn inventory(&self) -> &InventoryRef {
        &self.inventory
    }

    pub fn model_hint(&self) -> Option<&str> {
        self.model_hint.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Risk classification of a plan step or artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" | "med" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown risk level '{}'", other)),
        }
    }
}

/// One step of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub description: String,
    pub target_selector: String,
    pub risk_level: RiskLevel,
}

/// Ordered decomposition of a request
///
/// A plan is consumed by value when artifacts are generated from it; it is
/// never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    steps: Vec<PlanStep>,
}

impl Plan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<PlanStep> {
        self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Highest risk level across all steps
    pub fn max_risk(&self) -> RiskLevel {
        self.steps
            .iter()
            .map(|s| s.risk_level)
            .max()
            .unwrap_or(RiskLevel::Low)
    }
}

/// A generated automation document and the selector it declares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub version: u32,
    pub content: String,
    pub target_selector: String,
    pub digest: String,
}

impl Artifact {
    /// Create the first version of a new artifact
    pub fn new(content: impl Into<String>, target_selector: impl Into<String>) -> Self {
        Self::with_version(uuid::Uuid::new_v4().to_string(), 1, content, target_selector)
    }

    /// Create a specific version of an artifact lineage
    pub fn with_version(
        id: impl Into<String>,
        version: u32,
        content: impl Into<String>,
        target_selector: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let target_selector = target_selector.into();
        let digest = Self::compute_digest(&target_selector, &content);
        Self {
            id: id.into(),
            version,
            content,
            target_selector,
            digest,
        }
    }

    /// Produce the next version of this artifact with new content
    pub fn next_version(&self, content: impl Into<String>) -> Self {
        Self::with_version(
            self.id.clone(),
            self.version + 1,
            content,
            self.target_selector.clone(),
        )
    }

    /// Hex SHA-256 over the selector and content
    pub fn compute_digest(target_selector: &str, content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(target_selector.as_bytes());
        hasher.update([0u8]);
        hasher.update(content.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Check the stored digest against the content
    pub fn verify_digest(&self) -> bool {
        Self::compute_digest(&self.target_selector, &self.content) == self.digest
    }
}

/// Outcome reported for a single host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Success,
    Failure,
    Unreachable,
    Timeout,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Unreachable => "unreachable",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured result of running one artifact version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub artifact_id: String,
    pub artifact_version: u32,
    pub hosts: BTreeMap<String, HostStatus>,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed before it exited
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl ExecutionResult {
    /// Number of hosts with the given status
    pub fn count(&self, status: HostStatus) -> usize {
        self.hosts.values().filter(|s| **s == status).count()
    }

    /// Names of hosts with the given status, in sorted order
    pub fn hosts_with(&self, status: HostStatus) -> Vec<&str> {
        self.hosts
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(h, _)| h.as_str())
            .collect()
    }
}

/// Review judgment over an execution result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    pub summary: String,
    /// Heuristic confidence in `[0, 1]`
    pub confidence: f64,
}

/// One persisted unit of pipeline history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: RecordId,
    pub request_id: String,
    pub embedding: Vec<f32>,
    pub request_text: String,
    pub artifact: Option<Artifact>,
    pub execution_result: Option<ExecutionResult>,
    pub verdict: Option<Verdict>,
    /// Pipeline stage that failed, if the run did not complete
    pub failed_stage: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl MemoryRecord {
    /// Start a record for a request whose text has already been embedded
    pub fn new(request: &Request, embedding: Vec<f32>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: request.id().to_string(),
            embedding,
            request_text: request.raw_text().to_string(),
            artifact: None,
            execution_result: None,
            verdict: None,
            failed_stage: None,
            timestamp: Utc::now(),
        }
    }

    pub fn artifact_digest(&self) -> Option<&str> {
        self.artifact.as_ref().map(|a| a.digest.as_str())
    }

    pub fn passed(&self) -> Option<bool> {
        self.verdict.as_ref().map(|v| v.passed)
    }
}

/// A record returned by similarity search with its cosine score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    pub score: f64,
}

/// Optional constraints applied to similarity search
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub has_execution_result: Option<bool>,
}

impl RecordFilter {
    pub fn executed() -> Self {
        Self {
            has_execution_result: Some(true),
        }
    }

    pub fn matches(&self, record: &MemoryRecord) -> bool {
        match self.has_execution_result {
            Some(wanted) => record.execution_result.is_some() == wanted,
            None => true,
        }
    }
}
