//! Pipeline Orchestrator
//!
//! Drives one request through
//! `RECEIVED -> PLANNING -> GENERATING -> EXECUTING -> REVIEWING -> PERSISTED`,
//! with `FAILED` reachable from every stage before persistence.
//!
//! The orchestrator is the only place where retry, regeneration and
//! escalation policy lives:
//!
//! - gateway transport errors are retried with bounded exponential backoff
//! - a malformed plan gets one regeneration with a format hint
//! - a rejected artifact gets one regeneration carrying the rejection reason
//! - the executor is never retried, and runs at most once per artifact version
//!
//! Every run ends with a [`PipelineReport`]. A failed run still leaves a
//! best-effort memory record when the request could be embedded.

use crate::conductor::generator::compose_artifacts;
use crate::conductor::planner::WELL_FORMED_HINT;
use crate::conductor::{
    AgentError, ArtifactValidationError, Generator, Planner, RejectedArtifact, RetryPolicy,
    Reviewer,
};
use crate::config::Config;
use crate::db::MemoryStore;
use crate::executor::ArtifactExecutor;
use crate::llm::Gateway;
use crate::risk_assessor::RiskAssessor;
use sdk::errors::{EngineError, InfrabotErrorExt};
use sdk::types::{
    Artifact, ExecutionResult, MemoryRecord, Plan, RecordFilter, RecordId, Request, RiskLevel,
    ScoredRecord, Verdict,
};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Received,
    Planning,
    Generating,
    Executing,
    Reviewing,
    Persisted,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Planning => "PLANNING",
            Self::Generating => "GENERATING",
            Self::Executing => "EXECUTING",
            Self::Reviewing => "REVIEWING",
            Self::Persisted => "PERSISTED",
            Self::Failed => "FAILED",
        }
    }

    /// True for states a run can end in
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Persisted | Self::Failed | Self::Reviewing)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator policy, usually derived from [`Config`]
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Model used when the request carries no hint
    pub default_model: String,
    pub retry: RetryPolicy,
    /// Similar records retrieved for planning and review
    pub context_records: usize,
    pub executor_timeout: Duration,
    /// Highest risk level allowed to reach the executor
    pub max_risk: RiskLevel,
    pub review_narrative: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            default_model: "deepseek-coder".to_string(),
            retry: RetryPolicy::default(),
            context_records: 3,
            executor_timeout: Duration::from_secs(300),
            max_risk: RiskLevel::High,
            review_narrative: false,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_model: config.llm.model.clone(),
            retry: RetryPolicy::new(
                config.pipeline.max_retries,
                Duration::from_millis(config.pipeline.initial_backoff_ms),
            ),
            context_records: config.pipeline.context_records,
            executor_timeout: config.executor.timeout(),
            max_risk: config.security.max_risk(),
            review_narrative: config.pipeline.review_narrative,
        }
    }
}

/// Outcome of one pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub request_id: String,
    pub request_text: String,
    pub inventory: String,
    pub model: String,
    /// Terminal state
    pub state: PipelineState,
    /// Every state entered, in order
    pub transitions: Vec<PipelineState>,
    pub failed_stage: Option<PipelineState>,
    pub error: Option<String>,
    pub hint: Option<String>,
    pub plan: Option<Plan>,
    pub artifact: Option<Artifact>,
    pub execution: Option<ExecutionResult>,
    pub verdict: Option<Verdict>,
    pub record_id: Option<RecordId>,
    pub persistence_error: Option<String>,
    /// Similar records offered to the agents
    pub context_records: usize,
    pub planning_attempts: u32,
    pub generation_attempts: u32,
    pub executor_invocations: u32,
    pub duration_ms: u64,
}

impl PipelineReport {
    fn new(request: &Request, model: &str) -> Self {
        Self {
            request_id: request.id().to_string(),
            request_text: request.raw_text().to_string(),
            inventory: request.inventory().to_string(),
            model: model.to_string(),
            state: PipelineState::Received,
            transitions: vec![PipelineState::Received],
            failed_stage: None,
            error: None,
            hint: None,
            plan: None,
            artifact: None,
            execution: None,
            verdict: None,
            record_id: None,
            persistence_error: None,
            context_records: 0,
            planning_attempts: 0,
            generation_attempts: 0,
            executor_invocations: 0,
            duration_ms: 0,
        }
    }

    fn enter(&mut self, state: PipelineState) {
        info!("{} -> {}", self.state, state);
        self.state = state;
        self.transitions.push(state);
    }

    /// True when the run reached a verdict and it passed
    pub fn passed(&self) -> bool {
        self.state != PipelineState::Failed && self.verdict.as_ref().is_some_and(|v| v.passed)
    }

    /// Process exit status: 0 when the verdict passed, 1 otherwise
    pub fn exit_code(&self) -> u8 {
        if self.passed() {
            0
        } else {
            1
        }
    }

    /// Human-readable report
    pub fn render(&self, verbose: bool) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "Request:   {}", self.request_text);
        let _ = writeln!(out, "Inventory: {}", self.inventory);
        let _ = writeln!(out, "Model:     {}", self.model);
        let _ = writeln!(
            out,
            "Pipeline:  {}",
            self.transitions
                .iter()
                .map(PipelineState::as_str)
                .collect::<Vec<_>>()
                .join(" -> ")
        );

        if let Some(plan) = &self.plan {
            let _ = writeln!(out, "\nPlan:");
            for (i, step) in plan.steps().iter().enumerate() {
                let _ = writeln!(
                    out,
                    "  {}. [{}] {}: {}",
                    i + 1,
                    step.risk_level,
                    step.target_selector,
                    step.description
                );
            }
        }

        if verbose {
            if let Some(artifact) = &self.artifact {
                let _ = writeln!(
                    out,
                    "\nArtifact {} v{} ({}):\n{}",
                    artifact.id,
                    artifact.version,
                    &artifact.digest[..artifact.digest.len().min(12)],
                    artifact.content.trim_end()
                );
            }
        }

        if let Some(result) = &self.execution {
            let _ = writeln!(
                out,
                "\nExecution: exit code {}, {} ms{}",
                result
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                result.duration_ms,
                if result.timed_out { ", timed out" } else { "" }
            );
            for (host, status) in &result.hosts {
                let _ = writeln!(out, "  {:<24} {}", host, status);
            }
            if verbose {
                if !result.stdout.trim().is_empty() {
                    let _ = writeln!(out, "\nstdout:\n{}", result.stdout.trim_end());
                }
                if !result.stderr.trim().is_empty() {
                    let _ = writeln!(out, "\nstderr:\n{}", result.stderr.trim_end());
                }
            }
        }

        if let (Some(stage), Some(error)) = (&self.failed_stage, &self.error) {
            let _ = writeln!(out, "\nFAILED during {}: {}", stage, error);
            if let Some(hint) = &self.hint {
                let _ = writeln!(out, "Hint: {}", hint);
            }
        } else if let Some(verdict) = &self.verdict {
            let _ = writeln!(
                out,
                "\nVerdict: {} (confidence {:.2})",
                if verdict.passed { "PASSED" } else { "FAILED" },
                verdict.confidence
            );
            let _ = writeln!(out, "{}", verdict.summary);
        }

        match (&self.record_id, &self.persistence_error) {
            (Some(id), _) => {
                let _ = writeln!(out, "\nRecorded as {}", id);
            }
            (None, Some(err)) => {
                let _ = writeln!(out, "\nWarning: run not recorded: {}", err);
            }
            _ => {}
        }

        if verbose {
            let _ = writeln!(
                out,
                "\nAttempts: planning {}, generation {}, executor {}; context records {}; {} ms",
                self.planning_attempts,
                self.generation_attempts,
                self.executor_invocations,
                self.context_records,
                self.duration_ms
            );
        }

        out
    }
}

/// A stage failure on its way to the report
struct Failure {
    stage: PipelineState,
    error: EngineError,
}

impl Failure {
    fn new(stage: PipelineState, error: impl Into<EngineError>) -> Self {
        Self {
            stage,
            error: error.into(),
        }
    }
}

/// Mutable state of a single run
struct Run<'a> {
    request: &'a Request,
    model: String,
    report: PipelineReport,
    embedding: Option<Vec<f32>>,
    executed: HashSet<(String, u32)>,
}

pub struct Orchestrator {
    gateway: Arc<dyn Gateway>,
    memory: Arc<dyn MemoryStore>,
    executor: Arc<dyn ArtifactExecutor>,
    planner: Planner,
    generator: Generator,
    reviewer: Reviewer,
    assessor: RiskAssessor,
    settings: PipelineSettings,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        memory: Arc<dyn MemoryStore>,
        executor: Arc<dyn ArtifactExecutor>,
        settings: PipelineSettings,
    ) -> Self {
        let reviewer = if settings.review_narrative {
            Reviewer::new().with_narrative(gateway.clone())
        } else {
            Reviewer::new()
        };

        Self {
            planner: Planner::new(gateway.clone()),
            generator: Generator::new(gateway.clone()),
            reviewer,
            assessor: RiskAssessor::new(),
            gateway,
            memory,
            executor,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run `request` through the whole pipeline
    ///
    /// Never returns an error: failures are described by the report.
    pub async fn run(&self, request: &Request, cancel: &CancellationToken) -> PipelineReport {
        let span = tracing::info_span!("pipeline", request_id = %request.id());
        self.drive(request, cancel).instrument(span).await
    }

    async fn drive(&self, request: &Request, cancel: &CancellationToken) -> PipelineReport {
        let started = Instant::now();
        let model = request
            .model_hint()
            .unwrap_or(&self.settings.default_model)
            .to_string();
        info!("Received request: {}", request.raw_text());

        let mut run = Run {
            request,
            report: PipelineReport::new(request, &model),
            model,
            embedding: None,
            executed: HashSet::new(),
        };

        if let Err(failure) = self.advance(&mut run, cancel).await {
            self.fail(&mut run, failure).await;
        }

        run.report.duration_ms = started.elapsed().as_millis() as u64;
        run.report
    }

    async fn advance(&self, run: &mut Run<'_>, cancel: &CancellationToken) -> Result<(), Failure> {
        let request = run.request;

        // RECEIVED: embed once, then look up similar history
        let mut embed_attempts = 0;
        let embedding = self
            .settings
            .retry
            .run("embed", cancel, &mut embed_attempts, || {
                self.gateway.embed(request.raw_text())
            })
            .await
            .map_err(|e| Failure::new(PipelineState::Received, e))?;
        run.embedding = Some(embedding.clone());

        let context = self.recall(&embedding, RecordFilter::default()).await;
        let history = self.recall(&embedding, RecordFilter::executed()).await;
        run.report.context_records = context.len();

        self.checkpoint(run, cancel)?;
        run.report.enter(PipelineState::Planning);
        let plan = self.plan(run, &context, cancel).await?;
        run.report.plan = Some(plan.clone());

        self.checkpoint(run, cancel)?;
        run.report.enter(PipelineState::Generating);
        let artifact = self.generate(run, plan, &context, cancel).await?;

        self.checkpoint(run, cancel)?;
        run.report.enter(PipelineState::Executing);
        let result = self.execute(run, &artifact, cancel).await?;
        run.report.execution = Some(result.clone());

        // Side effects have happened; review and record even if cancelled now
        run.report.enter(PipelineState::Reviewing);
        let verdict = self
            .reviewer
            .review(request, &result, &history, &run.model, cancel)
            .await;
        run.report.verdict = Some(verdict.clone());

        let mut record = MemoryRecord::new(request, embedding);
        record.artifact = Some(artifact);
        record.execution_result = Some(result);
        record.verdict = Some(verdict);

        match self.memory.store(&record).await {
            Ok(id) => {
                run.report.record_id = Some(id);
                run.report.enter(PipelineState::Persisted);
            }
            Err(e) => {
                error!("Failed to record run {}: {}", record.id, e);
                run.report.persistence_error = Some(e.to_string());
            }
        }

        Ok(())
    }

    fn checkpoint(&self, run: &Run<'_>, cancel: &CancellationToken) -> Result<(), Failure> {
        if cancel.is_cancelled() {
            return Err(Failure::new(run.report.state, EngineError::Cancelled));
        }
        Ok(())
    }

    /// Similar records; lookup failures degrade to no context
    async fn recall(&self, embedding: &[f32], filter: RecordFilter) -> Vec<ScoredRecord> {
        if self.settings.context_records == 0 {
            return Vec::new();
        }
        match self
            .memory
            .query_similar_vector(embedding, self.settings.context_records, filter)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!("Memory lookup failed, continuing without context: {}", e);
                Vec::new()
            }
        }
    }

    async fn plan(
        &self,
        run: &mut Run<'_>,
        context: &[ScoredRecord],
        cancel: &CancellationToken,
    ) -> Result<Plan, Failure> {
        let request = run.request;
        let model = run.model.as_str();
        let mut correction: Option<&str> = None;

        loop {
            let result = self
                .settings
                .retry
                .run("plan", cancel, &mut run.report.planning_attempts, || {
                    self.planner.plan(request, context, model, correction)
                })
                .await;

            match result {
                Ok(plan) => return Ok(plan),
                Err(AgentError::Planning(reason)) if correction.is_none() => {
                    warn!("Plan rejected ({}); regenerating with a format hint", reason);
                    correction = Some(WELL_FORMED_HINT);
                }
                Err(e) => return Err(Failure::new(PipelineState::Planning, e)),
            }
        }
    }

    async fn generate(
        &self,
        run: &mut Run<'_>,
        plan: Plan,
        context: &[ScoredRecord],
        cancel: &CancellationToken,
    ) -> Result<Artifact, Failure> {
        let request = run.request;
        let model = run.model.as_str();
        let plan_risk = plan.max_risk();
        let mut artifacts = Vec::with_capacity(plan.len());

        for step in plan.into_steps() {
            let mut previous: Option<RejectedArtifact> = None;

            let artifact = loop {
                let result = self
                    .settings
                    .retry
                    .run("generate", cancel, &mut run.report.generation_attempts, || {
                        self.generator
                            .generate(&step, request, context, model, previous.as_ref())
                    })
                    .await;
                let result = match result {
                    Ok(artifact) => self.syntax_check(artifact, request).await,
                    Err(e) => Err(e),
                };

                match result {
                    Ok(artifact) => break artifact,
                    Err(AgentError::Validation(rejected)) if previous.is_none() => {
                        warn!(
                            "Regenerating artifact for step '{}': {}",
                            step.description, rejected.reason
                        );
                        previous = Some(*rejected);
                    }
                    Err(AgentError::Validation(rejected)) => {
                        run.report.artifact = Some(rejected.artifact.clone());
                        return Err(Failure::new(
                            PipelineState::Generating,
                            AgentError::Validation(rejected),
                        ));
                    }
                    Err(e) => return Err(Failure::new(PipelineState::Generating, e)),
                }
            };
            artifacts.push(artifact);
        }

        let artifact = compose_artifacts(artifacts)
            .map_err(|e| Failure::new(PipelineState::Generating, AgentError::Compose(e)))?;
        run.report.artifact = Some(artifact.clone());

        let level = plan_risk.max(self.assessor.assess_artifact(&artifact.content));
        self.assessor
            .check_gate(level, self.settings.max_risk)
            .map_err(|e| Failure::new(PipelineState::Generating, e))?;

        Ok(artifact)
    }

    /// Hand a freshly generated artifact to the executor's syntax check. A
    /// rejection counts as a validation failure and uses up the one
    /// regeneration. A check that cannot run does not block the pipeline.
    async fn syntax_check(
        &self,
        artifact: Artifact,
        request: &Request,
    ) -> Result<Artifact, AgentError> {
        match self
            .executor
            .syntax_check(&artifact, request.inventory())
            .await
        {
            Ok(None) => Ok(artifact),
            Ok(Some(reason)) => Err(AgentError::Validation(Box::new(RejectedArtifact {
                artifact,
                reason: ArtifactValidationError::Malformed(reason),
            }))),
            Err(e) => {
                warn!(
                    "Syntax check of artifact {} v{} could not run: {}",
                    artifact.id, artifact.version, e
                );
                Ok(artifact)
            }
        }
    }

    async fn execute(
        &self,
        run: &mut Run<'_>,
        artifact: &Artifact,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, Failure> {
        if !artifact.verify_digest() {
            return Err(Failure::new(
                PipelineState::Executing,
                EngineError::ArtifactValidation(format!(
                    "digest mismatch for artifact {} v{}",
                    artifact.id, artifact.version
                )),
            ));
        }

        if !run.executed.insert((artifact.id.clone(), artifact.version)) {
            return Err(Failure::new(
                PipelineState::Executing,
                EngineError::ArtifactAlreadyExecuted(format!(
                    "{} v{}",
                    artifact.id, artifact.version
                )),
            ));
        }

        run.report.executor_invocations += 1;
        info!(
            "Executing artifact {} v{} against {}",
            artifact.id,
            artifact.version,
            run.request.inventory()
        );

        self.executor
            .execute(
                artifact,
                run.request.inventory(),
                self.settings.executor_timeout,
                cancel,
            )
            .await
            .map_err(|e| Failure::new(PipelineState::Executing, e))
    }

    /// Close a failed run: report, verdict and a best-effort record
    async fn fail(&self, run: &mut Run<'_>, failure: Failure) {
        let Failure { stage, error } = failure;
        error!("Pipeline failed during {}: {}", stage, error);

        let verdict = Reviewer::review_failure(stage.as_str(), &error);
        run.report.failed_stage = Some(stage);
        run.report.error = Some(error.to_string());
        run.report.hint = Some(error.user_hint().to_string());
        run.report.verdict = Some(verdict.clone());
        run.report.enter(PipelineState::Failed);

        let Some(embedding) = run.embedding.clone() else {
            warn!(
                "Request {} could not be embedded; failure not recorded",
                run.request.id()
            );
            run.report.persistence_error =
                Some("request could not be embedded; no record stored".to_string());
            return;
        };

        let mut record = MemoryRecord::new(run.request, embedding);
        record.artifact = run.report.artifact.clone();
        record.execution_result = run.report.execution.clone();
        record.verdict = Some(verdict);
        record.failed_stage = Some(stage.to_string());

        match self.memory.store(&record).await {
            Ok(id) => run.report.record_id = Some(id),
            Err(e) => {
                error!("Failed to record failed run {}: {}", record.id, e);
                run.report.persistence_error = Some(e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::types::{HostStatus, InventoryRef, PlanStep};
    use std::collections::BTreeMap;

    fn report() -> PipelineReport {
        let request = Request::new("check disk on web1", InventoryRef::DefaultLocal, None);
        PipelineReport::new(&request, "deepseek-coder")
    }

    #[test]
    fn test_state_names() {
        assert_eq!(PipelineState::Received.to_string(), "RECEIVED");
        assert_eq!(PipelineState::Failed.to_string(), "FAILED");
        assert!(PipelineState::Persisted.is_terminal());
        assert!(!PipelineState::Executing.is_terminal());
        assert_eq!(
            serde_json::to_value(PipelineState::Generating).unwrap(),
            serde_json::json!("GENERATING")
        );
    }

    #[test]
    fn test_exit_codes() {
        let mut passed = report();
        passed.enter(PipelineState::Persisted);
        passed.verdict = Some(Verdict {
            passed: true,
            summary: "ok".into(),
            confidence: 1.0,
        });
        assert_eq!(passed.exit_code(), 0);

        let mut failed_verdict = passed.clone();
        failed_verdict.verdict = Some(Verdict {
            passed: false,
            summary: "web1 failed".into(),
            confidence: 1.0,
        });
        assert_eq!(failed_verdict.exit_code(), 1);

        let mut errored = report();
        errored.enter(PipelineState::Failed);
        assert_eq!(errored.exit_code(), 1);

        // A verdict recorded before the run failed does not make it pass
        let mut late_failure = passed.clone();
        late_failure.enter(PipelineState::Failed);
        assert_eq!(late_failure.exit_code(), 1);
    }

    #[test]
    fn test_render_success() {
        let mut report = report();
        report.plan = Some(Plan::new(vec![PlanStep {
            description: "check disk usage".into(),
            target_selector: "web1".into(),
            risk_level: RiskLevel::Low,
        }]));
        report.execution = Some(ExecutionResult {
            artifact_id: "a1".into(),
            artifact_version: 1,
            hosts: BTreeMap::from([("web1".to_string(), HostStatus::Success)]),
            stdout: "PLAY RECAP".into(),
            stderr: String::new(),
            exit_code: Some(0),
            duration_ms: 1200,
            timed_out: false,
        });
        report.verdict = Some(Verdict {
            passed: true,
            summary: "1 host(s): 1 succeeded.".into(),
            confidence: 1.0,
        });
        report.record_id = Some("r1".into());
        report.enter(PipelineState::Persisted);

        let text = report.render(false);
        assert!(text.contains("1. [low] web1: check disk usage"));
        assert!(text.contains("Verdict: PASSED"));
        assert!(text.contains("Recorded as r1"));
        assert!(!text.contains("stdout:"));

        assert!(report.render(true).contains("stdout:\nPLAY RECAP"));
    }

    #[test]
    fn test_render_failure() {
        let mut report = report();
        report.failed_stage = Some(PipelineState::Generating);
        report.error = Some("Artifact validation failed: mismatch".into());
        report.hint = Some("Try rephrasing".into());
        report.enter(PipelineState::Failed);

        let text = report.render(false);
        assert!(text.contains("FAILED during GENERATING: Artifact validation failed"));
        assert!(text.contains("Hint: Try rephrasing"));
        assert!(text.contains("RECEIVED -> FAILED"));
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.pipeline.max_retries = 4;
        config.security.max_risk_level = "medium".into();

        let settings = PipelineSettings::from_config(&config);
        assert_eq!(settings.retry.max_retries, 4);
        assert_eq!(settings.max_risk, RiskLevel::Medium);
        assert_eq!(settings.default_model, config.llm.model);
    }
}
