//! Review Agent
//!
//! Judges an execution result. The verdict is deterministic: a run passes
//! only if no host failed or timed out. Unreachable hosts are flagged and
//! lower confidence but do not fail the run. The gateway may optionally add
//! a narrative; its failure never changes the verdict.

use crate::conductor::context::truncate_chars;
use crate::llm::{Gateway, RoleHint};
use sdk::errors::{EngineError, InfrabotErrorExt};
use sdk::types::{ExecutionResult, HostStatus, Request, ScoredRecord, Verdict};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Similarity above which a past failure counts as the same task
const SIMILAR_FAILURE_SCORE: f64 = 0.8;

/// Confidence multiplier per unreachable host
const UNREACHABLE_PENALTY: f64 = 0.8;

/// Confidence multiplier when a very similar past run failed
const PRIOR_FAILURE_PENALTY: f64 = 0.9;

/// Confidence when the run touched no host at all
const NO_HOSTS_CONFIDENCE: f64 = 0.5;

#[derive(Default)]
pub struct Reviewer {
    narrator: Option<Arc<dyn Gateway>>,
}

impl Reviewer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the gateway for a short narrative under each verdict
    pub fn with_narrative(mut self, gateway: Arc<dyn Gateway>) -> Self {
        self.narrator = Some(gateway);
        self
    }

    /// Review `result`, consulting similar past executions
    pub async fn review(
        &self,
        request: &Request,
        result: &ExecutionResult,
        history: &[ScoredRecord],
        model: &str,
        cancel: &CancellationToken,
    ) -> Verdict {
        let mut verdict = self.assess(result, history);

        if let Some(gateway) = &self.narrator {
            let prompt = format!(
                "Task: {}\nVerdict: {}\n{}\nOutput (tail):\n{}\n\n\
                 In two sentences, explain the outcome to the operator.",
                request.raw_text(),
                if verdict.passed { "passed" } else { "failed" },
                verdict.summary,
                tail_chars(&result.stdout, 2000)
            );
            let narrative = tokio::select! {
                r = gateway.generate(&prompt, RoleHint::Review, model) => r,
                _ = cancel.cancelled() => return verdict,
            };
            match narrative {
                Ok(text) if !text.trim().is_empty() => {
                    verdict.summary.push('\n');
                    verdict.summary.push_str(text.trim());
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("Review narrative skipped: {}", e),
            }
        }

        verdict
    }

    /// Deterministic verdict over the host map
    pub fn assess(&self, result: &ExecutionResult, history: &[ScoredRecord]) -> Verdict {
        if result.hosts.is_empty() {
            return Verdict {
                passed: true,
                summary: format!(
                    "No hosts matched the target selector; nothing ran (exit code {}).",
                    exit_code_label(result.exit_code)
                ),
                confidence: NO_HOSTS_CONFIDENCE,
            };
        }

        let failed = result.hosts_with(HostStatus::Failure);
        let timed_out = result.hosts_with(HostStatus::Timeout);
        let unreachable = result.hosts_with(HostStatus::Unreachable);
        let succeeded = result.count(HostStatus::Success);

        let passed = failed.is_empty() && timed_out.is_empty();

        let mut parts = vec![format!(
            "{} host(s): {} succeeded",
            result.hosts.len(),
            succeeded
        )];
        if !failed.is_empty() {
            parts.push(format!("{} failed ({})", failed.len(), failed.join(", ")));
        }
        if !timed_out.is_empty() {
            parts.push(format!(
                "{} timed out ({})",
                timed_out.len(),
                timed_out.join(", ")
            ));
        }
        if !unreachable.is_empty() {
            parts.push(format!(
                "{} unreachable ({}), not counted as failures",
                unreachable.len(),
                unreachable.join(", ")
            ));
        }
        let mut summary = format!("{}.", parts.join(", "));

        if result.timed_out {
            summary.push_str(" The run was stopped at its deadline.");
        }

        let mut confidence = UNREACHABLE_PENALTY.powi(unreachable.len() as i32);

        let prior_failure = history.iter().find(|scored| {
            scored.score >= SIMILAR_FAILURE_SCORE && scored.record.passed() == Some(false)
        });
        if let Some(prior) = prior_failure {
            confidence *= PRIOR_FAILURE_PENALTY;
            summary.push_str(&format!(
                " A similar earlier run (similarity {:.2}) failed: {}",
                prior.score,
                prior
                    .record
                    .verdict
                    .as_ref()
                    .map(|v| truncate_chars(&v.summary, 120))
                    .unwrap_or_default()
            ));
        }

        Verdict {
            passed,
            summary,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Verdict recorded when the pipeline stopped before a review
    pub fn review_failure(stage: &str, error: &EngineError) -> Verdict {
        Verdict {
            passed: false,
            summary: format!(
                "Run failed during {}: {}. {}",
                stage,
                error,
                error.user_hint()
            ),
            confidence: 1.0,
        }
    }
}

fn exit_code_label(code: Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string())
}

fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((start, _)) => &text[start..],
        None => text,
    }
}
