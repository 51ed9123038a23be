//! Generation Agent
//!
//! Turns one plan step into an Ansible playbook and validates it locally
//! before anything runs:
//!
//! - the document parses as YAML and is a non-empty list of plays
//! - every play declares `hosts`
//! - the hosts the playbook targets are exactly the step's selector
//!
//! Several validated artifacts (one per step) are composed into a single
//! playbook so that execution happens once per request.

use crate::conductor::context::{truncate_chars, ContextAssembler};
use crate::conductor::{AgentError, ArtifactValidationError, RejectedArtifact};
use crate::llm::{extract_fenced_block, Gateway, RoleHint};
use sdk::types::{Artifact, PlanStep, Request, ScoredRecord};
use serde_yaml::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

const GENERATOR_INSTRUCTIONS: &str = "Write an Ansible playbook for the step below.\n\
     Rules:\n\
     - Output a single YAML document: a list of plays.\n\
     - Every play must set `hosts:` to exactly the target given.\n\
     - Prefer read-only modules unless the step requires a change.\n\
     - Do not explain. Put the playbook in one ```yaml fenced block.";

pub struct Generator {
    gateway: Arc<dyn Gateway>,
    context: ContextAssembler,
}

impl Generator {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            gateway,
            context: ContextAssembler::default(),
        }
    }

    /// Generate a validated artifact for `step`
    ///
    /// When `previous` carries a rejected artifact the result continues its
    /// lineage (same id, next version) and the prompt explains the rejection.
    pub async fn generate(
        &self,
        step: &PlanStep,
        request: &Request,
        context: &[ScoredRecord],
        model: &str,
        previous: Option<&RejectedArtifact>,
    ) -> Result<Artifact, AgentError> {
        let prompt = self.build_prompt(step, request, context, previous);
        let response = self
            .gateway
            .generate(&prompt, RoleHint::Codegen, model)
            .await?;

        let content = extract_playbook(&response);
        let artifact = match previous {
            Some(rejected) => rejected.artifact.next_version(content),
            None => Artifact::new(content, step.target_selector.clone()),
        };

        match validate_playbook(&artifact.content, &step.target_selector) {
            Ok(()) => Ok(artifact),
            Err(reason) => {
                tracing::warn!(
                    "Rejected artifact {} v{}: {}",
                    artifact.id,
                    artifact.version,
                    reason
                );
                Err(AgentError::Validation(Box::new(RejectedArtifact {
                    artifact,
                    reason,
                })))
            }
        }
    }

    fn build_prompt(
        &self,
        step: &PlanStep,
        request: &Request,
        context: &[ScoredRecord],
        previous: Option<&RejectedArtifact>,
    ) -> String {
        let mut prompt = String::from(GENERATOR_INSTRUCTIONS);
        prompt.push_str(&self.context.assemble(context));
        prompt.push_str(&format!(
            "\n\nOriginal request: {}\nStep: {}\nTarget hosts: {}\nRisk: {}",
            request.raw_text(),
            step.description,
            step.target_selector,
            step.risk_level
        ));

        if let Some(rejected) = previous {
            prompt.push_str(&format!(
                "\n\nYour previous playbook was rejected: {}\nPrevious playbook:\n{}\n\
                 Fix the problem and output the corrected playbook.",
                rejected.reason,
                truncate_chars(&rejected.artifact.content, 1500)
            ));
        }
        prompt
    }
}

/// Pull the playbook out of a model response
///
/// A fenced block wins. Otherwise everything from the first line that looks
/// like the start of a playbook is kept.
pub fn extract_playbook(response: &str) -> String {
    if let Some(block) = extract_fenced_block(response) {
        return block.trim().to_string();
    }

    let mut offset = 0;
    for line in response.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("---")
            || trimmed.starts_with("- hosts:")
            || trimmed.starts_with("- name:")
        {
            return response[offset..].trim().to_string();
        }
        offset += line.len();
    }

    response.trim().to_string()
}

/// Hosts named by an Ansible pattern such as `web1,web2` or `web:db`
pub fn selector_hosts(selector: &str) -> BTreeSet<String> {
    selector
        .split([',', ':'])
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `content` into its list of plays
fn parse_plays(content: &str) -> Result<Vec<Value>, ArtifactValidationError> {
    let document: Value = serde_yaml::from_str(content)
        .map_err(|e| ArtifactValidationError::Malformed(e.to_string()))?;

    match document {
        Value::Sequence(plays) if !plays.is_empty() => Ok(plays),
        Value::Sequence(_) => Err(ArtifactValidationError::Malformed(
            "playbook contains no plays".to_string(),
        )),
        _ => Err(ArtifactValidationError::Malformed(
            "playbook must be a list of plays".to_string(),
        )),
    }
}

/// Union of the `hosts` declared by each play
fn declared_hosts(plays: &[Value]) -> Result<BTreeSet<String>, ArtifactValidationError> {
    let mut hosts = BTreeSet::new();

    for (i, play) in plays.iter().enumerate() {
        let Value::Mapping(map) = play else {
            return Err(ArtifactValidationError::Malformed(format!(
                "play {} is not a mapping",
                i + 1
            )));
        };

        match map.get("hosts") {
            Some(Value::String(pattern)) => hosts.extend(selector_hosts(pattern)),
            Some(Value::Sequence(items)) => {
                for item in items {
                    match item {
                        Value::String(pattern) => hosts.extend(selector_hosts(pattern)),
                        _ => {
                            return Err(ArtifactValidationError::Malformed(format!(
                                "play {} has a non-string host",
                                i + 1
                            )))
                        }
                    }
                }
            }
            Some(_) => {
                return Err(ArtifactValidationError::Malformed(format!(
                    "play {} has an invalid hosts value",
                    i + 1
                )))
            }
            None => {
                return Err(ArtifactValidationError::Malformed(format!(
                    "play {} does not declare hosts",
                    i + 1
                )))
            }
        }
    }

    Ok(hosts)
}

/// Check that `content` is a playbook aimed at exactly `target_selector`
pub fn validate_playbook(content: &str, target_selector: &str) -> Result<(), ArtifactValidationError> {
    let plays = parse_plays(content)?;
    let found = declared_hosts(&plays)?;
    let expected = selector_hosts(target_selector);

    if found != expected {
        return Err(ArtifactValidationError::TargetMismatch {
            expected: expected.into_iter().collect(),
            found: found.into_iter().collect(),
        });
    }
    Ok(())
}

/// Merge validated per-step artifacts into one playbook
///
/// A single artifact is returned unchanged. Otherwise the plays are
/// concatenated in step order under a fresh artifact whose selector is the
/// union of the inputs.
pub fn compose_artifacts(artifacts: Vec<Artifact>) -> Result<Artifact, ArtifactValidationError> {
    if artifacts.len() <= 1 {
        return artifacts.into_iter().next().ok_or_else(|| {
            ArtifactValidationError::Malformed("no artifacts to compose".to_string())
        });
    }

    let mut plays = Vec::new();
    let mut selectors: Vec<String> = Vec::new();

    for artifact in &artifacts {
        plays.extend(parse_plays(&artifact.content)?);
        for host in selector_hosts(&artifact.target_selector) {
            if !selectors.contains(&host) {
                selectors.push(host);
            }
        }
    }

    let content = serde_yaml::to_string(&Value::Sequence(plays))
        .map_err(|e| ArtifactValidationError::Malformed(e.to_string()))?;

    Ok(Artifact::new(content, selectors.join(",")))
}
