//! Planning Agent
//!
//! Asks the gateway to break a request into ordered steps, each with a target
//! selector and a risk level. Missing or unknown fields are filled in
//! locally; a response with no usable steps is a planning error.

use crate::conductor::context::ContextAssembler;
use crate::conductor::AgentError;
use crate::llm::{extract_json_array, Gateway, RoleHint};
use crate::risk_assessor::RiskAssessor;
use sdk::types::{InventoryRef, Plan, PlanStep, Request, RiskLevel, ScoredRecord};
use serde::Deserialize;
use std::sync::Arc;

/// Appended to the prompt when a previous response could not be parsed
pub const WELL_FORMED_HINT: &str = "Your previous answer could not be parsed. \
     Reply with a JSON array only, starting with '[' and ending with ']'. \
     Every element must be an object with a non-empty \"description\".";

const PLANNER_INSTRUCTIONS: &str = "Break the operator's request into discrete infrastructure steps.\n\
     Output ONLY a JSON array of steps. Each step object must have:\n\
     - \"description\": what the step does\n\
     - \"target\": the Ansible host pattern it runs against (e.g. \"web1\" or \"webservers\")\n\
     - \"risk\": one of \"low\" (read-only), \"medium\" (reversible change) or \"high\" (destructive)\n\n\
     Example output:\n\
     [{\"description\":\"Check disk usage on /\",\"target\":\"web1\",\"risk\":\"low\"}]\n\n\
     Prefer a single step when one playbook can do the job.\n\
     Output ONLY the JSON array, no markdown, no explanation.";

/// Intermediate deserialization type for gateway JSON output
#[derive(Debug, Deserialize)]
struct RawPlanStep {
    #[serde(default)]
    description: String,
    #[serde(default, alias = "target_selector", alias = "hosts")]
    target: Option<String>,
    #[serde(default, alias = "risk_level")]
    risk: Option<String>,
}

pub struct Planner {
    gateway: Arc<dyn Gateway>,
    assessor: RiskAssessor,
    context: ContextAssembler,
}

impl Planner {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            gateway,
            assessor: RiskAssessor::new(),
            context: ContextAssembler::default(),
        }
    }

    /// Produce a plan for `request`
    ///
    /// `correction` is appended to the prompt on a regeneration attempt.
    pub async fn plan(
        &self,
        request: &Request,
        context: &[ScoredRecord],
        model: &str,
        correction: Option<&str>,
    ) -> Result<Plan, AgentError> {
        let prompt = self.build_prompt(request, context, correction);
        let response = self
            .gateway
            .generate(&prompt, RoleHint::Plan, model)
            .await?;

        let plan = self.parse_plan(&response, request.inventory())?;
        tracing::debug!(
            "Planned {} step(s) for request {} (max risk {})",
            plan.len(),
            request.id(),
            plan.max_risk()
        );
        Ok(plan)
    }

    fn build_prompt(
        &self,
        request: &Request,
        context: &[ScoredRecord],
        correction: Option<&str>,
    ) -> String {
        let mut prompt = String::from(PLANNER_INSTRUCTIONS);
        prompt.push_str(&format!(
            "\n\nInventory: {}\nDefault target when the request names no host: {}",
            request.inventory(),
            request.inventory().default_selector()
        ));
        prompt.push_str(&self.context.assemble(context));
        prompt.push_str(&format!("\n\nRequest: {}", request.raw_text()));
        if let Some(correction) = correction {
            prompt.push_str("\n\n");
            prompt.push_str(correction);
        }
        prompt
    }

    /// Parse gateway output into a plan, handling prose around the JSON
    fn parse_plan(&self, content: &str, inventory: &InventoryRef) -> Result<Plan, AgentError> {
        let json = extract_json_array(content).ok_or_else(|| {
            AgentError::Planning("planner response contained no JSON array".to_string())
        })?;

        let raw_steps: Vec<RawPlanStep> = serde_json::from_str(json)
            .map_err(|e| AgentError::Planning(format!("invalid plan JSON: {}", e)))?;

        if raw_steps.is_empty() {
            return Err(AgentError::Planning("plan has no steps".to_string()));
        }

        let steps = raw_steps
            .into_iter()
            .enumerate()
            .map(|(i, raw)| {
                let description = raw.description.trim().to_string();
                if description.is_empty() {
                    return Err(AgentError::Planning(format!(
                        "step {} has no description",
                        i + 1
                    )));
                }

                let target_selector = raw
                    .target
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| inventory.default_selector().to_string());

                let classified = self.assessor.classify(&description);
                let risk_level = match raw.risk.as_deref().map(str::parse::<RiskLevel>) {
                    // The model may understate risk; never below what the words say
                    Some(Ok(level)) => level.max(classified),
                    _ => classified,
                };

                Ok(PlanStep {
                    description,
                    target_selector,
                    risk_level,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Plan::new(steps))
    }
}
