//! Language-Model Gateway
//!
//! This module defines the contract the agents and the memory store consume:
//! `generate` for text and `embed` for vectors. The only backend shipped is
//! Ollama (see [`ollama`]); tests substitute scripted implementations.
//!
//! Calls are single and blocking from the caller's point of view. Retry is
//! not done here: the orchestrator owns that policy.

use async_trait::async_trait;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod ollama;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors that can occur during gateway operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    #[error("Gateway timed out after {0}s")]
    Timeout(u64),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Gateway call cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Transport failures that may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

impl From<GatewayError> for EngineError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable(msg) => EngineError::GatewayUnavailable(msg),
            GatewayError::Timeout(secs) => EngineError::GatewayTimeout(secs),
            GatewayError::InvalidResponse(msg) => EngineError::GatewayResponse(msg),
            GatewayError::Cancelled => EngineError::Cancelled,
        }
    }
}

/// Which agent is calling; selects the backend persona
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleHint {
    Plan,
    Codegen,
    Review,
}

impl fmt::Display for RoleHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleHint::Plan => write!(f, "plan"),
            RoleHint::Codegen => write!(f, "codegen"),
            RoleHint::Review => write!(f, "review"),
        }
    }
}

/// Backend health as reported by `check_health`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayHealth {
    pub service_running: bool,
    pub model_available: bool,
    pub embedding_model_available: bool,
    pub available_models: Vec<String>,
}

impl GatewayHealth {
    pub fn is_ready(&self) -> bool {
        self.service_running && self.model_available && self.embedding_model_available
    }
}

/// Computes fixed-length embeddings for text
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `text`. Every call against the same model returns the same length.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Text generation backend
#[async_trait]
pub trait Gateway: Embedder {
    /// Returns the name of the backend (e.g. "ollama")
    fn name(&self) -> &str;

    /// Generate a completion for `prompt` using `model`
    async fn generate(&self, prompt: &str, role: RoleHint, model: &str) -> Result<String>;

    /// Ask the backend whether `model` and the embedding model are served
    async fn check_health(&self, model: &str) -> Result<GatewayHealth>;
}

/// Extract the body of the first markdown code fence in the text.
///
/// Works even when there is trailing prose after the closing ```.
/// Returns `None` if no fenced block is found.
pub fn extract_fenced_block(content: &str) -> Option<&str> {
    let fence_start = content.find("```")?;
    let after_opening = &content[fence_start + 3..];

    // Skip the language tag line (e.g. "yaml\n")
    let body_start_rel = after_opening.find('\n')? + 1;
    let body_start = fence_start + 3 + body_start_rel;

    let closing = content[body_start..].find("```")?;
    let body_end = body_start + closing;

    if body_start >= body_end {
        return None;
    }

    Some(&content[body_start..body_end])
}

/// Extract the first balanced JSON array from `content`.
///
/// Counts `[` / `]` depth, respecting string literals, to find the
/// matching close bracket.
pub fn extract_json_array(content: &str) -> Option<&str> {
    let start = content.find('[')?;
    let s = &content[start..];
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '[' if !in_string => depth += 1,
            ']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(GatewayError::Unavailable("down".into()).is_transient());
        assert!(GatewayError::Timeout(120).is_transient());
        assert!(!GatewayError::InvalidResponse("bad".into()).is_transient());
        assert!(!GatewayError::Cancelled.is_transient());
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            EngineError::from(GatewayError::Timeout(3)),
            EngineError::GatewayTimeout(3)
        ));
        assert!(matches!(
            EngineError::from(GatewayError::Cancelled),
            EngineError::Cancelled
        ));
    }

    #[test]
    fn test_extract_fenced_block_with_trailing_prose() {
        let content = "Here you go:\n```yaml\n- hosts: web1\n```\nLet me know!";
        assert_eq!(extract_fenced_block(content), Some("- hosts: web1\n"));
        assert_eq!(extract_fenced_block("no fence here"), None);
    }

    #[test]
    fn test_extract_json_array_respects_strings() {
        let content = r#"Plan: [{"description": "list [tmp]", "target": "web1"}] done"#;
        assert_eq!(
            extract_json_array(content),
            Some(r#"[{"description": "list [tmp]", "target": "web1"}]"#)
        );
        assert_eq!(extract_json_array("[unterminated"), None);
    }

    #[test]
    fn test_role_hint_display() {
        assert_eq!(RoleHint::Plan.to_string(), "plan");
        assert_eq!(RoleHint::Codegen.to_string(), "codegen");
        assert_eq!(RoleHint::Review.to_string(), "review");
    }
}
