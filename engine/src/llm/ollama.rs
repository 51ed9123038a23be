//! Ollama Gateway
//!
//! This module implements [`Gateway`] and [`Embedder`] for Ollama, a local
//! model server typically listening at http://localhost:11434.
//!
//! Key features:
//! - Non-streaming `/api/generate` with a persona system prompt per role
//! - `/api/embeddings` for memory vectors
//! - `/api/tags` for health and model availability
//! - A hard deadline on every call, mapped to `GatewayError::Timeout`

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use super::{Embedder, Gateway, GatewayError, GatewayHealth, Result, RoleHint};

const PLANNER_PERSONA: &str = "You are an infrastructure planner. You are an experienced DevOps \
engineer who breaks operations tasks into small, ordered, actionable steps that can each be \
carried out with an Ansible playbook.";

const GENERATOR_PERSONA: &str = "You are an Ansible playbook generator. You write clean, \
idempotent Ansible playbooks that follow Linux administration and security practice. You \
answer with YAML only.";

const REVIEWER_PERSONA: &str = "You are a security-conscious infrastructure reviewer. You read \
automation results and explain plainly what happened on each host and what an operator should \
look at next.";

/// Ollama gateway configuration
#[derive(Debug, Clone)]
pub struct OllamaGateway {
    /// Base URL for Ollama API (typically http://localhost:11434)
    base_url: String,

    /// Model used for embeddings
    embedding_model: String,

    /// Sampling temperature for generation
    temperature: f64,

    /// Deadline applied to every request
    timeout: Duration,

    /// HTTP client for API requests
    client: Client,
}

impl OllamaGateway {
    /// Create a new Ollama gateway
    ///
    /// # Arguments
    /// * `base_url` - Base URL for Ollama API (e.g., "http://localhost:11434")
    /// * `embedding_model` - Model used by `embed` (e.g., "nomic-embed-text")
    /// * `timeout` - Deadline for each call
    pub fn new(
        base_url: impl Into<String>,
        embedding_model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            embedding_model: embedding_model.into(),
            temperature: 0.1,
            timeout,
            client,
        }
    }

    /// Override the sampling temperature
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn persona(role: RoleHint) -> &'static str {
        match role {
            RoleHint::Plan => PLANNER_PERSONA,
            RoleHint::Codegen => GENERATOR_PERSONA,
            RoleHint::Review => REVIEWER_PERSONA,
        }
    }

    /// Run `fut` under the configured deadline
    async fn with_deadline<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.timeout.as_secs())),
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout(self.timeout.as_secs())
        } else if e.is_connect() {
            GatewayError::Unavailable(format!(
                "Cannot connect to Ollama at {}. Is Ollama running?",
                self.base_url
            ))
        } else {
            GatewayError::Unavailable(e.to_string())
        }
    }

    /// POST `body` to `path` and decode the JSON response
    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: for<'de> Deserialize<'de>,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(map_status(status, &error_text));
        }

        response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(format!("Failed to parse Ollama response: {}", e)))
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(map_status(status, &error_text));
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(format!("Failed to parse model list: {}", e)))?;

        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

/// 5xx is a server that may recover; anything else is a request it will keep rejecting
fn map_status(status: StatusCode, body: &str) -> GatewayError {
    if status.is_server_error() {
        GatewayError::Unavailable(format!("Ollama API error ({}): {}", status, body))
    } else {
        GatewayError::InvalidResponse(format!("Ollama API error ({}): {}", status, body))
    }
}

/// Match `wanted` against served models, ignoring the tag when `wanted` has none
fn model_served(models: &[String], wanted: &str) -> bool {
    models.iter().any(|name| {
        name == wanted || (!wanted.contains(':') && name.split(':').next() == Some(wanted))
    })
}

#[async_trait]
impl Embedder for OllamaGateway {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.embedding_model,
            prompt: text,
        };

        let response: EmbeddingResponse = self
            .with_deadline(self.post_json("/api/embeddings", &request))
            .await?;

        if response.embedding.is_empty() {
            return Err(GatewayError::InvalidResponse(format!(
                "Model '{}' returned an empty embedding",
                self.embedding_model
            )));
        }

        Ok(response.embedding.into_iter().map(|v| v as f32).collect())
    }
}

#[async_trait]
impl Gateway for OllamaGateway {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, prompt: &str, role: RoleHint, model: &str) -> Result<String> {
        tracing::debug!(
            "Ollama request: model={}, role={}, prompt_chars={}",
            model,
            role,
            prompt.len()
        );

        let request = GenerateRequest {
            model,
            prompt,
            system: Self::persona(role),
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };

        let start = std::time::Instant::now();
        let response: GenerateResponse = self
            .with_deadline(self.post_json("/api/generate", &request))
            .await?;

        tracing::info!(
            "Ollama {} response received in {:.1}s",
            role,
            start.elapsed().as_secs_f64()
        );

        if response.response.trim().is_empty() {
            return Err(GatewayError::InvalidResponse(
                "Ollama returned an empty response".to_string(),
            ));
        }

        Ok(response.response)
    }

    async fn check_health(&self, model: &str) -> Result<GatewayHealth> {
        match self.with_deadline(self.list_models()).await {
            Ok(models) => Ok(GatewayHealth {
                service_running: true,
                model_available: model_served(&models, model),
                embedding_model_available: model_served(&models, &self.embedding_model),
                available_models: models,
            }),
            Err(GatewayError::Unavailable(msg)) => {
                tracing::warn!("Ollama health check failed: {}", msg);
                Ok(GatewayHealth::default())
            }
            Err(e) => Err(e),
        }
    }
}

/// Ollama generate request format
#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f64,
}

/// Ollama generate response format
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_properties() {
        let gateway = OllamaGateway::new(
            "http://localhost:11434/",
            "nomic-embed-text",
            Duration::from_secs(120),
        );

        assert_eq!(gateway.name(), "ollama");
        assert_eq!(gateway.base_url(), "http://localhost:11434");
    }

    #[test]
    fn test_persona_per_role() {
        assert!(OllamaGateway::persona(RoleHint::Plan).contains("planner"));
        assert!(OllamaGateway::persona(RoleHint::Codegen).contains("YAML only"));
        assert!(OllamaGateway::persona(RoleHint::Review).contains("reviewer"));
    }

    #[test]
    fn test_model_served_matching() {
        let models = vec!["deepseek-coder:latest".to_string(), "llama3:8b".to_string()];

        assert!(model_served(&models, "deepseek-coder"));
        assert!(model_served(&models, "deepseek-coder:latest"));
        assert!(model_served(&models, "llama3"));
        assert!(!model_served(&models, "llama3:70b"));
        assert!(!model_served(&models, "mistral"));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status(StatusCode::SERVICE_UNAVAILABLE, "loading"),
            GatewayError::Unavailable(_)
        ));
        assert!(matches!(
            map_status(StatusCode::NOT_FOUND, "model not found"),
            GatewayError::InvalidResponse(_)
        ));
    }
}
