//! HTTP client for the serving layer
//!
//! Talks to an OpenAI-compatible local inference endpoint. The checkpoint
//! id doubles as the `model` field of a completion request, which is how
//! llama.cpp-style servers address loaded checkpoints.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Generation, ModelHandle, ServingControl};
use crate::config::ServingConfig;

/// Connection settings for the serving layer
#[derive(Debug, Clone)]
pub struct ServingEndpoint {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl ServingEndpoint {
    pub fn from_config(config: &ServingConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            api_key: std::env::var(&config.api_key_env).ok(),
            timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    prompt: String,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    text: String,
}

#[derive(Debug, Deserialize, Default)]
struct Usage {
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Serialize)]
struct CheckpointOp<'a> {
    checkpoint: &'a str,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    healthy: bool,
}

/// Serving-layer client over HTTP
#[derive(Clone)]
pub struct HttpModelClient {
    client: Client,
    endpoint: ServingEndpoint,
}

impl HttpModelClient {
    pub fn new(endpoint: ServingEndpoint) -> Result<Self> {
        let client = Client::builder()
            .timeout(endpoint.timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, endpoint })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.endpoint.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {}", key)),
            None => builder,
        }
    }

    async fn post_admin(&self, op: &str, checkpoint_id: &str) -> Result<()> {
        let url = format!("{}/admin/{}", self.endpoint.base_url, op);
        let response = self
            .authorized(self.client.post(&url))
            .json(&CheckpointOp {
                checkpoint: checkpoint_id,
            })
            .send()
            .await
            .with_context(|| format!("Failed to reach serving layer at {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Serving admin op '{}' failed ({}): {}", op, status, body);
        }
        Ok(())
    }

    async fn complete(&self, checkpoint_id: &str, prompt: &str) -> Result<Generation> {
        let request = CompletionRequest {
            model: checkpoint_id.to_string(),
            prompt: prompt.to_string(),
            max_tokens: 512,
            temperature: 0.7,
        };

        let started = Instant::now();
        let response = self
            .authorized(
                self.client
                    .post(format!("{}/completions", self.endpoint.base_url)),
            )
            .json(&request)
            .send()
            .await
            .context("Failed to send completion request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Completion request failed ({}): {}", status, body);
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .context("Failed to parse completion response")?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.text)
            .unwrap_or_default();

        Ok(Generation {
            text,
            latency_ms: started.elapsed().as_millis() as u64,
            tokens: parsed.usage.unwrap_or_default().completion_tokens,
        })
    }
}

/// Handle bound to one checkpoint on an [`HttpModelClient`]
pub struct HttpModelHandle {
    client: HttpModelClient,
    checkpoint_id: String,
}

#[async_trait]
impl ModelHandle for HttpModelHandle {
    fn checkpoint_id(&self) -> &str {
        &self.checkpoint_id
    }

    async fn generate(&self, prompt: &str) -> Result<Generation> {
        self.client.complete(&self.checkpoint_id, prompt).await
    }
}

#[async_trait]
impl ServingControl for HttpModelClient {
    async fn stage(&self, checkpoint_id: &str) -> Result<()> {
        self.post_admin("stage", checkpoint_id).await
    }

    async fn activate(&self, checkpoint_id: &str) -> Result<()> {
        self.post_admin("activate", checkpoint_id).await
    }

    async fn health(&self, checkpoint_id: &str) -> Result<bool> {
        let url = format!(
            "{}/health?model={}",
            self.endpoint.base_url, checkpoint_id
        );
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .context("Failed to reach serving health endpoint")?;

        if !response.status().is_success() {
            return Ok(false);
        }
        let parsed: HealthResponse = response
            .json()
            .await
            .context("Failed to parse health response")?;
        Ok(parsed.healthy)
    }

    fn handle_for(&self, checkpoint_id: &str) -> Arc<dyn ModelHandle> {
        Arc::new(HttpModelHandle {
            client: self.clone(),
            checkpoint_id: checkpoint_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_config() {
        let config = ServingConfig::default();
        let endpoint = ServingEndpoint::from_config(&config);
        assert_eq!(endpoint.base_url, "http://127.0.0.1:8080/v1");
        assert_eq!(endpoint.timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_completion_request_shape() {
        let request = CompletionRequest {
            model: "ckpt-42".to_string(),
            prompt: "hello".to_string(),
            max_tokens: 512,
            temperature: 0.7,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "ckpt-42");
        assert_eq!(json["max_tokens"], 512);
    }
}
