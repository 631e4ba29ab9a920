//! HTTP trainer backend
//!
//! Drives a trainer sidecar over a small JSON API. The sidecar owns the
//! numbers; this client only relays batches, freeze masks, and export
//! requests.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::{ParamGroup, StepOutcome, TrainerBackend};
use crate::config::ServingConfig;
use crate::dataset::TrainingExample;

#[derive(Debug, Serialize)]
struct ImportanceRequest<'a> {
    base_checkpoint: &'a str,
    batch: &'a [TrainingExample],
}

#[derive(Debug, Deserialize)]
struct ImportanceResponse {
    /// Squared gradient magnitude per parameter group
    importance: HashMap<String, f64>,
}

#[derive(Debug, Serialize)]
struct StepRequest<'a> {
    base_checkpoint: &'a str,
    batch: &'a [TrainingExample],
    frozen: Vec<&'a str>,
    learning_rate: f64,
}

#[derive(Debug, Serialize)]
struct CheckpointRequest<'a> {
    base_checkpoint: &'a str,
}

#[derive(Debug, Deserialize)]
struct CheckpointResponse {
    checkpoint_id: String,
}

#[derive(Debug, Deserialize)]
struct GroupsResponse {
    groups: Vec<ParamGroup>,
}

pub struct HttpTrainer {
    client: Client,
    base_url: String,
}

impl HttpTrainer {
    pub fn from_config(config: &ServingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build trainer HTTP client")?;
        Ok(Self {
            client,
            base_url: config.trainer_url.clone(),
        })
    }

    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach trainer at {url}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("Trainer call '{}' failed ({}): {}", path, status, text);
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse trainer response from '{path}'"))
    }
}

#[async_trait]
impl TrainerBackend for HttpTrainer {
    async fn parameter_groups(&self) -> Result<Vec<ParamGroup>> {
        let url = format!("{}/groups", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach trainer at {url}"))?;
        if !response.status().is_success() {
            bail!("Trainer group listing failed ({})", response.status());
        }
        let parsed: GroupsResponse = response
            .json()
            .await
            .context("Failed to parse trainer group listing")?;
        Ok(parsed.groups)
    }

    async fn importance_probe(
        &self,
        base_checkpoint: &str,
        batch: &[TrainingExample],
    ) -> Result<HashMap<String, f64>> {
        let response: ImportanceResponse = self
            .post_json(
                "importance",
                &ImportanceRequest {
                    base_checkpoint,
                    batch,
                },
            )
            .await?;
        Ok(response.importance)
    }

    async fn train_step(
        &self,
        base_checkpoint: &str,
        batch: &[TrainingExample],
        frozen: &HashSet<String>,
        learning_rate: f64,
    ) -> Result<StepOutcome> {
        self.post_json(
            "step",
            &StepRequest {
                base_checkpoint,
                batch,
                frozen: frozen.iter().map(String::as_str).collect(),
                learning_rate,
            },
        )
        .await
    }

    async fn export_checkpoint(&self, base_checkpoint: &str) -> Result<String> {
        let response: CheckpointResponse = self
            .post_json("checkpoint", &CheckpointRequest { base_checkpoint })
            .await?;
        Ok(response.checkpoint_id)
    }

    async fn discard(&self, base_checkpoint: &str) -> Result<()> {
        let _: serde_json::Value = self
            .post_json("discard", &CheckpointRequest { base_checkpoint })
            .await?;
        Ok(())
    }
}
