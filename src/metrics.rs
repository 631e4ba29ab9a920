//! Pipeline counters
//!
//! Records ingestion, assessment, training, validation, and deployment
//! activity for an external observability collaborator to scrape.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Point-in-time view of all pipeline counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub records_ingested: u64,
    pub records_dropped: u64,
    pub assessments_completed: u64,
    pub assessment_fallbacks: u64,
    pub candidates_selected: u64,
    pub training_runs_started: u64,
    pub training_runs_completed: u64,
    pub training_runs_aborted: u64,
    /// Per-suite pass counts, keyed by suite name
    pub suite_passes: HashMap<String, u64>,
    /// Per-suite failure counts, keyed by suite name
    pub suite_failures: HashMap<String, u64>,
    pub stage_transitions: u64,
    pub deployments_promoted: u64,
    pub deployments_rolled_back: u64,
    pub escalations: u64,
    pub session_start: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            records_ingested: 0,
            records_dropped: 0,
            assessments_completed: 0,
            assessment_fallbacks: 0,
            candidates_selected: 0,
            training_runs_started: 0,
            training_runs_completed: 0,
            training_runs_aborted: 0,
            suite_passes: HashMap::new(),
            suite_failures: HashMap::new(),
            stage_transitions: 0,
            deployments_promoted: 0,
            deployments_rolled_back: 0,
            escalations: 0,
            session_start: Utc::now(),
            last_updated: Utc::now(),
        }
    }
}

/// Counter store shared across pipeline components
pub struct PipelineMetrics {
    inner: Arc<RwLock<MetricsSnapshot>>,
    path: PathBuf,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        let path = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lifelong")
            .join("metrics.json");
        Self::with_path(path)
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MetricsSnapshot::default())),
            path,
        }
    }

    async fn bump(&self, apply: impl FnOnce(&mut MetricsSnapshot)) {
        let mut snapshot = self.inner.write().await;
        apply(&mut snapshot);
        snapshot.last_updated = Utc::now();
    }

    pub async fn record_ingested(&self) {
        self.bump(|m| m.records_ingested += 1).await;
    }

    pub async fn record_dropped(&self) {
        self.bump(|m| m.records_dropped += 1).await;
    }

    pub async fn assessment_completed(&self) {
        self.bump(|m| m.assessments_completed += 1).await;
    }

    pub async fn assessment_fallback(&self) {
        self.bump(|m| m.assessment_fallbacks += 1).await;
    }

    pub async fn candidates_selected(&self, count: u64) {
        self.bump(|m| m.candidates_selected += count).await;
    }

    pub async fn training_started(&self) {
        self.bump(|m| m.training_runs_started += 1).await;
    }

    pub async fn training_completed(&self) {
        self.bump(|m| m.training_runs_completed += 1).await;
    }

    pub async fn training_aborted(&self) {
        self.bump(|m| m.training_runs_aborted += 1).await;
    }

    pub async fn suite_result(&self, suite: &str, passed: bool) {
        let suite = suite.to_string();
        self.bump(move |m| {
            let counter = if passed {
                &mut m.suite_passes
            } else {
                &mut m.suite_failures
            };
            *counter.entry(suite).or_insert(0) += 1;
        })
        .await;
    }

    pub async fn stage_transition(&self) {
        self.bump(|m| m.stage_transitions += 1).await;
    }

    pub async fn deployment_promoted(&self) {
        self.bump(|m| m.deployments_promoted += 1).await;
    }

    pub async fn deployment_rolled_back(&self) {
        self.bump(|m| m.deployments_rolled_back += 1).await;
    }

    pub async fn escalation(&self) {
        self.bump(|m| m.escalations += 1).await;
    }

    /// Get current counters
    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.inner.read().await.clone()
    }

    /// Save counters to disk
    pub async fn save(&self) -> Result<()> {
        let snapshot = self.inner.read().await;
        let json = serde_json::to_string_pretty(&*snapshot)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, json).await?;
        info!("Saved metrics to {:?}", self.path);
        Ok(())
    }

    /// Load counters from disk
    pub async fn load(&self) -> Result<()> {
        if self.path.exists() {
            let json = tokio::fs::read_to_string(&self.path).await?;
            let loaded: MetricsSnapshot = serde_json::from_str(&json)?;
            let mut snapshot = self.inner.write().await;
            *snapshot = loaded;
            debug!("Loaded metrics from {:?}", self.path);
        }
        Ok(())
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_accumulate() {
        let metrics = PipelineMetrics::with_path(PathBuf::from("/tmp/unused-metrics.json"));
        metrics.record_ingested().await;
        metrics.record_ingested().await;
        metrics.training_started().await;
        metrics.suite_result("safety", false).await;
        metrics.suite_result("safety", true).await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.records_ingested, 2);
        assert_eq!(snapshot.training_runs_started, 1);
        assert_eq!(snapshot.suite_passes.get("safety"), Some(&1));
        assert_eq!(snapshot.suite_failures.get("safety"), Some(&1));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let metrics = PipelineMetrics::with_path(path.clone());
        metrics.deployment_promoted().await;
        metrics.save().await.unwrap();

        let restored = PipelineMetrics::with_path(path);
        restored.load().await.unwrap();
        assert_eq!(restored.snapshot().await.deployments_promoted, 1);
    }
}
