//! Versioned model registry
//!
//! Append-only checkpoint chain plus a single pointer for the active
//! production id. All writes funnel through the deployment manager's
//! serialized operations; nothing else mutates the pointer.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{DeploymentRecord, DeploymentStage, HealthProbe};
use crate::types::ModelCheckpoint;
use chrono::Utc;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryInner {
    /// Linear chain, oldest first
    checkpoints: Vec<ModelCheckpoint>,
    deployments: std::collections::HashMap<String, DeploymentRecord>,
    production: Option<String>,
}

pub struct ModelRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    path: Option<PathBuf>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            path: None,
        }
    }

    /// Registry persisted as a JSON snapshot at the given path
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            path: Some(path),
        }
    }

    /// Append a checkpoint to the chain. The parent must already be
    /// registered; only the bootstrap checkpoint may have none.
    pub async fn register(&self, checkpoint: ModelCheckpoint) -> Result<()> {
        let mut inner = self.inner.write().await;

        if inner.checkpoints.iter().any(|c| c.id == checkpoint.id) {
            bail!("checkpoint {} already registered", checkpoint.id);
        }
        match &checkpoint.parent_id {
            Some(parent) => {
                if !inner.checkpoints.iter().any(|c| &c.id == parent) {
                    bail!("parent checkpoint {} not in registry", parent);
                }
            }
            None => {
                if !inner.checkpoints.is_empty() {
                    bail!("only the first checkpoint may omit a parent");
                }
            }
        }

        debug!("Registered checkpoint {}", checkpoint.id);
        inner.checkpoints.push(checkpoint);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<ModelCheckpoint> {
        let inner = self.inner.read().await;
        inner.checkpoints.iter().find(|c| c.id == id).cloned()
    }

    pub async fn production_id(&self) -> Option<String> {
        self.inner.read().await.production.clone()
    }

    /// The full chain, oldest first
    pub async fn chain(&self) -> Vec<ModelCheckpoint> {
        self.inner.read().await.checkpoints.clone()
    }

    pub async fn deployment(&self, checkpoint_id: &str) -> Option<DeploymentRecord> {
        self.inner.read().await.deployments.get(checkpoint_id).cloned()
    }

    /// How many deployment records currently hold the production stage.
    /// Invariant: never more than one.
    pub async fn production_count(&self) -> usize {
        self.inner
            .read()
            .await
            .deployments
            .values()
            .filter(|d| d.stage == DeploymentStage::Production)
            .count()
    }

    pub(crate) async fn upsert_deployment(&self, record: DeploymentRecord) {
        let mut inner = self.inner.write().await;
        inner.deployments.insert(record.checkpoint_id.clone(), record);
    }

    /// Stage transition; the only mutation permitted on a deployment
    /// record besides probe appends.
    pub(crate) async fn transition(
        &self,
        checkpoint_id: &str,
        stage: DeploymentStage,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .deployments
            .get_mut(checkpoint_id)
            .ok_or_else(|| anyhow::anyhow!("no deployment record for {checkpoint_id}"))?;
        record.stage = stage;
        if stage == DeploymentStage::RolledBack {
            record.rolled_back_at = Some(Utc::now());
        }
        Ok(())
    }

    pub(crate) async fn record_probe(&self, checkpoint_id: &str, probe: HealthProbe) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.deployments.get_mut(checkpoint_id) {
            record.health_history.push(probe);
        }
    }

    /// Atomic promotion: demote the previous production record and move
    /// the pointer in a single write.
    pub(crate) async fn promote(&self, checkpoint_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;

        if !inner.checkpoints.iter().any(|c| c.id == checkpoint_id) {
            bail!("cannot promote unregistered checkpoint {checkpoint_id}");
        }

        if let Some(previous) = inner.production.clone() {
            if previous != checkpoint_id {
                if let Some(record) = inner.deployments.get_mut(&previous) {
                    if record.stage == DeploymentStage::Production {
                        record.stage = DeploymentStage::Superseded;
                    }
                }
            }
        }

        let now = Utc::now();
        let record = inner
            .deployments
            .entry(checkpoint_id.to_string())
            .or_insert_with(|| DeploymentRecord::new(checkpoint_id));
        record.stage = DeploymentStage::Production;
        record.activated_at = Some(now);
        inner.production = Some(checkpoint_id.to_string());

        info!("Production pointer moved to {}", checkpoint_id);
        Ok(())
    }

    /// Drop checkpoints beyond the retained rollback depth, keeping the
    /// production checkpoint regardless of age. Returns how many were
    /// pruned.
    pub async fn prune(&self, retain: usize) -> usize {
        let mut inner = self.inner.write().await;
        if inner.checkpoints.len() <= retain {
            return 0;
        }

        let cutoff = inner.checkpoints.len() - retain;
        let production = inner.production.clone();
        let drained: Vec<ModelCheckpoint> = inner.checkpoints.drain(..).collect();
        let (dropped, kept): (Vec<(usize, ModelCheckpoint)>, Vec<(usize, ModelCheckpoint)>) =
            drained
                .into_iter()
                .enumerate()
                .partition(|(i, c)| *i < cutoff && Some(&c.id) != production.as_ref());
        inner.checkpoints = kept.into_iter().map(|(_, c)| c).collect();

        let mut pruned = 0;
        for (_, checkpoint) in &dropped {
            inner.deployments.remove(&checkpoint.id);
            pruned += 1;
        }
        if pruned > 0 {
            info!("Pruned {pruned} old checkpoints from the registry");
        }
        pruned
    }

    /// Save a snapshot to disk
    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let inner = self.inner.read().await;
        let json = serde_json::to_string_pretty(&*inner)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        debug!("Saved registry to {:?}", path);
        Ok(())
    }

    /// Load a snapshot from disk, if one exists
    pub async fn load(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if path.exists() {
            let json = tokio::fs::read_to_string(path).await?;
            let loaded: RegistryInner = serde_json::from_str(&json)?;
            let mut inner = self.inner.write().await;
            *inner = loaded;
            info!("Loaded registry from {:?}", path);
        }
        Ok(())
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
