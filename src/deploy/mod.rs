//! Staged deployment
//!
//! Drives a validated checkpoint through staging, a bounded health-check
//! window, and atomic promotion, with automatic rollback as the recovery
//! path. Rollback failure is the one fatal condition: it halts further
//! promotions until manually cleared.

pub mod registry;

pub use registry::ModelRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::DeploymentConfig;
use crate::error::DeployError;
use crate::metrics::PipelineMetrics;
use crate::model::ServingControl;
use crate::types::ModelCheckpoint;
use crate::validation::ValidationResult;

/// Prompts fired at a staged checkpoint during health checks
const SMOKE_PROMPTS: &[&str] = &[
    "Reply with a short confirmation that you are ready.",
    "What is 2 + 2?",
];

/// Deployment lifecycle stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentStage {
    Candidate,
    Staging,
    HealthCheck,
    Production,
    /// Left production because a newer checkpoint was promoted
    Superseded,
    RolledBack,
}

impl std::fmt::Display for DeploymentStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentStage::Candidate => write!(f, "candidate"),
            DeploymentStage::Staging => write!(f, "staging"),
            DeploymentStage::HealthCheck => write!(f, "health_check"),
            DeploymentStage::Production => write!(f, "production"),
            DeploymentStage::Superseded => write!(f, "superseded"),
            DeploymentStage::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// One health probe result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthProbe {
    pub at: DateTime<Utc>,
    pub healthy: bool,
    pub detail: String,
}

/// The single piece of mutable deployment state per checkpoint. Only the
/// stage (and probe history) ever changes after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub checkpoint_id: String,
    pub stage: DeploymentStage,
    pub activated_at: Option<DateTime<Utc>>,
    pub health_history: Vec<HealthProbe>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl DeploymentRecord {
    pub fn new(checkpoint_id: &str) -> Self {
        Self {
            checkpoint_id: checkpoint_id.to_string(),
            stage: DeploymentStage::Candidate,
            activated_at: None,
            health_history: Vec::new(),
            rolled_back_at: None,
        }
    }
}

enum HealthVerdict {
    Stable,
    Failed,
}

pub struct DeploymentManager {
    registry: Arc<ModelRegistry>,
    serving: Arc<dyn ServingControl>,
    config: DeploymentConfig,
    metrics: Arc<PipelineMetrics>,
    halted: AtomicBool,
}

impl DeploymentManager {
    pub fn new(
        registry: Arc<ModelRegistry>,
        serving: Arc<dyn ServingControl>,
        config: DeploymentConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            registry,
            serving,
            config,
            metrics,
            halted: AtomicBool::new(false),
        }
    }

    /// Whether promotions are halted pending manual intervention
    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Manually clear the halt after the serving layer has been fixed
    pub fn clear_halt(&self) {
        self.halted.store(false, Ordering::SeqCst);
        info!("Deployment halt cleared");
    }

    /// Seed the registry with the initial base checkpoint serving live
    /// traffic. Only valid on an empty registry.
    pub async fn seed_production(&self, checkpoint: ModelCheckpoint) -> Result<(), DeployError> {
        let id = checkpoint.id.clone();
        self.registry
            .register(checkpoint)
            .await
            .map_err(|e| DeployError::Serving(e.to_string()))?;
        self.registry
            .promote(&id)
            .await
            .map_err(|e| DeployError::Serving(e.to_string()))?;
        Ok(())
    }

    /// Walk a validated checkpoint through the stage machine and return
    /// the stage it ended in.
    pub async fn deploy(
        &self,
        checkpoint: &ModelCheckpoint,
        validation: &ValidationResult,
    ) -> Result<DeploymentStage, DeployError> {
        if self.halted() {
            return Err(DeployError::PromotionsHalted);
        }

        self.registry
            .upsert_deployment(DeploymentRecord::new(&checkpoint.id))
            .await;
        self.metrics.stage_transition().await;

        // Safety is the hard gate: a failing checkpoint never leaves
        // candidate
        if !validation.suite_results.safety.passed {
            info!(
                "Checkpoint {} failed safety validation, staying a candidate",
                checkpoint.id
            );
            return Ok(DeploymentStage::Candidate);
        }

        self.serving
            .stage(&checkpoint.id)
            .await
            .map_err(|e| DeployError::Serving(e.to_string()))?;
        self.transition(&checkpoint.id, DeploymentStage::Staging)
            .await?;

        // A partial pass (safety ok, another suite failing) stays staged
        // for inspection and never reaches production
        if !validation.overall_passed {
            info!(
                "Checkpoint {} passed safety only, holding at staging",
                checkpoint.id
            );
            return Ok(DeploymentStage::Staging);
        }

        self.transition(&checkpoint.id, DeploymentStage::HealthCheck)
            .await?;

        match self.monitor_health(&checkpoint.id).await {
            HealthVerdict::Stable => {
                self.promote(&checkpoint.id).await?;
                Ok(DeploymentStage::Production)
            }
            HealthVerdict::Failed => {
                warn!(
                    "Checkpoint {} failed health checks, rolling back",
                    checkpoint.id
                );
                self.rollback(&checkpoint.id).await?;
                Ok(DeploymentStage::RolledBack)
            }
        }
    }

    async fn transition(
        &self,
        checkpoint_id: &str,
        stage: DeploymentStage,
    ) -> Result<(), DeployError> {
        self.registry
            .transition(checkpoint_id, stage)
            .await
            .map_err(|e| DeployError::Serving(e.to_string()))?;
        self.metrics.stage_transition().await;
        Ok(())
    }

    /// Probe the staged checkpoint on an interval inside a bounded
    /// observation window. No rollback-triggering failure by the end of
    /// the window means the deployment is stable and monitoring stops.
    async fn monitor_health(&self, checkpoint_id: &str) -> HealthVerdict {
        let window = Duration::from_secs(self.config.health_window_secs);
        let deadline = Instant::now() + window;
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.probe_interval_secs.max(1)));
        let handle = self.serving.handle_for(checkpoint_id);

        let mut failures: u32 = 0;
        loop {
            ticker.tick().await;
            if Instant::now() >= deadline {
                return HealthVerdict::Stable;
            }

            let (healthy, detail) = self.probe(checkpoint_id, handle.as_ref()).await;
            self.registry
                .record_probe(
                    checkpoint_id,
                    HealthProbe {
                        at: Utc::now(),
                        healthy,
                        detail,
                    },
                )
                .await;

            if healthy {
                failures = 0;
            } else {
                failures += 1;
                if failures >= self.config.failure_threshold {
                    return HealthVerdict::Failed;
                }
            }
        }
    }

    async fn probe(
        &self,
        checkpoint_id: &str,
        handle: &dyn crate::model::ModelHandle,
    ) -> (bool, String) {
        match self.serving.health(checkpoint_id).await {
            Ok(false) => return (false, "serving layer reports unhealthy".to_string()),
            Err(e) => return (false, format!("health endpoint unreachable: {e}")),
            Ok(true) => {}
        }

        for prompt in SMOKE_PROMPTS {
            match handle.generate(prompt).await {
                Ok(generation) if generation.text.trim().is_empty() => {
                    return (false, "empty smoke-test response".to_string());
                }
                Err(e) => return (false, format!("smoke test failed: {e}")),
                Ok(_) => {}
            }
        }
        (true, "ok".to_string())
    }

    /// Atomic promotion: live traffic switches, then the registry pointer
    /// moves in one serialized write.
    async fn promote(&self, checkpoint_id: &str) -> Result<(), DeployError> {
        if self.halted() {
            return Err(DeployError::PromotionsHalted);
        }

        if let Err(e) = self.serving.activate(checkpoint_id).await {
            warn!("Activation of {} failed: {}", checkpoint_id, e);
            self.rollback(checkpoint_id).await?;
            return Err(DeployError::Serving(e.to_string()));
        }

        self.registry
            .promote(checkpoint_id)
            .await
            .map_err(|e| DeployError::Serving(e.to_string()))?;
        self.metrics.stage_transition().await;
        self.metrics.deployment_promoted().await;
        info!("Checkpoint {} promoted to production", checkpoint_id);
        Ok(())
    }

    /// Roll a checkpoint back and restore the prior production record
    /// unchanged. Idempotent: a second rollback of the same checkpoint is
    /// a no-op.
    pub async fn rollback(&self, checkpoint_id: &str) -> Result<(), DeployError> {
        let record = self
            .registry
            .deployment(checkpoint_id)
            .await
            .ok_or_else(|| DeployError::UnknownCheckpoint(checkpoint_id.to_string()))?;

        if record.stage == DeploymentStage::RolledBack {
            return Ok(());
        }

        // If the checkpoint made it to production, fall back to its
        // parent; otherwise the prior production record is still active.
        let production = self.registry.production_id().await;
        let restore_target = if production.as_deref() == Some(checkpoint_id) {
            self.registry
                .get(checkpoint_id)
                .await
                .and_then(|c| c.parent_id)
        } else {
            production.clone()
        };

        if let Some(target) = &restore_target {
            if let Err(e) = self.serving.activate(target).await {
                error!(
                    "Rollback of {} failed to restore {}: {}",
                    checkpoint_id, target, e
                );
                self.halted.store(true, Ordering::SeqCst);
                self.metrics.escalation().await;
                return Err(DeployError::RollbackFailed {
                    checkpoint_id: checkpoint_id.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        self.registry
            .transition(checkpoint_id, DeploymentStage::RolledBack)
            .await
            .map_err(|e| DeployError::Serving(e.to_string()))?;
        if let Some(target) = &restore_target {
            if production.as_deref() == Some(checkpoint_id) {
                self.registry
                    .promote(target)
                    .await
                    .map_err(|e| DeployError::Serving(e.to_string()))?;
            }
        }

        self.metrics.stage_transition().await;
        self.metrics.deployment_rolled_back().await;
        info!(
            "Checkpoint {} rolled back{}",
            checkpoint_id,
            restore_target
                .map(|t| format!(", production restored to {t}"))
                .unwrap_or_default()
        );
        Ok(())
    }

    /// Drop checkpoints beyond the configured rollback depth
    pub async fn prune_registry(&self) -> usize {
        self.registry.prune(self.config.retained_checkpoints).await
    }
}
