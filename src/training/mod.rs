//! Fine-tuning engine
//!
//! Drives a parameter-efficient update pass over a built dataset. The
//! numeric optimizer itself lives behind [`TrainerBackend`]; the engine
//! owns the update policy: importance-weighted freezing, adapter-only
//! updates, the wall-clock budget, and divergence/cancellation handling.
//! A failed run is always discarded, never promoted.

pub mod remote;
pub mod sim;

pub use remote::HttpTrainer;
pub use sim::SimulatedTrainer;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::TrainingConfig;
use crate::dataset::{TrainingDataset, TrainingExample};
use crate::error::TrainingError;
use crate::types::{CheckpointMetrics, ModelCheckpoint};

/// One trainable parameter group as reported by the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamGroup {
    pub name: String,
    pub size: u64,
    /// Whether this group belongs to the adapter subset that updates may
    /// touch at all
    pub adapter: bool,
}

/// Result of a single update step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub loss: f64,
}

/// The numeric trainer. Its only required capability is updating a
/// bounded subset of parameters given a loss signal.
#[async_trait]
pub trait TrainerBackend: Send + Sync {
    async fn parameter_groups(&self) -> Result<Vec<ParamGroup>>;

    /// Per-group importance over a held-out batch, approximated by squared
    /// gradient magnitude.
    async fn importance_probe(
        &self,
        base_checkpoint: &str,
        batch: &[TrainingExample],
    ) -> Result<HashMap<String, f64>>;

    /// Apply one gradient update to every group not in `frozen`.
    async fn train_step(
        &self,
        base_checkpoint: &str,
        batch: &[TrainingExample],
        frozen: &HashSet<String>,
        learning_rate: f64,
    ) -> Result<StepOutcome>;

    /// Persist the accumulated updates as a new checkpoint and return its
    /// id.
    async fn export_checkpoint(&self, base_checkpoint: &str) -> Result<String>;

    /// Drop accumulated updates for an aborted run.
    async fn discard(&self, base_checkpoint: &str) -> Result<()>;
}

/// Groups whose gradients are zeroed for the whole run: the top importance
/// quantile plus everything outside the adapter subset.
pub fn freeze_mask(
    groups: &[ParamGroup],
    importance: &HashMap<String, f64>,
    freeze_quantile: f64,
) -> HashSet<String> {
    let mut ranked: Vec<(&str, f64)> = groups
        .iter()
        .map(|g| {
            (
                g.name.as_str(),
                importance.get(&g.name).copied().unwrap_or(0.0),
            )
        })
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let top_n = (groups.len() as f64 * freeze_quantile).ceil() as usize;

    let mut frozen: HashSet<String> = ranked
        .into_iter()
        .take(top_n)
        .map(|(name, _)| name.to_string())
        .collect();

    for group in groups {
        if !group.adapter {
            frozen.insert(group.name.clone());
        }
    }
    frozen
}

pub struct FineTuneEngine {
    backend: Arc<dyn TrainerBackend>,
    config: TrainingConfig,
}

impl FineTuneEngine {
    pub fn new(backend: Arc<dyn TrainerBackend>, config: TrainingConfig) -> Self {
        Self { backend, config }
    }

    /// Run one bounded fine-tuning pass. Any failure aborts the run and
    /// discards partial work; a checkpoint only exists on success.
    pub async fn train(
        &self,
        dataset: &TrainingDataset,
        base: &ModelCheckpoint,
        mut cancel: watch::Receiver<bool>,
    ) -> std::result::Result<ModelCheckpoint, TrainingError> {
        if dataset.train_examples.is_empty() {
            return Err(TrainingError::DatasetTooSmall { got: 0, need: 1 });
        }

        let started = Instant::now();
        let budget = Duration::from_secs(self.config.wall_clock_budget_secs);

        let outcome = self
            .run_steps(dataset, base, started, budget, &mut cancel)
            .await;

        match outcome {
            Ok((final_loss, steps, examples_seen)) => {
                let id = self
                    .backend
                    .export_checkpoint(&base.id)
                    .await
                    .map_err(|e| TrainingError::Backend(e.to_string()))?;

                let checkpoint = ModelCheckpoint {
                    id,
                    parent_id: Some(base.id.clone()),
                    created_at: Utc::now(),
                    training_dataset_id: dataset.id.clone(),
                    metrics: CheckpointMetrics {
                        final_loss,
                        steps,
                        duration_secs: started.elapsed().as_secs(),
                        examples_seen,
                    },
                };
                info!(
                    "Training produced checkpoint {} ({} steps, loss {:.4})",
                    checkpoint.id, steps, final_loss
                );
                Ok(checkpoint)
            }
            Err(e) => {
                warn!("Training aborted: {}", e);
                if let Err(discard_err) = self.backend.discard(&base.id).await {
                    warn!("Failed to discard partial training state: {}", discard_err);
                }
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        dataset: &TrainingDataset,
        base: &ModelCheckpoint,
        started: Instant,
        budget: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> std::result::Result<(f64, u64, u64), TrainingError> {
        let groups = self
            .backend
            .parameter_groups()
            .await
            .map_err(|e| TrainingError::Backend(e.to_string()))?;

        // Importance comes from the held-out batch, or the training data
        // as a last resort on a fresh install
        let probe_batch: &[TrainingExample] = if dataset.validation_examples.is_empty() {
            &dataset.train_examples
        } else {
            &dataset.validation_examples
        };
        let importance = self
            .backend
            .importance_probe(&base.id, probe_batch)
            .await
            .map_err(|e| TrainingError::Backend(e.to_string()))?;

        let frozen = freeze_mask(&groups, &importance, self.config.freeze_quantile);
        debug!(
            "Freezing {} of {} parameter groups",
            frozen.len(),
            groups.len()
        );
        if groups.iter().all(|g| frozen.contains(&g.name)) {
            return Err(TrainingError::Backend(
                "freeze mask leaves no trainable parameters".to_string(),
            ));
        }

        let mut step: u64 = 0;
        let mut examples_seen: u64 = 0;
        let mut initial_loss: Option<f64> = None;
        let mut final_loss = f64::INFINITY;

        'epochs: loop {
            for batch in dataset.train_examples.chunks(self.config.batch_size) {
                if *cancel.borrow() {
                    return Err(TrainingError::Cancelled);
                }
                if started.elapsed() > budget {
                    return Err(TrainingError::BudgetExceeded(budget));
                }

                let step_future = self.backend.train_step(
                    &base.id,
                    batch,
                    &frozen,
                    self.config.learning_rate,
                );
                let outcome = tokio::select! {
                    _ = cancel.changed() => return Err(TrainingError::Cancelled),
                    result = step_future => {
                        result.map_err(|e| TrainingError::Backend(e.to_string()))?
                    }
                };

                step += 1;
                examples_seen += batch.len() as u64;
                final_loss = outcome.loss;

                let reference = *initial_loss.get_or_insert(outcome.loss);
                if !outcome.loss.is_finite()
                    || outcome.loss > reference * self.config.divergence_factor
                {
                    return Err(TrainingError::Diverged {
                        loss: outcome.loss,
                        step,
                    });
                }

                if step >= self.config.max_steps {
                    break 'epochs;
                }
            }
        }

        Ok((final_loss, step, examples_seen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetMetadata, TrainingDataset};

    fn example(domain: &str) -> TrainingExample {
        TrainingExample {
            prompt: "prompt".to_string(),
            completion: "completion".to_string(),
            domain: domain.to_string(),
            reasoning_required: true,
            synthetic: false,
        }
    }

    fn dataset(n: usize) -> TrainingDataset {
        TrainingDataset {
            id: "ds-1".to_string(),
            train_examples: (0..n).map(|_| example("coding")).collect(),
            validation_examples: vec![example("coding")],
            reasoning_ratio: 1.0,
            metadata: DatasetMetadata {
                built_at: Utc::now(),
                candidate_count: n,
                rehearsal_count: 0,
                domain_distribution: HashMap::new(),
                thresholds: HashMap::new(),
            },
        }
    }

    fn engine_with(config: TrainingConfig, backend: Arc<dyn TrainerBackend>) -> FineTuneEngine {
        FineTuneEngine::new(backend, config)
    }

    fn groups() -> Vec<ParamGroup> {
        vec![
            ParamGroup {
                name: "attn.0".to_string(),
                size: 1000,
                adapter: false,
            },
            ParamGroup {
                name: "adapter.0".to_string(),
                size: 100,
                adapter: true,
            },
            ParamGroup {
                name: "adapter.1".to_string(),
                size: 100,
                adapter: true,
            },
            ParamGroup {
                name: "adapter.2".to_string(),
                size: 100,
                adapter: true,
            },
        ]
    }

    #[test]
    fn test_freeze_mask_protects_top_quantile_and_non_adapters() {
        let groups = groups();
        let importance: HashMap<String, f64> = [
            ("attn.0".to_string(), 0.1),
            ("adapter.0".to_string(), 9.0),
            ("adapter.1".to_string(), 0.5),
            ("adapter.2".to_string(), 0.2),
        ]
        .into();

        let frozen = freeze_mask(&groups, &importance, 0.25);
        // Highest-importance group frozen even though it is an adapter
        assert!(frozen.contains("adapter.0"));
        // Non-adapter groups never update
        assert!(frozen.contains("attn.0"));
        // The rest of the adapter subset stays trainable
        assert!(!frozen.contains("adapter.1"));
        assert!(!frozen.contains("adapter.2"));
    }

    #[tokio::test]
    async fn test_successful_run_produces_chained_checkpoint() {
        let engine = engine_with(
            TrainingConfig {
                max_steps: 10,
                ..TrainingConfig::default()
            },
            Arc::new(SimulatedTrainer::new()),
        );
        let base = ModelCheckpoint::base("base");
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let checkpoint = engine.train(&dataset(16), &base, cancel_rx).await.unwrap();
        assert_eq!(checkpoint.parent_id.as_deref(), Some("base"));
        assert_eq!(checkpoint.training_dataset_id, "ds-1");
        assert_eq!(checkpoint.metrics.steps, 10);
        assert!(checkpoint.metrics.final_loss.is_finite());
    }

    #[tokio::test]
    async fn test_budget_exceeded_aborts_without_checkpoint() {
        let backend = Arc::new(SimulatedTrainer::with_step_delay(Duration::from_millis(50)));
        let engine = engine_with(
            TrainingConfig {
                wall_clock_budget_secs: 0,
                ..TrainingConfig::default()
            },
            backend.clone(),
        );
        let base = ModelCheckpoint::base("base");
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let result = engine.train(&dataset(64), &base, cancel_rx).await;
        assert!(matches!(result, Err(TrainingError::BudgetExceeded(_))));
        assert_eq!(backend.exported_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_run() {
        let backend = Arc::new(SimulatedTrainer::with_step_delay(Duration::from_millis(20)));
        let engine = engine_with(TrainingConfig::default(), backend);
        let base = ModelCheckpoint::base("base");
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = cancel_tx.send(true);
        });

        let result = engine.train(&dataset(1000), &base, cancel_rx).await;
        assert!(matches!(result, Err(TrainingError::Cancelled)));
        cancel.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_dataset_rejected() {
        let engine = engine_with(TrainingConfig::default(), Arc::new(SimulatedTrainer::new()));
        let base = ModelCheckpoint::base("base");
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let result = engine.train(&dataset(0), &base, cancel_rx).await;
        assert!(matches!(result, Err(TrainingError::DatasetTooSmall { .. })));
    }
}
