//! Deterministic in-process trainer
//!
//! Stands in for the real optimizer when no trainer sidecar is configured
//! (dry runs, tests, fresh installs). Loss decays geometrically per
//! effective update; frozen-out steps leave it unchanged.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use super::{ParamGroup, StepOutcome, TrainerBackend};
use crate::dataset::TrainingExample;

const INITIAL_LOSS: f64 = 2.4;
const DECAY_PER_STEP: f64 = 0.985;

pub struct SimulatedTrainer {
    groups: Vec<ParamGroup>,
    loss: Mutex<f64>,
    exported: AtomicU32,
    step_delay: Duration,
}

impl SimulatedTrainer {
    pub fn new() -> Self {
        Self::with_step_delay(Duration::ZERO)
    }

    /// Delay per step, to exercise budget and cancellation paths
    pub fn with_step_delay(step_delay: Duration) -> Self {
        let mut groups = vec![ParamGroup {
            name: "backbone".to_string(),
            size: 6_000_000,
            adapter: false,
        }];
        for i in 0..8 {
            groups.push(ParamGroup {
                name: format!("adapter.{i}"),
                size: 40_000,
                adapter: true,
            });
        }
        Self {
            groups,
            loss: Mutex::new(INITIAL_LOSS),
            exported: AtomicU32::new(0),
            step_delay,
        }
    }

    pub fn exported_count(&self) -> u32 {
        self.exported.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedTrainer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrainerBackend for SimulatedTrainer {
    async fn parameter_groups(&self) -> Result<Vec<ParamGroup>> {
        Ok(self.groups.clone())
    }

    async fn importance_probe(
        &self,
        _base_checkpoint: &str,
        batch: &[TrainingExample],
    ) -> Result<HashMap<String, f64>> {
        // Stable pseudo-magnitudes derived from the group name and the
        // probe batch size, so runs are reproducible
        let scale = 1.0 + batch.len() as f64 / 100.0;
        Ok(self
            .groups
            .iter()
            .map(|g| {
                let seed: u64 = g.name.bytes().map(u64::from).sum();
                let magnitude = ((seed % 97) as f64 / 97.0) * scale;
                (g.name.clone(), magnitude * magnitude)
            })
            .collect())
    }

    async fn train_step(
        &self,
        _base_checkpoint: &str,
        _batch: &[TrainingExample],
        frozen: &HashSet<String>,
        _learning_rate: f64,
    ) -> Result<StepOutcome> {
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }

        let trainable = self.groups.iter().any(|g| !frozen.contains(&g.name));
        let mut loss = self.loss.lock().unwrap();
        if trainable {
            *loss *= DECAY_PER_STEP;
        }
        Ok(StepOutcome { loss: *loss })
    }

    async fn export_checkpoint(&self, base_checkpoint: &str) -> Result<String> {
        let n = self.exported.fetch_add(1, Ordering::SeqCst) + 1;
        let short = Uuid::new_v4().to_string()[..8].to_string();
        Ok(format!("{base_checkpoint}-sim{n}-{short}"))
    }

    async fn discard(&self, _base_checkpoint: &str) -> Result<()> {
        *self.loss.lock().unwrap() = INITIAL_LOSS;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> TrainingExample {
        TrainingExample {
            prompt: "p".to_string(),
            completion: "c".to_string(),
            domain: "coding".to_string(),
            reasoning_required: false,
            synthetic: false,
        }
    }

    #[tokio::test]
    async fn test_loss_decreases_when_trainable() {
        let trainer = SimulatedTrainer::new();
        let frozen = HashSet::new();
        let first = trainer
            .train_step("base", &[example()], &frozen, 1e-4)
            .await
            .unwrap();
        let second = trainer
            .train_step("base", &[example()], &frozen, 1e-4)
            .await
            .unwrap();
        assert!(second.loss < first.loss);
    }

    #[tokio::test]
    async fn test_fully_frozen_step_is_inert() {
        let trainer = SimulatedTrainer::new();
        let frozen: HashSet<String> = trainer
            .parameter_groups()
            .await
            .unwrap()
            .into_iter()
            .map(|g| g.name)
            .collect();

        let first = trainer
            .train_step("base", &[example()], &frozen, 1e-4)
            .await
            .unwrap();
        let second = trainer
            .train_step("base", &[example()], &frozen, 1e-4)
            .await
            .unwrap();
        assert_eq!(first.loss, second.loss);
    }

    #[tokio::test]
    async fn test_importance_is_deterministic() {
        let trainer = SimulatedTrainer::new();
        let a = trainer.importance_probe("base", &[example()]).await.unwrap();
        let b = trainer.importance_probe("base", &[example()]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 9);
    }
}
