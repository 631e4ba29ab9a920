//! Pipeline wiring
//!
//! Composes the recorder, quality engine, decision engine, dataset
//! builder, fine-tuning engine, validation pipeline, and deployment
//! manager into one running system.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::dataset::builder::{render_example, requires_reasoning};
use crate::dataset::{DatasetBuilder, RehearsalSynthesizer, TrainingExample};
use crate::deploy::{DeploymentManager, ModelRegistry};
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::model::ServingControl;
use crate::quality::QualityEngine;
use crate::recorder::{InteractionRecorder, RawInteraction, RecordStore};
use crate::training::{FineTuneEngine, TrainerBackend};
use crate::trigger::{
    DecisionEngine, EngineHandle, ResourceMonitor, RunOutcome, TrainingRunner, TriggerReason,
};
use crate::types::{ModelCheckpoint, RecordId};
use crate::validation::ValidationPipeline;

/// The assembled learning pipeline
pub struct LearningPipeline {
    recorder: InteractionRecorder,
    registry: Arc<ModelRegistry>,
    deployer: Arc<DeploymentManager>,
    resources: Arc<ResourceMonitor>,
    metrics: Arc<PipelineMetrics>,
    store: Arc<RecordStore>,
    engine: Option<DecisionEngine>,
    handle: EngineHandle,
}

impl LearningPipeline {
    /// Wire everything up. Seeds the registry with the configured base
    /// checkpoint when starting from an empty registry.
    pub async fn new(
        config: Config,
        serving: Arc<dyn ServingControl>,
        trainer: Arc<dyn TrainerBackend>,
        store: Arc<RecordStore>,
        registry: Arc<ModelRegistry>,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self> {
        config.validate()?;

        let quality = Arc::new(QualityEngine::new(
            &config.quality,
            store.clone(),
            metrics.clone(),
        ));
        let recorder = InteractionRecorder::start(store.clone(), quality.clone(), metrics.clone());

        let deployer = Arc::new(DeploymentManager::new(
            registry.clone(),
            serving.clone(),
            config.deployment.clone(),
            metrics.clone(),
        ));

        if registry.production_id().await.is_none() {
            let base = ModelCheckpoint::base(&config.deployment.base_checkpoint_id);
            info!("Seeding registry with base checkpoint {}", base.id);
            deployer
                .seed_production(base)
                .await
                .map_err(|e| anyhow::anyhow!("failed to seed registry: {e}"))?;
        }

        let resources = Arc::new(ResourceMonitor::new(config.training.memory_budget_mb));

        let runner = Arc::new(PipelineRunner {
            config: config.clone(),
            store: store.clone(),
            quality,
            serving: serving.clone(),
            builder: DatasetBuilder::new(
                config.thresholds.clone(),
                config.dataset.clone(),
                config.quality.min_training_confidence,
            ),
            tuner: FineTuneEngine::new(trainer, config.training.clone()),
            validator: ValidationPipeline::new(
                serving,
                config.validation.clone(),
                metrics.clone(),
            ),
            deployer: deployer.clone(),
            registry: registry.clone(),
            metrics: metrics.clone(),
        });

        let (engine, handle) = DecisionEngine::new(
            config.trigger.clone(),
            config.thresholds.base_quality,
            config.quality.min_training_confidence,
            store.clone(),
            runner,
            resources.clone(),
            metrics.clone(),
        );

        Ok(Self {
            recorder,
            registry,
            deployer,
            resources,
            metrics,
            store,
            engine: Some(engine),
            handle,
        })
    }

    /// Fire-and-forget ingestion API
    pub fn record(&self, raw: RawInteraction) -> RecordId {
        self.recorder.record(raw)
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn registry(&self) -> Arc<ModelRegistry> {
        self.registry.clone()
    }

    pub fn deployer(&self) -> Arc<DeploymentManager> {
        self.deployer.clone()
    }

    pub fn resources(&self) -> Arc<ResourceMonitor> {
        self.resources.clone()
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    pub fn store(&self) -> Arc<RecordStore> {
        self.store.clone()
    }

    /// Move the decision engine onto its own task. Returns `None` if it
    /// was already started.
    pub fn spawn_engine(&mut self) -> Option<tokio::task::JoinHandle<()>> {
        self.engine.take().map(|engine| tokio::spawn(engine.run()))
    }

    /// Run the decision engine on the current task until shutdown
    pub async fn run_engine(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.run().await;
        }
    }
}

/// The downstream half of a training run: dataset prep, fine-tuning,
/// validation, deployment. Owned exclusively by the decision engine.
struct PipelineRunner {
    config: Config,
    store: Arc<RecordStore>,
    quality: Arc<QualityEngine>,
    serving: Arc<dyn ServingControl>,
    builder: DatasetBuilder,
    tuner: FineTuneEngine,
    validator: ValidationPipeline,
    deployer: Arc<DeploymentManager>,
    registry: Arc<ModelRegistry>,
    metrics: Arc<PipelineMetrics>,
}

#[async_trait]
impl TrainingRunner for PipelineRunner {
    async fn run(
        &self,
        reason: TriggerReason,
        since: DateTime<Utc>,
        cancel: watch::Receiver<bool>,
    ) -> std::result::Result<RunOutcome, PipelineError> {
        info!("Training run starting (trigger: {})", reason);

        let pool = self
            .store
            .scored_records_since(since)
            .await
            .map_err(|e| PipelineError::Transient(e.to_string()))?;
        let candidates = self.builder.select_candidates(pool);
        self.metrics.candidates_selected(candidates.len() as u64).await;

        if candidates.len() < self.config.dataset.min_examples {
            return Ok(RunOutcome::Skipped {
                reason: format!(
                    "{} candidates after filtering, need {}",
                    candidates.len(),
                    self.config.dataset.min_examples
                ),
            });
        }

        let production_id = self
            .registry
            .production_id()
            .await
            .ok_or_else(|| PipelineError::Transient("no production checkpoint".to_string()))?;

        let mut batch_domains: HashMap<String, usize> = HashMap::new();
        for candidate in &candidates {
            *batch_domains
                .entry(candidate.record.domain.clone())
                .or_insert(0) += 1;
        }

        // Rehearsal is best-effort: a serving hiccup must not sink the run
        let synthesizer = RehearsalSynthesizer::new(
            self.serving.handle_for(&production_id),
            self.quality.clone(),
            self.store.clone(),
            self.config.dataset.clone(),
        );
        let rehearsal = match synthesizer.synthesize(&batch_domains).await {
            Ok(examples) => examples,
            Err(e) => {
                warn!("Rehearsal synthesis failed: {}", e);
                Vec::new()
            }
        };

        let dataset = self
            .builder
            .build(candidates, rehearsal)
            .map_err(|e| PipelineError::Data(e.to_string()))?;

        let base = self
            .registry
            .get(&production_id)
            .await
            .ok_or_else(|| PipelineError::Transient("production checkpoint missing".to_string()))?;

        let checkpoint = self.tuner.train(&dataset, &base, cancel).await?;
        self.registry
            .register(checkpoint.clone())
            .await
            .map_err(|e| PipelineError::Transient(e.to_string()))?;

        let holdout = self.holdout(since, &dataset.validation_examples).await?;
        let trained_domains = dataset.domains();
        let validation = self
            .validator
            .validate(&checkpoint, &production_id, &holdout, &trained_domains)
            .await
            .map_err(|e| PipelineError::Transient(e.to_string()))?;

        let stage = self.deployer.deploy(&checkpoint, &validation).await?;

        self.deployer.prune_registry().await;
        if let Err(e) = self.registry.save().await {
            warn!("Failed to persist registry snapshot: {}", e);
        }

        Ok(RunOutcome::Completed {
            checkpoint_id: checkpoint.id,
            stage,
        })
    }
}

impl PipelineRunner {
    /// Fixed historical validation set: scored records from before this
    /// batch. Falls back to the dataset's own validation split on a fresh
    /// install.
    async fn holdout(
        &self,
        since: DateTime<Utc>,
        fallback: &[TrainingExample],
    ) -> std::result::Result<Vec<TrainingExample>, PipelineError> {
        let historical = self
            .store
            .scored_records_before(since, self.config.validation.holdout_size)
            .await
            .map_err(|e| PipelineError::Transient(e.to_string()))?;

        if historical.is_empty() {
            warn!("No historical holdout yet, validating against the dataset split");
            return Ok(fallback.to_vec());
        }

        Ok(historical
            .into_iter()
            .map(|(record, _)| {
                let reasoning = requires_reasoning(&record);
                render_example(&record, reasoning)
            })
            .collect())
    }
}
