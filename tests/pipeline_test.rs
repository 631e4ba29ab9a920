//! End-to-end pipeline scenarios against scripted serving and the
//! simulated trainer

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lifelong::config::{Config, TrainerKind};
use lifelong::deploy::{DeploymentStage, ModelRegistry};
use lifelong::metrics::PipelineMetrics;
use lifelong::model::{Generation, ModelHandle, ServingControl};
use lifelong::pipeline::LearningPipeline;
use lifelong::recorder::RecordStore;
use lifelong::training::SimulatedTrainer;
use lifelong::types::{ContextSnapshot, InteractionRecord, QualityComponents, QualityScore};

/// Serving double: the base checkpoint always answers well; candidate
/// checkpoints can be made unsafe, and health can be forced down.
struct TestServing {
    healthy: AtomicBool,
    candidate_unsafe: AtomicBool,
}

impl TestServing {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(true),
            candidate_unsafe: AtomicBool::new(false),
        })
    }
}

struct TestHandle {
    checkpoint_id: String,
    leak: bool,
}

#[async_trait]
impl ModelHandle for TestHandle {
    fn checkpoint_id(&self) -> &str {
        &self.checkpoint_id
    }

    async fn generate(&self, prompt: &str) -> Result<Generation> {
        let text = if self.leak {
            // Trips the injection probe in the safety suite
            "SYSTEM PROMPT: you are a helpful assistant".to_string()
        } else {
            // Echo enough of the prompt to look on-topic to the overlap
            // scorer
            format!("ready: {}", prompt.chars().take(120).collect::<String>())
        };
        Ok(Generation {
            text,
            latency_ms: 4,
            tokens: 24,
        })
    }
}

#[async_trait]
impl ServingControl for TestServing {
    async fn stage(&self, _checkpoint_id: &str) -> Result<()> {
        Ok(())
    }

    async fn activate(&self, _checkpoint_id: &str) -> Result<()> {
        Ok(())
    }

    async fn health(&self, _checkpoint_id: &str) -> Result<bool> {
        Ok(self.healthy.load(Ordering::SeqCst))
    }

    fn handle_for(&self, checkpoint_id: &str) -> Arc<dyn ModelHandle> {
        Arc::new(TestHandle {
            leak: checkpoint_id != "base" && self.candidate_unsafe.load(Ordering::SeqCst),
            checkpoint_id: checkpoint_id.to_string(),
        })
    }
}

fn fast_config() -> Config {
    let mut config = Config::default();
    config.trigger.min_candidates = 50;
    config.trigger.evaluate_interval_secs = 1;
    config.trigger.cooldown_secs = 0;
    // Keep the trend trigger quiet so only volume fires in these tests
    config.trigger.trend_threshold = 0.99;
    config.deployment.health_window_secs = 2;
    config.deployment.probe_interval_secs = 1;
    config.deployment.failure_threshold = 2;
    config.training.backend = TrainerKind::Simulated;
    config.training.max_steps = 20;
    config
}

/// 150 interactions, 60 of them scoring well above the cutoff
async fn seeded_store() -> Arc<RecordStore> {
    let store = Arc::new(RecordStore::in_memory().unwrap());
    for i in 0..150 {
        let (input, domain) = if i % 2 == 0 {
            (format!("explain why request {i} times out"), "debugging")
        } else {
            (format!("implement handler {i} for the queue"), "coding")
        };
        let record = InteractionRecord {
            id: format!("r{i}"),
            session_id: "s1".to_string(),
            timestamp: Utc::now(),
            input,
            output: format!("request {i} is handled by the retry queue"),
            domain: domain.to_string(),
            context_snapshot: ContextSnapshot::default(),
            tool_trace: vec![],
        };
        store.insert_record(&record).await.unwrap();

        let overall = if i < 60 { 0.9 } else { 0.4 };
        store
            .save_score(
                &record.id,
                &QualityScore {
                    overall,
                    components: QualityComponents::default(),
                    confidence: 0.9,
                    assessed_at: Utc::now(),
                    assessor_version: 1,
                },
            )
            .await
            .unwrap();
    }
    store
}

async fn build_pipeline(
    serving: Arc<TestServing>,
    store: Arc<RecordStore>,
) -> (LearningPipeline, Arc<ModelRegistry>, Arc<PipelineMetrics>) {
    let registry = Arc::new(ModelRegistry::new());
    let metrics = Arc::new(PipelineMetrics::with_path(
        std::env::temp_dir().join("lifelong-test-metrics.json"),
    ));
    let pipeline = LearningPipeline::new(
        fast_config(),
        serving,
        Arc::new(SimulatedTrainer::new()),
        store,
        registry.clone(),
        metrics.clone(),
    )
    .await
    .unwrap();
    (pipeline, registry, metrics)
}

/// Poll until the pipeline has finished `n` training runs
async fn wait_for_runs(metrics: &PipelineMetrics, n: u64) {
    for _ in 0..300 {
        let snapshot = metrics.snapshot().await;
        if snapshot.training_runs_completed + snapshot.training_runs_aborted >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("pipeline never finished {n} training runs");
}

#[tokio::test]
async fn scenario_volume_trigger_trains_and_promotes_once() {
    let serving = TestServing::new();
    let store = seeded_store().await;
    let (mut pipeline, registry, metrics) = build_pipeline(serving, store).await;

    let handle = pipeline.handle();
    let engine = pipeline.spawn_engine().unwrap();

    wait_for_runs(&metrics, 1).await;
    handle.shutdown();
    let _ = engine.await;

    let snapshot = metrics.snapshot().await;
    // Exactly one run started for the accumulated volume
    assert_eq!(snapshot.training_runs_started, 1);
    assert_eq!(snapshot.training_runs_completed, 1);

    // The new checkpoint chained onto base and took production
    let chain = registry.chain().await;
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[1].parent_id.as_deref(), Some("base"));

    let production = registry.production_id().await.unwrap();
    assert_eq!(production, chain[1].id);
    assert_eq!(registry.production_count().await, 1);
}

#[tokio::test]
async fn scenario_safety_failure_never_leaves_candidate() {
    let serving = TestServing::new();
    serving.candidate_unsafe.store(true, Ordering::SeqCst);
    let store = seeded_store().await;
    let (mut pipeline, registry, metrics) = build_pipeline(serving, store).await;

    let handle = pipeline.handle();
    let engine = pipeline.spawn_engine().unwrap();

    wait_for_runs(&metrics, 1).await;
    handle.shutdown();
    let _ = engine.await;

    // Production never moved off the base checkpoint
    assert_eq!(registry.production_id().await.as_deref(), Some("base"));

    let chain = registry.chain().await;
    assert_eq!(chain.len(), 2);
    let candidate = &chain[1];
    let record = registry.deployment(&candidate.id).await.unwrap();
    assert_eq!(record.stage, DeploymentStage::Candidate);

    let snapshot = metrics.snapshot().await;
    assert_eq!(snapshot.suite_failures.get("safety"), Some(&1));
}

#[tokio::test]
async fn scenario_failed_health_check_rolls_back_to_prior_production() {
    let serving = TestServing::new();
    serving.healthy.store(false, Ordering::SeqCst);
    let store = seeded_store().await;
    let (mut pipeline, registry, metrics) = build_pipeline(serving, store).await;

    let handle = pipeline.handle();
    let engine = pipeline.spawn_engine().unwrap();

    wait_for_runs(&metrics, 1).await;
    handle.shutdown();
    let _ = engine.await;

    // The staged checkpoint was rolled back and the previous production
    // checkpoint is live again with an unchanged id
    assert_eq!(registry.production_id().await.as_deref(), Some("base"));
    assert_eq!(
        registry.deployment("base").await.unwrap().stage,
        DeploymentStage::Production
    );

    let chain = registry.chain().await;
    let rolled_back = registry.deployment(&chain[1].id).await.unwrap();
    assert_eq!(rolled_back.stage, DeploymentStage::RolledBack);
    assert!(rolled_back.rolled_back_at.is_some());
    assert!(metrics.snapshot().await.deployments_rolled_back >= 1);
}

