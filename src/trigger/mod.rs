//! Training decision engine
//!
//! A singleton coordinator task that watches accumulated quality data and
//! decides whether and when to start a training run. State transitions
//! are serialized through this one task; there is never more than one
//! active run, and triggers that fire while a run is active are queued,
//! not executed.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{error, info, warn};

use crate::config::TriggerConfig;
use crate::deploy::DeploymentStage;
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::recorder::store::RecordStore;

/// Decision engine state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Collecting,
    Evaluating,
    ResourceCheck,
    DatasetPrep,
    TrainingActive,
    Cooldown,
}

/// What caused a training run to start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerReason {
    Volume,
    QualityTrend,
    TimeBound,
    Manual,
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerReason::Volume => write!(f, "volume"),
            TriggerReason::QualityTrend => write!(f, "quality_trend"),
            TriggerReason::TimeBound => write!(f, "time_bound"),
            TriggerReason::Manual => write!(f, "manual"),
        }
    }
}

/// Commands accepted by the coordinator task
#[derive(Debug)]
pub enum EngineCommand {
    Trigger(TriggerReason),
    CancelTraining,
    ClearEscalation,
    Shutdown,
}

/// Result of one training run as seen by the engine
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed {
        checkpoint_id: String,
        stage: DeploymentStage,
    },
    /// Not enough data after filtering; not an abort
    Skipped { reason: String },
}

/// The downstream stages (dataset prep, training, validation, deployment)
/// as one callable unit owned by the engine.
#[async_trait]
pub trait TrainingRunner: Send + Sync {
    async fn run(
        &self,
        reason: TriggerReason,
        since: DateTime<Utc>,
        cancel: watch::Receiver<bool>,
    ) -> std::result::Result<RunOutcome, PipelineError>;
}

/// Compute/memory budget gate consulted before each run. The host reports
/// available memory; the single training slot lives here too.
pub struct ResourceMonitor {
    memory_budget_mb: u64,
    available_memory_mb: AtomicU64,
    slot_taken: AtomicBool,
}

impl ResourceMonitor {
    pub fn new(memory_budget_mb: u64) -> Self {
        Self {
            memory_budget_mb,
            // Until the host reports, assume the budget fits
            available_memory_mb: AtomicU64::new(u64::MAX),
            slot_taken: AtomicBool::new(false),
        }
    }

    pub fn set_available_memory_mb(&self, mb: u64) {
        self.available_memory_mb.store(mb, Ordering::SeqCst);
    }

    pub fn budget_available(&self) -> bool {
        !self.slot_taken.load(Ordering::SeqCst)
            && self.available_memory_mb.load(Ordering::SeqCst) >= self.memory_budget_mb
    }

    fn acquire_slot(&self) -> bool {
        self.slot_taken
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn release_slot(&self) {
        self.slot_taken.store(false, Ordering::SeqCst);
    }
}

/// Shared view of the engine, readable from outside the coordinator task
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
    pub pending: Option<TriggerReason>,
    pub consecutive_aborts: u32,
    pub abort_reason: Option<TriggerReason>,
    pub escalated: bool,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            state: EngineState::Collecting,
            last_run_at: None,
            last_outcome: None,
            pending: None,
            consecutive_aborts: 0,
            abort_reason: None,
            escalated: false,
        }
    }
}

/// Handle for poking the coordinator from the outside
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    status: Arc<RwLock<EngineStatus>>,
}

impl EngineHandle {
    /// Request a manual training run
    pub fn trigger(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Trigger(TriggerReason::Manual));
    }

    /// Abort the active run, discarding partial work
    pub fn cancel_training(&self) {
        let _ = self.cmd_tx.send(EngineCommand::CancelTraining);
    }

    /// Clear a manual-intervention escalation
    pub fn clear_escalation(&self) {
        let _ = self.cmd_tx.send(EngineCommand::ClearEscalation);
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Shutdown);
    }

    pub async fn status(&self) -> EngineStatus {
        self.status.read().await.clone()
    }
}

pub struct DecisionEngine {
    config: TriggerConfig,
    /// Cutoff used for the volume trigger's qualifying count
    quality_cutoff: f64,
    min_confidence: f64,
    store: Arc<RecordStore>,
    runner: Arc<dyn TrainingRunner>,
    resources: Arc<ResourceMonitor>,
    metrics: Arc<PipelineMetrics>,
    status: Arc<RwLock<EngineStatus>>,
    cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
    cooldown_until: Option<Instant>,
    shutdown: bool,
}

impl DecisionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TriggerConfig,
        quality_cutoff: f64,
        min_confidence: f64,
        store: Arc<RecordStore>,
        runner: Arc<dyn TrainingRunner>,
        resources: Arc<ResourceMonitor>,
        metrics: Arc<PipelineMetrics>,
    ) -> (Self, EngineHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(EngineStatus::default()));

        let handle = EngineHandle {
            cmd_tx,
            status: status.clone(),
        };
        let engine = Self {
            config,
            quality_cutoff,
            min_confidence,
            store,
            runner,
            resources,
            metrics,
            status,
            cmd_rx,
            cooldown_until: None,
            shutdown: false,
        };
        (engine, handle)
    }

    /// Coordinator loop. This is the single writer of engine state.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.evaluate_interval_secs.max(1),
        ));
        info!("Training decision engine started");

        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        None | Some(EngineCommand::Shutdown) => break,
                        Some(EngineCommand::Trigger(reason)) => self.queue_trigger(reason).await,
                        Some(EngineCommand::ClearEscalation) => self.clear_escalation().await,
                        // No run active; nothing to cancel
                        Some(EngineCommand::CancelTraining) => {}
                    }
                }
                _ = ticker.tick() => {
                    self.cycle().await;
                    if self.shutdown {
                        break;
                    }
                }
            }
        }
        info!("Training decision engine stopped");
    }

    async fn queue_trigger(&self, reason: TriggerReason) {
        let mut status = self.status.write().await;
        info!("Trigger {} queued", reason);
        status.pending = Some(reason);
    }

    async fn clear_escalation(&self) {
        let mut status = self.status.write().await;
        if status.escalated {
            status.escalated = false;
            status.consecutive_aborts = 0;
            status.abort_reason = None;
            info!("Escalation cleared, automatic training resumes");
        }
    }

    async fn set_state(&self, state: EngineState) {
        self.status.write().await.state = state;
    }

    /// One evaluation cycle of the state machine
    async fn cycle(&mut self) {
        if self.status.read().await.escalated {
            return;
        }
        if let Some(until) = self.cooldown_until {
            if Instant::now() < until {
                return;
            }
            self.cooldown_until = None;
            self.set_state(EngineState::Collecting).await;
        }

        self.set_state(EngineState::Evaluating).await;
        let pending = self.status.write().await.pending.take();
        let fired = match pending {
            Some(reason) => Some(reason),
            None => match self.check_triggers().await {
                Ok(fired) => fired,
                Err(e) => {
                    warn!("Trigger evaluation failed: {}", e);
                    None
                }
            },
        };

        let Some(reason) = fired else {
            self.set_state(EngineState::Collecting).await;
            return;
        };

        self.set_state(EngineState::ResourceCheck).await;
        if !self.resources.budget_available() || !self.resources.acquire_slot() {
            warn!("Resource budget unavailable, deferring {} trigger", reason);
            // Keep the trigger queued and retry after backoff
            self.status.write().await.pending = Some(reason);
            self.enter_cooldown().await;
            return;
        }

        self.execute_run(reason).await;
        self.resources.release_slot();
        self.enter_cooldown().await;
    }

    /// Drive one training run while staying responsive to commands.
    /// Triggers that arrive mid-run are queued; cancellation flips the
    /// watch flag the runner observes.
    async fn execute_run(&mut self, reason: TriggerReason) {
        let since = self
            .status
            .read()
            .await
            .last_run_at
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        self.set_state(EngineState::DatasetPrep).await;
        self.metrics.training_started().await;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let runner = self.runner.clone();
        let mut run_future = Box::pin(runner.run(reason, since, cancel_rx));

        self.set_state(EngineState::TrainingActive).await;
        let result = loop {
            tokio::select! {
                result = &mut run_future => break result,
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        None | Some(EngineCommand::Shutdown) => {
                            self.shutdown = true;
                            let _ = cancel_tx.send(true);
                        }
                        Some(EngineCommand::CancelTraining) => {
                            info!("Cancelling active training run");
                            let _ = cancel_tx.send(true);
                        }
                        Some(EngineCommand::Trigger(queued)) => {
                            self.queue_trigger(queued).await;
                        }
                        Some(EngineCommand::ClearEscalation) => {
                            self.clear_escalation().await;
                        }
                    }
                }
            }
        };

        let mut status = self.status.write().await;
        match result {
            Ok(RunOutcome::Completed {
                checkpoint_id,
                stage,
            }) => {
                status.last_run_at = Some(Utc::now());
                status.consecutive_aborts = 0;
                status.abort_reason = None;
                status.last_outcome =
                    Some(format!("checkpoint {checkpoint_id} ended at {stage}"));
                drop(status);
                self.metrics.training_completed().await;
                info!("Training run ({}) produced {}", reason, checkpoint_id);
            }
            Ok(RunOutcome::Skipped { reason: skip_reason }) => {
                status.last_outcome = Some(format!("skipped: {skip_reason}"));
                drop(status);
                info!("Training run ({}) skipped: {}", reason, skip_reason);
            }
            Err(e) => {
                if status.abort_reason == Some(reason) {
                    status.consecutive_aborts += 1;
                } else {
                    status.abort_reason = Some(reason);
                    status.consecutive_aborts = 1;
                }
                status.last_outcome = Some(format!("aborted: {e}"));
                let aborts = status.consecutive_aborts;
                let escalate = aborts >= self.config.max_consecutive_aborts;
                if escalate {
                    status.escalated = true;
                }
                drop(status);

                self.metrics.training_aborted().await;
                warn!("Training run ({}) aborted: {}", reason, e);
                if escalate {
                    self.metrics.escalation().await;
                    error!(
                        "{} consecutive aborts for trigger {}; manual intervention required",
                        aborts, reason
                    );
                }
            }
        }
    }

    async fn enter_cooldown(&mut self) {
        self.set_state(EngineState::Cooldown).await;
        let jitter = 1.0 + rand::random::<f64>() * 0.25;
        let backoff = Duration::from_secs_f64(self.config.cooldown_secs as f64 * jitter);
        self.cooldown_until = Some(Instant::now() + backoff);
    }

    /// OR-combined trigger evaluation over the score store
    async fn check_triggers(&self) -> Result<Option<TriggerReason>> {
        let last_run_at = self.status.read().await.last_run_at;
        let since = last_run_at.unwrap_or(DateTime::<Utc>::MIN_UTC);

        let qualifying = self
            .store
            .qualifying_count_since(since, self.quality_cutoff, self.min_confidence)
            .await?;
        if qualifying as usize >= self.config.min_candidates {
            info!("Volume trigger fired ({} qualifying candidates)", qualifying);
            return Ok(Some(TriggerReason::Volume));
        }

        let scores = self.store.recent_scores(self.config.trend_window).await?;
        if scores.len() >= self.config.trend_window
            && trend_fires(&scores, self.config.trend_threshold)
        {
            info!("Quality-trend trigger fired");
            return Ok(Some(TriggerReason::QualityTrend));
        }

        if let Some(last) = last_run_at {
            let interval = chrono::Duration::hours(self.config.max_interval_hours as i64);
            if Utc::now() - last > interval && qualifying > 0 {
                info!("Time-bound trigger fired");
                return Ok(Some(TriggerReason::TimeBound));
            }
        }

        Ok(None)
    }
}

/// Rolling mean above threshold and rising: the newer half of the window
/// beats the older half.
fn trend_fires(scores: &[f64], threshold: f64) -> bool {
    if scores.len() < 4 {
        return false;
    }
    let mean: f64 = scores.iter().sum::<f64>() / scores.len() as f64;
    if mean <= threshold {
        return false;
    }
    let mid = scores.len() / 2;
    let older: f64 = scores[..mid].iter().sum::<f64>() / mid as f64;
    let newer: f64 = scores[mid..].iter().sum::<f64>() / (scores.len() - mid) as f64;
    newer > older
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrainingError;
    use crate::types::{ContextSnapshot, InteractionRecord, QualityComponents, QualityScore};
    use std::sync::atomic::AtomicU32;

    struct MockRunner {
        calls: AtomicU32,
        fail: bool,
        delay: Duration,
    }

    impl MockRunner {
        fn ok() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail: false,
                delay: Duration::ZERO,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail: true,
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TrainingRunner for MockRunner {
        async fn run(
            &self,
            _reason: TriggerReason,
            _since: DateTime<Utc>,
            _cancel: watch::Receiver<bool>,
        ) -> std::result::Result<RunOutcome, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                Err(TrainingError::Diverged { loss: 99.0, step: 3 }.into())
            } else {
                Ok(RunOutcome::Completed {
                    checkpoint_id: "ckpt-1".to_string(),
                    stage: DeploymentStage::Production,
                })
            }
        }
    }

    async fn seeded_store(qualifying: usize) -> Arc<RecordStore> {
        let store = Arc::new(RecordStore::in_memory().unwrap());
        for i in 0..qualifying {
            let record = InteractionRecord {
                id: format!("r{i}"),
                session_id: "s".to_string(),
                timestamp: Utc::now(),
                input: format!("implement feature {i}"),
                output: "done".to_string(),
                domain: "coding".to_string(),
                context_snapshot: ContextSnapshot::default(),
                tool_trace: vec![],
            };
            store.insert_record(&record).await.unwrap();
            store
                .save_score(
                    &record.id,
                    &QualityScore {
                        overall: 0.9,
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

    fn engine_with(
        store: Arc<RecordStore>,
        runner: Arc<MockRunner>,
        config: TriggerConfig,
        resources: Arc<ResourceMonitor>,
    ) -> (DecisionEngine, EngineHandle) {
        DecisionEngine::new(
            config,
            0.7,
            0.5,
            store,
            runner,
            resources,
            Arc::new(PipelineMetrics::with_path("/tmp/unused-metrics.json".into())),
        )
    }

    fn fast_config() -> TriggerConfig {
        TriggerConfig {
            min_candidates: 50,
            cooldown_secs: 0,
            evaluate_interval_secs: 1,
            ..TriggerConfig::default()
        }
    }

    #[test]
    fn test_trend_detection() {
        // High and rising
        assert!(trend_fires(&[0.7, 0.75, 0.8, 0.85], 0.7));
        // High but falling
        assert!(!trend_fires(&[0.9, 0.85, 0.8, 0.75], 0.7));
        // Rising but below threshold
        assert!(!trend_fires(&[0.2, 0.3, 0.4, 0.5], 0.7));
    }

    #[tokio::test]
    async fn test_volume_trigger_runs_exactly_once() {
        let store = seeded_store(60).await;
        let runner = Arc::new(MockRunner::ok());
        let (mut engine, _handle) = engine_with(
            store,
            runner.clone(),
            fast_config(),
            Arc::new(ResourceMonitor::new(1024)),
        );

        engine.cycle().await;
        assert_eq!(runner.calls(), 1);

        // The run consumed the accumulated candidates; nothing re-fires
        engine.cycle().await;
        engine.cycle().await;
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn test_below_volume_threshold_keeps_collecting() {
        let store = seeded_store(10).await;
        let runner = Arc::new(MockRunner::ok());
        let (mut engine, handle) = engine_with(
            store,
            runner.clone(),
            fast_config(),
            Arc::new(ResourceMonitor::new(1024)),
        );

        engine.cycle().await;
        assert_eq!(runner.calls(), 0);
        assert_eq!(handle.status().await.state, EngineState::Collecting);
    }

    #[tokio::test]
    async fn test_resource_check_defers_to_cooldown() {
        let store = seeded_store(60).await;
        let runner = Arc::new(MockRunner::ok());
        let resources = Arc::new(ResourceMonitor::new(8192));
        resources.set_available_memory_mb(512);

        let (mut engine, handle) = engine_with(store, runner.clone(), fast_config(), resources.clone());

        engine.cycle().await;
        assert_eq!(runner.calls(), 0);
        let status = handle.status().await;
        assert_eq!(status.state, EngineState::Cooldown);
        // Trigger stays queued for the retry
        assert!(status.pending.is_some());

        // Budget freed: the queued trigger executes on the next cycle
        resources.set_available_memory_mb(16_384);
        engine.cycle().await;
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn test_consecutive_aborts_escalate() {
        let store = seeded_store(60).await;
        let runner = Arc::new(MockRunner::failing());
        let (mut engine, handle) = engine_with(
            store,
            runner.clone(),
            fast_config(),
            Arc::new(ResourceMonitor::new(1024)),
        );

        for _ in 0..3 {
            engine.cycle().await;
        }
        assert_eq!(runner.calls(), 3);
        assert!(handle.status().await.escalated);

        // Escalated: no further automatic runs
        engine.cycle().await;
        assert_eq!(runner.calls(), 3);

        engine.clear_escalation().await;
        assert!(!handle.status().await.escalated);
    }

    #[tokio::test]
    async fn test_manual_trigger_via_pending() {
        let store = seeded_store(0).await;
        let runner = Arc::new(MockRunner::ok());
        let (mut engine, _handle) = engine_with(
            store,
            runner.clone(),
            fast_config(),
            Arc::new(ResourceMonitor::new(1024)),
        );

        engine.queue_trigger(TriggerReason::Manual).await;
        engine.cycle().await;
        assert_eq!(runner.calls(), 1);
    }
}
