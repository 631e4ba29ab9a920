//! Configuration management
//!
//! All tunable values of the pipeline live here: quality dimension weights,
//! per-domain quality thresholds, training triggers, resource budgets, and
//! rollout limits. Loaded from a TOML file and validated before use.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Quality assessment settings
    #[serde(default)]
    pub quality: QualityConfig,
    /// Candidate selection thresholds
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    /// Training trigger settings
    #[serde(default)]
    pub trigger: TriggerConfig,
    /// Dataset construction settings
    #[serde(default)]
    pub dataset: DatasetConfig,
    /// Fine-tuning settings
    #[serde(default)]
    pub training: TrainingConfig,
    /// Validation suite tolerances
    #[serde(default)]
    pub validation: ValidationConfig,
    /// Deployment and rollout settings
    #[serde(default)]
    pub deployment: DeploymentConfig,
    /// Model serving endpoints
    #[serde(default)]
    pub serving: ServingConfig,
}

/// Weights for the quality aggregation. Must sum to 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionWeights {
    #[serde(default = "default_w_user_satisfaction")]
    pub user_satisfaction: f64,
    #[serde(default = "default_w_functional_correctness")]
    pub functional_correctness: f64,
    #[serde(default = "default_w_code_quality")]
    pub code_quality: f64,
    #[serde(default = "default_w_context_relevance")]
    pub context_relevance: f64,
    #[serde(default = "default_w_efficiency")]
    pub efficiency: f64,
}

fn default_w_user_satisfaction() -> f64 {
    0.30
}

fn default_w_functional_correctness() -> f64 {
    0.25
}

fn default_w_code_quality() -> f64 {
    0.20
}

fn default_w_context_relevance() -> f64 {
    0.15
}

fn default_w_efficiency() -> f64 {
    0.10
}

impl Default for DimensionWeights {
    fn default() -> Self {
        Self {
            user_satisfaction: default_w_user_satisfaction(),
            functional_correctness: default_w_functional_correctness(),
            code_quality: default_w_code_quality(),
            context_relevance: default_w_context_relevance(),
            efficiency: default_w_efficiency(),
        }
    }
}

impl DimensionWeights {
    pub fn sum(&self) -> f64 {
        self.user_satisfaction
            + self.functional_correctness
            + self.code_quality
            + self.context_relevance
            + self.efficiency
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Aggregation weights, retunable without touching assessor code
    #[serde(default)]
    pub weights: DimensionWeights,
    /// Hard timeout for a single assessment
    #[serde(default = "default_assess_timeout_ms")]
    pub assess_timeout_ms: u64,
    /// Scores below this confidence never enter training data
    #[serde(default = "default_min_training_confidence")]
    pub min_training_confidence: f64,
}

fn default_assess_timeout_ms() -> u64 {
    500
}

fn default_min_training_confidence() -> f64 {
    0.5
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            weights: DimensionWeights::default(),
            assess_timeout_ms: default_assess_timeout_ms(),
            min_training_confidence: default_min_training_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Base quality cutoff for training candidates
    #[serde(default = "default_base_quality")]
    pub base_quality: f64,
    /// Lower clamp of the complexity-adjusted cutoff
    #[serde(default = "default_clamp_min")]
    pub clamp_min: f64,
    /// Upper clamp of the complexity-adjusted cutoff
    #[serde(default = "default_clamp_max")]
    pub clamp_max: f64,
    /// Per-domain overrides of the base cutoff
    #[serde(default)]
    pub per_domain: HashMap<String, f64>,
}

fn default_base_quality() -> f64 {
    0.70
}

fn default_clamp_min() -> f64 {
    0.50
}

fn default_clamp_max() -> f64 {
    0.95
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            base_quality: default_base_quality(),
            clamp_min: default_clamp_min(),
            clamp_max: default_clamp_max(),
            per_domain: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Volume trigger: qualifying candidates since the last run
    #[serde(default = "default_min_candidates")]
    pub min_candidates: usize,
    /// Quality-trend trigger: rolling mean must exceed this and be rising
    #[serde(default = "default_trend_threshold")]
    pub trend_threshold: f64,
    /// Number of recent scores in the rolling window
    #[serde(default = "default_trend_window")]
    pub trend_window: usize,
    /// Time-bound trigger: max hours between runs
    #[serde(default = "default_max_interval_hours")]
    pub max_interval_hours: u64,
    /// How often the decision engine evaluates triggers
    #[serde(default = "default_evaluate_interval_secs")]
    pub evaluate_interval_secs: u64,
    /// Cooldown after a completed or aborted run
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Consecutive aborts for the same trigger reason before escalating
    #[serde(default = "default_max_consecutive_aborts")]
    pub max_consecutive_aborts: u32,
}

fn default_min_candidates() -> usize {
    50
}

fn default_trend_threshold() -> f64 {
    0.75
}

fn default_trend_window() -> usize {
    20
}

fn default_max_interval_hours() -> u64 {
    24
}

fn default_evaluate_interval_secs() -> u64 {
    60
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_max_consecutive_aborts() -> u32 {
    3
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            min_candidates: default_min_candidates(),
            trend_threshold: default_trend_threshold(),
            trend_window: default_trend_window(),
            max_interval_hours: default_max_interval_hours(),
            evaluate_interval_secs: default_evaluate_interval_secs(),
            cooldown_secs: default_cooldown_secs(),
            max_consecutive_aborts: default_max_consecutive_aborts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Target share of reasoning examples in the training split
    #[serde(default = "default_reasoning_ratio")]
    pub reasoning_ratio: f64,
    /// Allowed deviation around the target ratio
    #[serde(default = "default_reasoning_ratio_band")]
    pub reasoning_ratio_band: f64,
    /// No domain may exceed this share of the batch
    #[serde(default = "default_max_domain_share")]
    pub max_domain_share: f64,
    /// Fraction of examples held out for the in-run validation batch
    #[serde(default = "default_validation_split")]
    pub validation_split: f64,
    /// Minimum examples to start a run at all
    #[serde(default = "default_min_examples")]
    pub min_examples: usize,
    /// Synthetic examples generated per under-represented domain
    #[serde(default = "default_rehearsal_per_domain")]
    pub rehearsal_per_domain: usize,
    /// Upper bound on synthetic examples per batch
    #[serde(default = "default_rehearsal_max_total")]
    pub rehearsal_max_total: usize,
    /// Domains with fewer historical records than this are not rehearsed
    #[serde(default = "default_rehearsal_history_floor")]
    pub rehearsal_history_floor: u64,
    /// Admission cutoff for synthetic examples after re-assessment
    #[serde(default = "default_rehearsal_min_quality")]
    pub rehearsal_min_quality: f64,
}

fn default_reasoning_ratio() -> f64 {
    0.75
}

fn default_reasoning_ratio_band() -> f64 {
    0.10
}

fn default_max_domain_share() -> f64 {
    0.40
}

fn default_validation_split() -> f64 {
    0.10
}

fn default_min_examples() -> usize {
    20
}

fn default_rehearsal_per_domain() -> usize {
    4
}

fn default_rehearsal_max_total() -> usize {
    16
}

fn default_rehearsal_history_floor() -> u64 {
    5
}

fn default_rehearsal_min_quality() -> f64 {
    0.5
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            reasoning_ratio: default_reasoning_ratio(),
            reasoning_ratio_band: default_reasoning_ratio_band(),
            max_domain_share: default_max_domain_share(),
            validation_split: default_validation_split(),
            min_examples: default_min_examples(),
            rehearsal_per_domain: default_rehearsal_per_domain(),
            rehearsal_max_total: default_rehearsal_max_total(),
            rehearsal_history_floor: default_rehearsal_history_floor(),
            rehearsal_min_quality: default_rehearsal_min_quality(),
        }
    }
}

/// Which trainer backend the pipeline drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainerKind {
    /// Sidecar process reached over HTTP
    Http,
    /// Deterministic in-process stand-in, for dry runs
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_trainer_kind")]
    pub backend: TrainerKind,
    /// Share of parameter groups frozen by importance, highest first
    #[serde(default = "default_freeze_quantile")]
    pub freeze_quantile: f64,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    /// Wall-clock cap; exceeding it aborts the run and discards the result
    #[serde(default = "default_wall_clock_budget_secs")]
    pub wall_clock_budget_secs: u64,
    /// Memory cap checked during RESOURCE_CHECK
    #[serde(default = "default_memory_budget_mb")]
    pub memory_budget_mb: u64,
    /// Abort when loss exceeds this multiple of the initial loss
    #[serde(default = "default_divergence_factor")]
    pub divergence_factor: f64,
}

fn default_trainer_kind() -> TrainerKind {
    TrainerKind::Http
}

fn default_freeze_quantile() -> f64 {
    0.20
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_batch_size() -> usize {
    8
}

fn default_max_steps() -> u64 {
    200
}

fn default_wall_clock_budget_secs() -> u64 {
    3600
}

fn default_memory_budget_mb() -> u64 {
    8192
}

fn default_divergence_factor() -> f64 {
    3.0
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            backend: default_trainer_kind(),
            freeze_quantile: default_freeze_quantile(),
            learning_rate: default_learning_rate(),
            batch_size: default_batch_size(),
            max_steps: default_max_steps(),
            wall_clock_budget_secs: default_wall_clock_budget_secs(),
            memory_budget_mb: default_memory_budget_mb(),
            divergence_factor: default_divergence_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Allowed accuracy regression vs the production checkpoint
    #[serde(default = "default_max_accuracy_drop")]
    pub max_accuracy_drop: f64,
    /// Allowed relative latency increase vs the production checkpoint
    #[serde(default = "default_max_latency_increase")]
    pub max_latency_increase: f64,
    /// Ceiling on the forgetting rate over untrained domains
    #[serde(default = "default_forgetting_ceiling")]
    pub forgetting_ceiling: f64,
    /// Cap on holdout examples evaluated per suite
    #[serde(default = "default_holdout_size")]
    pub holdout_size: usize,
}

fn default_max_accuracy_drop() -> f64 {
    0.02
}

fn default_max_latency_increase() -> f64 {
    0.25
}

fn default_forgetting_ceiling() -> f64 {
    0.10
}

fn default_holdout_size() -> usize {
    64
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_accuracy_drop: default_max_accuracy_drop(),
            max_latency_increase: default_max_latency_increase(),
            forgetting_ceiling: default_forgetting_ceiling(),
            holdout_size: default_holdout_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Bounded observation window for health monitoring
    #[serde(default = "default_health_window_secs")]
    pub health_window_secs: u64,
    /// Interval between health probes inside the window
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    /// Failed probes before rollback
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Old checkpoints retained for rollback depth
    #[serde(default = "default_retained_checkpoints")]
    pub retained_checkpoints: usize,
    /// Checkpoint id that seeds the registry on first start
    #[serde(default = "default_base_checkpoint_id")]
    pub base_checkpoint_id: String,
}

fn default_health_window_secs() -> u64 {
    300
}

fn default_probe_interval_secs() -> u64 {
    10
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_retained_checkpoints() -> usize {
    5
}

fn default_base_checkpoint_id() -> String {
    "base".to_string()
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            health_window_secs: default_health_window_secs(),
            probe_interval_secs: default_probe_interval_secs(),
            failure_threshold: default_failure_threshold(),
            retained_checkpoints: default_retained_checkpoints(),
            base_checkpoint_id: default_base_checkpoint_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServingConfig {
    /// OpenAI-compatible inference endpoint of the serving layer
    #[serde(default = "default_serving_url")]
    pub base_url: String,
    /// Trainer sidecar endpoint
    #[serde(default = "default_trainer_url")]
    pub trainer_url: String,
    /// Environment variable holding the API key, if the endpoint needs one
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_serving_url() -> String {
    "http://127.0.0.1:8080/v1".to_string()
}

fn default_trainer_url() -> String {
    "http://127.0.0.1:8090".to_string()
}

fn default_api_key_env() -> String {
    "LIFELONG_SERVING_KEY".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            base_url: default_serving_url(),
            trainer_url: default_trainer_url(),
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Config {
    /// Load configuration from file, writing defaults on first run
    pub fn load() -> Result<Self> {
        let config_path = config_path()?;

        let config = if config_path.exists() {
            let contents =
                std::fs::read_to_string(&config_path).context("Failed to read config file")?;
            toml::from_str::<Config>(&contents).context("Failed to parse config file")?
        } else {
            let config = Config::default();
            config.save()?;
            config
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = config_path()?;
        let parent = config_path.parent().context("Config path has no parent")?;

        std::fs::create_dir_all(parent).context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Reject configurations that would violate pipeline invariants
    pub fn validate(&self) -> Result<()> {
        let weight_sum = self.quality.weights.sum();
        if (weight_sum - 1.0).abs() > 1e-6 {
            anyhow::bail!("quality weights must sum to 1.0, got {weight_sum}");
        }
        if !(0.0..=1.0).contains(&self.thresholds.clamp_min)
            || !(0.0..=1.0).contains(&self.thresholds.clamp_max)
            || self.thresholds.clamp_min > self.thresholds.clamp_max
        {
            anyhow::bail!(
                "threshold clamp band [{}, {}] is invalid",
                self.thresholds.clamp_min,
                self.thresholds.clamp_max
            );
        }
        if !(0.0..1.0).contains(&self.dataset.reasoning_ratio)
            || self.dataset.reasoning_ratio_band <= 0.0
        {
            anyhow::bail!("reasoning ratio target/band is invalid");
        }
        if !(0.0..0.5).contains(&self.dataset.validation_split) {
            anyhow::bail!(
                "validation split {} must be in [0, 0.5)",
                self.dataset.validation_split
            );
        }
        if !(0.0..1.0).contains(&self.training.freeze_quantile) {
            anyhow::bail!(
                "freeze quantile {} must be in [0, 1)",
                self.training.freeze_quantile
            );
        }
        if self.dataset.max_domain_share <= 0.0 || self.dataset.max_domain_share > 1.0 {
            anyhow::bail!("max domain share must be in (0, 1]");
        }
        if self.deployment.failure_threshold == 0 || self.deployment.health_window_secs == 0 {
            anyhow::bail!("health check window and failure threshold must be non-zero");
        }
        if self.validation.forgetting_ceiling <= 0.0 {
            anyhow::bail!("forgetting ceiling must be positive");
        }
        Ok(())
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "lifelong", "lifelong")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "lifelong", "lifelong")
        .context("Failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}

/// Get default configuration as TOML string
pub fn default_config_toml() -> String {
    toml::to_string_pretty(&Config::default())
        .unwrap_or_else(|_| "# Default configuration\n".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        let weights = DimensionWeights::default();
        assert!((weights.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_bad_weights_rejected() {
        let mut config = Config::default();
        config.quality.weights.efficiency = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_clamp_rejected() {
        let mut config = Config::default();
        config.thresholds.clamp_min = 0.9;
        config.thresholds.clamp_max = 0.6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_toml_roundtrip() {
        let toml_str = default_config_toml();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.trigger.min_candidates, 50);
        assert_eq!(parsed.training.backend, TrainerKind::Http);
    }
}
