//! Quality assessment engine
//!
//! Scores each interaction along five independent dimensions and
//! aggregates them into a single confidence-weighted score. Runs off the
//! critical path under a hard timeout; a timed-out or failed assessment
//! degrades to a low-confidence fallback instead of an error.

pub mod dimensions;

pub use dimensions::{Dimension, DimensionScore, NEUTRAL_VALUE};

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{DimensionWeights, QualityConfig};
use crate::metrics::PipelineMetrics;
use crate::recorder::store::RecordStore;
use crate::types::{InteractionRecord, QualityComponents, QualityScore};

/// Bumped whenever an assessor heuristic changes; cached scores from older
/// versions are recomputed.
pub const ASSESSOR_VERSION: u32 = 1;

/// Ceiling on the confidence of a fallback score
const FALLBACK_CONFIDENCE: f64 = 0.2;

/// Pure aggregation over dimension outputs: a fixed weighted sum of
/// values, with confidence as the mean availability.
pub fn aggregate(
    scores: &[(Dimension, DimensionScore)],
    weights: &DimensionWeights,
) -> QualityScore {
    let mut components = QualityComponents::default();
    let mut overall = 0.0;
    let mut availability_sum = 0.0;

    for (dimension, score) in scores {
        let weight = match dimension {
            Dimension::UserSatisfaction => {
                components.user_satisfaction = score.value;
                weights.user_satisfaction
            }
            Dimension::FunctionalCorrectness => {
                components.functional_correctness = score.value;
                weights.functional_correctness
            }
            Dimension::CodeQuality => {
                components.code_quality = score.value;
                weights.code_quality
            }
            Dimension::ContextRelevance => {
                components.context_relevance = score.value;
                weights.context_relevance
            }
            Dimension::Efficiency => {
                components.efficiency = score.value;
                weights.efficiency
            }
        };
        overall += weight * score.value;
        availability_sum += score.availability;
    }

    let confidence = if scores.is_empty() {
        0.0
    } else {
        availability_sum / scores.len() as f64
    };

    QualityScore {
        overall: overall.clamp(0.0, 1.0),
        components,
        confidence: confidence.clamp(0.0, 1.0),
        assessed_at: Utc::now(),
        assessor_version: ASSESSOR_VERSION,
    }
}

/// Asynchronous scorer shared by the recorder worker and the rehearsal
/// synthesizer
pub struct QualityEngine {
    weights: DimensionWeights,
    timeout: Duration,
    store: Arc<RecordStore>,
    metrics: Arc<PipelineMetrics>,
}

impl QualityEngine {
    pub fn new(
        config: &QualityConfig,
        store: Arc<RecordStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            weights: config.weights.clone(),
            timeout: Duration::from_millis(config.assess_timeout_ms),
            store,
            metrics,
        }
    }

    /// Score a record. Never fails: timeout and assessor breakage both
    /// degrade to the low-confidence fallback.
    pub async fn assess(&self, record: &InteractionRecord) -> QualityScore {
        match timeout(self.timeout, run_assessors(record)).await {
            Ok(scores) => aggregate(&scores, &self.weights),
            Err(_) => {
                warn!("Quality assessment timed out for record {}", record.id);
                self.metrics.assessment_fallback().await;
                fallback_score()
            }
        }
    }

    /// Score a record and cache the result keyed by record id. Cached
    /// scores are reused unless the assessor version moved on.
    pub async fn assess_and_store(&self, record: &InteractionRecord) -> Result<QualityScore> {
        if let Some(cached) = self.store.cached_score(&record.id, ASSESSOR_VERSION).await? {
            debug!("Score cache hit for record {}", record.id);
            return Ok(cached);
        }

        let score = self.assess(record).await;
        self.store.save_score(&record.id, &score).await?;
        self.metrics.assessment_completed().await;
        Ok(score)
    }
}

async fn run_assessors(record: &InteractionRecord) -> Vec<(Dimension, DimensionScore)> {
    // Five independent assessors over the same record
    let futures = Dimension::ALL
        .iter()
        .map(|dimension| async move { (*dimension, dimension.assess(record)) });
    futures::future::join_all(futures).await
}

/// Low-confidence stand-in emitted when assessment cannot complete.
/// Excluded from training by the confidence filter, but never lost.
pub fn fallback_score() -> QualityScore {
    QualityScore {
        overall: NEUTRAL_VALUE,
        components: QualityComponents {
            user_satisfaction: NEUTRAL_VALUE,
            functional_correctness: NEUTRAL_VALUE,
            code_quality: NEUTRAL_VALUE,
            context_relevance: NEUTRAL_VALUE,
            efficiency: NEUTRAL_VALUE,
        },
        confidence: FALLBACK_CONFIDENCE,
        assessed_at: Utc::now(),
        assessor_version: ASSESSOR_VERSION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContextSnapshot;

    fn record_with(input: &str, output: &str) -> InteractionRecord {
        InteractionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: "s1".to_string(),
            timestamp: Utc::now(),
            input: input.to_string(),
            output: output.to_string(),
            domain: "general".to_string(),
            context_snapshot: ContextSnapshot::default(),
            tool_trace: vec![],
        }
    }

    fn engine() -> QualityEngine {
        QualityEngine::new(
            &QualityConfig::default(),
            Arc::new(RecordStore::in_memory().unwrap()),
            Arc::new(PipelineMetrics::with_path("/tmp/unused-metrics.json".into())),
        )
    }

    #[test]
    fn test_aggregate_is_weighted_sum() {
        let weights = DimensionWeights::default();
        let scores: Vec<_> = Dimension::ALL
            .iter()
            .map(|d| {
                (
                    *d,
                    DimensionScore {
                        value: 0.8,
                        availability: 0.5,
                    },
                )
            })
            .collect();

        let result = aggregate(&scores, &weights);
        // All components equal, so the weighted sum collapses to the value
        assert!((result.overall - 0.8).abs() < 1e-9);
        assert!((result.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_stays_in_unit_interval() {
        let weights = DimensionWeights::default();
        for value in [0.0, 0.33, 1.0] {
            let scores: Vec<_> = Dimension::ALL
                .iter()
                .map(|d| {
                    (
                        *d,
                        DimensionScore {
                            value,
                            availability: 1.0,
                        },
                    )
                })
                .collect();
            let result = aggregate(&scores, &weights);
            assert!((0.0..=1.0).contains(&result.overall));
            let expected: f64 = value * weights.sum();
            assert!((result.overall - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_fallback_score_is_low_confidence() {
        let score = fallback_score();
        assert!(score.confidence <= 0.3);
        assert_eq!(score.overall, NEUTRAL_VALUE);
    }

    #[tokio::test]
    async fn test_assess_produces_bounded_score() {
        let engine = engine();
        let record = record_with(
            "why does the parser reject nested arrays?",
            "the parser rejects nested arrays because depth is capped",
        );
        let score = engine.assess(&record).await;
        assert!((0.0..=1.0).contains(&score.overall));
        assert!((0.0..=1.0).contains(&score.confidence));
    }

    #[tokio::test]
    async fn test_assess_and_store_caches() {
        let store = Arc::new(RecordStore::in_memory().unwrap());
        let engine = QualityEngine::new(
            &QualityConfig::default(),
            store.clone(),
            Arc::new(PipelineMetrics::with_path("/tmp/unused-metrics.json".into())),
        );

        let record = record_with("explain the retry loop", "it retries with backoff");
        store.insert_record(&record).await.unwrap();

        let first = engine.assess_and_store(&record).await.unwrap();
        let second = engine.assess_and_store(&record).await.unwrap();
        assert_eq!(first.assessed_at, second.assessed_at);
    }
}
