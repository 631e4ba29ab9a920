//! Candidate selection and dataset assembly

use anyhow::{bail, Result};
use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::{DatasetMetadata, TrainingDataset, TrainingExample};
use crate::config::{DatasetConfig, ThresholdConfig};
use crate::types::{InteractionRecord, QualityScore, TrainingCandidate};

/// Markers in the user input that call for step-by-step reasoning
const REASONING_MARKERS: &[&str] = &[
    "why",
    "explain",
    "debug",
    "how does",
    "how do",
    "walk me through",
    "step by step",
    "diagnose",
    "compare",
    "trade-off",
];

/// Inputs longer than this are treated as reasoning work regardless of
/// phrasing
const REASONING_LENGTH_WORDS: usize = 40;

/// Rough task complexity, used to shift the quality cutoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

/// Estimate complexity from the record itself; an explicit tag from the
/// front end wins.
pub fn estimate_complexity(record: &InteractionRecord) -> Complexity {
    if let Some(tag) = record.context_snapshot.metadata.get("complexity") {
        match tag.as_str() {
            "simple" => return Complexity::Simple,
            "complex" => return Complexity::Complex,
            _ => {}
        }
    }

    let mut points = 0;
    if record.input.split_whitespace().count() > 60 {
        points += 1;
    }
    if record.tool_trace.len() >= 3 {
        points += 1;
    }
    if record.output.contains("```") {
        points += 1;
    }
    if record.context_snapshot.working_set.len() > 4 {
        points += 1;
    }

    match points {
        0 => Complexity::Simple,
        1 | 2 => Complexity::Moderate,
        _ => Complexity::Complex,
    }
}

/// Does this record exercise reasoning rather than a direct answer?
pub fn requires_reasoning(record: &InteractionRecord) -> bool {
    let input_lower = record.input.to_lowercase();
    if REASONING_MARKERS.iter().any(|m| input_lower.contains(m)) {
        return true;
    }
    if record.input.split_whitespace().count() > REASONING_LENGTH_WORDS {
        return true;
    }
    if estimate_complexity(record) == Complexity::Complex {
        return true;
    }
    record.context_snapshot.working_set.len() > 4
}

/// An example plus the quality it was admitted with, used for ordering
/// when the builder has to downsample.
#[derive(Debug, Clone)]
struct Weighted {
    example: TrainingExample,
    quality: f64,
}

/// Builds balanced training datasets out of scored interactions
pub struct DatasetBuilder {
    thresholds: ThresholdConfig,
    config: DatasetConfig,
    min_confidence: f64,
}

impl DatasetBuilder {
    pub fn new(thresholds: ThresholdConfig, config: DatasetConfig, min_confidence: f64) -> Self {
        Self {
            thresholds,
            config,
            min_confidence,
        }
    }

    /// Quality cutoff for one record: per-domain base, shifted by task
    /// complexity, clamped to the configured band.
    pub fn threshold_for(&self, record: &InteractionRecord) -> f64 {
        let base = self
            .thresholds
            .per_domain
            .get(&record.domain)
            .copied()
            .unwrap_or(self.thresholds.base_quality);

        let adjusted = match estimate_complexity(record) {
            Complexity::Simple => base - 0.05,
            Complexity::Moderate => base,
            Complexity::Complex => base + 0.05,
        };

        adjusted.clamp(self.thresholds.clamp_min, self.thresholds.clamp_max)
    }

    /// Filter a scored pool down to training candidates
    pub fn select_candidates(
        &self,
        pool: Vec<(InteractionRecord, QualityScore)>,
    ) -> Vec<TrainingCandidate> {
        pool.into_iter()
            .filter(|(record, score)| {
                score.confidence >= self.min_confidence
                    && score.overall >= self.threshold_for(record)
            })
            .map(|(record, score)| TrainingCandidate {
                reasoning_required: requires_reasoning(&record),
                record,
                score,
            })
            .collect()
    }

    /// Assemble a dataset from candidates plus quality-gated rehearsal
    /// examples
    pub fn build(
        &self,
        candidates: Vec<TrainingCandidate>,
        rehearsal: Vec<(TrainingExample, f64)>,
    ) -> Result<TrainingDataset> {
        if candidates.is_empty() && rehearsal.is_empty() {
            bail!("no examples to build a dataset from");
        }

        let candidate_count = candidates.len();
        let rehearsal_count = rehearsal.len();

        let mut thresholds: HashMap<String, f64> = HashMap::new();
        let mut pool: Vec<Weighted> = Vec::with_capacity(candidate_count + rehearsal_count);

        for candidate in candidates {
            thresholds
                .entry(candidate.record.domain.clone())
                .or_insert_with(|| self.threshold_for(&candidate.record));
            pool.push(Weighted {
                quality: candidate.score.overall,
                example: format_example(&candidate),
            });
        }
        for (example, quality) in rehearsal {
            pool.push(Weighted { example, quality });
        }

        self.balance_domains(&mut pool);
        self.enforce_reasoning_band(&mut pool);

        let (train_examples, validation_examples) = self.split(pool);

        let total = train_examples.len() + validation_examples.len();
        let reasoning_total = train_examples
            .iter()
            .chain(validation_examples.iter())
            .filter(|e| e.reasoning_required)
            .count();
        let reasoning_ratio = reasoning_total as f64 / total as f64;

        let mut domain_distribution: HashMap<String, usize> = HashMap::new();
        for example in train_examples.iter().chain(validation_examples.iter()) {
            *domain_distribution.entry(example.domain.clone()).or_insert(0) += 1;
        }

        let dataset = TrainingDataset {
            id: Uuid::new_v4().to_string(),
            train_examples,
            validation_examples,
            reasoning_ratio,
            metadata: DatasetMetadata {
                built_at: Utc::now(),
                candidate_count,
                rehearsal_count,
                domain_distribution,
                thresholds,
            },
        };

        info!(
            "Built dataset {} with {} examples (reasoning ratio {:.2})",
            dataset.id,
            dataset.len(),
            dataset.reasoning_ratio
        );
        Ok(dataset)
    }

    /// Cap every domain at the configured share of the batch, keeping the
    /// highest-quality examples.
    fn balance_domains(&self, pool: &mut Vec<Weighted>) {
        let cap = ((pool.len() as f64 * self.config.max_domain_share).ceil() as usize).max(1);

        let mut by_domain: HashMap<String, Vec<Weighted>> = HashMap::new();
        for weighted in pool.drain(..) {
            by_domain
                .entry(weighted.example.domain.clone())
                .or_default()
                .push(weighted);
        }

        let mut domains: Vec<_> = by_domain.into_iter().collect();
        domains.sort_by(|a, b| a.0.cmp(&b.0));

        for (domain, mut group) in domains {
            if group.len() > cap {
                group.sort_by(|a, b| {
                    b.quality
                        .partial_cmp(&a.quality)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                debug!(
                    "Domain {} capped at {} of {} examples",
                    domain,
                    cap,
                    group.len()
                );
                group.truncate(cap);
            }
            pool.extend(group);
        }
    }

    /// Keep the reasoning/direct split inside the configured band by
    /// downsampling the overrepresented class, lowest quality first. Only
    /// applies when both classes are present.
    fn enforce_reasoning_band(&self, pool: &mut Vec<Weighted>) {
        let target = self.config.reasoning_ratio;
        let band = self.config.reasoning_ratio_band;

        let (mut reasoning, mut direct): (Vec<Weighted>, Vec<Weighted>) = pool
            .drain(..)
            .partition(|w| w.example.reasoning_required);

        if !reasoning.is_empty() && !direct.is_empty() {
            let ratio = reasoning.len() as f64 / (reasoning.len() + direct.len()) as f64;

            if ratio > target + band {
                let keep = ((direct.len() as f64 * target / (1.0 - target)).round() as usize).max(1);
                sort_by_quality(&mut reasoning);
                reasoning.truncate(keep);
            } else if ratio < target - band {
                let keep =
                    ((reasoning.len() as f64 * (1.0 - target) / target).round() as usize).max(1);
                sort_by_quality(&mut direct);
                direct.truncate(keep);
            }
        }

        pool.extend(reasoning);
        pool.extend(direct);
    }

    /// Split off the in-run validation batch, stratified by response mode
    /// so both splits keep the balanced ratio.
    fn split(&self, pool: Vec<Weighted>) -> (Vec<TrainingExample>, Vec<TrainingExample>) {
        let stride = if self.config.validation_split > 0.0 {
            ((1.0 / self.config.validation_split).round() as usize).max(2)
        } else {
            usize::MAX
        };

        let (reasoning, direct): (Vec<Weighted>, Vec<Weighted>) =
            pool.into_iter().partition(|w| w.example.reasoning_required);

        let mut train = Vec::new();
        let mut validation = Vec::new();
        for class in [reasoning, direct] {
            for (i, weighted) in class.into_iter().enumerate() {
                if stride != usize::MAX && i % stride == stride - 1 {
                    validation.push(weighted.example);
                } else {
                    train.push(weighted.example);
                }
            }
        }
        (train, validation)
    }
}

fn sort_by_quality(group: &mut [Weighted]) {
    group.sort_by(|a, b| {
        b.quality
            .partial_cmp(&a.quality)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn format_example(candidate: &TrainingCandidate) -> TrainingExample {
    render_example(&candidate.record, candidate.reasoning_required)
}

/// Render a record into prompt/completion form
pub fn render_example(record: &InteractionRecord, reasoning_required: bool) -> TrainingExample {
    let prompt = if record.context_snapshot.working_set.is_empty() {
        record.input.clone()
    } else {
        format!(
            "Context:\n{}\n\nUser: {}",
            record
                .context_snapshot
                .working_set
                .iter()
                .map(|w| format!("- {w}"))
                .collect::<Vec<_>>()
                .join("\n"),
            record.input
        )
    };

    TrainingExample {
        prompt,
        completion: record.output.clone(),
        domain: record.domain.clone(),
        reasoning_required,
        synthetic: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContextSnapshot, QualityComponents};
    use chrono::Utc;

    fn record(id: &str, domain: &str, input: &str) -> InteractionRecord {
        InteractionRecord {
            id: id.to_string(),
            session_id: "s1".to_string(),
            timestamp: Utc::now(),
            input: input.to_string(),
            output: "an answer".to_string(),
            domain: domain.to_string(),
            context_snapshot: ContextSnapshot::default(),
            tool_trace: vec![],
        }
    }

    fn score(overall: f64, confidence: f64) -> QualityScore {
        QualityScore {
            overall,
            components: QualityComponents::default(),
            confidence,
            assessed_at: Utc::now(),
            assessor_version: 1,
        }
    }

    fn builder() -> DatasetBuilder {
        DatasetBuilder::new(ThresholdConfig::default(), DatasetConfig::default(), 0.5)
    }

    fn candidate(id: &str, domain: &str, reasoning: bool, quality: f64) -> TrainingCandidate {
        let input = if reasoning {
            "explain why the build fails"
        } else {
            "list the files"
        };
        TrainingCandidate {
            record: record(id, domain, input),
            score: score(quality, 0.9),
            reasoning_required: reasoning,
        }
    }

    #[test]
    fn test_threshold_clamped_to_band() {
        let mut thresholds = ThresholdConfig::default();
        thresholds.per_domain.insert("coding".to_string(), 0.96);
        let builder = DatasetBuilder::new(thresholds, DatasetConfig::default(), 0.5);

        let cutoff = builder.threshold_for(&record("r", "coding", "short ask"));
        assert!(cutoff <= 0.95);
        assert!(cutoff >= 0.50);
    }

    #[test]
    fn test_low_confidence_excluded() {
        let builder = builder();
        let pool = vec![
            (record("a", "coding", "implement a parser"), score(0.9, 0.9)),
            (record("b", "coding", "implement a lexer"), score(0.9, 0.2)),
        ];
        let candidates = builder.select_candidates(pool);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].record.id, "a");
    }

    #[test]
    fn test_reasoning_classification() {
        assert!(requires_reasoning(&record("r", "g", "explain why this fails")));
        assert!(!requires_reasoning(&record("r", "g", "list open ports")));
    }

    #[test]
    fn test_reasoning_ratio_within_band() {
        let builder = builder();
        // Heavily skewed towards direct answers
        let mut candidates = Vec::new();
        for i in 0..10 {
            candidates.push(candidate(&format!("r{i}"), "coding", true, 0.8));
        }
        for i in 0..30 {
            candidates.push(candidate(&format!("d{i}"), "writing", false, 0.8));
        }

        let dataset = builder.build(candidates, vec![]).unwrap();
        let config = DatasetConfig::default();
        assert!(
            (dataset.reasoning_ratio - config.reasoning_ratio).abs()
                <= config.reasoning_ratio_band + 0.05,
            "ratio {} out of band",
            dataset.reasoning_ratio
        );
    }

    #[test]
    fn test_single_class_pool_left_alone() {
        let builder = builder();
        let candidates: Vec<_> = (0..10)
            .map(|i| candidate(&format!("r{i}"), "coding", true, 0.8))
            .collect();
        let dataset = builder.build(candidates, vec![]).unwrap();
        assert_eq!(dataset.reasoning_ratio, 1.0);
        assert_eq!(dataset.len(), 10);
    }

    #[test]
    fn test_domain_cap_applies() {
        let builder = builder();
        let mut candidates = Vec::new();
        for i in 0..40 {
            candidates.push(candidate(&format!("c{i}"), "coding", true, 0.9));
        }
        for i in 0..5 {
            candidates.push(candidate(&format!("w{i}"), "writing", true, 0.7));
        }

        let dataset = builder.build(candidates, vec![]).unwrap();
        let coding = dataset
            .metadata
            .domain_distribution
            .get("coding")
            .copied()
            .unwrap_or(0);
        let cap = ((45.0 * DatasetConfig::default().max_domain_share).ceil()) as usize;
        assert!(coding <= cap, "coding kept {coding} of cap {cap}");
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(builder().build(vec![], vec![]).is_err());
    }

    #[test]
    fn test_split_produces_validation_batch() {
        let builder = builder();
        let candidates: Vec<_> = (0..40)
            .map(|i| {
                let domain = if i % 2 == 0 { "coding" } else { "writing" };
                candidate(&format!("r{i}"), domain, i % 4 != 0, 0.8)
            })
            .collect();
        let dataset = builder.build(candidates, vec![]).unwrap();
        assert!(!dataset.validation_examples.is_empty());
        assert!(dataset.train_examples.len() > dataset.validation_examples.len());
    }
}
