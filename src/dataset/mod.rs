//! Training dataset construction
//!
//! Filters scored interactions into candidates, balances them across
//! domains and response modes, and pads under-represented domains with
//! quality-gated synthetic rehearsal examples.

pub mod builder;
pub mod rehearsal;

pub use builder::DatasetBuilder;
pub use rehearsal::RehearsalSynthesizer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One formatted training example
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExample {
    pub prompt: String,
    pub completion: String,
    pub domain: String,
    /// Whether the example exercises step-by-step reasoning rather than a
    /// direct answer
    pub reasoning_required: bool,
    /// True for rehearsal examples generated by the model itself
    pub synthetic: bool,
}

/// Provenance and distribution facts about a built dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub built_at: DateTime<Utc>,
    pub candidate_count: usize,
    pub rehearsal_count: usize,
    pub domain_distribution: HashMap<String, usize>,
    /// Quality cutoffs that were applied, per domain
    pub thresholds: HashMap<String, f64>,
}

/// A balanced, split dataset ready for the fine-tuning engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingDataset {
    pub id: String,
    pub train_examples: Vec<TrainingExample>,
    pub validation_examples: Vec<TrainingExample>,
    /// Share of reasoning examples across the whole dataset
    pub reasoning_ratio: f64,
    pub metadata: DatasetMetadata,
}

impl TrainingDataset {
    pub fn len(&self) -> usize {
        self.train_examples.len() + self.validation_examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Domains represented in this dataset
    pub fn domains(&self) -> std::collections::HashSet<String> {
        self.train_examples
            .iter()
            .chain(self.validation_examples.iter())
            .map(|e| e.domain.clone())
            .collect()
    }
}
