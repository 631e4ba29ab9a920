//! Shared types used across modules
//!
//! This module contains types that are used by multiple modules
//! to avoid circular dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifier handed back to the caller by the ingestion API
pub type RecordId = String;

/// One tool invocation observed during an interaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolTraceEntry {
    pub tool_name: String,
    pub success: bool,
    pub duration_ms: u64,
}

/// Situational context captured once per record.
///
/// Opaque to the recorder; only the quality assessors interpret it.
/// `metadata` may carry hints like `user_rating` (1-5) or `complexity`
/// (simple/moderate/complex) supplied by the front end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Description of the working set at interaction time
    pub working_set: Vec<String>,
    /// Recent tool outputs visible to the assistant
    pub recent_tool_outputs: Vec<String>,
    /// Free-form hints from the front end
    pub metadata: HashMap<String, String>,
}

/// One captured exchange between a user and the assistant.
///
/// Immutable once created; downstream components receive it by reference
/// and never mutate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub id: RecordId,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub input: String,
    pub output: String,
    /// Topic classification assigned at normalization time
    pub domain: String,
    pub context_snapshot: ContextSnapshot,
    pub tool_trace: Vec<ToolTraceEntry>,
}

/// Per-dimension component values of a quality assessment
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QualityComponents {
    pub user_satisfaction: f64,
    pub functional_correctness: f64,
    pub code_quality: f64,
    pub context_relevance: f64,
    pub efficiency: f64,
}

/// Normalized, multi-dimensional assessment of an interaction's output.
///
/// Cached keyed by record id; recomputed only when the assessor version
/// changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityScore {
    /// Confidence-weighted aggregate in [0, 1]
    pub overall: f64,
    pub components: QualityComponents,
    /// Mean data availability across dimensions, in [0, 1]
    pub confidence: f64,
    pub assessed_at: DateTime<Utc>,
    pub assessor_version: u32,
}

/// An interaction deemed suitable for training, paired with its score.
/// Selected, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingCandidate {
    pub record: InteractionRecord,
    pub score: QualityScore,
    pub reasoning_required: bool,
}

/// Summary metrics recorded on a checkpoint at export time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointMetrics {
    pub final_loss: f64,
    pub steps: u64,
    pub duration_secs: u64,
    pub examples_seen: u64,
}

/// A fine-tuned model version.
///
/// Checkpoints form a linear chain: each has exactly one parent, the
/// checkpoint it was fine-tuned from. Never edited after creation, only
/// superseded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCheckpoint {
    pub id: String,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub training_dataset_id: String,
    pub metrics: CheckpointMetrics,
}

impl ModelCheckpoint {
    /// Bootstrap checkpoint for a freshly installed base model
    pub fn base(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            created_at: Utc::now(),
            training_dataset_id: "bootstrap".to_string(),
            metrics: CheckpointMetrics::default(),
        }
    }
}
