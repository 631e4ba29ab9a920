//! Error taxonomy for the learning pipeline
//!
//! Transient faults are retried or deferred, data faults drop the offending
//! record, training faults abort the run and return the engine to cooldown,
//! and deployment rollback failure is the single fatal class.

use std::time::Duration;
use thiserror::Error;

/// Top-level pipeline error
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Assessor timeout, resource unavailable, sidecar hiccup. Never
    /// surfaced to the caller of the ingestion API.
    #[error("transient fault: {0}")]
    Transient(String),

    /// Malformed interaction or corrupt context snapshot. The record is
    /// dropped and the pipeline continues.
    #[error("malformed interaction data: {0}")]
    Data(String),

    #[error(transparent)]
    Training(#[from] TrainingError),

    #[error(transparent)]
    Deploy(#[from] DeployError),
}

/// Failures of a fine-tuning run. Always non-fatal to the system: the run
/// is aborted, partial work discarded, and the decision engine cools down.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("wall-clock budget of {0:?} exceeded")]
    BudgetExceeded(Duration),

    #[error("optimizer diverged (loss {loss:.4} at step {step})")]
    Diverged { loss: f64, step: u64 },

    #[error("training run cancelled")]
    Cancelled,

    #[error("dataset too small: {got} examples, need at least {need}")]
    DatasetTooSmall { got: usize, need: usize },

    #[error("trainer backend failure: {0}")]
    Backend(String),
}

/// Failures in the deployment stage machine
#[derive(Debug, Error)]
pub enum DeployError {
    /// Unable to restore the prior production record. Fatal: promotions
    /// halt until manually cleared.
    #[error("rollback failed for checkpoint {checkpoint_id}: {reason}")]
    RollbackFailed {
        checkpoint_id: String,
        reason: String,
    },

    #[error("promotions halted pending manual intervention")]
    PromotionsHalted,

    #[error("unknown checkpoint {0}")]
    UnknownCheckpoint(String),

    #[error("serving layer error: {0}")]
    Serving(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_training_error_display() {
        let err = TrainingError::BudgetExceeded(Duration::from_secs(3600));
        assert!(err.to_string().contains("wall-clock budget"));

        let err = TrainingError::Diverged { loss: 12.5, step: 40 };
        assert!(err.to_string().contains("12.5"));
    }

    #[test]
    fn test_pipeline_error_from_training() {
        let err: PipelineError = TrainingError::Cancelled.into();
        assert!(matches!(err, PipelineError::Training(_)));
    }
}
