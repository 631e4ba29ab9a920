//! Lifelong - Quality-Driven Continuous Learning Pipeline
//!
//! Turns a stream of live assistant interactions into periodic, safely
//! deployed improvements to a locally hosted model:
//! - Non-blocking interaction capture with multi-dimensional quality scoring
//! - A trigger engine that decides when accumulated data is worth training on
//! - Dataset balancing with rehearsal synthesis against forgetting
//! - Parameter-efficient fine-tuning behind a pluggable trainer backend
//! - Validation suites and staged deployment with automatic rollback
//!
//! # Example
//!
//! ```ignore
//! use lifelong::recorder::RawInteraction;
//! use lifelong::types::ContextSnapshot;
//!
//! let id = pipeline.record(RawInteraction {
//!     session_id: "repl".to_string(),
//!     input: "why does the build fail?".to_string(),
//!     output: "the linker is missing libssl".to_string(),
//!     context: ContextSnapshot::default(),
//!     tool_trace: vec![],
//! });
//! println!("captured {id}");
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod error;
pub mod config;
pub mod metrics;
pub mod model;
pub mod recorder; // Must come before quality since quality reads its store
pub mod quality;
pub mod dataset;
pub mod training;
pub mod validation;
pub mod deploy;
pub mod trigger;
pub mod pipeline;
pub mod cli;

// Re-export commonly used types for convenience
pub use config::Config;
pub use error::{DeployError, PipelineError, TrainingError};
pub use pipeline::LearningPipeline;
pub use recorder::{InteractionRecorder, RawInteraction, RecordStore};
pub use types::{
    InteractionRecord,
    ModelCheckpoint,
    QualityScore,
    TrainingCandidate,
};

pub use deploy::{DeploymentManager, DeploymentStage, ModelRegistry};
pub use trigger::{EngineHandle, EngineState, TriggerReason};
pub use validation::ValidationResult;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - Continuous Learning Pipeline", NAME, VERSION)
}
