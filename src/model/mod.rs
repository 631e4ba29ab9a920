//! Model serving boundary
//!
//! The pipeline treats inference and deployment control as black-box RPC
//! calls against the serving layer. These traits are all the rest of the
//! system knows about it.

pub mod client;

pub use client::{HttpModelClient, ServingEndpoint};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A single inference result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub latency_ms: u64,
    pub tokens: u32,
}

/// Inference against one specific checkpoint
#[async_trait]
pub trait ModelHandle: Send + Sync {
    /// Checkpoint id this handle generates with
    fn checkpoint_id(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<Generation>;
}

/// Deploy/rollback operations exposed by the serving layer
#[async_trait]
pub trait ServingControl: Send + Sync {
    /// Make a checkpoint loadable for staged traffic
    async fn stage(&self, checkpoint_id: &str) -> Result<()>;

    /// Switch live traffic to a checkpoint
    async fn activate(&self, checkpoint_id: &str) -> Result<()>;

    /// Liveness of a loaded checkpoint
    async fn health(&self, checkpoint_id: &str) -> Result<bool>;

    /// Inference handle bound to a checkpoint
    fn handle_for(&self, checkpoint_id: &str) -> Arc<dyn ModelHandle>;
}
