//! Interaction recorder
//!
//! Normalizes raw interactions into immutable records and persists them
//! without blocking the caller. Learning must never break the live
//! assistant: the ingestion call always succeeds from the caller's
//! perspective, and internal failures drop the event after one bounded
//! retry.

pub mod store;

pub use store::RecordStore;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics::PipelineMetrics;
use crate::quality::QualityEngine;
use crate::types::{ContextSnapshot, InteractionRecord, RecordId, ToolTraceEntry};

/// Context snapshots above this serialized size are treated as corrupt
const MAX_SNAPSHOT_BYTES: usize = 64 * 1024;

/// Delay before the single persist retry
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Keyword tables for domain classification at normalization time
const DOMAIN_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "debugging",
        &["debug", "stack trace", "panic", "crash", "why does", "fails"],
    ),
    (
        "coding",
        &["implement", "function", "refactor", "write a", "code", "compile"],
    ),
    (
        "shell",
        &["command", "terminal", "bash", "script", "install", "run"],
    ),
    (
        "writing",
        &["draft", "rewrite", "summarize", "email", "document", "essay"],
    ),
    (
        "research",
        &["compare", "what is", "look up", "find out", "explain the difference"],
    ),
    (
        "data",
        &["csv", "dataset", "query", "sql", "parse", "json"],
    ),
];

/// Classify an interaction into a topic domain
pub fn classify_domain(input: &str) -> String {
    let input_lower = input.to_lowercase();
    for (domain, keywords) in DOMAIN_KEYWORDS {
        if keywords.iter().any(|k| input_lower.contains(k)) {
            return domain.to_string();
        }
    }
    "general".to_string()
}

/// A raw interaction as handed over by the front end
#[derive(Debug, Clone)]
pub struct RawInteraction {
    pub session_id: String,
    pub input: String,
    pub output: String,
    pub context: ContextSnapshot,
    pub tool_trace: Vec<ToolTraceEntry>,
}

/// Fire-and-forget ingestion front door.
///
/// `record()` assembles the immutable record and enqueues it; persistence
/// and assessment happen on a worker task.
#[derive(Clone)]
pub struct InteractionRecorder {
    tx: mpsc::UnboundedSender<InteractionRecord>,
}

impl InteractionRecorder {
    /// Start the recorder worker and return the ingestion handle
    pub fn start(
        store: Arc<RecordStore>,
        quality: Arc<QualityEngine>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker_loop(rx, store, quality, metrics));
        Self { tx }
    }

    /// Ingest one interaction. Always succeeds from the caller's
    /// perspective and returns well under the 5 ms latency budget.
    pub fn record(&self, raw: RawInteraction) -> RecordId {
        let id = Uuid::new_v4().to_string();
        let record = InteractionRecord {
            id: id.clone(),
            session_id: raw.session_id,
            timestamp: Utc::now(),
            domain: classify_domain(&raw.input),
            input: raw.input,
            output: raw.output,
            context_snapshot: raw.context,
            tool_trace: raw.tool_trace,
        };

        if self.tx.send(record).is_err() {
            // Worker is gone; the caller still gets an id and moves on
            warn!("Recorder worker unavailable, interaction dropped");
        }
        id
    }
}

async fn worker_loop(
    mut rx: mpsc::UnboundedReceiver<InteractionRecord>,
    store: Arc<RecordStore>,
    quality: Arc<QualityEngine>,
    metrics: Arc<PipelineMetrics>,
) {
    while let Some(record) = rx.recv().await {
        if let Err(reason) = validate(&record) {
            warn!("Dropping malformed interaction {}: {}", record.id, reason);
            metrics.record_dropped().await;
            continue;
        }

        // One bounded retry, then the event is gone
        let mut persisted = store.insert_record(&record).await;
        if persisted.is_err() {
            tokio::time::sleep(RETRY_DELAY).await;
            persisted = store.insert_record(&record).await;
        }

        match persisted {
            Ok(()) => {
                metrics.record_ingested().await;
                debug!("Persisted interaction {} ({})", record.id, record.domain);

                // Assessment runs on its own short-lived task, isolated
                // from ingestion
                let quality = quality.clone();
                tokio::spawn(async move {
                    if let Err(e) = quality.assess_and_store(&record).await {
                        warn!("Assessment failed for record {}: {}", record.id, e);
                    }
                });
            }
            Err(e) => {
                warn!("Dropping interaction {} after retry: {}", record.id, e);
                metrics.record_dropped().await;
            }
        }
    }
}

fn validate(record: &InteractionRecord) -> Result<(), String> {
    if record.input.trim().is_empty() {
        return Err("empty input".to_string());
    }
    if record.output.trim().is_empty() {
        return Err("empty output".to_string());
    }
    let snapshot_size = serde_json::to_string(&record.context_snapshot)
        .map(|s| s.len())
        .map_err(|e| format!("unserializable context snapshot: {e}"))?;
    if snapshot_size > MAX_SNAPSHOT_BYTES {
        return Err(format!("context snapshot too large: {snapshot_size} bytes"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualityConfig;
    use std::time::Instant;

    fn recorder_with_store() -> (InteractionRecorder, Arc<RecordStore>) {
        let store = Arc::new(RecordStore::in_memory().unwrap());
        let metrics = Arc::new(PipelineMetrics::with_path("/tmp/unused-metrics.json".into()));
        let quality = Arc::new(QualityEngine::new(
            &QualityConfig::default(),
            store.clone(),
            metrics.clone(),
        ));
        let recorder = InteractionRecorder::start(store.clone(), quality, metrics);
        (recorder, store)
    }

    fn raw(input: &str, output: &str) -> RawInteraction {
        RawInteraction {
            session_id: "s1".to_string(),
            input: input.to_string(),
            output: output.to_string(),
            context: ContextSnapshot::default(),
            tool_trace: vec![],
        }
    }

    #[test]
    fn test_classify_domain() {
        assert_eq!(classify_domain("why does this panic on startup?"), "debugging");
        assert_eq!(classify_domain("implement a parser for ini files"), "coding");
        assert_eq!(classify_domain("draft an email to the team"), "writing");
        assert_eq!(classify_domain("hello there"), "general");
    }

    #[tokio::test]
    async fn test_record_persists_eventually() {
        let (recorder, store) = recorder_with_store();
        let id = recorder.record(raw("implement a queue", "use VecDeque"));

        // Fire-and-forget: give the worker a moment
        for _ in 0..50 {
            if store.get_record(&id).await.unwrap().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("record {id} never persisted");
    }

    #[tokio::test]
    async fn test_record_returns_within_latency_budget() {
        let (recorder, _store) = recorder_with_store();

        let started = Instant::now();
        for _ in 0..100 {
            recorder.record(raw("quick question", "quick answer"));
        }
        let per_call = started.elapsed() / 100;
        assert!(
            per_call < Duration::from_millis(5),
            "record() took {per_call:?} per call"
        );
    }

    #[tokio::test]
    async fn test_malformed_interaction_dropped() {
        let (recorder, store) = recorder_with_store();
        let id = recorder.record(raw("", ""));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.get_record(&id).await.unwrap().is_none());
    }
}
