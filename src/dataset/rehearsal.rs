//! Rehearsal synthesis
//!
//! Generates synthetic examples for domains that are well represented in
//! history but scarce in the current batch, so a batch skewed toward
//! recent topics does not erode older competence. Every synthetic example
//! passes through the same quality assessor before admission; a failing
//! one is discarded, never force-included.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::builder::requires_reasoning;
use super::TrainingExample;
use crate::config::DatasetConfig;
use crate::model::ModelHandle;
use crate::quality::QualityEngine;
use crate::recorder::store::RecordStore;
use crate::types::{ContextSnapshot, InteractionRecord, QualityScore};

/// A domain is scarce when it holds less than this share of the batch
const SCARCITY_SHARE: f64 = 0.05;

/// Few-shot exemplars pulled per domain
const EXEMPLARS_PER_DOMAIN: usize = 3;

pub struct RehearsalSynthesizer {
    model: Arc<dyn ModelHandle>,
    quality: Arc<QualityEngine>,
    store: Arc<RecordStore>,
    config: DatasetConfig,
}

impl RehearsalSynthesizer {
    pub fn new(
        model: Arc<dyn ModelHandle>,
        quality: Arc<QualityEngine>,
        store: Arc<RecordStore>,
        config: DatasetConfig,
    ) -> Self {
        Self {
            model,
            quality,
            store,
            config,
        }
    }

    /// Produce admitted synthetic examples, each paired with the quality
    /// it was admitted at.
    pub async fn synthesize(
        &self,
        batch_domains: &HashMap<String, usize>,
    ) -> Result<Vec<(TrainingExample, f64)>> {
        let scarce = self.scarce_domains(batch_domains).await?;
        if scarce.is_empty() {
            debug!("No under-represented domains, skipping rehearsal");
            return Ok(Vec::new());
        }

        let mut admitted = Vec::new();
        for domain in scarce {
            if admitted.len() >= self.config.rehearsal_max_total {
                break;
            }

            let exemplars = self
                .store
                .top_scored_for_domain(&domain, EXEMPLARS_PER_DOMAIN)
                .await?;
            if exemplars.is_empty() {
                continue;
            }

            let prompt = few_shot_prompt(&domain, &exemplars);
            for _ in 0..self.config.rehearsal_per_domain {
                if admitted.len() >= self.config.rehearsal_max_total {
                    break;
                }
                match self.generate_one(&domain, &prompt).await {
                    Ok(Some(example)) => admitted.push(example),
                    Ok(None) => {}
                    Err(e) => {
                        // Transient serving trouble; stop burning budget
                        // on this domain
                        warn!("Rehearsal generation failed for {}: {}", domain, e);
                        break;
                    }
                }
            }
        }

        info!("Rehearsal admitted {} synthetic examples", admitted.len());
        Ok(admitted)
    }

    /// Domains strong in history but scarce (or absent) in the batch,
    /// strongest history first.
    async fn scarce_domains(
        &self,
        batch_domains: &HashMap<String, usize>,
    ) -> Result<Vec<String>> {
        let history = self.store.domain_history_counts().await?;
        let batch_total: usize = batch_domains.values().sum();

        let mut scarce: Vec<(String, u64)> = history
            .into_iter()
            .filter(|(domain, count)| {
                if *count < self.config.rehearsal_history_floor {
                    return false;
                }
                let in_batch = batch_domains.get(domain).copied().unwrap_or(0);
                (in_batch as f64) < (batch_total as f64 * SCARCITY_SHARE).max(1.0)
            })
            .collect();

        scarce.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(scarce.into_iter().map(|(domain, _)| domain).collect())
    }

    /// One generate + assess + admit cycle. `Ok(None)` means the sample
    /// was discarded.
    async fn generate_one(
        &self,
        domain: &str,
        prompt: &str,
    ) -> Result<Option<(TrainingExample, f64)>> {
        let generation = self.model.generate(prompt).await?;

        let Some((input, output)) = parse_synthetic(&generation.text) else {
            debug!("Discarding unparseable rehearsal sample for {}", domain);
            return Ok(None);
        };

        let record = synthetic_record(domain, input, output);
        let score = self.quality.assess(&record).await;

        if !admit(&score, self.config.rehearsal_min_quality) {
            debug!(
                "Discarding rehearsal sample for {} (score {:.2})",
                domain, score.overall
            );
            return Ok(None);
        }

        let example = TrainingExample {
            prompt: record.input.clone(),
            completion: record.output.clone(),
            domain: domain.to_string(),
            reasoning_required: requires_reasoning(&record),
            synthetic: true,
        };
        Ok(Some((example, score.overall)))
    }
}

fn admit(score: &QualityScore, min_quality: f64) -> bool {
    score.overall >= min_quality
}

fn synthetic_record(domain: &str, input: String, output: String) -> InteractionRecord {
    InteractionRecord {
        id: Uuid::new_v4().to_string(),
        session_id: "rehearsal".to_string(),
        timestamp: Utc::now(),
        input,
        output,
        domain: domain.to_string(),
        context_snapshot: ContextSnapshot::default(),
        tool_trace: vec![],
    }
}

fn few_shot_prompt(domain: &str, exemplars: &[(InteractionRecord, QualityScore)]) -> String {
    let mut prompt = format!(
        "You produce training data for an assistant. Below are past \
         exchanges from the '{domain}' topic. Write ONE new, different \
         exchange on the same topic in exactly this format:\n\
         ### Request\n<the user request>\n### Response\n<the ideal answer>\n\n"
    );

    for (record, _) in exemplars {
        prompt.push_str("### Request\n");
        prompt.push_str(&record.input);
        prompt.push_str("\n### Response\n");
        prompt.push_str(&record.output);
        prompt.push_str("\n\n");
    }

    prompt.push_str("Now the new exchange:\n");
    prompt
}

/// Parse a generated sample back into an input/output pair
fn parse_synthetic(text: &str) -> Option<(String, String)> {
    let request_start = text.find("### Request")?;
    let after_request = &text[request_start + "### Request".len()..];
    let response_start = after_request.find("### Response")?;

    let input = after_request[..response_start].trim();
    let output = after_request[response_start + "### Response".len()..]
        .split("### Request")
        .next()
        .unwrap_or("")
        .trim();

    if input.is_empty() || output.is_empty() {
        return None;
    }
    Some((input.to_string(), output.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualityConfig;
    use crate::metrics::PipelineMetrics;
    use crate::model::Generation;
    use async_trait::async_trait;

    /// Scripted model that replays canned generations
    struct ScriptedModel {
        replies: Vec<String>,
        cursor: std::sync::Mutex<usize>,
    }

    #[async_trait]
    impl ModelHandle for ScriptedModel {
        fn checkpoint_id(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, _prompt: &str) -> Result<Generation> {
            let mut cursor = self.cursor.lock().unwrap();
            let text = self
                .replies
                .get(*cursor % self.replies.len())
                .cloned()
                .unwrap_or_default();
            *cursor += 1;
            Ok(Generation {
                text,
                latency_ms: 5,
                tokens: 64,
            })
        }
    }

    async fn seeded_store() -> Arc<RecordStore> {
        let store = Arc::new(RecordStore::in_memory().unwrap());
        for i in 0..6 {
            let record = synthetic_record(
                "writing",
                format!("draft a note about release {i}"),
                format!("release {i} ships the new parser"),
            );
            store.insert_record(&record).await.unwrap();
            store
                .save_score(
                    &record.id,
                    &QualityScore {
                        overall: 0.85,
                        components: Default::default(),
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

    fn synthesizer(store: Arc<RecordStore>, replies: Vec<String>) -> RehearsalSynthesizer {
        let metrics = Arc::new(PipelineMetrics::with_path("/tmp/unused-metrics.json".into()));
        let quality = Arc::new(QualityEngine::new(
            &QualityConfig::default(),
            store.clone(),
            metrics,
        ));
        RehearsalSynthesizer::new(
            Arc::new(ScriptedModel {
                replies,
                cursor: std::sync::Mutex::new(0),
            }),
            quality,
            store,
            DatasetConfig::default(),
        )
    }

    #[test]
    fn test_parse_synthetic() {
        let text = "### Request\nwrite a changelog entry\n### Response\nAdded retry logic to the fetcher.";
        let (input, output) = parse_synthetic(text).unwrap();
        assert_eq!(input, "write a changelog entry");
        assert!(output.starts_with("Added retry"));

        assert!(parse_synthetic("no markers here").is_none());
        assert!(parse_synthetic("### Request\n\n### Response\n\n").is_none());
    }

    #[tokio::test]
    async fn test_scarce_domain_generates_examples() {
        let store = seeded_store().await;
        let good_reply = "### Request\ndraft a short announcement about the \
                          storage migration for the team\n### Response\nThe \
                          storage migration finished and the team can use \
                          the new storage paths for migration data today."
            .to_string();
        let synthesizer = synthesizer(store, vec![good_reply]);

        // Current batch has only coding work
        let batch: HashMap<String, usize> = [("coding".to_string(), 30)].into();
        let admitted = synthesizer.synthesize(&batch).await.unwrap();

        assert!(!admitted.is_empty());
        assert!(admitted.iter().all(|(e, _)| e.synthetic));
        assert!(admitted.iter().all(|(e, _)| e.domain == "writing"));
        assert!(admitted.len() <= DatasetConfig::default().rehearsal_max_total);
    }

    #[tokio::test]
    async fn test_unparseable_samples_discarded() {
        let store = seeded_store().await;
        let synthesizer = synthesizer(store, vec!["just some prose".to_string()]);

        let batch: HashMap<String, usize> = [("coding".to_string(), 30)].into();
        let admitted = synthesizer.synthesize(&batch).await.unwrap();
        assert!(admitted.is_empty());
    }

    #[tokio::test]
    async fn test_well_represented_batch_skips_rehearsal() {
        let store = seeded_store().await;
        let synthesizer = synthesizer(store, vec![]);

        let batch: HashMap<String, usize> = [("writing".to_string(), 30)].into();
        let admitted = synthesizer.synthesize(&batch).await.unwrap();
        assert!(admitted.is_empty());
    }
}
