//! CLI interface for lifelong

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use crate::config::{self, Config};
use crate::deploy::{DeploymentManager, ModelRegistry};
use crate::metrics::PipelineMetrics;
use crate::model::{HttpModelClient, ServingEndpoint};
use crate::pipeline::LearningPipeline;
use crate::quality::QualityEngine;
use crate::recorder::store::RecordStore;
use crate::recorder::{classify_domain, RawInteraction};
use crate::training::{HttpTrainer, SimulatedTrainer, TrainerBackend};
use crate::types::{ContextSnapshot, InteractionRecord};

#[derive(Parser)]
#[command(name = "lifelong")]
#[command(about = "Quality-driven continuous learning pipeline for locally hosted assistant models", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline daemon
    Run {
        /// Queue a manual training trigger at startup
        #[arg(long)]
        train_now: bool,
    },
    /// Show pipeline status
    Status,
    /// Ingest one interaction (for smoke testing the pipeline)
    Record {
        /// User input text
        input: String,
        /// Assistant output text
        output: String,
        /// Session id to attribute the interaction to
        #[arg(short, long, default_value = "cli")]
        session: String,
    },
    /// Search stored interactions
    Records {
        query: String,
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Inspect the checkpoint registry
    Registry,
    /// Roll back a deployed or staged checkpoint
    Rollback {
        checkpoint_id: String,
    },
    /// Show pipeline counters
    Metrics,
    /// Show configuration
    Config {
        /// Print the config file path instead of its contents
        #[arg(long)]
        path: bool,
    },
}

/// Entry point called from main
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { train_now } => run_daemon(train_now).await,
        Commands::Status => show_status().await,
        Commands::Record {
            input,
            output,
            session,
        } => record_interaction(session, input, output).await,
        Commands::Records { query, limit } => search_records(query, limit).await,
        Commands::Registry => show_registry().await,
        Commands::Rollback { checkpoint_id } => rollback(checkpoint_id).await,
        Commands::Metrics => show_metrics().await,
        Commands::Config { path } => show_config(path),
    }
}

struct Stores {
    store: Arc<RecordStore>,
    registry: Arc<ModelRegistry>,
    metrics: Arc<PipelineMetrics>,
}

async fn open_stores() -> Result<Stores> {
    let data_dir = config::data_dir()?;

    let store = Arc::new(RecordStore::open(data_dir.join("records.db")).await?);

    let registry = Arc::new(ModelRegistry::with_path(data_dir.join("registry.json")));
    registry.load().await?;

    let metrics = Arc::new(PipelineMetrics::with_path(data_dir.join("metrics.json")));
    metrics.load().await?;

    Ok(Stores {
        store,
        registry,
        metrics,
    })
}

fn serving_client(config: &Config) -> Result<Arc<HttpModelClient>> {
    Ok(Arc::new(HttpModelClient::new(ServingEndpoint::from_config(
        &config.serving,
    ))?))
}

fn trainer_backend(config: &Config) -> Result<Arc<dyn TrainerBackend>> {
    Ok(match config.training.backend {
        crate::config::TrainerKind::Http => Arc::new(HttpTrainer::from_config(&config.serving)?),
        crate::config::TrainerKind::Simulated => Arc::new(SimulatedTrainer::new()),
    })
}

async fn run_daemon(train_now: bool) -> Result<()> {
    let config = Config::load()?;
    let stores = open_stores().await?;

    let mut pipeline = LearningPipeline::new(
        config.clone(),
        serving_client(&config)?,
        trainer_backend(&config)?,
        stores.store,
        stores.registry,
        stores.metrics.clone(),
    )
    .await?;

    let handle = pipeline.handle();
    if train_now {
        handle.trigger();
    }

    let engine = pipeline.spawn_engine().expect("engine not yet started");

    println!("Pipeline running. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c().await?;

    handle.shutdown();
    let _ = engine.await;
    stores.metrics.save().await?;
    println!("Stopped.");
    Ok(())
}

async fn show_status() -> Result<()> {
    let stores = open_stores().await?;

    let records = stores.store.record_count().await?;
    let production = stores.registry.production_id().await;
    let chain = stores.registry.chain().await;
    let snapshot = stores.metrics.snapshot().await;

    println!("Pipeline status");
    println!("  Stored interactions:  {}", records);
    println!(
        "  Production checkpoint: {}",
        production.as_deref().unwrap_or("(none)")
    );
    println!("  Checkpoint chain:      {} entries", chain.len());
    println!(
        "  Training runs:         {} started / {} completed / {} aborted",
        snapshot.training_runs_started,
        snapshot.training_runs_completed,
        snapshot.training_runs_aborted
    );
    println!(
        "  Deployments:           {} promoted / {} rolled back",
        snapshot.deployments_promoted, snapshot.deployments_rolled_back
    );
    Ok(())
}

async fn record_interaction(session: String, input: String, output: String) -> Result<()> {
    let config = Config::load()?;
    let stores = open_stores().await?;
    let quality = QualityEngine::new(&config.quality, stores.store.clone(), stores.metrics.clone());

    // Direct write instead of the fire-and-forget queue: the process
    // exits right after, so the result must be durable now
    let raw = RawInteraction {
        session_id: session,
        input,
        output,
        context: ContextSnapshot::default(),
        tool_trace: vec![],
    };
    let record = InteractionRecord {
        id: uuid::Uuid::new_v4().to_string(),
        session_id: raw.session_id,
        timestamp: chrono::Utc::now(),
        domain: classify_domain(&raw.input),
        input: raw.input,
        output: raw.output,
        context_snapshot: raw.context,
        tool_trace: raw.tool_trace,
    };

    stores.store.insert_record(&record).await?;
    let score = quality.assess_and_store(&record).await?;

    println!("Recorded {} ({})", record.id, record.domain);
    println!(
        "  quality {:.2} (confidence {:.2})",
        score.overall, score.confidence
    );
    Ok(())
}

async fn search_records(query: String, limit: usize) -> Result<()> {
    let stores = open_stores().await?;
    let results = stores.store.search_records(&query, limit).await?;

    if results.is_empty() {
        println!("No matching interactions.");
        return Ok(());
    }
    for record in results {
        println!(
            "{}  [{}] {}",
            record.timestamp.format("%Y-%m-%d %H:%M"),
            record.domain,
            truncate(&record.input, 70)
        );
    }
    Ok(())
}

async fn show_registry() -> Result<()> {
    let stores = open_stores().await?;
    let production = stores.registry.production_id().await;
    let chain = stores.registry.chain().await;

    if chain.is_empty() {
        println!("Registry is empty.");
        return Ok(());
    }

    println!("Checkpoint chain (oldest first):");
    for checkpoint in chain {
        let marker = if production.as_deref() == Some(&checkpoint.id) {
            " *production*"
        } else {
            ""
        };
        let stage = stores
            .registry
            .deployment(&checkpoint.id)
            .await
            .map(|d| d.stage.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}  parent={}  stage={}{}",
            checkpoint.id,
            checkpoint.parent_id.as_deref().unwrap_or("(none)"),
            stage,
            marker
        );
    }
    Ok(())
}

async fn rollback(checkpoint_id: String) -> Result<()> {
    let config = Config::load()?;
    let stores = open_stores().await?;

    let manager = DeploymentManager::new(
        stores.registry.clone(),
        serving_client(&config)?,
        config.deployment.clone(),
        stores.metrics.clone(),
    );

    manager.rollback(&checkpoint_id).await?;
    stores.registry.save().await?;
    stores.metrics.save().await?;
    println!("Checkpoint {} rolled back.", checkpoint_id);
    Ok(())
}

async fn show_metrics() -> Result<()> {
    let stores = open_stores().await?;
    let snapshot = stores.metrics.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn show_config(path_only: bool) -> Result<()> {
    if path_only {
        println!("{}", config::config_path()?.display());
        return Ok(());
    }
    let config = Config::load()?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

/// Truncate a string to max length with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world foo bar", 10), "hello w...");
    }
}
