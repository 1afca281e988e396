//! Orchestry MARL: multi-agent GRPO for API-driven research teams.
//!
//! Subcommands:
//!
//! - `train`              -- Run training episodes and behavior extraction
//! - `inspect-behaviors`  -- Summarize a saved behavior library
//! - `inspect-episodes`   -- Summarize a JSON-lines episode file

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use orchestry_marl::agent::AgentRole;
use orchestry_marl::behavior::{BehaviorLibrary, SuccessDimension};
use orchestry_marl::config::MarlConfig;
use orchestry_marl::model::{CompletionProvider, LlmClient, MockCompletionProvider};
use orchestry_marl::training::MarlTrainer;
use orchestry_marl::trajectory::{EpisodeStore, JsonlEpisodeStore};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Orchestry MARL: multi-agent GRPO for API-driven research teams
#[derive(Parser)]
#[command(name = "orchestry-marl", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run training episodes.
    Train {
        /// Number of episodes to run.
        #[arg(long, default_value_t = 10)]
        episodes: usize,

        /// Use the deterministic offline provider instead of the API.
        #[arg(long)]
        mock: bool,
    },

    /// Summarize a saved behavior library.
    InspectBehaviors {
        #[arg(default_value = "runs/behaviors.json")]
        path: PathBuf,
    },

    /// Summarize a JSON-lines episode file.
    InspectEpisodes {
        #[arg(default_value = "runs/episodes.jsonl")]
        path: PathBuf,

        /// How many top episodes to list.
        #[arg(long, default_value_t = 5)]
        top: usize,
    },
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => MarlConfig::load(path)?,
        None => MarlConfig::default(),
    };

    // Fill in the API key from the environment when not set in the config file.
    if config.model.api_key.is_empty() {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.model.api_key = key;
        }
    }

    match cli.command {
        Commands::Train { episodes, mock } => cmd_train(config, episodes, mock).await,
        Commands::InspectBehaviors { path } => cmd_inspect_behaviors(&path),
        Commands::InspectEpisodes { path, top } => cmd_inspect_episodes(&path, top).await,
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_train(config: MarlConfig, episodes: usize, mock: bool) -> Result<()> {
    let provider: Arc<dyn CompletionProvider> = if mock {
        tracing::info!("Using mock completion provider");
        Arc::new(MockCompletionProvider::new())
    } else {
        if config.model.api_key.is_empty() {
            anyhow::bail!("No API key: set model.api_key in the config or OPENAI_API_KEY");
        }
        tracing::info!(model = %config.model.model_id, api_base = %config.model.api_base, "Using API provider");
        Arc::new(LlmClient::new(
            &config.model.api_base,
            &config.model.api_key,
            &config.model.model_id,
            Duration::from_secs(config.model.request_timeout_secs),
        )?)
    };

    let mut trainer = MarlTrainer::from_config(config, provider)?;
    let summary = trainer.train(episodes).await.context("Training failed")?;

    println!("Episodes completed: {}", summary.completed);
    println!("Episodes failed:    {}", summary.failed);
    println!("Mean reward:        {:.3}", summary.mean_reward);
    if let Some(best) = summary.best_reward {
        println!("Best reward:        {best:.3}");
    }
    println!(
        "Cache:              {} hits / {} misses ({:.1}% hit rate), {} entries",
        summary.cache.hits,
        summary.cache.misses,
        summary.cache.hit_rate() * 100.0,
        summary.cache.entries
    );
    println!(
        "Behaviors:          {} ({} extraction round(s), {} failure(s))",
        summary.behaviors, summary.extraction_rounds, summary.extraction_failures
    );
    println!("Policy versions:");
    for (role, version) in &summary.policy_versions {
        println!("  {role}: v{version}");
    }
    Ok(())
}

fn cmd_inspect_behaviors(path: &Path) -> Result<()> {
    let library = BehaviorLibrary::load_from_file(path)?;

    println!("Behavior Library: {}", path.display());
    println!("  Total behaviors: {}", library.len());
    println!("  Extraction rounds: {}", library.round());
    println!("  Recorded failures: {}", library.failures().len());
    println!();

    for role in AgentRole::ALL {
        let count = library.count_by_role().get(&role).copied().unwrap_or(0);
        if count == 0 {
            continue;
        }
        println!("{} ({count}):", role.title());
        for dim in SuccessDimension::ALL {
            let entries = library.entries(role, dim);
            if entries.is_empty() {
                continue;
            }
            println!("  {}:", dim.as_str());
            for entry in entries {
                println!("    - [round {}] {}", entry.round, entry.description);
            }
        }
        println!();
    }

    let failures = library.failures();
    if !failures.is_empty() {
        println!("Recent extraction failures:");
        for failure in failures.iter().rev().take(10) {
            println!(
                "  {} at {}: {}",
                failure.episode_id,
                failure.at.format("%Y-%m-%d %H:%M:%S UTC"),
                failure.reason
            );
        }
    }
    Ok(())
}

async fn cmd_inspect_episodes(path: &Path, top: usize) -> Result<()> {
    let records = JsonlEpisodeStore::new(path)
        .read_all()
        .await
        .with_context(|| format!("Failed to read episodes from {}", path.display()))?;

    println!("Episodes: {}", path.display());
    println!("  Total: {}", records.len());
    if records.is_empty() {
        return Ok(());
    }
    let mean = records.iter().map(|r| r.total_reward).sum::<f64>() / records.len() as f64;
    println!("  Mean reward: {mean:.3}");
    println!();

    let mut sorted: Vec<_> = records.iter().collect();
    sorted.sort_by(|a, b| b.total_reward.total_cmp(&a.total_reward));
    println!("Top {} episode(s):", top.min(sorted.len()));
    for record in sorted.iter().take(top) {
        println!(
            "  {} reward={:.3} value={:.3} advantage={:.3} beam={} turns={}",
            record.episode_id,
            record.total_reward,
            record.value,
            record.advantage,
            record.beam_size,
            record.turns.len()
        );
        println!("    task: {}", record.task);
    }
    Ok(())
}
