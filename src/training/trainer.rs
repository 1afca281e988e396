//! The outer training loop.
//!
//! ```text
//! for episode n = 0 .. N:
//!     task  = tasks[n mod |tasks|]
//!     beam  = optimizer.run_episode(task)        (best member + policy update)
//!     store.append(best member)
//!     every `extraction_interval` completed episodes:
//!         top    = highest-reward fraction of everything persisted
//!         delta  = extractor.extract(top)
//!         library.merge(delta)                   (under the write lock)
//!         library.save(library_path)
//! ```
//!
//! Episode failures are logged and counted, never fatal. Store failures are.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentRole, PolicyStore};
use crate::behavior::{select_top_episodes, BehaviorExtractor, BehaviorLibrary};
use crate::config::MarlConfig;
use crate::env::{HeuristicLabEnv, ResearchEnvironment};
use crate::error::MarlResult;
use crate::model::cache::{CacheStats, ResponseCache};
use crate::model::provider::CompletionProvider;
use crate::trajectory::{EpisodeStore, JsonlEpisodeStore};

use super::grpo::GroupRelativeOptimizer;
use super::value::CentralizedValueEstimator;

/// What one completed episode looked like.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeMetrics {
    /// Position in the trainer's lifetime episode sequence.
    pub episode: usize,
    pub episode_id: String,
    pub task: String,
    pub reward: f64,
    pub value: f64,
    pub advantage: f64,
    pub beam_size: usize,
    pub attempts: usize,
    pub turns: usize,
    pub cache_hit_rate: f64,
}

/// Totals for one `train` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub completed: usize,
    pub failed: usize,
    pub mean_reward: f64,
    pub best_reward: Option<f64>,
    pub cache: CacheStats,
    /// Behaviors in the library at the end of the call.
    pub behaviors: usize,
    pub extraction_rounds: usize,
    pub extraction_failures: usize,
    pub policy_versions: BTreeMap<AgentRole, u64>,
    pub episodes: Vec<EpisodeMetrics>,
}

/// Owns every shared component of a run.
pub struct MarlTrainer {
    config: MarlConfig,
    cache: Arc<ResponseCache>,
    library: Arc<RwLock<BehaviorLibrary>>,
    policies: Arc<PolicyStore>,
    store: Arc<dyn EpisodeStore>,
    optimizer: GroupRelativeOptimizer,
    extractor: BehaviorExtractor,
    episodes_started: usize,
    episodes_completed: usize,
}

impl MarlTrainer {
    /// Wire up agents, optimizer and extractor around one provider.
    pub fn new(
        config: MarlConfig,
        provider: Arc<dyn CompletionProvider>,
        env: Arc<dyn ResearchEnvironment>,
        store: Arc<dyn EpisodeStore>,
        library: BehaviorLibrary,
    ) -> MarlResult<Self> {
        config.validate()?;

        let cache = Arc::new(ResponseCache::with_capacity(config.cache.max_entries));
        let library = Arc::new(RwLock::new(library));
        let policies = Arc::new(PolicyStore::new(config.optimizer.base_temperature));

        let agents = AgentRole::ALL
            .iter()
            .map(|&role| {
                Agent::new(
                    role,
                    provider.clone(),
                    cache.clone(),
                    library.clone(),
                    policies.clone(),
                    &config.agent,
                )
            })
            .collect();
        let optimizer = GroupRelativeOptimizer::new(
            agents,
            env,
            CentralizedValueEstimator::new(config.value.clone()),
            policies.clone(),
            config.optimizer.clone(),
        );
        let extractor = BehaviorExtractor::new(
            provider,
            cache.clone(),
            config.agent.retry.clone(),
            config.behavior.clone(),
        );

        Ok(Self {
            config,
            cache,
            library,
            policies,
            store,
            optimizer,
            extractor,
            episodes_started: 0,
            episodes_completed: 0,
        })
    }

    /// File-backed run: JSON-lines episode store, heuristic environment, and
    /// the behavior library reloaded from `library_path` when it exists.
    pub fn from_config(config: MarlConfig, provider: Arc<dyn CompletionProvider>) -> anyhow::Result<Self> {
        let library = match &config.trainer.library_path {
            Some(path) if path.exists() => BehaviorLibrary::load_from_file(path)?,
            _ => BehaviorLibrary::new(config.behavior.dedup_threshold),
        };
        info!(behaviors = library.len(), round = library.round(), "behavior library ready");

        let store = Arc::new(JsonlEpisodeStore::new(&config.trainer.episodes_path));
        let env = Arc::new(HeuristicLabEnv::new(config.trainer.rounds));
        Self::new(config, provider, env, store, library).context("Failed to build trainer")
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn library(&self) -> &Arc<RwLock<BehaviorLibrary>> {
        &self.library
    }

    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    /// Run `num_episodes` episodes, extracting behaviors on schedule.
    pub async fn train(&mut self, num_episodes: usize) -> MarlResult<TrainingSummary> {
        info!(
            num_episodes,
            beam_size = self.config.optimizer.beam_size,
            tasks = self.config.trainer.tasks.len(),
            "starting training"
        );

        let mut episodes = Vec::with_capacity(num_episodes);
        let mut failed = 0;
        let mut extraction_rounds = 0;
        let mut extraction_failures = 0;

        for _ in 0..num_episodes {
            let episode = self.episodes_started;
            self.episodes_started += 1;

            let tasks = &self.config.trainer.tasks;
            let task = tasks[episode % tasks.len()].clone();
            let episode_id = Uuid::new_v4().to_string();
            let seed = self.config.trainer.seed.wrapping_add(episode as u64);

            let outcome = match self.optimizer.run_episode(&task, &episode_id, seed).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(episode, episode_id = %episode_id, error = %err, "episode failed, skipping");
                    failed += 1;
                    continue;
                }
            };

            let record = outcome.to_record()?;
            self.store.append(&record).await?;
            self.episodes_completed += 1;

            let metrics = EpisodeMetrics {
                episode,
                episode_id,
                task,
                reward: record.total_reward,
                value: record.value,
                advantage: record.advantage,
                beam_size: record.beam_size,
                attempts: outcome.attempts,
                turns: record.turns.len(),
                cache_hit_rate: self.cache.stats().hit_rate(),
            };
            info!(
                episode,
                reward = metrics.reward,
                value = metrics.value,
                advantage = metrics.advantage,
                cache_hit_rate = metrics.cache_hit_rate,
                "episode complete"
            );
            episodes.push(metrics);

            if self.episodes_completed % self.config.trainer.extraction_interval == 0 {
                let (_, failures) = self.run_extraction().await?;
                extraction_rounds += 1;
                extraction_failures += failures;
            }
        }

        let rewards: Vec<f64> = episodes.iter().map(|m| m.reward).collect();
        let mean_reward = if rewards.is_empty() {
            0.0
        } else {
            rewards.iter().sum::<f64>() / rewards.len() as f64
        };
        let summary = TrainingSummary {
            completed: episodes.len(),
            failed,
            mean_reward,
            best_reward: rewards.iter().copied().max_by(f64::total_cmp),
            cache: self.cache.stats(),
            behaviors: self.library.read().await.len(),
            extraction_rounds,
            extraction_failures,
            policy_versions: self.policies.versions(),
            episodes,
        };
        info!(
            completed = summary.completed,
            failed = summary.failed,
            mean_reward = summary.mean_reward,
            behaviors = summary.behaviors,
            cache_hits = summary.cache.hits,
            "training finished"
        );
        Ok(summary)
    }

    /// Mine the persisted top episodes and merge what they yield.
    ///
    /// Returns the number of behaviors added and the number of episodes whose
    /// extraction failed.
    pub async fn run_extraction(&self) -> MarlResult<(usize, usize)> {
        let records = self.store.read_all().await?;
        let top = select_top_episodes(&records, self.config.behavior.top_fraction);
        if top.is_empty() {
            debug!("no persisted episodes, skipping extraction");
            return Ok((0, 0));
        }
        let outcome = self.extractor.extract(&top).await;
        let failures = outcome.failures.len();

        let mut library = self.library.write().await;
        let added = library.merge(outcome.delta);
        if let Some(max) = self.config.behavior.max_per_dimension {
            let pruned = library.prune(max);
            debug!(pruned, "pruned behavior library");
        }
        library.record_failures(outcome.failures);
        if let Some(path) = &self.config.trainer.library_path {
            save_library(&library, path);
        }
        info!(
            analyzed = top.len(),
            added,
            failures,
            total = library.len(),
            round = library.round(),
            "behavior library updated"
        );
        Ok((added, failures))
    }
}

fn save_library(library: &BehaviorLibrary, path: &Path) {
    if let Err(err) = library.save_to_file(path) {
        warn!(path = %path.display(), error = %err, "failed to save behavior library");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mock::{MockCompletionProvider, ScriptedProvider};
    use crate::model::retry::RetryPolicy;
    use crate::trajectory::InMemoryEpisodeStore;

    fn test_config(interval: usize) -> MarlConfig {
        let mut config = MarlConfig::default();
        config.trainer.tasks = vec!["Task A?".into(), "Task B?".into()];
        config.trainer.extraction_interval = interval;
        config.trainer.library_path = None;
        config.agent.retry = RetryPolicy::immediate(1);
        config.behavior.top_fraction = 0.5;
        config
    }

    fn trainer(
        config: MarlConfig,
        provider: Arc<dyn CompletionProvider>,
        store: Arc<InMemoryEpisodeStore>,
    ) -> MarlTrainer {
        MarlTrainer::new(
            config,
            provider,
            Arc::new(HeuristicLabEnv::new(1)),
            store,
            BehaviorLibrary::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_train_persists_and_extracts() {
        let store = Arc::new(InMemoryEpisodeStore::new());
        let mut trainer = trainer(test_config(2), Arc::new(MockCompletionProvider::new()), store.clone());
        let summary = trainer.train(4).await.unwrap();

        assert_eq!(summary.completed, 4);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.extraction_rounds, 2);
        assert!(summary.behaviors > 0);
        assert!(summary.best_reward.unwrap() >= summary.mean_reward);
        assert!(summary.policy_versions.values().all(|&v| v == 4));

        let records = store.read_all().await.unwrap();
        assert_eq!(records.len(), 4);
        let tasks: Vec<_> = summary.episodes.iter().map(|m| m.task.as_str()).collect();
        assert_eq!(tasks, vec!["Task A?", "Task B?", "Task A?", "Task B?"]);
        assert_eq!(trainer.library().read().await.round(), 2);
    }

    #[tokio::test]
    async fn test_repeated_episodes_hit_cache() {
        // Identical members leave every policy unchanged, so the second
        // episode sends exactly the prompts of the first.
        let mut config = test_config(100);
        config.trainer.tasks = vec!["Only task?".into()];
        let provider = Arc::new(ScriptedProvider::always("Action: the same thing"));
        let store = Arc::new(InMemoryEpisodeStore::new());
        let mut trainer = trainer(config, provider.clone(), store);

        trainer.train(1).await.unwrap();
        assert_eq!(trainer.cache().stats().hits, 0);
        assert_eq!(provider.calls(), 20);

        trainer.train(1).await.unwrap();
        assert_eq!(trainer.cache().stats().hits, 20);
        assert_eq!(provider.calls(), 20);
    }

    #[tokio::test]
    async fn test_failed_episodes_are_counted_not_fatal() {
        let provider = Arc::new(ScriptedProvider::always("no action here"));
        let store = Arc::new(InMemoryEpisodeStore::new());
        let mut config = test_config(1);
        config.optimizer.max_episode_retries = 0;
        config.agent.malformed_retries = 0;
        let mut trainer = trainer(config, provider, store.clone());
        let summary = trainer.train(3).await.unwrap();

        assert_eq!(summary.completed, 0);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.extraction_rounds, 0);
        assert_eq!(summary.best_reward, None);
        assert!(store.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_extraction_failures_recorded() {
        // Agents answer well; the extractor gets the same non-JSON text.
        let provider = Arc::new(ScriptedProvider::always("Action: survey prior work"));
        let store = Arc::new(InMemoryEpisodeStore::new());
        let mut trainer = trainer(test_config(1), provider, store);
        let summary = trainer.train(1).await.unwrap();

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.extraction_failures, 1);
        assert_eq!(summary.behaviors, 0);
        assert_eq!(trainer.library().read().await.failures().len(), 1);
    }

    #[tokio::test]
    async fn test_from_config_saves_library() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(1);
        config.trainer.episodes_path = dir.path().join("episodes.jsonl");
        config.trainer.library_path = Some(dir.path().join("lib/behaviors.json"));
        let mut trainer =
            MarlTrainer::from_config(config.clone(), Arc::new(MockCompletionProvider::new())).unwrap();
        trainer.train(1).await.unwrap();

        let saved = BehaviorLibrary::load_from_file(dir.path().join("lib/behaviors.json")).unwrap();
        assert!(!saved.is_empty());
        assert!(config.trainer.episodes_path.exists());

        // A fresh trainer picks the saved library back up.
        let reloaded = MarlTrainer::from_config(config, Arc::new(MockCompletionProvider::new())).unwrap();
        assert_eq!(reloaded.library().read().await.len(), saved.len());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = test_config(1);
        config.optimizer.beam_size = 1;
        let result = MarlTrainer::new(
            config,
            Arc::new(MockCompletionProvider::new()),
            Arc::new(HeuristicLabEnv::new(1)),
            Arc::new(InMemoryEpisodeStore::new()),
            BehaviorLibrary::default(),
        );
        assert!(result.is_err());
    }
}
