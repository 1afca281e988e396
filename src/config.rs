use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{MarlError, MarlResult};
use crate::model::retry::RetryPolicy;

/// Complete configuration for a multi-agent training run.
///
/// Every section has defaults, so a config file only needs the fields it
/// changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MarlConfig {
    pub model: ModelConfig,
    pub cache: CacheConfig,
    pub agent: AgentConfig,
    pub optimizer: OptimizerConfig,
    pub value: ValueConfig,
    pub behavior: BehaviorConfig,
    pub trainer: TrainerConfig,
}

/// Completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL of an OpenAI-compatible API.
    pub api_base: String,
    /// Falls back to `OPENAI_API_KEY` when empty.
    pub api_key: String,
    pub model_id: String,
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".into(),
            api_key: String::new(),
            model_id: "gpt-4o-mini".into(),
            request_timeout_secs: 120,
        }
    }
}

/// Response cache sizing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// `None` keeps every entry for the life of the process.
    pub max_entries: Option<usize>,
}

/// Per-call agent behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_tokens: usize,
    /// Newest behaviors per success dimension injected into a prompt.
    pub behaviors_per_dimension: usize,
    /// Policy exemplars injected into a prompt.
    pub exemplars_in_prompt: usize,
    /// Extra requests after a completion without a usable action.
    pub malformed_retries: u32,
    /// Backoff for rate limits and timeouts.
    pub retry: RetryPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            behaviors_per_dimension: 3,
            exemplars_in_prompt: 2,
            malformed_retries: 1,
            retry: RetryPolicy::default(),
        }
    }
}

/// Beam sampling, advantage and policy-update settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Rollouts per episode (K).
    pub beam_size: usize,
    /// Surviving rollouts needed for advantages (at least 2).
    pub min_valid_members: usize,
    /// Resamples of an episode whose beam came up short.
    pub max_episode_retries: usize,
    /// Initial per-role temperature.
    pub base_temperature: f64,
    /// Temperature step between adjacent beam members.
    pub temperature_spread: f64,
    pub min_temperature: f64,
    pub max_temperature: f64,
    /// Divide by the group standard deviation (otherwise mean-centering only).
    pub normalize_advantages: bool,
    /// Floor on the standard deviation.
    pub advantage_epsilon: f64,
    /// Step size for per-role temperature updates.
    pub policy_learning_rate: f64,
    pub max_exemplars: usize,
    /// Weight of the previous value in the credit moving average.
    pub credit_ema_decay: f64,
    /// Wall-clock limit for a whole episode, shared by its resamples; `None`
    /// disables it.
    pub episode_deadline_secs: Option<u64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            beam_size: 4,
            min_valid_members: 2,
            max_episode_retries: 2,
            base_temperature: 0.7,
            temperature_spread: 0.2,
            min_temperature: 0.0,
            max_temperature: 1.5,
            normalize_advantages: true,
            advantage_epsilon: 1e-6,
            policy_learning_rate: 0.1,
            max_exemplars: 3,
            credit_ema_decay: 0.9,
            episode_deadline_secs: Some(600),
        }
    }
}

/// Centralized value estimator weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueConfig {
    /// Discount for returns-to-go.
    pub gamma: f64,
    pub reward_weight: f64,
    pub coverage_weight: f64,
    pub collaboration_weight: f64,
    /// Subtracted once per turn.
    pub length_penalty: f64,
}

impl Default for ValueConfig {
    fn default() -> Self {
        Self {
            gamma: 0.95,
            reward_weight: 1.0,
            coverage_weight: 0.5,
            collaboration_weight: 0.5,
            length_penalty: 0.0,
        }
    }
}

/// Behavior extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Share of persisted episodes analyzed, by reward.
    pub top_fraction: f64,
    /// Turns sampled per role from each analyzed episode.
    pub turns_per_role: usize,
    pub max_action_chars: usize,
    pub temperature: f64,
    pub max_tokens: usize,
    /// Token Jaccard similarity at which a new behavior counts as a duplicate.
    pub dedup_threshold: f64,
    /// Prune each list to this many entries after a merge.
    pub max_per_dimension: Option<usize>,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            top_fraction: 0.2,
            turns_per_role: 3,
            max_action_chars: 500,
            temperature: 0.0,
            max_tokens: 2048,
            dedup_threshold: 0.8,
            max_per_dimension: None,
        }
    }
}

/// Outer training loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Research questions, used round-robin.
    pub tasks: Vec<String>,
    /// Passes of the full role schedule per rollout.
    pub rounds: usize,
    /// Run behavior extraction after this many completed episodes.
    pub extraction_interval: usize,
    pub episodes_path: PathBuf,
    /// Where the behavior library is loaded from and saved to.
    pub library_path: Option<PathBuf>,
    /// Base seed; episode `n` uses `seed + n`.
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            tasks: vec![
                "Does spaced repetition improve long-term retention of programming concepts?".into(),
                "Can sleep quality predict next-day working memory performance?".into(),
                "Does code review latency affect defect rates in open-source projects?".into(),
            ],
            rounds: 1,
            extraction_interval: 5,
            episodes_path: PathBuf::from("runs/episodes.jsonl"),
            library_path: Some(PathBuf::from("runs/behaviors.json")),
            seed: 0,
        }
    }
}

impl MarlConfig {
    /// Read a JSON config file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Reject values the training loop cannot work with.
    pub fn validate(&self) -> MarlResult<()> {
        let o = &self.optimizer;
        if o.beam_size < 2 {
            return Err(MarlError::Config(format!(
                "optimizer.beam_size must be at least 2, got {}",
                o.beam_size
            )));
        }
        if o.min_valid_members < 2 || o.min_valid_members > o.beam_size {
            return Err(MarlError::Config(format!(
                "optimizer.min_valid_members must be in [2, {}], got {}",
                o.beam_size, o.min_valid_members
            )));
        }
        if o.advantage_epsilon.is_nan() || o.advantage_epsilon <= 0.0 {
            return Err(MarlError::Config("optimizer.advantage_epsilon must be positive".into()));
        }
        if o.min_temperature > o.max_temperature {
            return Err(MarlError::Config(
                "optimizer.min_temperature exceeds optimizer.max_temperature".into(),
            ));
        }
        if !(0.0..=1.0).contains(&o.credit_ema_decay) {
            return Err(MarlError::Config("optimizer.credit_ema_decay must be in [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.value.gamma) {
            return Err(MarlError::Config("value.gamma must be in [0, 1]".into()));
        }
        let b = &self.behavior;
        if b.top_fraction.is_nan() || b.top_fraction <= 0.0 || b.top_fraction > 1.0 {
            return Err(MarlError::Config(format!(
                "behavior.top_fraction must be in (0, 1], got {}",
                b.top_fraction
            )));
        }
        if !(0.0..=1.0).contains(&b.dedup_threshold) {
            return Err(MarlError::Config("behavior.dedup_threshold must be in [0, 1]".into()));
        }
        if self.trainer.tasks.is_empty() {
            return Err(MarlError::Config("trainer.tasks must not be empty".into()));
        }
        if self.trainer.extraction_interval == 0 {
            return Err(MarlError::Config("trainer.extraction_interval must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        MarlConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"optimizer": {"beam_size": 6}, "trainer": {"tasks": ["Q"]}}"#).unwrap();
        let config = MarlConfig::load(&path).unwrap();
        assert_eq!(config.optimizer.beam_size, 6);
        assert_eq!(config.optimizer.min_valid_members, 2);
        assert_eq!(config.trainer.tasks, vec!["Q".to_string()]);
        assert!((config.behavior.top_fraction - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = MarlConfig::default();
        config.optimizer.beam_size = 1;
        assert!(matches!(config.validate(), Err(MarlError::Config(_))));

        let mut config = MarlConfig::default();
        config.behavior.top_fraction = 0.0;
        assert!(config.validate().is_err());

        let mut config = MarlConfig::default();
        config.optimizer.min_valid_members = 5;
        assert!(config.validate().is_err());

        let mut config = MarlConfig::default();
        config.trainer.tasks.clear();
        assert!(config.validate().is_err());
    }
}
