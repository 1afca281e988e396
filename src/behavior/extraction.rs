//! LLM-driven behavior extraction from top-reward episodes.
//!
//! For every selected episode a sample of each role's turns is sent to the
//! model with a request for a JSON object of patterns per role and success
//! dimension. The first balanced JSON object in the reply is used; an episode
//! whose reply has none (or has the wrong shape, or whose completion failed)
//! is recorded as an [`ExtractionFailure`] and contributes nothing.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::types::{BehaviorDelta, BehaviorEntry, ExtractionFailure, SuccessDimension};
use crate::agent::AgentRole;
use crate::config::BehaviorConfig;
use crate::error::{MarlError, MarlResult};
use crate::model::cache::{CacheKey, ResponseCache};
use crate::model::prompt::{behavior_extraction_prompt, truncate_chars};
use crate::model::provider::{CompletionProvider, SamplingParams, BEHAVIOR_EXTRACTOR_ROLE};
use crate::model::retry::RetryPolicy;
use crate::model::structured::parse_structured;
use crate::trajectory::EpisodeRecord;

/// Result of one extraction pass. Never an error: failures are data.
#[derive(Debug, Clone, Default)]
pub struct ExtractionOutcome {
    pub delta: BehaviorDelta,
    pub failures: Vec<ExtractionFailure>,
    pub episodes_analyzed: usize,
}

/// Highest-reward episodes first; `floor(len * fraction)` of them, at least one.
///
/// Equal rewards are ordered by episode id so the selection is stable.
pub fn select_top_episodes(records: &[EpisodeRecord], fraction: f64) -> Vec<&EpisodeRecord> {
    if records.is_empty() {
        return Vec::new();
    }
    let count = ((records.len() as f64 * fraction).floor() as usize).clamp(1, records.len());
    let mut sorted: Vec<&EpisodeRecord> = records.iter().collect();
    sorted.sort_by(|a, b| {
        b.total_reward
            .total_cmp(&a.total_reward)
            .then_with(|| a.episode_id.cmp(&b.episode_id))
    });
    sorted.truncate(count);
    sorted
}

/// Mines behavioral patterns from episodes via the completion capability.
pub struct BehaviorExtractor {
    provider: Arc<dyn CompletionProvider>,
    cache: Arc<ResponseCache>,
    retry: RetryPolicy,
    config: BehaviorConfig,
}

impl BehaviorExtractor {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        cache: Arc<ResponseCache>,
        retry: RetryPolicy,
        config: BehaviorConfig,
    ) -> Self {
        Self {
            provider,
            cache,
            retry,
            config,
        }
    }

    /// Analyze every episode in `top` concurrently.
    pub async fn extract(&self, top: &[&EpisodeRecord]) -> ExtractionOutcome {
        let results = join_all(top.iter().map(|record| self.extract_episode(record))).await;

        let mut outcome = ExtractionOutcome {
            episodes_analyzed: top.len(),
            ..ExtractionOutcome::default()
        };
        for (record, result) in top.iter().zip(results) {
            match result {
                Ok(found) => {
                    for (role, dim, description) in found {
                        outcome
                            .delta
                            .push(role, dim, BehaviorEntry::new(description, &record.episode_id));
                    }
                }
                Err(reason) => {
                    warn!(episode = %record.episode_id, reason = %reason, "behavior extraction failed");
                    outcome
                        .failures
                        .push(ExtractionFailure::new(&record.episode_id, reason));
                }
            }
        }

        info!(
            episodes = outcome.episodes_analyzed,
            behaviors = outcome.delta.len(),
            failures = outcome.failures.len(),
            "behavior extraction finished"
        );
        outcome
    }

    async fn extract_episode(
        &self,
        record: &EpisodeRecord,
    ) -> Result<Vec<(AgentRole, SuccessDimension, String)>, String> {
        let sampled = self.sample_turns(record);
        if sampled.is_empty() {
            return Err("episode has no turns".to_string());
        }
        let prompt = behavior_extraction_prompt(&record.episode_id, record.total_reward, &sampled);
        let params = SamplingParams::new(self.config.temperature, self.config.max_tokens);
        let key = CacheKey::new(BEHAVIOR_EXTRACTOR_ROLE, &prompt, &params, self.provider.model_id());

        let text = self
            .cache
            .get_or_compute(key, || self.complete_structured(&prompt, &params))
            .await
            .map_err(|e| e.to_string())?;
        let value = parse_structured(&text).map_err(|e| e.to_string())?;
        let found = behaviors_from_json(&value);
        if found.is_empty() {
            return Err("response contained no behaviors for known roles".to_string());
        }
        debug!(episode = %record.episode_id, behaviors = found.len(), "extracted behaviors");
        Ok(found)
    }

    /// Only replies that contain a JSON object are cached.
    async fn complete_structured(&self, prompt: &str, params: &SamplingParams) -> MarlResult<String> {
        let text = self
            .retry
            .execute(|| self.provider.complete(BEHAVIOR_EXTRACTOR_ROLE, prompt, params))
            .await?;
        parse_structured(&text).map_err(|e| MarlError::MalformedResponse(e.to_string()))?;
        Ok(text)
    }

    /// Up to `turns_per_role` turns per role, sampled with the episode seed
    /// and kept in trajectory order, each truncated to `max_action_chars`.
    fn sample_turns(&self, record: &EpisodeRecord) -> BTreeMap<AgentRole, Vec<String>> {
        let mut rng = StdRng::seed_from_u64(record.seed);
        let mut sampled = BTreeMap::new();
        for role in AgentRole::ALL {
            let turns: Vec<_> = record.turns_by_role(role).collect();
            if turns.is_empty() {
                continue;
            }
            let mut chosen: Vec<_> = turns
                .choose_multiple(&mut rng, self.config.turns_per_role.max(1))
                .copied()
                .collect();
            chosen.sort_by_key(|t| t.turn_index);
            let actions = chosen
                .iter()
                .map(|t| truncate_chars(&t.action, self.config.max_action_chars))
                .collect();
            sampled.insert(role, actions);
        }
        sampled
    }
}

/// Read `{role: {dimension: [string, ...]}}`, ignoring unknown roles,
/// unknown dimensions and non-string items.
pub fn behaviors_from_json(value: &Value) -> Vec<(AgentRole, SuccessDimension, String)> {
    let Some(object) = value.as_object() else {
        return Vec::new();
    };
    let mut found = Vec::new();
    for (role_key, dims) in object {
        let Ok(role) = role_key.parse::<AgentRole>() else {
            debug!(role = %role_key, "ignoring unknown role in extraction output");
            continue;
        };
        let Some(dims) = dims.as_object() else {
            continue;
        };
        for (dim_key, items) in dims {
            let Ok(dim) = dim_key.parse::<SuccessDimension>() else {
                continue;
            };
            let strings = items
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty());
            found.extend(strings.map(|s| (role, dim, s.to_string())));
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::BehaviorLibrary;
    use crate::error::CompletionError;
    use crate::model::mock::{MockCompletionProvider, ScriptedProvider};
    use crate::trajectory::TurnRecord;
    use chrono::Utc;

    fn record(id: &str, reward: f64, turns: &[(AgentRole, &str)]) -> EpisodeRecord {
        EpisodeRecord {
            episode_id: id.to_string(),
            task: "task".into(),
            seed: 42,
            trajectory_id: 0,
            turns: turns
                .iter()
                .enumerate()
                .map(|(i, (role, action))| TurnRecord {
                    turn_index: i,
                    agent_role: *role,
                    action: action.to_string(),
                    reward: None,
                })
                .collect(),
            total_reward: reward,
            value: 0.0,
            advantage: 0.0,
            beam_size: 2,
            created_at: Utc::now(),
        }
    }

    fn extractor(provider: Arc<dyn CompletionProvider>) -> BehaviorExtractor {
        BehaviorExtractor::new(
            provider,
            Arc::new(ResponseCache::new()),
            RetryPolicy::immediate(1),
            BehaviorConfig::default(),
        )
    }

    #[test]
    fn test_select_top_fraction() {
        let records: Vec<_> = (0..10)
            .map(|i| record(&format!("ep-{i}"), i as f64, &[]))
            .collect();
        let top = select_top_episodes(&records, 0.2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].episode_id, "ep-9");
        assert_eq!(top[1].episode_id, "ep-8");

        // Small sets still yield one episode.
        assert_eq!(select_top_episodes(&records[..3], 0.2).len(), 1);
        assert!(select_top_episodes(&[], 0.2).is_empty());
    }

    #[test]
    fn test_behaviors_from_json_ignores_bad_shapes() {
        let value = serde_json::json!({
            "data_analyst": {"scientific_rigor": ["effect sizes", 3, "  "], "speed": ["x"]},
            "janitor": {"novelty": ["mop"]},
            "paper_writer": "not an object"
        });
        let found = behaviors_from_json(&value);
        assert_eq!(
            found,
            vec![(AgentRole::DataAnalyst, SuccessDimension::ScientificRigor, "effect sizes".to_string())]
        );
    }

    #[tokio::test]
    async fn test_no_json_yields_failure_not_error() {
        let provider = Arc::new(ScriptedProvider::always("I could not find any patterns, sorry."));
        let ex = extractor(provider);
        let records = vec![record("ep-1", 5.0, &[(AgentRole::DataAnalyst, "t-test")])];
        let top: Vec<_> = records.iter().collect();
        let outcome = ex.extract(&top).await;
        assert!(outcome.delta.is_empty());
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].episode_id, "ep-1");
    }

    #[tokio::test]
    async fn test_provider_failure_is_recorded() {
        let provider = Arc::new(ScriptedProvider::with_handler(|_, _, _| {
            Err(CompletionError::Provider("400 bad request".into()))
        }));
        let ex = extractor(provider);
        let records = vec![record("ep-1", 5.0, &[(AgentRole::PaperWriter, "abstract")])];
        let top: Vec<_> = records.iter().collect();
        let outcome = ex.extract(&top).await;
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].reason.contains("400"));
    }

    #[tokio::test]
    async fn test_prose_wrapped_json_is_extracted() {
        let reply = "Sure! Here you go:\n{\"hypothesis_generator\": {\"novelty\": [\"links two fields\"]}}\nThanks.";
        let provider = Arc::new(ScriptedProvider::always(reply));
        let ex = extractor(provider);
        let records = vec![record("ep-7", 9.0, &[(AgentRole::HypothesisGenerator, "H1")])];
        let top: Vec<_> = records.iter().collect();
        let outcome = ex.extract(&top).await;
        assert!(outcome.failures.is_empty());
        let entries: Vec<_> = outcome.delta.iter().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].2.description, "links two fields");
        assert_eq!(entries[0].2.source_episode_id, "ep-7");
    }

    #[tokio::test]
    async fn test_rerun_adds_no_duplicates_and_uses_cache() {
        let provider = Arc::new(MockCompletionProvider::new());
        let ex = extractor(Arc::clone(&provider) as Arc<dyn CompletionProvider>);
        let records = vec![record(
            "ep-1",
            8.0,
            &[
                (AgentRole::LiteratureSynthesizer, "prior work"),
                (AgentRole::DataAnalyst, "t-test"),
            ],
        )];
        let top: Vec<_> = records.iter().collect();

        let mut library = BehaviorLibrary::default();
        let first = library.merge(ex.extract(&top).await.delta);
        let second = library.merge(ex.extract(&top).await.delta);
        assert!(first > 0);
        assert_eq!(second, 0);
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn test_sampling_is_seeded_and_truncated() {
        let long = "x".repeat(1000);
        let turns: Vec<(AgentRole, &str)> = (0..6)
            .map(|_| (AgentRole::DataAnalyst, long.as_str()))
            .collect();
        let rec = record("ep-1", 1.0, &turns);
        let ex = extractor(Arc::new(MockCompletionProvider::new()));
        let a = ex.sample_turns(&rec);
        let b = ex.sample_turns(&rec);
        assert_eq!(a, b);
        let analyst = &a[&AgentRole::DataAnalyst];
        assert_eq!(analyst.len(), BehaviorConfig::default().turns_per_role);
        assert!(analyst[0].chars().count() <= BehaviorConfig::default().max_action_chars + 3);
    }
}
