//! Group Relative Policy Optimization over API-driven agent teams.
//!
//! There are no weights to update, so the "policy" of a role is its sampling
//! temperature plus a short list of exemplar actions (see [`PolicyStore`]).
//! One episode works like this:
//!
//!   1. Roll out K trajectories of the same task concurrently. Member `i`
//!      shifts every role's temperature by `spread * (i - (K-1)/2)`; the
//!      window of K temperatures is slid (or squeezed) to fit the bounds so
//!      members stay distinct near the edges. All attempts of one episode
//!      share a single deadline.
//!   2. Score each surviving member with the centralized value estimator.
//!   3. A_i = (V_i - mean(V)) / max(std(V), eps)
//!   4. Rank by advantage and keep the best member.
//!   5. For every role:
//!        temperature += lr * mean_i(A_i * (t_i - t_role))
//!        credit_ema   = decay * credit_ema + (1 - decay) * sum_i(A_i * credit_i) / K
//!      and the best positively-advantaged member's highest-credit turn for
//!      the role becomes an exemplar.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentContext, AgentRole, Exemplar, PolicyState, PolicyStore};
use crate::config::OptimizerConfig;
use crate::env::ResearchEnvironment;
use crate::error::{MarlError, MarlResult};
use crate::model::prompt::truncate_chars;
use crate::trajectory::{EpisodeRecord, MultiTurnTrajectory, TrajectoryBeam};

use super::advantage::{compute_group_advantages, rank_members, MemberScore};
use super::value::{CentralizedValueEstimator, TrajectoryValue};

/// Exemplar actions are clipped to this many characters.
const EXEMPLAR_CHARS: usize = 400;

/// The winning member of one episode's beam, with its scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeOutcome {
    pub trajectory: MultiTurnTrajectory,
    pub value: TrajectoryValue,
    pub advantage: f64,
    /// Members that survived and were scored.
    pub beam_size: usize,
    /// Values of the scored members in trajectory-id order.
    pub member_values: Vec<f64>,
    pub member_advantages: Vec<f64>,
    /// Beams sampled, including resamples.
    pub attempts: usize,
}

impl EpisodeOutcome {
    /// The persisted form of the winning trajectory.
    pub fn to_record(&self) -> MarlResult<EpisodeRecord> {
        self.trajectory
            .to_record(self.value.value, self.advantage, self.beam_size)
    }
}

/// Samples beams of team rollouts and turns their relative scores into
/// per-role policy updates.
pub struct GroupRelativeOptimizer {
    agents: BTreeMap<AgentRole, Agent>,
    env: Arc<dyn ResearchEnvironment>,
    estimator: CentralizedValueEstimator,
    policies: Arc<PolicyStore>,
    config: OptimizerConfig,
    deadline: Option<Duration>,
}

impl GroupRelativeOptimizer {
    pub fn new(
        agents: Vec<Agent>,
        env: Arc<dyn ResearchEnvironment>,
        estimator: CentralizedValueEstimator,
        policies: Arc<PolicyStore>,
        config: OptimizerConfig,
    ) -> Self {
        let agents = agents.into_iter().map(|a| (a.role(), a)).collect();
        let deadline = config.episode_deadline_secs.map(Duration::from_secs);
        Self {
            agents,
            env,
            estimator,
            policies,
            config,
            deadline,
        }
    }

    /// Override the episode deadline from the config.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    /// Temperature shift of beam member `index`.
    pub fn member_offset(&self, index: usize) -> f64 {
        let center = (self.config.beam_size as f64 - 1.0) / 2.0;
        self.config.temperature_spread * (index as f64 - center)
    }

    /// Temperature of beam member `index` for a role whose policy sits at
    /// `base`.
    ///
    /// The member window is centered on `base` where it fits, slid inward when
    /// `base` is near a bound, and squeezed when it is wider than the bounds.
    pub fn member_temperature(&self, base: f64, index: usize) -> f64 {
        let (lo, hi) = (self.config.min_temperature, self.config.max_temperature);
        let half = self.member_offset(0).abs();
        let temperature = if 2.0 * half > hi - lo {
            let scale = (hi - lo) / (2.0 * half);
            (lo + hi) / 2.0 + scale * self.member_offset(index)
        } else {
            base.max(lo + half).min(hi - half) + self.member_offset(index)
        };
        temperature.max(lo).min(hi)
    }

    /// Run one episode of `task` and return the best member of its beam.
    ///
    /// A beam with fewer than `min_valid_members` survivors is resampled up to
    /// `max_episode_retries` times, or until the episode deadline passes,
    /// before giving up with [`MarlError::InsufficientBeamSize`].
    pub async fn run_episode(&self, task: &str, episode_id: &str, seed: u64) -> MarlResult<EpisodeOutcome> {
        let required = self.config.min_valid_members.max(2);
        let deadline = self.deadline.map(|limit| Instant::now() + limit);
        let mut attempts = 0;
        let mut valid = 0;

        while attempts <= self.config.max_episode_retries {
            attempts += 1;
            let snapshot = self.policies.snapshot();
            let beam = self.sample_beam(task, episode_id, seed, &snapshot, deadline).await?;
            valid = beam.len();
            if valid >= required {
                return self.score_and_update(beam, &snapshot, attempts);
            }
            if deadline.is_some_and(|at| Instant::now() >= at) {
                warn!(episode = episode_id, attempt = attempts, valid, "episode deadline passed");
                break;
            }
            warn!(
                episode = episode_id,
                attempt = attempts,
                valid,
                required,
                "beam came up short, resampling"
            );
        }
        Err(MarlError::InsufficientBeamSize { valid, required })
    }

    async fn sample_beam(
        &self,
        task: &str,
        episode_id: &str,
        seed: u64,
        snapshot: &BTreeMap<AgentRole, PolicyState>,
        deadline: Option<Instant>,
    ) -> MarlResult<TrajectoryBeam> {
        let rollouts = (0..self.config.beam_size)
            .map(|i| self.bounded_rollout(task, episode_id, seed, i, snapshot, deadline));
        let results = join_all(rollouts).await;

        let mut beam = TrajectoryBeam::new(episode_id, task);
        for (member, result) in results.into_iter().enumerate() {
            match result {
                Ok(trajectory) => beam.push(trajectory)?,
                Err(err) => warn!(
                    episode = episode_id,
                    member,
                    error = %err,
                    "beam member failed, excluding it"
                ),
            }
        }
        Ok(beam)
    }

    async fn bounded_rollout(
        &self,
        task: &str,
        episode_id: &str,
        seed: u64,
        index: usize,
        snapshot: &BTreeMap<AgentRole, PolicyState>,
        deadline: Option<Instant>,
    ) -> MarlResult<MultiTurnTrajectory> {
        let rollout = self.rollout(task, episode_id, seed, index, snapshot);
        match deadline {
            Some(at) => tokio::time::timeout_at(at, rollout)
                .await
                .map_err(|_| MarlError::DeadlineExceeded)?,
            None => rollout.await,
        }
    }

    /// One member: the schedule's turns in order, each observed, acted on
    /// and rewarded before the next.
    async fn rollout(
        &self,
        task: &str,
        episode_id: &str,
        seed: u64,
        index: usize,
        snapshot: &BTreeMap<AgentRole, PolicyState>,
    ) -> MarlResult<MultiTurnTrajectory> {
        let offset = self.member_offset(index);
        let mut trajectory = MultiTurnTrajectory::new(episode_id, index, seed, task, offset);

        for role in self.env.schedule(task) {
            let agent = self
                .agents
                .get(&role)
                .ok_or_else(|| MarlError::Config(format!("no agent registered for role {role}")))?;
            let base = snapshot
                .get(&role)
                .map_or(self.config.base_temperature, |p| p.temperature);

            let observation = self.env.observe(task, trajectory.turns(), role).await?;
            let ctx = AgentContext {
                episode_id,
                task,
                observation: &observation,
                temperature: self.member_temperature(base, index),
            };
            let turn = agent.act(trajectory.turns(), &ctx).await?;
            let reward = self.env.turn_reward(task, trajectory.turns(), &turn).await?;
            trajectory.push_turn(turn.with_reward(reward))?;
        }

        let total = self.env.final_reward(task, trajectory.turns()).await?;
        trajectory.finalize(total)?;
        debug!(
            episode = episode_id,
            member = index,
            turns = trajectory.len(),
            reward = total,
            "rollout finished"
        );
        Ok(trajectory)
    }

    fn score_and_update(
        &self,
        beam: TrajectoryBeam,
        snapshot: &BTreeMap<AgentRole, PolicyState>,
        attempts: usize,
    ) -> MarlResult<EpisodeOutcome> {
        let values = self.estimator.estimate_beam(&beam)?;
        let member_values: Vec<f64> = values.iter().map(|v| v.value).collect();
        let advantages = compute_group_advantages(
            &member_values,
            self.config.normalize_advantages,
            self.config.advantage_epsilon,
        );
        let scores: Vec<MemberScore> = beam
            .members()
            .iter()
            .zip(&member_values)
            .zip(&advantages)
            .map(|((m, &value), &advantage)| MemberScore {
                trajectory_id: m.trajectory_id,
                value,
                advantage,
                turns: m.len(),
            })
            .collect();
        let order = rank_members(&scores);

        self.update_policies(beam.members(), &values, &advantages, &order, snapshot);

        let best = order[0];
        let beam_size = beam.len();
        let episode_id = beam.episode_id().to_string();
        let mut members = beam.into_members();
        let trajectory = members.swap_remove(best);
        let outcome = EpisodeOutcome {
            value: values[best].clone(),
            advantage: advantages[best],
            trajectory,
            beam_size,
            member_values,
            member_advantages: advantages,
            attempts,
        };
        info!(
            episode = %episode_id,
            best_member = outcome.trajectory.trajectory_id,
            value = outcome.value.value,
            advantage = outcome.advantage,
            reward = outcome.trajectory.total_reward().unwrap_or_default(),
            beam_size,
            attempts,
            "episode scored"
        );
        Ok(outcome)
    }

    fn update_policies(
        &self,
        members: &[MultiTurnTrajectory],
        values: &[TrajectoryValue],
        advantages: &[f64],
        order: &[usize],
        snapshot: &BTreeMap<AgentRole, PolicyState>,
    ) {
        let k = members.len() as f64;
        let lr = self.config.policy_learning_rate;
        let decay = self.config.credit_ema_decay;
        let best_positive = order.iter().copied().find(|&i| advantages[i] > 0.0);

        for &role in self.agents.keys() {
            let base = snapshot
                .get(&role)
                .map_or(self.config.base_temperature, |p| p.temperature);

            let gradient = members
                .iter()
                .zip(advantages)
                .map(|(m, a)| a * (self.member_temperature(base, m.trajectory_id) - base))
                .sum::<f64>()
                / k;
            let weighted_credit = values
                .iter()
                .zip(advantages)
                .map(|(v, a)| a * v.role_credit.get(&role).copied().unwrap_or(0.0))
                .sum::<f64>()
                / k;
            let exemplar = best_positive.and_then(|i| {
                best_turn_for(&members[i], &values[i], role).map(|action| Exemplar {
                    action: truncate_chars(action, EXEMPLAR_CHARS),
                    advantage: advantages[i],
                    episode_id: members[i].episode_id.clone(),
                })
            });

            let (min_t, max_t) = (self.config.min_temperature, self.config.max_temperature);
            let max_exemplars = self.config.max_exemplars;
            self.policies.update(role, |state| {
                state.temperature = (state.temperature + lr * gradient).clamp(min_t, max_t);
                state.credit_ema = decay * state.credit_ema + (1.0 - decay) * weighted_credit;
                if let Some(exemplar) = exemplar {
                    state.record_exemplar(exemplar, max_exemplars);
                }
            });
            debug!(role = %role, gradient, weighted_credit, "policy updated");
        }
    }
}

/// The role's action with the highest one-step credit; earliest on ties.
fn best_turn_for<'a>(
    member: &'a MultiTurnTrajectory,
    value: &TrajectoryValue,
    role: AgentRole,
) -> Option<&'a str> {
    member
        .turns()
        .iter()
        .zip(&value.turn_credit)
        .filter(|(turn, _)| turn.agent_role == role)
        .fold(None, |best: Option<(&str, f64)>, (turn, &credit)| match best {
            Some((_, top)) if top >= credit => best,
            _ => Some((turn.action.as_str(), credit)),
        })
        .map(|(action, _)| action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::BehaviorLibrary;
    use crate::config::{AgentConfig, ValueConfig};
    use crate::env::HeuristicLabEnv;
    use crate::error::CompletionError;
    use crate::model::cache::ResponseCache;
    use crate::model::mock::{MockCompletionProvider, ScriptedProvider};
    use crate::model::provider::{CompletionProvider, SamplingParams};
    use crate::model::retry::RetryPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::RwLock;

    const TASK: &str = "Does mindfulness reduce exam stress?";

    fn optimizer(provider: Arc<dyn CompletionProvider>, config: OptimizerConfig) -> GroupRelativeOptimizer {
        let cache = Arc::new(ResponseCache::new());
        let library = Arc::new(RwLock::new(BehaviorLibrary::default()));
        let policies = Arc::new(PolicyStore::new(config.base_temperature));
        let agent_config = AgentConfig {
            retry: RetryPolicy::immediate(1),
            malformed_retries: 0,
            ..AgentConfig::default()
        };
        let agents = AgentRole::ALL
            .iter()
            .map(|&role| {
                Agent::new(
                    role,
                    provider.clone(),
                    cache.clone(),
                    library.clone(),
                    policies.clone(),
                    &agent_config,
                )
            })
            .collect();
        GroupRelativeOptimizer::new(
            agents,
            Arc::new(HeuristicLabEnv::new(1)),
            CentralizedValueEstimator::new(ValueConfig::default()),
            policies,
            config,
        )
    }

    /// Answers quickly, but fails (or stalls) above a temperature.
    fn hot_failing(threshold: f64) -> ScriptedProvider {
        ScriptedProvider::with_handler(move |role, _, params| {
            if params.temperature > threshold {
                Err(CompletionError::Provider("too hot".into()))
            } else {
                Ok(format!("Action: {role} contribution at {:.1}", params.temperature))
            }
        })
    }

    struct StallingProvider {
        threshold: f64,
        calls: AtomicUsize,
    }

    impl StallingProvider {
        fn new(threshold: f64) -> Self {
            Self {
                threshold,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CompletionProvider for StallingProvider {
        fn model_id(&self) -> &str {
            "stalling"
        }

        async fn complete(&self, role: &str, _prompt: &str, params: &SamplingParams) -> Result<String, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if params.temperature > self.threshold {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(format!("Action: {role} at {:.1}", params.temperature))
        }
    }

    #[test]
    fn test_member_offsets_are_centered() {
        let opt = optimizer(Arc::new(MockCompletionProvider::new()), OptimizerConfig::default());
        let offsets: Vec<f64> = (0..4).map(|i| opt.member_offset(i)).collect();
        let expected = [-0.3, -0.1, 0.1, 0.3];
        for (o, e) in offsets.iter().zip(expected) {
            assert!((o - e).abs() < 1e-12);
        }
    }

    #[tokio::test]
    async fn test_run_episode_returns_best_member() {
        let opt = optimizer(Arc::new(MockCompletionProvider::new()), OptimizerConfig::default());
        let outcome = opt.run_episode(TASK, "ep-1", 7).await.unwrap();

        assert_eq!(outcome.beam_size, 4);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.trajectory.len(), AgentRole::ALL.len());
        assert!(outcome.trajectory.is_finalized());
        let max = outcome.member_values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(outcome.value.value, max);
        let max_adv = outcome.member_advantages.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(outcome.advantage, max_adv);

        let record = outcome.to_record().unwrap();
        assert_eq!(record.episode_id, "ep-1");
        assert_eq!(record.seed, 7);
        assert_eq!(record.beam_size, 4);
    }

    #[tokio::test]
    async fn test_policies_updated_every_episode() {
        let opt = optimizer(Arc::new(MockCompletionProvider::new()), OptimizerConfig::default());
        let outcome = opt.run_episode(TASK, "ep-1", 0).await.unwrap();

        let config = OptimizerConfig::default();
        for (role, state) in opt.policies().snapshot() {
            assert_eq!(state.version, 1, "{role}");
            assert!(state.temperature >= config.min_temperature);
            assert!(state.temperature <= config.max_temperature);
            assert!(state.exemplars.len() <= config.max_exemplars);
        }
        if outcome.advantage > 0.0 {
            let writer = opt.policies().get(AgentRole::PaperWriter).unwrap();
            assert_eq!(writer.exemplars.len(), 1);
            assert_eq!(writer.exemplars[0].episode_id, "ep-1");
        }
    }

    #[tokio::test]
    async fn test_identical_members_tie_break_to_first() {
        let provider = Arc::new(ScriptedProvider::always("Action: the same thing"));
        let opt = optimizer(provider, OptimizerConfig::default());
        let outcome = opt.run_episode(TASK, "ep-tie", 0).await.unwrap();

        assert_eq!(outcome.trajectory.trajectory_id, 0);
        assert!(outcome.member_advantages.iter().all(|a| a.abs() < 1e-12));
        let state = opt.policies().get(AgentRole::DataAnalyst).unwrap();
        assert!(state.exemplars.is_empty());
        assert!((state.temperature - 0.7).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_failed_members_are_excluded() {
        // Member temperatures are 0.4, 0.6, 0.8 and 1.0; the last one fails.
        let provider = Arc::new(hot_failing(0.9));
        let opt = optimizer(provider, OptimizerConfig::default());
        let outcome = opt.run_episode(TASK, "ep-2", 0).await.unwrap();

        assert_eq!(outcome.beam_size, 3);
        assert_eq!(outcome.member_values.len(), 3);
        assert_ne!(outcome.trajectory.trajectory_id, 3);
    }

    #[tokio::test]
    async fn test_insufficient_beam_after_retries() {
        let provider = Arc::new(hot_failing(-1.0));
        let config = OptimizerConfig {
            max_episode_retries: 2,
            ..OptimizerConfig::default()
        };
        let opt = optimizer(provider.clone(), config);
        let err = opt.run_episode(TASK, "ep-3", 0).await.unwrap_err();

        assert!(matches!(err, MarlError::InsufficientBeamSize { valid: 0, required: 2 }));
        // Each member fails on its first call, in each of three attempts.
        assert_eq!(provider.calls(), 12);
        for state in opt.policies().snapshot().values() {
            assert_eq!(state.version, 0);
        }
    }

    #[tokio::test]
    async fn test_deadline_excludes_stalled_member() {
        let provider = Arc::new(StallingProvider::new(0.9));
        let opt = optimizer(provider, OptimizerConfig::default())
            .with_deadline(Some(Duration::from_millis(200)));
        let outcome = opt.run_episode(TASK, "ep-4", 0).await.unwrap();

        assert_eq!(outcome.beam_size, 3);
        assert_ne!(outcome.trajectory.trajectory_id, 3);
    }

    #[tokio::test]
    async fn test_deadline_spans_all_attempts() {
        let provider = Arc::new(StallingProvider::new(-1.0));
        let config = OptimizerConfig {
            max_episode_retries: 5,
            ..OptimizerConfig::default()
        };
        let opt = optimizer(provider.clone(), config).with_deadline(Some(Duration::from_millis(200)));
        let err = opt.run_episode(TASK, "ep-5", 0).await.unwrap_err();

        assert!(matches!(err, MarlError::InsufficientBeamSize { valid: 0, required: 2 }));
        // One attempt's first turn per member, then the deadline is spent.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_member_temperatures_stay_distinct_near_bounds() {
        let opt = optimizer(Arc::new(MockCompletionProvider::new()), OptimizerConfig::default());
        let config = OptimizerConfig::default();
        for base in [config.min_temperature, 0.1, 0.7, 1.4, config.max_temperature] {
            let temps: Vec<f64> = (0..4).map(|i| opt.member_temperature(base, i)).collect();
            for pair in temps.windows(2) {
                assert!((pair[1] - pair[0] - 0.2).abs() < 1e-9, "{base}: {temps:?}");
            }
            assert!(temps[0] >= config.min_temperature - 1e-12);
            assert!(temps[3] <= config.max_temperature + 1e-12);
        }
        let centered: Vec<f64> = (0..4).map(|i| opt.member_temperature(0.7, i)).collect();
        assert!((centered[0] - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_member_temperatures_squeezed_into_narrow_bounds() {
        let config = OptimizerConfig {
            min_temperature: 0.5,
            max_temperature: 0.8,
            ..OptimizerConfig::default()
        };
        let opt = optimizer(Arc::new(MockCompletionProvider::new()), config);
        let temps: Vec<f64> = (0..4).map(|i| opt.member_temperature(0.7, i)).collect();
        assert!((temps[0] - 0.5).abs() < 1e-9);
        assert!((temps[3] - 0.8).abs() < 1e-9);
        assert!(temps.windows(2).all(|w| w[1] > w[0]));
    }

    #[tokio::test]
    async fn test_beam_at_temperature_bound_is_not_collapsed() {
        let provider = Arc::new(hot_failing(f64::INFINITY));
        let config = OptimizerConfig {
            base_temperature: 1.5,
            ..OptimizerConfig::default()
        };
        let opt = optimizer(provider.clone(), config);
        let outcome = opt.run_episode(TASK, "ep-6", 0).await.unwrap();

        assert_eq!(outcome.beam_size, 4);
        // Distinct temperatures give every member its own cache keys.
        assert_eq!(provider.calls(), 4 * AgentRole::ALL.len());
    }

    #[test]
    fn test_best_turn_prefers_highest_credit() {
        let mut member = MultiTurnTrajectory::new("ep", 0, 0, "t", 0.0);
        for (i, action) in ["first", "second", "third"].iter().enumerate() {
            member
                .push_turn(crate::trajectory::Turn::new(i, AgentRole::DataAnalyst, *action, "", ""))
                .unwrap();
        }
        member.finalize(1.0).unwrap();
        let value = TrajectoryValue {
            trajectory_id: 0,
            per_turn: vec![0.0; 3],
            turn_credit: vec![0.2, 0.5, 0.5],
            value: 1.0,
            role_credit: BTreeMap::new(),
            role_coverage: 0.2,
            cross_reference_rate: 0.0,
        };
        assert_eq!(best_turn_for(&member, &value, AgentRole::DataAnalyst), Some("second"));
        assert_eq!(best_turn_for(&member, &value, AgentRole::PaperWriter), None);
    }
}
