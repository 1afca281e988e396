//! Centralized value estimation over whole multi-agent trajectories.
//!
//! Per-turn rewards (missing ones count as zero) are reconciled with the
//! episode reward by crediting the residual `total - sum(turn rewards)` to the
//! final turn. Per-turn values are the discounted returns-to-go over those
//! shaped rewards:
//!
//!   V_t = r_t + gamma * V_{t+1},  V_T = 0
//!
//! The trajectory value blends the return from the first turn with two
//! team-level signals that only a centralized view can see:
//!
//!   value = w_r * V_0 + w_c * role_coverage + w_x * cross_reference_rate
//!           - length_penalty * turns
//!
//! Everything is a pure function of the trajectory, so re-scoring the same
//! trajectory always yields the same numbers.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::agent::AgentRole;
use crate::behavior::normalized_tokens;
use crate::config::ValueConfig;
use crate::error::{MarlError, MarlResult};
use crate::trajectory::{MultiTurnTrajectory, TrajectoryBeam, Turn};

/// Tokens at least this long count as salient when matching turns.
const SALIENT_TOKEN_CHARS: usize = 7;

/// Scores for one trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryValue {
    pub trajectory_id: usize,
    /// Discounted return-to-go at each turn.
    pub per_turn: Vec<f64>,
    /// One-step contribution `V_t - gamma * V_{t+1}` of each turn.
    pub turn_credit: Vec<f64>,
    pub value: f64,
    /// `turn_credit` summed per role.
    pub role_credit: BTreeMap<AgentRole, f64>,
    pub role_coverage: f64,
    pub cross_reference_rate: f64,
}

#[derive(Debug, Clone)]
pub struct CentralizedValueEstimator {
    config: ValueConfig,
}

impl CentralizedValueEstimator {
    pub fn new(config: ValueConfig) -> Self {
        Self { config }
    }

    /// Score a finalized trajectory.
    pub fn estimate(&self, trajectory: &MultiTurnTrajectory) -> MarlResult<TrajectoryValue> {
        let total = trajectory.total_reward().ok_or_else(|| {
            MarlError::InvalidTrajectory(format!(
                "cannot score unfinalized trajectory {} of episode {}",
                trajectory.trajectory_id, trajectory.episode_id
            ))
        })?;
        let turns = trajectory.turns();
        let gamma = self.config.gamma;

        let mut rewards: Vec<f64> = turns.iter().map(|t| t.reward.unwrap_or(0.0)).collect();
        let residual = total - rewards.iter().sum::<f64>();
        if let Some(last) = rewards.last_mut() {
            *last += residual;
        }

        let mut per_turn = vec![0.0; rewards.len()];
        let mut next = 0.0;
        for (t, r) in rewards.iter().enumerate().rev() {
            per_turn[t] = r + gamma * next;
            next = per_turn[t];
        }

        let turn_credit: Vec<f64> = (0..per_turn.len())
            .map(|t| per_turn[t] - gamma * per_turn.get(t + 1).copied().unwrap_or(0.0))
            .collect();
        let mut role_credit = BTreeMap::new();
        for (turn, credit) in turns.iter().zip(&turn_credit) {
            *role_credit.entry(turn.agent_role).or_insert(0.0) += credit;
        }

        let start_value = per_turn.first().copied().unwrap_or(total);
        let role_coverage = trajectory.roles_present().len() as f64 / AgentRole::ALL.len() as f64;
        let cross_reference_rate = cross_reference_rate(turns);

        let value = self.config.reward_weight * start_value
            + self.config.coverage_weight * role_coverage
            + self.config.collaboration_weight * cross_reference_rate
            - self.config.length_penalty * turns.len() as f64;

        Ok(TrajectoryValue {
            trajectory_id: trajectory.trajectory_id,
            per_turn,
            turn_credit,
            value,
            role_credit,
            role_coverage,
            cross_reference_rate,
        })
    }

    /// Score every member of a beam, in member order.
    pub fn estimate_beam(&self, beam: &TrajectoryBeam) -> MarlResult<Vec<TrajectoryValue>> {
        beam.members().iter().map(|m| self.estimate(m)).collect()
    }
}

/// Fraction of turns after the first that build on an earlier teammate:
/// they name an earlier role, or share a salient term with an earlier turn
/// by a different role.
pub fn cross_reference_rate(turns: &[Turn]) -> f64 {
    if turns.len() < 2 {
        return 0.0;
    }
    let salient: Vec<BTreeSet<String>> = turns
        .iter()
        .map(|t| {
            normalized_tokens(&t.action)
                .into_iter()
                .filter(|tok| tok.chars().count() >= SALIENT_TOKEN_CHARS)
                .collect()
        })
        .collect();

    let referencing = (1..turns.len())
        .filter(|&t| {
            let text = turns[t].action.to_lowercase();
            turns[..t].iter().enumerate().any(|(s, earlier)| {
                earlier.agent_role != turns[t].agent_role
                    && (text.contains(&earlier.agent_role.title().to_lowercase())
                        || !salient[t].is_disjoint(&salient[s]))
            })
        })
        .count();
    referencing as f64 / (turns.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_config(gamma: f64) -> ValueConfig {
        ValueConfig {
            gamma,
            reward_weight: 1.0,
            coverage_weight: 0.0,
            collaboration_weight: 0.0,
            length_penalty: 0.0,
        }
    }

    fn trajectory(rewards: &[Option<f64>], total: f64) -> MultiTurnTrajectory {
        let mut traj = MultiTurnTrajectory::new("ep", 0, 1, "task", 0.7);
        for (i, r) in rewards.iter().enumerate() {
            let role = AgentRole::ALL[i % AgentRole::ALL.len()];
            traj.push_turn(Turn::new(i, role, format!("turn {i}"), "", "").with_reward(*r))
                .unwrap();
        }
        traj.finalize(total).unwrap();
        traj
    }

    #[test]
    fn test_returns_to_go_with_terminal_residual() {
        let estimator = CentralizedValueEstimator::new(plain_config(0.5));
        let traj = trajectory(&[Some(1.0), None, Some(2.0)], 5.0);
        let v = estimator.estimate(&traj).unwrap();
        // Shaped rewards [1, 0, 4].
        assert_eq!(v.per_turn, vec![2.0, 2.0, 4.0]);
        assert_eq!(v.turn_credit, vec![1.0, 0.0, 4.0]);
        assert!((v.value - 2.0).abs() < 1e-12);
        assert!((v.role_credit[&AgentRole::ExperimentalDesigner] - 4.0).abs() < 1e-12);
        assert!((v.role_credit[&AgentRole::HypothesisGenerator]).abs() < 1e-12);
    }

    #[test]
    fn test_undiscounted_start_value_equals_total() {
        let estimator = CentralizedValueEstimator::new(plain_config(1.0));
        let traj = trajectory(&[Some(0.3), Some(0.2), None, Some(0.1)], 7.5);
        let v = estimator.estimate(&traj).unwrap();
        assert!((v.per_turn[0] - 7.5).abs() < 1e-12);
        let credit_sum: f64 = v.role_credit.values().sum();
        assert!((credit_sum - 7.5).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_unfinalized() {
        let estimator = CentralizedValueEstimator::new(ValueConfig::default());
        let traj = MultiTurnTrajectory::new("ep", 0, 1, "task", 0.7);
        assert!(matches!(
            estimator.estimate(&traj),
            Err(MarlError::InvalidTrajectory(_))
        ));
    }

    #[test]
    fn test_deterministic() {
        let estimator = CentralizedValueEstimator::new(ValueConfig::default());
        let traj = trajectory(&[Some(0.5), Some(0.25), Some(0.75)], 3.0);
        assert_eq!(estimator.estimate(&traj).unwrap(), estimator.estimate(&traj).unwrap());
    }

    #[test]
    fn test_team_signals_and_length_penalty() {
        let config = ValueConfig {
            gamma: 1.0,
            reward_weight: 0.0,
            coverage_weight: 1.0,
            collaboration_weight: 1.0,
            length_penalty: 0.1,
        };
        let estimator = CentralizedValueEstimator::new(config);
        let mut traj = MultiTurnTrajectory::new("ep", 0, 1, "task", 0.7);
        traj.push_turn(Turn::new(0, AgentRole::LiteratureSynthesizer, "mindfulness literature review", "", ""))
            .unwrap();
        traj.push_turn(Turn::new(1, AgentRole::HypothesisGenerator, "mindfulness reduces stress", "", ""))
            .unwrap();
        traj.push_turn(Turn::new(2, AgentRole::ExperimentalDesigner, "two arms", "", ""))
            .unwrap();
        traj.finalize(1.0).unwrap();
        let v = estimator.estimate(&traj).unwrap();
        assert!((v.role_coverage - 0.6).abs() < 1e-12);
        assert!((v.cross_reference_rate - 0.5).abs() < 1e-12);
        assert!((v.value - (0.6 + 0.5 - 0.3)).abs() < 1e-12);
    }

    #[test]
    fn test_cross_reference_by_role_title() {
        let turns = vec![
            Turn::new(0, AgentRole::DataAnalyst, "t-test", "", ""),
            Turn::new(1, AgentRole::PaperWriter, "As the data analyst showed", "", ""),
        ];
        assert!((cross_reference_rate(&turns) - 1.0).abs() < 1e-12);
        assert_eq!(cross_reference_rate(&turns[..1]), 0.0);
    }

    #[test]
    fn test_estimate_beam_preserves_order() {
        let estimator = CentralizedValueEstimator::new(ValueConfig::default());
        let mut beam = TrajectoryBeam::new("ep", "task");
        for id in 0..3 {
            let mut traj = MultiTurnTrajectory::new("ep", id, 1, "task", 0.7);
            traj.push_turn(Turn::new(0, AgentRole::DataAnalyst, "a", "", "")).unwrap();
            traj.finalize(id as f64).unwrap();
            beam.push(traj).unwrap();
        }
        let values = estimator.estimate_beam(&beam).unwrap();
        let ids: Vec<_> = values.iter().map(|v| v.trajectory_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(values[2].value > values[0].value);
    }
}
