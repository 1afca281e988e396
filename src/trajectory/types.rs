//! Core trajectory data types.
//!
//! A [`MultiTurnTrajectory`] is one rollout of the whole lab: an ordered list of
//! [`Turn`]s spanning many roles plus the episode reward once it terminates.
//! A [`TrajectoryBeam`] holds the K candidate rollouts sampled from the same
//! starting context for group-relative comparison, and an [`EpisodeRecord`] is
//! the flattened form handed to the episode store.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentRole;
use crate::error::{MarlError, MarlResult};

// ---------------------------------------------------------------------------
// Turn
// ---------------------------------------------------------------------------

/// One agent's contribution within a trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Zero-based position in the trajectory.
    pub turn_index: usize,
    pub agent_role: AgentRole,
    /// The structured action parsed from the completion.
    pub action: String,
    /// Text the model produced before its action marker.
    #[serde(default)]
    pub reasoning: String,
    /// What the environment showed the agent before it acted.
    #[serde(default)]
    pub observation: String,
    #[serde(default)]
    pub reward: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(
        turn_index: usize,
        agent_role: AgentRole,
        action: impl Into<String>,
        reasoning: impl Into<String>,
        observation: impl Into<String>,
    ) -> Self {
        Self {
            turn_index,
            agent_role,
            action: action.into(),
            reasoning: reasoning.into(),
            observation: observation.into(),
            reward: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the environment's per-turn reward before the turn is appended.
    pub fn with_reward(mut self, reward: Option<f64>) -> Self {
        self.reward = reward;
        self
    }
}

// ---------------------------------------------------------------------------
// Trajectory
// ---------------------------------------------------------------------------

/// One complete multi-agent rollout.
///
/// Turn indices are contiguous from zero; `push_turn` refuses anything else.
/// The total reward is set exactly once by `finalize`, after which the
/// trajectory is read-only. Deserialization replays both checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "TrajectoryParts")]
pub struct MultiTurnTrajectory {
    pub episode_id: String,
    /// Index of this rollout within its beam; also the final tie-breaker.
    pub trajectory_id: usize,
    pub seed: u64,
    pub task: String,
    /// This member's nominal shift from each role's policy temperature. Near
    /// the temperature bounds the applied shift is slid to stay inside them.
    pub temperature_offset: f64,
    turns: Vec<Turn>,
    total_reward: Option<f64>,
}

impl MultiTurnTrajectory {
    pub fn new(
        episode_id: impl Into<String>,
        trajectory_id: usize,
        seed: u64,
        task: impl Into<String>,
        temperature_offset: f64,
    ) -> Self {
        Self {
            episode_id: episode_id.into(),
            trajectory_id,
            seed,
            task: task.into(),
            temperature_offset,
            turns: Vec::new(),
            total_reward: None,
        }
    }

    /// Append a turn; its index must equal the current length.
    pub fn push_turn(&mut self, turn: Turn) -> MarlResult<()> {
        if self.total_reward.is_some() {
            return Err(MarlError::InvalidTrajectory(format!(
                "trajectory {} of episode {} is finalized",
                self.trajectory_id, self.episode_id
            )));
        }
        if turn.turn_index != self.turns.len() {
            return Err(MarlError::InvalidTrajectory(format!(
                "expected turn index {}, got {}",
                self.turns.len(),
                turn.turn_index
            )));
        }
        self.turns.push(turn);
        Ok(())
    }

    /// Record the episode reward. Only allowed once.
    pub fn finalize(&mut self, total_reward: f64) -> MarlResult<()> {
        if self.total_reward.is_some() {
            return Err(MarlError::InvalidTrajectory(format!(
                "trajectory {} of episode {} already finalized",
                self.trajectory_id, self.episode_id
            )));
        }
        if !total_reward.is_finite() {
            return Err(MarlError::InvalidTrajectory(format!(
                "total reward must be finite, got {total_reward}"
            )));
        }
        self.total_reward = Some(total_reward);
        Ok(())
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn next_index(&self) -> usize {
        self.turns.len()
    }

    pub fn total_reward(&self) -> Option<f64> {
        self.total_reward
    }

    pub fn is_finalized(&self) -> bool {
        self.total_reward.is_some()
    }

    /// Distinct roles that contributed at least one turn.
    pub fn roles_present(&self) -> BTreeSet<AgentRole> {
        self.turns.iter().map(|t| t.agent_role).collect()
    }

    pub fn turns_by_role(&self, role: AgentRole) -> impl Iterator<Item = &Turn> {
        self.turns.iter().filter(move |t| t.agent_role == role)
    }

    /// Flatten into the persisted record format.
    pub fn to_record(&self, value: f64, advantage: f64, beam_size: usize) -> MarlResult<EpisodeRecord> {
        let total_reward = self.total_reward.ok_or_else(|| {
            MarlError::InvalidTrajectory(format!(
                "trajectory {} of episode {} is not finalized",
                self.trajectory_id, self.episode_id
            ))
        })?;
        Ok(EpisodeRecord {
            episode_id: self.episode_id.clone(),
            task: self.task.clone(),
            seed: self.seed,
            trajectory_id: self.trajectory_id,
            turns: self
                .turns
                .iter()
                .map(|t| TurnRecord {
                    turn_index: t.turn_index,
                    agent_role: t.agent_role,
                    action: t.action.clone(),
                    reward: t.reward,
                })
                .collect(),
            total_reward,
            value,
            advantage,
            beam_size,
            created_at: Utc::now(),
        })
    }
}

/// Unchecked wire form of [`MultiTurnTrajectory`].
#[derive(Deserialize)]
struct TrajectoryParts {
    episode_id: String,
    trajectory_id: usize,
    seed: u64,
    task: String,
    temperature_offset: f64,
    turns: Vec<Turn>,
    total_reward: Option<f64>,
}

impl TryFrom<TrajectoryParts> for MultiTurnTrajectory {
    type Error = MarlError;

    fn try_from(parts: TrajectoryParts) -> MarlResult<Self> {
        let mut trajectory = Self::new(
            parts.episode_id,
            parts.trajectory_id,
            parts.seed,
            parts.task,
            parts.temperature_offset,
        );
        for turn in parts.turns {
            trajectory.push_turn(turn)?;
        }
        if let Some(total) = parts.total_reward {
            trajectory.finalize(total)?;
        }
        Ok(trajectory)
    }
}

// ---------------------------------------------------------------------------
// Beam
// ---------------------------------------------------------------------------

/// K candidate rollouts sampled from the same starting context.
#[derive(Debug, Clone)]
pub struct TrajectoryBeam {
    episode_id: String,
    task: String,
    members: Vec<MultiTurnTrajectory>,
}

impl TrajectoryBeam {
    pub fn new(episode_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            episode_id: episode_id.into(),
            task: task.into(),
            members: Vec::new(),
        }
    }

    /// Add a member; it must share the beam's episode id and task.
    pub fn push(&mut self, member: MultiTurnTrajectory) -> MarlResult<()> {
        if member.episode_id != self.episode_id || member.task != self.task {
            return Err(MarlError::InvalidTrajectory(format!(
                "member {} belongs to episode {}, beam is {}",
                member.trajectory_id, member.episode_id, self.episode_id
            )));
        }
        self.members.push(member);
        Ok(())
    }

    pub fn episode_id(&self) -> &str {
        &self.episode_id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn members(&self) -> &[MultiTurnTrajectory] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn into_members(self) -> Vec<MultiTurnTrajectory> {
        self.members
    }
}

// ---------------------------------------------------------------------------
// Persisted record
// ---------------------------------------------------------------------------

/// A turn as written to the episode store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_index: usize,
    pub agent_role: AgentRole,
    pub action: String,
    #[serde(default)]
    pub reward: Option<f64>,
}

/// The on-disk episode contract consumed by analysis tooling and behavior
/// extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub episode_id: String,
    pub task: String,
    pub seed: u64,
    pub trajectory_id: usize,
    pub turns: Vec<TurnRecord>,
    pub total_reward: f64,
    /// Centralized value estimate of the kept trajectory.
    #[serde(default)]
    pub value: f64,
    /// Its group-relative advantage within the beam.
    #[serde(default)]
    pub advantage: f64,
    #[serde(default)]
    pub beam_size: usize,
    pub created_at: DateTime<Utc>,
}

impl EpisodeRecord {
    pub fn turns_by_role(&self, role: AgentRole) -> impl Iterator<Item = &TurnRecord> {
        self.turns.iter().filter(move |t| t.agent_role == role)
    }
}
