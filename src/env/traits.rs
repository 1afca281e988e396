//! The research environment capability.
//!
//! The optimizer never judges research quality itself: the environment
//! decides the turn schedule, what each role is shown, and the per-turn and
//! terminal rewards.

use async_trait::async_trait;

use crate::agent::AgentRole;
use crate::error::MarlResult;
use crate::trajectory::Turn;

/// Reward and observation source for one research task.
#[async_trait]
pub trait ResearchEnvironment: Send + Sync {
    /// Order in which roles speak for `task`. One entry per turn.
    fn schedule(&self, task: &str) -> Vec<AgentRole>;

    /// What `role` is shown before acting, given the turns so far.
    async fn observe(&self, task: &str, history: &[Turn], role: AgentRole) -> MarlResult<String>;

    /// Intermediate reward for `turn`, if the environment gives one.
    /// `history` holds the turns before it.
    async fn turn_reward(&self, task: &str, history: &[Turn], turn: &Turn) -> MarlResult<Option<f64>>;

    /// Terminal reward for a completed trajectory.
    async fn final_reward(&self, task: &str, turns: &[Turn]) -> MarlResult<f64>;
}
