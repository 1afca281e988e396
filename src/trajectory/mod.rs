//! Trajectory types and episode persistence.
//!
//! This module provides:
//! - [`types::Turn`], [`types::MultiTurnTrajectory`], [`types::TrajectoryBeam`]
//!   -- what one rollout and one group of rollouts look like.
//! - [`types::EpisodeRecord`] -- the persisted episode format.
//! - [`store::EpisodeStore`] -- the append/read-all persistence capability,
//!   with JSON-lines and in-memory implementations.

pub mod store;
pub mod types;

pub use store::{EpisodeStore, InMemoryEpisodeStore, JsonlEpisodeStore};
pub use types::{EpisodeRecord, MultiTurnTrajectory, TrajectoryBeam, Turn, TurnRecord};
