//! Training: value estimation, group-relative optimization and the outer loop.
//!
//! - [`value`] scores whole multi-agent trajectories from a centralized view.
//! - [`advantage`] turns a beam's values into group-relative advantages and
//!   ranks the members.
//! - [`grpo`] samples beams, picks the best member and updates per-role
//!   policy state.
//! - [`trainer`] runs episodes, persists them and feeds the behavior library.

pub mod advantage;
pub mod grpo;
pub mod trainer;
pub mod value;

pub use advantage::{compute_group_advantages, group_stats, rank_members, MemberScore};
pub use grpo::{EpisodeOutcome, GroupRelativeOptimizer};
pub use trainer::{EpisodeMetrics, MarlTrainer, TrainingSummary};
pub use value::{cross_reference_rate, CentralizedValueEstimator, TrajectoryValue};
