//! Agent module: role-bound policy wrappers.
//!
//! An [`Agent`] turns the team history into a prompt for its [`AgentRole`],
//! injects learned behaviors and the role's [`PolicyState`] exemplars, calls
//! the completion capability through the shared response cache and parses a
//! structured action.

pub mod agent;
pub mod policy;
pub mod role;

pub use agent::{parse_action_response, Agent, AgentContext};
pub use policy::{Exemplar, PolicyState, PolicyStore};
pub use role::{default_schedule, AgentRole};
