//! Orchestry MARL: group-relative policy optimization for teams of
//! API-driven research agents.
//!
//! Five role-bound agents (literature synthesizer, hypothesis generator,
//! experimental designer, data analyst, paper writer) take turns on a research
//! task. Each episode samples a beam of team rollouts at different
//! temperatures, scores them with a centralized value estimator, keeps the
//! best one and nudges each role's prompting policy by the group-relative
//! advantages. Periodically the top episodes are mined for behaviors that are
//! injected back into every agent's prompt.

pub mod agent;
pub mod behavior;
pub mod config;
pub mod env;
pub mod error;
pub mod model;
pub mod trajectory;
pub mod training;

pub use error::{CompletionError, MarlError, MarlResult};
