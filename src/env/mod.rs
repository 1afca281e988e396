//! Research environment abstraction and the bundled heuristic implementation.
//!
//! Every environment implements [`ResearchEnvironment`] so the optimizer can
//! drive rollouts uniformly. [`research_lab::HeuristicLabEnv`] is a
//! deterministic scorer that makes offline runs and tests possible without an
//! external evaluator.

pub mod research_lab;
pub mod traits;

pub use research_lab::HeuristicLabEnv;
pub use traits::ResearchEnvironment;
