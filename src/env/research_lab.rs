//! Deterministic heuristic research-lab environment.
//!
//! Scores contributions by role-specific vocabulary and by whether they build
//! on earlier teammates. It has no notion of whether the science is good; it
//! only gives the optimizer a stable, reproducible signal for offline runs.

use async_trait::async_trait;

use super::traits::ResearchEnvironment;
use crate::agent::{default_schedule, AgentRole};
use crate::error::MarlResult;
use crate::trajectory::Turn;

const KEYWORD_WEIGHT: f64 = 0.25;
const MAX_KEYWORD_SCORE: f64 = 1.0;
const REFERENCE_BONUS: f64 = 0.25;
const COVERAGE_WEIGHT: f64 = 2.0;
const ABSTRACT_BONUS: f64 = 1.0;

fn role_keywords(role: AgentRole) -> &'static [&'static str] {
    match role {
        AgentRole::LiteratureSynthesizer => &["prior work", "studies", "gap", "evidence", "literature", "meta-analytic"],
        AgentRole::HypothesisGenerator => &["hypothes", "predict", "falsif", "mechanism", "dose-response"],
        AgentRole::ExperimentalDesigner => &["control", "randomi", "sample size", "variable", "measure", "blind"],
        AgentRole::DataAnalyst => &[
            "t-test",
            "significance",
            "effect size",
            "confidence interval",
            "regression",
            "multiple comparisons",
        ],
        AgentRole::PaperWriter => &["abstract", "contribution", "results", "limitation", "future work"],
    }
}

/// Keyword/structure scorer over a fixed round-robin schedule.
#[derive(Debug, Clone)]
pub struct HeuristicLabEnv {
    rounds: usize,
}

impl HeuristicLabEnv {
    pub fn new(rounds: usize) -> Self {
        Self {
            rounds: rounds.max(1),
        }
    }

    /// Score of a single contribution given the turns before it.
    pub fn score_turn(history: &[Turn], turn: &Turn) -> f64 {
        let text = turn.action.to_lowercase();
        let hits = role_keywords(turn.agent_role)
            .iter()
            .filter(|kw| text.contains(*kw))
            .count();
        let keyword_score = (hits as f64 * KEYWORD_WEIGHT).min(MAX_KEYWORD_SCORE);

        let references_team = history.iter().any(|earlier| {
            earlier.agent_role != turn.agent_role
                && text.contains(&earlier.agent_role.title().to_lowercase())
        });
        keyword_score + if references_team { REFERENCE_BONUS } else { 0.0 }
    }
}

impl Default for HeuristicLabEnv {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl ResearchEnvironment for HeuristicLabEnv {
    fn schedule(&self, _task: &str) -> Vec<AgentRole> {
        default_schedule(self.rounds)
    }

    async fn observe(&self, task: &str, history: &[Turn], role: AgentRole) -> MarlResult<String> {
        let per_round = AgentRole::ALL.len();
        let round = history.len() / per_round + 1;
        let last = match history.last() {
            Some(t) => format!("The last contribution came from the {}.", t.agent_role.title()),
            None => "You open the discussion.".to_string(),
        };
        Ok(format!(
            "Round {round} of {rounds} on \"{task}\". You are the {title}. {count} contribution(s) so far. {last}",
            rounds = self.rounds,
            title = role.title(),
            count = history.len(),
        ))
    }

    async fn turn_reward(&self, _task: &str, history: &[Turn], turn: &Turn) -> MarlResult<Option<f64>> {
        Ok(Some(Self::score_turn(history, turn)))
    }

    async fn final_reward(&self, _task: &str, turns: &[Turn]) -> MarlResult<f64> {
        let per_turn: f64 = turns
            .iter()
            .enumerate()
            .map(|(i, t)| Self::score_turn(&turns[..i], t))
            .sum();

        let mut roles: Vec<AgentRole> = turns.iter().map(|t| t.agent_role).collect();
        roles.sort();
        roles.dedup();
        let coverage = roles.len() as f64 / AgentRole::ALL.len() as f64;

        let has_abstract = turns.last().is_some_and(|t| {
            t.agent_role == AgentRole::PaperWriter && t.action.to_lowercase().contains("abstract")
        });

        Ok(per_turn
            + COVERAGE_WEIGHT * coverage
            + if has_abstract { ABSTRACT_BONUS } else { 0.0 })
    }
}
