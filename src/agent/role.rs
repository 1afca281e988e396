//! The fixed set of research-lab roles.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One specialist seat in the research lab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    LiteratureSynthesizer,
    HypothesisGenerator,
    ExperimentalDesigner,
    DataAnalyst,
    PaperWriter,
}

impl AgentRole {
    /// All roles in their default speaking order.
    pub const ALL: [AgentRole; 5] = [
        AgentRole::LiteratureSynthesizer,
        AgentRole::HypothesisGenerator,
        AgentRole::ExperimentalDesigner,
        AgentRole::DataAnalyst,
        AgentRole::PaperWriter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LiteratureSynthesizer => "literature_synthesizer",
            Self::HypothesisGenerator => "hypothesis_generator",
            Self::ExperimentalDesigner => "experimental_designer",
            Self::DataAnalyst => "data_analyst",
            Self::PaperWriter => "paper_writer",
        }
    }

    /// Human-readable title used in prompts and when detecting cross-references.
    pub fn title(&self) -> &'static str {
        match self {
            Self::LiteratureSynthesizer => "Literature Synthesizer",
            Self::HypothesisGenerator => "Hypothesis Generator",
            Self::ExperimentalDesigner => "Experimental Designer",
            Self::DataAnalyst => "Data Analyst",
            Self::PaperWriter => "Paper Writer",
        }
    }

    /// Fixed role instructions placed at the top of every prompt for the role.
    pub fn instructions(&self) -> &'static str {
        match self {
            Self::LiteratureSynthesizer => {
                "Survey the relevant prior work for the research question. Summarize the key \
                 findings, name the open gaps, and point the team at the most promising direction."
            }
            Self::HypothesisGenerator => {
                "Propose a specific, falsifiable hypothesis that addresses a gap identified by the \
                 team. State the expected effect and why it would matter."
            }
            Self::ExperimentalDesigner => {
                "Design an experiment that tests the current hypothesis. Specify variables, \
                 controls, sample size, and the measurements to collect."
            }
            Self::DataAnalyst => {
                "Describe how the experimental data will be analyzed: statistical tests, \
                 significance thresholds, and how results would confirm or refute the hypothesis."
            }
            Self::PaperWriter => {
                "Write a concise paper abstract that integrates the team's literature review, \
                 hypothesis, design and analysis into a coherent contribution."
            }
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentRole::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown agent role: {s}"))
    }
}

/// Default turn schedule: every role once per round, in speaking order.
pub fn default_schedule(rounds: usize) -> Vec<AgentRole> {
    (0..rounds.max(1)).flat_map(|_| AgentRole::ALL).collect()
}
