//! Behavior data types.
//!
//! A **behavior** is a short natural-language description of something a role
//! did in a high-reward episode, filed under one of the three success
//! dimensions and injected into that role's future prompts.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentRole;

/// The axes along which episode success is analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessDimension {
    Collaboration,
    ScientificRigor,
    Novelty,
}

impl SuccessDimension {
    pub const ALL: [SuccessDimension; 3] = [
        SuccessDimension::Collaboration,
        SuccessDimension::ScientificRigor,
        SuccessDimension::Novelty,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collaboration => "collaboration",
            Self::ScientificRigor => "scientific_rigor",
            Self::Novelty => "novelty",
        }
    }
}

impl fmt::Display for SuccessDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SuccessDimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SuccessDimension::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown success dimension: {s}"))
    }
}

/// One stored behavior with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorEntry {
    pub description: String,
    pub source_episode_id: String,
    pub extracted_at: DateTime<Utc>,
    /// Extraction round that produced the entry (1-based).
    #[serde(default)]
    pub round: usize,
}

impl BehaviorEntry {
    pub fn new(description: impl Into<String>, source_episode_id: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            source_episode_id: source_episode_id.into(),
            extracted_at: Utc::now(),
            round: 0,
        }
    }
}

/// An episode whose extraction produced nothing usable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionFailure {
    pub episode_id: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl ExtractionFailure {
    pub fn new(episode_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            episode_id: episode_id.into(),
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}

/// Role → dimension → ordered behavior descriptions; what agents consume.
pub type BehaviorMap = BTreeMap<AgentRole, BTreeMap<SuccessDimension, Vec<String>>>;

/// Newly extracted behaviors that have not been merged yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BehaviorDelta {
    entries: BTreeMap<AgentRole, BTreeMap<SuccessDimension, Vec<BehaviorEntry>>>,
}

impl BehaviorDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, role: AgentRole, dimension: SuccessDimension, entry: BehaviorEntry) {
        self.entries
            .entry(role)
            .or_default()
            .entry(dimension)
            .or_default()
            .push(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = (AgentRole, SuccessDimension, &BehaviorEntry)> {
        self.entries.iter().flat_map(|(role, dims)| {
            dims.iter()
                .flat_map(move |(dim, list)| list.iter().map(move |e| (*role, *dim, e)))
        })
    }

    pub fn len(&self) -> usize {
        self.entries
            .values()
            .flat_map(|dims| dims.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_entries(self) -> BTreeMap<AgentRole, BTreeMap<SuccessDimension, Vec<BehaviorEntry>>> {
        self.entries
    }
}

// ---------------------------------------------------------------------------
// Near-duplicate detection
// ---------------------------------------------------------------------------

/// Lowercased alphanumeric tokens of `text`.
pub fn normalized_tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard similarity of two token sets; two empty sets are identical.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}
