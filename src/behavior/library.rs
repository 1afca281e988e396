//! Behavior library: role × success dimension → ordered behavior entries.
//!
//! The library grows monotonically through [`BehaviorLibrary::merge`], which
//! drops near-duplicates (token Jaccard similarity at or above the configured
//! threshold) so repeated extraction rounds do not inflate prompts. Entries are
//! only removed by an explicit [`BehaviorLibrary::prune`].

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::types::{
    jaccard, normalized_tokens, BehaviorDelta, BehaviorEntry, BehaviorMap, ExtractionFailure,
    SuccessDimension,
};
use crate::agent::AgentRole;

fn default_dedup_threshold() -> f64 {
    0.8
}

/// Persistent store of extracted behaviors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorLibrary {
    behaviors: BTreeMap<AgentRole, BTreeMap<SuccessDimension, Vec<BehaviorEntry>>>,
    /// Episodes whose extraction produced nothing usable.
    #[serde(default)]
    failures: Vec<ExtractionFailure>,
    /// Number of merges performed so far.
    #[serde(default)]
    round: usize,
    #[serde(default = "default_dedup_threshold")]
    dedup_threshold: f64,
}

impl Default for BehaviorLibrary {
    fn default() -> Self {
        Self::new(default_dedup_threshold())
    }
}

impl BehaviorLibrary {
    pub fn new(dedup_threshold: f64) -> Self {
        Self {
            behaviors: BTreeMap::new(),
            failures: Vec::new(),
            round: 0,
            dedup_threshold,
        }
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Append the delta's behaviors, skipping near-duplicates of existing
    /// entries (and of entries added earlier in the same delta) for the same
    /// role and dimension. Returns the number of entries added.
    pub fn merge(&mut self, delta: BehaviorDelta) -> usize {
        self.round += 1;
        let round = self.round;
        let mut added = 0;
        let mut skipped = 0;

        for (role, dims) in delta.into_entries() {
            for (dim, entries) in dims {
                for mut entry in entries {
                    let description = entry.description.trim();
                    if description.is_empty() || self.is_near_duplicate(role, dim, description) {
                        skipped += 1;
                        continue;
                    }
                    entry.description = description.to_string();
                    entry.round = round;
                    self.behaviors
                        .entry(role)
                        .or_default()
                        .entry(dim)
                        .or_default()
                        .push(entry);
                    added += 1;
                }
            }
        }

        debug!(round, added, skipped, "merged behavior delta");
        added
    }

    pub fn record_failures(&mut self, failures: impl IntoIterator<Item = ExtractionFailure>) {
        self.failures.extend(failures);
    }

    /// Keep only the `max_per_dimension` most recent entries in every list.
    /// Returns how many entries were removed.
    pub fn prune(&mut self, max_per_dimension: usize) -> usize {
        let mut removed = 0;
        for list in self.behaviors.values_mut().flat_map(|dims| dims.values_mut()) {
            let excess = list.len().saturating_sub(max_per_dimension);
            list.drain(..excess);
            removed += excess;
        }
        if removed > 0 {
            info!(removed, max_per_dimension, "pruned behavior library");
        }
        removed
    }

    /// Whether `description` is near-identical to a stored entry for the same
    /// role and dimension.
    pub fn is_near_duplicate(&self, role: AgentRole, dim: SuccessDimension, description: &str) -> bool {
        let tokens = normalized_tokens(description);
        self.entries(role, dim)
            .iter()
            .any(|e| jaccard(&tokens, &normalized_tokens(&e.description)) >= self.dedup_threshold)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn entries(&self, role: AgentRole, dim: SuccessDimension) -> &[BehaviorEntry] {
        self.behaviors
            .get(&role)
            .and_then(|dims| dims.get(&dim))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// All behavior descriptions for `role`, by dimension, oldest first.
    pub fn behaviors_for(&self, role: AgentRole) -> BTreeMap<SuccessDimension, Vec<String>> {
        self.recent_behaviors_for(role, usize::MAX)
    }

    /// At most `per_dimension` of the newest descriptions per dimension,
    /// still in insertion order.
    pub fn recent_behaviors_for(
        &self,
        role: AgentRole,
        per_dimension: usize,
    ) -> BTreeMap<SuccessDimension, Vec<String>> {
        let Some(dims) = self.behaviors.get(&role) else {
            return BTreeMap::new();
        };
        dims.iter()
            .filter(|(_, list)| !list.is_empty() && per_dimension > 0)
            .map(|(dim, list)| {
                let start = list.len().saturating_sub(per_dimension);
                let descriptions = list[start..].iter().map(|e| e.description.clone()).collect();
                (*dim, descriptions)
            })
            .collect()
    }

    /// The full role → dimension → descriptions mapping.
    pub fn injection_map(&self) -> BehaviorMap {
        self.behaviors
            .keys()
            .map(|role| (*role, self.behaviors_for(*role)))
            .filter(|(_, dims)| !dims.is_empty())
            .collect()
    }

    pub fn failures(&self) -> &[ExtractionFailure] {
        &self.failures
    }

    pub fn round(&self) -> usize {
        self.round
    }

    pub fn len(&self) -> usize {
        self.behaviors
            .values()
            .flat_map(|dims| dims.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry count per role.
    pub fn count_by_role(&self) -> BTreeMap<AgentRole, usize> {
        self.behaviors
            .iter()
            .map(|(role, dims)| (*role, dims.values().map(Vec::len).sum()))
            .collect()
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize BehaviorLibrary to JSON")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write BehaviorLibrary to {}", path.display()))?;
        info!(path = %path.display(), behaviors = self.len(), "Saved behavior library");
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read BehaviorLibrary from {}", path.display()))?;
        let library: Self =
            serde_json::from_str(&data).context("Failed to deserialize BehaviorLibrary JSON")?;
        info!(path = %path.display(), behaviors = library.len(), "Loaded behavior library");
        Ok(library)
    }
}
