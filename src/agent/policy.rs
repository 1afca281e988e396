//! Versioned per-role policy state.
//!
//! The "policy" here is not model weights but the prompting and sampling
//! strategy of each role: a base temperature and a short list of exemplar
//! actions taken from positively-advantaged rollouts. Agents read it at prompt
//! time; only the optimizer writes it, between beams.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::role::AgentRole;

/// An action excerpt that earned a positive group-relative advantage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar {
    pub action: String,
    pub advantage: f64,
    pub episode_id: String,
}

/// Prompting/sampling state of one role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyState {
    /// Incremented on every optimizer update.
    pub version: u64,
    /// Base sampling temperature for this role.
    pub temperature: f64,
    /// Sorted by advantage, best first.
    pub exemplars: Vec<Exemplar>,
    /// Exponential moving average of advantage-weighted credit.
    pub credit_ema: f64,
    pub updated_at: DateTime<Utc>,
}

impl PolicyState {
    pub fn new(temperature: f64) -> Self {
        Self {
            version: 0,
            temperature,
            exemplars: Vec::new(),
            credit_ema: 0.0,
            updated_at: Utc::now(),
        }
    }

    /// Insert an exemplar, keeping at most `max` sorted by advantage.
    ///
    /// An exemplar whose action text is already present only refreshes the
    /// stored advantage when the new one is higher.
    pub fn record_exemplar(&mut self, exemplar: Exemplar, max: usize) {
        if max == 0 {
            return;
        }
        match self.exemplars.iter_mut().find(|e| e.action == exemplar.action) {
            Some(existing) => {
                if exemplar.advantage > existing.advantage {
                    *existing = exemplar;
                }
            }
            None => self.exemplars.push(exemplar),
        }
        self.exemplars
            .sort_by(|a, b| b.advantage.total_cmp(&a.advantage));
        self.exemplars.truncate(max);
    }
}

/// All role policies behind a single lock.
#[derive(Debug)]
pub struct PolicyStore {
    states: RwLock<BTreeMap<AgentRole, PolicyState>>,
    base_temperature: f64,
}

impl PolicyStore {
    /// Every role starts at version 0 with `base_temperature`.
    pub fn new(base_temperature: f64) -> Self {
        let states = AgentRole::ALL
            .into_iter()
            .map(|role| (role, PolicyState::new(base_temperature)))
            .collect();
        Self {
            states: RwLock::new(states),
            base_temperature,
        }
    }

    /// Snapshot of one role's state.
    pub fn get(&self, role: AgentRole) -> Option<PolicyState> {
        self.states.read().get(&role).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<AgentRole, PolicyState> {
        self.states.read().clone()
    }

    /// Apply `f` to the role's state and bump its version.
    pub fn update<F>(&self, role: AgentRole, f: F)
    where
        F: FnOnce(&mut PolicyState),
    {
        let mut states = self.states.write();
        let state = states
            .entry(role)
            .or_insert_with(|| PolicyState::new(self.base_temperature));
        f(state);
        state.version += 1;
        state.updated_at = Utc::now();
    }

    pub fn versions(&self) -> BTreeMap<AgentRole, u64> {
        self.states
            .read()
            .iter()
            .map(|(role, s)| (*role, s.version))
            .collect()
    }
}
