//! Response cache that makes duplicate completion calls free.
//!
//! Entries are keyed by everything that influences a completion: caller role,
//! canonical prompt text, temperature, max tokens and model id.  Each key owns
//! a [`tokio::sync::OnceCell`], so concurrent requests for the same key wait on
//! a single in-flight computation while unrelated keys proceed independently
//! (the outer map is sharded by [`DashMap`]).  Errors are never cached: a
//! failed computation's empty cell is dropped unless another caller is still
//! waiting on it, and the next caller computes again.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use ordered_float::OrderedFloat;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

use super::provider::SamplingParams;

// ---------------------------------------------------------------------------
// Key
// ---------------------------------------------------------------------------

/// Deterministic identity of one completion request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    role: String,
    prompt: String,
    temperature: OrderedFloat<f64>,
    max_tokens: usize,
    model_id: String,
}

impl CacheKey {
    pub fn new(role: &str, prompt: &str, params: &SamplingParams, model_id: &str) -> Self {
        Self {
            role: role.to_string(),
            prompt: canonicalize_prompt(prompt),
            temperature: params.temperature_key(),
            max_tokens: params.max_tokens,
            model_id: model_id.to_string(),
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }
}

/// Normalize line endings and strip trailing whitespace so that cosmetically
/// different prompts share an entry.
pub fn canonicalize_prompt(prompt: &str) -> String {
    prompt
        .replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Process-wide memo of completion results.
///
/// Unbounded by default. With `max_entries` set, the oldest completed entry is
/// evicted once the bound is exceeded.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: DashMap<CacheKey, Arc<OnceCell<String>>>,
    insertion_order: Mutex<VecDeque<CacheKey>>,
    max_entries: Option<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bounded(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries.max(1)),
            ..Self::default()
        }
    }

    pub fn with_capacity(max_entries: Option<usize>) -> Self {
        match max_entries {
            Some(n) => Self::bounded(n),
            None => Self::new(),
        }
    }

    /// Return the cached completion for `key`, or run `compute` and store its
    /// successful result.
    ///
    /// `compute` runs at most once per key while an earlier success is
    /// retained. Concurrent callers for the same key wait for the in-flight
    /// computation instead of starting their own; if it fails, the next waiter
    /// tries again.
    pub async fn get_or_compute<F, Fut, E>(&self, key: CacheKey, compute: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        // Declared before `cell` so it runs after our handle is gone.
        let _pending = PendingEntry {
            entries: &self.entries,
            key: key.clone(),
        };
        let cell = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        if let Some(value) = cell.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(role = key.role(), "response cache hit");
            return Ok(value.clone());
        }

        let mut invoked = false;
        let result = cell
            .get_or_try_init(|| {
                invoked = true;
                compute()
            })
            .await
            .cloned();

        if invoked {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else if result.is_ok() {
            // Joined another caller's computation.
            self.hits.fetch_add(1, Ordering::Relaxed);
        }

        match &result {
            Ok(_) if invoked => {
                debug!(role = key.role(), "response cache stored new entry");
                self.record_insertion(key);
            }
            Err(_) => debug!(role = key.role(), "compute failed; nothing cached"),
            Ok(_) => {}
        }

        result
    }

    /// Look up a completed entry without computing anything.
    pub fn get(&self, key: &CacheKey) -> Option<String> {
        self.entries
            .get(key)
            .and_then(|cell| cell.get().cloned())
    }

    /// Number of completed entries.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.insertion_order.lock().clear();
    }

    fn record_insertion(&self, key: CacheKey) {
        let Some(max) = self.max_entries else {
            return;
        };
        let evicted: Vec<CacheKey> = {
            let mut order = self.insertion_order.lock();
            order.push_back(key);
            let excess = order.len().saturating_sub(max);
            order.drain(..excess).collect()
        };
        for old in evicted {
            self.entries.remove(&old);
            debug!(role = old.role(), "evicted oldest cache entry");
        }
    }
}

/// Removes a key's cell if it is still empty and unshared when the caller
/// leaves, whether by success, failure or cancellation.
struct PendingEntry<'a> {
    entries: &'a DashMap<CacheKey, Arc<OnceCell<String>>>,
    key: CacheKey,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.entries
            .remove_if(&self.key, |_, cell| !cell.initialized() && Arc::strong_count(cell) == 1);
    }
}
