//! The completion capability consumed by agents and behavior extraction.

use async_trait::async_trait;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::error::CompletionError;

/// Caller role used for behavior-extraction requests.
pub const BEHAVIOR_EXTRACTOR_ROLE: &str = "behavior_extractor";

/// Sampling parameters for one completion call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f64,
    pub max_tokens: usize,
}

impl SamplingParams {
    pub fn new(temperature: f64, max_tokens: usize) -> Self {
        Self {
            temperature,
            max_tokens,
        }
    }

    /// Temperature in a hashable form for cache keys.
    pub fn temperature_key(&self) -> OrderedFloat<f64> {
        // -0.0 and 0.0 must key identically.
        OrderedFloat(if self.temperature == 0.0 { 0.0 } else { self.temperature })
    }
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self::new(0.7, 1024)
    }
}

/// Turns a (role, prompt, sampling parameters) triple into completion text.
///
/// Retry and backoff are the caller's responsibility; implementations report a
/// single attempt.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Identifier of the backing model, part of every cache key.
    fn model_id(&self) -> &str;

    async fn complete(
        &self,
        role: &str,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<String, CompletionError>;
}
