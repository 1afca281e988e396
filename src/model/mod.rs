//! Model access: the completion capability and everything wrapped around it.
//!
//! This module provides:
//! - [`provider::CompletionProvider`] -- the completion capability agents and
//!   behavior extraction consume, plus [`provider::SamplingParams`].
//! - [`api::LlmClient`] -- OpenAI-compatible chat completion client.
//! - [`mock`] -- deterministic providers for offline runs and tests.
//! - [`cache::ResponseCache`] -- per-key coalescing memo of completions.
//! - [`retry::RetryPolicy`] -- bounded exponential backoff.
//! - [`structured::parse_structured`] -- first balanced JSON object extraction.
//! - [`prompt`] -- agent action and behavior extraction templates.

pub mod api;
pub mod cache;
pub mod mock;
pub mod prompt;
pub mod provider;
pub mod retry;
pub mod structured;

pub use api::{ChatMessage, ChatResponse, Choice, LlmClient, Usage};
pub use cache::{CacheKey, CacheStats, ResponseCache};
pub use mock::{MockCompletionProvider, ScriptedProvider};
pub use provider::{CompletionProvider, SamplingParams, BEHAVIOR_EXTRACTOR_ROLE};
pub use retry::RetryPolicy;
pub use structured::{parse_structured, ParseError};
