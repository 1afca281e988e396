//! Error taxonomy for the training loop.
//!
//! Provider-level failures are modelled by [`CompletionError`]; everything the
//! core can surface to a caller is a [`MarlError`].  Per-turn and per-member
//! failures are contained by the optimizer; only exhausted retries reach the
//! trainer, which logs them and moves on.

use thiserror::Error;

/// Failure kinds reported by a completion provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompletionError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("provider error: {0}")]
    Provider(String),
}

impl CompletionError {
    /// Rate limits and timeouts are worth retrying; anything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Timeout(_))
    }
}

/// Errors surfaced by the optimizer, agents, behavior extraction and stores.
#[derive(Debug, Error)]
pub enum MarlError {
    #[error("transient provider error after {attempts} attempt(s): {source}")]
    TransientProvider {
        attempts: u32,
        #[source]
        source: CompletionError,
    },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("insufficient beam size: {valid} valid member(s), at least {required} required")]
    InsufficientBeamSize { valid: usize, required: usize },

    #[error("completion failed: {0}")]
    CacheComputeFailure(#[from] CompletionError),

    #[error("episode deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid trajectory: {0}")]
    InvalidTrajectory(String),

    #[error("environment error: {0}")]
    Environment(String),

    #[error("episode store error: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl MarlError {
    /// Whether retrying the same operation could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientProvider { .. } | Self::MalformedResponse(_) => true,
            Self::CacheComputeFailure(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type MarlResult<T> = Result<T, MarlError>;
