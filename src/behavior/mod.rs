//! Behavior library: mining top episodes for reusable patterns.
//!
//! 1. **Types** ([`types`]) -- success dimensions, entries, deltas and the
//!    near-duplicate measure.
//! 2. **Library** ([`library`]) -- the role × dimension store agents read at
//!    prompt time.
//! 3. **Extraction** ([`extraction`]) -- top-episode selection and the
//!    LLM-driven extraction pass producing a [`BehaviorDelta`].

pub mod extraction;
pub mod library;
pub mod types;

pub use extraction::{behaviors_from_json, select_top_episodes, BehaviorExtractor, ExtractionOutcome};
pub use library::BehaviorLibrary;
pub use types::{
    jaccard, normalized_tokens, BehaviorDelta, BehaviorEntry, BehaviorMap, ExtractionFailure,
    SuccessDimension,
};
