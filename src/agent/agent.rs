//! The role-bound agent: builds a prompt from role instructions, team
//! history, learned behaviors and policy exemplars, obtains a completion
//! through the shared [`ResponseCache`] and parses it into a [`Turn`].

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::policy::PolicyStore;
use super::role::AgentRole;
use crate::behavior::BehaviorLibrary;
use crate::config::AgentConfig;
use crate::error::{MarlError, MarlResult};
use crate::model::cache::{CacheKey, ResponseCache};
use crate::model::prompt::{agent_action_prompt, ActionPromptInput};
use crate::model::provider::{CompletionProvider, SamplingParams};
use crate::model::retry::RetryPolicy;
use crate::trajectory::Turn;

/// Per-call inputs that are not part of the trajectory history.
#[derive(Debug, Clone, Copy)]
pub struct AgentContext<'a> {
    pub episode_id: &'a str,
    pub task: &'a str,
    /// What the environment shows this role before it acts.
    pub observation: &'a str,
    pub temperature: f64,
}

/// A role binding shared across all episodes.
///
/// Stateless per call: the only cross-episode state it reads is the role's
/// policy and the behavior library, neither of which it writes.
pub struct Agent {
    role: AgentRole,
    provider: Arc<dyn CompletionProvider>,
    cache: Arc<ResponseCache>,
    behaviors: Arc<RwLock<BehaviorLibrary>>,
    policies: Arc<PolicyStore>,
    retry: RetryPolicy,
    max_tokens: usize,
    behaviors_per_dimension: usize,
    exemplars_in_prompt: usize,
    malformed_retries: u32,
}

impl Agent {
    pub fn new(
        role: AgentRole,
        provider: Arc<dyn CompletionProvider>,
        cache: Arc<ResponseCache>,
        behaviors: Arc<RwLock<BehaviorLibrary>>,
        policies: Arc<PolicyStore>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            role,
            provider,
            cache,
            behaviors,
            policies,
            retry: config.retry.clone(),
            max_tokens: config.max_tokens,
            behaviors_per_dimension: config.behaviors_per_dimension,
            exemplars_in_prompt: config.exemplars_in_prompt,
            malformed_retries: config.malformed_retries,
        }
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    /// Produce the next turn given the trajectory so far.
    ///
    /// The returned turn's index is `history.len()`; the caller appends it.
    /// A completion without a usable `Action:` line is never cached and is
    /// re-requested up to `malformed_retries` times before
    /// [`MarlError::MalformedResponse`] is returned.
    pub async fn act(&self, history: &[Turn], ctx: &AgentContext<'_>) -> MarlResult<Turn> {
        let behaviors = self
            .behaviors
            .read()
            .await
            .recent_behaviors_for(self.role, self.behaviors_per_dimension);
        let exemplars: Vec<_> = self
            .policies
            .get(self.role)
            .map(|p| p.exemplars.into_iter().take(self.exemplars_in_prompt).collect())
            .unwrap_or_default();

        let prompt = agent_action_prompt(&ActionPromptInput {
            role: self.role,
            task: ctx.task,
            observation: ctx.observation,
            history,
            behaviors: &behaviors,
            exemplars: &exemplars,
        });
        let params = SamplingParams::new(ctx.temperature, self.max_tokens);
        let key = CacheKey::new(self.role.as_str(), &prompt, &params, self.provider.model_id());

        let mut attempt = 0u32;
        let text = loop {
            let result = self
                .cache
                .get_or_compute(key.clone(), || self.complete_validated(&prompt, &params))
                .await;
            match result {
                Ok(text) => break text,
                Err(MarlError::MalformedResponse(reason)) if attempt < self.malformed_retries => {
                    attempt += 1;
                    warn!(
                        role = %self.role,
                        episode = ctx.episode_id,
                        attempt,
                        reason = %reason,
                        "malformed completion, requesting again"
                    );
                }
                Err(err) => return Err(err),
            }
        };

        let (reasoning, action) = parse_action_response(&text)?;
        debug!(
            role = %self.role,
            episode = ctx.episode_id,
            turn = history.len(),
            action_chars = action.len(),
            "agent produced action"
        );
        Ok(Turn::new(history.len(), self.role, action, reasoning, ctx.observation))
    }

    /// Provider call with transient retries; only well-formed text succeeds.
    async fn complete_validated(&self, prompt: &str, params: &SamplingParams) -> MarlResult<String> {
        let role = self.role.as_str();
        let text = self
            .retry
            .execute(|| self.provider.complete(role, prompt, params))
            .await?;
        parse_action_response(&text)?;
        Ok(text)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Split a completion into `(reasoning, action)`.
///
/// The action is everything after the last line starting with `Action:`
/// (case-insensitive), including any continuation lines; everything before
/// that line is reasoning. A missing marker or an empty action is an error.
pub fn parse_action_response(response: &str) -> MarlResult<(String, String)> {
    const MARKER: &str = "action:";
    let lines: Vec<&str> = response.lines().collect();

    let idx = lines
        .iter()
        .rposition(|line| {
            line.trim_start()
                .get(..MARKER.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(MARKER))
        })
        .ok_or_else(|| MarlError::MalformedResponse("no 'Action:' line in completion".into()))?;

    let first = &lines[idx].trim_start()[MARKER.len()..];
    let mut action = first.trim().to_string();
    for continuation in &lines[idx + 1..] {
        action.push('\n');
        action.push_str(continuation);
    }
    let action = action.trim().to_string();
    if action.is_empty() {
        return Err(MarlError::MalformedResponse("empty action".into()));
    }

    let reasoning = lines[..idx].join("\n").trim().to_string();
    Ok((reasoning, action))
}
