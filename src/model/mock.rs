//! Deterministic completion providers for offline runs and tests.
//!
//! [`MockCompletionProvider`] fabricates plausible role contributions (and
//! behavior-extraction JSON) from a hash of its inputs, so identical requests
//! always produce identical text and different temperatures produce different
//! rollouts. [`ScriptedProvider`] replays queued responses, counts calls and
//! can inject failures or latency.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use super::provider::{CompletionProvider, SamplingParams, BEHAVIOR_EXTRACTOR_ROLE};
use crate::agent::AgentRole;
use crate::behavior::SuccessDimension;
use crate::error::CompletionError;

// ---------------------------------------------------------------------------
// Mock provider
// ---------------------------------------------------------------------------

/// Offline stand-in for a chat model.
#[derive(Debug, Default)]
pub struct MockCompletionProvider {
    calls: AtomicUsize,
}

impl MockCompletionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn role_response(role: AgentRole, prompt: &str, params: &SamplingParams) -> String {
        let mut hasher = DefaultHasher::new();
        role.hash(&mut hasher);
        prompt.hash(&mut hasher);
        params.temperature_key().hash(&mut hasher);
        let h = hasher.finish();

        let phrases = role_phrases(role);
        // Lower temperatures stay focused; higher ones add more (and riskier) detail.
        let detail = 1 + ((params.temperature.max(0.0) * 4.0).round() as usize + (h as usize % 2))
            .min(phrases.len() - 1);
        let body = phrases[..detail].join("; ");

        let reference = if prompt.contains("Turn 0 [") {
            let earlier = AgentRole::ALL[(h as usize) % AgentRole::ALL.len()];
            format!("Building on the {}'s contribution, ", earlier.title())
        } else {
            String::new()
        };

        format!(
            "As the {title} I considered the team history and the task.\n\
             Action: {reference}{body}.",
            title = role.title(),
        )
    }

    fn extraction_response(prompt: &str) -> String {
        let mut object = serde_json::Map::new();
        for role in AgentRole::ALL {
            if !prompt.contains(&format!("[{}]", role.as_str())) {
                continue;
            }
            let mut dims = serde_json::Map::new();
            for dim in SuccessDimension::ALL {
                dims.insert(
                    dim.as_str().to_string(),
                    json!([format!(
                        "{} {} pattern: {}",
                        role.title(),
                        dim.as_str().replace('_', " "),
                        role_phrases(role)[0]
                    )]),
                );
            }
            object.insert(role.as_str().to_string(), serde_json::Value::Object(dims));
        }
        format!(
            "Here is the analysis you asked for:\n```json\n{}\n```",
            serde_json::Value::Object(object)
        )
    }
}

fn role_phrases(role: AgentRole) -> [&'static str; 4] {
    match role {
        AgentRole::LiteratureSynthesizer => [
            "prior work establishes the baseline effect",
            "two recent studies disagree on mechanism",
            "the main gap is the lack of controlled comparisons",
            "meta-analytic evidence remains limited",
        ],
        AgentRole::HypothesisGenerator => [
            "we hypothesize the intervention increases the outcome",
            "the effect should be mediated by attention",
            "a null result would falsify the mechanism",
            "this predicts a dose-response relationship",
        ],
        AgentRole::ExperimentalDesigner => [
            "a randomized controlled experiment with two arms",
            "sample size of 200 per arm with a placebo control",
            "measure the outcome before and after the intervention",
            "blind the assessors to the condition",
        ],
        AgentRole::DataAnalyst => [
            "use a two-sided t-test at significance 0.05",
            "report effect sizes with confidence intervals",
            "correct for multiple comparisons",
            "check regression assumptions on the residuals",
        ],
        AgentRole::PaperWriter => [
            "abstract: we test whether the intervention improves the outcome",
            "our contribution is a preregistered controlled design",
            "results would clarify the disputed mechanism",
            "we discuss limitations and future work",
        ],
    }
}

#[async_trait]
impl CompletionProvider for MockCompletionProvider {
    fn model_id(&self) -> &str {
        "mock-model"
    }

    async fn complete(
        &self,
        role: &str,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<String, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if role == BEHAVIOR_EXTRACTOR_ROLE {
            return Ok(Self::extraction_response(prompt));
        }
        let role: AgentRole = role.parse().map_err(CompletionError::Provider)?;
        Ok(Self::role_response(role, prompt, params))
    }
}

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

type Handler = dyn Fn(&str, &str, &SamplingParams) -> Result<String, CompletionError> + Send + Sync;

/// Replays queued results first, then falls back to a handler closure.
pub struct ScriptedProvider {
    queue: Mutex<VecDeque<Result<String, CompletionError>>>,
    handler: Box<Handler>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    /// Every call answers `text` unless something is queued.
    pub fn always(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::with_handler(move |_, _, _| Ok(text.clone()))
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&str, &str, &SamplingParams) -> Result<String, CompletionError> + Send + Sync + 'static,
    {
        Self {
            queue: Mutex::new(VecDeque::new()),
            handler: Box::new(handler),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleep this long before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, result: Result<String, CompletionError>) {
        self.queue.lock().push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn model_id(&self) -> &str {
        "scripted-model"
    }

    async fn complete(
        &self,
        role: &str,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<String, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let queued = self.queue.lock().pop_front();
        match queued {
            Some(result) => result,
            None => (self.handler)(role, prompt, params),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::structured::parse_structured;

    #[tokio::test]
    async fn test_mock_is_deterministic_and_temperature_sensitive() {
        let mock = MockCompletionProvider::new();
        let low = SamplingParams::new(0.2, 256);
        let high = SamplingParams::new(1.0, 256);
        let a = mock.complete("data_analyst", "p", &low).await.unwrap();
        let b = mock.complete("data_analyst", "p", &low).await.unwrap();
        let c = mock.complete("data_analyst", "p", &high).await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.contains("\nAction: "));
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_rejects_unknown_role() {
        let mock = MockCompletionProvider::new();
        let err = mock
            .complete("janitor", "p", &SamplingParams::default())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_mock_extraction_is_parseable() {
        let mock = MockCompletionProvider::new();
        let text = mock
            .complete(
                BEHAVIOR_EXTRACTOR_ROLE,
                "[paper_writer]: abstract\n[data_analyst]: t-test",
                &SamplingParams::new(0.0, 512),
            )
            .await
            .unwrap();
        let value = parse_structured(&text).unwrap();
        assert!(value["paper_writer"]["novelty"].is_array());
        assert!(value["data_analyst"]["collaboration"].is_array());
        assert!(value.get("hypothesis_generator").is_none());
    }

    #[tokio::test]
    async fn test_scripted_queue_then_handler() {
        let provider = ScriptedProvider::always("Action: default");
        provider.push(Err(CompletionError::RateLimited("slow down".into())));
        let params = SamplingParams::default();
        assert!(provider.complete("r", "p", &params).await.is_err());
        assert_eq!(provider.complete("r", "p", &params).await.unwrap(), "Action: default");
        assert_eq!(provider.calls(), 2);
    }
}
