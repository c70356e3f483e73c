//! Ordered model fallback over a single provider endpoint.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::OnceCell;

use crate::error::LlmError;
use crate::provider::{LlmProvider, Message};
use crate::retry::{self, BackoffPolicy, Strategy, Verdict};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReply {
    pub text: String,
    pub model: String,
    pub attempts: u32,
}

/// Tries each configured model in order, stopping at the first success.
///
/// Before first use the chain asks the provider which models the deployment
/// actually serves and drops the rest. A model answering "not found" at runtime
/// is removed for the lifetime of the chain.
#[derive(Debug)]
pub struct ModelChain<P> {
    base: P,
    models: Vec<String>,
    policy: BackoffPolicy,
    resolved: OnceCell<Vec<String>>,
    missing: Mutex<HashSet<String>>,
}

impl<P: LlmProvider> ModelChain<P> {
    /// Build a chain over `models`. An empty list falls back to the provider's
    /// own model. Duplicates are dropped, order is kept.
    #[must_use]
    pub fn new(base: P, models: Vec<String>) -> Self {
        let mut seen = HashSet::new();
        let mut ordered: Vec<String> = models
            .into_iter()
            .map(|m| m.trim().to_owned())
            .filter(|m| !m.is_empty() && seen.insert(m.clone()))
            .collect();
        if ordered.is_empty() {
            ordered.push(base.model().to_owned());
        }
        Self {
            base,
            models: ordered,
            policy: BackoffPolicy::exponential(1, std::time::Duration::from_secs(1)),
            resolved: OnceCell::new(),
            missing: Mutex::new(HashSet::new()),
        }
    }

    /// Backoff applied when a model is rate limited before moving to the next one.
    #[must_use]
    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn configured_models(&self) -> &[String] {
        &self.models
    }

    #[must_use]
    pub fn provider(&self) -> &P {
        &self.base
    }

    /// Models still eligible for attempts, in fallback order.
    pub async fn available_models(&self) -> Vec<String> {
        let resolved = self
            .resolved
            .get_or_init(|| async { self.resolve_against_catalog().await })
            .await;
        let missing = self.missing.lock().map(|m| m.clone()).unwrap_or_default();
        resolved
            .iter()
            .filter(|m| !missing.contains(*m))
            .cloned()
            .collect()
    }

    async fn resolve_against_catalog(&self) -> Vec<String> {
        match self.base.list_models().await {
            Ok(catalog) if !catalog.is_empty() => {
                let (kept, dropped): (Vec<_>, Vec<_>) = self
                    .models
                    .iter()
                    .cloned()
                    .partition(|m| catalog.iter().any(|c| same_model(c, m)));
                if !dropped.is_empty() {
                    tracing::warn!(
                        provider = self.base.name(),
                        dropped = ?dropped,
                        "configured models not served by this deployment"
                    );
                }
                if kept.is_empty() {
                    tracing::warn!("no configured model found in catalog, trying all of them");
                    self.models.clone()
                } else {
                    kept
                }
            }
            Ok(_) => self.models.clone(),
            Err(e) => {
                tracing::debug!(error = %e, "model catalog unavailable, using configured order");
                self.models.clone()
            }
        }
    }

    fn mark_missing(&self, model: &str) {
        if let Ok(mut missing) = self.missing.lock() {
            missing.insert(model.to_owned());
        }
    }

    /// Send `messages` through the chain.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::NoModels` when nothing is left to try, or
    /// `LlmError::ChainExhausted` carrying the last model's error and whether
    /// any model refused on safety grounds.
    pub async fn chat(&self, messages: &[Message]) -> Result<ChainReply, LlmError> {
        let models = self.available_models().await;
        if models.is_empty() {
            return Err(LlmError::NoModels);
        }
        let providers: Vec<P> = models.iter().map(|m| self.base.for_model(m)).collect();
        let strategies: Vec<Strategy<'_, String, LlmError>> = providers
            .iter()
            .map(|p| Strategy::new(p.model().to_owned(), self.policy, move || p.chat(messages)))
            .collect();

        let safety_blocked = AtomicBool::new(false);
        let outcome = retry::execute(strategies, |e: &LlmError| match e {
            LlmError::RateLimited => Verdict::Retry,
            LlmError::SafetyBlocked { .. } => {
                safety_blocked.store(true, Ordering::Relaxed);
                Verdict::NextStrategy
            }
            LlmError::ModelNotFound { model } => {
                self.mark_missing(model);
                Verdict::NextStrategy
            }
            _ => Verdict::NextStrategy,
        })
        .await;

        match outcome {
            Ok(ok) => {
                tracing::debug!(model = %ok.label, attempts = ok.attempts, "model chain answered");
                Ok(ChainReply {
                    text: ok.value,
                    model: ok.label,
                    attempts: ok.attempts,
                })
            }
            Err(failure) => Err(LlmError::ChainExhausted {
                attempted: models.len(),
                safety_blocked: safety_blocked.load(Ordering::Relaxed),
                last: Box::new(failure.into_error(|| LlmError::NoModels)),
            }),
        }
    }
}

/// Catalog entries may carry a `models/` prefix (Gemini) or a `:latest` tag (Ollama).
fn same_model(catalog_entry: &str, configured: &str) -> bool {
    fn normalize(name: &str) -> &str {
        let name = name.strip_prefix("models/").unwrap_or(name);
        name.strip_suffix(":latest").unwrap_or(name)
    }
    normalize(catalog_entry) == normalize(configured)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::{MockOutcome, MockProvider};

    fn chain(base: MockProvider, models: &[&str]) -> ModelChain<MockProvider> {
        ModelChain::new(base, models.iter().map(|m| (*m).to_owned()).collect())
            .with_policy(BackoffPolicy::exponential(1, Duration::ZERO))
    }

    #[test]
    fn same_model_normalizes_prefix_and_tag() {
        assert!(same_model("models/gemini-2.0-flash", "gemini-2.0-flash"));
        assert!(same_model("llama3.2:latest", "llama3.2"));
        assert!(!same_model("gemini-1.5-pro", "gemini-2.0-flash"));
    }

    #[test]
    fn empty_model_list_uses_provider_model() {
        let c = chain(MockProvider::default().with_model("solo"), &[]);
        assert_eq!(c.configured_models(), ["solo"]);
    }

    #[tokio::test]
    async fn first_model_success_stops_chain() {
        let base = MockProvider::default();
        base.script("a", vec![MockOutcome::Reply("from a".into())]);
        let c = chain(base.clone(), &["a", "b"]);
        let reply = c.chat(&[Message::user("q")]).await.unwrap();
        assert_eq!(reply.model, "a");
        assert_eq!(reply.text, "from a");
        assert_eq!(base.called_models(), vec!["a"]);
    }

    #[tokio::test]
    async fn unavailable_falls_back_to_next_model() {
        let base = MockProvider::default();
        base.script("a", vec![MockOutcome::Unavailable]);
        base.script("b", vec![MockOutcome::Reply("from b".into())]);
        let reply = chain(base.clone(), &["a", "b"])
            .chat(&[Message::user("q")])
            .await
            .unwrap();
        assert_eq!(reply.model, "b");
        assert_eq!(reply.attempts, 2);
    }

    #[tokio::test]
    async fn rate_limit_retries_same_model_once() {
        let base = MockProvider::default();
        base.script(
            "a",
            vec![MockOutcome::RateLimited, MockOutcome::Reply("ok".into())],
        );
        let reply = chain(base.clone(), &["a", "b"])
            .chat(&[Message::user("q")])
            .await
            .unwrap();
        assert_eq!(reply.model, "a");
        assert_eq!(base.called_models(), vec!["a", "a"]);
    }

    #[tokio::test]
    async fn catalog_excludes_models_the_deployment_lacks() {
        let base = MockProvider::default().with_catalog(&["models/gemini-2.0-flash"]);
        base.script("gemini-2.0-flash", vec![MockOutcome::Reply("ok".into())]);
        let c = chain(base.clone(), &["gemini-1.0-pro", "gemini-2.0-flash"]);
        assert_eq!(c.available_models().await, vec!["gemini-2.0-flash"]);
        c.chat(&[Message::user("q")]).await.unwrap();
        assert_eq!(base.called_models(), vec!["gemini-2.0-flash"]);
    }

    #[tokio::test]
    async fn not_found_at_runtime_is_never_retried() {
        let base = MockProvider::default();
        base.script("ghost", vec![MockOutcome::NotFound]);
        let c = chain(base.clone(), &["ghost", "real"]);
        c.chat(&[Message::user("q")]).await.unwrap();
        c.chat(&[Message::user("q")]).await.unwrap();
        assert_eq!(base.called_models(), vec!["ghost", "real", "real"]);
    }

    #[tokio::test]
    async fn all_blocked_exhausts_with_safety_error() {
        let base = MockProvider::default();
        base.script("a", vec![MockOutcome::SafetyBlock]);
        base.script("b", vec![MockOutcome::SafetyBlock]);
        let err = chain(base, &["a", "b"])
            .chat(&[Message::user("q")])
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::ChainExhausted { attempted: 2, .. }));
        assert!(err.is_safety_block());
    }

    #[tokio::test]
    async fn block_then_outage_still_reports_safety_block() {
        let base = MockProvider::default();
        base.script("a", vec![MockOutcome::SafetyBlock]);
        base.script("b", vec![MockOutcome::Unavailable]);
        let err = chain(base.clone(), &["a", "b"])
            .chat(&[Message::user("q")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LlmError::ChainExhausted {
                safety_blocked: true,
                ..
            }
        ));
        assert!(err.is_safety_block());
        assert_eq!(base.called_models(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn every_model_missing_reports_no_models() {
        let base = MockProvider::default();
        base.script("only", vec![MockOutcome::NotFound]);
        let c = chain(base, &["only"]);
        assert!(c.chat(&[Message::user("q")]).await.is_err());
        assert!(matches!(
            c.chat(&[Message::user("q")]).await,
            Err(LlmError::NoModels)
        ));
    }
}
