//! Model-driven gap identification.

use lacuna_llm::retry::{self, BackoffPolicy, Strategy, Verdict};
use lacuna_llm::{ChainReply, LlmError, LlmProvider, Message, ModelChain};

use super::parser::{self, DroppedRecord, ParseOutcome};
use super::prompt::{self, PromptInput};
use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, Result};
use crate::gap::Gap;

const ORIGINAL: &str = "original";
const SANITIZED: &str = "sanitized";

/// Gaps identified by one analysis call.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub gaps: Vec<Gap>,
    /// Model that produced the accepted response.
    pub model: String,
    /// Whether the neutral rephrasing was needed after a safety block.
    pub sanitized: bool,
    pub dropped: Vec<DroppedRecord>,
    /// Set when nothing in the response could be parsed.
    pub parse_failure: Option<String>,
}

/// Sends the analysis prompt through the model chain and parses the reply.
///
/// A safety-filter block, or a canned apology in place of an answer, triggers
/// exactly one retry with the sanitized prompt. Any other chain failure ends
/// the call.
#[derive(Debug)]
pub struct AnalysisEngine<P> {
    chain: ModelChain<P>,
    config: AnalysisConfig,
}

impl<P: LlmProvider> AnalysisEngine<P> {
    #[must_use]
    pub fn new(chain: ModelChain<P>, config: AnalysisConfig) -> Self {
        Self { chain, config }
    }

    #[must_use]
    pub fn chain(&self) -> &ModelChain<P> {
        &self.chain
    }

    #[must_use]
    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// One chat round through the chain. A fallback apology counts as a
    /// safety block.
    ///
    /// # Errors
    ///
    /// Returns the chain error, or `LlmError::SafetyBlocked` for an apology.
    pub async fn complete(&self, messages: &[Message]) -> std::result::Result<ChainReply, LlmError> {
        let reply = self.chain.chat(messages).await?;
        if parser::is_fallback_message(&reply.text) {
            tracing::warn!(model = %reply.model, "model answered with a fallback message");
            return Err(LlmError::SafetyBlocked {
                model: reply.model,
                reason: "fallback message instead of an analysis".into(),
            });
        }
        Ok(reply)
    }

    /// Identify gaps in `input` for `document_id`.
    ///
    /// # Errors
    ///
    /// Returns `AnalysisError::SafetyBlocked` when the sanitized retry is also
    /// blocked (or disabled), and `AnalysisError::ModelChainExhausted` when
    /// every model failed for another reason.
    pub async fn analyze(&self, document_id: &str, input: &PromptInput<'_>) -> Result<EngineOutput> {
        let original = prompt::analysis_messages(input, &self.config);
        let sanitized = prompt::sanitized_messages(input, &self.config);
        let (original, sanitized) = (original.as_slice(), sanitized.as_slice());

        let mut strategies: Vec<Strategy<'_, ChainReply, LlmError>> =
            vec![Strategy::new(ORIGINAL, BackoffPolicy::ONCE, move || {
                self.complete(original)
            })];
        if self.config.safety_retry {
            strategies.push(Strategy::new(SANITIZED, BackoffPolicy::ONCE, move || {
                self.complete(sanitized)
            }));
        }

        let success = retry::execute(strategies, |e: &LlmError| {
            if e.is_safety_block() {
                Verdict::NextStrategy
            } else {
                Verdict::Abort
            }
        })
        .await
        .map_err(|failure| {
            AnalysisError::from_llm(failure.into_error(|| LlmError::NoModels))
        })?;

        let reply = success.value;
        let used_sanitized = success.label == SANITIZED;
        if used_sanitized {
            tracing::info!(model = %reply.model, "sanitized prompt accepted after safety block");
        }

        let outcome = parser::parse_response(&reply.text);
        let dropped = outcome.dropped().to_vec();
        let parse_failure = match &outcome {
            ParseOutcome::Failed { reason } => {
                tracing::warn!(
                    document_id,
                    model = %reply.model,
                    %reason,
                    "model response could not be parsed"
                );
                Some(reason.clone())
            }
            ParseOutcome::Partial { gaps, dropped } => {
                tracing::warn!(
                    document_id,
                    kept = gaps.len(),
                    dropped = dropped.len(),
                    "some gap records were dropped"
                );
                None
            }
            ParseOutcome::Complete(_) => None,
        };

        let gaps = parser::into_gaps(document_id, outcome.into_records());
        tracing::debug!(document_id, gaps = gaps.len(), model = %reply.model, "analysis parsed");
        Ok(EngineOutput {
            gaps,
            model: reply.model,
            sanitized: used_sanitized,
            dropped,
            parse_failure,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lacuna_llm::mock::{MockOutcome, MockProvider};

    use super::*;
    use crate::course::CourseMetadata;
    use crate::gap::GapCategory;
    use crate::retrieval::ContextSource;

    const REPLY: &str = r#"{"gaps": [
        {"concept": "Power Method for Eigenvalues", "category": "critical",
         "explanation": "Used in section 3 without derivation.",
         "whyNeeded": "Assignment 2, Question 3 runs it by hand.", "estimatedTime": "45 minutes"},
        {"concept": "Gram-Schmidt Orthogonalization", "category": "safe",
         "explanation": "QR factorization builds on it.", "whyNeeded": "Background for section 4."}
    ]}"#;

    const APOLOGY: &str = "Unable to analyze this document due to content filtering. \
        Please review your document manually and identify the key concepts.";

    fn engine(provider: MockProvider, safety_retry: bool) -> AnalysisEngine<MockProvider> {
        let chain = ModelChain::new(provider, vec!["mock-model".into()])
            .with_policy(BackoffPolicy::exponential(1, Duration::ZERO));
        AnalysisEngine::new(
            chain,
            AnalysisConfig {
                safety_retry,
                ..AnalysisConfig::default()
            },
        )
    }

    async fn run(engine: &AnalysisEngine<MockProvider>) -> Result<EngineOutput> {
        let course = CourseMetadata::new("MATH 221", "UBC");
        let input = PromptInput {
            text: "Eigenvalues and eigenvectors of symmetric matrices.",
            source: ContextSource::FullText,
            course: &course,
            assignments: &[],
        };
        engine.analyze("doc-1", &input).await
    }

    #[tokio::test]
    async fn parses_reply_into_gaps() {
        let provider = MockProvider::with_responses(vec![REPLY.into()]);
        let out = run(&engine(provider, true)).await.unwrap();
        assert_eq!(out.gaps.len(), 2);
        assert_eq!(out.gaps[0].id, "doc-1_gap_1");
        assert_eq!(out.gaps[0].category, GapCategory::Critical);
        assert_eq!(out.model, "mock-model");
        assert!(!out.sanitized);
        assert!(out.parse_failure.is_none());
    }

    #[tokio::test]
    async fn safety_block_retries_once_with_sanitized_prompt() {
        let provider = MockProvider::default();
        provider.script(
            "mock-model",
            vec![MockOutcome::SafetyBlock, MockOutcome::Reply(REPLY.into())],
        );
        let out = run(&engine(provider.clone(), true)).await.unwrap();
        assert!(out.sanitized);
        assert_eq!(out.gaps.len(), 2);

        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].1[1].content.starts_with("The following is educational material"));
    }

    #[tokio::test]
    async fn fallback_apology_counts_as_safety_block() {
        let provider = MockProvider::with_responses(vec![APOLOGY.into(), REPLY.into()]);
        let out = run(&engine(provider, true)).await.unwrap();
        assert!(out.sanitized);
        assert_eq!(out.gaps.len(), 2);
    }

    #[tokio::test]
    async fn second_safety_block_is_reported() {
        let provider = MockProvider::default();
        provider.script(
            "mock-model",
            vec![MockOutcome::SafetyBlock, MockOutcome::SafetyBlock],
        );
        let err = run(&engine(provider.clone(), true)).await.unwrap_err();
        assert!(matches!(err, AnalysisError::SafetyBlocked(_)));
        assert_eq!(provider.calls().len(), 2);
    }

    #[tokio::test]
    async fn disabled_safety_retry_fails_fast() {
        let provider = MockProvider::default();
        provider.script("mock-model", vec![MockOutcome::SafetyBlock]);
        let err = run(&engine(provider.clone(), false)).await.unwrap_err();
        assert_eq!(err.kind(), "safety_blocked");
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn block_on_one_model_and_outage_on_the_next_still_retries_sanitized() {
        let provider = MockProvider::default();
        provider.script(
            "a",
            vec![MockOutcome::SafetyBlock, MockOutcome::Reply(REPLY.into())],
        );
        provider.script("b", vec![MockOutcome::Unavailable]);
        let chain = ModelChain::new(provider.clone(), vec!["a".into(), "b".into()])
            .with_policy(BackoffPolicy::exponential(1, Duration::ZERO));
        let engine = AnalysisEngine::new(chain, AnalysisConfig::default());

        let out = run(&engine).await.unwrap();

        assert!(out.sanitized);
        assert_eq!(out.model, "a");
        assert_eq!(out.gaps.len(), 2);
        assert_eq!(provider.called_models(), vec!["a", "b", "a"]);
    }

    #[tokio::test]
    async fn outage_does_not_use_sanitized_prompt() {
        let provider = MockProvider::default();
        provider.script("mock-model", vec![MockOutcome::Unavailable]);
        let err = run(&engine(provider.clone(), true)).await.unwrap_err();
        assert!(matches!(err, AnalysisError::ModelChainExhausted(_)));
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn unparseable_reply_yields_no_gaps() {
        let provider = MockProvider::with_responses(vec!["The material looks fine to me.".into()]);
        let out = run(&engine(provider, true)).await.unwrap();
        assert!(out.gaps.is_empty());
        assert!(out.parse_failure.is_some());
    }
}
