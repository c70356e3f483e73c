use lacuna_llm::LlmError;
use lacuna_memory::MemoryError;

/// Failure of one analysis session.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// Empty or unreadable document. Never retried.
    #[error("ingestion failed: {0}")]
    Ingestion(String),

    #[error("embedding model failed to initialize: {0}")]
    EmbeddingInit(#[source] LlmError),

    #[error("embedding failed: {0}")]
    Embedding(#[source] LlmError),

    #[error("vector index error: {0}")]
    Index(#[from] MemoryError),

    #[error("every model in the fallback chain failed: {0}")]
    ModelChainExhausted(#[source] LlmError),

    #[error("response blocked by provider safety filter: {0}")]
    SafetyBlocked(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("analysis cancelled")]
    Cancelled,
}

impl AnalysisError {
    /// Map an error raised while embedding.
    #[must_use]
    pub fn from_embedding(e: LlmError) -> Self {
        match e {
            LlmError::EmbedInit(_) => Self::EmbeddingInit(e),
            other => Self::Embedding(other),
        }
    }

    /// Map an error raised by the model chain.
    #[must_use]
    pub fn from_llm(e: LlmError) -> Self {
        if e.is_safety_block() {
            Self::SafetyBlocked(e.to_string())
        } else {
            Self::ModelChainExhausted(e)
        }
    }

    /// Short machine-readable kind, used in error progress events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ingestion(_) => "ingestion",
            Self::EmbeddingInit(_) => "embedding_init",
            Self::Embedding(_) => "embedding",
            Self::Index(_) => "index",
            Self::ModelChainExhausted(_) => "model_chain_exhausted",
            Self::SafetyBlocked(_) => "safety_blocked",
            Self::Config(_) => "config",
            Self::Cancelled => "cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_errors_split_by_kind() {
        let init = AnalysisError::from_embedding(LlmError::EmbedInit("no weights".into()));
        assert_eq!(init.kind(), "embedding_init");
        let other = AnalysisError::from_embedding(LlmError::EmptyInput);
        assert_eq!(other.kind(), "embedding");
    }

    #[test]
    fn safety_block_inside_chain_is_surfaced() {
        let e = LlmError::ChainExhausted {
            attempted: 2,
            safety_blocked: true,
            last: Box::new(LlmError::SafetyBlocked {
                model: "m".into(),
                reason: "SAFETY".into(),
            }),
        };
        assert!(matches!(
            AnalysisError::from_llm(e),
            AnalysisError::SafetyBlocked(_)
        ));
        assert!(matches!(
            AnalysisError::from_llm(LlmError::NoModels),
            AnalysisError::ModelChainExhausted(_)
        ));
    }

    #[test]
    fn display_mentions_cause() {
        let e = AnalysisError::Ingestion("document is empty".into());
        assert_eq!(e.to_string(), "ingestion failed: document is empty");
    }
}
