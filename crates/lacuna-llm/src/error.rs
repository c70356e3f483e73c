#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rate limited")]
    RateLimited,

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("model {model} does not exist in this deployment")]
    ModelNotFound { model: String },

    #[error("response from {model} blocked by safety filter: {reason}")]
    SafetyBlocked { model: String, reason: String },

    #[error("empty response from {provider}")]
    EmptyResponse { provider: String },

    /// `safety_blocked` is set when any model in the chain refused on content
    /// grounds, even if a later model failed for another reason.
    #[error("model chain exhausted after {attempted} model(s): {last}")]
    ChainExhausted {
        attempted: usize,
        safety_blocked: bool,
        last: Box<LlmError>,
    },

    #[error("no models configured or available")]
    NoModels,

    #[error("embedding model initialization failed: {0}")]
    EmbedInit(String),

    #[error("cannot embed empty text")]
    EmptyInput,

    #[error("model loading failed: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[cfg(feature = "candle")]
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// True when the provider refused to answer on content grounds, including
    /// a chain in which any model refused.
    #[must_use]
    pub fn is_safety_block(&self) -> bool {
        match self {
            Self::SafetyBlocked { .. } => true,
            Self::ChainExhausted {
                safety_blocked,
                last,
                ..
            } => *safety_blocked || last.is_safety_block(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safety_block_seen_through_exhausted_chain() {
        let err = LlmError::ChainExhausted {
            attempted: 2,
            safety_blocked: true,
            last: Box::new(LlmError::SafetyBlocked {
                model: "m".into(),
                reason: "SAFETY".into(),
            }),
        };
        assert!(err.is_safety_block());
        assert!(!LlmError::RateLimited.is_safety_block());
    }

    #[test]
    fn earlier_block_counts_when_last_model_failed_otherwise() {
        let err = LlmError::ChainExhausted {
            attempted: 2,
            safety_blocked: true,
            last: Box::new(LlmError::Unavailable("down".into())),
        };
        assert!(err.is_safety_block());

        let outage = LlmError::ChainExhausted {
            attempted: 2,
            safety_blocked: false,
            last: Box::new(LlmError::Unavailable("down".into())),
        };
        assert!(!outage.is_safety_block());
    }

    #[test]
    fn display_names_missing_model() {
        let err = LlmError::ModelNotFound {
            model: "gemini-1.0-pro".into(),
        };
        assert_eq!(
            err.to_string(),
            "model gemini-1.0-pro does not exist in this deployment"
        );
    }
}
