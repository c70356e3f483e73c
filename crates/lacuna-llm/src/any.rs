#[cfg(any(test, feature = "mock"))]
use crate::mock::MockProvider;
use crate::ollama::OllamaProvider;
use crate::openai::OpenAiProvider;

use crate::error::LlmError;
use crate::provider::{LlmProvider, Message};

/// Generates a match over all `AnyProvider` variants, binding the inner provider
/// and evaluating the given expression for each arm.
macro_rules! delegate_provider {
    ($self:expr, |$p:ident| $expr:expr) => {
        match $self {
            AnyProvider::Ollama($p) => $expr,
            AnyProvider::OpenAi($p) => $expr,
            #[cfg(any(test, feature = "mock"))]
            AnyProvider::Mock($p) => $expr,
        }
    };
}

#[derive(Debug, Clone)]
pub enum AnyProvider {
    Ollama(OllamaProvider),
    OpenAi(OpenAiProvider),
    #[cfg(any(test, feature = "mock"))]
    Mock(MockProvider),
}

impl LlmProvider for AnyProvider {
    async fn chat(&self, messages: &[Message]) -> Result<String, LlmError> {
        delegate_provider!(self, |p| p.chat(messages).await)
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        delegate_provider!(self, |p| p.list_models().await)
    }

    fn for_model(&self, model: &str) -> Self {
        match self {
            Self::Ollama(p) => Self::Ollama(p.for_model(model)),
            Self::OpenAi(p) => Self::OpenAi(p.for_model(model)),
            #[cfg(any(test, feature = "mock"))]
            Self::Mock(p) => Self::Mock(p.for_model(model)),
        }
    }

    fn model(&self) -> &str {
        delegate_provider!(self, |p| p.model())
    }

    fn name(&self) -> &str {
        delegate_provider!(self, |p| p.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delegates_to_inner_provider() {
        let any = AnyProvider::Mock(MockProvider::with_responses(vec!["hi".into()]));
        assert_eq!(any.name(), "mock");
        assert_eq!(any.chat(&[Message::user("x")]).await.unwrap(), "hi");
    }

    #[test]
    fn for_model_preserves_variant() {
        let any = AnyProvider::Ollama(OllamaProvider::new("http://localhost:11434", "a".into()));
        let other = any.for_model("b");
        assert!(matches!(other, AnyProvider::Ollama(_)));
        assert_eq!(other.model(), "b");
    }
}
