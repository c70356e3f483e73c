//! Construction of providers and backends from configuration.

use std::sync::Arc;

use anyhow::{Context, bail};
use lacuna_llm::embed::ollama::OllamaLoader;
use lacuna_llm::ollama::OllamaProvider;
use lacuna_llm::openai::OpenAiProvider;
use lacuna_llm::{AnyProvider, ComputeDevice, EncoderLoader};
use lacuna_memory::{InMemoryVectorStore, QdrantOps, VectorStore};

use crate::config::{Config, EmbeddingBackend, IndexBackend, ProviderKind};

/// Chat provider for the configured kind, bound to the first configured model.
///
/// # Errors
///
/// Returns an error if the OpenAI-compatible provider has no API key or its
/// HTTP client cannot be built.
pub fn create_provider(config: &Config) -> anyhow::Result<AnyProvider> {
    let llm = &config.llm;
    let model = llm.models.first().cloned().unwrap_or_default();
    match llm.provider {
        ProviderKind::Ollama => Ok(AnyProvider::Ollama(OllamaProvider::new(&llm.base_url, model))),
        ProviderKind::OpenAi => {
            let Some(api_key) = llm.api_key.clone().filter(|k| !k.trim().is_empty()) else {
                bail!("LACUNA_LLM_API_KEY is required for the openai provider");
            };
            let provider = OpenAiProvider::new(
                api_key,
                llm.base_url.clone(),
                model,
                llm.max_tokens,
                llm.temperature,
                llm.timeout(),
            )
            .context("failed to build OpenAI-compatible client")?
            .with_json_mode(llm.json_mode);
            Ok(AnyProvider::OpenAi(provider))
        }
    }
}

/// Loader for the configured embedding backend. Nothing is loaded until the
/// embedder is first initialized.
///
/// # Errors
///
/// Returns an error if the device string is invalid or the candle backend was
/// requested without the `candle` feature.
pub fn create_encoder_loader(config: &Config) -> anyhow::Result<Arc<dyn EncoderLoader>> {
    let embedding = &config.embedding;
    let device: ComputeDevice = embedding
        .device
        .parse()
        .context("invalid embedding.device")?;
    match embedding.backend {
        EmbeddingBackend::Ollama => Ok(Arc::new(OllamaLoader::new(
            embedding.ollama_url.clone(),
            embedding.ollama_model.clone(),
        ))),
        #[cfg(feature = "candle")]
        EmbeddingBackend::Candle => Ok(Arc::new(lacuna_llm::embed::candle::CandleLoader::new(
            embedding.model.clone(),
            device,
        ))),
        #[cfg(not(feature = "candle"))]
        EmbeddingBackend::Candle => {
            let _ = device;
            bail!("embedding backend candle requires the candle feature")
        }
    }
}

/// Vector store for the configured index backend.
///
/// # Errors
///
/// Returns an error if the Qdrant client cannot be created.
pub fn create_vector_store(config: &Config) -> anyhow::Result<Arc<dyn VectorStore>> {
    match config.index.backend {
        IndexBackend::Memory => Ok(Arc::new(InMemoryVectorStore::new())),
        IndexBackend::Qdrant => {
            let ops = QdrantOps::new(&config.index.url)
                .with_context(|| format!("failed to connect to Qdrant at {}", config.index.url))?
                .with_hnsw(config.index.hnsw());
            Ok(Arc::new(ops))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lacuna_llm::LlmProvider;

    #[test]
    fn openai_without_key_errors() {
        let config = Config::default();
        let err = create_provider(&config).unwrap_err();
        assert!(err.to_string().contains("LACUNA_LLM_API_KEY"));
    }

    #[test]
    fn openai_uses_first_model() {
        let mut config = Config::default();
        config.llm.api_key = Some("sk-test".into());
        let provider = create_provider(&config).unwrap();
        assert!(matches!(provider, AnyProvider::OpenAi(_)));
        assert_eq!(provider.model(), "gemini-2.5-flash");
    }

    #[test]
    fn ollama_needs_no_key() {
        let mut config = Config::default();
        config.llm.provider = ProviderKind::Ollama;
        config.llm.base_url = "http://localhost:11434".into();
        config.llm.models = vec!["llama3.2".into()];
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.name(), "ollama");
    }

    #[test]
    fn default_backends_are_local() {
        let config = Config::default();
        assert!(create_encoder_loader(&config).is_ok());
        assert!(create_vector_store(&config).is_ok());
    }

    #[test]
    fn bad_device_is_rejected() {
        let mut config = Config::default();
        config.embedding.device = "tpu".into();
        assert!(create_encoder_loader(&config).is_err());
    }

    #[cfg(not(feature = "candle"))]
    #[test]
    fn candle_backend_requires_feature() {
        let mut config = Config::default();
        config.embedding.backend = EmbeddingBackend::Candle;
        let err = create_encoder_loader(&config).err().unwrap();
        assert!(err.to_string().contains("candle feature"));
    }
}
