use std::sync::Arc;

use futures::future::BoxFuture;
use ollama_rs::Ollama;
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};

use super::{EncoderLoader, TextEncoder};
use crate::error::LlmError;

const PROBE_TEXT: &str = "embedding dimension probe";

/// Embeddings served by an Ollama instance (`/api/embed`).
#[derive(Debug, Clone)]
pub struct OllamaEncoder {
    client: Ollama,
    model: String,
    dimension: usize,
}

impl OllamaEncoder {
    async fn request(
        client: &Ollama,
        model: &str,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, LlmError> {
        let request = GenerateEmbeddingsRequest::new(model.to_owned(), EmbeddingsInput::Multiple(texts));
        let response = client
            .generate_embeddings(request)
            .await
            .map_err(|e| LlmError::Inference(format!("Ollama embedding request failed: {e}")))?;
        Ok(response.embeddings)
    }
}

impl TextEncoder for OllamaEncoder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode_batch<'a>(
        &'a self,
        texts: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Vec<f32>>, LlmError>> {
        Box::pin(Self::request(&self.client, &self.model, texts.to_vec()))
    }
}

/// Connects to Ollama and learns the vector width from a probe request.
#[derive(Debug, Clone)]
pub struct OllamaLoader {
    base_url: String,
    model: String,
}

impl OllamaLoader {
    #[must_use]
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

impl EncoderLoader for OllamaLoader {
    fn load(&self) -> BoxFuture<'_, Result<Arc<dyn TextEncoder>, LlmError>> {
        Box::pin(async move {
            let client = crate::ollama::client_for(&self.base_url);
            let probe = OllamaEncoder::request(&client, &self.model, vec![PROBE_TEXT.to_owned()])
                .await
                .map_err(|e| LlmError::ModelLoad(e.to_string()))?;
            let dimension = probe
                .first()
                .map(Vec::len)
                .filter(|d| *d > 0)
                .ok_or_else(|| {
                    LlmError::ModelLoad(format!("{} returned no probe embedding", self.model))
                })?;
            Ok(Arc::new(OllamaEncoder {
                client,
                model: self.model.clone(),
                dimension,
            }) as Arc<dyn TextEncoder>)
        })
    }

    fn describe(&self) -> String {
        format!("ollama {} at {}", self.model, self.base_url)
    }
}
