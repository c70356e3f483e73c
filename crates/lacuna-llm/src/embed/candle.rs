use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use futures::future::BoxFuture;
use tokenizers::Tokenizer;

use super::{ComputeDevice, EncoderLoader, TextEncoder};
use crate::error::LlmError;

const PROBE_TEXT: &str = "embedding initialization probe";

pub struct EmbedModel {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl std::fmt::Debug for EmbedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbedModel")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl EmbedModel {
    /// Load a BERT sentence-embedding model from `HuggingFace` Hub onto `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if model download or loading fails.
    pub fn load(repo_id: &str, device: &Device) -> Result<Self, LlmError> {
        let api = hf_hub::api::sync::Api::new().map_err(|e| {
            LlmError::ModelLoad(format!("failed to create HuggingFace API client: {e}"))
        })?;
        let repo = api.model(repo_id.to_owned());

        let fetch = |name: &str| {
            repo.get(name).map_err(|e| {
                LlmError::ModelLoad(format!("failed to download {name} from {repo_id}: {e}"))
            })
        };
        let config_path = fetch("config.json")?;
        let tokenizer_path = fetch("tokenizer.json")?;
        let weights_path = fetch("model.safetensors")?;

        let config_str = std::fs::read_to_string(&config_path)
            .map_err(|e| LlmError::ModelLoad(format!("failed to read BERT config: {e}")))?;
        let config: BertConfig = serde_json::from_str(&config_str)?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| LlmError::ModelLoad(format!("failed to load tokenizer: {e}")))?;

        // SAFETY: file is a valid safetensors downloaded from hf-hub, not modified during
        // VarBuilder lifetime
        let vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, device)? };
        let model = BertModel::load(vb, &config)?;

        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
        })
    }

    /// Mean-pooled, L2-normalised embedding of `text`.
    ///
    /// # Errors
    ///
    /// Returns an error if tokenization or the forward pass fails, or if the
    /// output tensor is not on the model's device.
    pub fn embed_sync(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| LlmError::Inference(format!("tokenizer encode failed: {e}")))?;

        let token_ids = encoding.get_ids();
        let token_type_ids: Vec<u32> = vec![0; token_ids.len()];

        let input_ids = Tensor::new(token_ids, &self.device)?.unsqueeze(0)?;
        let token_type_ids = Tensor::new(token_type_ids.as_slice(), &self.device)?.unsqueeze(0)?;

        let embeddings = self.model.forward(&input_ids, &token_type_ids, None)?;
        if !embeddings.device().same_device(&self.device) {
            return Err(LlmError::Inference(
                "forward pass ran off the requested device".into(),
            ));
        }

        let seq_len = embeddings.dim(1)?;
        let sum = embeddings.sum(1)?;
        let mean_pooled = (sum
            / f64::from(
                u32::try_from(seq_len)
                    .map_err(|e| LlmError::Inference(format!("sequence length overflow: {e}")))?,
            ))?;

        let norm = mean_pooled.sqr()?.sum_keepdim(1)?.sqrt()?;
        let normalized = mean_pooled.broadcast_div(&norm)?.squeeze(0)?;

        normalized.to_vec1::<f32>().map_err(LlmError::Candle)
    }
}

#[derive(Debug, Clone)]
pub struct CandleEncoder {
    model: Arc<EmbedModel>,
    repo_id: String,
    dimension: usize,
}

impl TextEncoder for CandleEncoder {
    fn model_id(&self) -> &str {
        &self.repo_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode_batch<'a>(
        &'a self,
        texts: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Vec<f32>>, LlmError>> {
        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                texts
                    .iter()
                    .map(|t| model.embed_sync(t))
                    .collect::<Result<Vec<_>, _>>()
            })
            .await
            .map_err(|e| LlmError::Inference(format!("embedding task panicked: {e}")))?
        })
    }
}

/// Downloads and places a BERT model on an explicit device, then runs a probe
/// forward pass before handing the encoder out.
#[derive(Debug, Clone)]
pub struct CandleLoader {
    repo_id: String,
    device: ComputeDevice,
}

impl CandleLoader {
    #[must_use]
    pub fn new(repo_id: impl Into<String>, device: ComputeDevice) -> Self {
        Self {
            repo_id: repo_id.into(),
            device,
        }
    }

    fn build(repo_id: &str, kind: ComputeDevice) -> Result<CandleEncoder, LlmError> {
        let device = match kind {
            ComputeDevice::Cpu => Device::Cpu,
            ComputeDevice::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            ComputeDevice::Metal(ordinal) => Device::new_metal(ordinal)?,
        };
        let model = EmbedModel::load(repo_id, &device)?;
        let probe = model.embed_sync(PROBE_TEXT)?;
        if probe.is_empty() || probe.iter().any(|x| !x.is_finite()) {
            return Err(LlmError::ModelLoad(format!(
                "{repo_id} produced an invalid probe embedding on {kind}"
            )));
        }
        Ok(CandleEncoder {
            model: Arc::new(model),
            repo_id: repo_id.to_owned(),
            dimension: probe.len(),
        })
    }
}

impl EncoderLoader for CandleLoader {
    fn load(&self) -> BoxFuture<'_, Result<Arc<dyn TextEncoder>, LlmError>> {
        let repo_id = self.repo_id.clone();
        let kind = self.device;
        Box::pin(async move {
            let encoder = tokio::task::spawn_blocking(move || Self::build(&repo_id, kind))
                .await
                .map_err(|e| LlmError::ModelLoad(format!("model load task panicked: {e}")))??;
            Ok(Arc::new(encoder) as Arc<dyn TextEncoder>)
        })
    }

    fn describe(&self) -> String {
        format!("candle {} on {}", self.repo_id, self.device)
    }
}
