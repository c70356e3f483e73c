//! Shared embedding model with explicit, serialized initialization.

#[cfg(feature = "candle")]
pub mod candle;
pub mod ollama;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use tokio::sync::Mutex;

use crate::error::LlmError;
use crate::retry::{self, BackoffPolicy, Strategy, Verdict};

/// Execution device requested for local models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputeDevice {
    #[default]
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl std::fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(i) => write!(f, "cuda:{i}"),
            Self::Metal(i) => write!(f, "metal:{i}"),
        }
    }
}

impl std::str::FromStr for ComputeDevice {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = lower.split_once(':').unwrap_or((lower.as_str(), "0"));
        let ordinal: usize = ordinal
            .parse()
            .map_err(|_| LlmError::Other(format!("invalid device ordinal in {s:?}")))?;
        match kind {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(ordinal)),
            "metal" => Ok(Self::Metal(ordinal)),
            _ => Err(LlmError::Other(format!("unknown compute device {s:?}"))),
        }
    }
}

/// A fully constructed embedding model ready for inference.
pub trait TextEncoder: Send + Sync {
    fn model_id(&self) -> &str;

    fn dimension(&self) -> usize;

    /// Encode `texts`, returning one vector per input in the same order.
    fn encode_batch<'a>(
        &'a self,
        texts: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Vec<f32>>, LlmError>>;
}

/// Builds a [`TextEncoder`]. Implementations must only return an encoder whose
/// weights are resident on the target device and that has answered a probe.
pub trait EncoderLoader: Send + Sync {
    fn load(&self) -> BoxFuture<'_, Result<Arc<dyn TextEncoder>, LlmError>>;

    fn describe(&self) -> String;
}

/// Lazily constructed, process-shareable embedding model.
///
/// `ensure_initialized` holds an async mutex for the whole construction, so
/// concurrent first callers wait for one load instead of racing. A failed load
/// leaves the slot empty.
pub struct Embedder {
    loader: Arc<dyn EncoderLoader>,
    slot: Mutex<Option<Arc<dyn TextEncoder>>>,
    load_attempts: AtomicUsize,
    init_policy: BackoffPolicy,
}

impl std::fmt::Debug for Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("loader", &self.loader.describe())
            .field("load_attempts", &self.load_attempts.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

static GLOBAL: OnceLock<Arc<Embedder>> = OnceLock::new();

impl Embedder {
    #[must_use]
    pub fn new(loader: Arc<dyn EncoderLoader>) -> Self {
        Self {
            loader,
            slot: Mutex::new(None),
            load_attempts: AtomicUsize::new(0),
            init_policy: BackoffPolicy::exponential(1, std::time::Duration::from_millis(500)),
        }
    }

    /// Retry policy for reinitializing after a failed load.
    #[must_use]
    pub fn with_init_policy(mut self, policy: BackoffPolicy) -> Self {
        self.init_policy = policy;
        self
    }

    /// Process-wide instance. The first call installs an embedder built from
    /// `loader`; later calls return that instance and drop their loader.
    pub fn global(loader: impl FnOnce() -> Arc<dyn EncoderLoader>) -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new(loader()))))
    }

    /// Construct the model if needed and return it.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::EmbedInit` if every load attempt under the init
    /// policy fails. The slot stays empty so a later call starts clean.
    pub async fn ensure_initialized(&self) -> Result<Arc<dyn TextEncoder>, LlmError> {
        let mut slot = self.slot.lock().await;
        if let Some(encoder) = slot.as_ref() {
            return Ok(Arc::clone(encoder));
        }

        let loader = &self.loader;
        let attempts = &self.load_attempts;
        let strategies = vec![Strategy::new("load", self.init_policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            loader.load()
        })];
        let encoder = retry::execute(strategies, |_| Verdict::Retry)
            .await
            .map_err(|failure| {
                let cause = failure
                    .error
                    .map_or_else(|| "no load attempt made".to_owned(), |e| e.to_string());
                LlmError::EmbedInit(cause)
            })?
            .value;

        tracing::info!(
            model = encoder.model_id(),
            dimension = encoder.dimension(),
            "embedding model ready"
        );
        *slot = Some(Arc::clone(&encoder));
        Ok(encoder)
    }

    /// Drop the current model; the next call reloads it under the lock.
    pub async fn reset(&self) {
        self.slot.lock().await.take();
    }

    pub async fn is_initialized(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Number of times the loader has been invoked.
    #[must_use]
    pub fn load_attempts(&self) -> usize {
        self.load_attempts.load(Ordering::SeqCst)
    }

    /// # Errors
    ///
    /// Returns an error if initialization fails or the model cannot report a
    /// dimension.
    pub async fn dimension(&self) -> Result<usize, LlmError> {
        Ok(self.ensure_initialized().await?.dimension())
    }

    /// # Errors
    ///
    /// Returns `LlmError::EmptyInput` for blank text, or any model error.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        if text.trim().is_empty() {
            return Err(LlmError::EmptyInput);
        }
        let mut out = self.embed_batch(&[text.to_owned()]).await?;
        out.pop().ok_or(LlmError::EmptyResponse {
            provider: "embedder".into(),
        })
    }

    /// Embed every text, preserving input order.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::EmptyInput` if any text is blank, or
    /// `LlmError::Inference` if the model returns a mismatched batch.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(LlmError::EmptyInput);
        }
        let encoder = self.ensure_initialized().await?;
        let vectors = encoder.encode_batch(texts).await?;
        if vectors.len() != texts.len() {
            return Err(LlmError::Inference(format!(
                "encoder returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }
        let dimension = encoder.dimension();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(LlmError::Inference(format!(
                "encoder returned a {}-dim vector, expected {dimension}",
                bad.len()
            )));
        }
        Ok(vectors)
    }
}
