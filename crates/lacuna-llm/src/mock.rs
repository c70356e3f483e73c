//! Test-only mock LLM provider and embedding encoder.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::embed::{EncoderLoader, TextEncoder};
use crate::error::LlmError;
use crate::provider::{LlmProvider, Message};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Reply(String),
    SafetyBlock,
    NotFound,
    RateLimited,
    Unavailable,
}

impl MockOutcome {
    fn into_result(self, model: &str) -> Result<String, LlmError> {
        match self {
            Self::Reply(text) => Ok(text),
            Self::SafetyBlock => Err(LlmError::SafetyBlocked {
                model: model.to_owned(),
                reason: "SAFETY".into(),
            }),
            Self::NotFound => Err(LlmError::ModelNotFound {
                model: model.to_owned(),
            }),
            Self::RateLimited => Err(LlmError::RateLimited),
            Self::Unavailable => Err(LlmError::Unavailable("mock unavailable".into())),
        }
    }
}

/// Scripted provider. Per-model scripts are consumed in order; a model with an
/// exhausted or absent script answers with `default_response`.
#[derive(Debug, Clone)]
pub struct MockProvider {
    model: String,
    scripts: Arc<Mutex<Vec<(String, Vec<MockOutcome>)>>>,
    calls: Arc<Mutex<Vec<(String, Vec<Message>)>>>,
    catalog: Option<Vec<String>>,
    pub default_response: String,
    pub delay_ms: u64,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            model: "mock-model".into(),
            scripts: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            catalog: None,
            default_response: "mock response".into(),
            delay_ms: 0,
        }
    }
}

impl MockProvider {
    #[must_use]
    pub fn with_responses(responses: Vec<String>) -> Self {
        let provider = Self::default();
        provider.script(
            "mock-model",
            responses.into_iter().map(MockOutcome::Reply).collect(),
        );
        provider
    }

    #[must_use]
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_owned();
        self
    }

    /// Models reported by `list_models`; without a catalog the call fails.
    #[must_use]
    pub fn with_catalog(mut self, models: &[&str]) -> Self {
        self.catalog = Some(models.iter().map(|m| (*m).to_owned()).collect());
        self
    }

    #[must_use]
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    /// Queue outcomes for `model`. Shared by every clone of this provider.
    pub fn script(&self, model: &str, outcomes: Vec<MockOutcome>) {
        let mut scripts = self.scripts.lock().unwrap();
        if let Some((_, queue)) = scripts.iter_mut().find(|(m, _)| m == model) {
            queue.extend(outcomes);
        } else {
            scripts.push((model.to_owned(), outcomes));
        }
    }

    /// Models that received a chat call, in call order.
    #[must_use]
    pub fn called_models(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<(String, Vec<Message>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl LlmProvider for MockProvider {
    async fn chat(&self, messages: &[Message]) -> Result<String, LlmError> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        self.calls
            .lock()
            .unwrap()
            .push((self.model.clone(), messages.to_vec()));
        let next = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts
                .iter_mut()
                .find(|(m, _)| *m == self.model)
                .and_then(|(_, queue)| (!queue.is_empty()).then(|| queue.remove(0)))
        };
        match next {
            Some(outcome) => outcome.into_result(&self.model),
            None => Ok(self.default_response.clone()),
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        self.catalog
            .clone()
            .ok_or_else(|| LlmError::Unavailable("mock has no catalog".into()))
    }

    fn for_model(&self, model: &str) -> Self {
        Self {
            model: model.to_owned(),
            ..self.clone()
        }
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "mock"
    }
}

/// Deterministic bag-of-words encoder: each lowercase token is hashed into a
/// bucket, and the result is L2-normalised. Texts that share words land close
/// together, which is enough to exercise retrieval ordering.
#[derive(Debug, Clone)]
pub struct MockEncoder {
    dimension: usize,
}

impl MockEncoder {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    #[must_use]
    pub fn encode(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
        {
            let lower = token.to_lowercase();
            let bucket = fnv1a(lower.as_bytes()) % self.dimension as u64;
            if let Ok(i) = usize::try_from(bucket) {
                v[i] += 1.0;
            }
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        } else {
            v[0] = 1.0;
        }
        v
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}

impl TextEncoder for MockEncoder {
    #[allow(clippy::unnecessary_literal_bound)]
    fn model_id(&self) -> &str {
        "mock-encoder"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode_batch<'a>(
        &'a self,
        texts: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Vec<f32>>, LlmError>> {
        Box::pin(async move { Ok(texts.iter().map(|t| self.encode(t)).collect()) })
    }
}

/// Loader that counts constructions and can be told to fail the first N loads.
#[derive(Debug, Clone)]
pub struct MockLoader {
    dimension: usize,
    delay: Duration,
    failures_left: Arc<AtomicUsize>,
    constructions: Arc<AtomicUsize>,
}

impl MockLoader {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            delay: Duration::ZERO,
            failures_left: Arc::new(AtomicUsize::new(0)),
            constructions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sleep inside `load` to widen the window for concurrent initialisation.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn failing_first(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Number of completed model constructions.
    #[must_use]
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }
}

impl EncoderLoader for MockLoader {
    fn load(&self) -> BoxFuture<'_, Result<Arc<dyn TextEncoder>, LlmError>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let should_fail = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                return Err(LlmError::ModelLoad("mock weights unavailable".into()));
            }
            self.constructions.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockEncoder::new(self.dimension)) as Arc<dyn TextEncoder>)
        })
    }

    fn describe(&self) -> String {
        format!("mock encoder ({} dims)", self.dimension)
    }
}
