//! LLM provider abstraction, model fallback chain, retry executor and the
//! shared embedding model.

pub mod any;
pub mod chain;
pub mod embed;
pub mod error;
pub(crate) mod http;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod provider;
pub mod retry;

pub use any::AnyProvider;
pub use chain::{ChainReply, ModelChain};
pub use embed::{ComputeDevice, Embedder, EncoderLoader, TextEncoder};
pub use error::LlmError;
pub use provider::{LlmProvider, Message, Role};
pub use retry::{BackoffPolicy, RetryFailure, RetrySuccess, Strategy, Verdict};
