use std::time::Duration;

use lacuna_memory::{ChunkerConfig, HnswSettings, IndexConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: VectorIndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub balance: BalanceConfig,
    #[serde(default)]
    pub tutor: TutorConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// LLM provider backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Any OpenAI-compatible chat completions endpoint.
    #[default]
    OpenAi,
    Ollama,
}

impl ProviderKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_llm_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta/openai".into()
}

fn default_llm_models() -> Vec<String> {
    vec![
        "gemini-2.5-flash".into(),
        "gemini-2.5-pro".into(),
        "gemini-2.0-flash".into(),
    ]
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// Read from `LACUNA_LLM_API_KEY`; never written back out.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Fallback order, first entry is the primary model.
    #[serde(default = "default_llm_models")]
    pub models: Vec<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub json_mode: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            base_url: default_llm_base_url(),
            api_key: None,
            models: default_llm_models(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
            json_mode: false,
        }
    }
}

impl LlmConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    #[default]
    Ollama,
    /// Local BERT model, requires the `candle` feature.
    Candle,
}

fn default_embedding_model() -> String {
    "sentence-transformers/all-MiniLM-L6-v2".into()
}

fn default_embedding_device() -> String {
    "cpu".into()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".into()
}

fn default_ollama_embedding_model() -> String {
    "all-minilm".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub backend: EmbeddingBackend,
    /// Hugging Face repository used by the candle backend.
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// `cpu`, `cuda[:N]` or `metal[:N]`.
    #[serde(default = "default_embedding_device")]
    pub device: String,
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    #[serde(default = "default_ollama_embedding_model")]
    pub ollama_model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::default(),
            model: default_embedding_model(),
            device: default_embedding_device(),
            ollama_url: default_ollama_url(),
            ollama_model: default_ollama_embedding_model(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    #[default]
    Memory,
    Qdrant,
}

fn default_qdrant_url() -> String {
    "http://localhost:6334".into()
}

fn default_collection() -> String {
    "documents".into()
}

fn default_index_max_retries() -> u32 {
    3
}

fn default_index_backoff_ms() -> u64 {
    200
}

fn default_fallback_scan_limit() -> u64 {
    10_000
}

fn default_hnsw_m() -> u64 {
    32
}

fn default_hnsw_ef_construct() -> u64 {
    200
}

fn default_hnsw_search_ef() -> u64 {
    128
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VectorIndexConfig {
    #[serde(default)]
    pub backend: IndexBackend,
    #[serde(default = "default_qdrant_url")]
    pub url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_index_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_index_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_fallback_scan_limit")]
    pub fallback_scan_limit: u64,
    #[serde(default = "default_hnsw_m")]
    pub hnsw_m: u64,
    #[serde(default = "default_hnsw_ef_construct")]
    pub hnsw_ef_construct: u64,
    #[serde(default = "default_hnsw_search_ef")]
    pub hnsw_search_ef: u64,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            backend: IndexBackend::default(),
            url: default_qdrant_url(),
            collection: default_collection(),
            max_retries: default_index_max_retries(),
            base_backoff_ms: default_index_backoff_ms(),
            fallback_scan_limit: default_fallback_scan_limit(),
            hnsw_m: default_hnsw_m(),
            hnsw_ef_construct: default_hnsw_ef_construct(),
            hnsw_search_ef: default_hnsw_search_ef(),
        }
    }
}

impl VectorIndexConfig {
    #[must_use]
    pub fn index_config(&self) -> IndexConfig {
        IndexConfig {
            collection: self.collection.clone(),
            max_retries: self.max_retries,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            fallback_scan_limit: self.fallback_scan_limit,
        }
    }

    #[must_use]
    pub fn hnsw(&self) -> HnswSettings {
        HnswSettings {
            m: self.hnsw_m,
            ef_construct: self.hnsw_ef_construct,
            search_ef: self.hnsw_search_ef,
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_min_chunk_size() -> usize {
    100
}

fn default_max_chunk_size() -> usize {
    4000
}

fn default_max_chunks() -> usize {
    400
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    /// Ceiling when chunks grow to respect `max_chunks`.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            max_chunks: default_max_chunks(),
        }
    }
}

impl ChunkingConfig {
    #[must_use]
    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            min_chunk_size: self.min_chunk_size,
            max_chunk_size: self.max_chunk_size,
            max_chunks: self.max_chunks,
        }
    }
}

fn default_document_results() -> usize {
    10
}

fn default_gap_results() -> usize {
    3
}

fn default_gap_chunks_kept() -> usize {
    2
}

fn default_analysis_budget() -> usize {
    6000
}

fn default_gap_budget() -> usize {
    1500
}

fn default_concept_budget() -> usize {
    8000
}

fn default_gate_ratio() -> f64 {
    0.25
}

fn default_gate_floor() -> usize {
    100
}

fn default_gate_ceiling() -> usize {
    1500
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// Total results spread across the document-level strategies.
    #[serde(default = "default_document_results")]
    pub document_results: usize,
    /// Results fetched per gap during enhancement.
    #[serde(default = "default_gap_results")]
    pub gap_results: usize,
    #[serde(default = "default_gap_chunks_kept")]
    pub gap_chunks_kept: usize,
    #[serde(default = "default_analysis_budget")]
    pub analysis_budget: usize,
    #[serde(default = "default_gap_budget")]
    pub gap_budget: usize,
    #[serde(default = "default_concept_budget")]
    pub concept_budget: usize,
    /// Minimum useful context as a share of document length.
    #[serde(default = "default_gate_ratio")]
    pub gate_ratio: f64,
    #[serde(default = "default_gate_floor")]
    pub gate_floor: usize,
    #[serde(default = "default_gate_ceiling")]
    pub gate_ceiling: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            document_results: default_document_results(),
            gap_results: default_gap_results(),
            gap_chunks_kept: default_gap_chunks_kept(),
            analysis_budget: default_analysis_budget(),
            gap_budget: default_gap_budget(),
            concept_budget: default_concept_budget(),
            gate_ratio: default_gate_ratio(),
            gate_floor: default_gate_floor(),
            gate_ceiling: default_gate_ceiling(),
        }
    }
}

fn default_document_chars() -> usize {
    6000
}

fn default_sanitized_chars() -> usize {
    4000
}

fn default_assignment_chars() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalysisConfig {
    /// Cap on document text placed in the prompt.
    #[serde(default = "default_document_chars")]
    pub document_chars: usize,
    /// Cap used by the rephrased retry after a safety block.
    #[serde(default = "default_sanitized_chars")]
    pub sanitized_chars: usize,
    #[serde(default = "default_assignment_chars")]
    pub assignment_chars: usize,
    #[serde(default = "default_true")]
    pub safety_retry: bool,
    #[serde(default = "default_true")]
    pub enhance_gaps: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            document_chars: default_document_chars(),
            sanitized_chars: default_sanitized_chars(),
            assignment_chars: default_assignment_chars(),
            safety_retry: true,
            enhance_gaps: true,
        }
    }
}

fn default_min_critical_share() -> f64 {
    0.2
}

fn default_max_critical_share() -> f64 {
    0.6
}

fn default_balance_min_gaps() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BalanceConfig {
    #[serde(default = "default_min_critical_share")]
    pub min_critical_share: f64,
    #[serde(default = "default_max_critical_share")]
    pub max_critical_share: f64,
    /// Band is only enforced from this many gaps upward.
    #[serde(default = "default_balance_min_gaps")]
    pub min_gaps: usize,
    /// Ask the model for per-gap rationale when the band is violated.
    #[serde(default = "default_true")]
    pub reclassify: bool,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            min_critical_share: default_min_critical_share(),
            max_critical_share: default_max_critical_share(),
            min_gaps: default_balance_min_gaps(),
            reclassify: true,
        }
    }
}

fn default_history_messages() -> usize {
    10
}

fn default_tutor_context_chars() -> usize {
    6000
}

/// Follow-up explanations and document chat.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TutorConfig {
    /// Most recent conversation turns sent along with a question.
    #[serde(default = "default_history_messages")]
    pub history_messages: usize,
    /// Cap on retrieved document text per request.
    #[serde(default = "default_tutor_context_chars")]
    pub context_chars: usize,
}

impl Default for TutorConfig {
    fn default() -> Self {
        Self {
            history_messages: default_history_messages(),
            context_chars: default_tutor_context_chars(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}
