#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("vector store error: {0}")]
    VectorStore(#[from] crate::vector_store::VectorStoreError),

    #[error("embedding error: {0}")]
    Embedding(#[from] lacuna_llm::LlmError),

    #[error("document error: {0}")]
    Document(#[from] crate::document::DocumentError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("query failed on every path: {0}")]
    QueryExhausted(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
