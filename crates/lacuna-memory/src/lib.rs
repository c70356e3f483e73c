//! Document chunking and vector indexing.

pub mod document;
pub mod error;
pub mod in_memory_store;
pub mod qdrant_ops;
pub mod vector_index;
pub mod vector_store;

pub use document::{
    AdaptiveChunker, Chunk, ChunkerConfig, Document, DocumentError, Embedding, load_document,
};
pub use error::MemoryError;
pub use in_memory_store::InMemoryVectorStore;
pub use qdrant_ops::{HnswSettings, QdrantOps};
pub use vector_index::{
    IndexConfig, QueryStats, QueryStatsSnapshot, RetrievalResult, RetrievedChunk, UpsertReport,
    VectorIndex,
};
pub use vector_store::{
    FieldCondition, FieldValue, IndexEntry, MetadataFilter, Payload, ScoredEntry, VectorStore,
    VectorStoreError,
};
