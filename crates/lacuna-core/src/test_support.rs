use std::sync::Arc;
use std::time::Duration;

use lacuna_llm::Embedder;
use lacuna_llm::mock::{MockEncoder, MockLoader};
use lacuna_memory::{
    AdaptiveChunker, Document, Embedding, IndexConfig, InMemoryVectorStore, VectorIndex,
};

use crate::config::RetrievalConfig;
use crate::retrieval::RetrievalOrchestrator;

pub(crate) const DIM: usize = 64;

/// Orchestrator over an in-memory index already holding `documents`.
pub(crate) async fn indexed(documents: &[&Document]) -> RetrievalOrchestrator {
    let embedder = Arc::new(Embedder::new(Arc::new(MockLoader::new(DIM))));
    let index = Arc::new(VectorIndex::new(
        Arc::new(InMemoryVectorStore::new()),
        IndexConfig {
            base_backoff: Duration::ZERO,
            ..IndexConfig::default()
        },
    ));
    index.ensure_ready(DIM).await.unwrap();
    let encoder = MockEncoder::new(DIM);
    let chunker = AdaptiveChunker::default();
    for document in documents {
        let chunks = chunker.split(document);
        let embeddings: Vec<Embedding> = chunks
            .iter()
            .map(|c| Embedding {
                chunk_id: c.id(),
                vector: encoder.encode(&c.text),
                model: "mock-encoder".into(),
            })
            .collect();
        index.upsert(&chunks, &embeddings).await.unwrap();
    }
    RetrievalOrchestrator::new(embedder, index, RetrievalConfig::default())
}

/// Lecture-like text about eigenvalues, exactly `len` characters long.
pub(crate) fn lecture_text(len: usize) -> String {
    let sentences = [
        "The power method finds the dominant eigenvalue of a matrix.",
        "Assignment 1 asks you to compute eigenvalues by hand.",
        "Convergence depends on the ratio of the two largest eigenvalues.",
        "Rayleigh quotients refine each eigenvalue estimate.",
        "Deflation removes a found eigenpair before the next iteration.",
    ];
    let mut text = String::new();
    let mut i = 0;
    while text.chars().count() < len {
        text.push_str(sentences[i % sentences.len()]);
        text.push(' ');
        i += 1;
    }
    text.chars().take(len).collect()
}
