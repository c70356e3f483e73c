//! Chunk index over any [`VectorStore`]: idempotent upsert, retried filtered
//! queries with an unfiltered fallback, and query counters.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lacuna_llm::retry::{self, BackoffPolicy, Strategy, Verdict};
use serde::{Deserialize, Serialize};

use crate::document::{Chunk, Embedding};
use crate::error::{MemoryError, Result};
use crate::vector_store::{
    IndexEntry, MetadataFilter, Payload, ScoredEntry, VectorStore, VectorStoreError,
};

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub collection: String,
    /// Retries of a filtered query before falling back to an unfiltered scan.
    pub max_retries: u32,
    pub base_backoff: Duration,
    /// Entries pulled by the first round of the unfiltered fallback.
    pub fallback_scan_limit: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            collection: "documents".into(),
            max_retries: 3,
            base_backoff: Duration::from_millis(200),
            fallback_scan_limit: 10_000,
        }
    }
}

/// Metadata stored next to every chunk vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ChunkPayload {
    document_id: String,
    chunk_index: usize,
    page: u32,
    #[serde(default)]
    pages: Vec<u32>,
    start: usize,
    end: usize,
    content: String,
    content_hash: String,
    #[serde(default)]
    model: String,
}

impl ChunkPayload {
    fn new(chunk: &Chunk, model: &str) -> Self {
        Self {
            document_id: chunk.document_id.clone(),
            chunk_index: chunk.index,
            page: chunk.page,
            pages: chunk.pages.clone(),
            start: chunk.start,
            end: chunk.end,
            content: chunk.text.clone(),
            content_hash: blake3::hash(chunk.text.as_bytes()).to_hex().to_string(),
            model: model.to_owned(),
        }
    }

    fn into_payload(self) -> Result<Payload> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(MemoryError::Other(format!("unexpected payload shape: {other}"))),
        }
    }

    fn from_payload(payload: Payload) -> Result<Self> {
        Ok(serde_json::from_value(serde_json::Value::Object(
            payload.into_iter().collect(),
        ))?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    /// Cosine distance, lower is closer.
    pub distance: f32,
    pub page: u32,
    pub pages: Vec<u32>,
    pub start: usize,
    pub end: usize,
}

/// Hits of one query in ascending distance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalResult {
    pub chunks: Vec<RetrievedChunk>,
    /// The unfiltered scan answered instead of the filtered query.
    pub used_fallback: bool,
    pub retries: u32,
}

impl RetrievalResult {
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct QueryStats {
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    fallbacks: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStatsSnapshot {
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub fallbacks: u64,
}

impl QueryStatsSnapshot {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }

    /// Failed queries over all queries; zero before the first query.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn error_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.failures as f64 / total as f64,
        }
    }
}

impl QueryStats {
    #[must_use]
    pub fn snapshot(&self) -> QueryStatsSnapshot {
        QueryStatsSnapshot {
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }
}

pub struct VectorIndex {
    store: Arc<dyn VectorStore>,
    config: IndexConfig,
    stats: QueryStats,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("config", &self.config)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl VectorIndex {
    #[must_use]
    pub fn new(store: Arc<dyn VectorStore>, config: IndexConfig) -> Self {
        Self {
            store,
            config,
            stats: QueryStats::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> QueryStatsSnapshot {
        self.stats.snapshot()
    }

    /// Create the collection for vectors of `dimension` if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot create or validate the collection.
    pub async fn ensure_ready(&self, dimension: usize) -> Result<()> {
        self.store
            .ensure_collection(&self.config.collection, dimension as u64)
            .await?;
        Ok(())
    }

    /// Store `chunks` with their `embeddings`. Entries whose stored content
    /// hash matches are skipped, changed ones are overwritten.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs are misaligned or the backend write fails.
    pub async fn upsert(&self, chunks: &[Chunk], embeddings: &[Embedding]) -> Result<UpsertReport> {
        if chunks.len() != embeddings.len() {
            return Err(MemoryError::Other(format!(
                "{} chunks but {} embeddings",
                chunks.len(),
                embeddings.len()
            )));
        }
        if chunks.is_empty() {
            return Ok(UpsertReport::default());
        }

        let mut entries = Vec::with_capacity(chunks.len());
        let mut hashes = HashMap::with_capacity(chunks.len());
        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            let id = chunk.id();
            if embedding.chunk_id != id {
                return Err(MemoryError::Other(format!(
                    "embedding {} does not belong to chunk {id}",
                    embedding.chunk_id
                )));
            }
            let payload = ChunkPayload::new(chunk, &embedding.model);
            hashes.insert(id.clone(), payload.content_hash.clone());
            entries.push(IndexEntry {
                id,
                vector: embedding.vector.clone(),
                payload: payload.into_payload()?,
            });
        }

        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        let existing = match self.store.get_payloads(&self.config.collection, ids).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, "cannot read existing entries, writing all");
                HashMap::new()
            }
        };

        let mut report = UpsertReport::default();
        let to_write: Vec<IndexEntry> = entries
            .into_iter()
            .filter(|entry| match existing.get(&entry.id) {
                None => {
                    report.inserted += 1;
                    true
                }
                Some(stored) => {
                    let same = stored
                        .get("content_hash")
                        .and_then(serde_json::Value::as_str)
                        .is_some_and(|h| hashes.get(&entry.id).is_some_and(|ours| ours == h));
                    if same {
                        report.skipped += 1;
                    } else {
                        report.updated += 1;
                    }
                    !same
                }
            })
            .collect();

        if !to_write.is_empty() {
            self.store.upsert(&self.config.collection, to_write).await?;
        }
        tracing::debug!(
            collection = %self.config.collection,
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            "upserted chunks"
        );
        Ok(report)
    }

    /// Nearest `k` chunks to `vector`, optionally restricted by `filter`.
    ///
    /// A filtered query that fails transiently is retried with backoff; if it
    /// still fails, an unfiltered search is post-filtered in process.
    ///
    /// # Errors
    ///
    /// Returns `MemoryError::QueryExhausted` when every path failed.
    pub async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<RetrievalResult> {
        if k == 0 {
            return Ok(RetrievalResult::default());
        }
        let collection = self.config.collection.as_str();
        let store = &self.store;
        let primary = BackoffPolicy::exponential(self.config.max_retries, self.config.base_backoff);

        let mut strategies = vec![Strategy::new(
            if filter.is_some() { "filtered" } else { "direct" },
            primary,
            move || store.search(collection, vector.to_vec(), k as u64, filter.cloned()),
        )];
        if let Some(f) = filter {
            strategies.push(Strategy::new(
                "unfiltered+post-filter",
                BackoffPolicy::ONCE,
                move || self.scan_and_filter(vector, k, f),
            ));
        }

        let outcome = retry::execute(strategies, |e: &VectorStoreError| {
            if e.is_transient() {
                Verdict::Retry
            } else {
                Verdict::NextStrategy
            }
        })
        .await;

        match outcome {
            Ok(ok) => {
                let used_fallback = ok.strategy > 0;
                self.stats.successes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .retries
                    .fetch_add(u64::from(ok.retries), Ordering::Relaxed);
                if used_fallback {
                    self.stats.fallbacks.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(retries = ok.retries, "filtered query served by unfiltered fallback");
                }
                Ok(RetrievalResult {
                    chunks: to_chunks(ok.value),
                    used_fallback,
                    retries: ok.retries,
                })
            }
            Err(failure) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .retries
                    .fetch_add(u64::from(failure.retries), Ordering::Relaxed);
                let cause = failure
                    .error
                    .map_or_else(|| "no query attempted".to_owned(), |e| e.to_string());
                Err(MemoryError::QueryExhausted(cause))
            }
        }
    }

    /// Unfiltered search post-filtered in process. The window starts at
    /// `fallback_scan_limit` and doubles until `k` matches are found or the
    /// whole collection has been scanned.
    async fn scan_and_filter(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> std::result::Result<Vec<ScoredEntry>, VectorStoreError> {
        let collection = self.config.collection.as_str();
        let total = self.store.count(collection).await?;
        let mut limit = total
            .min(self.config.fallback_scan_limit)
            .max(k as u64)
            .max(1);
        loop {
            let mut hits = self
                .store
                .search(collection, vector.to_vec(), limit, None)
                .await?;
            hits.retain(|h| filter.matches(&h.payload));
            if hits.len() >= k || limit >= total {
                hits.truncate(k);
                return Ok(hits);
            }
            tracing::debug!(limit, matched = hits.len(), k, "widening unfiltered scan");
            limit = limit.saturating_mul(2).min(total);
        }
    }
}

fn to_chunks(hits: Vec<ScoredEntry>) -> Vec<RetrievedChunk> {
    let mut chunks: Vec<RetrievedChunk> = hits
        .into_iter()
        .filter_map(|hit| match ChunkPayload::from_payload(hit.payload) {
            Ok(p) => Some(RetrievedChunk {
                chunk_id: hit.id,
                document_id: p.document_id,
                text: p.content,
                distance: 1.0 - hit.score,
                page: p.page,
                pages: p.pages,
                start: p.start,
                end: p.end,
            }),
            Err(e) => {
                tracing::warn!(id = %hit.id, error = %e, "skipping hit with malformed payload");
                None
            }
        })
        .collect();
    chunks.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    chunks
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use lacuna_llm::mock::MockEncoder;

    use super::*;
    use crate::document::{AdaptiveChunker, Document};
    use crate::in_memory_store::InMemoryVectorStore;
    use crate::vector_store::BoxFuture;

    const DIM: usize = 64;

    /// Fails the first `fail_filtered` filtered searches with the HNSW error
    /// Qdrant raises for small candidate sets.
    struct FlakyStore {
        inner: InMemoryVectorStore,
        fail_filtered: AtomicU32,
        permanent_error: bool,
        filtered_calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(fail_filtered: u32) -> Self {
            Self {
                inner: InMemoryVectorStore::new(),
                fail_filtered: AtomicU32::new(fail_filtered),
                permanent_error: false,
                filtered_calls: AtomicU32::new(0),
            }
        }
    }

    impl VectorStore for FlakyStore {
        fn ensure_collection(
            &self,
            collection: &str,
            vector_size: u64,
        ) -> BoxFuture<'_, std::result::Result<(), VectorStoreError>> {
            self.inner.ensure_collection(collection, vector_size)
        }

        fn upsert(
            &self,
            collection: &str,
            entries: Vec<IndexEntry>,
        ) -> BoxFuture<'_, std::result::Result<(), VectorStoreError>> {
            self.inner.upsert(collection, entries)
        }

        fn search(
            &self,
            collection: &str,
            vector: Vec<f32>,
            limit: u64,
            filter: Option<MetadataFilter>,
        ) -> BoxFuture<'_, std::result::Result<Vec<ScoredEntry>, VectorStoreError>> {
            if filter.is_some() {
                self.filtered_calls.fetch_add(1, Ordering::SeqCst);
                if self.permanent_error {
                    return Box::pin(async {
                        Err(VectorStoreError::from_search_message("bad request: wrong field type"))
                    });
                }
                let left = self.fail_filtered.load(Ordering::SeqCst);
                if left > 0 {
                    self.fail_filtered.store(left - 1, Ordering::SeqCst);
                    return Box::pin(async {
                        Err(VectorStoreError::from_search_message(
                            "Service internal error: Cannot return the results in a contigious \
                             2D array. Probably ef or M is too small",
                        ))
                    });
                }
            }
            self.inner.search(collection, vector, limit, filter)
        }

        fn get_payloads(
            &self,
            collection: &str,
            ids: Vec<String>,
        ) -> BoxFuture<'_, std::result::Result<HashMap<String, Payload>, VectorStoreError>> {
            self.inner.get_payloads(collection, ids)
        }

        fn count(&self, collection: &str) -> BoxFuture<'_, std::result::Result<u64, VectorStoreError>> {
            self.inner.count(collection)
        }
    }

    fn config() -> IndexConfig {
        IndexConfig {
            base_backoff: Duration::ZERO,
            ..IndexConfig::default()
        }
    }

    fn embed(encoder: &MockEncoder, chunks: &[Chunk]) -> Vec<Embedding> {
        chunks
            .iter()
            .map(|c| Embedding {
                chunk_id: c.id(),
                vector: encoder.encode(&c.text),
                model: "mock".into(),
            })
            .collect()
    }

    async fn seed(index: &VectorIndex, encoder: &MockEncoder) {
        index.ensure_ready(DIM).await.unwrap();
        let chunker = AdaptiveChunker::default();
        for (id, topic) in [
            ("doc-42", "Eigenvalues and eigenvectors of symmetric matrices. "),
            ("doc-7", "Recursion, stacks and dynamic programming tables. "),
        ] {
            let text: String = topic.chars().cycle().take(1400).collect();
            let chunks = chunker.split(&Document::from_text(id, text));
            index.upsert(&chunks, &embed(encoder, &chunks)).await.unwrap();
        }
    }

    /// Unfiltered query, then keep `doc-42` hits.
    async fn expected_post_filtered(
        index: &VectorIndex,
        query: &[f32],
        k: usize,
    ) -> Vec<RetrievedChunk> {
        let all = index.query(query, 1000, None).await.unwrap();
        all.chunks
            .into_iter()
            .filter(|c| c.document_id == "doc-42")
            .take(k)
            .collect()
    }

    #[tokio::test]
    async fn filtered_query_survives_two_transient_failures() {
        let encoder = MockEncoder::new(DIM);
        let store = Arc::new(FlakyStore::new(0));
        let index = VectorIndex::new(store.clone(), config());
        seed(&index, &encoder).await;

        let query = encoder.encode("eigenvalues of matrices");
        let filter = MetadataFilter::document("doc-42");
        let expected = expected_post_filtered(&index, &query, 5).await;

        store.fail_filtered.store(2, Ordering::SeqCst);
        let result = index.query(&query, 5, Some(&filter)).await.unwrap();
        assert_eq!(result.chunks, expected);
        assert_eq!(result.retries, 2);
        assert!(!result.used_fallback);
        assert_eq!(store.filtered_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fall_back_to_post_filtering() {
        let encoder = MockEncoder::new(DIM);
        let store = Arc::new(FlakyStore::new(0));
        let index = VectorIndex::new(store.clone(), config());
        seed(&index, &encoder).await;

        let query = encoder.encode("eigenvalues of matrices");
        let filter = MetadataFilter::document("doc-42");
        let expected = expected_post_filtered(&index, &query, 5).await;

        store.fail_filtered.store(u32::MAX, Ordering::SeqCst);
        let result = index.query(&query, 5, Some(&filter)).await.unwrap();
        assert!(result.used_fallback);
        assert_eq!(result.chunks, expected);
        assert_eq!(store.filtered_calls.load(Ordering::SeqCst), 4);

        let stats = index.stats();
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.failures, 0);
        assert!(stats.retries >= 3);
    }

    #[tokio::test]
    async fn non_transient_filter_error_goes_straight_to_fallback() {
        let encoder = MockEncoder::new(DIM);
        let mut flaky = FlakyStore::new(0);
        flaky.permanent_error = true;
        let store = Arc::new(flaky);
        let index = VectorIndex::new(store.clone(), config());
        seed(&index, &encoder).await;

        let filter = MetadataFilter::document("doc-42");
        let result = index
            .query(&encoder.encode("symmetric"), 3, Some(&filter))
            .await
            .unwrap();
        assert!(result.used_fallback);
        assert_eq!(result.retries, 0);
        assert!(result.chunks.iter().all(|c| c.document_id == "doc-42"));
        assert_eq!(store.filtered_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallback_widens_scan_when_other_documents_crowd_the_window() {
        let encoder = MockEncoder::new(DIM);
        let mut flaky = FlakyStore::new(0);
        flaky.permanent_error = true;
        let store = Arc::new(flaky);
        let index = VectorIndex::new(
            store.clone(),
            IndexConfig {
                fallback_scan_limit: 20,
                ..config()
            },
        );
        index.ensure_ready(DIM).await.unwrap();
        let chunker = AdaptiveChunker::default();
        for (id, topic, len) in [
            ("doc-42", "Eigenvalues and eigenvectors of symmetric matrices. ", 1400),
            ("doc-big", "eigenvalues of symmetric matrices ", 40_000),
        ] {
            let text: String = topic.chars().cycle().take(len).collect();
            let chunks = chunker.split(&Document::from_text(id, text));
            index.upsert(&chunks, &embed(&encoder, &chunks)).await.unwrap();
        }

        let query = encoder.encode("eigenvalues of symmetric matrices");
        let window = index.query(&query, 20, None).await.unwrap();
        assert!(window.chunks.iter().all(|c| c.document_id == "doc-big"));

        let expected = expected_post_filtered(&index, &query, 5).await;
        let result = index
            .query(&query, 5, Some(&MetadataFilter::document("doc-42")))
            .await
            .unwrap();
        assert!(result.used_fallback);
        assert_eq!(result.len(), 5);
        assert_eq!(result.chunks, expected);
    }

    #[tokio::test]
    async fn missing_collection_is_reported_after_both_paths() {
        let index = VectorIndex::new(Arc::new(InMemoryVectorStore::new()), config());
        let err = index
            .query(&[0.0; DIM], 3, Some(&MetadataFilter::document("x")))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::QueryExhausted(_)));
        let stats = index.stats();
        assert_eq!(stats.failures, 1);
        assert!((stats.error_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let encoder = MockEncoder::new(DIM);
        let store = Arc::new(InMemoryVectorStore::new());
        let index = VectorIndex::new(store.clone(), config());
        index.ensure_ready(DIM).await.unwrap();

        let text: String = "Fourier series converge in mean square. ".chars().cycle().take(1400).collect();
        let chunks = AdaptiveChunker::default().split(&Document::from_text("doc-1", text));
        let embeddings = embed(&encoder, &chunks);

        let first = index.upsert(&chunks, &embeddings).await.unwrap();
        assert_eq!(first.inserted, chunks.len());
        let count = store.count("documents").await.unwrap();
        let before = index.query(&embeddings[0].vector, 100, None).await.unwrap();

        let second = index.upsert(&chunks, &embeddings).await.unwrap();
        assert_eq!(second, UpsertReport { inserted: 0, updated: 0, skipped: chunks.len() });
        assert_eq!(store.count("documents").await.unwrap(), count);
        let after = index.query(&embeddings[0].vector, 100, None).await.unwrap();
        assert_eq!(before.chunks, after.chunks);
    }

    #[tokio::test]
    async fn changed_text_is_updated_in_place() {
        let encoder = MockEncoder::new(DIM);
        let store = Arc::new(InMemoryVectorStore::new());
        let index = VectorIndex::new(store.clone(), config());
        index.ensure_ready(DIM).await.unwrap();

        let mut chunks = AdaptiveChunker::default().split(&Document::from_text(
            "doc-1",
            "Limits and continuity.\n\nDerivatives of polynomials.",
        ));
        index.upsert(&chunks, &embed(&encoder, &chunks)).await.unwrap();
        chunks[0].text = "Limits, continuity and epsilon-delta proofs.".into();
        let report = index.upsert(&chunks, &embed(&encoder, &chunks)).await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.skipped, chunks.len() - 1);
        assert_eq!(store.count("documents").await.unwrap(), chunks.len() as u64);
    }

    #[tokio::test]
    async fn results_are_sorted_by_distance_with_metadata() {
        let encoder = MockEncoder::new(DIM);
        let index = VectorIndex::new(Arc::new(InMemoryVectorStore::new()), config());
        seed(&index, &encoder).await;
        let result = index
            .query(&encoder.encode("dynamic programming recursion"), 4, None)
            .await
            .unwrap();
        assert_eq!(result.len(), 4);
        assert!(result.chunks.windows(2).all(|w| w[0].distance <= w[1].distance));
        assert_eq!(result.chunks[0].document_id, "doc-7");
        assert_eq!(result.chunks[0].page, 1);
        assert!(result.chunks[0].end > result.chunks[0].start);
    }

    #[tokio::test]
    async fn mismatched_inputs_are_rejected() {
        let index = VectorIndex::new(Arc::new(InMemoryVectorStore::new()), config());
        let chunks = AdaptiveChunker::default().split(&Document::from_text("d", "Some text here."));
        assert!(index.upsert(&chunks, &[]).await.is_err());
    }

    #[test]
    fn error_rate_without_queries_is_zero() {
        assert!(QueryStatsSnapshot::default().error_rate().abs() < f64::EPSILON);
    }
}
