use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

/// Backend messages known to signal an intermittent failure of filtered or
/// graph-based lookups rather than a real fault.
const TRANSIENT_MARKERS: &[&str] = &[
    "ef or m is too small",
    "contigious 2d array",
    "contiguous 2d array",
    "cannot return the results",
    "number of requested results",
    "hnsw",
    "timed out",
    "timeout",
    "temporarily unavailable",
    "service unavailable",
    "resource exhausted",
];

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("collection error: {0}")]
    Collection(String),
    #[error("upsert error: {0}")]
    Upsert(String),
    #[error("search error: {0}")]
    Search(String),
    #[error("transient backend error: {0}")]
    Transient(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl VectorStoreError {
    /// Classify a raw search failure message.
    #[must_use]
    pub fn from_search_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_transient_message(&message) {
            Self::Transient(message)
        } else {
            Self::Search(message)
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Connection(_))
    }
}

#[must_use]
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

pub type Payload = HashMap<String, serde_json::Value>;

/// Vector plus metadata as persisted by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    pub must: Vec<FieldCondition>,
    pub must_not: Vec<FieldCondition>,
}

impl MetadataFilter {
    /// Restrict to entries whose `field` equals `value`.
    #[must_use]
    pub fn field_eq(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self {
            must: vec![FieldCondition {
                field: field.into(),
                value: value.into(),
            }],
            must_not: Vec::new(),
        }
    }

    #[must_use]
    pub fn document(document_id: &str) -> Self {
        Self::field_eq("document_id", document_id)
    }

    /// Evaluate this filter in process.
    #[must_use]
    pub fn matches(&self, payload: &Payload) -> bool {
        for cond in &self.must {
            let Some(val) = payload.get(&cond.field) else {
                return false;
            };
            if !cond.value.matches(val) {
                return false;
            }
        }
        for cond in &self.must_not {
            if let Some(val) = payload.get(&cond.field)
                && cond.value.matches(val)
            {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldCondition {
    pub field: String,
    pub value: FieldValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Integer(i64),
    Text(String),
}

impl FieldValue {
    fn matches(&self, val: &serde_json::Value) -> bool {
        match self {
            Self::Integer(i) => val.as_i64() == Some(*i),
            Self::Text(s) => val.as_str() == Some(s.as_str()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

/// Search hit. `score` is cosine similarity, higher is closer.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    pub id: String,
    pub score: f32,
    pub payload: Payload,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait VectorStore: Send + Sync {
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    /// Insert or overwrite entries by id.
    fn upsert(
        &self,
        collection: &str,
        entries: Vec<IndexEntry>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<MetadataFilter>,
    ) -> BoxFuture<'_, Result<Vec<ScoredEntry>, VectorStoreError>>;

    /// Payloads of the given ids that already exist; missing ids are absent
    /// from the map.
    fn get_payloads(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<HashMap<String, Payload>, VectorStoreError>>;

    fn count(&self, collection: &str) -> BoxFuture<'_, Result<u64, VectorStoreError>>;
}
