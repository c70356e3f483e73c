//! Qdrant backend for [`VectorStore`].

use std::collections::HashMap;

use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    CountPointsBuilder, CreateCollectionBuilder, Distance, Filter, GetPointsBuilder,
    HnswConfigDiffBuilder, PointId, PointStruct,
    SearchParamsBuilder, SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
    point_id::PointIdOptions, value::Kind,
};

use crate::vector_store::{
    BoxFuture, FieldCondition, FieldValue, IndexEntry, MetadataFilter, Payload, ScoredEntry,
    VectorStore, VectorStoreError,
};

/// Payload key holding the caller's entry id; Qdrant only accepts UUID or
/// integer point ids.
pub const ENTRY_ID_FIELD: &str = "entry_id";

/// Graph parameters. Defaults are sized so filtered searches over a few
/// thousand points do not hit "ef or M is too small".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HnswSettings {
    pub m: u64,
    pub ef_construct: u64,
    pub search_ef: u64,
}

impl Default for HnswSettings {
    fn default() -> Self {
        Self {
            m: 32,
            ef_construct: 200,
            search_ef: 128,
        }
    }
}

#[derive(Clone)]
pub struct QdrantOps {
    client: Qdrant,
    hnsw: HnswSettings,
}

impl std::fmt::Debug for QdrantOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QdrantOps")
            .field("hnsw", &self.hnsw)
            .finish_non_exhaustive()
    }
}

impl QdrantOps {
    /// # Errors
    ///
    /// Returns `VectorStoreError::Connection` if the client cannot be built.
    pub fn new(url: &str) -> Result<Self, VectorStoreError> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| VectorStoreError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            hnsw: HnswSettings::default(),
        })
    }

    #[must_use]
    pub fn with_hnsw(mut self, hnsw: HnswSettings) -> Self {
        self.hnsw = hnsw;
        self
    }

    #[must_use]
    pub fn client(&self) -> &Qdrant {
        &self.client
    }

    /// Deterministic UUID for an entry id, so re-upserting overwrites.
    #[must_use]
    pub fn point_id(entry_id: &str) -> String {
        uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, entry_id.as_bytes()).to_string()
    }

    /// # Errors
    ///
    /// Returns a serialization error if `payload` holds values Qdrant cannot store.
    pub fn json_to_payload(
        payload: Payload,
    ) -> Result<HashMap<String, qdrant_client::qdrant::Value>, VectorStoreError> {
        serde_json::from_value(serde_json::Value::Object(payload.into_iter().collect()))
            .map_err(|e| VectorStoreError::Serialization(e.to_string()))
    }
}

fn is_connection_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["transport error", "connection refused", "dns error", "broken pipe"]
        .iter()
        .any(|m| lower.contains(m))
}

impl VectorStore for QdrantOps {
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            if self
                .client
                .collection_exists(&collection)
                .await
                .map_err(|e| VectorStoreError::Collection(e.to_string()))?
            {
                return Ok(());
            }
            tracing::info!(%collection, vector_size, m = self.hnsw.m, "creating qdrant collection");
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(collection.as_str())
                        .vectors_config(VectorParamsBuilder::new(vector_size, Distance::Cosine))
                        .hnsw_config(
                            HnswConfigDiffBuilder::default()
                                .m(self.hnsw.m)
                                .ef_construct(self.hnsw.ef_construct),
                        ),
                )
                .await
                .map_err(|e| VectorStoreError::Collection(e.to_string()))?;
            Ok(())
        })
    }

    fn upsert(
        &self,
        collection: &str,
        entries: Vec<IndexEntry>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let points = entries
                .into_iter()
                .map(|e| {
                    let point_id = Self::point_id(&e.id);
                    let mut payload = e.payload;
                    payload.insert(ENTRY_ID_FIELD.into(), serde_json::Value::String(e.id));
                    Ok(PointStruct::new(point_id, e.vector, Self::json_to_payload(payload)?))
                })
                .collect::<Result<Vec<_>, VectorStoreError>>()?;
            if points.is_empty() {
                return Ok(());
            }
            self.client
                .upsert_points(UpsertPointsBuilder::new(collection.as_str(), points).wait(true))
                .await
                .map_err(|e| VectorStoreError::Upsert(e.to_string()))?;
            Ok(())
        })
    }

    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<MetadataFilter>,
    ) -> BoxFuture<'_, Result<Vec<ScoredEntry>, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let mut builder = SearchPointsBuilder::new(collection.as_str(), vector, limit)
                .with_payload(true)
                .params(SearchParamsBuilder::default().hnsw_ef(self.hnsw.search_ef));
            if let Some(f) = filter {
                builder = builder.filter(metadata_filter_to_qdrant(f));
            }
            let response = self.client.search_points(builder).await.map_err(|e| {
                let message = e.to_string();
                if is_connection_failure(&message) {
                    VectorStoreError::Connection(message)
                } else {
                    VectorStoreError::from_search_message(message)
                }
            })?;
            Ok(response
                .result
                .into_iter()
                .map(|p| {
                    let (id, payload) = split_payload(p.id, p.payload);
                    ScoredEntry {
                        id,
                        score: p.score,
                        payload,
                    }
                })
                .collect())
        })
    }

    fn get_payloads(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<HashMap<String, Payload>, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(HashMap::new());
            }
            let point_ids: Vec<PointId> = ids
                .iter()
                .map(|id| PointId::from(Self::point_id(id)))
                .collect();
            let response = self
                .client
                .get_points(
                    GetPointsBuilder::new(collection.as_str(), point_ids)
                        .with_payload(true)
                        .with_vectors(false),
                )
                .await
                .map_err(|e| VectorStoreError::Search(e.to_string()))?;
            Ok(response
                .result
                .into_iter()
                .map(|p| split_payload(p.id, p.payload))
                .collect())
        })
    }

    fn count(&self, collection: &str) -> BoxFuture<'_, Result<u64, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let response = self
                .client
                .count(CountPointsBuilder::new(collection.as_str()).exact(true))
                .await
                .map_err(|e| VectorStoreError::Collection(e.to_string()))?;
            Ok(response.result.map_or(0, |r| r.count))
        })
    }
}

fn metadata_filter_to_qdrant(filter: MetadataFilter) -> Filter {
    Filter {
        must: filter.must.into_iter().map(field_condition_to_qdrant).collect(),
        must_not: filter
            .must_not
            .into_iter()
            .map(field_condition_to_qdrant)
            .collect(),
        ..Filter::default()
    }
}

fn field_condition_to_qdrant(cond: FieldCondition) -> qdrant_client::qdrant::Condition {
    match cond.value {
        FieldValue::Integer(v) => qdrant_client::qdrant::Condition::matches(cond.field, v),
        FieldValue::Text(v) => qdrant_client::qdrant::Condition::matches(cond.field, v),
    }
}

/// Recover the caller's entry id and a JSON payload from a stored point.
fn split_payload(
    id: Option<PointId>,
    payload: HashMap<String, qdrant_client::qdrant::Value>,
) -> (String, Payload) {
    let mut payload: Payload = payload
        .into_iter()
        .filter_map(|(k, v)| Some((k, value_to_json(v)?)))
        .collect();
    let entry_id = match payload.remove(ENTRY_ID_FIELD) {
        Some(serde_json::Value::String(s)) => s,
        _ => match id.and_then(|pid| pid.point_id_options) {
            Some(PointIdOptions::Uuid(u)) => u,
            Some(PointIdOptions::Num(n)) => n.to_string(),
            None => String::new(),
        },
    };
    (entry_id, payload)
}

fn value_to_json(v: qdrant_client::qdrant::Value) -> Option<serde_json::Value> {
    Some(match v.kind? {
        Kind::NullValue(_) => serde_json::Value::Null,
        Kind::StringValue(s) => serde_json::Value::String(s),
        Kind::IntegerValue(i) => serde_json::Value::Number(i.into()),
        Kind::DoubleValue(d) => serde_json::Number::from_f64(d).map(serde_json::Value::Number)?,
        Kind::BoolValue(b) => serde_json::Value::Bool(b),
        Kind::ListValue(list) => serde_json::Value::Array(
            list.values.into_iter().filter_map(value_to_json).collect(),
        ),
        Kind::StructValue(s) => serde_json::Value::Object(
            s.fields
                .into_iter()
                .filter_map(|(k, v)| Some((k, value_to_json(v)?)))
                .collect(),
        ),
    })
}
