use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::vector_store::{
    BoxFuture, IndexEntry, MetadataFilter, Payload, ScoredEntry, VectorStore, VectorStoreError,
};

type Collections = HashMap<String, Shelf>;

/// One named collection: a fixed dimension and its entries keyed by id.
struct Shelf {
    dimension: usize,
    vectors: HashMap<String, (Vec<f32>, Payload)>,
}

impl Shelf {
    fn admit(&mut self, entries: Vec<IndexEntry>) -> Result<(), String> {
        if let Some(bad) = entries.iter().find(|e| e.vector.len() != self.dimension) {
            return Err(format!(
                "entry {} has {} dims, collection expects {}",
                bad.id,
                bad.vector.len(),
                self.dimension
            ));
        }
        self.vectors
            .extend(entries.into_iter().map(|e| (e.id, (e.vector, e.payload))));
        Ok(())
    }

    /// Closest entries first; equal scores fall back to id order so results
    /// are stable across runs.
    fn rank(&self, query: &[f32], limit: usize, filter: Option<&MetadataFilter>) -> Vec<ScoredEntry> {
        let mut hits: Vec<ScoredEntry> = self
            .vectors
            .iter()
            .filter(|(_, (_, payload))| filter.is_none_or(|f| f.matches(payload)))
            .map(|(id, (vector, payload))| ScoredEntry {
                id: id.clone(),
                score: cosine(query, vector),
                payload: payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(limit);
        hits
    }
}

/// Exact cosine search over process memory. Used for tests and for running
/// without a Qdrant instance.
#[derive(Default)]
pub struct InMemoryVectorStore {
    shelves: RwLock<Collections>,
}

impl InMemoryVectorStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn shelves(&self) -> Result<RwLockReadGuard<'_, Collections>, String> {
        self.shelves.read().map_err(|e| e.to_string())
    }

    fn shelves_mut(&self) -> Result<RwLockWriteGuard<'_, Collections>, String> {
        self.shelves.write().map_err(|e| e.to_string())
    }
}

impl std::fmt::Debug for InMemoryVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let collections = self.shelves.read().map_or(0, |s| s.len());
        f.debug_struct("InMemoryVectorStore")
            .field("collections", &collections)
            .finish()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let (dot, aa, bb) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, aa, bb), (x, y)| {
            (dot + x * y, aa + x * x, bb + y * y)
        });
    if aa == 0.0 || bb == 0.0 {
        0.0
    } else {
        dot / (aa.sqrt() * bb.sqrt())
    }
}

impl VectorStore for InMemoryVectorStore {
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let name = collection.to_owned();
        Box::pin(async move {
            let dimension = usize::try_from(vector_size)
                .map_err(|e| VectorStoreError::Collection(e.to_string()))?;
            let mut shelves = self.shelves_mut().map_err(VectorStoreError::Collection)?;
            let shelf = shelves.entry(name.clone()).or_insert_with(|| Shelf {
                dimension,
                vectors: HashMap::new(),
            });
            if shelf.dimension == dimension {
                Ok(())
            } else {
                Err(VectorStoreError::Collection(format!(
                    "collection {name} has dimension {}, requested {dimension}",
                    shelf.dimension
                )))
            }
        })
    }

    fn upsert(
        &self,
        collection: &str,
        entries: Vec<IndexEntry>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let name = collection.to_owned();
        Box::pin(async move {
            let mut shelves = self.shelves_mut().map_err(VectorStoreError::Upsert)?;
            shelves
                .get_mut(&name)
                .ok_or_else(|| format!("collection {name} not found"))
                .and_then(|shelf| shelf.admit(entries))
                .map_err(VectorStoreError::Upsert)
        })
    }

    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<MetadataFilter>,
    ) -> BoxFuture<'_, Result<Vec<ScoredEntry>, VectorStoreError>> {
        let name = collection.to_owned();
        Box::pin(async move {
            let shelves = self.shelves().map_err(VectorStoreError::Search)?;
            let shelf = shelves
                .get(&name)
                .ok_or_else(|| VectorStoreError::Search(format!("collection {name} not found")))?;
            let limit = usize::try_from(limit).unwrap_or(usize::MAX);
            Ok(shelf.rank(&vector, limit, filter.as_ref()))
        })
    }

    fn get_payloads(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<HashMap<String, Payload>, VectorStoreError>> {
        let name = collection.to_owned();
        Box::pin(async move {
            let shelves = self.shelves().map_err(VectorStoreError::Search)?;
            let found = shelves.get(&name).map_or_else(HashMap::new, |shelf| {
                ids.into_iter()
                    .filter_map(|id| {
                        let (_, payload) = shelf.vectors.get(&id)?;
                        Some((id, payload.clone()))
                    })
                    .collect()
            });
            Ok(found)
        })
    }

    fn count(&self, collection: &str) -> BoxFuture<'_, Result<u64, VectorStoreError>> {
        let name = collection.to_owned();
        Box::pin(async move {
            let shelves = self.shelves().map_err(VectorStoreError::Collection)?;
            Ok(shelves.get(&name).map_or(0, |s| s.vectors.len() as u64))
        })
    }
}
