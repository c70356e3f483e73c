//! Multi-strategy retrieval: probe construction, merge, budget packing and the
//! quality gate that falls back to full document text.

use std::collections::HashMap;
use std::sync::Arc;

use lacuna_llm::Embedder;
use lacuna_memory::{Document, MetadataFilter, RetrievedChunk, VectorIndex};

use crate::config::RetrievalConfig;
use crate::course::CourseMetadata;
use crate::error::{AnalysisError, Result};

const EXCERPT_CHARS: usize = 500;
const MIDDLE_MIN_CHARS: usize = 1000;
const KEYWORD_PROBE: &str =
    "assignment question problem exercise task solve find compute calculate";
const CHUNK_SEPARATOR: &str = "\n\n";
/// Leftover space below which the last concept chunk is not cut to fit.
const MIN_PARTIAL_CHARS: usize = 200;

/// One retrieval query with the number of results it asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub label: &'static str,
    pub query: String,
    pub k: usize,
}

/// Deduplicated hits packed into a character budget.
#[derive(Debug, Clone, Default)]
pub struct MergedContext {
    pub text: String,
    pub chunks: Vec<RetrievedChunk>,
    /// At least one hit did not fit the budget.
    pub truncated: bool,
}

impl MergedContext {
    #[must_use]
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    /// Distinct pages covered by the packed chunks, ascending.
    #[must_use]
    pub fn pages(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self
            .chunks
            .iter()
            .flat_map(|c| {
                if c.pages.is_empty() {
                    vec![c.page]
                } else {
                    c.pages.clone()
                }
            })
            .collect();
        pages.sort_unstable();
        pages.dedup();
        pages
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextSource {
    Retrieved,
    /// Retrieval was too sparse or failed; the prompt carries the raw text.
    FullText,
}

/// Context chosen for whole-document analysis.
#[derive(Debug, Clone)]
pub struct DocumentContext {
    pub text: String,
    pub source: ContextSource,
    pub chunks: Vec<RetrievedChunk>,
    /// Minimum length the retrieved context had to reach.
    pub threshold: usize,
}

pub struct RetrievalOrchestrator {
    embedder: Arc<Embedder>,
    index: Arc<VectorIndex>,
    config: RetrievalConfig,
}

impl std::fmt::Debug for RetrievalOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetrievalOrchestrator {
    #[must_use]
    pub fn new(embedder: Arc<Embedder>, index: Arc<VectorIndex>, config: RetrievalConfig) -> Self {
        Self {
            embedder,
            index,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Probes for whole-document analysis: opening excerpt, assignment keyword
    /// probe, middle excerpt for longer documents, and the course identity.
    #[must_use]
    pub fn document_probes(&self, document: &Document, course: Option<&CourseMetadata>) -> Vec<Probe> {
        let n = self.config.document_results;
        let half = (n / 2).max(1);
        let third = (n / 3).max(1);
        let len = document.char_len();

        let mut probes = vec![
            Probe {
                label: "opening",
                query: document.text.chars().take(EXCERPT_CHARS).collect(),
                k: half,
            },
            Probe {
                label: "keywords",
                query: KEYWORD_PROBE.to_owned(),
                k: half,
            },
        ];
        if len > MIDDLE_MIN_CHARS {
            let start = len / 2 - EXCERPT_CHARS / 2;
            probes.push(Probe {
                label: "middle",
                query: document.text.chars().skip(start).take(EXCERPT_CHARS).collect(),
                k: third,
            });
        }
        if let Some(course) = course {
            let identity = course.identity_query();
            if !identity.is_empty() {
                probes.push(Probe {
                    label: "course",
                    query: identity,
                    k: third,
                });
            }
        }
        probes.retain(|p| !p.query.trim().is_empty());
        probes
    }

    /// Run `probes` against one document, merge by chunk id and pack into
    /// `budget` characters.
    ///
    /// A probe whose index query fails is skipped; the call fails only when
    /// every probe failed.
    ///
    /// # Errors
    ///
    /// Returns an embedding error, or the last index error when no probe
    /// produced results.
    pub async fn retrieve(
        &self,
        document_id: &str,
        probes: &[Probe],
        budget: usize,
    ) -> Result<MergedContext> {
        if probes.is_empty() {
            return Ok(MergedContext::default());
        }
        let hits = self.collect_hits(document_id, probes).await?;
        Ok(pack(merge(hits), budget))
    }

    async fn collect_hits(
        &self,
        document_id: &str,
        probes: &[Probe],
    ) -> Result<Vec<RetrievedChunk>> {
        let queries: Vec<String> = probes.iter().map(|p| p.query.clone()).collect();
        let vectors = self
            .embedder
            .embed_batch(&queries)
            .await
            .map_err(AnalysisError::from_embedding)?;
        let filter = MetadataFilter::document(document_id);

        let mut hits = Vec::new();
        let mut last_error = None;
        let mut answered = 0usize;
        for (probe, vector) in probes.iter().zip(&vectors) {
            match self.index.query(vector, probe.k, Some(&filter)).await {
                Ok(result) => {
                    tracing::debug!(
                        probe = probe.label,
                        hits = result.len(),
                        fallback = result.used_fallback,
                        "probe answered"
                    );
                    answered += 1;
                    hits.extend(result.chunks);
                }
                Err(e) => {
                    tracing::warn!(probe = probe.label, error = %e, "probe failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if answered == 0 => Err(e.into()),
            _ => Ok(hits),
        }
    }

    /// Minimum useful context for a document of `doc_len` characters.
    #[must_use]
    pub fn quality_threshold(&self, doc_len: usize) -> usize {
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let scaled = (doc_len as f64 * self.config.gate_ratio).round() as usize;
        scaled.clamp(self.config.gate_floor, self.config.gate_ceiling)
    }

    /// Retrieved context for whole-document analysis, or the full text when
    /// retrieval is below the quality threshold or the index is unusable.
    ///
    /// # Errors
    ///
    /// Returns an embedding error. Index failures degrade to full text.
    pub async fn document_context(
        &self,
        document: &Document,
        course: Option<&CourseMetadata>,
    ) -> Result<DocumentContext> {
        let threshold = self.quality_threshold(document.char_len());
        let probes = self.document_probes(document, course);

        let merged = match self
            .retrieve(&document.id, &probes, self.config.analysis_budget)
            .await
        {
            Ok(merged) => merged,
            Err(AnalysisError::Index(e)) => {
                tracing::warn!(error = %e, "retrieval failed, using full document text");
                MergedContext::default()
            }
            Err(e) => return Err(e),
        };

        let len = merged.char_len();
        if len < threshold {
            tracing::info!(
                retrieved = len,
                threshold,
                "retrieved context below threshold, using full document text"
            );
            return Ok(DocumentContext {
                text: document.text.clone(),
                source: ContextSource::FullText,
                chunks: merged.chunks,
                threshold,
            });
        }
        tracing::info!(
            retrieved = len,
            chunks = merged.chunks.len(),
            threshold,
            "using retrieved context"
        );
        Ok(DocumentContext {
            text: merged.text,
            source: ContextSource::Retrieved,
            chunks: merged.chunks,
            threshold,
        })
    }

    /// Targeted context for one gap concept: top chunks within the per-gap budget.
    ///
    /// # Errors
    ///
    /// Returns an embedding or index error.
    pub async fn gap_context(&self, document_id: &str, concept: &str) -> Result<MergedContext> {
        let probe = Probe {
            label: "concept",
            query: concept.to_owned(),
            k: self.config.gap_results,
        };
        let mut hits = merge(self.collect_hits(document_id, &[probe]).await?);
        hits.truncate(self.config.gap_chunks_kept);
        Ok(pack(hits, self.config.gap_budget))
    }

    /// Context covering several concepts, ranked by best similarity per chunk.
    ///
    /// # Errors
    ///
    /// Returns an embedding error, or an index error when every concept failed.
    pub async fn context_for_concepts(
        &self,
        document_id: &str,
        concepts: &[String],
    ) -> Result<String> {
        let probes: Vec<Probe> = concepts
            .iter()
            .filter(|c| !c.trim().is_empty())
            .map(|c| Probe {
                label: "concept",
                query: c.clone(),
                k: self.config.gap_results,
            })
            .collect();
        if probes.is_empty() {
            return Ok(String::new());
        }
        let hits = self.collect_hits(document_id, &probes).await?;

        let mut best: HashMap<String, (f32, RetrievedChunk)> = HashMap::new();
        for hit in hits {
            let score = 1.0 / (1.0 + hit.distance);
            match best.get(&hit.chunk_id) {
                Some((existing, _)) if *existing >= score => {}
                _ => {
                    best.insert(hit.chunk_id.clone(), (score, hit));
                }
            }
        }
        let mut ranked: Vec<(f32, RetrievedChunk)> = best.into_values().collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.chunk_id.cmp(&b.1.chunk_id)));

        Ok(pack_with_partial(
            ranked.into_iter().map(|(_, c)| c.text),
            self.config.concept_budget,
        ))
    }
}

/// Deduplicate by chunk id keeping the closest hit, ordered by ascending distance.
fn merge(hits: Vec<RetrievedChunk>) -> Vec<RetrievedChunk> {
    let mut by_id: HashMap<String, RetrievedChunk> = HashMap::new();
    for hit in hits {
        match by_id.get(&hit.chunk_id) {
            Some(existing) if existing.distance <= hit.distance => {}
            _ => {
                by_id.insert(hit.chunk_id.clone(), hit);
            }
        }
    }
    let mut merged: Vec<RetrievedChunk> = by_id.into_values().collect();
    merged.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    merged
}

/// Greedy packing in relevance order. A first chunk larger than the budget is
/// cut so the context is never empty when hits exist.
fn pack(hits: Vec<RetrievedChunk>, budget: usize) -> MergedContext {
    let sep = CHUNK_SEPARATOR.chars().count();
    let mut out = MergedContext::default();
    let mut used = 0usize;

    for hit in hits {
        let cost = hit.text.chars().count() + if out.chunks.is_empty() { 0 } else { sep };
        if used + cost > budget {
            out.truncated = true;
            if out.chunks.is_empty() && budget > 0 {
                out.text = hit.text.chars().take(budget).collect();
                out.chunks.push(hit);
            }
            break;
        }
        if !out.chunks.is_empty() {
            out.text.push_str(CHUNK_SEPARATOR);
        }
        out.text.push_str(&hit.text);
        used += cost;
        out.chunks.push(hit);
    }
    out
}

/// Pack texts into `budget` characters; when the next text does not fit and
/// more than 200 characters remain, add its prefix cut at the last sentence
/// end past 70% of the remaining space.
fn pack_with_partial(texts: impl IntoIterator<Item = String>, budget: usize) -> String {
    let sep = CHUNK_SEPARATOR.chars().count();
    let mut out = String::new();
    let mut used = 0usize;

    for text in texts {
        let joiner = if out.is_empty() { 0 } else { sep };
        let len = text.chars().count();
        if used + joiner + len <= budget {
            if joiner > 0 {
                out.push_str(CHUNK_SEPARATOR);
            }
            out.push_str(&text);
            used += joiner + len;
            continue;
        }
        let remaining = budget.saturating_sub(used + joiner);
        if remaining > MIN_PARTIAL_CHARS {
            let prefix: String = text.chars().take(remaining).collect();
            let cut = match prefix.rfind('.') {
                Some(dot) if prefix[..dot].chars().count() > remaining * 7 / 10 => &prefix[..=dot],
                _ => prefix.as_str(),
            };
            if joiner > 0 {
                out.push_str(CHUNK_SEPARATOR);
            }
            out.push_str(cut);
        }
        break;
    }
    out
}

#[cfg(test)]
mod tests {
    use lacuna_llm::mock::MockLoader;
    use lacuna_memory::{IndexConfig, InMemoryVectorStore};

    use super::*;
    use crate::test_support::{DIM, indexed, lecture_text};

    fn chunk(id: &str, distance: f32, text: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: id.into(),
            document_id: "doc".into(),
            text: text.into(),
            distance,
            page: 1,
            pages: vec![1],
            start: 0,
            end: text.len(),
        }
    }

    #[test]
    fn merge_dedups_and_orders_by_distance() {
        let merged = merge(vec![
            chunk("d:1", 0.4, "b"),
            chunk("d:0", 0.2, "a"),
            chunk("d:1", 0.1, "b"),
        ]);
        let ids: Vec<_> = merged.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["d:1", "d:0"]);
        assert!((merged[0].distance - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn pack_respects_budget() {
        let packed = pack(
            vec![chunk("a", 0.1, "aaaa"), chunk("b", 0.2, "bbbb"), chunk("c", 0.3, "cccc")],
            10,
        );
        assert_eq!(packed.text, "aaaa\n\nbbbb");
        assert_eq!(packed.chunks.len(), 2);
        assert!(packed.truncated);
    }

    #[test]
    fn pack_cuts_oversized_first_chunk() {
        let packed = pack(vec![chunk("a", 0.1, &"x".repeat(50))], 20);
        assert_eq!(packed.char_len(), 20);
        assert_eq!(packed.chunks.len(), 1);
    }

    #[test]
    fn partial_pack_cuts_at_sentence() {
        let first = "a".repeat(700);
        let second = format!("{}. {}", "b".repeat(250), "c".repeat(200));
        let out = pack_with_partial([first, second], 1000);
        assert!(out.ends_with("b."));
        assert!(out.chars().count() <= 1000);

        let tiny = pack_with_partial(["a".repeat(900), "b".repeat(300)], 1000);
        assert_eq!(tiny, "a".repeat(900));
    }

    #[test]
    fn threshold_scales_with_length() {
        let orch = RetrievalOrchestrator::new(
            Arc::new(Embedder::new(Arc::new(MockLoader::new(DIM)))),
            Arc::new(VectorIndex::new(
                Arc::new(InMemoryVectorStore::new()),
                IndexConfig::default(),
            )),
            RetrievalConfig::default(),
        );
        assert_eq!(orch.quality_threshold(200), 100);
        assert_eq!(orch.quality_threshold(1400), 350);
        assert_eq!(orch.quality_threshold(100_000), 1500);
        assert!(1442 >= orch.quality_threshold(1400));
    }

    #[tokio::test]
    async fn probes_cover_opening_keywords_middle_and_course() {
        let doc = Document::from_text("d", lecture_text(3000));
        let orch = indexed(&[]).await;
        let course = CourseMetadata::new("MATH 307", "UBC").with_name("Applied Linear Algebra");
        let probes = orch.document_probes(&doc, Some(&course));
        let labels: Vec<_> = probes.iter().map(|p| p.label).collect();
        assert_eq!(labels, vec!["opening", "keywords", "middle", "course"]);
        assert_eq!(probes[0].k, 5);
        assert_eq!(probes[2].k, 3);
        assert_eq!(probes[0].query.chars().count(), 500);
        assert_eq!(probes[3].query, "MATH 307 UBC Applied Linear Algebra");

        let short = Document::from_text("s", lecture_text(800));
        let labels: Vec<_> = orch
            .document_probes(&short, None)
            .iter()
            .map(|p| p.label)
            .collect();
        assert_eq!(labels, vec!["opening", "keywords"]);
    }

    #[tokio::test]
    async fn short_document_passes_quality_gate() {
        let doc = Document::from_text("doc-short", lecture_text(1400));
        let orch = indexed(&[&doc]).await;
        let context = orch.document_context(&doc, None).await.unwrap();
        assert_eq!(context.source, ContextSource::Retrieved);
        assert_eq!(context.threshold, 350);
        assert!(context.text.chars().count() >= 350);
        assert!(context.chunks.iter().all(|c| c.document_id == "doc-short"));
    }

    #[tokio::test]
    async fn sparse_retrieval_falls_back_to_full_text() {
        let doc = Document::from_text("doc-a", lecture_text(3000));
        let orch = indexed(&[]).await;
        let context = orch.document_context(&doc, None).await.unwrap();
        assert_eq!(context.source, ContextSource::FullText);
        assert_eq!(context.text, doc.text);
    }

    #[tokio::test]
    async fn retrieval_is_scoped_to_one_document() {
        let a = Document::from_text("doc-a", lecture_text(2500));
        let b = Document::from_text("doc-b", "Unrelated notes about medieval poetry. ".repeat(60));
        let orch = indexed(&[&a, &b]).await;
        let merged = orch
            .retrieve("doc-b", &orch.document_probes(&b, None), 6000)
            .await
            .unwrap();
        assert!(!merged.chunks.is_empty());
        assert!(merged.chunks.iter().all(|c| c.document_id == "doc-b"));
        let mut ids: Vec<_> = merged.chunks.iter().map(|c| c.chunk_id.clone()).collect();
        ids.dedup();
        assert_eq!(ids.len(), merged.chunks.len());
    }

    #[tokio::test]
    async fn gap_context_keeps_top_chunks() {
        let doc = Document::from_text("doc-g", lecture_text(3000));
        let orch = indexed(&[&doc]).await;
        let ctx = orch.gap_context("doc-g", "Rayleigh quotient").await.unwrap();
        assert!(ctx.chunks.len() <= 2);
        assert!(!ctx.chunks.is_empty());
        assert!(ctx.char_len() <= 1500);
        assert!(!ctx.pages().is_empty());
    }

    #[tokio::test]
    async fn concept_context_is_bounded() {
        let doc = Document::from_text("doc-c", lecture_text(20_000));
        let orch = indexed(&[&doc]).await;
        let text = orch
            .context_for_concepts(
                "doc-c",
                &["power method".into(), "deflation".into(), " ".into()],
            )
            .await
            .unwrap();
        assert!(!text.is_empty());
        assert!(text.chars().count() <= 8000);
        assert!(orch.context_for_concepts("doc-c", &[]).await.unwrap().is_empty());
    }
}
