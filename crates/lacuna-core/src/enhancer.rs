//! Per-gap supporting context from a second, targeted retrieval pass.

use std::sync::Arc;

use futures::StreamExt;
use tracing::Instrument;

use crate::gap::Gap;
use crate::retrieval::{MergedContext, RetrievalOrchestrator};

const DEFAULT_PARALLEL: usize = 4;

/// Counts for one enhancement pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnhanceReport {
    pub enhanced: usize,
    /// Retrieval succeeded but found nothing for the concept.
    pub empty: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct GapEnhancer {
    retrieval: Arc<RetrievalOrchestrator>,
    max_parallel: usize,
}

impl GapEnhancer {
    #[must_use]
    pub fn new(retrieval: Arc<RetrievalOrchestrator>) -> Self {
        Self {
            retrieval,
            max_parallel: DEFAULT_PARALLEL,
        }
    }

    #[must_use]
    pub fn with_parallelism(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Attach retrieved context and page references to every gap.
    ///
    /// Each gap is looked up on its own; a failed lookup leaves that gap
    /// without context and does not affect the others.
    pub async fn enhance(&self, document_id: &str, gaps: &mut [Gap]) -> EnhanceReport {
        let targets: Vec<(String, String)> = gaps
            .iter()
            .map(|gap| (gap.id.clone(), gap.concept.clone()))
            .collect();
        let lookups = futures::stream::iter(targets.into_iter().map(|(gap_id, concept)| {
            let retrieval = Arc::clone(&self.retrieval);
            let document_id = document_id.to_owned();
            async move { retrieval.gap_context(&document_id, &concept).await }
                .instrument(tracing::debug_span!("enhance_gap", gap_id = %gap_id))
        }));
        let results: Vec<_> = lookups.buffered(self.max_parallel).collect().await;

        let mut report = EnhanceReport::default();
        for (gap, result) in gaps.iter_mut().zip(results) {
            match result {
                Ok(context) if !context.text.is_empty() => {
                    attach(gap, &context);
                    report.enhanced += 1;
                }
                Ok(_) => report.empty += 1,
                Err(e) => {
                    tracing::warn!(gap_id = %gap.id, concept = %gap.concept, error = %e, "gap enhancement failed");
                    report.failed += 1;
                }
            }
        }
        tracing::info!(
            document_id,
            enhanced = report.enhanced,
            empty = report.empty,
            failed = report.failed,
            "gaps enhanced"
        );
        report
    }
}

fn attach(gap: &mut Gap, context: &MergedContext) {
    gap.supporting_context = Some(context.text.clone());
    gap.page_references = context.pages();
}
