//! One analysis session: chunk, embed, store, retrieve, analyze, enhance and
//! balance, reporting each stage.

use std::sync::Arc;

use lacuna_llm::{Embedder, LlmProvider, ModelChain};
use lacuna_memory::{AdaptiveChunker, Document, Embedding, VectorIndex, VectorStore};
use serde_json::json;

use crate::analysis::{AnalysisEngine, PromptInput};
use crate::assignment::extract_assignment_context;
use crate::balance::{BalanceValidator, LlmReclassifier};
use crate::config::{Config, TutorConfig};
use crate::course::CourseMetadata;
use crate::enhancer::GapEnhancer;
use crate::error::{AnalysisError, Result};
use crate::gap::AnalysisResult;
use crate::progress::{ProgressReporter, ProgressStream, Stage};
use crate::retrieval::{ContextSource, RetrievalOrchestrator};
use crate::tutor::Tutor;

/// Drives the full pipeline for one document at a time. Cheap to share across
/// concurrent sessions behind an `Arc`.
pub struct GapAnalyzer<P> {
    chunker: AdaptiveChunker,
    embedder: Arc<Embedder>,
    index: Arc<VectorIndex>,
    retrieval: Arc<RetrievalOrchestrator>,
    engine: Arc<AnalysisEngine<P>>,
    enhancer: GapEnhancer,
    balance: BalanceValidator,
    enhance_gaps: bool,
    tutor: TutorConfig,
}

impl<P> std::fmt::Debug for GapAnalyzer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GapAnalyzer")
            .field("chunker", &self.chunker)
            .field("enhance_gaps", &self.enhance_gaps)
            .finish_non_exhaustive()
    }
}

impl<P: LlmProvider> GapAnalyzer<P> {
    #[must_use]
    pub fn new(
        config: &Config,
        embedder: Arc<Embedder>,
        store: Arc<dyn VectorStore>,
        provider: P,
    ) -> Self {
        let index = Arc::new(VectorIndex::new(store, config.index.index_config()));
        let retrieval = Arc::new(RetrievalOrchestrator::new(
            Arc::clone(&embedder),
            Arc::clone(&index),
            config.retrieval.clone(),
        ));
        let chain = ModelChain::new(provider, config.llm.models.clone());
        Self {
            chunker: AdaptiveChunker::new(config.chunking.chunker_config()),
            embedder,
            index,
            enhancer: GapEnhancer::new(Arc::clone(&retrieval)),
            retrieval,
            engine: Arc::new(AnalysisEngine::new(chain, config.analysis.clone())),
            balance: BalanceValidator::new(config.balance.clone()),
            enhance_gaps: config.analysis.enhance_gaps,
            tutor: config.tutor.clone(),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<AnalysisEngine<P>> {
        &self.engine
    }

    #[must_use]
    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// Follow-up explanations and chat over documents this analyzer indexed.
    #[must_use]
    pub fn tutor(&self) -> Tutor<P> {
        Tutor::new(
            Arc::clone(&self.retrieval),
            Arc::clone(&self.engine),
            self.tutor.clone(),
        )
    }

    /// Run a session without a progress consumer.
    ///
    /// # Errors
    ///
    /// See [`GapAnalyzer::analyze_with_progress`].
    pub async fn analyze(&self, document: &Document, course: &CourseMetadata) -> Result<AnalysisResult> {
        self.analyze_with_progress(document, course, ProgressReporter::silent(document.id.clone()))
            .await
    }

    /// Run a session, reporting every stage to `reporter`. The reporter always
    /// ends with `completed` or `error`. Dropping the progress stream cancels
    /// the session.
    ///
    /// # Errors
    ///
    /// Returns `AnalysisError::Ingestion` for a blank document, embedding
    /// errors, model chain or safety failures from the analysis call, and
    /// `AnalysisError::Cancelled` when the progress consumer went away.
    pub async fn analyze_with_progress(
        &self,
        document: &Document,
        course: &CourseMetadata,
        mut reporter: ProgressReporter,
    ) -> Result<AnalysisResult> {
        let gone = reporter.receiver_gone();
        let outcome = tokio::select! {
            outcome = self.run(document, course, &mut reporter) => outcome,
            () = gone => {
                tracing::info!(document_id = %document.id, "progress consumer dropped, cancelling analysis");
                Err(AnalysisError::Cancelled)
            }
        };
        match outcome {
            Ok(result) => {
                reporter.complete(&result);
                Ok(result)
            }
            Err(e) => {
                tracing::error!(document_id = %document.id, error = %e, "analysis failed");
                reporter.fail(&e);
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        document: &Document,
        course: &CourseMetadata,
        reporter: &mut ProgressReporter,
    ) -> Result<AnalysisResult> {
        reporter.stage_with(
            Stage::Uploaded,
            format!("received document {}", document.id),
            Some(json!({ "documentId": document.id, "bytes": document.source_bytes })),
        );
        if document.is_blank() {
            return Err(AnalysisError::Ingestion(format!(
                "document {} contains no text",
                document.id
            )));
        }
        reporter.stage_with(
            Stage::Extracted,
            format!(
                "{} characters on {} pages",
                document.char_len(),
                document.page_count()
            ),
            Some(json!({ "chars": document.char_len(), "pages": document.page_count() })),
        );

        let chunks = self.chunker.split(document);
        if chunks.is_empty() {
            return Err(AnalysisError::Ingestion(format!(
                "document {} produced no chunks",
                document.id
            )));
        }
        reporter.stage(
            Stage::EmbeddingsGenerating,
            format!("embedding {} chunks", chunks.len()),
        );
        let encoder = self
            .embedder
            .ensure_initialized()
            .await
            .map_err(AnalysisError::from_embedding)?;
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self
            .embedder
            .embed_batch(&texts)
            .await
            .map_err(AnalysisError::from_embedding)?;
        let dimension = vectors.first().map_or(0, Vec::len);
        let embeddings: Vec<Embedding> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| Embedding {
                chunk_id: chunk.id(),
                vector,
                model: encoder.model_id().to_owned(),
            })
            .collect();
        reporter.stage_with(
            Stage::EmbeddingsGenerated,
            format!("{} embeddings of dimension {dimension}", embeddings.len()),
            Some(json!({ "chunks": embeddings.len(), "dimension": dimension })),
        );

        reporter.stage(Stage::VectorDbStoring, "storing chunks in the vector index");
        let stored = async {
            self.index.ensure_ready(dimension).await?;
            self.index.upsert(&chunks, &embeddings).await
        }
        .await;
        match stored {
            Ok(report) => reporter.stage_with(
                Stage::VectorDbStored,
                format!(
                    "{} inserted, {} updated, {} unchanged",
                    report.inserted, report.updated, report.skipped
                ),
                Some(json!({
                    "inserted": report.inserted,
                    "updated": report.updated,
                    "skipped": report.skipped,
                })),
            ),
            Err(e) => {
                tracing::warn!(document_id = %document.id, error = %e, "vector index unavailable, continuing with full text");
                reporter.stage_with(
                    Stage::VectorDbStored,
                    "vector index unavailable, continuing with full text",
                    Some(json!({ "error": e.to_string() })),
                );
            }
        }

        reporter.stage(Stage::RagRetrieving, "retrieving relevant context");
        let context = self.retrieval.document_context(document, Some(course)).await?;
        let source = match context.source {
            ContextSource::Retrieved => "retrieved",
            ContextSource::FullText => "full_text",
        };
        reporter.stage_with(
            Stage::RagRetrieved,
            format!(
                "{} characters of {source} context",
                context.text.chars().count()
            ),
            Some(json!({
                "source": source,
                "chars": context.text.chars().count(),
                "chunks": context.chunks.len(),
                "threshold": context.threshold,
            })),
        );

        let assignments = extract_assignment_context(&document.text);
        reporter.stage(Stage::LlmAnalyzing, "asking the model for knowledge gaps");
        let input = PromptInput {
            text: &context.text,
            source: context.source,
            course,
            assignments: &assignments,
        };
        let output = self.engine.analyze(&document.id, &input).await?;
        reporter.stage_with(
            Stage::LlmAnalyzed,
            format!("response from {}", output.model),
            Some(json!({ "model": output.model, "sanitized": output.sanitized })),
        );

        reporter.stage(Stage::GapsParsing, "parsing gap records");
        let mut gaps = output.gaps;
        reporter.stage_with(
            Stage::GapsParsed,
            format!("{} gaps parsed, {} dropped", gaps.len(), output.dropped.len()),
            Some(json!({
                "gaps": gaps.len(),
                "dropped": output.dropped.len(),
                "parseFailure": output.parse_failure,
            })),
        );

        reporter.stage(Stage::GapsEnhancing, "attaching supporting context");
        if self.enhance_gaps && !gaps.is_empty() {
            let report = self.enhancer.enhance(&document.id, &mut gaps).await;
            reporter.stage_with(
                Stage::GapsEnhanced,
                format!("{} of {} gaps enhanced", report.enhanced, gaps.len()),
                Some(json!({
                    "enhanced": report.enhanced,
                    "empty": report.empty,
                    "failed": report.failed,
                })),
            );
        } else {
            reporter.stage(Stage::GapsEnhanced, "no gaps to enhance");
        }

        let reclassifier = LlmReclassifier::new(Arc::clone(&self.engine));
        let balance = self
            .balance
            .validate(&mut gaps, &assignments, &reclassifier)
            .await;
        tracing::info!(
            document_id = %document.id,
            total = balance.total,
            critical = balance.critical,
            defaulted_to_safe = balance.defaulted_to_safe,
            reclassified = balance.reclassified,
            overridden = balance.overridden,
            "category balance checked"
        );

        Ok(AnalysisResult::new(document.id.clone(), gaps))
    }
}

impl<P: LlmProvider + 'static> GapAnalyzer<P> {
    /// Start a session on the runtime and return its progress stream.
    #[must_use]
    pub fn analyze_streaming(
        self: &Arc<Self>,
        document: Document,
        course: CourseMetadata,
    ) -> ProgressStream {
        let (reporter, stream) = ProgressReporter::channel(document.id.clone());
        let analyzer = Arc::clone(self);
        tokio::spawn(async move {
            let _ = analyzer
                .analyze_with_progress(&document, &course, reporter)
                .await;
        });
        stream
    }
}
