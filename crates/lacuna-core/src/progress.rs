//! Ordered per-session progress events.
//!
//! A [`ProgressReporter`] is the sending half owned by the pipeline; the
//! [`ProgressStream`] is handed to the caller. Every stream ends with exactly
//! one `completed` or `error` event: if the reporter is dropped without either,
//! it emits an `error` event itself.

use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::AnalysisError;
use crate::gap::AnalysisResult;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Uploaded,
    Extracted,
    EmbeddingsGenerating,
    EmbeddingsGenerated,
    VectorDbStoring,
    VectorDbStored,
    RagRetrieving,
    RagRetrieved,
    LlmAnalyzing,
    LlmAnalyzed,
    GapsParsing,
    GapsParsed,
    GapsEnhancing,
    GapsEnhanced,
    Completed,
    Error,
}

impl Stage {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Extracted => "extracted",
            Self::EmbeddingsGenerating => "embeddings_generating",
            Self::EmbeddingsGenerated => "embeddings_generated",
            Self::VectorDbStoring => "vector_db_storing",
            Self::VectorDbStored => "vector_db_stored",
            Self::RagRetrieving => "rag_retrieving",
            Self::RagRetrieved => "rag_retrieved",
            Self::LlmAnalyzing => "llm_analyzing",
            Self::LlmAnalyzed => "llm_analyzed",
            Self::GapsParsing => "gaps_parsing",
            Self::GapsParsed => "gaps_parsed",
            Self::GapsEnhancing => "gaps_enhancing",
            Self::GapsEnhanced => "gaps_enhanced",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ProgressEvent {
    fn new(stage: Stage, message: impl Into<String>, payload: Option<serde_json::Value>) -> Self {
        Self {
            stage,
            message: message.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Sending half. Stages must be reported in pipeline order.
#[derive(Debug)]
pub struct ProgressReporter {
    session: String,
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
    last: Option<Stage>,
    finished: bool,
}

impl ProgressReporter {
    #[must_use]
    pub fn channel(session: impl Into<String>) -> (Self, ProgressStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = Self {
            session: session.into(),
            tx: Some(tx),
            last: None,
            finished: false,
        };
        (reporter, ProgressStream::new(rx))
    }

    /// Reporter that only logs.
    #[must_use]
    pub fn silent(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            tx: None,
            last: None,
            finished: false,
        }
    }

    #[must_use]
    pub fn last_stage(&self) -> Option<Stage> {
        self.last
    }

    /// Resolves once the caller has dropped the stream. Never resolves for a
    /// silent reporter.
    pub fn receiver_gone(&self) -> impl Future<Output = ()> + Send + 'static {
        let tx = self.tx.clone();
        async move {
            match tx {
                Some(tx) => tx.closed().await,
                None => std::future::pending().await,
            }
        }
    }

    pub fn stage(&mut self, stage: Stage, message: impl Into<String>) {
        self.stage_with(stage, message, None);
    }

    /// Report a non-terminal stage. Out-of-order or terminal stages are
    /// ignored with a warning.
    pub fn stage_with(
        &mut self,
        stage: Stage,
        message: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) {
        if self.finished || stage.is_terminal() {
            tracing::warn!(session = %self.session, %stage, "ignoring stage after or as terminal");
            return;
        }
        if self.last.is_some_and(|last| stage <= last) {
            tracing::warn!(session = %self.session, %stage, last = ?self.last, "ignoring out-of-order stage");
            return;
        }
        self.last = Some(stage);
        self.send(ProgressEvent::new(stage, message, payload));
    }

    /// Terminal success event carrying the full result.
    pub fn complete(mut self, result: &AnalysisResult) {
        let payload = serde_json::to_value(result).ok();
        let message = format!(
            "analysis complete: {} gaps ({} critical, {} safe)",
            result.total_gaps, result.critical_gaps, result.safe_gaps
        );
        self.finish(ProgressEvent::new(Stage::Completed, message, payload));
    }

    /// Terminal failure event.
    pub fn fail(mut self, error: &AnalysisError) {
        let payload = serde_json::json!({ "kind": error.kind(), "message": error.to_string() });
        self.finish(ProgressEvent::new(Stage::Error, error.to_string(), Some(payload)));
    }

    fn finish(&mut self, event: ProgressEvent) {
        self.finished = true;
        self.last = Some(event.stage);
        self.send(event);
        self.tx = None;
    }

    fn send(&self, event: ProgressEvent) {
        tracing::info!(session = %self.session, stage = %event.stage, "{}", event.message);
        if let Some(tx) = &self.tx
            && tx.send(event).is_err()
        {
            tracing::debug!(session = %self.session, "progress receiver dropped");
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if !self.finished {
            let event = ProgressEvent::new(
                Stage::Error,
                "analysis ended without a result",
                Some(serde_json::json!({ "kind": "aborted" })),
            );
            self.finish(event);
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("analysis failed: {0}")]
    Failed(String),
    #[error("progress stream ended without a terminal event")]
    Truncated,
    #[error("completed event carried no readable result: {0}")]
    BadPayload(String),
}

/// Receiving half, consumable as a [`Stream`] of events.
#[derive(Debug)]
pub struct ProgressStream {
    inner: UnboundedReceiverStream<ProgressEvent>,
}

impl ProgressStream {
    fn new(rx: mpsc::UnboundedReceiver<ProgressEvent>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    /// Drain the stream, passing each event to `on_event`, and return the
    /// result carried by the `completed` event.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Failed` on an `error` event and
    /// `StreamError::Truncated` when the stream ends with neither.
    pub async fn into_result(
        mut self,
        mut on_event: impl FnMut(&ProgressEvent),
    ) -> Result<AnalysisResult, StreamError> {
        use tokio_stream::StreamExt as _;

        while let Some(event) = self.next().await {
            on_event(&event);
            match event.stage {
                Stage::Completed => {
                    let payload = event.payload.unwrap_or_default();
                    return serde_json::from_value(payload)
                        .map_err(|e| StreamError::BadPayload(e.to_string()));
                }
                Stage::Error => return Err(StreamError::Failed(event.message)),
                _ => {}
            }
        }
        Err(StreamError::Truncated)
    }
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
