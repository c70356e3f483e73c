//! Follow-up help once gaps are known: a focused explanation of one gap and
//! free-form questions answered from the indexed document.

use std::sync::Arc;

use lacuna_llm::{LlmProvider, Message, Role};

use crate::analysis::AnalysisEngine;
use crate::config::TutorConfig;
use crate::error::{AnalysisError, Result};
use crate::gap::Gap;
use crate::retrieval::RetrievalOrchestrator;

const EXPLAIN_SYSTEM: &str = "You are a patient, expert tutor helping a student understand a \
concept they are missing. Be clear and simple, use examples from their course materials when \
possible, relate the concept to their assignment or exam context, build understanding step by \
step and stay encouraging.";

const CHAT_SYSTEM: &str = "You are a helpful tutor. Use the provided document context to answer \
questions accurately. Be clear, encouraging, and relate answers to the student's course \
materials.";

/// Share of the limit a sentence-boundary cut must keep; shorter cuts fall
/// back to a hard cut at the limit.
const MIN_KEPT_RATIO: f64 = 0.8;

/// Answers follow-up questions about an analyzed document.
pub struct Tutor<P> {
    retrieval: Arc<RetrievalOrchestrator>,
    engine: Arc<AnalysisEngine<P>>,
    config: TutorConfig,
}

impl<P> std::fmt::Debug for Tutor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<P: LlmProvider> Tutor<P> {
    #[must_use]
    pub fn new(
        retrieval: Arc<RetrievalOrchestrator>,
        engine: Arc<AnalysisEngine<P>>,
        config: TutorConfig,
    ) -> Self {
        Self {
            retrieval,
            engine,
            config,
        }
    }

    /// Explain one gap using the passages of `document_id` closest to it.
    ///
    /// # Errors
    ///
    /// Returns embedding or index errors from retrieval, and model chain or
    /// safety errors from the call.
    pub async fn explain_gap(&self, document_id: &str, gap: &Gap) -> Result<String> {
        let context = self.context(document_id, std::slice::from_ref(&gap.concept)).await?;
        let mut prompt = format!("The student is struggling with: {}\n\n", gap.concept);
        if gap.is_critical() && !gap.why_needed.trim().is_empty() {
            prompt.push_str(&format!(
                "This is a CRITICAL gap needed for: {}\n\n",
                gap.why_needed.trim()
            ));
        }
        prompt.push_str(&format!(
            "Relevant context from their materials:\n{context}\n\n\
             Explain {} clearly, relating it to their course materials and assignments.",
            gap.concept
        ));

        let reply = self
            .engine
            .complete(&[Message::system(EXPLAIN_SYSTEM), Message::user(prompt)])
            .await
            .map_err(AnalysisError::from_llm)?;
        tracing::debug!(gap_id = %gap.id, model = %reply.model, "gap explained");
        Ok(reply.text)
    }

    /// Answer `question` about `document_id`, continuing `history`.
    ///
    /// Retrieval is driven by the question plus any `focus` concepts. Only
    /// the most recent user and assistant turns are sent; older ones are
    /// summarized as a count.
    ///
    /// # Errors
    ///
    /// Returns `AnalysisError::Ingestion` for a blank question, retrieval
    /// errors, and model chain or safety errors from the call.
    pub async fn chat(
        &self,
        document_id: &str,
        question: &str,
        history: &[Message],
        focus: &[String],
    ) -> Result<String> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AnalysisError::Ingestion("question is empty".into()));
        }
        let mut queries = Vec::with_capacity(focus.len() + 1);
        queries.push(question.to_owned());
        queries.extend(focus.iter().cloned());
        let context = self.context(document_id, &queries).await?;

        let messages = self.chat_messages(question, history, &context);
        let reply = self
            .engine
            .complete(&messages)
            .await
            .map_err(AnalysisError::from_llm)?;
        tracing::debug!(document_id, model = %reply.model, turns = messages.len(), "chat answered");
        Ok(reply.text)
    }

    fn chat_messages(&self, question: &str, history: &[Message], context: &str) -> Vec<Message> {
        let turns: Vec<&Message> = history
            .iter()
            .filter(|m| m.role != Role::System)
            .collect();
        let skip = turns.len().saturating_sub(self.config.history_messages);

        let mut system = CHAT_SYSTEM.to_owned();
        if skip > 0 {
            system.push_str(&format!(
                "\n\nThe conversation had {skip} earlier messages that are not shown."
            ));
        }
        let mut messages = vec![Message::system(system)];
        messages.extend(turns[skip..].iter().map(|m| (*m).clone()));
        messages.push(Message::user(format!(
            "Document Context:\n{context}\n\nQuestion: {question}\n\n\
             Answer using the document context and the conversation so far. Be specific and \
             reference the document when relevant."
        )));
        messages
    }

    async fn context(&self, document_id: &str, concepts: &[String]) -> Result<String> {
        let text = self
            .retrieval
            .context_for_concepts(document_id, concepts)
            .await?;
        Ok(clip_at_sentence(&text, self.config.context_chars))
    }
}

/// Cut `text` to at most `limit` characters, ending on the last full stop or
/// line break when that keeps at least 80% of the limit.
fn clip_at_sentence(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_owned();
    }
    let prefix: String = text.chars().take(limit).collect();
    let boundary = prefix.rfind(['.', '\n']);
    match boundary {
        Some(byte) if prefix[..byte].chars().count() as f64 > limit as f64 * MIN_KEPT_RATIO => {
            prefix[..=byte].trim_end().to_owned()
        }
        _ => prefix,
    }
}
