mod env;
mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use std::path::Path;

use anyhow::Context;

use crate::error::AnalysisError;

/// Upper bound on configurable filtered-query retries.
const MAX_INDEX_RETRIES: u32 = 10;

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or if
    /// the resulting configuration fails [`Config::validate`].
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot honor.
    ///
    /// # Errors
    ///
    /// Returns `AnalysisError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<(), AnalysisError> {
        let fail = |msg: String| Err(AnalysisError::Config(msg));

        if self.llm.models.iter().all(|m| m.trim().is_empty()) {
            return fail("llm.models must name at least one model".into());
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return fail(format!(
                "llm.temperature must be within 0.0..=2.0, got {}",
                self.llm.temperature
            ));
        }
        if self.llm.max_tokens == 0 {
            return fail("llm.max_tokens must be positive".into());
        }
        if self.embedding.device.parse::<lacuna_llm::ComputeDevice>().is_err() {
            return fail(format!(
                "embedding.device must be cpu, cuda[:N] or metal[:N], got {:?}",
                self.embedding.device
            ));
        }
        if self.index.collection.trim().is_empty() {
            return fail("index.collection must not be empty".into());
        }
        if self.index.max_retries > MAX_INDEX_RETRIES {
            return fail(format!(
                "index.max_retries must be at most {MAX_INDEX_RETRIES}, got {}",
                self.index.max_retries
            ));
        }
        let chunking = &self.chunking;
        if chunking.chunk_size == 0 || chunking.chunk_overlap >= chunking.chunk_size {
            return fail(format!(
                "chunking.chunk_overlap ({}) must be smaller than a positive chunk_size ({})",
                chunking.chunk_overlap, chunking.chunk_size
            ));
        }
        if chunking.chunk_overlap == 0 {
            return fail("chunking.chunk_overlap must be positive".into());
        }
        if chunking.min_chunk_size > chunking.max_chunk_size {
            return fail("chunking.min_chunk_size exceeds max_chunk_size".into());
        }
        let retrieval = &self.retrieval;
        if retrieval.document_results == 0 || retrieval.gap_results == 0 {
            return fail("retrieval result counts must be positive".into());
        }
        if retrieval.gate_floor > retrieval.gate_ceiling {
            return fail("retrieval.gate_floor exceeds gate_ceiling".into());
        }
        if !(0.0..=1.0).contains(&retrieval.gate_ratio) {
            return fail("retrieval.gate_ratio must be within 0.0..=1.0".into());
        }
        let balance = &self.balance;
        if !(0.0..=1.0).contains(&balance.min_critical_share)
            || !(0.0..=1.0).contains(&balance.max_critical_share)
            || balance.min_critical_share > balance.max_critical_share
        {
            return fail(format!(
                "balance band [{}, {}] must be an ordered range within 0.0..=1.0",
                balance.min_critical_share, balance.max_critical_share
            ));
        }
        if self.tutor.context_chars == 0 {
            return fail("tutor.context_chars must be positive".into());
        }
        Ok(())
    }
}
