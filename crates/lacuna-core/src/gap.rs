//! Gap records and the analysis result as exchanged with callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum GapCategory {
    /// Tied to a concrete required deliverable.
    Critical,
    /// Supplementary understanding.
    Safe,
}

impl GapCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Safe => "safe",
        }
    }
}

impl std::fmt::Display for GapCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gap {
    pub id: String,
    pub concept: String,
    pub category: GapCategory,
    pub explanation: String,
    pub why_needed: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time: Option<String>,
    /// Document excerpt retrieved for this concept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supporting_context: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub page_references: Vec<u32>,
    /// Set when the category distribution is kept outside the expected band.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_justification: Option<String>,
}

impl Gap {
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.category == GapCategory::Critical
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Completed,
    NoGapsFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub document_id: String,
    pub gaps: Vec<Gap>,
    pub total_gaps: usize,
    pub critical_gaps: usize,
    pub safe_gaps: usize,
    pub status: AnalysisStatus,
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisResult {
    #[must_use]
    pub fn new(document_id: impl Into<String>, gaps: Vec<Gap>) -> Self {
        let critical_gaps = gaps.iter().filter(|g| g.is_critical()).count();
        let status = if gaps.is_empty() {
            AnalysisStatus::NoGapsFound
        } else {
            AnalysisStatus::Completed
        };
        Self {
            document_id: document_id.into(),
            total_gaps: gaps.len(),
            critical_gaps,
            safe_gaps: gaps.len() - critical_gaps,
            gaps,
            status,
            analyzed_at: Utc::now(),
        }
    }
}
