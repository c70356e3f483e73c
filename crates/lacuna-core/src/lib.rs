//! Knowledge gap analysis pipeline: configuration, retrieval, model analysis,
//! gap enhancement, category balance, progress reporting and follow-up
//! tutoring on an analyzed document.

pub mod analysis;
pub mod assignment;
pub mod balance;
pub mod bootstrap;
pub mod config;
pub mod course;
pub mod enhancer;
pub mod error;
pub mod gap;
pub mod progress;
pub mod retrieval;
pub mod session;
pub mod tutor;

#[cfg(test)]
pub(crate) mod test_support;

pub use analysis::{AnalysisEngine, EngineOutput};
pub use balance::{BalanceReport, BalanceValidator, LlmReclassifier, NoReclassifier, Reclassifier};
pub use config::Config;
pub use course::{CourseMetadata, CourseType, CurrentLevel, LearningGoal};
pub use enhancer::{EnhanceReport, GapEnhancer};
pub use error::{AnalysisError, Result};
pub use gap::{AnalysisResult, AnalysisStatus, Gap, GapCategory};
pub use progress::{ProgressEvent, ProgressReporter, ProgressStream, Stage, StreamError};
pub use retrieval::{ContextSource, DocumentContext, MergedContext, RetrievalOrchestrator};
pub use session::GapAnalyzer;
pub use tutor::Tutor;
