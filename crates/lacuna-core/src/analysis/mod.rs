//! Prompting, model calls and response parsing for gap identification.

pub mod engine;
pub mod parser;
pub mod prompt;

pub use engine::{AnalysisEngine, EngineOutput};
pub use parser::{
    DropReason, DroppedRecord, GapList, GapRecord, ParseOutcome, into_gaps, is_fallback_message,
    is_generic_concept, parse_response,
};
pub use prompt::PromptInput;
