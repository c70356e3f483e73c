//! Prompt construction for gap analysis.

use std::fmt::Write;

use lacuna_llm::Message;

use super::parser::GapList;
use crate::config::AnalysisConfig;
use crate::course::CourseMetadata;
use crate::retrieval::ContextSource;

const SYSTEM_PROMPT: &str = "You are an academic advisor. You read course material and identify \
knowledge gaps: specific concepts the material uses or requires but does not explain well enough \
for the student to succeed.";

const SANITIZED_SYSTEM_PROMPT: &str =
    "You help students plan their studies by listing the topics covered in course material.";

const MARKER_FORMAT: &str = "CRITICAL GAP: <specific concept>\n\
Explanation: <what it is and how the material uses it>\n\
Why Needed: <the assignment question or exam topic that requires it>\n\
Estimated Time: <study time>\n\n\
SAFE GAP: <specific concept>\n\
Explanation: <...>\n\
Why Needed: <...>\n\
Estimated Time: <...>";

/// Everything the analysis prompt is built from.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    pub text: &'a str,
    pub source: ContextSource,
    pub course: &'a CourseMetadata,
    pub assignments: &'a [String],
}

/// Collapse whitespace runs to single spaces and cap at `max_chars`.
#[must_use]
pub fn sanitize(text: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(text.len().min(max_chars * 4));
    let mut count = 0usize;
    for word in text.split_whitespace() {
        let sep = usize::from(!out.is_empty());
        let len = word.chars().count();
        if count + sep + len > max_chars {
            let room = max_chars.saturating_sub(count + sep);
            if room > 0 {
                if sep == 1 {
                    out.push(' ');
                }
                out.extend(word.chars().take(room));
            }
            break;
        }
        if sep == 1 {
            out.push(' ');
        }
        out.push_str(word);
        count += sep + len;
    }
    out
}

/// JSON schema of the expected response.
#[must_use]
pub fn gap_schema() -> String {
    let schema = schemars::schema_for!(GapList);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

fn assignment_block(assignments: &[String], max_chars: usize) -> String {
    if assignments.is_empty() {
        return String::new();
    }
    let joined = assignments
        .iter()
        .map(|a| format!("- {a}"))
        .collect::<Vec<_>>()
        .join("\n");
    let capped: String = joined.chars().take(max_chars).collect();
    format!("Assignment items found in the material:\n{capped}\n\n")
}

fn course_block(course: &CourseMetadata) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Course: {} at {}", course.label(), course.institution);
    let _ = writeln!(out, "Course type: {}", course.course_type);
    let _ = writeln!(out, "Learning goal: {}", course.learning_goal.guidance());
    let _ = writeln!(out, "Student level: {}", course.current_level.guidance());
    out
}

/// Full analysis prompt.
#[must_use]
pub fn analysis_messages(input: &PromptInput<'_>, config: &AnalysisConfig) -> Vec<Message> {
    let source = match input.source {
        ContextSource::Retrieved => "excerpts retrieved from the document",
        ContextSource::FullText => "the document text",
    };
    let mut user = course_block(input.course);
    user.push_str(
        "\nIdentify EVERY specific concept this student needs to learn to work with the material. \
Do not stop at a fixed number of gaps: list all of them.\n\n\
Categories:\n\
- critical: required by a concrete deliverable named in the material, such as an assignment \
question or a stated exam topic. whyNeeded must name that deliverable.\n\
- safe: supplementary understanding. When unsure, use safe.\n\
Usually between 30% and 50% of the gaps are critical.\n\n\
Concept names must be specific topics such as \"Power Method for Eigenvalues\", never generic \
phrases such as \"concepts mentioned in the document\".\n\n",
    );
    user.push_str(&assignment_block(input.assignments, config.assignment_chars));
    let _ = write!(
        user,
        "Material ({source}):\n\"\"\"\n{}\n\"\"\"\n\n",
        sanitize(input.text, config.document_chars)
    );
    let _ = write!(
        user,
        "Respond with JSON matching this schema:\n{}\n\n\
If you cannot produce JSON, use this format for each gap:\n{MARKER_FORMAT}",
        gap_schema()
    );
    vec![Message::system(SYSTEM_PROMPT), Message::user(user)]
}

/// Neutral rephrasing used once after a safety-filter block.
#[must_use]
pub fn sanitized_messages(input: &PromptInput<'_>, config: &AnalysisConfig) -> Vec<Message> {
    let mut user = format!(
        "The following is educational material from the course {}. List the specific topics a \
student should study to understand it. Mark a topic critical only when an assignment or exam item \
in the material requires it, otherwise mark it safe.\n\n",
        input.course.label()
    );
    let _ = write!(
        user,
        "Material:\n\"\"\"\n{}\n\"\"\"\n\n\
Respond with JSON matching this schema:\n{}\n\n\
Or use this format for each topic:\n{MARKER_FORMAT}",
        sanitize(input.text, config.sanitized_chars),
        gap_schema()
    );
    vec![Message::system(SANITIZED_SYSTEM_PROMPT), Message::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::course::LearningGoal;

    fn input<'a>(text: &'a str, course: &'a CourseMetadata, assignments: &'a [String]) -> PromptInput<'a> {
        PromptInput {
            text,
            source: ContextSource::Retrieved,
            course,
            assignments,
        }
    }

    #[test]
    fn sanitize_collapses_and_caps() {
        assert_eq!(sanitize("a  b\n\n\tc", 100), "a b c");
        assert_eq!(sanitize("alpha beta gamma", 8), "alpha be");
        assert_eq!(sanitize("   ", 10), "");
        assert_eq!(sanitize(&"word ".repeat(5000), 6000).chars().count(), 6000 - 1);
    }

    #[test]
    fn schema_names_wire_fields() {
        let schema = gap_schema();
        assert!(schema.contains("whyNeeded"));
        assert!(schema.contains("estimatedTime"));
        assert!(schema.contains("critical"));
    }

    #[test]
    fn analysis_prompt_carries_course_and_assignments() {
        let course = CourseMetadata {
            learning_goal: LearningGoal::AceAssignment,
            ..CourseMetadata::new("MATH 221", "UBC").with_name("Matrix Algebra")
        };
        let assignments = vec!["Compute the eigenvalues of the 3x3 matrix A.".to_owned()];
        let messages = analysis_messages(
            &input("Eigenvalues   are\n\nroots.", &course, &assignments),
            &AnalysisConfig::default(),
        );
        assert_eq!(messages.len(), 2);
        let user = &messages[1].content;
        assert!(user.contains("MATH 221 (Matrix Algebra) at UBC"));
        assert!(user.contains(LearningGoal::AceAssignment.guidance()));
        assert!(user.contains("- Compute the eigenvalues"));
        assert!(user.contains("Eigenvalues are roots."));
        assert!(user.contains("EVERY"));
        assert!(user.contains("CRITICAL GAP:"));
    }

    #[test]
    fn sanitized_prompt_is_shorter_and_neutral() {
        let course = CourseMetadata::new("CS 101", "MIT");
        let text = "x ".repeat(10_000);
        let config = AnalysisConfig::default();
        let full = analysis_messages(&input(&text, &course, &[]), &config);
        let safe = sanitized_messages(&input(&text, &course, &[]), &config);
        assert!(safe[1].content.len() < full[1].content.len());
        assert!(!safe[1].content.contains("knowledge gap"));
        assert!(!full[1].content.contains("Assignment items"));
    }
}
