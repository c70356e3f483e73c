//! Numbered assignment and exam items found in document text.

use std::sync::LazyLock;

use regex::Regex;

const MAX_ITEMS: usize = 5;
const MAX_ITEM_CHARS: usize = 200;
const MIN_ITEM_CHARS: usize = 20;

static ASSIGNMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)(?:assignment|homework|problem set|question|exercise|task)\s*\d+[:\-]?\s*(.+?)(?:\n\n|$)",
    )
    .expect("assignment regex is valid")
});

/// A graded item with a number: "Assignment 2", "Question 3b", "Problem Set 4".
static NUMBERED_ARTIFACT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:assignment|homework|hw|problem\s+set|pset|question|problem|exercise|quiz|lab|project|task|worksheet)s?\s*(?:no\.?\s*|#\s*)?\d+[a-z]?\b",
    )
    .expect("numbered artifact regex is valid")
});

/// Exams are graded by name, so the bare noun is enough.
static EXAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:exams?|midterms?|quiz(?:zes)?|final\s+exams?)\b")
        .expect("exam regex is valid")
});

/// An unnumbered deliverable in a deliverable phrase: "for the project",
/// "on this assignment".
static DELIVERABLE_PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:on|in|for)\s+(?:the|this|each|every|our|your)\s+(?:\w+\s+)?(?:assignment|homework|problem\s+set|project|lab\s+report)s?\b",
    )
    .expect("deliverable phrase regex is valid")
});

/// Up to five assignment items, each trimmed to 200 characters. Items of 20
/// characters or fewer are skipped.
#[must_use]
pub fn extract_assignment_context(text: &str) -> Vec<String> {
    ASSIGNMENT_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().chars().take(MAX_ITEM_CHARS).collect::<String>())
        .map(|s| s.trim().to_owned())
        .filter(|s| s.chars().count() > MIN_ITEM_CHARS)
        .take(MAX_ITEMS)
        .collect()
}

/// Whether `text` names a concrete graded deliverable.
#[must_use]
pub fn names_artifact(text: &str) -> bool {
    NUMBERED_ARTIFACT_RE.is_match(text)
        || EXAM_RE.is_match(text)
        || DELIVERABLE_PHRASE_RE.is_match(text)
}
