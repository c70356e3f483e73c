//! Tolerant parsing of model output into gap records.
//!
//! Two shapes are accepted: JSON (an object with a `gaps` array, a bare array,
//! or a single gap object, optionally fenced) and the line-marker format
//! (`CRITICAL GAP: ...` / `Explanation: ...` / `Why Needed: ...`). Bad records
//! are dropped one by one; the rest are kept.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::gap::{Gap, GapCategory};

const MIN_CONCEPT_CHARS: usize = 2;
const MAX_EXPLANATION_CHARS: usize = 500;
pub(crate) const MAX_WHY_NEEDED_CHARS: usize = 300;

const FALLBACK_INDICATORS: &[&str] = &[
    "for best results, try uploading",
    "contact support if this persists",
    "due to content filtering",
    "please review your document manually",
    "a detailed analysis could not be generated",
    "could not be generated automatically",
    "try uploading a different document",
    "please review your document",
    "manually and identify",
    "unable to analyze",
];

static GENERIC_CONCEPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:(?:the\s+)?(?:key\s+)?concepts?\s+mentioned(?:\s+.*)?|topics?\s+that\s+appear(?:\s+.*)?|mathematical\s+or\s+computational\s+(?:methods?|concepts?|techniques?|topics?)|concepts?\s+that\s+need(?:\s+.*)?|knowledge\s+gaps?|unexplained\s+(?:concepts?|topics?|terms?|ideas?)|missing\s+(?:concepts?|topics?|information|knowledge|background|prerequisites?)|something\s+.*\breview\b.*)$",
    )
    .expect("generic concept regex is valid")
});

static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[\s>#*\-\d.)]*\**\s*(critical|safe)\s+gap\s*\**\s*[:\-]?\s*\**\s*(.*)$")
        .expect("gap header regex is valid")
});

static FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^[\s>*\-]*\**\s*(explanation|why\s*needed|estimated\s*time|category)\s*\**\s*:\s*\**\s*(.*)$",
    )
    .expect("gap field regex is valid")
});

/// One concept the student is missing, as requested from the model.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GapRecord {
    /// A specific topic name, never a generic phrase.
    pub concept: String,
    pub category: GapCategory,
    /// What the concept is and how the material uses it.
    pub explanation: String,
    /// The concrete deliverable or reason the student needs it.
    pub why_needed: String,
    #[serde(default)]
    pub estimated_time: Option<String>,
}

/// Response object holding every gap found.
#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
pub struct GapList {
    pub gaps: Vec<GapRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    MissingConcept,
    GenericConcept,
    MissingExplanation,
    /// Record cut off at the end of the response.
    Truncated,
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedRecord {
    /// Position of the record in the response.
    pub position: usize,
    pub reason: DropReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Complete(Vec<GapRecord>),
    Partial {
        gaps: Vec<GapRecord>,
        dropped: Vec<DroppedRecord>,
    },
    Failed {
        reason: String,
    },
}

impl ParseOutcome {
    /// Records that survived parsing, if any.
    #[must_use]
    pub fn into_records(self) -> Vec<GapRecord> {
        match self {
            Self::Complete(gaps) | Self::Partial { gaps, .. } => gaps,
            Self::Failed { .. } => Vec::new(),
        }
    }

    #[must_use]
    pub fn dropped(&self) -> &[DroppedRecord] {
        match self {
            Self::Partial { dropped, .. } => dropped,
            _ => &[],
        }
    }
}

/// Records found in a response, before validation.
#[derive(Debug, Default)]
struct Extracted {
    raws: Vec<(usize, RawRecord)>,
    dropped: Vec<DroppedRecord>,
    /// The response had a recognizable shape, even if it held no records.
    recognized: bool,
}

/// Fields as found in the response, before validation.
#[derive(Debug, Default)]
struct RawRecord {
    concept: Option<String>,
    category: Option<String>,
    explanation: Option<String>,
    why_needed: Option<String>,
    estimated_time: Option<String>,
}

/// Whether the response is an apology or refusal rather than an analysis.
#[must_use]
pub fn is_fallback_message(text: &str) -> bool {
    let lower = text.to_lowercase();
    let hits = FALLBACK_INDICATORS
        .iter()
        .filter(|i| lower.contains(*i))
        .count();
    hits >= 2 || (lower.contains("gap analysis for") && lower.contains("due to content filtering"))
}

/// Whether `concept` is a placeholder phrase instead of a topic.
#[must_use]
pub fn is_generic_concept(concept: &str) -> bool {
    let trimmed = concept.trim();
    trimmed.chars().count() < MIN_CONCEPT_CHARS || GENERIC_CONCEPT_RE.is_match(trimmed)
}

/// Parse a model response.
#[must_use]
pub fn parse_response(text: &str) -> ParseOutcome {
    let body = strip_fences(text);
    let Extracted {
        raws,
        mut dropped,
        recognized,
    } = if looks_like_json(body) {
        parse_json(body)
    } else if let Some(json) = embedded_json(body) {
        parse_json(json)
    } else {
        parse_markers(body)
    };

    if !recognized {
        return ParseOutcome::Failed {
            reason: "no gap records found in response".into(),
        };
    }

    let mut gaps = Vec::with_capacity(raws.len());
    for (position, raw) in raws {
        match validate(raw) {
            Ok(record) => gaps.push(record),
            Err(reason) => {
                tracing::warn!(position, ?reason, "dropping gap record");
                dropped.push(DroppedRecord { position, reason });
            }
        }
    }
    dropped.sort_by_key(|d| d.position);

    if dropped.is_empty() {
        ParseOutcome::Complete(gaps)
    } else {
        ParseOutcome::Partial { gaps, dropped }
    }
}

fn validate(raw: RawRecord) -> Result<GapRecord, DropReason> {
    let concept = raw
        .concept
        .as_deref()
        .map(clean_concept)
        .filter(|c| !c.is_empty())
        .ok_or(DropReason::MissingConcept)?;
    if is_generic_concept(&concept) {
        return Err(DropReason::GenericConcept);
    }
    let explanation = raw
        .explanation
        .map(|e| e.trim().to_owned())
        .filter(|e| !e.is_empty())
        .ok_or(DropReason::MissingExplanation)?;
    let category = match raw.category.as_deref().map(|c| c.trim().to_ascii_lowercase()) {
        Some(c) if c.starts_with("critical") => GapCategory::Critical,
        _ => GapCategory::Safe,
    };
    Ok(GapRecord {
        concept,
        category,
        explanation,
        why_needed: raw.why_needed.map(|w| w.trim().to_owned()).unwrap_or_default(),
        estimated_time: raw
            .estimated_time
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty()),
    })
}

fn clean_concept(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| matches!(c, '*' | '#' | '"' | '\'' | '`' | '_'))
        .trim_end_matches(':')
        .trim()
        .to_owned()
}

pub(crate) fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn looks_like_json(body: &str) -> bool {
    body.starts_with('{') || body.starts_with('[')
}

/// JSON preceded by prose, e.g. a fenced block after an introduction.
fn embedded_json(body: &str) -> Option<&str> {
    if !body.contains("\"concept\"") {
        return None;
    }
    body.find(['{', '[']).map(|i| &body[i..])
}

// JSON

fn parse_json(body: &str) -> Extracted {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let items = match value {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove("gaps") {
                Some(Value::Array(items)) => items,
                _ if obj.contains_key("concept") => vec![Value::Object(obj)],
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        let (raws, dropped) = collect_values(items.into_iter().map(Some));
        return Extracted {
            raws,
            dropped,
            recognized: true,
        };
    }

    // Salvage complete objects from a cut-off or otherwise broken document.
    let (objects, truncated) = scan_objects(body);
    let recognized = truncated || !objects.is_empty();
    let values = objects
        .into_iter()
        .map(|o| serde_json::from_str::<Value>(o).ok());
    let (raws, mut dropped) = collect_values(values);
    if truncated {
        dropped.push(DroppedRecord {
            position: raws.len() + dropped.len(),
            reason: DropReason::Truncated,
        });
    }
    Extracted {
        raws,
        dropped,
        recognized,
    }
}

fn collect_values(
    values: impl Iterator<Item = Option<Value>>,
) -> (Vec<(usize, RawRecord)>, Vec<DroppedRecord>) {
    let mut raws = Vec::new();
    let mut dropped = Vec::new();
    for (position, value) in values.enumerate() {
        match value {
            Some(Value::Object(obj)) => raws.push((position, raw_from_object(&obj))),
            _ => dropped.push(DroppedRecord {
                position,
                reason: DropReason::Malformed,
            }),
        }
    }
    (raws, dropped)
}

fn raw_from_object(obj: &Map<String, Value>) -> RawRecord {
    RawRecord {
        concept: text_field(obj, &["concept", "name", "topic", "title"]),
        category: text_field(obj, &["category", "priority", "type"]),
        explanation: text_field(obj, &["explanation", "description", "details"]),
        why_needed: text_field(obj, &["whyneeded", "why", "justification", "reason"]),
        estimated_time: text_field(obj, &["estimatedtime", "time", "studytime"]),
    }
}

/// Look up the first of `keys` ignoring case, `_`, `-` and spaces.
fn text_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    let normalize = |k: &str| {
        k.chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect::<String>()
    };
    keys.iter().find_map(|want| {
        obj.iter()
            .find(|(k, _)| normalize(k) == *want)
            .and_then(|(_, v)| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    })
}

/// Complete `{...}` objects inside the first array of `body` (the `gaps` array
/// when present), and whether an unterminated object followed them.
fn scan_objects(body: &str) -> (Vec<&str>, bool) {
    let search_from = body.find("\"gaps\"").unwrap_or(0);
    let Some(open) = body[search_from..].find('[').map(|i| i + search_from) else {
        return (Vec::new(), false);
    };

    let mut objects = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in body[open + 1..].char_indices() {
        let at = open + 1 + i;
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => {
                if depth == 0 && ch == '{' {
                    start = Some(at);
                }
                depth += 1;
            }
            '}' | ']' => {
                if depth == 0 {
                    // End of the gaps array.
                    return (objects, false);
                }
                depth -= 1;
                if depth == 0
                    && let Some(s) = start.take()
                {
                    objects.push(&body[s..=at]);
                }
            }
            _ => {}
        }
    }
    (objects, start.is_some())
}

// Line markers

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Concept,
    Category,
    Explanation,
    WhyNeeded,
    EstimatedTime,
}

struct MarkerRecord {
    raw: RawRecord,
    last: Field,
}

impl MarkerRecord {
    fn slot(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::Concept => &mut self.raw.concept,
            Field::Category => &mut self.raw.category,
            Field::Explanation => &mut self.raw.explanation,
            Field::WhyNeeded => &mut self.raw.why_needed,
            Field::EstimatedTime => &mut self.raw.estimated_time,
        }
    }

    /// The final prose field stops without terminal punctuation.
    fn is_cut_off(&self) -> bool {
        let value = match self.last {
            Field::Concept => return self.raw.explanation.is_none(),
            Field::Explanation => self.raw.explanation.as_deref(),
            Field::WhyNeeded => self.raw.why_needed.as_deref(),
            Field::Category | Field::EstimatedTime => return false,
        };
        let tail = value.unwrap_or("").trim_end().trim_end_matches('*').trim_end();
        !tail.ends_with(['.', '!', '?', ')', '"', '\'', ']'])
    }
}

fn field_of(label: &str) -> Field {
    let label = label.to_ascii_lowercase();
    if label.starts_with("why") {
        Field::WhyNeeded
    } else if label.starts_with("estimated") {
        Field::EstimatedTime
    } else if label.starts_with("category") {
        Field::Category
    } else {
        Field::Explanation
    }
}

fn parse_markers(body: &str) -> Extracted {
    let mut records: Vec<MarkerRecord> = Vec::new();
    let mut active: Option<Field> = None;

    for line in body.lines() {
        if let Some(caps) = HEADER_RE.captures(line) {
            records.push(MarkerRecord {
                raw: RawRecord {
                    category: Some(caps[1].to_owned()),
                    concept: Some(caps[2].to_owned()),
                    ..RawRecord::default()
                },
                last: Field::Concept,
            });
            active = Some(Field::Concept);
            continue;
        }
        let Some(current) = records.last_mut() else {
            continue;
        };
        if let Some(caps) = FIELD_RE.captures(line) {
            let field = field_of(&caps[1]);
            *current.slot(field) = Some(caps[2].trim().to_owned());
            current.last = field;
            active = Some(field);
        } else if line.trim().is_empty() {
            active = None;
        } else if let Some(field) = active
            && field != Field::Concept
        {
            let slot = current.slot(field);
            let joined = match slot.take() {
                Some(prev) if !prev.is_empty() => format!("{prev} {}", line.trim()),
                _ => line.trim().to_owned(),
            };
            *slot = Some(joined);
            current.last = field;
        }
    }

    let total = records.len();
    let mut raws = Vec::with_capacity(total);
    let mut dropped = Vec::new();
    for (position, record) in records.into_iter().enumerate() {
        if position + 1 == total && record.is_cut_off() {
            dropped.push(DroppedRecord {
                position,
                reason: DropReason::Truncated,
            });
        } else {
            raws.push((position, record.raw));
        }
    }
    Extracted {
        raws,
        dropped,
        recognized: total > 0,
    }
}

// Post-processing

pub(crate) fn cap(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_owned();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// Turn parsed records into gaps for `document_id`: duplicate concepts
/// (ignoring case) keep their first occurrence, long texts are capped, and
/// ids are numbered from 1.
#[must_use]
pub fn into_gaps(document_id: &str, records: Vec<GapRecord>) -> Vec<Gap> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(r.concept.to_lowercase()))
        .enumerate()
        .map(|(i, r)| Gap {
            id: format!("{document_id}_gap_{}", i + 1),
            concept: r.concept,
            category: r.category,
            explanation: cap(&r.explanation, MAX_EXPLANATION_CHARS),
            why_needed: cap(&r.why_needed, MAX_WHY_NEEDED_CHARS),
            estimated_time: r.estimated_time,
            supporting_context: None,
            page_references: Vec::new(),
            override_justification: None,
        })
        .collect()
}
