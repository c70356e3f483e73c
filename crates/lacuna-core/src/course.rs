//! Course metadata supplied with each analysis.

use serde::{Deserialize, Serialize};

macro_rules! labelled_enum {
    ($name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $name {
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
                    $($label => Ok(Self::$variant),)+
                    other => Err(format!(
                        "unknown {} {other:?}, expected one of: {}",
                        stringify!($name),
                        [$($label),+].join(", ")
                    )),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourseType {
    Prerequisite,
    #[default]
    Core,
    Elective,
    Advanced,
}

labelled_enum!(CourseType {
    Prerequisite => "prerequisite",
    Core => "core",
    Elective => "elective",
    Advanced => "advanced",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningGoal {
    #[default]
    PassExam,
    AceAssignment,
    Understand,
    All,
}

labelled_enum!(LearningGoal {
    PassExam => "pass_exam",
    AceAssignment => "ace_assignment",
    Understand => "understand",
    All => "all",
});

impl LearningGoal {
    /// How the goal should steer the analysis.
    #[must_use]
    pub fn guidance(self) -> &'static str {
        match self {
            Self::PassExam => {
                "The student wants to pass the exam: favour topics likely to be examined."
            }
            Self::AceAssignment => {
                "The student wants to complete the assignments: favour what the questions require."
            }
            Self::Understand => {
                "The student wants deep understanding: include foundations the material assumes."
            }
            Self::All => "The student wants exam, assignment and conceptual coverage.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrentLevel {
    Beginner,
    #[default]
    Intermediate,
    Advanced,
}

labelled_enum!(CurrentLevel {
    Beginner => "beginner",
    Intermediate => "intermediate",
    Advanced => "advanced",
});

impl CurrentLevel {
    /// Explanation depth for this level. Never affects categorization.
    #[must_use]
    pub fn guidance(self) -> &'static str {
        match self {
            Self::Beginner => "Explain from first principles and avoid unexplained jargon.",
            Self::Intermediate => "Assume the course prerequisites; explain new terms briefly.",
            Self::Advanced => "Be concise; focus on subtleties and edge cases.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseMetadata {
    #[serde(rename = "courseCode")]
    pub code: String,
    pub institution: String,
    #[serde(rename = "courseName", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub course_type: CourseType,
    #[serde(default)]
    pub learning_goal: LearningGoal,
    #[serde(default)]
    pub current_level: CurrentLevel,
}

impl CourseMetadata {
    #[must_use]
    pub fn new(code: impl Into<String>, institution: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            institution: institution.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Retrieval probe built from code, institution and name when present.
    #[must_use]
    pub fn identity_query(&self) -> String {
        [
            Some(self.code.as_str()),
            Some(self.institution.as_str()),
            self.name.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
    }

    /// Display label such as `MATH 221 (Linear Algebra)`.
    #[must_use]
    pub fn label(&self) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => format!("{} ({name})", self.code),
            _ => self.code.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_parse_and_display() {
        assert_eq!("pass_exam".parse::<LearningGoal>().unwrap(), LearningGoal::PassExam);
        assert_eq!("ace-assignment".parse::<LearningGoal>().unwrap(), LearningGoal::AceAssignment);
        assert_eq!("CORE".parse::<CourseType>().unwrap(), CourseType::Core);
        assert_eq!(CurrentLevel::Advanced.to_string(), "advanced");
        let err = "expert".parse::<CurrentLevel>().unwrap_err();
        assert!(err.contains("beginner, intermediate, advanced"));
    }

    #[test]
    fn identity_query_skips_missing_name() {
        let c = CourseMetadata::new("MATH 221", "UBC");
        assert_eq!(c.identity_query(), "MATH 221 UBC");
        let c = c.with_name("Linear Algebra");
        assert_eq!(c.identity_query(), "MATH 221 UBC Linear Algebra");
        assert_eq!(c.label(), "MATH 221 (Linear Algebra)");
    }

    #[test]
    fn wire_format_uses_camel_case_and_snake_enums() {
        let c = CourseMetadata {
            learning_goal: LearningGoal::AceAssignment,
            ..CourseMetadata::new("CS 240", "Waterloo")
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["courseCode"], "CS 240");
        assert_eq!(json["learningGoal"], "ace_assignment");
        assert_eq!(json["courseType"], "core");
        assert!(json.get("courseName").is_none());

        let back: CourseMetadata =
            serde_json::from_str(r#"{"courseCode":"CS 240","institution":"Waterloo"}"#).unwrap();
        assert_eq!(back.current_level, CurrentLevel::Intermediate);
    }
}
