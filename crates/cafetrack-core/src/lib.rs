//! Core domain model for CafeTrack.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cafetrack-core";

/// Sentinel stored when no term could be recovered from the text.
/// A missing term is representable data, not an extraction failure.
pub const NO_TERM_DETECTED: &str = "No term detected";

/// One admissions-forum post as received upstream. Transient: it feeds the
/// extractor once and is never persisted.
///
/// The aliases cover the historical key spellings of the upstream JSONL drop
/// (the LLM normalization pass writes hyphenated keys).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "date_added_raw")]
    pub date_added: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "masters_or_phd")]
    pub degree: Option<String>,
    #[serde(
        default,
        alias = "llm-generated-program",
        alias = "llm_generated_program"
    )]
    pub llm_program: Option<String>,
    #[serde(
        default,
        alias = "llm-generated-university",
        alias = "llm_generated_university"
    )]
    pub llm_university: Option<String>,
}

/// Decision status recovered from free text. `Unclassified` is a valid
/// terminal value for posts with no recognizable decision keyword.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Accepted,
    Rejected,
    Waitlisted,
    Interview,
    #[default]
    Unclassified,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Accepted => "Accepted",
            Decision::Rejected => "Rejected",
            Decision::Waitlisted => "Waitlisted",
            Decision::Interview => "Interview",
            Decision::Unclassified => "Unclassified",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label {
            "Accepted" => Decision::Accepted,
            "Rejected" => Decision::Rejected,
            "Waitlisted" => Decision::Waitlisted,
            "Interview" => Decision::Interview,
            _ => Decision::Unclassified,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Nationality {
    American,
    International,
    #[default]
    Unknown,
}

impl Nationality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Nationality::American => "American",
            Nationality::International => "International",
            Nationality::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegreeLevel {
    PhD,
    Masters,
    Bachelors,
    #[default]
    Unknown,
}

impl DegreeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegreeLevel::PhD => "PhD",
            DegreeLevel::Masters => "Masters",
            DegreeLevel::Bachelors => "Bachelors",
            DegreeLevel::Unknown => "Unknown",
        }
    }
}

/// Persisted, structured representation of one post.
///
/// `url`, `program`, and `comments` carry through unchanged: together they
/// form the record's identity and the audit trail back to the source. Every
/// extracted field is independently optional (or carries its own sentinel);
/// failing to recover one never blocks the rest of the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub program: Option<String>,
    pub comments: Option<String>,
    pub date_added: Option<NaiveDate>,
    pub url: Option<String>,
    pub status: Decision,
    pub term: String,
    pub nationality: Nationality,
    pub degree: DegreeLevel,
    pub gpa: Option<f64>,
    pub gre_quant: Option<f64>,
    pub gre_verbal: Option<f64>,
    pub gre_aw: Option<f64>,
    pub llm_program: Option<String>,
    pub llm_university: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_record_accepts_hyphenated_llm_keys() {
        let json = r#"{
            "program": "JHU CS",
            "comments": "Accepted!",
            "url": "https://example.org/result/1",
            "llm-generated-program": "Computer Science",
            "llm-generated-university": "Johns Hopkins University"
        }"#;
        let record: RawRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.llm_program.as_deref(), Some("Computer Science"));
        assert_eq!(
            record.llm_university.as_deref(),
            Some("Johns Hopkins University")
        );
    }

    #[test]
    fn raw_record_accepts_snake_case_llm_keys() {
        let json = r#"{"llm_generated_program": "Math", "masters_or_phd": "PhD"}"#;
        let record: RawRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.llm_program.as_deref(), Some("Math"));
        assert_eq!(record.degree.as_deref(), Some("PhD"));
    }

    #[test]
    fn decision_label_round_trip() {
        for decision in [
            Decision::Accepted,
            Decision::Rejected,
            Decision::Waitlisted,
            Decision::Interview,
            Decision::Unclassified,
        ] {
            assert_eq!(Decision::from_label(decision.as_str()), decision);
        }
        assert_eq!(Decision::from_label("garbage"), Decision::Unclassified);
    }
}
