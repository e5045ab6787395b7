//! Core domain records and field normalization for the peer-review harvester.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "prh-core";

/// Raw content-key count above which a review counts as structured.
pub const STRUCTURED_FIELD_THRESHOLD: usize = 5;
/// Review round recorded on mappings until multi-round venues are harvested.
pub const DEFAULT_REVIEW_ROUND: i64 = 1;
/// Role recorded on paper/review mappings.
pub const DEFAULT_REVIEWER_ROLE: &str = "reviewer";
/// Content keys consulted, in order, when resolving an overall score.
pub const OVERALL_SCORE_KEYS: [&str; 3] =
    ["overall assessment", "recommendation", "overall_evaluation"];

/// Record envelope as served by the review platform.
///
/// Everything except `id` is optional upstream, and venues disagree on which
/// fields they populate, so deserialization is lenient across the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawNote {
    pub id: String,
    #[serde(default)]
    pub forum: Option<String>,
    #[serde(default)]
    pub number: Option<i64>,
    #[serde(default)]
    pub invitation: Option<String>,
    #[serde(default)]
    pub signatures: Vec<String>,
    #[serde(default)]
    pub content: Map<String, Value>,
    #[serde(default)]
    pub cdate: Option<i64>,
    #[serde(default)]
    pub tcdate: Option<i64>,
}

impl RawNote {
    /// Creation stamp in epoch milliseconds. Prefers the true-creation field;
    /// older payloads only carry `cdate`.
    pub fn created_millis(&self) -> Option<i64> {
        self.tcdate.or(self.cdate)
    }

    /// First signature, the closest thing the platform has to a reviewer id.
    pub fn first_signature(&self) -> Option<&str> {
        self.signatures.first().map(String::as_str)
    }
}

/// Canonical persisted paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    pub paper_id: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub authors: String,
    pub venue: String,
    pub year: i64,
    pub submission_text: Option<String>,
    pub acceptance_status: Option<String>,
    pub license: String,
}

/// Canonical persisted review. `paper_id` must reference an existing paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub review_id: String,
    pub paper_id: String,
    pub reviewer_id: Option<String>,
    pub review_text: String,
    pub review_date: NaiveDate,
    pub overall_score: String,
    pub confidence_score: String,
    pub review_structure: ReviewStructure,
}

/// Join record between a paper and one of its reviews.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperReviewMapping {
    pub paper_id: String,
    pub review_id: String,
    pub reviewer_role: String,
    pub review_round: i64,
}

/// Whether a review came in through a structured form or as free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStructure {
    Structured,
    Unstructured,
}

impl ReviewStructure {
    /// Classify by raw content-key count: strictly more keys than the
    /// threshold means the venue used a structured review form.
    pub fn classify(field_count: usize, threshold: usize) -> Self {
        if field_count > threshold {
            Self::Structured
        } else {
            Self::Unstructured
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structured => "structured",
            Self::Unstructured => "unstructured",
        }
    }

    /// Lenient parse for values read back from the store.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "structured" => Self::Structured,
            _ => Self::Unstructured,
        }
    }
}

pub mod normalize {
    //! Typed accessors over raw note content.
    //!
    //! Platform content values arrive as `{"value": ...}` wrapper objects,
    //! bare scalars, or not at all, depending on venue and API generation.
    //! Every accessor here degrades to an empty/default value and never fails.

    use chrono::{DateTime, NaiveDate, Utc};
    use serde_json::{Map, Value};

    /// Unwrap the platform's `{"value": ...}` envelope, passing bare values
    /// through untouched.
    fn unwrap_value(raw: &Value) -> &Value {
        match raw {
            Value::Object(fields) => fields.get("value").unwrap_or(raw),
            _ => raw,
        }
    }

    fn scalar_to_string(value: &Value) -> String {
        match value {
            Value::String(text) => text.clone(),
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            _ => String::new(),
        }
    }

    /// Resolved string for `key`; empty when missing, null, or malformed.
    pub fn string_field(content: &Map<String, Value>, key: &str) -> String {
        content
            .get(key)
            .map(unwrap_value)
            .map(scalar_to_string)
            .unwrap_or_default()
    }

    /// Resolved string for `key`, with `default` standing in for empty.
    pub fn string_field_or(content: &Map<String, Value>, key: &str, default: &str) -> String {
        let resolved = string_field(content, key);
        if resolved.is_empty() {
            default.to_string()
        } else {
            resolved
        }
    }

    /// List field joined with `", "`; empty when missing or not a list.
    pub fn joined_list_field(content: &Map<String, Value>, key: &str) -> String {
        match content.get(key).map(unwrap_value) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| scalar_to_string(unwrap_value(item)))
                .filter(|text| !text.is_empty())
                .collect::<Vec<_>>()
                .join(", "),
            _ => String::new(),
        }
    }

    /// List field joined with `", "`, with `default` standing in for empty.
    pub fn joined_list_field_or(content: &Map<String, Value>, key: &str, default: &str) -> String {
        let resolved = joined_list_field(content, key);
        if resolved.is_empty() {
            default.to_string()
        } else {
            resolved
        }
    }

    /// First non-empty resolution among `keys`, in order.
    pub fn first_match_field(content: &Map<String, Value>, keys: &[&str]) -> String {
        keys.iter()
            .map(|key| string_field(content, key))
            .find(|value| !value.is_empty())
            .unwrap_or_default()
    }

    /// Presence check for an attachment-style key: the key must exist and
    /// resolve to a non-empty scalar.
    pub fn has_field(content: &Map<String, Value>, key: &str) -> bool {
        !string_field(content, key).is_empty()
    }

    /// Epoch-millisecond stamp to calendar date; absent or out-of-range
    /// stamps fall back to the current date at ingestion time.
    pub fn date_from_millis(millis: Option<i64>) -> NaiveDate {
        millis
            .and_then(DateTime::from_timestamp_millis)
            .map(|stamp| stamp.date_naive())
            .unwrap_or_else(|| Utc::now().date_naive())
    }
}
