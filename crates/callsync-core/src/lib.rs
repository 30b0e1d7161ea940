//! Core domain model for call-log check-in sync.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "callsync-core";

/// Fallback summary when neither the API nor the transcript offers any text.
pub const DEFAULT_CALL_SUMMARY: &str = "Voice call check-in";

/// Maximum characters of transcript copied into a fast-mode summary.
pub const FAST_SUMMARY_MAX_CHARS: usize = 500;

/// One call as reported by the telephony API. Consumed once per resolution cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub external_call_id: String,
    pub caller_phone: String,
    pub occurred_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub raw_transcript: Option<String>,
    pub api_summary: Option<String>,
}

impl CallRecord {
    pub fn transcript(&self) -> &str {
        self.raw_transcript.as_deref().unwrap_or_default()
    }

    pub fn has_transcript(&self) -> bool {
        self.raw_transcript
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} `{}`", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

/// Where a check-in came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInSource {
    VoiceCall,
    ManualText,
    ManualVoice,
}

impl CheckInSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VoiceCall => "voice_call",
            Self::ManualText => "manual_text",
            Self::ManualVoice => "manual_voice",
        }
    }
}

impl FromStr for CheckInSource {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "voice_call" => Ok(Self::VoiceCall),
            "manual_text" => Ok(Self::ManualText),
            "manual_voice" => Ok(Self::ManualVoice),
            other => Err(ParseEnumError {
                kind: "check-in source",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    #[default]
    Fast,
    Rich,
}

impl ExtractionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Rich => "rich",
        }
    }
}

impl FromStr for ExtractionMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "rich" => Ok(Self::Rich),
            _ => Err(ParseEnumError {
                kind: "extraction mode",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Negative,
    #[default]
    Neutral,
}

impl Sentiment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Neutral => "neutral",
        }
    }

    /// Maps free-form model output onto the closed set; anything unrecognised is neutral.
    pub fn from_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "positive" => Self::Positive,
            "negative" => Self::Negative,
            _ => Self::Neutral,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationCandidate {
    pub name: String,
    pub dosage: String,
    pub frequency: String,
    pub status: String,
    pub adherence_rate: f64,
}

impl MedicationCandidate {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dosage: String::new(),
            frequency: String::new(),
            status: "active".to_string(),
            adherence_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodCandidate {
    pub name: String,
    pub calories: i64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
    /// Time of day as the caller described it ("8am", "after lunch").
    pub consumed_at: Option<String>,
    pub meal_type: String,
}

impl FoodCandidate {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calories: 0,
            protein: 0.0,
            carbs: 0.0,
            fat: 0.0,
            consumed_at: None,
            meal_type: "snack".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymptomCandidate {
    pub name: String,
    pub severity: String,
    pub frequency: String,
    pub trend: String,
}

impl SymptomCandidate {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            severity: String::new(),
            frequency: String::new(),
            trend: String::new(),
        }
    }
}

/// Typed output of the extraction step, mapped field-by-field into store rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredResult {
    pub summary: String,
    pub sentiment: Option<Sentiment>,
    pub key_topics: Vec<String>,
    pub medications: Vec<MedicationCandidate>,
    pub foods: Vec<FoodCandidate>,
    pub symptoms: Vec<SymptomCandidate>,
    pub mode: ExtractionMode,
    /// Model identifier when the rich path produced this result.
    pub model: Option<String>,
}

impl StructuredResult {
    pub fn summary_only(summary: impl Into<String>, mode: ExtractionMode) -> Self {
        Self {
            summary: summary.into(),
            sentiment: None,
            key_topics: Vec::new(),
            medications: Vec::new(),
            foods: Vec::new(),
            symptoms: Vec::new(),
            mode,
            model: None,
        }
    }

    pub fn entry_count(&self) -> usize {
        self.medications.len() + self.foods.len() + self.symptoms.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub phone: String,
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallLog {
    pub id: i64,
    pub external_call_id: String,
    pub user_id: Option<i64>,
    pub caller_phone: String,
    pub occurred_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Raw transcript backup, owned 1:1 by a call log and never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTranscript {
    pub id: i64,
    pub call_log_id: i64,
    pub raw_transcript: String,
    pub api_summary: Option<String>,
    pub content_sha256: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckIn {
    pub id: i64,
    pub user_id: Option<i64>,
    pub source: CheckInSource,
    pub call_log_id: Option<i64>,
    pub summary: String,
    pub sentiment: Option<Sentiment>,
    pub key_topics: Vec<String>,
    pub extraction_mode: ExtractionMode,
    pub llm_model: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationEntry {
    pub id: i64,
    pub checkin_id: i64,
    pub user_id: Option<i64>,
    pub name: String,
    pub dosage: String,
    pub frequency: String,
    pub status: String,
    pub adherence_rate: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodEntry {
    pub id: i64,
    pub checkin_id: i64,
    pub user_id: Option<i64>,
    pub name: String,
    pub calories: i64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
    pub consumed_at: Option<String>,
    pub meal_type: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymptomEntry {
    pub id: i64,
    pub checkin_id: i64,
    pub user_id: Option<i64>,
    pub name: String,
    pub severity: String,
    pub frequency: String,
    pub trend: String,
    pub recorded_at: DateTime<Utc>,
}

/// Strips formatting characters so "(555) 123-4567" and "555-123-4567" compare equal.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '(' | ')' | '-' | '.') && !c.is_whitespace())
        .collect()
}

/// Truncates on a char boundary, appending `...` when anything was cut.
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

/// Truncates on a char boundary without any marker.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Summary used when no entity extraction runs: API summary, else transcript head, else a fixed label.
pub fn fast_summary(api_summary: Option<&str>, transcript: Option<&str>) -> String {
    if let Some(summary) = api_summary.map(str::trim).filter(|s| !s.is_empty()) {
        return summary.to_string();
    }
    if let Some(text) = transcript.map(str::trim).filter(|s| !s.is_empty()) {
        return truncate_with_ellipsis(text, FAST_SUMMARY_MAX_CHARS);
    }
    DEFAULT_CALL_SUMMARY.to_string()
}
