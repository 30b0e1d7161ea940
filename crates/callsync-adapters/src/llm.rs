//! OpenAI-compatible chat-completions extractor constrained by a strict JSON schema.

use async_trait::async_trait;
use callsync_core::{
    ExtractionMode, FoodCandidate, MedicationCandidate, Sentiment, StructuredResult,
    SymptomCandidate,
};
use callsync_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::extraction::{ExtractionError, StructuredExtractor};

pub const EXTRACTION_PROMPT: &str = "Extract structured health check-in data from transcript. \
Summarize the call for a clinician, classify overall sentiment as positive, negative or neutral, \
list the health topics discussed, and list every medication, food and symptom the caller mentions. \
Use empty strings or zero for anything the caller did not state. Do not invent entries.";

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct LlmExtractor {
    http: HttpFetcher,
    config: LlmConfig,
}

impl LlmExtractor {
    pub fn new(http: HttpFetcher, config: LlmConfig) -> Self {
        Self { http, config }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    pub fn request_body(&self, transcript: &str) -> JsonValue {
        json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "messages": [
                {"role": "system", "content": EXTRACTION_PROMPT},
                {"role": "user", "content": transcript},
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "checkin_extraction",
                    "strict": true,
                    "schema": extraction_schema(),
                },
            },
        })
    }
}

#[async_trait]
impl StructuredExtractor for LlmExtractor {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn extract(&self, transcript: &str) -> Result<StructuredResult, ExtractionError> {
        let url = self.endpoint();
        let body = self.request_body(transcript);
        let resp = self
            .http
            .post_json("llm_extraction", &url, &body, Some(&self.config.api_key))
            .await
            .map_err(classify_fetch_error)?;
        debug!(bytes = resp.body.len(), model = %self.config.model, "extraction response received");
        parse_completion(&resp.body, &self.config.model)
    }
}

fn classify_fetch_error(err: FetchError) -> ExtractionError {
    match err.status() {
        Some(status) if (400..500).contains(&status) && status != 429 => {
            ExtractionError::Rejected(err.to_string())
        }
        _ => ExtractionError::Upstream(err.to_string()),
    }
}

fn object(properties: JsonValue, required: &[&str]) -> JsonValue {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

fn extraction_schema() -> JsonValue {
    let text = json!({"type": "string"});
    let number = json!({"type": "number"});

    let checkin = object(
        json!({
            "summary": text,
            "sentiment": {"type": "string", "enum": ["positive", "negative", "neutral"]},
            "key_topics": {"type": "array", "items": text},
        }),
        &["summary", "sentiment", "key_topics"],
    );
    let medication = object(
        json!({
            "name": text,
            "dosage": text,
            "frequency": text,
            "status": text,
            "adherence_rate": number,
        }),
        &["name", "dosage", "frequency", "status", "adherence_rate"],
    );
    let food = object(
        json!({
            "name": text,
            "calories": {"type": "integer"},
            "protein": number,
            "carbs": number,
            "fat": number,
            "time": text,
            "meal_type": text,
        }),
        &["name", "calories", "protein", "carbs", "fat", "time", "meal_type"],
    );
    let symptom = object(
        json!({
            "name": text,
            "severity": text,
            "frequency": text,
            "trend": text,
        }),
        &["name", "severity", "frequency", "trend"],
    );

    object(
        json!({
            "checkin": checkin,
            "medications": {"type": "array", "items": medication},
            "food": {"type": "array", "items": food},
            "symptoms": {"type": "array", "items": symptom},
        }),
        &["checkin", "medications", "food", "symptoms"],
    )
}

#[derive(Debug, Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExtractionPayload {
    #[serde(default)]
    checkin: CheckinPayload,
    #[serde(default)]
    medications: Vec<MedicationPayload>,
    #[serde(default, alias = "food_entries")]
    food: Vec<FoodPayload>,
    #[serde(default, alias = "symptom_entries")]
    symptoms: Vec<SymptomPayload>,
}

#[derive(Debug, Default, Deserialize)]
struct CheckinPayload {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    sentiment: String,
    #[serde(default)]
    key_topics: Vec<String>,
}

fn default_status() -> String {
    "active".to_string()
}

fn default_adherence() -> f64 {
    1.0
}

fn default_meal_type() -> String {
    "snack".to_string()
}

#[derive(Debug, Deserialize)]
struct MedicationPayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    dosage: String,
    #[serde(default)]
    frequency: String,
    #[serde(default = "default_status")]
    status: String,
    #[serde(default = "default_adherence")]
    adherence_rate: f64,
}

#[derive(Debug, Deserialize)]
struct FoodPayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    calories: f64,
    #[serde(default)]
    protein: f64,
    #[serde(default)]
    carbs: f64,
    #[serde(default)]
    fat: f64,
    #[serde(default)]
    time: String,
    #[serde(default = "default_meal_type")]
    meal_type: String,
}

#[derive(Debug, Deserialize)]
struct SymptomPayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    frequency: String,
    #[serde(default)]
    trend: String,
}

impl ExtractionPayload {
    fn into_result(self, model: &str) -> StructuredResult {
        StructuredResult {
            summary: self.checkin.summary,
            sentiment: Some(Sentiment::from_lenient(&self.checkin.sentiment)),
            key_topics: self.checkin.key_topics,
            medications: self
                .medications
                .into_iter()
                .map(|m| MedicationCandidate {
                    name: m.name,
                    dosage: m.dosage,
                    frequency: m.frequency,
                    status: m.status,
                    adherence_rate: m.adherence_rate,
                })
                .collect(),
            foods: self
                .food
                .into_iter()
                .map(|f| FoodCandidate {
                    name: f.name,
                    calories: f.calories.round() as i64,
                    protein: f.protein,
                    carbs: f.carbs,
                    fat: f.fat,
                    consumed_at: Some(f.time).filter(|t| !t.trim().is_empty()),
                    meal_type: f.meal_type,
                })
                .collect(),
            symptoms: self
                .symptoms
                .into_iter()
                .map(|s| SymptomCandidate {
                    name: s.name,
                    severity: s.severity,
                    frequency: s.frequency,
                    trend: s.trend,
                })
                .collect(),
            mode: ExtractionMode::Rich,
            model: Some(model.to_string()),
        }
    }
}

/// Decodes a chat-completions response body into a typed result.
pub fn parse_completion(body: &[u8], model: &str) -> Result<StructuredResult, ExtractionError> {
    let completion: Completion = serde_json::from_slice(body)
        .map_err(|e| ExtractionError::Malformed(format!("completion envelope: {e}")))?;
    let message = completion
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| ExtractionError::Malformed("completion has no choices".to_string()))?;

    if let Some(refusal) = message.refusal.filter(|r| !r.trim().is_empty()) {
        return Err(ExtractionError::Rejected(refusal));
    }

    let content = message
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ExtractionError::Malformed("completion content is empty".to_string()))?;
    let payload: ExtractionPayload = serde_json::from_str(&content)
        .map_err(|e| ExtractionError::Malformed(format!("extraction payload: {e}")))?;

    Ok(payload.into_result(model))
}
