//! Transcript → `StructuredResult`, in a deterministic fast mode or through a pluggable extractor.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callsync_core::{fast_summary, truncate_chars, ExtractionMode, StructuredResult};
use thiserror::Error;
use tracing::debug;

/// Shorter content is not worth sending to an extractor.
pub const MIN_EXTRACTABLE_CHARS: usize = 10;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),
    #[error("extraction output was malformed: {0}")]
    Malformed(String),
    #[error("extraction was rejected upstream: {0}")]
    Rejected(String),
    #[error("extraction backend unreachable: {0}")]
    Upstream(String),
}

/// Fallible "text in, typed record out" capability. Implementations need not be idempotent.
#[async_trait]
pub trait StructuredExtractor: Send + Sync {
    fn model(&self) -> &str;

    async fn extract(&self, transcript: &str) -> Result<StructuredResult, ExtractionError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractionConfig {
    pub timeout: Duration,
    pub max_transcript_chars: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_transcript_chars: 4000,
        }
    }
}

#[derive(Clone)]
pub struct ExtractionEngine {
    config: ExtractionConfig,
    extractor: Option<Arc<dyn StructuredExtractor>>,
}

impl std::fmt::Debug for ExtractionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionEngine")
            .field("mode", &self.mode())
            .field("config", &self.config)
            .finish()
    }
}

impl ExtractionEngine {
    pub fn fast() -> Self {
        Self {
            config: ExtractionConfig::default(),
            extractor: None,
        }
    }

    pub fn rich(extractor: Arc<dyn StructuredExtractor>, config: ExtractionConfig) -> Self {
        Self {
            config,
            extractor: Some(extractor),
        }
    }

    pub fn mode(&self) -> ExtractionMode {
        if self.extractor.is_some() {
            ExtractionMode::Rich
        } else {
            ExtractionMode::Fast
        }
    }

    pub async fn extract(
        &self,
        transcript: &str,
        api_summary: Option<&str>,
    ) -> Result<StructuredResult, ExtractionError> {
        let fallback = fast_summary(api_summary, Some(transcript));
        let Some(extractor) = &self.extractor else {
            return Ok(StructuredResult::summary_only(fallback, ExtractionMode::Fast));
        };

        let content = transcript.trim();
        if content.chars().count() < MIN_EXTRACTABLE_CHARS {
            debug!(chars = content.chars().count(), "transcript too short for entity extraction");
            return Ok(StructuredResult::summary_only(fallback, ExtractionMode::Fast));
        }

        let input = truncate_chars(content, self.config.max_transcript_chars);
        let raw = tokio::time::timeout(self.config.timeout, extractor.extract(input))
            .await
            .map_err(|_| ExtractionError::Timeout(self.config.timeout))??;

        Ok(normalize(raw, fallback, extractor.model()))
    }
}

/// Cleans extractor output: nameless entries dropped, numeric fields kept in range.
fn normalize(mut result: StructuredResult, fallback_summary: String, model: &str) -> StructuredResult {
    result.summary = result.summary.trim().to_string();
    if result.summary.is_empty() {
        result.summary = fallback_summary;
    }

    let mut seen = HashSet::new();
    result.key_topics = result
        .key_topics
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty() && seen.insert(t.to_ascii_lowercase()))
        .collect();

    result.medications.retain_mut(|med| {
        med.name = med.name.trim().to_string();
        // a percentage slipped through instead of a ratio
        if med.adherence_rate > 1.0 && med.adherence_rate <= 100.0 {
            med.adherence_rate /= 100.0;
        }
        med.adherence_rate = if med.adherence_rate.is_finite() {
            med.adherence_rate.clamp(0.0, 1.0)
        } else {
            1.0
        };
        if med.status.trim().is_empty() {
            med.status = "active".to_string();
        }
        !med.name.is_empty()
    });

    result.foods.retain_mut(|food| {
        food.name = food.name.trim().to_string();
        food.calories = food.calories.max(0);
        for macro_grams in [&mut food.protein, &mut food.carbs, &mut food.fat] {
            if !macro_grams.is_finite() || *macro_grams < 0.0 {
                *macro_grams = 0.0;
            }
        }
        if food.meal_type.trim().is_empty() {
            food.meal_type = "snack".to_string();
        }
        !food.name.is_empty()
    });

    result.symptoms.retain_mut(|symptom| {
        symptom.name = symptom.name.trim().to_string();
        !symptom.name.is_empty()
    });

    result.mode = ExtractionMode::Rich;
    result.model = Some(model.to_string());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use callsync_core::{FoodCandidate, MedicationCandidate, Sentiment, SymptomCandidate};
    use std::sync::Mutex;

    struct StubExtractor {
        result: StructuredResult,
        delay: Duration,
        seen: Mutex<Vec<String>>,
    }

    impl StubExtractor {
        fn returning(result: StructuredResult) -> Self {
            Self {
                result,
                delay: Duration::ZERO,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StructuredExtractor for StubExtractor {
        fn model(&self) -> &str {
            "stub-model"
        }

        async fn extract(&self, transcript: &str) -> Result<StructuredResult, ExtractionError> {
            self.seen.lock().unwrap().push(transcript.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.result.clone())
        }
    }

    fn metformin_result() -> StructuredResult {
        let mut result = StructuredResult::summary_only("Took metformin", ExtractionMode::Rich);
        result.sentiment = Some(Sentiment::Positive);
        result.medications = vec![MedicationCandidate {
            dosage: "500mg".into(),
            ..MedicationCandidate::named("metformin")
        }];
        result
    }

    #[tokio::test]
    async fn fast_mode_never_extracts_entities() {
        let engine = ExtractionEngine::fast();
        let result = engine
            .extract("Took 500mg metformin this morning", None)
            .await
            .unwrap();

        assert_eq!(engine.mode(), ExtractionMode::Fast);
        assert_eq!(result.mode, ExtractionMode::Fast);
        assert_eq!(result.summary, "Took 500mg metformin this morning");
        assert_eq!(result.entry_count(), 0);
        assert_eq!(result.sentiment, None);

        let with_api = engine
            .extract("Took 500mg metformin", Some("Medication adherence call"))
            .await
            .unwrap();
        assert_eq!(with_api.summary, "Medication adherence call");
    }

    #[tokio::test]
    async fn rich_mode_uses_extractor_and_stamps_model() {
        let stub = Arc::new(StubExtractor::returning(metformin_result()));
        let engine = ExtractionEngine::rich(stub.clone(), ExtractionConfig::default());

        let result = engine
            .extract("Took 500mg metformin this morning", None)
            .await
            .unwrap();

        assert_eq!(result.mode, ExtractionMode::Rich);
        assert_eq!(result.model.as_deref(), Some("stub-model"));
        assert_eq!(result.medications.len(), 1);
        assert_eq!(result.medications[0].dosage, "500mg");
        assert_eq!(stub.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn short_content_skips_the_extractor() {
        let stub = Arc::new(StubExtractor::returning(metformin_result()));
        let engine = ExtractionEngine::rich(stub.clone(), ExtractionConfig::default());

        let result = engine.extract("  ok  ", Some("Brief call")).await.unwrap();
        assert_eq!(result.summary, "Brief call");
        assert_eq!(result.entry_count(), 0);
        assert!(stub.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn long_transcripts_are_truncated_before_extraction() {
        let stub = Arc::new(StubExtractor::returning(metformin_result()));
        let config = ExtractionConfig {
            max_transcript_chars: 32,
            ..ExtractionConfig::default()
        };
        let engine = ExtractionEngine::rich(stub.clone(), config);

        engine.extract(&"word ".repeat(100), None).await.unwrap();
        let seen = stub.seen.lock().unwrap();
        assert_eq!(seen[0].chars().count(), 32);
    }

    #[tokio::test]
    async fn slow_extractor_times_out() {
        let stub = Arc::new(StubExtractor {
            delay: Duration::from_secs(5),
            ..StubExtractor::returning(metformin_result())
        });
        let config = ExtractionConfig {
            timeout: Duration::from_millis(20),
            ..ExtractionConfig::default()
        };
        let engine = ExtractionEngine::rich(stub, config);

        let err = engine
            .extract("Took 500mg metformin this morning", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Timeout(_)));
    }

    #[tokio::test]
    async fn normalization_drops_nameless_entries_and_clamps_values() {
        let mut raw = StructuredResult::summary_only("   ", ExtractionMode::Rich);
        raw.key_topics = vec!["Sleep".into(), " sleep ".into(), "".into(), "diet".into()];
        raw.medications = vec![
            MedicationCandidate {
                adherence_rate: 90.0,
                status: "".into(),
                ..MedicationCandidate::named(" lisinopril ")
            },
            MedicationCandidate::named("  "),
        ];
        raw.foods = vec![
            FoodCandidate {
                calories: -20,
                fat: -1.0,
                meal_type: "".into(),
                ..FoodCandidate::named("toast")
            },
            FoodCandidate::named(""),
        ];
        raw.symptoms = vec![SymptomCandidate::named(""), SymptomCandidate::named("headache")];

        let engine = ExtractionEngine::rich(
            Arc::new(StubExtractor::returning(raw)),
            ExtractionConfig::default(),
        );
        let result = engine
            .extract("I slept badly and had toast", Some("Sleep check"))
            .await
            .unwrap();

        assert_eq!(result.summary, "Sleep check");
        assert_eq!(result.key_topics, vec!["Sleep".to_string(), "diet".to_string()]);
        assert_eq!(result.medications.len(), 1);
        assert_eq!(result.medications[0].name, "lisinopril");
        assert!((result.medications[0].adherence_rate - 0.9).abs() < 1e-9);
        assert_eq!(result.medications[0].status, "active");
        assert_eq!(result.foods.len(), 1);
        assert_eq!(result.foods[0].calories, 0);
        assert_eq!(result.foods[0].fat, 0.0);
        assert_eq!(result.foods[0].meal_type, "snack");
        assert_eq!(result.symptoms.len(), 1);
    }
}
