//! One sync iteration: fetch, resolve, extract and commit each call.

use std::sync::Arc;

use anyhow::{Context, Result};
use callsync_adapters::{
    fetch_records, CallFilter, CallSource, ExtractionConfig, ExtractionEngine, HttpCallSource,
    LlmConfig, LlmExtractor,
};
use callsync_core::{CallRecord, CheckIn, CheckInSource, ExtractionMode};
use callsync_storage::{
    HttpClientConfig, HttpFetcher, Store, SyncOutcome, SyncRunRecord, SyncRunStatus, SyncTrigger,
};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::coordinator::SyncCoordinator;
use crate::resolver::resolve_change_set;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub filter: CallFilter,
    pub fetch_limit: usize,
    pub page_size: u32,
    pub record_concurrency: usize,
    pub force_reprocess: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            filter: CallFilter {
                require_transcript: true,
                ..CallFilter::default()
            },
            fetch_limit: 50,
            page_size: 50,
            record_concurrency: 1,
            force_reprocess: false,
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            filter: CallFilter {
                caller_phone: config.caller_phone.clone(),
                require_transcript: config.require_transcript,
                occurred_after: None,
                occurred_before: None,
            },
            fetch_limit: config.fetch_limit,
            page_size: config.page_size,
            record_concurrency: config.record_concurrency.max(1),
            force_reprocess: config.force_reprocess,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IterationReport {
    pub run_id: Uuid,
    pub fetched: usize,
    pub resolved: usize,
    pub processed: usize,
    pub already_processed: usize,
    pub failed: usize,
    /// Resolved records left untouched because a stop was requested.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Processed,
    AlreadyProcessed,
    Failed,
    Skipped,
}

/// One fetch → resolve → extract → sync pass over the call-log source.
pub struct SyncPipeline {
    source: Arc<dyn CallSource>,
    engine: ExtractionEngine,
    coordinator: SyncCoordinator,
    options: PipelineOptions,
}

impl SyncPipeline {
    pub fn new(
        store: Store,
        source: Arc<dyn CallSource>,
        engine: ExtractionEngine,
        options: PipelineOptions,
    ) -> Self {
        let coordinator = SyncCoordinator::new(store, options.force_reprocess);
        Self {
            source,
            engine,
            coordinator,
            options,
        }
    }

    /// Wires the HTTP source and the configured extraction mode. Validates the config first.
    pub fn from_config(config: &SyncConfig, store: Store) -> Result<Self> {
        config.validate()?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            ..Default::default()
        })?;

        let base = config
            .call_logs_api_base
            .clone()
            .context("call-log API base missing after validation")?;
        let token = config
            .call_api_token
            .clone()
            .context("call-log API token missing after validation")?;
        let source = HttpCallSource::new(http.clone(), base, token);

        let engine = engine_from_config(config, http)?;

        Ok(Self::new(
            store,
            Arc::new(source),
            engine,
            PipelineOptions::from_config(config),
        ))
    }

    pub fn store(&self) -> &Store {
        self.coordinator.store()
    }

    pub fn extraction_mode(&self) -> ExtractionMode {
        self.engine.mode()
    }

    /// Runs one iteration. Per-record failures are counted; source and store failures
    /// before any record is touched are returned after the run row is marked failed.
    pub async fn run_iteration(
        &self,
        trigger: SyncTrigger,
        cancel: &CancellationToken,
    ) -> Result<IterationReport> {
        let mut run = SyncRunRecord::started(Uuid::new_v4(), trigger, Utc::now());
        let span = info_span!("sync_iteration", run_id = %run.run_id, trigger = trigger.as_str());

        async {
            self.store()
                .begin_run(&run)
                .await
                .context("recording sync run start")?;

            let mut report = IterationReport {
                run_id: run.run_id,
                ..IterationReport::default()
            };

            let resolved = match self.fetch_and_resolve(&mut report).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    run.status = SyncRunStatus::Failed;
                    run.finished_at = Some(Utc::now());
                    run.fetched = to_i64(report.fetched);
                    run.error = Some(format!("{err:#}"));
                    if let Err(finish_err) = self.store().finish_run(&run).await {
                        error!(error = %finish_err, "failed to record sync run failure");
                    }
                    return Err(err);
                }
            };

            let concurrency = self.options.record_concurrency.max(1);
            let outcomes: Vec<RecordOutcome> = stream::iter(resolved)
                .map(|record| self.process_record(record, cancel))
                .buffer_unordered(concurrency)
                .collect()
                .await;

            for outcome in outcomes {
                match outcome {
                    RecordOutcome::Processed => report.processed += 1,
                    RecordOutcome::AlreadyProcessed => report.already_processed += 1,
                    RecordOutcome::Failed => report.failed += 1,
                    RecordOutcome::Skipped => report.skipped += 1,
                }
            }

            run.status = SyncRunStatus::Succeeded;
            run.finished_at = Some(Utc::now());
            run.fetched = to_i64(report.fetched);
            run.processed = to_i64(report.processed);
            run.already_processed = to_i64(report.already_processed);
            run.failed = to_i64(report.failed);
            self.store()
                .finish_run(&run)
                .await
                .context("recording sync run completion")?;

            info!(
                fetched = report.fetched,
                resolved = report.resolved,
                processed = report.processed,
                already_processed = report.already_processed,
                failed = report.failed,
                skipped = report.skipped,
                "sync iteration finished"
            );
            Ok::<_, anyhow::Error>(report)
        }
        .instrument(span)
        .await
    }

    async fn fetch_and_resolve(&self, report: &mut IterationReport) -> Result<Vec<CallRecord>> {
        let fetched = fetch_records(
            self.source.as_ref(),
            &self.options.filter,
            self.options.fetch_limit,
            self.options.page_size,
        )
        .await
        .context("fetching call logs")?;
        report.fetched = fetched.len();

        let resolved = resolve_change_set(self.store(), fetched, self.options.force_reprocess)
            .await
            .context("resolving change set")?;
        report.resolved = resolved.len();
        Ok(resolved)
    }

    async fn process_record(&self, record: CallRecord, cancel: &CancellationToken) -> RecordOutcome {
        if cancel.is_cancelled() {
            debug!(call_id = %record.external_call_id, "stop requested; leaving record for next run");
            return RecordOutcome::Skipped;
        }

        let span = info_span!(
            "sync_record",
            call_id = %record.external_call_id,
            mode = self.engine.mode().as_str()
        );
        async {
            if let Err(err) = self.coordinator.capture(&record).await {
                warn!(error = %err, "raw call capture failed");
                return RecordOutcome::Failed;
            }

            let result = match self
                .engine
                .extract(record.transcript(), record.api_summary.as_deref())
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    warn!(error = %err, "extraction failed; call stays unprocessed");
                    return RecordOutcome::Failed;
                }
            };

            match self.coordinator.sync(&record, &result).await {
                Ok(SyncOutcome::AlreadyProcessed { .. }) => RecordOutcome::AlreadyProcessed,
                Ok(_) => RecordOutcome::Processed,
                Err(err) => {
                    warn!(error = %err, "sync transaction failed; call stays unprocessed");
                    RecordOutcome::Failed
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Creates a check-in from in-app text or voice input, with no call log behind it.
    pub async fn ingest_manual_checkin(
        &self,
        user_id: i64,
        source: CheckInSource,
        text: &str,
    ) -> Result<CheckIn> {
        ingest_manual_checkin(&self.engine, &self.coordinator, user_id, source, text).await
    }
}

/// Fast engine, or the LLM-backed rich engine. Rich mode needs an API key.
pub fn engine_from_config(config: &SyncConfig, http: HttpFetcher) -> Result<ExtractionEngine> {
    match config.extraction_mode {
        ExtractionMode::Fast => Ok(ExtractionEngine::fast()),
        ExtractionMode::Rich => {
            let api_key = config
                .llm_api_key
                .clone()
                .filter(|k| !k.is_empty())
                .context("LLM_API_KEY is required for rich extraction")?;
            let extractor = LlmExtractor::new(
                http,
                LlmConfig {
                    base_url: config.llm_api_base.clone(),
                    api_key,
                    model: config.llm_model.clone(),
                    temperature: config.llm_temperature,
                },
            );
            Ok(ExtractionEngine::rich(
                Arc::new(extractor),
                ExtractionConfig {
                    timeout: config.extraction_timeout(),
                    max_transcript_chars: config.max_transcript_chars,
                },
            ))
        }
    }
}

pub async fn ingest_manual_checkin(
    engine: &ExtractionEngine,
    coordinator: &SyncCoordinator,
    user_id: i64,
    source: CheckInSource,
    text: &str,
) -> Result<CheckIn> {
    anyhow::ensure!(
        source != CheckInSource::VoiceCall,
        "voice-call check-ins come from the call-log source"
    );
    anyhow::ensure!(!text.trim().is_empty(), "check-in text is empty");
    let result = engine
        .extract(text, None)
        .await
        .context("extracting manual check-in")?;
    let checkin = coordinator
        .record_manual(user_id, source, &result, Utc::now())
        .await
        .with_context(|| format!("recording manual check-in for user {user_id}"))?;
    Ok(checkin)
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
