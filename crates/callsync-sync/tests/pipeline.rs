use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use callsync_adapters::{
    CallFilter, CallPage, CallSource, ExtractionConfig, ExtractionEngine, ExtractionError,
    PageRequest, SourceError, StructuredExtractor,
};
use callsync_core::{
    CallRecord, CheckInSource, ExtractionMode, FoodCandidate, MedicationCandidate,
    StructuredResult, User,
};
use callsync_storage::{FetchError, Store, SyncRunStatus, SyncTrigger};
use callsync_sync::{PipelineOptions, Scheduler, SchedulerState, SyncCoordinator, SyncPipeline};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const PHONE: &str = "+15550001111";

fn call(id: &str, minutes_ago: i64, transcript: &str) -> CallRecord {
    CallRecord {
        external_call_id: id.to_string(),
        caller_phone: PHONE.to_string(),
        occurred_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
            - ChronoDuration::minutes(minutes_ago),
        duration_seconds: 90,
        raw_transcript: Some(transcript.to_string()),
        api_summary: None,
    }
}

/// Serves a fixed list of calls; the first `failures` fetches fail with a transport error.
struct ScriptedSource {
    calls: Mutex<Vec<CallRecord>>,
    failures: AtomicUsize,
    fetches: AtomicUsize,
}

impl ScriptedSource {
    fn new(calls: Vec<CallRecord>) -> Arc<Self> {
        Self::failing_first(calls, 0)
    }

    fn failing_first(calls: Vec<CallRecord>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(calls),
            failures: AtomicUsize::new(failures),
            fetches: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl CallSource for ScriptedSource {
    async fn fetch_page(
        &self,
        _filter: &CallFilter,
        page: PageRequest,
    ) -> Result<CallPage, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SourceError::Transport(FetchError::HttpStatus {
                status: 503,
                url: "https://calls.example/items/call_logs".into(),
                body: "maintenance".into(),
            }));
        }
        let calls = self.calls.lock().unwrap();
        Ok(calls
            .iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect::<Vec<_>>()
            .into())
    }
}

/// Returns metformin for every transcript, fails on any transcript containing "FAIL".
struct StubExtractor;

#[async_trait]
impl StructuredExtractor for StubExtractor {
    fn model(&self) -> &str {
        "stub"
    }

    async fn extract(&self, transcript: &str) -> Result<StructuredResult, ExtractionError> {
        if transcript.contains("FAIL") {
            return Err(ExtractionError::Malformed("stub refused to parse".into()));
        }
        Ok(metformin_result())
    }
}

fn metformin_result() -> StructuredResult {
    let mut result = StructuredResult::summary_only("Took metformin", ExtractionMode::Rich);
    result.medications.push(MedicationCandidate {
        dosage: "500mg".into(),
        ..MedicationCandidate::named("metformin")
    });
    result
}

/// Signals `entered` and then blocks each extraction until `gate` is notified.
#[derive(Default)]
struct GatedExtractor {
    entered: Notify,
    gate: Notify,
    calls: AtomicUsize,
}

#[async_trait]
impl StructuredExtractor for GatedExtractor {
    fn model(&self) -> &str {
        "gated"
    }

    async fn extract(&self, _transcript: &str) -> Result<StructuredResult, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.gate.notified().await;
        Ok(metformin_result())
    }
}

fn rich_engine() -> ExtractionEngine {
    ExtractionEngine::rich(Arc::new(StubExtractor), ExtractionConfig::default())
}

async fn store_with_user() -> (Store, User) {
    let store = Store::in_memory().await.unwrap();
    let user = store.register_user(PHONE, "Ada Patient").await.unwrap();
    (store, user)
}

fn pipeline(store: &Store, source: Arc<ScriptedSource>, engine: ExtractionEngine) -> SyncPipeline {
    SyncPipeline::new(store.clone(), source, engine, PipelineOptions::default())
}

async fn processed(store: &Store, id: &str) -> bool {
    store
        .call_log(id)
        .await
        .unwrap()
        .map(|log| log.processed)
        .unwrap_or(false)
}

#[tokio::test]
async fn scenario_a_fast_mode_creates_checkin_without_entries() {
    let (store, user) = store_with_user().await;
    let source = ScriptedSource::new(vec![call("c1", 0, "Took 500mg metformin this morning")]);
    let pipeline = pipeline(&store, source, ExtractionEngine::fast());

    let report = pipeline
        .run_iteration(SyncTrigger::Manual, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert!(processed(&store, "c1").await);

    let checkins = store.list_checkins(user.id, 10).await.unwrap();
    assert_eq!(checkins.len(), 1);
    assert_eq!(checkins[0].source, CheckInSource::VoiceCall);
    assert_eq!(checkins[0].summary, "Took 500mg metformin this morning");
    assert_eq!(store.entry_counts(checkins[0].id).await.unwrap().total(), 0);
}

#[tokio::test]
async fn scenario_b_rich_mode_writes_medication_entry() {
    let (store, user) = store_with_user().await;
    let source = ScriptedSource::new(vec![call("c1", 0, "Took 500mg metformin this morning")]);
    let pipeline = pipeline(&store, source, rich_engine());

    pipeline
        .run_iteration(SyncTrigger::Manual, &CancellationToken::new())
        .await
        .unwrap();

    let checkins = store.list_checkins(user.id, 10).await.unwrap();
    assert_eq!(checkins.len(), 1);
    let meds = store.list_medications(user.id, None).await.unwrap();
    assert_eq!(meds.len(), 1);
    assert_eq!(meds[0].name, "metformin");
    assert_eq!(meds[0].dosage, "500mg");
    assert_eq!(meds[0].checkin_id, checkins[0].id);
}

#[tokio::test]
async fn scenario_c_second_trigger_processes_nothing() {
    let (store, _user) = store_with_user().await;
    let source = ScriptedSource::new(vec![
        call("c1", 0, "Took 500mg metformin this morning"),
        call("c2", 10, "Had oatmeal for breakfast today"),
    ]);
    let scheduler = Scheduler::new(
        Arc::new(pipeline(&store, source, rich_engine())),
        Duration::from_secs(3600),
    );

    let first = scheduler.trigger_once().await.unwrap();
    let second = scheduler.trigger_once().await.unwrap();

    assert_eq!(first.processed, 2);
    assert_eq!(second.processed, 0);
    assert_eq!(second.failed, 0);
    assert!(scheduler.last_run().is_some());
    assert_eq!(scheduler.state(), SchedulerState::Idle);
}

#[tokio::test]
async fn failed_extraction_only_affects_its_record() {
    let (store, user) = store_with_user().await;
    let source = ScriptedSource::new(vec![
        call("c1", 0, "Took 500mg metformin this morning"),
        call("c2", 1, "Took 500mg metformin at noon"),
        call("c3", 2, "Took 500mg metformin with lunch"),
        call("c4", 3, "FAIL this transcript is garbled"),
        call("c5", 4, "Took 500mg metformin before bed"),
    ]);
    let pipeline = pipeline(&store, source, rich_engine());

    let report = pipeline
        .run_iteration(SyncTrigger::Manual, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.fetched, 5);
    assert_eq!(report.processed, 4);
    assert_eq!(report.failed, 1);

    for id in ["c1", "c2", "c3", "c5"] {
        assert!(processed(&store, id).await, "{id} should be processed");
    }
    // raw capture happened, extraction did not
    let c4 = store.call_log("c4").await.unwrap().unwrap();
    assert!(!c4.processed);
    assert!(store.transcript_for(c4.id).await.unwrap().is_some());
    assert!(store.checkin_for_call_log(c4.id).await.unwrap().is_none());
    assert_eq!(store.list_checkins(user.id, 10).await.unwrap().len(), 4);
}

#[tokio::test]
async fn resolver_skips_processed_calls_in_fetch_order() {
    let (store, _user) = store_with_user().await;
    let calls: Vec<_> = (1..=10)
        .map(|i| call(&format!("c{i}"), i, "Took 500mg metformin this morning"))
        .collect();
    let coordinator = SyncCoordinator::new(store.clone(), false);
    for idx in [1usize, 4, 8] {
        let result = StructuredResult::summary_only("earlier", ExtractionMode::Fast);
        coordinator.sync(&calls[idx], &result).await.unwrap();
    }

    let fetched_ids: Vec<String> = calls.iter().map(|c| c.external_call_id.clone()).collect();
    let resolved = callsync_sync::resolve_change_set(&store, calls, false).await.unwrap();
    let resolved_ids: Vec<&str> = resolved.iter().map(|c| c.external_call_id.as_str()).collect();

    assert_eq!(resolved.len(), 7);
    let expected: Vec<&str> = fetched_ids
        .iter()
        .enumerate()
        .filter(|(i, _)| ![1, 4, 8].contains(i))
        .map(|(_, id)| id.as_str())
        .collect();
    assert_eq!(resolved_ids, expected);
}

#[tokio::test]
async fn interrupted_sync_leaves_no_partial_rows() {
    let (store, user) = store_with_user().await;
    let coordinator = SyncCoordinator::new(store.clone(), false);
    let record = call("c1", 0, "Had toast and took metformin");

    let mut result = StructuredResult::summary_only("toast", ExtractionMode::Rich);
    result.medications.push(MedicationCandidate::named("metformin"));
    result.foods.push(FoodCandidate {
        calories: -5,
        ..FoodCandidate::named("toast")
    });

    assert!(coordinator.sync(&record, &result).await.is_err());
    assert!(!processed(&store, "c1").await);
    assert!(store.list_checkins(user.id, 10).await.unwrap().is_empty());
    assert!(store.list_medications(user.id, None).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_triggers_sync_each_call_once() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("race.db").display());
    let store = Store::open(&url).await.unwrap();
    let user = store.register_user(PHONE, "Ada Patient").await.unwrap();

    let calls: Vec<_> = (1..=5)
        .map(|i| call(&format!("c{i}"), i, "Took 500mg metformin this morning"))
        .collect();
    let options = PipelineOptions {
        record_concurrency: 3,
        ..PipelineOptions::default()
    };
    let a = Scheduler::new(
        Arc::new(SyncPipeline::new(
            store.clone(),
            ScriptedSource::new(calls.clone()),
            rich_engine(),
            options.clone(),
        )),
        Duration::from_secs(3600),
    );
    let b = Scheduler::new(
        Arc::new(SyncPipeline::new(
            store.clone(),
            ScriptedSource::new(calls),
            rich_engine(),
            options,
        )),
        Duration::from_secs(3600),
    );

    let (ra, rb) = tokio::join!(a.trigger_once(), b.trigger_once());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.failed + rb.failed, 0);
    assert_eq!(ra.processed + rb.processed, 5);
    assert_eq!(store.list_checkins(user.id, 50).await.unwrap().len(), 5);
    assert_eq!(store.list_medications(user.id, None).await.unwrap().len(), 5);
}

#[tokio::test]
async fn cancelled_iteration_leaves_records_untouched() {
    let (store, _user) = store_with_user().await;
    let source = ScriptedSource::new(vec![call("c1", 0, "Took 500mg metformin this morning")]);
    let pipeline = pipeline(&store, source, rich_engine());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = pipeline.run_iteration(SyncTrigger::Manual, &cancel).await.unwrap();

    assert_eq!(report.resolved, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.processed, 0);
    assert!(store.call_log("c1").await.unwrap().is_none());
}

#[tokio::test]
async fn source_outage_fails_the_iteration_and_is_recorded() {
    let (store, _user) = store_with_user().await;
    let source = ScriptedSource::failing_first(vec![call("c1", 0, "Took metformin today")], 1);
    let pipeline = pipeline(&store, source, ExtractionEngine::fast());

    let err = pipeline
        .run_iteration(SyncTrigger::Manual, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("fetching call logs"));

    let runs = store.recent_runs(5).await.unwrap();
    assert_eq!(runs[0].status, SyncRunStatus::Failed);
    assert!(store.last_successful_sync().await.unwrap().is_none());

    pipeline
        .run_iteration(SyncTrigger::Manual, &CancellationToken::new())
        .await
        .unwrap();
    assert!(store.last_successful_sync().await.unwrap().is_some());
}

#[tokio::test]
async fn scenario_d_scheduler_survives_transport_errors() {
    let (store, _user) = store_with_user().await;
    let source = ScriptedSource::failing_first(vec![call("c1", 0, "Took 500mg metformin")], 1);
    let scheduler = Scheduler::new(
        Arc::new(pipeline(&store, source.clone(), ExtractionEngine::fast())),
        Duration::from_millis(20),
    );

    scheduler.start();
    scheduler.start();
    assert_eq!(scheduler.state(), SchedulerState::Running);

    let mut synced = false;
    for _ in 0..100 {
        if processed(&store, "c1").await {
            synced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(synced, "scheduler should recover after the outage");
    assert_eq!(scheduler.state(), SchedulerState::Running);
    assert!(source.fetches.load(Ordering::SeqCst) >= 2);

    scheduler.stop().await;
    assert_eq!(scheduler.state(), SchedulerState::Idle);
    assert!(!scheduler.is_syncing());

    let fetches_after_stop = source.fetches.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(source.fetches.load(Ordering::SeqCst), fetches_after_stop);
}

#[tokio::test]
async fn stop_finishes_in_flight_record_and_starts_no_more() {
    let (store, user) = store_with_user().await;
    let source = ScriptedSource::new(vec![
        call("c1", 0, "Took 500mg metformin this morning"),
        call("c2", 10, "Took 500mg metformin at noon"),
    ]);
    let extractor = Arc::new(GatedExtractor::default());
    let engine = ExtractionEngine::rich(extractor.clone(), ExtractionConfig::default());
    let options = PipelineOptions {
        record_concurrency: 1,
        ..PipelineOptions::default()
    };
    let scheduler = Scheduler::new(
        Arc::new(SyncPipeline::new(store.clone(), source, engine, options)),
        Duration::from_secs(3600),
    );

    scheduler.start();
    tokio::time::timeout(Duration::from_secs(5), extractor.entered.notified())
        .await
        .expect("first record never reached extraction");
    assert!(scheduler.is_syncing());
    assert_eq!(scheduler.state(), SchedulerState::Running);

    let stopping = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move { scheduler.stop().await }
    });
    // stop() takes the loop handle and cancels in the same poll
    for _ in 0..100 {
        if scheduler.state() == SchedulerState::Idle {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(scheduler.state(), SchedulerState::Idle);
    assert!(scheduler.is_syncing());
    assert!(!stopping.is_finished());

    extractor.gate.notify_one();
    tokio::time::timeout(Duration::from_secs(5), stopping)
        .await
        .expect("stop did not return after the gate opened")
        .unwrap();

    assert!(!scheduler.is_syncing());
    assert!(scheduler.last_run().is_some());
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
    assert!(processed(&store, "c1").await);
    assert!(store.call_log("c2").await.unwrap().is_none());
    assert_eq!(store.list_checkins(user.id, 10).await.unwrap().len(), 1);
    assert_eq!(store.list_medications(user.id, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn manual_checkins_have_no_call_log() {
    let (store, user) = store_with_user().await;
    let pipeline = pipeline(&store, ScriptedSource::new(Vec::new()), rich_engine());

    let checkin = pipeline
        .ingest_manual_checkin(user.id, CheckInSource::ManualText, "Took 500mg metformin after dinner")
        .await
        .unwrap();
    assert_eq!(checkin.source, CheckInSource::ManualText);
    assert_eq!(checkin.call_log_id, None);
    assert_eq!(store.entry_counts(checkin.id).await.unwrap().medications, 1);

    assert!(pipeline
        .ingest_manual_checkin(user.id, CheckInSource::VoiceCall, "not allowed")
        .await
        .is_err());
}
