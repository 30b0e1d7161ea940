//! Single write path from extraction results to check-ins and their entries.

use callsync_core::{CallLog, CallRecord, CheckIn, CheckInSource, StructuredResult};
use callsync_storage::{PersistenceError, Store, SyncOutcome};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// The single write path for check-ins and their entries.
#[derive(Debug, Clone)]
pub struct SyncCoordinator {
    store: Store,
    force_reprocess: bool,
}

impl SyncCoordinator {
    pub fn new(store: Store, force_reprocess: bool) -> Self {
        Self {
            store,
            force_reprocess,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Raw capture of the call log and transcript, independent of extraction.
    /// The upsert resolves insert races in SQL, so concurrent captures share one row.
    pub async fn capture(&self, record: &CallRecord) -> Result<CallLog, PersistenceError> {
        self.store.upsert_call_log(record).await
    }

    /// Applies one record atomically. A concurrent or repeated sync resolves to `AlreadyProcessed`.
    pub async fn sync(
        &self,
        record: &CallRecord,
        result: &StructuredResult,
    ) -> Result<SyncOutcome, PersistenceError> {
        let outcome = self
            .store
            .apply_sync(record, result, self.force_reprocess)
            .await?;

        match outcome {
            SyncOutcome::Synced { checkin_id, entries, .. } => info!(
                call_id = %record.external_call_id,
                checkin_id,
                entries,
                mode = result.mode.as_str(),
                "call synced"
            ),
            SyncOutcome::Replaced { checkin_id, entries, .. } => info!(
                call_id = %record.external_call_id,
                checkin_id,
                entries,
                "call reprocessed; previous check-in replaced"
            ),
            SyncOutcome::AlreadyProcessed { .. } => {
                debug!(call_id = %record.external_call_id, "call already processed; skipping")
            }
        }
        Ok(outcome)
    }

    pub async fn record_manual(
        &self,
        user_id: i64,
        source: CheckInSource,
        result: &StructuredResult,
        at: DateTime<Utc>,
    ) -> Result<CheckIn, PersistenceError> {
        let checkin = self
            .store
            .record_manual_checkin(user_id, source, result, at)
            .await?;
        info!(
            user_id,
            checkin_id = checkin.id,
            source = source.as_str(),
            entries = result.entry_count(),
            "manual check-in recorded"
        );
        Ok(checkin)
    }
}
