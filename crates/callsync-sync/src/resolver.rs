//! Change-set resolution: which fetched calls still need a sync.

use std::collections::HashSet;

use callsync_core::CallRecord;
use callsync_storage::{PersistenceError, Store};
use tracing::debug;

/// Keeps records that still need extraction, in fetch order, first occurrence of each call id.
pub fn resolve(
    fetched: Vec<CallRecord>,
    processed: &HashSet<String>,
    force_reprocess: bool,
) -> Vec<CallRecord> {
    let mut seen = HashSet::new();
    fetched
        .into_iter()
        .filter(|record| seen.insert(record.external_call_id.clone()))
        .filter(|record| force_reprocess || !processed.contains(&record.external_call_id))
        .collect()
}

/// Read-only against the store: looks up processed call logs for the fetched ids.
pub async fn resolve_change_set(
    store: &Store,
    fetched: Vec<CallRecord>,
    force_reprocess: bool,
) -> Result<Vec<CallRecord>, PersistenceError> {
    let ids: Vec<String> = fetched.iter().map(|r| r.external_call_id.clone()).collect();
    let processed = store.processed_call_ids(&ids).await?;
    let fetched_count = fetched.len();
    let resolved = resolve(fetched, &processed, force_reprocess);
    debug!(
        fetched = fetched_count,
        already_processed = processed.len(),
        resolved = resolved.len(),
        force_reprocess,
        "resolved change set"
    );
    Ok(resolved)
}
