//! Call-log sync orchestration: configuration, change-set resolution, the sync
//! coordinator, the per-iteration pipeline and the polling scheduler.

mod config;
mod coordinator;
mod pipeline;
mod resolver;
mod scheduler;

use std::sync::Arc;

use anyhow::{Context, Result};
use callsync_storage::{Store, SyncTrigger};
use tokio_util::sync::CancellationToken;

pub use config::{ConfigError, SyncConfig};
pub use coordinator::SyncCoordinator;
pub use pipeline::{
    engine_from_config, ingest_manual_checkin, IterationReport, PipelineOptions, SyncPipeline,
};
pub use resolver::{resolve, resolve_change_set};
pub use scheduler::{Scheduler, SchedulerState, TriggerReport};

pub const CRATE_NAME: &str = "callsync-sync";

pub async fn open_store(config: &SyncConfig) -> Result<Store> {
    Store::open(&config.database_url)
        .await
        .with_context(|| format!("opening store at {}", config.database_url))
}

/// Validated config, open store, and a scheduler that has not been started yet.
pub async fn build_scheduler(config: &SyncConfig) -> Result<Arc<Scheduler>> {
    let store = open_store(config).await?;
    let pipeline = SyncPipeline::from_config(config, store)?;
    Ok(Scheduler::new(Arc::new(pipeline), config.poll_interval()))
}

pub async fn run_sync_once_from_env() -> Result<IterationReport> {
    let config = SyncConfig::from_env()?;
    let store = open_store(&config).await?;
    let pipeline = SyncPipeline::from_config(&config, store)?;
    pipeline
        .run_iteration(SyncTrigger::Manual, &CancellationToken::new())
        .await
}
