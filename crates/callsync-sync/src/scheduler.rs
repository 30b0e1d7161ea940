//! Polling scheduler with start, stop and out-of-band triggers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use callsync_storage::SyncTrigger;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::pipeline::{IterationReport, SyncPipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TriggerReport {
    pub processed: usize,
    pub failed: usize,
}

impl From<&IterationReport> for TriggerReport {
    fn from(report: &IterationReport) -> Self {
        Self {
            processed: report.processed,
            failed: report.failed,
        }
    }
}

struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the polling loop. Hold it in an `Arc`; the loop task keeps its own clone.
pub struct Scheduler {
    pipeline: Arc<SyncPipeline>,
    interval: Duration,
    handle: Mutex<Option<LoopHandle>>,
    in_flight: AtomicUsize,
    last_run: RwLock<Option<DateTime<Utc>>>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Scheduler {
    pub fn new(pipeline: Arc<SyncPipeline>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            interval,
            handle: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            last_run: RwLock::new(None),
        })
    }

    pub fn pipeline(&self) -> &Arc<SyncPipeline> {
        &self.pipeline
    }

    /// Spawns the polling loop. Calling it on a running scheduler does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut guard = match self.handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.as_ref().is_some_and(|h| !h.task.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(self).run_loop(cancel.clone()));
        *guard = Some(LoopHandle { cancel, task });
        info!(interval_secs = self.interval.as_secs(), "scheduler started");
    }

    /// Signals the loop and waits for it. An in-flight iteration finishes its current
    /// records and starts no new ones.
    pub async fn stop(&self) {
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(handle) = handle else {
            return;
        };

        handle.cancel.cancel();
        if let Err(err) = handle.task.await {
            error!(error = %err, "scheduler loop ended abnormally");
        }
        info!("scheduler stopped");
    }

    /// One iteration outside the cadence. Safe alongside the loop: both may see the same
    /// call but only one sync commits it.
    pub async fn trigger_once(&self) -> Result<TriggerReport> {
        let report = self
            .iterate(SyncTrigger::Manual, &CancellationToken::new())
            .await?;
        Ok(TriggerReport::from(&report))
    }

    pub fn state(&self) -> SchedulerState {
        let guard = match self.handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(h) if !h.task.is_finished() => SchedulerState::Running,
            _ => SchedulerState::Idle,
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        match self.last_run.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    async fn iterate(
        &self,
        trigger: SyncTrigger,
        cancel: &CancellationToken,
    ) -> Result<IterationReport> {
        let _in_flight = InFlight::enter(&self.in_flight);
        let result = self.pipeline.run_iteration(trigger, cancel).await;
        let finished = Utc::now();
        match self.last_run.write() {
            Ok(mut guard) => *guard = Some(finished),
            Err(poisoned) => *poisoned.into_inner() = Some(finished),
        }
        result
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.iterate(SyncTrigger::Scheduled, &cancel).await {
                Ok(report) if report.failed > 0 => {
                    warn!(failed = report.failed, "iteration left calls unprocessed; retrying next tick")
                }
                Ok(_) => {}
                Err(err) => error!(error = %format!("{err:#}"), "sync iteration failed; retrying next tick"),
            }
        }
    }
}
