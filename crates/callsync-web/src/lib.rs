//! JSON read API over the store, plus sync status and manual trigger endpoints.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use callsync_storage::{PersistenceError, Store};
use callsync_sync::{build_scheduler, Scheduler, SchedulerState, SyncConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "callsync-web";

const DEFAULT_CHECKIN_LIMIT: u32 = 20;
const MAX_CHECKIN_LIMIT: u32 = 200;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub scheduler: Option<Arc<Scheduler>>,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

#[derive(Debug, Deserialize)]
struct CheckinsQuery {
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SinceQuery {
    since: Option<String>,
}

#[derive(Debug, Serialize)]
struct SyncStatus {
    last_successful_sync: Option<DateTime<Utc>>,
    in_progress: bool,
    scheduler_state: SchedulerState,
    last_run: Option<DateTime<Utc>>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/users/{user_id}/checkins", get(checkins_handler))
        .route("/api/users/{user_id}/medications", get(medications_handler))
        .route("/api/users/{user_id}/food", get(food_handler))
        .route("/api/users/{user_id}/symptoms", get(symptoms_handler))
        .route("/api/sync/status", get(sync_status_handler))
        .route("/api/sync/trigger", post(sync_trigger_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving read API");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Scheduler plus web server until Ctrl-C; the scheduler is stopped after the server drains.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;
    let scheduler = build_scheduler(&config).await?;
    let store = scheduler.pipeline().store().clone();
    scheduler.start();

    let state = AppState::new(store).with_scheduler(Arc::clone(&scheduler));
    let served = serve(state, config.web_port, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for shutdown signal");
        }
    })
    .await;

    scheduler.stop().await;
    served
}

async fn healthz_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn checkins_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<i64>,
    Query(query): Query<CheckinsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_CHECKIN_LIMIT)
        .clamp(1, MAX_CHECKIN_LIMIT);
    match state.store.list_checkins(user_id, limit).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error(err),
    }
}

async fn medications_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<i64>,
    Query(query): Query<SinceQuery>,
) -> Response {
    let since = match parse_since(query.since.as_deref()) {
        Ok(since) => since,
        Err(resp) => return resp,
    };
    match state.store.list_medications(user_id, since).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error(err),
    }
}

async fn food_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<i64>,
    Query(query): Query<SinceQuery>,
) -> Response {
    let since = match parse_since(query.since.as_deref()) {
        Ok(since) => since,
        Err(resp) => return resp,
    };
    match state.store.list_food(user_id, since).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error(err),
    }
}

async fn symptoms_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<i64>,
    Query(query): Query<SinceQuery>,
) -> Response {
    let since = match parse_since(query.since.as_deref()) {
        Ok(since) => since,
        Err(resp) => return resp,
    };
    match state.store.list_symptoms(user_id, since).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error(err),
    }
}

async fn sync_status_handler(State(state): State<Arc<AppState>>) -> Response {
    let last_successful_sync = match state.store.last_successful_sync().await {
        Ok(at) => at,
        Err(err) => return store_error(err),
    };
    let scheduler = state.scheduler.as_deref();
    Json(SyncStatus {
        last_successful_sync,
        in_progress: scheduler.is_some_and(Scheduler::is_syncing),
        scheduler_state: scheduler.map_or(SchedulerState::Idle, Scheduler::state),
        last_run: scheduler.and_then(Scheduler::last_run),
    })
    .into_response()
}

async fn sync_trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(scheduler) = state.scheduler.as_ref() else {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "sync is not configured");
    };
    match scheduler.trigger_once().await {
        Ok(report) => Json(report).into_response(),
        Err(err) => {
            error!(error = %format!("{err:#}"), "manual sync trigger failed");
            json_error(StatusCode::BAD_GATEWAY, &format!("{err:#}"))
        }
    }
}

fn parse_since(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, Response> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(raw)
        .map(|at| Some(at.with_timezone(&Utc)))
        .map_err(|e| {
            json_error(
                StatusCode::BAD_REQUEST,
                &format!("`since` must be an RFC 3339 timestamp: {e}"),
            )
        })
}

fn store_error(err: PersistenceError) -> Response {
    error!(error = %err, "store query failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}
