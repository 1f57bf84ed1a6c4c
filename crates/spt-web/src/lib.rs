//! Axum JSON API over the ingestion pipeline.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

use spt_core::{Snapshot, StudentRecord};
use spt_engine::{
    compare_batches, maybe_build_scheduler, pipeline_from_env, Orchestrator, SubmitError,
    TriggerError, WeeklyTrigger,
};
use spt_store::SnapshotStore;

pub const CRATE_NAME: &str = "spt-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub trigger: Arc<WeeklyTrigger>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/batches", post(submit_handler))
        .route("/api/batches/compare", get(compare_handler))
        .route("/api/batches/{id}", get(status_handler))
        .route("/api/batches/{id}/cancel", post(cancel_handler))
        .route("/api/trigger", post(trigger_handler).get(trigger_state_handler))
        .route("/api/students/{reg_no}/history", get(history_handler))
        .with_state(Arc::new(state))
}

/// Build the pipeline from the environment and serve it, including the
/// weekly cron scheduler when enabled.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let pipeline = pipeline_from_env().await?;
    // Held for the lifetime of the server so scheduled jobs keep firing.
    let mut _scheduler = maybe_build_scheduler(pipeline.trigger.clone(), &pipeline.config).await?;
    if let Some(scheduler) = _scheduler.as_mut() {
        scheduler.start().await?;
        info!(cron = %pipeline.config.weekly_cron, "weekly ingestion scheduler started");
    }

    let port: u16 = std::env::var("SPT_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = AppState {
        orchestrator: pipeline.orchestrator,
        trigger: pipeline.trigger,
    };
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving ingestion API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    students: Vec<StudentRecord>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    batch_id: Uuid,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    batch_id: Option<Uuid>,
    is_running: bool,
}

#[derive(Debug, Deserialize, Default)]
struct CompareQuery {
    a: Option<Uuid>,
    b: Option<Uuid>,
}

#[derive(Debug, Deserialize, Default)]
struct HistoryQuery {
    limit: Option<usize>,
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitRequest>,
) -> Response {
    match state.orchestrator.submit(request.students).await {
        Ok(batch_id) => (StatusCode::ACCEPTED, Json(SubmitResponse { batch_id })).into_response(),
        Err(err @ (SubmitError::EmptyBatch | SubmitError::TooLarge { .. })) => {
            error_body(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
        }
        Err(err) => server_error(err),
    }
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(batch_id): AxumPath<Uuid>,
) -> Response {
    match state.orchestrator.status(batch_id).await {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => error_body(StatusCode::NOT_FOUND, format!("batch {batch_id} not found")),
        Err(err) => server_error(err),
    }
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(batch_id): AxumPath<Uuid>,
) -> Response {
    match state.orchestrator.cancel(batch_id).await {
        Ok(cancelled) => Json(CancelResponse { cancelled }).into_response(),
        Err(err) => server_error(err),
    }
}

async fn compare_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CompareQuery>,
) -> Response {
    match compare_batches(state.orchestrator.store().as_ref(), query.a, query.b).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => error_body(StatusCode::BAD_REQUEST, err.to_string()),
    }
}

async fn trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.trigger.run().await {
        Ok(batch_id) => (
            StatusCode::ACCEPTED,
            Json(TriggerResponse {
                batch_id: Some(batch_id),
                is_running: true,
            }),
        )
            .into_response(),
        Err(TriggerError::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(TriggerResponse {
                batch_id: None,
                is_running: true,
            }),
        )
            .into_response(),
        Err(err @ TriggerError::EmptyRoster) => {
            error_body(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
        }
        Err(TriggerError::Submit(err @ (SubmitError::EmptyBatch | SubmitError::TooLarge { .. }))) => {
            error_body(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
        }
        Err(err) => server_error(err),
    }
}

async fn trigger_state_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(serde_json::json!({ "is_running": state.trigger.is_running() })).into_response()
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(reg_no): AxumPath<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(12).clamp(1, 100);
    match state
        .orchestrator
        .store()
        .snapshot_history(&reg_no, limit)
        .await
    {
        Ok(history) => Json::<Vec<Snapshot>>(history).into_response(),
        Err(err) => server_error(err),
    }
}
