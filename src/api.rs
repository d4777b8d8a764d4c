//! REST endpoints over the coordinator facade.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use crate::agent::ExecutionMode;
use crate::coordinator::{Coordinator, NewEscalation};
use crate::error::{DatabaseError, Error, RunError};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

/// Build the router. Every handler shares one coordinator.
pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/{id}/mode", put(set_mode))
        .route("/api/agents/{id}/runs", post(trigger_run))
        .route("/api/agents/{id}/eta-requests", post(request_eta_all))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/activity", get(activity_feed))
        .route("/api/escalations", get(list_escalations).post(create_escalation))
        .route("/api/escalations/{id}/resolve", post(resolve_escalation))
        .route("/api/loads/{id}/eta-request", post(request_eta))
        .route("/api/loads/{id}/delivery", post(record_delivery))
        .route("/api/knowledge/carriers", get(carriers))
        .route("/api/knowledge/carriers/{id}", get(carrier))
        .route("/api/knowledge/sites", get(sites))
        .route("/api/knowledge/sites/{id}", get(site))
        .route("/api/knowledge/rebuild", post(rebuild))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(coordinator)
}

type AppState = State<Arc<Coordinator>>;

// ── Errors ──────────────────────────────────────────────────────────────

pub struct ApiError(Error);

impl<E: Into<Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Run(RunError::AgentNotFound { .. } | RunError::NotFound { .. })
            | Error::Run(RunError::Database(DatabaseError::NotFound { .. }))
            | Error::Database(DatabaseError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Error::Run(RunError::AlreadyRunning { .. } | RunError::AgentDisabled { .. })
            | Error::Database(DatabaseError::Constraint(_)) => StatusCode::CONFLICT,
            Error::Mail(_) | Error::Llm(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(%status, error = %self.0, "API request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn parse_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| bad_request("Invalid id"))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<i64>,
    agent_id: Option<String>,
    #[serde(default)]
    open_only: bool,
}

impl ListParams {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "fuel-coordinator"
    }))
}

// ── Agents & runs ───────────────────────────────────────────────────────

async fn list_agents(State(c): AppState) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(c.list_agents().await?))
}

#[derive(Debug, Deserialize)]
struct ModeRequest {
    mode: String,
}

async fn set_mode(
    State(c): AppState,
    Path(id): Path<String>,
    Json(body): Json<ModeRequest>,
) -> Result<Response, ApiError> {
    let mode: ExecutionMode = match body.mode.parse() {
        Ok(mode) => mode,
        Err(e) => return Ok(bad_request(&e)),
    };
    c.set_execution_mode(&id, mode).await?;
    Ok(Json(serde_json::json!({ "agent_id": id, "mode": mode })).into_response())
}

async fn trigger_run(State(c): AppState, Path(id): Path<String>) -> Result<Response, ApiError> {
    let handle = c.trigger_run(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": handle.id, "status": "running" })),
    )
        .into_response())
}

async fn list_runs(State(c): AppState, Query(params): Query<ListParams>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(c.list_runs(params.agent_id.as_deref(), params.limit()).await?))
}

async fn get_run(State(c): AppState, Path(id): Path<String>) -> Result<Response, ApiError> {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return Ok(resp),
    };
    Ok(Json(c.get_run(id).await?).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest {
    reason: Option<String>,
}

async fn cancel_run(
    State(c): AppState,
    Path(id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> Result<Response, ApiError> {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return Ok(resp),
    };
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "requested by operator".to_string());
    if c.cancel_run(id, &reason).await? {
        Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "run_id": id, "status": "cancelling" })),
        )
            .into_response())
    } else {
        Ok((
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "Run already finished" })),
        )
            .into_response())
    }
}

async fn activity_feed(State(c): AppState, Query(params): Query<ListParams>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        c.activity_feed(params.limit(), params.agent_id.as_deref())
            .await?,
    ))
}

// ── ETA requests ────────────────────────────────────────────────────────

async fn request_eta(State(c): AppState, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    Ok((StatusCode::CREATED, Json(c.request_eta(&id).await?)))
}

async fn request_eta_all(State(c): AppState, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(c.request_eta_all(&id).await?))
}

// ── Escalations & deliveries ────────────────────────────────────────────

async fn list_escalations(
    State(c): AppState,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(c.list_escalations(params.open_only, params.limit()).await?))
}

async fn create_escalation(
    State(c): AppState,
    Json(body): Json<NewEscalation>,
) -> Result<impl IntoResponse, ApiError> {
    Ok((StatusCode::CREATED, Json(c.create_escalation(body).await?)))
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    notes: Option<String>,
    #[serde(default)]
    false_alarm: bool,
}

async fn resolve_escalation(
    State(c): AppState,
    Path(id): Path<String>,
    Json(body): Json<ResolveRequest>,
) -> Result<Response, ApiError> {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return Ok(resp),
    };
    let escalation = c
        .resolve_escalation(id, body.notes.as_deref(), body.false_alarm)
        .await?;
    Ok(Json(escalation).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct DeliveryRequest {
    delivered_at: Option<DateTime<Utc>>,
}

async fn record_delivery(
    State(c): AppState,
    Path(id): Path<String>,
    body: Option<Json<DeliveryRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let delivered_at = body.and_then(|Json(b)| b.delivered_at);
    Ok(Json(c.record_delivery(&id, delivered_at).await?))
}

// ── Knowledge graph ─────────────────────────────────────────────────────

async fn carriers(State(c): AppState) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(c.carrier_reliabilities().await?))
}

async fn carrier(State(c): AppState, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let record = c.carrier_reliability(&id).await?;
    let record = record.ok_or(DatabaseError::NotFound {
        entity: "carrier reliability".into(),
        id,
    })?;
    Ok(Json(record))
}

async fn sites(State(c): AppState) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(c.site_risks().await?))
}

async fn site(State(c): AppState, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let record = c.site_risk(&id).await?;
    let record = record.ok_or(DatabaseError::NotFound {
        entity: "site risk".into(),
        id,
    })?;
    Ok(Json(record))
}

async fn rebuild(State(c): AppState) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(c.rebuild_knowledge().await?))
}
