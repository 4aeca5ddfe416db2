//! API route definitions.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::state::AppState;
use crate::api::ApiError;
use crate::breaker::FailOpenBreaker;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/verifications", post(track_verification))
        .route("/status", get(status))
        .route("/evaluate", post(evaluate))
        .route("/history", get(history))
        .route("/trips", get(trips))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

/// Run blocking store work off the async workers.
async fn with_breaker<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&FailOpenBreaker) -> Result<T, crate::store::StoreError> + Send + 'static,
{
    let breaker = state.breaker.clone();
    Ok(tokio::task::spawn_blocking(move || f(&breaker)).await??)
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

#[derive(Debug, Deserialize)]
struct TrackRequest {
    success: bool,
}

async fn track_verification(
    State(state): State<AppState>,
    Json(req): Json<TrackRequest>,
) -> Result<StatusCode, ApiError> {
    with_breaker(&state, move |b| b.track(req.success)).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let status = with_breaker(&state, |b| b.status()).await?;
    Ok(Json(json!({ "data": status, "meta": meta() })))
}

async fn evaluate(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let evaluation = with_breaker(&state, |b| b.evaluate_previous_window()).await?;
    Ok(Json(json!({ "data": evaluation, "meta": meta() })))
}

async fn history(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let samples = with_breaker(&state, |b| b.history()).await?;
    let total = samples.len();
    Ok(Json(json!({ "data": samples, "meta": { "total": total } })))
}

#[derive(Debug, Deserialize)]
struct TripsQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    20
}

async fn trips(
    State(state): State<AppState>,
    Query(q): Query<TripsQuery>,
) -> Result<Json<Value>, ApiError> {
    let log = state.incidents.clone().ok_or(ApiError::NoIncidentLog)?;
    let incidents = tokio::task::spawn_blocking(move || log.list_recent(q.limit)).await??;
    let total = incidents.len();
    Ok(Json(json!({ "data": incidents, "meta": { "total": total } })))
}
