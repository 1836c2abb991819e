//! HTTP request handlers
//!
//! Contains handlers for all HTTP endpoints.

use std::collections::BTreeMap;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse},
    Json,
};
use serde::Serialize;
use tracing::{debug, instrument};

use super::AppState;
use crate::error::{AppError, AppResult};
use crate::runner::HarvestSummary;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Health status
    pub status: String,
    /// Application version
    pub version: String,
}

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    /// Operational counters
    pub counters: BTreeMap<String, u64>,
    /// Metric batches waiting to be drained
    pub pending_batches: usize,
    pub last_harvest: Option<HarvestSummary>,
}

/// Root endpoint - displays basic info
pub async fn root() -> Html<String> {
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>flex-collector</title>
</head>
<body>
    <h1>flex-collector</h1>
    <p>Version: {}</p>
    <ul>
        <li><a href="/health">Health Check</a></li>
        <li><a href="/status">Status</a></li>
        <li><a href="/metrics">Metrics</a></li>
    </ul>
</body>
</html>"#,
        env!("CARGO_PKG_VERSION"),
    );
    Html(html)
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Status endpoint - counter snapshot
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        counters: state.ctx.counters().snapshot(),
        pending_batches: state.ctx.store().len(),
        last_harvest: state.last_harvest(),
    })
}

/// Metrics endpoint - drains the metrics store as a JSON array of batches
#[instrument(skip(state), name = "metrics_handler")]
pub async fn metrics(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let batches = state.ctx.store().drain();
    let body = state
        .formatter
        .format(&batches)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    debug!(batches = batches.len(), "Metrics store drained");

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    ))
}
