// Copyright 2026 The Rampart Project
// SPDX-License-Identifier: Apache-2.0

// HTTP surface
//
// Responsibilities:
// - POST /scan            run one scan, 200 for every decision
// - POST /datasets/reload install a new registry snapshot
// - GET  /health          legacy liveness + snapshot identity
// - GET  /health/live     liveness probe, always 200
// - GET  /health/ready    readiness probe, 503 until rules are loaded
// - GET  /metrics         telemetry snapshot (JSON)
// - GET  /stats           registry aggregates
//
// HTTP status discipline: 200 for any successful decision (including
// REJECTED and fail-closed REVIEW_REQUIRED), 4xx for malformed input,
// oversize, failed authentication or a spent rate-limit window, 503 when
// the scan circuit breaker is open or the service is not ready.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::config::Config;
use crate::hardening::ServiceGuards;
use crate::registry::ReloadController;
use crate::scanner::{ScanRequest, ScanStatus, Scanner};
use crate::telemetry::Telemetry;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Shared state injected into axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub scanner: Arc<Scanner>,
    pub reloader: Arc<ReloadController>,
    pub telemetry: Arc<Telemetry>,
    pub guards: Arc<ServiceGuards>,
    pub config: Arc<Config>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/scan", post(scan_handler))
        .route("/datasets/reload", post(reload_handler))
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Authentication and guards
// ---------------------------------------------------------------------------

/// Check the X-API-Key header when an api_key is configured. Without one,
/// all requests are accepted.
fn check_api_key(config: &Config, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = config.api_key.as_deref() else {
        return Ok(());
    };
    let presented = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    if presented == Some(expected) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid or missing API key" })),
        )
            .into_response())
    }
}

fn rate_limited() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": "rate limit exceeded" })),
    )
        .into_response()
}

fn breaker_open() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "error": "service temporarily unavailable due to high error rate"
        })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn scan_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ScanRequest>,
) -> Response {
    if let Err(denied) = check_api_key(&state.config, &headers) {
        return denied;
    }
    if !state.guards.scan_limiter.try_acquire() {
        return rate_limited();
    }
    if !state.guards.breaker.allow() {
        return breaker_open();
    }

    state.telemetry.request_started();
    let result = state.scanner.clone().scan_with_deadline(request).await;
    state.telemetry.request_finished();

    // Feed the breaker: fail-policy results are internal failures, every
    // real decision (including REJECTED and oversize) is a success.
    if result.degraded {
        if state.guards.breaker.record_failure() {
            state.telemetry.record_circuit_breaker_trip();
            tracing::warn!("scan circuit breaker opened");
        }
    } else {
        state.guards.breaker.record_success();
    }

    // ERROR only arises from the oversize gates; everything else is a
    // successful decision.
    let http_status = if result.status == ScanStatus::Error {
        StatusCode::PAYLOAD_TOO_LARGE
    } else {
        StatusCode::OK
    };

    (http_status, Json(result)).into_response()
}

async fn reload_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = check_api_key(&state.config, &headers) {
        return denied;
    }
    if !state.guards.reload_limiter.try_acquire() {
        return rate_limited();
    }

    match state.reloader.reload().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(err) => {
            state.telemetry.record_reload_failure();
            tracing::error!(error = %err, "dataset reload failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "status": "failure",
                    "error": err.to_string(),
                    "rule_set_version": state.scanner.registry().current().version(),
                })),
            )
                .into_response()
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.scanner.registry().current();
    Json(json!({
        "status": "healthy",
        "rule_set_version": snapshot.version(),
        "total_rules": snapshot.total_rules(),
        "total_datasets": snapshot.total_datasets(),
    }))
    .into_response()
}

/// Liveness: the process is up. Never inspects application state.
async fn liveness_handler() -> Response {
    Json(json!({ "status": "alive" })).into_response()
}

/// Readiness: the scanner can make real decisions, which requires a
/// loaded rule set.
async fn readiness_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.scanner.registry().current();
    if snapshot.total_rules() == 0 {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "reason": "no rules loaded",
            })),
        )
            .into_response();
    }
    Json(json!({
        "status": "ready",
        "rule_count": snapshot.total_rules(),
        "dataset_count": snapshot.total_datasets(),
    }))
    .into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    Json(state.telemetry.snapshot()).into_response()
}

async fn stats_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = check_api_key(&state.config, &headers) {
        return denied;
    }
    Json(state.scanner.registry().current().stats()).into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
