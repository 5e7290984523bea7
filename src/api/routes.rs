//! API route definitions.

use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::state::AppState;
use crate::storage::parse_window;

const DEFAULT_HISTORY_WINDOW: Duration = Duration::from_secs(24 * 3600);

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/current", get(current))
        .route("/cached", get(cached))
        .route("/speedtest", post(speed_test))
        .route("/history", get(history))
        .route("/bandwidth", get(bandwidth))
        .route("/ping", get(ping))
}

/// Probe now, persist best-effort, return the fresh snapshot.
async fn current(State(state): State<AppState>) -> Response {
    let status = state.monitor.probe_status().await;
    if let Err(e) = state.store.save_status(&status) {
        warn!(error = %e, "Failed to persist network status");
    }
    Json(status.as_ref()).into_response()
}

async fn cached(State(state): State<AppState>) -> Json<Value> {
    let status = state.monitor.cached_status();
    let speed_test = state.monitor.last_speed_test();
    Json(json!({
        "status": status.as_deref(),
        "speed_test": speed_test.as_deref(),
    }))
}

async fn speed_test(State(state): State<AppState>) -> Response {
    let credential = state.upstream.token_for("*");
    let result = state.monitor.probe_speed_test(credential).await;
    if let Err(e) = state.store.save_speed_test(&result) {
        warn!(error = %e, "Failed to persist speed test result");
    }
    Json(result.as_ref()).into_response()
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    range: Option<String>,
}

/// History over `range` (`24h` by default). Storage failures degrade to empty
/// lists.
async fn history(State(state): State<AppState>, Query(params): Query<HistoryParams>) -> Json<Value> {
    let window = params
        .range
        .as_deref()
        .and_then(parse_window)
        .unwrap_or(DEFAULT_HISTORY_WINDOW);

    let statuses = state.store.recent_statuses(window).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load status history");
        Vec::new()
    });
    let speed_tests = state.store.recent_speed_tests(window).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load speed test history");
        Vec::new()
    });

    Json(json!({
        "statuses": statuses,
        "speed_tests": speed_tests,
    }))
}

async fn bandwidth(State(state): State<AppState>) -> Response {
    Json(state.monitor.bandwidth()).into_response()
}

async fn ping(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "pong": true,
        "timestamp": chrono::Utc::now().timestamp_millis(),
        "server_ip": state.monitor.machine_ip().await,
    }))
}
