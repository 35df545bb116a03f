//! HTTP request handlers.

use crate::server::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

/// Health check handler.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Keystore size, iteration counters and connected workers.
pub async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.coordinator.status().await;
    let workers = state.transport.connected_clients().await;

    Json(json!({
        "status": "ok",
        "workers": workers,
        "coordinator": status,
    }))
}

/// Test stop: persist variable state once and reset iteration counters.
pub async fn handle_test_stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.coordinator.on_test_stop().await {
        Ok(()) => (StatusCode::OK, Json(json!({"success": true}))),
        Err(e) => {
            warn!("test stop failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "error": e.to_string()})),
            )
        }
    }
}
