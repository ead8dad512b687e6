//! `/health` and `/metrics` on the WebSocket listener.

use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let ws = state.metrics.snapshot();
    Json(serde_json::json!({
        "status": "healthy",
        "active_connections": ws.active_connections,
        "total_connections": ws.total_connections,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let log_stats = match state.sink.stats() {
        Ok(stats) => serde_json::to_value(stats).unwrap_or_default(),
        Err(e) => serde_json::json!({ "error": e.to_string() }),
    };
    Json(serde_json::json!({
        "websocket": state.metrics.snapshot(),
        "bus": state.bus.metrics(),
        "event_log": log_stats,
        "active_subscribers": state.bus.list_active().await.len(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
