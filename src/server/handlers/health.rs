use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde_json::json;

use crate::state::AppState;

pub async fn health(State(_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime_secs,
        "active_streams": state.registry.active_count(),
        "chat_model": state.config.generation.chat_model,
        "embedding_model": state.config.knowledge.embedding_model,
    }))
}
