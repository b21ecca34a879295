//! Session and message CRUD.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: String,
    pub title: Option<String>,
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = params
        .get("user_id")
        .cloned()
        .unwrap_or_else(|| "default".to_string());

    let sessions = state.history.list_sessions(&user_id).await?;
    Ok(Json(json!({"sessions": sessions})))
}

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = state
        .history
        .create_session(&payload.user_id, payload.title)
        .await?;
    let session = state.history.get_session(&session_id).await?;
    Ok(Json(json!({"session": session})))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .history
        .get_session(&session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("session not found".to_string()))?;

    Ok(Json(json!({"session": session})))
}

pub async fn get_session_messages(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .history
        .get_session(&session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("session not found".to_string()))?;

    let limit = params
        .get("limit")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(100);

    let messages = state.history.read(&session_id, limit).await?;
    let formatted: Vec<Value> = messages
        .into_iter()
        .map(|message| {
            json!({
                "id": message.id,
                "request_id": message.request_id,
                "role": message.role,
                "content": message.content,
                "sequence_number": message.sequence_number,
                "knowledge_sources": message.knowledge_sources,
                "web_search_results": message.web_search_results,
                "thinking": message.thinking,
                "created_at": message.created_at,
            })
        })
        .collect();

    Ok(Json(json!({"messages": formatted})))
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.history.delete_session(&session_id).await? {
        return Err(ApiError::NotFound("session not found".to_string()));
    }
    Ok(Json(json!({"success": true})))
}
