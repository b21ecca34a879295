//! Chat endpoints: streaming SSE, non-streaming, and cancellation.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::chat::coordinator::{ChatTurn, StreamEvent};
use crate::errors::ApiError;
use crate::retrieval::decision::SearchStrategy;
use crate::retrieval::fusion::{self, FusionConfig};
use crate::state::AppState;
use crate::vector::SearchFilters;

fn default_user() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub session_id: Option<String>,
    #[serde(default = "default_user")]
    pub user_id: String,
    #[serde(default = "default_true")]
    pub use_knowledge_base: bool,
    #[serde(default)]
    pub use_web_search: bool,
    pub strategy: Option<SearchStrategy>,
    pub group_id: Option<i64>,
}

/// Shared prelude for both chat endpoints: validates the request, resolves
/// the session, runs retrieval and fusion, and assembles the turn.
async fn prepare_turn(state: &Arc<AppState>, request: &ChatRequest) -> Result<ChatTurn, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }

    let session_id = match &request.session_id {
        Some(session_id) => {
            state
                .history
                .get_session(session_id)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("session not found: {}", session_id)))?;
            session_id.clone()
        }
        None => {
            let title: String = request.message.trim().chars().take(50).collect();
            state
                .history
                .create_session(&request.user_id, Some(title))
                .await?
        }
    };

    let strategy = request
        .strategy
        .unwrap_or_else(|| SearchStrategy::from_flags(request.use_knowledge_base, request.use_web_search));
    let scope = SearchFilters {
        user_id: Some(request.user_id.clone()),
        group_id: request.group_id,
    };

    let outcome = state
        .decision
        .decide_and_fetch(&request.message, strategy, &scope)
        .await;
    tracing::debug!("Retrieval decision: {}", outcome.reasoning);

    let context = fusion::fuse(
        &outcome.knowledge_hits,
        &outcome.web_hits,
        state.config.search.max_context_results,
        &FusionConfig::from(&state.config.search),
    );

    Ok(ChatTurn {
        session_id,
        request_id: Uuid::new_v4().to_string(),
        user_message: request.message.clone(),
        outcome,
        context,
    })
}

pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let turn = prepare_turn(&state, &request).await?;

    let (tx, rx) = mpsc::channel::<StreamEvent>(64);
    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        coordinator.run(turn, tx).await;
    });

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((Ok::<_, Infallible>(sse_event(event)), rx))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let turn = prepare_turn(&state, &request).await?;
    let knowledge_sources = turn.outcome.knowledge_hits.clone();
    let web_search_results = turn.outcome.web_hits.clone();

    let completion = state.coordinator.complete(turn).await?;

    Ok(Json(json!({
        "message": completion.message,
        "session_id": completion.session_id,
        "knowledge_sources": knowledge_sources,
        "web_search_results": web_search_results,
        "response_time_ms": completion.elapsed_ms,
    })))
}

pub async fn cancel_stream(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.registry.request_cancellation(&request_id)? {
        return Err(ApiError::NotFound(format!(
            "no active stream for request: {}",
            request_id
        )));
    }

    Ok(Json(json!({"success": true, "request_id": request_id})))
}

fn sse_event(event: StreamEvent) -> Event {
    let payload = match event {
        StreamEvent::RequestId { request_id } => {
            json!({"type": "request_id", "request_id": request_id})
        }
        StreamEvent::Start { session_id } => json!({"type": "start", "session_id": session_id}),
        StreamEvent::Content { text } => json!({"type": "content", "content": text}),
        StreamEvent::Thinking { text } => json!({"type": "think", "content": text}),
        StreamEvent::TitleUpdate { title } => json!({"type": "title", "title": title}),
        StreamEvent::End { elapsed_ms } => json!({"type": "end", "response_time_ms": elapsed_ms}),
        StreamEvent::Cancelled => json!({"type": "cancelled"}),
        StreamEvent::Error { message } => json!({"type": "error", "error": message}),
    };

    Event::default().data(payload.to_string())
}
