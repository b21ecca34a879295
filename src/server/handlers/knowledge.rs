//! Knowledge base endpoints: document submission, task status, progress
//! streaming, and deletion.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;
use uuid::Uuid;

use crate::errors::ApiError;
use crate::ingest::pipeline::{DocSource, IngestJob};
use crate::ingest::tasks::DocType;
use crate::state::AppState;

fn default_user() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize)]
pub struct CreateDocumentRequest {
    pub doc_id: Option<String>,
    pub name: String,
    #[serde(default = "default_user")]
    pub user_id: String,
    pub group_id: Option<i64>,
    pub doc_type: DocType,
    /// Inline content for `post` documents.
    pub content: Option<String>,
    /// Local path or URL for `file` and `url` documents.
    pub source: Option<String>,
}

pub async fn create_document(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateDocumentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (source, source_label) = match payload.doc_type {
        DocType::Post => {
            let content = payload
                .content
                .as_deref()
                .filter(|content| !content.trim().is_empty())
                .ok_or_else(|| {
                    ApiError::BadRequest("post documents require content".to_string())
                })?;
            (DocSource::Inline(content.to_string()), payload.name.clone())
        }
        DocType::File => {
            let path = payload
                .source
                .as_deref()
                .filter(|source| !source.trim().is_empty())
                .ok_or_else(|| {
                    ApiError::BadRequest("file documents require a source path".to_string())
                })?;
            (DocSource::Path(PathBuf::from(path)), path.to_string())
        }
        DocType::Url => {
            let url = payload
                .source
                .as_deref()
                .filter(|source| !source.trim().is_empty())
                .ok_or_else(|| {
                    ApiError::BadRequest("url documents require a source url".to_string())
                })?;
            (DocSource::Url(url.to_string()), url.to_string())
        }
    };

    let doc_id = payload
        .doc_id
        .filter(|doc_id| !doc_id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let task_id = Uuid::new_v4().to_string();

    state
        .tasks
        .create(
            &doc_id,
            &task_id,
            &payload.user_id,
            payload.group_id,
            &payload.name,
            &source_label,
            payload.doc_type,
        )
        .await?;

    state.ingest.submit(IngestJob {
        doc_id: doc_id.clone(),
        task_id: task_id.clone(),
        user_id: payload.user_id,
        group_id: payload.group_id,
        name: payload.name,
        doc_type: payload.doc_type,
        source,
    })?;

    Ok(Json(json!({
        "doc_id": doc_id,
        "task_id": task_id,
        "status": "pending",
    })))
}

pub async fn get_document(
    State(state): State<Arc<AppState>>,
    Path(doc_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .tasks
        .get(&doc_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("document not found: {}", doc_id)))?;

    Ok(Json(json!({"document": record})))
}

/// SSE stream of task progress, polled until the task reaches a terminal
/// state.
pub async fn document_progress(
    State(state): State<Arc<AppState>>,
    Path(doc_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .tasks
        .get(&doc_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("document not found: {}", doc_id)))?;

    let stream = futures_util::stream::unfold(Some(()), move |continuation| {
        let state = state.clone();
        let doc_id = doc_id.clone();
        async move {
            continuation?;

            match state.tasks.get(&doc_id).await {
                Ok(Some(record)) => {
                    let terminal = record.status.is_terminal();
                    let event = Event::default().event("progress").data(
                        json!({
                            "doc_id": record.doc_id,
                            "status": record.status,
                            "progress": record.progress,
                            "total_chunks": record.total_chunks,
                            "processed_chunks": record.processed_chunks,
                            "failed_chunks": record.failed_chunks,
                            "error_message": record.error_message,
                        })
                        .to_string(),
                    );

                    if terminal {
                        Some((Ok::<_, Infallible>(event), None))
                    } else {
                        sleep(Duration::from_secs(1)).await;
                        Some((Ok::<_, Infallible>(event), Some(())))
                    }
                }
                _ => {
                    let event = Event::default()
                        .event("error")
                        .data(json!({"error": "document not found"}).to_string());
                    Some((Ok::<_, Infallible>(event), None))
                }
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

/// Removes the document's vectors and its task record.
pub async fn delete_document(
    State(state): State<Arc<AppState>>,
    Path(doc_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .tasks
        .get(&doc_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("document not found: {}", doc_id)))?;

    let deleted_vectors = state.vectors.delete_by_doc_id(&doc_id).await?;
    state.tasks.delete(&doc_id).await?;

    Ok(Json(json!({
        "success": true,
        "doc_id": doc_id,
        "deleted_vectors": deleted_vectors,
    })))
}
