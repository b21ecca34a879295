//! Ingestion task records.
//!
//! One row per document id tracks the lifecycle of its latest ingestion:
//! pending -> processing -> completed | failed. Terminal states are guarded
//! in SQL and never reverted; re-submitting a document id resets its row to
//! pending for the new run.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::config::AppPaths;
use crate::errors::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    fn parse(raw: &str) -> TaskStatus {
        match raw {
            "processing" => TaskStatus::Processing,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    File,
    Post,
    Url,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::File => "file",
            DocType::Post => "post",
            DocType::Url => "url",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KbDocumentRecord {
    pub doc_id: String,
    pub task_id: String,
    pub user_id: String,
    pub group_id: Option<i64>,
    pub name: String,
    pub source: String,
    pub doc_type: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub total_chunks: i64,
    pub processed_chunks: i64,
    pub failed_chunks: i64,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct DocumentTaskStore {
    pool: SqlitePool,
}

impl DocumentTaskStore {
    pub async fn new(paths: &AppPaths) -> Result<Self, ApiError> {
        Self::with_path(paths.knowledge_db_path.clone()).await
    }

    pub async fn with_path(db_path: PathBuf) -> Result<Self, ApiError> {
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(ApiError::internal)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), ApiError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kb_documents (
                doc_id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                user_id TEXT NOT NULL DEFAULT '',
                group_id INTEGER,
                name TEXT NOT NULL DEFAULT '',
                source TEXT NOT NULL DEFAULT '',
                doc_type TEXT NOT NULL DEFAULT 'file',
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK(status IN ('pending', 'processing', 'completed', 'failed')),
                progress REAL NOT NULL DEFAULT 0,
                total_chunks INTEGER NOT NULL DEFAULT 0,
                processed_chunks INTEGER NOT NULL DEFAULT 0,
                failed_chunks INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                result TEXT,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_kb_documents_user ON kb_documents(user_id)")
            .execute(&self.pool)
            .await
            .map_err(ApiError::internal)?;

        Ok(())
    }

    /// Creates a pending record, resetting any prior run of the same
    /// document id.
    pub async fn create(
        &self,
        doc_id: &str,
        task_id: &str,
        user_id: &str,
        group_id: Option<i64>,
        name: &str,
        source: &str,
        doc_type: DocType,
    ) -> Result<(), ApiError> {
        sqlx::query(
            "\
            INSERT INTO kb_documents (doc_id, task_id, user_id, group_id, name, source, doc_type)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(doc_id) DO UPDATE SET
                task_id = excluded.task_id,
                user_id = excluded.user_id,
                group_id = excluded.group_id,
                name = excluded.name,
                source = excluded.source,
                doc_type = excluded.doc_type,
                status = 'pending',
                progress = 0,
                total_chunks = 0,
                processed_chunks = 0,
                failed_chunks = 0,
                error_message = NULL,
                result = NULL,
                started_at = NULL,
                completed_at = NULL",
        )
        .bind(doc_id)
        .bind(task_id)
        .bind(user_id)
        .bind(group_id)
        .bind(name)
        .bind(source)
        .bind(doc_type.as_str())
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(())
    }

    /// Claims a pending task. Returns false when the record is missing or
    /// already claimed.
    pub async fn mark_processing(&self, doc_id: &str) -> Result<bool, ApiError> {
        let result = sqlx::query(
            "UPDATE kb_documents
             SET status = 'processing', started_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE doc_id = ?1 AND status = 'pending'",
        )
        .bind(doc_id)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_total_chunks(
        &self,
        doc_id: &str,
        total_chunks: i64,
        progress: f64,
    ) -> Result<(), ApiError> {
        sqlx::query(
            "UPDATE kb_documents SET total_chunks = ?2, progress = ?3
             WHERE doc_id = ?1 AND status = 'processing'",
        )
        .bind(doc_id)
        .bind(total_chunks)
        .bind(progress)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(())
    }

    pub async fn update_progress(
        &self,
        doc_id: &str,
        processed_chunks: i64,
        failed_chunks: i64,
        progress: f64,
    ) -> Result<(), ApiError> {
        sqlx::query(
            "UPDATE kb_documents SET processed_chunks = ?2, failed_chunks = ?3, progress = ?4
             WHERE doc_id = ?1 AND status = 'processing'",
        )
        .bind(doc_id)
        .bind(processed_chunks)
        .bind(failed_chunks)
        .bind(progress)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(())
    }

    /// Terminal transition; a no-op when the record already reached a
    /// terminal state.
    pub async fn mark_completed(
        &self,
        doc_id: &str,
        result: &serde_json::Value,
    ) -> Result<(), ApiError> {
        let payload = serde_json::to_string(result).map_err(ApiError::internal)?;

        sqlx::query(
            "UPDATE kb_documents
             SET status = 'completed', progress = 100.0, result = ?2,
                 completed_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE doc_id = ?1 AND status NOT IN ('completed', 'failed')",
        )
        .bind(doc_id)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(())
    }

    /// Terminal transition; a no-op when the record already reached a
    /// terminal state.
    pub async fn mark_failed(&self, doc_id: &str, error_message: &str) -> Result<(), ApiError> {
        sqlx::query(
            "UPDATE kb_documents
             SET status = 'failed', error_message = ?2,
                 completed_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE doc_id = ?1 AND status NOT IN ('completed', 'failed')",
        )
        .bind(doc_id)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(())
    }

    pub async fn get(&self, doc_id: &str) -> Result<Option<KbDocumentRecord>, ApiError> {
        let row = sqlx::query("SELECT * FROM kb_documents WHERE doc_id = ?1")
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ApiError::internal)?;

        row.map(record_from_row)
            .transpose()
            .map_err(ApiError::internal)
    }

    pub async fn delete(&self, doc_id: &str) -> Result<bool, ApiError> {
        let result = sqlx::query("DELETE FROM kb_documents WHERE doc_id = ?1")
            .bind(doc_id)
            .execute(&self.pool)
            .await
            .map_err(ApiError::internal)?;

        Ok(result.rows_affected() > 0)
    }
}

fn record_from_row(row: sqlx::sqlite::SqliteRow) -> Result<KbDocumentRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let result: Option<String> = row.try_get("result")?;

    Ok(KbDocumentRecord {
        doc_id: row.try_get("doc_id")?,
        task_id: row.try_get("task_id")?,
        user_id: row.try_get("user_id")?,
        group_id: row.try_get("group_id")?,
        name: row.try_get("name")?,
        source: row.try_get("source")?,
        doc_type: row.try_get("doc_type")?,
        status: TaskStatus::parse(&status),
        progress: row.try_get("progress")?,
        total_chunks: row.try_get("total_chunks")?,
        processed_chunks: row.try_get("processed_chunks")?,
        failed_chunks: row.try_get("failed_chunks")?,
        error_message: row.try_get("error_message")?,
        result: result.and_then(|raw| serde_json::from_str(&raw).ok()),
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
    })
}
