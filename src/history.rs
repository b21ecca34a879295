//! Conversation history store: sessions and ordered messages.
//!
//! Message ordering uses a per-session `sequence_number` assigned inside the
//! append transaction, never timestamps. SQLite's single-writer model plus
//! the UNIQUE(session_id, sequence_number) index keep the sequence strictly
//! increasing under concurrent appends to the same session.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::errors::ApiError;

const SCHEMA_VERSION: i64 = 1;
const MAX_HISTORY_LIMIT: i64 = 1000;
const MAX_TITLE_LEN: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDetail {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A message to append; ids, sequence numbers and timestamps are assigned by
/// the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: String,
    pub content: String,
    pub request_id: Option<String>,
    pub knowledge_sources: Option<Value>,
    pub web_search_results: Option<Value>,
    pub thinking: Option<String>,
}

impl NewMessage {
    pub fn user(content: &str, request_id: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
            request_id: Some(request_id.to_string()),
            knowledge_sources: None,
            web_search_results: None,
            thinking: None,
        }
    }

    pub fn assistant(content: &str, request_id: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.to_string(),
            request_id: Some(request_id.to_string()),
            knowledge_sources: None,
            web_search_results: None,
            thinking: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub request_id: Option<String>,
    pub role: String,
    pub content: String,
    pub sequence_number: i64,
    pub knowledge_sources: Option<Value>,
    pub web_search_results: Option<Value>,
    pub thinking: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    pub async fn new(db_path: PathBuf) -> Result<Self, ApiError> {
        let connect_options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(connect_options)
            .await
            .map_err(ApiError::internal)?;

        let store = Self { pool };
        store.init_db().await?;
        Ok(store)
    }

    async fn init_db(&self) -> Result<(), ApiError> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await
            .map_err(ApiError::internal)?;

        if version != SCHEMA_VERSION {
            self.rebuild_schema().await?;
        }

        Ok(())
    }

    async fn rebuild_schema(&self) -> Result<(), ApiError> {
        let mut tx = self.pool.begin().await.map_err(ApiError::internal)?;

        sqlx::query("DROP TABLE IF EXISTS messages")
            .execute(&mut *tx)
            .await
            .map_err(ApiError::internal)?;
        sqlx::query("DROP TABLE IF EXISTS sessions")
            .execute(&mut *tx)
            .await
            .map_err(ApiError::internal)?;

        sqlx::query(
            "\
            CREATE TABLE sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL CHECK(length(trim(title)) > 0),
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
                updated_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
                is_active INTEGER NOT NULL DEFAULT 1
            )",
        )
        .execute(&mut *tx)
        .await
        .map_err(ApiError::internal)?;

        sqlx::query(
            "\
            CREATE TABLE messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                request_id TEXT,
                role TEXT NOT NULL CHECK(role IN ('user', 'assistant', 'system')),
                content TEXT NOT NULL,
                sequence_number INTEGER NOT NULL,
                knowledge_sources TEXT,
                web_search_results TEXT,
                thinking TEXT,
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE,
                UNIQUE (session_id, sequence_number)
            )",
        )
        .execute(&mut *tx)
        .await
        .map_err(ApiError::internal)?;

        sqlx::query("CREATE INDEX idx_sessions_user ON sessions(user_id, updated_at DESC)")
            .execute(&mut *tx)
            .await
            .map_err(ApiError::internal)?;
        sqlx::query(
            "CREATE INDEX idx_messages_session_seq ON messages(session_id, sequence_number)",
        )
        .execute(&mut *tx)
        .await
        .map_err(ApiError::internal)?;

        let pragma = format!("PRAGMA user_version = {}", SCHEMA_VERSION);
        sqlx::query(&pragma)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::internal)?;

        tx.commit().await.map_err(ApiError::internal)?;
        Ok(())
    }

    pub async fn create_session(
        &self,
        user_id: &str,
        title: Option<String>,
    ) -> Result<String, ApiError> {
        let session_id = Uuid::new_v4().to_string();
        let title = normalize_title(title);

        sqlx::query("INSERT INTO sessions (id, user_id, title) VALUES (?1, ?2, ?3)")
            .bind(&session_id)
            .bind(user_id)
            .bind(title)
            .execute(&self.pool)
            .await
            .map_err(ApiError::internal)?;

        Ok(session_id)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionDetail>, ApiError> {
        let row = sqlx::query(
            "SELECT id, user_id, title, created_at, updated_at
             FROM sessions WHERE id = ?1 AND is_active = 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        row.map(session_detail_from_row)
            .transpose()
            .map_err(ApiError::internal)
    }

    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<SessionInfo>, ApiError> {
        let rows = sqlx::query(
            "\
            SELECT s.id, s.user_id, s.title, s.created_at, s.updated_at,
                   (SELECT COUNT(*) FROM messages WHERE session_id = s.id) as message_count
            FROM sessions s
            WHERE s.user_id = ?1 AND s.is_active = 1
            ORDER BY s.updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        rows.into_iter()
            .map(session_info_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(ApiError::internal)
    }

    pub async fn update_session_title(
        &self,
        session_id: &str,
        title: &str,
    ) -> Result<bool, ApiError> {
        let title = normalize_title(Some(title.to_string()));

        let result = sqlx::query(
            "UPDATE sessions SET title = ?1, updated_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE id = ?2",
        )
        .bind(title)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(result.rows_affected() > 0)
    }

    /// Soft delete: the session disappears from listings but its rows stay.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool, ApiError> {
        let result = sqlx::query(
            "UPDATE sessions SET is_active = 0, updated_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE id = ?1 AND is_active = 1",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn message_count(&self, session_id: &str) -> Result<i64, ApiError> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE session_id = ?1")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await
            .map_err(ApiError::internal)
    }

    /// Appends messages in order, assigning consecutive sequence numbers
    /// starting after the session's current maximum. Returns the assigned
    /// numbers. The whole append is one transaction.
    pub async fn append(
        &self,
        session_id: &str,
        messages: &[NewMessage],
    ) -> Result<Vec<i64>, ApiError> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await.map_err(ApiError::internal)?;

        // Touching the session first makes this transaction a writer before
        // it reads the current maximum, so concurrent appends serialize on
        // the database write lock instead of racing the max lookup. The
        // update also doubles as the existence check.
        let touched = sqlx::query(
            "UPDATE sessions SET updated_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = ?1",
        )
        .bind(session_id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::internal)?;
        if touched.rows_affected() == 0 {
            return Err(ApiError::NotFound(format!(
                "session not found: {}",
                session_id
            )));
        }

        let max_seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence_number), 0) FROM messages WHERE session_id = ?1",
        )
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(ApiError::internal)?;

        let mut assigned = Vec::with_capacity(messages.len());
        for (offset, message) in messages.iter().enumerate() {
            let sequence = max_seq + 1 + offset as i64;
            let knowledge = serialize_opt(&message.knowledge_sources)?;
            let web = serialize_opt(&message.web_search_results)?;

            sqlx::query(
                "\
                INSERT INTO messages
                    (id, session_id, request_id, role, content, sequence_number,
                     knowledge_sources, web_search_results, thinking)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(session_id)
            .bind(&message.request_id)
            .bind(normalize_role(&message.role))
            .bind(&message.content)
            .bind(sequence)
            .bind(knowledge)
            .bind(web)
            .bind(&message.thinking)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::internal)?;

            assigned.push(sequence);
        }

        tx.commit().await.map_err(ApiError::internal)?;
        Ok(assigned)
    }

    /// Returns the most recent `limit` messages in sequence order.
    pub async fn read(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<StoredMessage>, ApiError> {
        let limit = sanitize_limit(limit);

        let rows = sqlx::query(
            "\
            SELECT id, session_id, request_id, role, content, sequence_number,
                   knowledge_sources, web_search_results, thinking, created_at
            FROM (
                SELECT * FROM messages
                WHERE session_id = ?1
                ORDER BY sequence_number DESC
                LIMIT ?2
            )
            ORDER BY sequence_number ASC",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        rows.into_iter()
            .map(stored_message_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(ApiError::internal)
    }
}

fn serialize_opt(value: &Option<Value>) -> Result<Option<String>, ApiError> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(ApiError::internal))
        .transpose()
}

fn session_info_from_row(row: sqlx::sqlite::SqliteRow) -> Result<SessionInfo, sqlx::Error> {
    Ok(SessionInfo {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        message_count: row.try_get("message_count")?,
    })
}

fn session_detail_from_row(row: sqlx::sqlite::SqliteRow) -> Result<SessionDetail, sqlx::Error> {
    Ok(SessionDetail {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn stored_message_from_row(row: sqlx::sqlite::SqliteRow) -> Result<StoredMessage, sqlx::Error> {
    let knowledge_sources: Option<String> = row.try_get("knowledge_sources")?;
    let web_search_results: Option<String> = row.try_get("web_search_results")?;

    Ok(StoredMessage {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        request_id: row.try_get("request_id")?,
        role: row.try_get("role")?,
        content: row.try_get("content")?,
        sequence_number: row.try_get("sequence_number")?,
        knowledge_sources: knowledge_sources.and_then(|raw| serde_json::from_str(&raw).ok()),
        web_search_results: web_search_results.and_then(|raw| serde_json::from_str(&raw).ok()),
        thinking: row.try_get("thinking")?,
        created_at: row.try_get("created_at")?,
    })
}

fn sanitize_limit(limit: i64) -> i64 {
    if limit <= 0 {
        return 1;
    }
    limit.min(MAX_HISTORY_LIMIT)
}

fn normalize_role(role: &str) -> &'static str {
    match role {
        "assistant" => "assistant",
        "system" => "system",
        _ => "user",
    }
}

fn normalize_title(title: Option<String>) -> String {
    let Some(raw) = title else {
        return "New Session".to_string();
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "New Session".to_string();
    }

    trimmed.chars().take(MAX_TITLE_LEN).collect()
}
