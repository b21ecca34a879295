//! SQLite-backed vector store.
//!
//! In-process store using SQLite for chunk rows and brute-force cosine
//! similarity for search. Replace-by-document runs inside a single
//! transaction, so searchers never observe a half-applied generation.

use std::path::PathBuf;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use super::{SearchFilters, VectorRecord, VectorStore};
use crate::config::AppPaths;
use crate::errors::ApiError;
use crate::retrieval::{HitOrigin, RetrievalHit};

pub struct SqliteVectorStore {
    pool: SqlitePool,
    #[allow(dead_code)]
    db_path: PathBuf,
}

impl SqliteVectorStore {
    pub async fn new(paths: &AppPaths) -> Result<Self, ApiError> {
        Self::with_path(paths.knowledge_db_path.clone()).await
    }

    pub async fn with_path(db_path: PathBuf) -> Result<Self, ApiError> {
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(ApiError::internal)?;

        let store = Self { pool, db_path };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), ApiError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kb_vectors (
                vector_id TEXT PRIMARY KEY,
                doc_id TEXT NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL,
                user_id TEXT NOT NULL DEFAULT '',
                group_id INTEGER,
                source_path TEXT NOT NULL DEFAULT '',
                doc_type TEXT NOT NULL DEFAULT '',
                doc_name TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
                updated_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_kb_vectors_doc_id ON kb_vectors(doc_id)")
            .execute(&self.pool)
            .await
            .map_err(ApiError::internal)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_kb_vectors_user_id ON kb_vectors(user_id)")
            .execute(&self.pool)
            .await
            .map_err(ApiError::internal)?;

        Ok(())
    }

    fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }

        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        let denom = norm_a * norm_b;

        if denom <= f32::EPSILON {
            0.0
        } else {
            dot / denom
        }
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert_batch(&self, records: Vec<VectorRecord>) -> Result<(), ApiError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut doc_ids: Vec<&str> = records.iter().map(|r| r.doc_id.as_str()).collect();
        doc_ids.sort_unstable();
        doc_ids.dedup();

        let mut tx = self.pool.begin().await.map_err(ApiError::internal)?;

        for doc_id in doc_ids {
            sqlx::query("DELETE FROM kb_vectors WHERE doc_id = ?1")
                .bind(doc_id)
                .execute(&mut *tx)
                .await
                .map_err(ApiError::internal)?;
        }

        for record in &records {
            let blob = Self::serialize_embedding(&record.embedding);
            sqlx::query(
                "INSERT INTO kb_vectors
                    (vector_id, doc_id, content, embedding, user_id, group_id,
                     source_path, doc_type, doc_name, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )
            .bind(&record.vector_id)
            .bind(&record.doc_id)
            .bind(&record.content)
            .bind(&blob)
            .bind(&record.user_id)
            .bind(record.group_id)
            .bind(&record.source_path)
            .bind(&record.doc_type)
            .bind(&record.doc_name)
            .bind(&record.created_at)
            .bind(&record.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::internal)?;
        }

        tx.commit().await.map_err(ApiError::internal)?;
        Ok(())
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        similarity_threshold: f32,
        filters: &SearchFilters,
    ) -> Result<Vec<RetrievalHit>, ApiError> {
        let rows = sqlx::query(
            "SELECT content, embedding, doc_name, source_path
             FROM kb_vectors
             WHERE (?1 IS NULL OR user_id = ?1)
               AND (?2 IS NULL OR group_id = ?2)",
        )
        .bind(filters.user_id.as_deref())
        .bind(filters.group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        let mut scored: Vec<RetrievalHit> = rows
            .iter()
            .filter_map(|row| {
                let embedding_bytes: Vec<u8> = row.get("embedding");
                if embedding_bytes.is_empty() {
                    return None;
                }
                let stored = Self::deserialize_embedding(&embedding_bytes);
                let score = Self::cosine_similarity(query_embedding, &stored);
                if score < similarity_threshold {
                    return None;
                }

                Some(RetrievalHit {
                    content: row.get("content"),
                    score,
                    origin: HitOrigin::KnowledgeBase,
                    title: row.get("doc_name"),
                    locator: row.get("source_path"),
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k.max(1));

        Ok(scored)
    }

    async fn delete_by_doc_id(&self, doc_id: &str) -> Result<usize, ApiError> {
        let result = sqlx::query("DELETE FROM kb_vectors WHERE doc_id = ?1")
            .bind(doc_id)
            .execute(&self.pool)
            .await
            .map_err(ApiError::internal)?;

        Ok(result.rows_affected() as usize)
    }

    async fn count_for_doc(&self, doc_id: &str) -> Result<usize, ApiError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kb_vectors WHERE doc_id = ?1")
            .bind(doc_id)
            .fetch_one(&self.pool)
            .await
            .map_err(ApiError::internal)?;

        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteVectorStore {
        let tmp = std::env::temp_dir().join(format!(
            "emberlink-vectors-test-{}.db",
            uuid::Uuid::new_v4()
        ));
        SqliteVectorStore::with_path(tmp).await.unwrap()
    }

    fn record(vector_id: &str, doc_id: &str, content: &str, embedding: Vec<f32>) -> VectorRecord {
        VectorRecord {
            vector_id: vector_id.to_string(),
            doc_id: doc_id.to_string(),
            content: content.to_string(),
            embedding,
            user_id: "u1".to_string(),
            group_id: None,
            source_path: "doc.txt".to_string(),
            doc_type: "file".to_string(),
            doc_name: "doc".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[tokio::test]
    async fn upsert_and_search() {
        let store = test_store().await;
        store
            .upsert_batch(vec![record("v1", "d1", "rust ownership", vec![1.0, 0.0])])
            .await
            .unwrap();

        let hits = store
            .search(&[1.0, 0.0], 10, 0.5, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].origin, HitOrigin::KnowledgeBase);
        assert!(hits[0].score > 0.99);
    }

    #[tokio::test]
    async fn reingest_replaces_prior_generation() {
        let store = test_store().await;
        store
            .upsert_batch(vec![
                record("v1", "d1", "old a", vec![1.0, 0.0]),
                record("v2", "d1", "old b", vec![1.0, 0.0]),
                record("v3", "d1", "old c", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();
        assert_eq!(store.count_for_doc("d1").await.unwrap(), 3);

        store
            .upsert_batch(vec![
                record("v4", "d1", "new a", vec![0.0, 1.0]),
                record("v5", "d1", "new b", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        // Exactly the second generation remains, never the sum of both.
        assert_eq!(store.count_for_doc("d1").await.unwrap(), 2);
        let hits = store
            .search(&[0.0, 1.0], 10, 0.5, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.content.starts_with("new")));
    }

    #[tokio::test]
    async fn replace_leaves_other_documents_alone() {
        let store = test_store().await;
        store
            .upsert_batch(vec![record("v1", "d1", "doc one", vec![1.0])])
            .await
            .unwrap();
        store
            .upsert_batch(vec![record("v2", "d2", "doc two", vec![1.0])])
            .await
            .unwrap();

        assert_eq!(store.count_for_doc("d1").await.unwrap(), 1);
        assert_eq!(store.count_for_doc("d2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn search_applies_scope_filters_and_threshold() {
        let store = test_store().await;
        let mut other_user = record("v2", "d2", "other user", vec![1.0, 0.0]);
        other_user.user_id = "u2".to_string();
        let mut grouped = record("v3", "d3", "grouped", vec![1.0, 0.0]);
        grouped.group_id = Some(7);

        store
            .upsert_batch(vec![
                record("v1", "d1", "mine", vec![1.0, 0.0]),
                other_user,
                grouped,
            ])
            .await
            .unwrap();

        let filters = SearchFilters {
            user_id: Some("u1".to_string()),
            group_id: None,
        };
        let hits = store.search(&[1.0, 0.0], 10, 0.5, &filters).await.unwrap();
        assert_eq!(hits.len(), 2);

        let filters = SearchFilters {
            user_id: Some("u1".to_string()),
            group_id: Some(7),
        };
        let hits = store.search(&[1.0, 0.0], 10, 0.5, &filters).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "grouped");

        // Orthogonal vector scores 0.0 and falls below the threshold.
        let hits = store
            .search(&[0.0, 1.0], 10, 0.5, &SearchFilters::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn delete_by_doc_id_removes_all_chunks() {
        let store = test_store().await;
        store
            .upsert_batch(vec![
                record("v1", "d1", "a", vec![1.0]),
                record("v2", "d1", "b", vec![1.0]),
            ])
            .await
            .unwrap();

        let deleted = store.delete_by_doc_id("d1").await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.count_for_doc("d1").await.unwrap(), 0);
    }
}
