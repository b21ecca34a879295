//! Vector store abstraction for the knowledge base.
//!
//! The usage protocol matters more than the backend: upserting a batch
//! replaces every existing vector that shares a document id, so a document
//! is always represented by exactly one generation of chunks.

pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ApiError;
use crate::retrieval::RetrievalHit;

/// One embedded chunk as stored in the knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Unique per chunk.
    pub vector_id: String,
    /// Shared by every chunk of the same document.
    pub doc_id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub user_id: String,
    pub group_id: Option<i64>,
    pub source_path: String,
    pub doc_type: String,
    pub doc_name: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Ownership scoping applied to similarity search.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub user_id: Option<String>,
    pub group_id: Option<i64>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Inserts the batch, first removing any existing vectors for the
    /// document ids it contains. The replacement must be atomic from a
    /// concurrent searcher's point of view.
    async fn upsert_batch(&self, records: Vec<VectorRecord>) -> Result<(), ApiError>;

    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        similarity_threshold: f32,
        filters: &SearchFilters,
    ) -> Result<Vec<RetrievalHit>, ApiError>;

    async fn delete_by_doc_id(&self, doc_id: &str) -> Result<usize, ApiError>;

    async fn count_for_doc(&self, doc_id: &str) -> Result<usize, ApiError>;
}
