//! Document ingestion pipeline.
//!
//! One run per document: resolve the source to text, chunk, embed, and
//! replace the document's vectors in one batch. Progress moves 0 -> 10%
//! after chunking and 10 -> 90% as chunk batches complete; the terminal
//! transition sets 100% or records the failure. Temporary downloads are
//! removed whatever the outcome.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use super::chunker;
use super::extract::{self, TextExtractionGateway};
use super::tasks::{DocType, DocumentTaskStore};
use crate::config::KnowledgeConfig;
use crate::embedding::EmbeddingGateway;
use crate::vector::{VectorRecord, VectorStore};

const PROGRESS_AFTER_CHUNKING: f64 = 10.0;
const PROGRESS_EMBED_SPAN: f64 = 80.0;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("download failed: {0}")]
    Download(String),
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("document produced no text")]
    EmptyDocument,
    #[error("document produced no chunks")]
    NoChunks,
    #[error("every chunk failed to embed")]
    AllChunksFailed,
    #[error("vector upsert failed: {0}")]
    Store(String),
}

#[derive(Debug, Clone)]
pub enum DocSource {
    Inline(String),
    Path(PathBuf),
    Url(String),
}

#[derive(Debug, Clone)]
pub struct IngestJob {
    pub doc_id: String,
    pub task_id: String,
    pub user_id: String,
    pub group_id: Option<i64>,
    pub name: String,
    pub doc_type: DocType,
    pub source: DocSource,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestionResult {
    pub total_chunks: usize,
    pub processed_chunks: usize,
    pub failed_chunks: usize,
    pub success_rate: f64,
}

pub struct IngestionPipeline {
    embeddings: Arc<dyn EmbeddingGateway>,
    vectors: Arc<dyn VectorStore>,
    extractor: Arc<dyn TextExtractionGateway>,
    tasks: DocumentTaskStore,
    config: KnowledgeConfig,
    upload_dir: PathBuf,
    client: reqwest::Client,
}

impl IngestionPipeline {
    pub fn new(
        embeddings: Arc<dyn EmbeddingGateway>,
        vectors: Arc<dyn VectorStore>,
        extractor: Arc<dyn TextExtractionGateway>,
        tasks: DocumentTaskStore,
        config: KnowledgeConfig,
        upload_dir: PathBuf,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            embeddings,
            vectors,
            extractor,
            tasks,
            config,
            upload_dir,
            client,
        }
    }

    /// Runs one ingestion job to a terminal task state.
    pub async fn run(&self, job: IngestJob) {
        if let Ok(false) = self.tasks.mark_processing(&job.doc_id).await {
            tracing::warn!("Ingestion job for {} was not claimable", job.doc_id);
        }

        let (text, temp_file) = match self.resolve_source(&job).await {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::error!("Ingestion of {} failed: {}", job.doc_id, err);
                let _ = self.tasks.mark_failed(&job.doc_id, &err.to_string()).await;
                return;
            }
        };

        let outcome = self.process(&job, &text).await;

        if let Some(path) = temp_file {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::debug!("Removed temporary file {}", path.display()),
                Err(err) => tracing::warn!(
                    "Failed to remove temporary file {}: {}",
                    path.display(),
                    err
                ),
            }
        }

        match outcome {
            Ok(result) => {
                let summary = serde_json::to_value(&result).unwrap_or_default();
                if let Err(err) = self.tasks.mark_completed(&job.doc_id, &summary).await {
                    tracing::warn!("Failed to record completion of {}: {}", job.doc_id, err);
                }
                tracing::info!(
                    "Ingested {}: {}/{} chunks ({}% success)",
                    job.doc_id,
                    result.processed_chunks,
                    result.total_chunks,
                    result.success_rate
                );
            }
            Err(err) => {
                tracing::error!("Ingestion of {} failed: {}", job.doc_id, err);
                let _ = self.tasks.mark_failed(&job.doc_id, &err.to_string()).await;
            }
        }
    }

    /// Resolves the job source to raw text, returning the temporary file
    /// path when one was downloaded.
    async fn resolve_source(
        &self,
        job: &IngestJob,
    ) -> Result<(String, Option<PathBuf>), IngestError> {
        match &job.source {
            DocSource::Inline(content) => Ok((content.clone(), None)),
            DocSource::Path(path) => {
                let mime = extract::mime_for_path(path);
                let text = self
                    .extractor
                    .extract(path, mime)
                    .await
                    .map_err(|err| IngestError::Extraction(err.to_string()))?;
                Ok((text, None))
            }
            DocSource::Url(url) => {
                let path =
                    extract::download_to_dir(&self.client, url, &self.upload_dir, &job.doc_id)
                        .await
                        .map_err(|err| IngestError::Download(err.to_string()))?;
                let mime = extract::mime_for_path(&path);
                let text = self
                    .extractor
                    .extract(&path, mime)
                    .await
                    .map_err(|err| IngestError::Extraction(err.to_string()))?;
                Ok((text, Some(path)))
            }
        }
    }

    async fn process(&self, job: &IngestJob, text: &str) -> Result<IngestionResult, IngestError> {
        if text.trim().is_empty() {
            return Err(IngestError::EmptyDocument);
        }

        let chunks = chunker::split(
            text,
            self.config.chunk_size,
            self.config.chunk_overlap,
            self.config.min_chunk_len,
        );
        if chunks.is_empty() {
            return Err(IngestError::NoChunks);
        }

        let total = chunks.len();
        let _ = self
            .tasks
            .set_total_chunks(&job.doc_id, total as i64, PROGRESS_AFTER_CHUNKING)
            .await;

        let mut records: Vec<VectorRecord> = Vec::with_capacity(total);
        let mut processed = 0usize;
        let mut failed = 0usize;
        let batch_size = self.config.embedding_batch_size.max(1);

        for (batch_index, batch) in chunks.chunks(batch_size).enumerate() {
            match self.embeddings.embed_batch(batch).await {
                Ok(embeddings) => {
                    for (chunk, embedding) in batch.iter().zip(embeddings) {
                        if embedding.is_empty() {
                            failed += 1;
                            continue;
                        }
                        records.push(self.build_record(job, chunk, embedding));
                        processed += 1;
                    }
                }
                Err(err) => {
                    failed += batch.len();
                    tracing::warn!(
                        "Embedding batch {} of {} failed: {}",
                        batch_index + 1,
                        job.doc_id,
                        err
                    );
                }
            }

            let done = ((batch_index + 1) * batch_size).min(total);
            let progress =
                PROGRESS_AFTER_CHUNKING + (done as f64 / total as f64) * PROGRESS_EMBED_SPAN;
            let _ = self
                .tasks
                .update_progress(&job.doc_id, processed as i64, failed as i64, progress)
                .await;
        }

        if processed == 0 {
            return Err(IngestError::AllChunksFailed);
        }

        self.vectors
            .upsert_batch(records)
            .await
            .map_err(|err| IngestError::Store(err.to_string()))?;

        Ok(IngestionResult {
            total_chunks: total,
            processed_chunks: processed,
            failed_chunks: failed,
            success_rate: (processed as f64 / total as f64 * 100.0 * 100.0).round() / 100.0,
        })
    }

    fn build_record(&self, job: &IngestJob, chunk: &str, embedding: Vec<f32>) -> VectorRecord {
        let now = Utc::now().to_rfc3339();
        let source_path = match &job.source {
            DocSource::Inline(_) => job.name.clone(),
            DocSource::Path(path) => path.to_string_lossy().to_string(),
            DocSource::Url(url) => url.clone(),
        };

        VectorRecord {
            vector_id: Uuid::new_v4().to_string(),
            doc_id: job.doc_id.clone(),
            content: chunk.to_string(),
            embedding,
            user_id: job.user_id.clone(),
            group_id: job.group_id,
            source_path,
            doc_type: job.doc_type.as_str().to_string(),
            doc_name: job.name.clone(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::embedding::EmbeddingError;
    use crate::ingest::extract::PlainTextExtractor;
    use crate::ingest::tasks::TaskStatus;
    use crate::vector::sqlite::SqliteVectorStore;

    struct CountingEmbedder {
        fail: bool,
    }

    #[async_trait]
    impl EmbeddingGateway for CountingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if self.fail {
                Err(EmbeddingError::Request("down".to_string()))
            } else {
                Ok(vec![1.0, 0.0])
            }
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if self.fail {
                Err(EmbeddingError::Request("down".to_string()))
            } else {
                Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
            }
        }
    }

    async fn test_stores() -> (DocumentTaskStore, Arc<SqliteVectorStore>) {
        let tasks_db = std::env::temp_dir().join(format!(
            "emberlink-pipeline-tasks-{}.db",
            Uuid::new_v4()
        ));
        let vectors_db = std::env::temp_dir().join(format!(
            "emberlink-pipeline-vectors-{}.db",
            Uuid::new_v4()
        ));
        (
            DocumentTaskStore::with_path(tasks_db).await.unwrap(),
            Arc::new(SqliteVectorStore::with_path(vectors_db).await.unwrap()),
        )
    }

    fn pipeline(
        tasks: DocumentTaskStore,
        vectors: Arc<SqliteVectorStore>,
        fail_embeddings: bool,
    ) -> IngestionPipeline {
        IngestionPipeline::new(
            Arc::new(CountingEmbedder {
                fail: fail_embeddings,
            }),
            vectors,
            Arc::new(PlainTextExtractor),
            tasks,
            KnowledgeConfig {
                chunk_size: 500,
                chunk_overlap: 50,
                ..KnowledgeConfig::default()
            },
            std::env::temp_dir(),
        )
    }

    fn job(doc_id: &str, source: DocSource) -> IngestJob {
        IngestJob {
            doc_id: doc_id.to_string(),
            task_id: Uuid::new_v4().to_string(),
            user_id: "u1".to_string(),
            group_id: None,
            name: "doc".to_string(),
            doc_type: DocType::Post,
            source,
        }
    }

    async fn register(tasks: &DocumentTaskStore, job: &IngestJob) {
        tasks
            .create(
                &job.doc_id,
                &job.task_id,
                &job.user_id,
                job.group_id,
                &job.name,
                "inline",
                job.doc_type,
            )
            .await
            .unwrap();
    }

    fn sample_text() -> String {
        "This is a sentence for the ingestion pipeline test. "
            .repeat(30)
            .chars()
            .take(1500)
            .collect()
    }

    #[tokio::test]
    async fn inline_document_completes_with_vectors() {
        let (tasks, vectors) = test_stores().await;
        let pipeline = pipeline(tasks.clone(), vectors.clone(), false);
        let job = job("d1", DocSource::Inline(sample_text()));
        register(&tasks, &job).await;

        pipeline.run(job).await;

        let record = tasks.get("d1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.progress, 100.0);
        assert!((3..=5).contains(&(record.total_chunks as usize)));
        assert_eq!(record.processed_chunks, record.total_chunks);
        assert_eq!(record.failed_chunks, 0);

        let count = vectors.count_for_doc("d1").await.unwrap();
        assert_eq!(count as i64, record.total_chunks);
    }

    #[tokio::test]
    async fn empty_document_fails() {
        let (tasks, vectors) = test_stores().await;
        let pipeline = pipeline(tasks.clone(), vectors, false);
        let job = job("d1", DocSource::Inline("   ".to_string()));
        register(&tasks, &job).await;

        pipeline.run(job).await;

        let record = tasks.get("d1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error_message.is_some());
    }

    #[tokio::test]
    async fn all_embedding_failures_fail_the_job() {
        let (tasks, vectors) = test_stores().await;
        let pipeline = pipeline(tasks.clone(), vectors.clone(), true);
        let job = job("d1", DocSource::Inline(sample_text()));
        register(&tasks, &job).await;

        pipeline.run(job).await;

        let record = tasks.get("d1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        // total_chunks was recorded before any embedding call.
        assert!(record.total_chunks > 0);
        assert_eq!(vectors.count_for_doc("d1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reingest_replaces_previous_vectors() {
        let (tasks, vectors) = test_stores().await;
        let pipeline = pipeline(tasks.clone(), vectors.clone(), false);

        let first = job("d1", DocSource::Inline(sample_text()));
        register(&tasks, &first).await;
        pipeline.run(first).await;
        let first_count = vectors.count_for_doc("d1").await.unwrap();
        assert!(first_count > 0);

        // Shorter second revision: fewer chunks must fully replace the old.
        let second = job(
            "d1",
            DocSource::Inline("One short revision of the document, chunked once.".to_string()),
        );
        register(&tasks, &second).await;
        pipeline.run(second).await;

        let second_count = vectors.count_for_doc("d1").await.unwrap();
        assert_eq!(second_count, 1);
        assert!(second_count < first_count);
    }

    #[tokio::test]
    async fn local_file_source_is_extracted() {
        let (tasks, vectors) = test_stores().await;
        let pipeline = pipeline(tasks.clone(), vectors.clone(), false);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        tokio::fs::write(&path, sample_text()).await.unwrap();

        let job = job("d1", DocSource::Path(path));
        register(&tasks, &job).await;
        pipeline.run(job).await;

        let record = tasks.get("d1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(vectors.count_for_doc("d1").await.unwrap() > 0);
    }
}
