use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::chat::coordinator::StreamingResponseCoordinator;
use crate::chat::registry::ActiveStreamRegistry;
use crate::config::{AppConfig, AppPaths};
use crate::embedding::HttpEmbeddingClient;
use crate::history::HistoryStore;
use crate::ingest::extract::PlainTextExtractor;
use crate::ingest::pipeline::IngestionPipeline;
use crate::ingest::queue::IngestQueue;
use crate::ingest::tasks::DocumentTaskStore;
use crate::llm::HttpLlmClient;
use crate::retrieval::decision::SearchDecisionEngine;
use crate::vector::sqlite::SqliteVectorStore;
use crate::vector::VectorStore;
use crate::websearch::HttpWebSearchClient;

pub struct AppState {
    pub paths: Arc<AppPaths>,
    pub config: AppConfig,
    pub history: HistoryStore,
    pub vectors: Arc<dyn VectorStore>,
    pub tasks: DocumentTaskStore,
    pub registry: ActiveStreamRegistry,
    pub decision: SearchDecisionEngine,
    pub coordinator: StreamingResponseCoordinator,
    pub ingest: IngestQueue,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub async fn initialize() -> anyhow::Result<Arc<Self>> {
        let paths = Arc::new(AppPaths::new());
        let config = AppConfig::load(&paths.config_path)?;

        let history = HistoryStore::new(paths.history_db_path.clone()).await?;
        let vectors: Arc<dyn VectorStore> = Arc::new(SqliteVectorStore::new(&paths).await?);
        let tasks = DocumentTaskStore::new(&paths).await?;

        let embeddings = Arc::new(HttpEmbeddingClient::new(
            &config.gateways,
            &config.knowledge.embedding_model,
        ));
        let websearch = Arc::new(HttpWebSearchClient::new(&config.gateways));
        let llm = Arc::new(HttpLlmClient::new(&config.gateways, &config.generation));

        let registry = ActiveStreamRegistry::new();
        let decision = SearchDecisionEngine::new(
            embeddings.clone(),
            vectors.clone(),
            websearch,
            config.search.clone(),
        );
        let coordinator = StreamingResponseCoordinator::new(
            llm,
            history.clone(),
            registry.clone(),
            config.generation.clone(),
        );

        let pipeline = Arc::new(IngestionPipeline::new(
            embeddings,
            vectors.clone(),
            Arc::new(PlainTextExtractor),
            tasks.clone(),
            config.knowledge.clone(),
            paths.upload_dir.clone(),
        ));
        let ingest = IngestQueue::start(pipeline);

        let started_at = Utc::now();

        Ok(Arc::new(AppState {
            paths,
            config,
            history,
            vectors,
            tasks,
            registry,
            decision,
            coordinator,
            ingest,
            started_at,
        }))
    }
}
