//! Background job submission for ingestion.
//!
//! Jobs enter through an unbounded channel; the worker loop spawns one task
//! per job, so jobs run independently with no ordering guarantee between
//! documents. Same-document races are resolved by the vector store's
//! transactional replace (last writer wins).

use std::sync::Arc;

use tokio::sync::mpsc;

use super::pipeline::{IngestJob, IngestionPipeline};
use crate::errors::ApiError;

#[derive(Clone)]
pub struct IngestQueue {
    sender: mpsc::UnboundedSender<IngestJob>,
}

impl IngestQueue {
    /// Starts the worker loop and returns the submission handle.
    pub fn start(pipeline: Arc<IngestionPipeline>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<IngestJob>();

        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    tracing::info!("Starting ingestion task {} for {}", job.task_id, job.doc_id);
                    pipeline.run(job).await;
                });
            }
        });

        Self { sender }
    }

    pub fn submit(&self, job: IngestJob) -> Result<(), ApiError> {
        self.sender
            .send(job)
            .map_err(|_| ApiError::ServiceUnavailable)
    }
}
