//! Batch submission and execution.

use crate::error::Result;
use crate::orchestrator::Pipeline;
use futures::stream::{FuturesUnordered, StreamExt};
use leadgrid_core::BatchRequest;
use leadgrid_db::{batches, jobs, Batch, DatabaseError, Job};
use std::sync::Arc;

/// Runs the child jobs of a batch with bounded parallelism.
pub struct BatchRunner {
    pipeline: Arc<Pipeline>,
    concurrency: usize,
}

impl BatchRunner {
    /// Create a runner executing at most `concurrency` children at once.
    #[must_use]
    pub fn new(pipeline: Arc<Pipeline>, concurrency: usize) -> Self {
        Self {
            pipeline,
            concurrency: concurrency.max(1),
        }
    }

    /// Validate and store a batch with all of its children.
    pub async fn submit(&self, request: &BatchRequest) -> Result<(Batch, Vec<Job>)> {
        let created = batches::create_batch(self.pipeline.db().pool(), request).await?;
        tracing::info!(
            "Batch {} created with {} jobs",
            created.0.id,
            created.1.len()
        );
        Ok(created)
    }

    /// Run every non-terminal child of the batch and return the final
    /// aggregate.
    ///
    /// A failed child never stops its siblings.
    pub async fn run_batch(&self, batch_id: &str) -> Result<Batch> {
        let pool = self.pipeline.db().pool();
        let task_id = uuid::Uuid::new_v4().to_string();
        batches::set_task_id(pool, batch_id, &task_id).await?;

        let children: Vec<Job> = jobs::list_jobs_for_batch(pool, batch_id)
            .await?
            .into_iter()
            .filter(|job| !job.status.is_terminal())
            .collect();
        tracing::info!(
            "Running batch {}: {} jobs, {} at a time",
            batch_id,
            children.len(),
            self.concurrency
        );

        let mut futures = FuturesUnordered::new();
        for child in children {
            let pipeline = Arc::clone(&self.pipeline);
            futures.push(tokio::spawn(async move {
                run_child(&pipeline, &child.id).await;
            }));

            while futures.len() >= self.concurrency {
                if let Some(Err(e)) = futures.next().await {
                    tracing::error!("Batch {} child task panicked: {}", batch_id, e);
                }
            }
        }
        while let Some(joined) = futures.next().await {
            if let Err(e) = joined {
                tracing::error!("Batch {} child task panicked: {}", batch_id, e);
            }
        }

        let batch = batches::refresh_batch_status(pool, batch_id).await?;
        tracing::info!(
            "Batch {} {}: {} completed, {} failed of {}",
            batch.id,
            batch.status,
            batch.completed_jobs,
            batch.failed_jobs,
            batch.total_jobs
        );
        Ok(batch)
    }

    /// Cancel every unfinished child of the batch.
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<Batch> {
        let pool = self.pipeline.db().pool();
        for job in jobs::list_jobs_for_batch(pool, batch_id).await? {
            if job.status.is_terminal() {
                continue;
            }
            match self.pipeline.cancel_job(&job.id).await {
                Ok(outcome) => tracing::debug!("Batch child {}: {:?}", job.id, outcome),
                Err(crate::ScanError::Database(DatabaseError::Conflict(msg))) => {
                    tracing::debug!("Batch child {} already finished: {}", job.id, msg);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(batches::refresh_batch_status(pool, batch_id).await?)
    }
}

async fn run_child(pipeline: &Pipeline, job_id: &str) {
    match pipeline.run_job(job_id).await {
        Ok(status) => tracing::debug!("Batch child {} ended {}", job_id, status),
        Err(e) => tracing::error!("Batch child {} could not run: {}", job_id, e),
    }
}
