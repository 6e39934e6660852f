//! Job pipeline driver.
//!
//! [`Pipeline`] runs one job through geocoding, grid generation, the three
//! collector layers and deduplication, persisting status and progress at
//! every step so that a crashed job can be resumed where it stopped.
//!
//! Steps are idempotent: resolved coordinates are reused, checkpointed
//! cells are skipped and leads are upserted. Cancellation is cooperative
//! and checked between steps and between grid cells; whatever was
//! collected before a cancel or a fatal error is still deduplicated into
//! leads.

use crate::dedup::Deduplicator;
use crate::error::{Result, ScanError};
use crate::quota::QuotaTracker;
use crate::retry::timeout_error;
use crate::source::{CellQuery, DataSource, FetchScope, SourceBatch};
use futures::stream::{FuturesUnordered, StreamExt};
use leadgrid_core::{AppConfig, Coordinates, JobStatus, LayerStatus, LocationType, Source};
use leadgrid_db::{batches, jobs, leads, raw_listings, CancelOutcome, Database, Job};
use leadgrid_geo::{estimate_supplement_calls, generate_grid, Geocode, GridCell};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Counters for one pass over the grid.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CellOutcome {
    /// Cells collected and checkpointed, including earlier runs
    pub collected: usize,
    /// Cells that failed after retries
    pub failed: usize,
    /// The source reported its quota exhausted
    pub over_limit: bool,
    /// A cancel was observed before every cell was dispatched
    pub cancelled: bool,
}

/// Drives jobs through the collection pipeline.
pub struct Pipeline {
    db: Database,
    config: Arc<AppConfig>,
    geocoder: Arc<dyn Geocode>,
    primary: Arc<dyn DataSource>,
    supplement: Arc<dyn DataSource>,
    enrichment: Option<Arc<dyn DataSource>>,
    quota: Arc<QuotaTracker>,
    dedup: Deduplicator,
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl Pipeline {
    /// Create a pipeline without an enrichment layer.
    #[must_use]
    pub fn new(
        db: Database,
        config: Arc<AppConfig>,
        geocoder: Arc<dyn Geocode>,
        primary: Arc<dyn DataSource>,
        supplement: Arc<dyn DataSource>,
        quota: Arc<QuotaTracker>,
    ) -> Self {
        let dedup = Deduplicator::from_config(&config.dedup);
        Self {
            db,
            config,
            geocoder,
            primary,
            supplement,
            enrichment: None,
            quota,
            dedup,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the optional enrichment layer.
    #[must_use]
    pub fn with_enrichment(mut self, enrichment: Arc<dyn DataSource>) -> Self {
        self.enrichment = Some(enrichment);
        self
    }

    /// Database handle shared with the batch runner.
    #[must_use]
    pub fn db(&self) -> &Database {
        &self.db
    }

    fn tokens(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, job_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens().insert(job_id.to_string(), token.clone());
        token
    }

    fn unregister(&self, job_id: &str) {
        self.tokens().remove(job_id);
    }

    /// Run a job to a terminal state and return that state.
    ///
    /// Terminal jobs are returned as they are. Cell-level failures never
    /// fail the job; geocoding and database failures do.
    pub async fn run_job(&self, job_id: &str) -> Result<JobStatus> {
        let pool = self.db.pool();
        let job = jobs::get_job(pool, job_id).await?;
        if job.status.is_terminal() {
            tracing::info!("Job {} is already {}, nothing to run", job_id, job.status);
            return Ok(job.status);
        }

        let token = self.register(job_id);
        let task_id = uuid::Uuid::new_v4().to_string();
        jobs::set_task_id(pool, job_id, &task_id).await?;
        tracing::info!(
            "Running job {} ('{}' in '{}', {} km) from {}",
            job_id,
            job.keyword,
            job.location,
            job.radius_km,
            job.status
        );

        let outcome = self.execute(job_id, &token).await;
        self.unregister(job_id);

        let finished = match outcome {
            Ok(()) => jobs::complete_job(pool, job_id).await,
            Err(ScanError::Cancelled) => {
                tracing::info!("Job {} cancelled, keeping partial results", job_id);
                self.salvage(job_id).await;
                jobs::mark_cancelled(pool, job_id).await
            }
            Err(e) => {
                tracing::error!("Job {} failed: {}", job_id, e);
                self.salvage(job_id).await;
                jobs::fail_job(pool, job_id, &e.to_string()).await
            }
        };
        if let Err(e) = finished {
            // A concurrent cancel of a pending job can win the race.
            tracing::warn!("Job {} could not record its final state: {}", job_id, e);
        }

        self.record_cost(job_id).await?;
        let job = jobs::get_job(pool, job_id).await?;
        if let Some(batch_id) = &job.batch_id {
            batches::refresh_batch_status(pool, batch_id).await?;
        }
        Ok(job.status)
    }

    /// Handle a cancel command.
    ///
    /// A pending job is cancelled at once; a running one stops at its next
    /// checkpoint. Terminal jobs are a conflict.
    pub async fn cancel_job(&self, job_id: &str) -> Result<CancelOutcome> {
        let outcome = jobs::request_cancel(self.db.pool(), job_id).await?;
        let token = self.tokens().get(job_id).cloned();
        if let Some(token) = token {
            token.cancel();
        }
        if outcome == CancelOutcome::Cancelled {
            let job = jobs::get_job(self.db.pool(), job_id).await?;
            if let Some(batch_id) = &job.batch_id {
                batches::refresh_batch_status(self.db.pool(), batch_id).await?;
            }
        }
        Ok(outcome)
    }

    /// Resume every job left unfinished by a previous process, oldest first.
    pub async fn resume_unfinished(&self) -> Result<Vec<(String, JobStatus)>> {
        let unfinished = jobs::list_unfinished_jobs(self.db.pool()).await?;
        tracing::info!("Resuming {} unfinished jobs", unfinished.len());

        let mut results = Vec::with_capacity(unfinished.len());
        for job in unfinished {
            let status = self.run_job(&job.id).await?;
            results.push((job.id, status));
        }
        Ok(results)
    }

    async fn execute(&self, job_id: &str, token: &CancellationToken) -> Result<()> {
        self.checkpoint(job_id, token).await?;

        self.enter(job_id, JobStatus::Geocoding).await?;
        let center = self.resolve_location(job_id).await?;
        jobs::set_progress(self.db.pool(), job_id, 10).await?;
        self.checkpoint(job_id, token).await?;

        self.enter(job_id, JobStatus::GridSearch).await?;
        let cells = self.build_grid(job_id, center).await?;
        self.checkpoint(job_id, token).await?;

        self.enter(job_id, JobStatus::PrimaryScrape).await?;
        self.run_primary(job_id, &cells, token).await?;
        self.checkpoint(job_id, token).await?;

        self.enter(job_id, JobStatus::Supplement).await?;
        self.run_supplement(job_id, &cells, token).await?;
        self.checkpoint(job_id, token).await?;

        self.enter(job_id, JobStatus::Dedup).await?;
        self.deduplicate(job_id).await?;
        jobs::set_progress(self.db.pool(), job_id, 90).await?;
        self.checkpoint(job_id, token).await?;

        self.run_enrichment(job_id).await
    }

    /// Persist `step` unless the job already moved past it (resume).
    async fn enter(&self, job_id: &str, step: JobStatus) -> Result<()> {
        let current = jobs::get_job(self.db.pool(), job_id).await?.status;
        if step.precedes(current) {
            return Ok(());
        }
        jobs::advance_status(self.db.pool(), job_id, step).await?;
        Ok(())
    }

    async fn cancel_requested(&self, job_id: &str, token: &CancellationToken) -> Result<bool> {
        if token.is_cancelled() {
            return Ok(true);
        }
        if jobs::is_cancel_requested(self.db.pool(), job_id).await? {
            // Requested by another process; stop in-process work too.
            token.cancel();
            return Ok(true);
        }
        Ok(false)
    }

    async fn checkpoint(&self, job_id: &str, token: &CancellationToken) -> Result<()> {
        if self.cancel_requested(job_id, token).await? {
            return Err(ScanError::Cancelled);
        }
        Ok(())
    }

    /// Coordinates for the job: persisted, supplied, or geocoded.
    async fn resolve_location(&self, job_id: &str) -> Result<Coordinates> {
        let pool = self.db.pool();
        let job = jobs::get_job(pool, job_id).await?;

        let supplied = job
            .coordinates()
            .or_else(|| Coordinates::parse_pair(&job.location));
        if let Some(coordinates) = supplied {
            let wants_address = job.resolved_address.is_none()
                && (job.location_type == LocationType::Coordinates
                    || Coordinates::parse_pair(&job.location).is_some());
            let address = if wants_address {
                match self.geocoder.reverse(coordinates).await {
                    Ok(address) => Some(address),
                    Err(e) => {
                        tracing::warn!("Reverse geocoding failed for job {}: {}", job_id, e);
                        None
                    }
                }
            } else {
                None
            };
            jobs::set_location(pool, job_id, coordinates, address.as_deref()).await?;
            return Ok(coordinates);
        }

        let resolved = self.geocoder.geocode(&job.location).await?;
        tracing::info!(
            "Job {}: '{}' resolved to {}",
            job_id,
            job.location,
            resolved.coordinates
        );
        jobs::set_location(
            pool,
            job_id,
            resolved.coordinates,
            resolved.display_name.as_deref(),
        )
        .await?;
        Ok(resolved.coordinates)
    }

    async fn build_grid(&self, job_id: &str, center: Coordinates) -> Result<Vec<GridCell>> {
        let pool = self.db.pool();
        let job = jobs::get_job(pool, job_id).await?;
        let cells = generate_grid(
            center,
            job.radius_km,
            self.config.grid.max_cell_radius_km,
            self.config.grid.overlap_factor,
        );

        let calls = if self.supplement.is_configured() {
            estimate_supplement_calls(&cells)
        } else {
            0
        };
        #[allow(clippy::cast_precision_loss)]
        let estimate = calls as f64 * self.config.supplement.cost_per_call_usd;
        jobs::set_estimated_cost(pool, job_id, estimate).await?;
        jobs::set_progress(pool, job_id, 15).await?;

        tracing::info!(
            "Job {}: {} grid cells for {} km around {}",
            job_id,
            cells.len(),
            job.radius_km,
            center
        );
        Ok(cells)
    }

    async fn run_primary(
        &self,
        job_id: &str,
        cells: &[GridCell],
        token: &CancellationToken,
    ) -> Result<()> {
        let pool = self.db.pool();
        let job = jobs::get_job(pool, job_id).await?;
        if job.primary_status.is_settled() {
            tracing::debug!("Job {}: primary layer already {}", job_id, job.primary_status);
            return Ok(());
        }

        jobs::set_layer_status(pool, job_id, Source::Primary, LayerStatus::Running).await?;
        let outcome = self
            .collect_cells(
                &job,
                self.primary.as_ref(),
                cells,
                self.config.browser.workers,
                JobStatus::PrimaryScrape,
                token,
            )
            .await?;
        if outcome.cancelled {
            return Err(ScanError::Cancelled);
        }

        let status = if outcome.collected == 0 && outcome.failed > 0 {
            LayerStatus::Failed
        } else {
            LayerStatus::Completed
        };
        jobs::set_layer_status(pool, job_id, Source::Primary, status).await?;
        tracing::info!(
            "Job {}: primary layer {} ({} cells collected, {} failed)",
            job_id,
            status,
            outcome.collected,
            outcome.failed
        );
        Ok(())
    }

    async fn run_supplement(
        &self,
        job_id: &str,
        cells: &[GridCell],
        token: &CancellationToken,
    ) -> Result<()> {
        let pool = self.db.pool();
        let job = jobs::get_job(pool, job_id).await?;
        if job.supplement_status.is_settled() {
            tracing::debug!("Job {}: supplement layer already {}", job_id, job.supplement_status);
            return Ok(());
        }
        if !self.supplement.is_configured() {
            tracing::info!("Job {}: search API not configured, skipping", job_id);
            jobs::set_layer_status(pool, job_id, Source::Supplement, LayerStatus::Skipped).await?;
            return Ok(());
        }

        jobs::set_layer_status(pool, job_id, Source::Supplement, LayerStatus::Running).await?;
        let outcome = self
            .collect_cells(
                &job,
                self.supplement.as_ref(),
                cells,
                1,
                JobStatus::Supplement,
                token,
            )
            .await?;
        if outcome.cancelled {
            return Err(ScanError::Cancelled);
        }

        let status = if outcome.over_limit {
            LayerStatus::Skipped
        } else if outcome.collected == 0 && outcome.failed > 0 {
            LayerStatus::Failed
        } else {
            LayerStatus::Completed
        };
        jobs::set_layer_status(pool, job_id, Source::Supplement, status).await?;
        tracing::info!(
            "Job {}: supplement layer {} ({} cells collected, {} failed)",
            job_id,
            status,
            outcome.collected,
            outcome.failed
        );
        Ok(())
    }

    /// Fetch every cell not yet checkpointed for `source`, at most
    /// `workers` at a time.
    ///
    /// Each successful cell is saved together with its checkpoint, so a
    /// resumed job skips it. Failed cells are logged and left unchecked.
    /// Progress moves through the window of `step`.
    async fn collect_cells(
        &self,
        job: &Job,
        source: &dyn DataSource,
        cells: &[GridCell],
        workers: usize,
        step: JobStatus,
        token: &CancellationToken,
    ) -> Result<CellOutcome> {
        let pool = self.db.pool();
        let source_tag = source.source();
        let done = raw_listings::completed_cells(pool, &job.id, source_tag).await?;
        let pending: Vec<&GridCell> = cells.iter().filter(|c| !done.contains(&c.index)).collect();
        let window = step.progress_range().unwrap_or((0, 0));
        let workers = workers.max(1);
        let cell_timeout = Duration::from_secs(self.config.scraping.cell_timeout_secs.max(1));

        let mut outcome = CellOutcome {
            collected: cells.len() - pending.len(),
            ..CellOutcome::default()
        };
        if !done.is_empty() {
            tracing::info!(
                "Job {}: {} of {} {} cells already collected",
                job.id,
                done.len(),
                cells.len(),
                source_tag
            );
        }

        let mut futures = FuturesUnordered::new();
        for cell in pending {
            if outcome.over_limit {
                break;
            }
            if self.cancel_requested(&job.id, token).await? {
                outcome.cancelled = true;
                break;
            }

            let query = CellQuery {
                job_id: job.id.clone(),
                keyword: job.keyword.clone(),
                location: job.location.clone(),
                cell: cell.clone(),
            };
            futures.push(fetch_cell(source, query, cell_timeout));

            // Respect concurrency limit
            while futures.len() >= workers {
                if let Some((index, result)) = futures.next().await {
                    self.record_cell(
                        job,
                        source_tag,
                        index,
                        result,
                        cells.len(),
                        window,
                        &mut outcome,
                    )
                    .await?;
                }
            }
        }

        // Collect remaining results
        while let Some((index, result)) = futures.next().await {
            self.record_cell(
                job,
                source_tag,
                index,
                result,
                cells.len(),
                window,
                &mut outcome,
            )
            .await?;
        }

        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_cell(
        &self,
        job: &Job,
        source: Source,
        index: usize,
        result: Result<SourceBatch>,
        total: usize,
        window: (u8, u8),
        outcome: &mut CellOutcome,
    ) -> Result<()> {
        let pool = self.db.pool();
        match result {
            Ok(batch) if batch.skipped_over_limit => {
                tracing::warn!(
                    "Job {}: {} quota exhausted at cell {}, skipping the rest",
                    job.id,
                    source,
                    index
                );
                outcome.over_limit = true;
            }
            Ok(batch) => {
                raw_listings::save_cell(pool, &job.id, source, index, &batch.listings, batch.units)
                    .await?;
                jobs::add_usage(pool, &job.id, source, batch.units).await?;
                outcome.collected += 1;
                let progress = window_progress(window, outcome.collected, total);
                jobs::set_progress(pool, &job.id, progress).await?;
            }
            Err(e) => {
                tracing::warn!(
                    "Job {}: {} cell {} skipped after retries: {}",
                    job.id,
                    source,
                    index,
                    e
                );
                outcome.failed += 1;
            }
        }
        Ok(())
    }

    /// Merge every raw record of the job into its leads.
    async fn deduplicate(&self, job_id: &str) -> Result<()> {
        let pool = self.db.pool();
        let listings = raw_listings::load_listings(pool, job_id).await?;
        let merged = self.dedup.deduplicate(&listings);
        leads::replace_job_leads(pool, job_id, &merged).await?;

        let total_found = raw_listings::count_listings(pool, job_id).await?;
        let total_unique = leads::count_leads(pool, job_id).await?;
        jobs::set_totals(pool, job_id, total_found, total_unique).await?;
        tracing::info!(
            "Job {}: {} raw records merged into {} leads",
            job_id,
            total_found,
            total_unique
        );
        Ok(())
    }

    /// Best-effort dedup of whatever was collected before the job stopped.
    async fn salvage(&self, job_id: &str) {
        if let Err(e) = self.deduplicate(job_id).await {
            tracing::error!("Job {}: could not salvage partial results: {}", job_id, e);
        }
    }

    async fn run_enrichment(&self, job_id: &str) -> Result<()> {
        let pool = self.db.pool();
        let Some(source) = self.enrichment.as_ref().filter(|s| s.is_configured()) else {
            jobs::set_layer_status(pool, job_id, Source::Enrichment, LayerStatus::Skipped).await?;
            return Ok(());
        };
        let job = jobs::get_job(pool, job_id).await?;
        if job.enrichment_status.is_settled() {
            return Ok(());
        }

        self.enter(job_id, JobStatus::Enriching).await?;
        jobs::set_layer_status(pool, job_id, Source::Enrichment, LayerStatus::Running).await?;

        let remaining = self.quota.remaining(Source::Enrichment);
        let targets = source.targets(&leads::list_leads(pool, job_id).await?, remaining);
        let status = if targets.is_empty() {
            if remaining == 0 {
                tracing::warn!("Job {}: enrichment quota exhausted, skipping", job_id);
                LayerStatus::Skipped
            } else {
                tracing::info!("Job {}: no leads need enrichment", job_id);
                LayerStatus::Completed
            }
        } else {
            let requested = targets.len();
            match source.fetch(&FetchScope::Leads(targets)).await {
                Ok(batch) => {
                    for (lead_id, enrichment) in &batch.enrichments {
                        leads::apply_enrichment(pool, lead_id, enrichment).await?;
                    }
                    jobs::add_usage(pool, job_id, Source::Enrichment, batch.units).await?;
                    tracing::info!(
                        "Job {}: enriched {} of {} leads",
                        job_id,
                        batch.enrichments.len(),
                        requested
                    );
                    if batch.skipped_over_limit {
                        LayerStatus::Skipped
                    } else {
                        LayerStatus::Completed
                    }
                }
                Err(e) => {
                    tracing::warn!("Job {}: enrichment failed: {}", job_id, e);
                    LayerStatus::Failed
                }
            }
        };

        jobs::set_layer_status(pool, job_id, Source::Enrichment, status).await?;
        jobs::set_progress(pool, job_id, 99).await?;
        Ok(())
    }

    /// Price the job's metered usage.
    async fn record_cost(&self, job_id: &str) -> Result<()> {
        let pool = self.db.pool();
        let job = jobs::get_job(pool, job_id).await?;
        #[allow(clippy::cast_precision_loss)]
        let cost = job.supplement_calls as f64 * self.config.supplement.cost_per_call_usd
            + job.enrichment_records as f64 * self.config.enrichment.cost_per_record_usd;
        jobs::set_estimated_cost(pool, job_id, cost).await?;
        Ok(())
    }
}

async fn fetch_cell(
    source: &dyn DataSource,
    query: CellQuery,
    timeout: Duration,
) -> (usize, Result<SourceBatch>) {
    let index = query.cell.index;
    let scope = FetchScope::Cell(query);
    let result = match tokio::time::timeout(timeout, source.fetch(&scope)).await {
        Ok(result) => result,
        Err(_) => Err(timeout_error(format!("cell {index}"))),
    };
    (index, result)
}

/// Progress after `done` of `total` units within `window`.
fn window_progress(window: (u8, u8), done: usize, total: usize) -> u8 {
    let (start, end) = window;
    if total == 0 {
        return end;
    }
    let span = usize::from(end.saturating_sub(start));
    let advanced = span * done.min(total) / total;
    start.saturating_add(u8::try_from(advanced).unwrap_or(u8::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_progress() {
        assert_eq!(window_progress((15, 65), 0, 4), 15);
        assert_eq!(window_progress((15, 65), 2, 4), 40);
        assert_eq!(window_progress((15, 65), 4, 4), 65);
        assert_eq!(window_progress((15, 65), 9, 4), 65);
        assert_eq!(window_progress((65, 80), 0, 0), 80);
    }
}
