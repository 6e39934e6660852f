use crate::error::{DatabaseError, Result};
use crate::{now_rfc3339, parse_optional_timestamp, parse_timestamp};
use chrono::{DateTime, Utc};
use leadgrid_core::{Coordinates, JobRequest, JobStatus, LayerStatus, LocationType, Source};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};

/// Longest error message stored on a job.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 2000;

const TERMINAL_GUARD: &str = "status NOT IN ('completed', 'failed', 'cancelled')";

const JOB_COLUMNS: &str = "id, batch_id, position, status, keyword, location, location_type,
    radius_km, latitude, longitude, resolved_address, progress, current_step, total_found,
    total_unique, primary_pages, supplement_calls, enrichment_records, estimated_cost_usd,
    task_id, cancel_requested, error_message, notify_contact, primary_status,
    primary_completed_at, supplement_status, supplement_completed_at, enrichment_status,
    enrichment_completed_at, created_at, updated_at, completed_at";

/// A scrape request and its persisted pipeline state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier
    pub id: String,
    /// Owning batch, if submitted as part of one
    pub batch_id: Option<String>,
    /// Position within the batch
    pub position: u32,
    /// Pipeline state
    pub status: JobStatus,
    /// Business keyword
    pub keyword: String,
    /// Location string as submitted
    pub location: String,
    /// Interpretation of `location`
    pub location_type: LocationType,
    /// Search radius in kilometers
    pub radius_km: f64,
    /// Resolved latitude
    pub latitude: Option<f64>,
    /// Resolved longitude
    pub longitude: Option<f64>,
    /// Display address for the resolved point
    pub resolved_address: Option<String>,
    /// Progress percentage, 0-100
    pub progress: u8,
    /// Label of the step in progress
    pub current_step: Option<String>,
    /// Raw records collected across all sources
    pub total_found: u32,
    /// Leads after deduplication
    pub total_unique: u32,
    /// Browser pages loaded by the primary collector
    pub primary_pages: u64,
    /// Metered search API calls
    pub supplement_calls: u64,
    /// Metered enrichment records
    pub enrichment_records: u64,
    /// Estimated spend on metered sources
    pub estimated_cost_usd: f64,
    /// Handle of the task executing the job
    pub task_id: Option<String>,
    /// Set by a cancel command, observed at checkpoints
    pub cancel_requested: bool,
    /// Failure reason
    pub error_message: Option<String>,
    /// Contact to notify on completion
    pub notify_contact: Option<String>,
    /// Primary collector layer status
    pub primary_status: LayerStatus,
    /// When the primary layer settled
    pub primary_completed_at: Option<DateTime<Utc>>,
    /// Supplementary collector layer status
    pub supplement_status: LayerStatus,
    /// When the supplementary layer settled
    pub supplement_completed_at: Option<DateTime<Utc>>,
    /// Enrichment layer status
    pub enrichment_status: LayerStatus,
    /// When the enrichment layer settled
    pub enrichment_completed_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// When the job reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Resolved coordinates, once geocoding has run.
    #[must_use]
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Coordinates::new(lat, lon).ok(),
            _ => None,
        }
    }

    /// Layer status for a collector source.
    #[must_use]
    pub fn layer_status(&self, source: Source) -> LayerStatus {
        match source {
            Source::Primary => self.primary_status,
            Source::Supplement => self.supplement_status,
            Source::Enrichment => self.enrichment_status,
        }
    }
}

/// Result of a cancel command on a non-terminal job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job had not started and is now `cancelled`
    Cancelled,
    /// The running job will stop at its next checkpoint
    Requested,
}

/// Create a new job in `pending` state.
///
/// # Errors
/// Returns `DatabaseError::Validation` if the request violates input constraints.
pub async fn create_job(pool: &Pool<Sqlite>, request: &JobRequest) -> Result<Job> {
    request.validate()?;
    let mut conn = pool.acquire().await?;
    insert_job(&mut conn, request, None, 0).await
}

/// Insert a validated job row. Shared with batch creation.
pub(crate) async fn insert_job(
    conn: &mut sqlx::SqliteConnection,
    request: &JobRequest,
    batch_id: Option<&str>,
    position: u32,
) -> Result<Job> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = now_rfc3339();

    sqlx::query(
        "INSERT INTO jobs (id, batch_id, position, status, keyword, location, location_type,
                           radius_km, latitude, longitude, current_step, notify_contact,
                           created_at, updated_at)
         VALUES (?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(batch_id)
    .bind(i64::from(position))
    .bind(request.keyword.trim())
    .bind(request.location.trim())
    .bind(request.location_type.as_str())
    .bind(request.radius_km)
    .bind(request.latitude)
    .bind(request.longitude)
    .bind(JobStatus::Pending.step_label())
    .bind(request.notify_contact.as_deref())
    .bind(&now)
    .bind(&now)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
        .bind(&id)
        .fetch_one(&mut *conn)
        .await?;
    parse_job(&row)
}

/// Fetch a job by id.
pub async fn get_job(pool: &Pool<Sqlite>, job_id: &str) -> Result<Job> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
        .bind(job_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DatabaseError::NotFoundWithMessage(format!("job not found: {job_id}")))?;
    parse_job(&row)
}

/// Jobs of a batch in submission order.
pub async fn list_jobs_for_batch(pool: &Pool<Sqlite>, batch_id: &str) -> Result<Vec<Job>> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE batch_id = ? ORDER BY position ASC"
    ))
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(parse_job).collect()
}

/// Jobs that are not terminal, oldest first. Used to resume after a crash.
pub async fn list_unfinished_jobs(pool: &Pool<Sqlite>) -> Result<Vec<Job>> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE {TERMINAL_GUARD} ORDER BY created_at ASC"
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(parse_job).collect()
}

/// Move a job into a non-terminal pipeline step.
///
/// Progress is raised to the start of the step's window and never lowered.
///
/// # Errors
/// Returns `DatabaseError::Conflict` if the job is terminal or the move
/// would go backwards.
pub async fn advance_status(pool: &Pool<Sqlite>, job_id: &str, next: JobStatus) -> Result<()> {
    if next.is_terminal() {
        return Err(DatabaseError::Conflict(format!(
            "use the dedicated terminal transition for '{next}'"
        )));
    }
    let current = get_job(pool, job_id).await?.status;
    if !current.can_transition_to(next) {
        return Err(DatabaseError::Conflict(format!(
            "job {job_id} cannot move from '{current}' to '{next}'"
        )));
    }
    let (start, _) = next.progress_range().unwrap_or((0, 0));

    let result = sqlx::query(&format!(
        "UPDATE jobs SET status = ?, current_step = ?, progress = MAX(progress, ?), updated_at = ?
         WHERE id = ? AND {TERMINAL_GUARD}"
    ))
    .bind(next.as_str())
    .bind(next.step_label())
    .bind(i64::from(start))
    .bind(now_rfc3339())
    .bind(job_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DatabaseError::Conflict(format!(
            "job {job_id} finished before it could enter '{next}'"
        )));
    }
    tracing::debug!("Job {} -> {}", job_id, next);
    Ok(())
}

/// Raise a job's progress. Lower values and terminal jobs are ignored.
pub async fn set_progress(pool: &Pool<Sqlite>, job_id: &str, progress: u8) -> Result<()> {
    sqlx::query(&format!(
        "UPDATE jobs SET progress = MAX(progress, ?), updated_at = ?
         WHERE id = ? AND {TERMINAL_GUARD}"
    ))
    .bind(i64::from(progress.min(100)))
    .bind(now_rfc3339())
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record the resolved location.
pub async fn set_location(
    pool: &Pool<Sqlite>,
    job_id: &str,
    coordinates: Coordinates,
    resolved_address: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET latitude = ?, longitude = ?,
                         resolved_address = COALESCE(?, resolved_address), updated_at = ?
         WHERE id = ?",
    )
    .bind(coordinates.latitude)
    .bind(coordinates.longitude)
    .bind(resolved_address)
    .bind(now_rfc3339())
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

fn layer_columns(source: Source) -> (&'static str, &'static str) {
    match source {
        Source::Primary => ("primary_status", "primary_completed_at"),
        Source::Supplement => ("supplement_status", "supplement_completed_at"),
        Source::Enrichment => ("enrichment_status", "enrichment_completed_at"),
    }
}

fn usage_column(source: Source) -> &'static str {
    match source {
        Source::Primary => "primary_pages",
        Source::Supplement => "supplement_calls",
        Source::Enrichment => "enrichment_records",
    }
}

/// Update one collector layer's sub-status.
pub async fn set_layer_status(
    pool: &Pool<Sqlite>,
    job_id: &str,
    source: Source,
    status: LayerStatus,
) -> Result<()> {
    let (status_col, completed_col) = layer_columns(source);
    let now = now_rfc3339();
    let completed_at = status.is_settled().then(|| now.clone());

    sqlx::query(&format!(
        "UPDATE jobs SET {status_col} = ?, {completed_col} = ?, updated_at = ? WHERE id = ?"
    ))
    .bind(status.as_str())
    .bind(completed_at)
    .bind(&now)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Add metered usage (pages, calls or records) to a job's counters.
pub async fn add_usage(pool: &Pool<Sqlite>, job_id: &str, source: Source, units: u64) -> Result<()> {
    if units == 0 {
        return Ok(());
    }
    let column = usage_column(source);
    let units = i64::try_from(units)
        .map_err(|_| DatabaseError::Decode(format!("usage overflow: {units}")))?;

    sqlx::query(&format!(
        "UPDATE jobs SET {column} = {column} + ?, updated_at = ? WHERE id = ?"
    ))
    .bind(units)
    .bind(now_rfc3339())
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record raw and unique result counts.
pub async fn set_totals(
    pool: &Pool<Sqlite>,
    job_id: &str,
    total_found: u32,
    total_unique: u32,
) -> Result<()> {
    sqlx::query("UPDATE jobs SET total_found = ?, total_unique = ?, updated_at = ? WHERE id = ?")
        .bind(i64::from(total_found))
        .bind(i64::from(total_unique))
        .bind(now_rfc3339())
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record the estimated spend.
pub async fn set_estimated_cost(pool: &Pool<Sqlite>, job_id: &str, cost_usd: f64) -> Result<()> {
    sqlx::query("UPDATE jobs SET estimated_cost_usd = ?, updated_at = ? WHERE id = ?")
        .bind(cost_usd)
        .bind(now_rfc3339())
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record the handle of the task executing the job.
pub async fn set_task_id(pool: &Pool<Sqlite>, job_id: &str, task_id: &str) -> Result<()> {
    sqlx::query("UPDATE jobs SET task_id = ?, updated_at = ? WHERE id = ?")
        .bind(task_id)
        .bind(now_rfc3339())
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mark a job completed with progress 100.
pub async fn complete_job(pool: &Pool<Sqlite>, job_id: &str) -> Result<()> {
    finish(pool, job_id, JobStatus::Completed, None).await
}

/// Mark a job failed, storing a truncated error message.
pub async fn fail_job(pool: &Pool<Sqlite>, job_id: &str, error_message: &str) -> Result<()> {
    let message = truncate_message(error_message, MAX_ERROR_MESSAGE_CHARS);
    finish(pool, job_id, JobStatus::Failed, Some(&message)).await
}

/// Mark a job cancelled.
pub async fn mark_cancelled(pool: &Pool<Sqlite>, job_id: &str) -> Result<()> {
    finish(pool, job_id, JobStatus::Cancelled, None).await
}

async fn finish(
    pool: &Pool<Sqlite>,
    job_id: &str,
    status: JobStatus,
    error_message: Option<&str>,
) -> Result<()> {
    let now = now_rfc3339();
    let result = sqlx::query(&format!(
        "UPDATE jobs SET status = ?, current_step = ?,
                         progress = CASE WHEN ? = 'completed' THEN 100 ELSE progress END,
                         error_message = COALESCE(?, error_message),
                         completed_at = ?, updated_at = ?
         WHERE id = ? AND {TERMINAL_GUARD}"
    ))
    .bind(status.as_str())
    .bind(status.step_label())
    .bind(status.as_str())
    .bind(error_message)
    .bind(&now)
    .bind(&now)
    .bind(job_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        let current = get_job(pool, job_id).await?.status;
        return Err(DatabaseError::Conflict(format!(
            "job {job_id} is already '{current}'"
        )));
    }
    tracing::info!("Job {} finished as {}", job_id, status);
    Ok(())
}

/// Handle a cancel command.
///
/// A `pending` job is cancelled immediately; a running job gets its
/// persisted cancel flag set and stops at its next checkpoint.
///
/// # Errors
/// Returns `DatabaseError::Conflict` if the job is already terminal.
pub async fn request_cancel(pool: &Pool<Sqlite>, job_id: &str) -> Result<CancelOutcome> {
    let job = get_job(pool, job_id).await?;
    if job.status.is_terminal() {
        return Err(DatabaseError::Conflict(format!(
            "job {job_id} is already '{}'",
            job.status
        )));
    }

    let now = now_rfc3339();
    let cancelled = sqlx::query(
        "UPDATE jobs SET status = 'cancelled', current_step = ?, cancel_requested = 1,
                         completed_at = ?, updated_at = ?
         WHERE id = ? AND status = 'pending'",
    )
    .bind(JobStatus::Cancelled.step_label())
    .bind(&now)
    .bind(&now)
    .bind(job_id)
    .execute(pool)
    .await?;
    if cancelled.rows_affected() == 1 {
        tracing::info!("Job {} cancelled before it started", job_id);
        return Ok(CancelOutcome::Cancelled);
    }

    let flagged = sqlx::query(&format!(
        "UPDATE jobs SET cancel_requested = 1, updated_at = ? WHERE id = ? AND {TERMINAL_GUARD}"
    ))
    .bind(&now)
    .bind(job_id)
    .execute(pool)
    .await?;
    if flagged.rows_affected() == 0 {
        return Err(DatabaseError::Conflict(format!(
            "job {job_id} finished before it could be cancelled"
        )));
    }

    tracing::info!("Cancellation requested for job {}", job_id);
    Ok(CancelOutcome::Requested)
}

/// Whether a cancel command has been recorded for the job.
pub async fn is_cancel_requested(pool: &Pool<Sqlite>, job_id: &str) -> Result<bool> {
    let flag: Option<i64> = sqlx::query_scalar("SELECT cancel_requested FROM jobs WHERE id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
    flag.map(|v| v != 0)
        .ok_or_else(|| DatabaseError::NotFoundWithMessage(format!("job not found: {job_id}")))
}

/// Delete a job; its leads and raw records go with it.
pub async fn delete_job(pool: &Pool<Sqlite>, job_id: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
        .bind(job_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DatabaseError::NotFoundWithMessage(format!(
            "job not found: {job_id}"
        )));
    }
    Ok(())
}

/// Metered units a source consumed across jobs created in `month`
/// (`YYYY-MM`). Used to seed quota counters after a restart.
pub async fn monthly_usage(pool: &Pool<Sqlite>, source: Source, month: &str) -> Result<u64> {
    let column = usage_column(source);
    let total: i64 = sqlx::query_scalar(&format!(
        "SELECT COALESCE(SUM({column}), 0) FROM jobs WHERE substr(created_at, 1, 7) = ?"
    ))
    .bind(month)
    .fetch_one(pool)
    .await?;
    to_u64("monthly usage", total)
}

/// Cut `message` to at most `max_chars` characters.
#[must_use]
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => message[..byte_idx].to_string(),
        None => message.to_string(),
    }
}

pub(crate) fn to_u32(field: &str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| DatabaseError::Decode(format!("{field} out of range: {value}")))
}

fn to_u64(field: &str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| DatabaseError::Decode(format!("{field} out of range: {value}")))
}

fn parse_job(row: &SqliteRow) -> Result<Job> {
    let status_str: String = row.try_get("status")?;
    let status = JobStatus::parse(&status_str)
        .ok_or_else(|| DatabaseError::Decode(format!("unknown job status '{status_str}'")))?;

    let location_type_str: String = row.try_get("location_type")?;
    let location_type = LocationType::parse(&location_type_str).ok_or_else(|| {
        DatabaseError::Decode(format!("unknown location type '{location_type_str}'"))
    })?;

    let progress: i64 = row.try_get("progress")?;
    let progress = u8::try_from(progress.clamp(0, 100)).unwrap_or(100);

    let primary_status: String = row.try_get("primary_status")?;
    let supplement_status: String = row.try_get("supplement_status")?;
    let enrichment_status: String = row.try_get("enrichment_status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Job {
        id: row.try_get("id")?,
        batch_id: row.try_get("batch_id")?,
        position: to_u32("position", row.try_get("position")?)?,
        status,
        keyword: row.try_get("keyword")?,
        location: row.try_get("location")?,
        location_type,
        radius_km: row.try_get("radius_km")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        resolved_address: row.try_get("resolved_address")?,
        progress,
        current_step: row.try_get("current_step")?,
        total_found: to_u32("total_found", row.try_get("total_found")?)?,
        total_unique: to_u32("total_unique", row.try_get("total_unique")?)?,
        primary_pages: to_u64("primary_pages", row.try_get("primary_pages")?)?,
        supplement_calls: to_u64("supplement_calls", row.try_get("supplement_calls")?)?,
        enrichment_records: to_u64("enrichment_records", row.try_get("enrichment_records")?)?,
        estimated_cost_usd: row.try_get("estimated_cost_usd")?,
        task_id: row.try_get("task_id")?,
        cancel_requested: row.try_get::<i64, _>("cancel_requested")? != 0,
        error_message: row.try_get("error_message")?,
        notify_contact: row.try_get("notify_contact")?,
        primary_status: LayerStatus::parse(&primary_status),
        primary_completed_at: parse_optional_timestamp(
            "primary_completed_at",
            row.try_get("primary_completed_at")?,
        )?,
        supplement_status: LayerStatus::parse(&supplement_status),
        supplement_completed_at: parse_optional_timestamp(
            "supplement_completed_at",
            row.try_get("supplement_completed_at")?,
        )?,
        enrichment_status: LayerStatus::parse(&enrichment_status),
        enrichment_completed_at: parse_optional_timestamp(
            "enrichment_completed_at",
            row.try_get("enrichment_completed_at")?,
        )?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
    })
}
