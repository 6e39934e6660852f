use crate::error::{DatabaseError, Result};
use crate::jobs::{self, to_u32, Job};
use crate::{now_rfc3339, parse_optional_timestamp, parse_timestamp};
use chrono::{DateTime, Utc};
use leadgrid_core::{BatchRequest, BatchStatus, JobStatus};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};

const BATCH_COLUMNS: &str = "id, name, notify_contact, status, total_jobs, completed_jobs,
    failed_jobs, task_id, created_at, updated_at, completed_at";

/// A group of jobs submitted together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Unique identifier
    pub id: String,
    /// Optional display name
    pub name: Option<String>,
    /// Contact to notify when the batch settles
    pub notify_contact: Option<String>,
    /// Status aggregated from the children
    pub status: BatchStatus,
    /// Number of child jobs
    pub total_jobs: u32,
    /// Children that completed
    pub completed_jobs: u32,
    /// Children that failed or were cancelled
    pub failed_jobs: u32,
    /// Handle of the task running the batch
    pub task_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// When every child reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
}

/// Create a batch and all of its child jobs atomically.
///
/// # Errors
/// Returns `DatabaseError::Validation` if the batch or any child is invalid;
/// nothing is written in that case.
pub async fn create_batch(pool: &Pool<Sqlite>, request: &BatchRequest) -> Result<(Batch, Vec<Job>)> {
    request.validate()?;

    let id = uuid::Uuid::new_v4().to_string();
    let now = now_rfc3339();
    let total = u32::try_from(request.jobs.len())
        .map_err(|_| DatabaseError::Decode("batch too large".to_string()))?;

    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO batches (id, name, notify_contact, status, total_jobs, created_at, updated_at)
         VALUES (?, ?, ?, 'pending', ?, ?, ?)",
    )
    .bind(&id)
    .bind(request.name.as_deref())
    .bind(request.notify_contact.as_deref())
    .bind(i64::from(total))
    .bind(&now)
    .bind(&now)
    .execute(&mut *tx)
    .await?;

    let mut children = Vec::with_capacity(request.jobs.len());
    for (position, job_request) in (0u32..).zip(&request.jobs) {
        let mut child = job_request.clone();
        if child.notify_contact.is_none() {
            child.notify_contact.clone_from(&request.notify_contact);
        }
        children.push(jobs::insert_job(&mut tx, &child, Some(&id), position).await?);
    }

    let row = sqlx::query(&format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = ?"))
        .bind(&id)
        .fetch_one(&mut *tx)
        .await?;
    let batch = parse_batch(&row)?;

    tx.commit().await?;

    tracing::info!("Created batch {} with {} jobs", id, total);
    Ok((batch, children))
}

/// Fetch a batch by id.
pub async fn get_batch(pool: &Pool<Sqlite>, batch_id: &str) -> Result<Batch> {
    let row = sqlx::query(&format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = ?"))
        .bind(batch_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DatabaseError::NotFoundWithMessage(format!("batch not found: {batch_id}")))?;
    parse_batch(&row)
}

/// Recompute a batch's counters and status from its children.
pub async fn refresh_batch_status(pool: &Pool<Sqlite>, batch_id: &str) -> Result<Batch> {
    let statuses: Vec<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE batch_id = ?")
        .bind(batch_id)
        .fetch_all(pool)
        .await?;
    let statuses = statuses
        .iter()
        .map(|s| {
            JobStatus::parse(s)
                .ok_or_else(|| DatabaseError::Decode(format!("unknown job status '{s}'")))
        })
        .collect::<Result<Vec<_>>>()?;

    let status = BatchStatus::aggregate(statuses.iter().copied());
    let completed = statuses
        .iter()
        .filter(|s| **s == JobStatus::Completed)
        .count();
    let failed = statuses.iter().filter(|s| s.is_terminal_failure()).count();
    let now = now_rfc3339();

    sqlx::query(
        "UPDATE batches SET status = ?, completed_jobs = ?, failed_jobs = ?,
                            completed_at = CASE WHEN ? THEN COALESCE(completed_at, ?) ELSE NULL END,
                            updated_at = ?
         WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(i64::try_from(completed).unwrap_or(i64::MAX))
    .bind(i64::try_from(failed).unwrap_or(i64::MAX))
    .bind(status.is_terminal())
    .bind(&now)
    .bind(&now)
    .bind(batch_id)
    .execute(pool)
    .await?;

    get_batch(pool, batch_id).await
}

/// Record the handle of the task running the batch.
pub async fn set_task_id(pool: &Pool<Sqlite>, batch_id: &str, task_id: &str) -> Result<()> {
    sqlx::query("UPDATE batches SET task_id = ?, updated_at = ? WHERE id = ?")
        .bind(task_id)
        .bind(now_rfc3339())
        .bind(batch_id)
        .execute(pool)
        .await?;
    Ok(())
}

fn parse_batch(row: &SqliteRow) -> Result<Batch> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Batch {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        notify_contact: row.try_get("notify_contact")?,
        status: BatchStatus::parse(&status),
        total_jobs: to_u32("total_jobs", row.try_get("total_jobs")?)?,
        completed_jobs: to_u32("completed_jobs", row.try_get("completed_jobs")?)?,
        failed_jobs: to_u32("failed_jobs", row.try_get("failed_jobs")?)?,
        task_id: row.try_get("task_id")?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_test_db;
    use leadgrid_core::{JobRequest, LocationType};

    fn job(keyword: &str) -> JobRequest {
        JobRequest {
            keyword: keyword.to_string(),
            location: "Denver, CO".to_string(),
            location_type: LocationType::City,
            radius_km: 5.0,
            latitude: None,
            longitude: None,
            notify_contact: None,
        }
    }

    fn request(keywords: &[&str]) -> BatchRequest {
        BatchRequest {
            name: Some("morning run".to_string()),
            notify_contact: Some("ops@example.com".to_string()),
            jobs: keywords.iter().map(|k| job(k)).collect(),
        }
    }

    #[tokio::test]
    async fn test_create_batch_with_children() {
        let db = setup_test_db().await;
        let (batch, children) = create_batch(db.pool(), &request(&["dentist", "plumber", "bakery"]))
            .await
            .expect("create batch");

        assert_eq!(batch.status, BatchStatus::Pending);
        assert_eq!(batch.total_jobs, 3);
        assert_eq!(children.len(), 3);
        assert!(children
            .iter()
            .all(|j| j.batch_id.as_deref() == Some(batch.id.as_str())));
        assert_eq!(children[0].notify_contact.as_deref(), Some("ops@example.com"));

        let listed = jobs::list_jobs_for_batch(db.pool(), &batch.id)
            .await
            .expect("list");
        let keywords: Vec<_> = listed.iter().map(|j| j.keyword.as_str()).collect();
        assert_eq!(keywords, vec!["dentist", "plumber", "bakery"]);
    }

    #[tokio::test]
    async fn test_invalid_child_writes_nothing() {
        let db = setup_test_db().await;
        let mut bad = request(&["dentist", "plumber"]);
        bad.jobs[1].radius_km = 0.0;

        let err = create_batch(db.pool(), &bad).await.expect_err("invalid child");
        assert!(err.to_string().contains("job 1"));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_refresh_aggregates_children() {
        let db = setup_test_db().await;
        let (batch, children) = create_batch(db.pool(), &request(&["a", "b"]))
            .await
            .expect("create batch");

        jobs::advance_status(db.pool(), &children[0].id, JobStatus::Geocoding)
            .await
            .expect("advance");
        let running = refresh_batch_status(db.pool(), &batch.id).await.expect("refresh");
        assert_eq!(running.status, BatchStatus::Running);

        jobs::complete_job(db.pool(), &children[0].id).await.expect("complete");
        jobs::request_cancel(db.pool(), &children[1].id).await.expect("cancel");

        let settled = refresh_batch_status(db.pool(), &batch.id).await.expect("refresh");
        assert_eq!(settled.status, BatchStatus::Failed);
        assert_eq!(settled.completed_jobs, 1);
        assert_eq!(settled.failed_jobs, 1);
        assert!(settled.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_all_completed_batch() {
        let db = setup_test_db().await;
        let (batch, children) = create_batch(db.pool(), &request(&["a", "b"]))
            .await
            .expect("create batch");
        for child in &children {
            jobs::complete_job(db.pool(), &child.id).await.expect("complete");
        }
        let done = refresh_batch_status(db.pool(), &batch.id).await.expect("refresh");
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.completed_jobs, 2);
    }
}
