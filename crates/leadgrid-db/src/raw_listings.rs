use crate::error::{DatabaseError, Result};
use crate::now_rfc3339;
use leadgrid_core::{Listing, Source};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashSet;

fn cell_key(cell_index: usize) -> Result<i64> {
    i64::try_from(cell_index)
        .map_err(|_| DatabaseError::Decode(format!("cell index out of range: {cell_index}")))
}

/// Persist one cell's collector output and its checkpoint atomically.
///
/// Re-saving a cell replaces its previous rows, so a resumed job that
/// collects a cell again never duplicates records.
pub async fn save_cell(
    pool: &Pool<Sqlite>,
    job_id: &str,
    source: Source,
    cell_index: usize,
    listings: &[Listing],
    units: u64,
) -> Result<()> {
    let cell = cell_key(cell_index)?;
    let now = now_rfc3339();
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM raw_listings WHERE job_id = ? AND source = ? AND cell_index = ?")
        .bind(job_id)
        .bind(source.as_str())
        .bind(cell)
        .execute(&mut *tx)
        .await?;

    for (seq, listing) in (0i64..).zip(listings) {
        sqlx::query(
            "INSERT INTO raw_listings (job_id, source, cell_index, seq, payload, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(source.as_str())
        .bind(cell)
        .bind(seq)
        .bind(serde_json::to_string(listing)?)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        "INSERT INTO collected_cells (job_id, source, cell_index, record_count, units, collected_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(job_id, source, cell_index) DO UPDATE SET
            record_count = excluded.record_count,
            units = excluded.units,
            collected_at = excluded.collected_at",
    )
    .bind(job_id)
    .bind(source.as_str())
    .bind(cell)
    .bind(i64::try_from(listings.len()).unwrap_or(i64::MAX))
    .bind(i64::try_from(units).unwrap_or(i64::MAX))
    .bind(&now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Cells already checkpointed for a job and source.
pub async fn completed_cells(
    pool: &Pool<Sqlite>,
    job_id: &str,
    source: Source,
) -> Result<HashSet<usize>> {
    let rows: Vec<i64> =
        sqlx::query_scalar("SELECT cell_index FROM collected_cells WHERE job_id = ? AND source = ?")
            .bind(job_id)
            .bind(source.as_str())
            .fetch_all(pool)
            .await?;
    Ok(rows
        .into_iter()
        .filter_map(|c| usize::try_from(c).ok())
        .collect())
}

/// Every raw record of a job in merge order: primary before supplement,
/// then by cell and position within the cell.
pub async fn load_listings(pool: &Pool<Sqlite>, job_id: &str) -> Result<Vec<Listing>> {
    let rows = sqlx::query(
        "SELECT payload FROM raw_listings WHERE job_id = ?
         ORDER BY CASE source WHEN 'primary' THEN 0 WHEN 'supplement' THEN 1 ELSE 2 END,
                  cell_index, seq",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let payload: String = row.try_get("payload")?;
            Ok(serde_json::from_str(&payload)?)
        })
        .collect()
}

/// Number of raw records collected for a job.
pub async fn count_listings(pool: &Pool<Sqlite>, job_id: &str) -> Result<u32> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_listings WHERE job_id = ?")
        .bind(job_id)
        .fetch_one(pool)
        .await?;
    crate::jobs::to_u32("raw listing count", count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::create_job;
    use crate::test_support::setup_test_db;
    use leadgrid_core::{JobRequest, LocationType};

    async fn job_id(db: &crate::Database) -> String {
        let request = JobRequest {
            keyword: "florist".to_string(),
            location: "Portland".to_string(),
            location_type: LocationType::City,
            radius_km: 10.0,
            latitude: None,
            longitude: None,
            notify_contact: None,
        };
        create_job(db.pool(), &request).await.expect("create job").id
    }

    fn listing(name: &str, source: Source, cell: usize) -> Listing {
        let mut l = Listing::new(name, source);
        l.cell_index = Some(cell);
        l
    }

    #[tokio::test]
    async fn test_save_cell_writes_checkpoint() {
        let db = setup_test_db().await;
        let job = job_id(&db).await;

        save_cell(
            db.pool(),
            &job,
            Source::Primary,
            2,
            &[listing("A", Source::Primary, 2), listing("B", Source::Primary, 2)],
            3,
        )
        .await
        .expect("save");
        save_cell(db.pool(), &job, Source::Primary, 0, &[], 1)
            .await
            .expect("save empty");

        let done = completed_cells(db.pool(), &job, Source::Primary)
            .await
            .expect("cells");
        assert_eq!(done, HashSet::from([0, 2]));
        assert!(completed_cells(db.pool(), &job, Source::Supplement)
            .await
            .expect("cells")
            .is_empty());
        assert_eq!(count_listings(db.pool(), &job).await.expect("count"), 2);
    }

    #[tokio::test]
    async fn test_resaving_cell_replaces_rows() {
        let db = setup_test_db().await;
        let job = job_id(&db).await;
        let rows = [listing("A", Source::Primary, 0), listing("B", Source::Primary, 0)];
        save_cell(db.pool(), &job, Source::Primary, 0, &rows, 1)
            .await
            .expect("save");
        save_cell(db.pool(), &job, Source::Primary, 0, &rows[..1], 1)
            .await
            .expect("resave");
        assert_eq!(count_listings(db.pool(), &job).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn test_load_orders_primary_first() {
        let db = setup_test_db().await;
        let job = job_id(&db).await;
        save_cell(
            db.pool(),
            &job,
            Source::Supplement,
            0,
            &[listing("S0", Source::Supplement, 0)],
            1,
        )
        .await
        .expect("save");
        save_cell(
            db.pool(),
            &job,
            Source::Primary,
            1,
            &[listing("P1", Source::Primary, 1)],
            1,
        )
        .await
        .expect("save");
        save_cell(
            db.pool(),
            &job,
            Source::Primary,
            0,
            &[listing("P0a", Source::Primary, 0), listing("P0b", Source::Primary, 0)],
            1,
        )
        .await
        .expect("save");

        let names: Vec<_> = load_listings(db.pool(), &job)
            .await
            .expect("load")
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert_eq!(names, vec!["P0a", "P0b", "P1", "S0"]);
    }
}
