use crate::error::{DatabaseError, Result};
use crate::{now_rfc3339, parse_timestamp};
use chrono::{DateTime, Utc};
use leadgrid_core::{Enrichment, Listing, Source};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use std::collections::{BTreeMap, BTreeSet, HashSet};

const LEAD_COLUMNS: &str = "id, job_id, dedup_key, place_id, name, address, phone, website,
    rating, review_count, business_type, types, latitude, longitude, opening_hours, photos,
    price_level, business_status, maps_url, description, verified, owner_name, primary_email,
    emails, social_links, employee_count, year_established, is_favorite, is_archived, notes,
    tags, source, created_at, updated_at";

/// User-owned fields the pipeline never writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadAnnotations {
    /// Marked as favorite
    pub is_favorite: bool,
    /// Hidden from default views
    pub is_archived: bool,
    /// Free-form notes
    pub notes: Option<String>,
    /// User tags
    pub tags: Vec<String>,
}

/// A deduplicated business record owned by one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    /// Unique identifier
    pub id: String,
    /// Owning job
    pub job_id: String,
    /// Upsert key within the job
    pub dedup_key: String,
    /// Merged listing data; `sources` mirrors the provenance string
    pub listing: Listing,
    /// Contact data from the enrichment API
    pub enrichment: Enrichment,
    /// User annotations
    pub annotations: LeadAnnotations,
    /// Provenance, e.g. `primary+supplement`
    pub source: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Write the deduplicated leads of a job.
///
/// Leads are upserted on `(job_id, dedup_key)`. Existing rows keep their
/// annotations and enrichment data; rows whose key no longer appears are
/// removed. Listings sharing a key are folded together first. Returns the
/// number of leads the job now has.
pub async fn replace_job_leads(
    pool: &Pool<Sqlite>,
    job_id: &str,
    listings: &[Listing],
) -> Result<usize> {
    let mut keyed: Vec<(String, Listing)> = Vec::with_capacity(listings.len());
    for listing in listings {
        let key = listing.dedup_key();
        match keyed.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => existing.absorb(listing),
            None => keyed.push((key, listing.clone())),
        }
    }

    let mut tx = pool.begin().await?;

    let existing: Vec<String> = sqlx::query_scalar("SELECT dedup_key FROM leads WHERE job_id = ?")
        .bind(job_id)
        .fetch_all(&mut *tx)
        .await?;
    let wanted: HashSet<&str> = keyed.iter().map(|(k, _)| k.as_str()).collect();
    for stale in existing.iter().filter(|k| !wanted.contains(k.as_str())) {
        sqlx::query("DELETE FROM leads WHERE job_id = ? AND dedup_key = ?")
            .bind(job_id)
            .bind(stale)
            .execute(&mut *tx)
            .await?;
    }

    let now = now_rfc3339();
    for (key, listing) in &keyed {
        let place_id = listing.place_id.as_deref().map(str::trim).filter(|p| !p.is_empty());
        let opening_hours = listing
            .opening_hours
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO leads (id, job_id, dedup_key, place_id, name, address, phone, website,
                                rating, review_count, business_type, types, latitude, longitude,
                                opening_hours, photos, price_level, business_status, maps_url,
                                description, verified, owner_name, source, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(job_id, dedup_key) DO UPDATE SET
                place_id = excluded.place_id,
                name = excluded.name,
                address = excluded.address,
                phone = excluded.phone,
                website = excluded.website,
                rating = excluded.rating,
                review_count = excluded.review_count,
                business_type = excluded.business_type,
                types = excluded.types,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                opening_hours = excluded.opening_hours,
                photos = excluded.photos,
                price_level = excluded.price_level,
                business_status = excluded.business_status,
                maps_url = excluded.maps_url,
                description = excluded.description,
                verified = excluded.verified,
                owner_name = COALESCE(leads.owner_name, excluded.owner_name),
                source = excluded.source,
                updated_at = excluded.updated_at",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(job_id)
        .bind(key)
        .bind(place_id)
        .bind(&listing.name)
        .bind(listing.address.as_deref())
        .bind(listing.phone.as_deref())
        .bind(listing.website.as_deref())
        .bind(listing.rating)
        .bind(listing.review_count.map(i64::from))
        .bind(listing.business_type.as_deref())
        .bind(serde_json::to_string(&listing.types)?)
        .bind(listing.latitude)
        .bind(listing.longitude)
        .bind(opening_hours)
        .bind(serde_json::to_string(&listing.photos)?)
        .bind(listing.price_level.map(i64::from))
        .bind(listing.business_status.as_deref())
        .bind(listing.maps_url.as_deref())
        .bind(listing.description.as_deref())
        .bind(listing.verified)
        .bind(listing.owner_name.as_deref())
        .bind(listing.provenance())
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    tracing::debug!("Stored {} leads for job {}", keyed.len(), job_id);
    Ok(keyed.len())
}

/// All leads of a job, by name.
pub async fn list_leads(pool: &Pool<Sqlite>, job_id: &str) -> Result<Vec<Lead>> {
    let rows = sqlx::query(&format!(
        "SELECT {LEAD_COLUMNS} FROM leads WHERE job_id = ? ORDER BY name COLLATE NOCASE, id"
    ))
    .bind(job_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(parse_lead).collect()
}

/// Fetch a lead by id.
pub async fn get_lead(pool: &Pool<Sqlite>, lead_id: &str) -> Result<Lead> {
    let row = sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?"))
        .bind(lead_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DatabaseError::NotFoundWithMessage(format!("lead not found: {lead_id}")))?;
    parse_lead(&row)
}

/// Number of leads a job has.
pub async fn count_leads(pool: &Pool<Sqlite>, job_id: &str) -> Result<u32> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM leads WHERE job_id = ?")
        .bind(job_id)
        .fetch_one(pool)
        .await?;
    crate::jobs::to_u32("lead count", count)
}

/// Store enrichment data on a lead.
///
/// Only enrichment columns are written. The owner name is filled only when
/// the lead has none yet.
pub async fn apply_enrichment(
    pool: &Pool<Sqlite>,
    lead_id: &str,
    enrichment: &Enrichment,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE leads SET primary_email = COALESCE(?, primary_email),
                          emails = ?,
                          social_links = ?,
                          owner_name = COALESCE(owner_name, ?),
                          employee_count = COALESCE(?, employee_count),
                          year_established = COALESCE(?, year_established),
                          updated_at = ?
         WHERE id = ?",
    )
    .bind(enrichment.primary_email.as_deref())
    .bind(serde_json::to_string(&enrichment.emails)?)
    .bind(serde_json::to_string(&enrichment.social_links)?)
    .bind(enrichment.owner_name.as_deref())
    .bind(enrichment.employee_count.as_deref())
    .bind(enrichment.year_established)
    .bind(now_rfc3339())
    .bind(lead_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DatabaseError::NotFoundWithMessage(format!(
            "lead not found: {lead_id}"
        )));
    }
    Ok(())
}

/// Replace a lead's user annotations.
pub async fn update_annotations(
    pool: &Pool<Sqlite>,
    lead_id: &str,
    annotations: &LeadAnnotations,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE leads SET is_favorite = ?, is_archived = ?, notes = ?, tags = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(annotations.is_favorite)
    .bind(annotations.is_archived)
    .bind(annotations.notes.as_deref())
    .bind(serde_json::to_string(&annotations.tags)?)
    .bind(now_rfc3339())
    .bind(lead_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DatabaseError::NotFoundWithMessage(format!(
            "lead not found: {lead_id}"
        )));
    }
    Ok(())
}

fn parse_lead(row: &SqliteRow) -> Result<Lead> {
    let types: String = row.try_get("types")?;
    let photos: String = row.try_get("photos")?;
    let emails: String = row.try_get("emails")?;
    let social_links: String = row.try_get("social_links")?;
    let tags: String = row.try_get("tags")?;
    let opening_hours: Option<String> = row.try_get("opening_hours")?;
    let source: String = row.try_get("source")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    let review_count: Option<i64> = row.try_get("review_count")?;
    let price_level: Option<i64> = row.try_get("price_level")?;
    let sources: BTreeSet<Source> = source.split('+').filter_map(Source::parse).collect();

    let listing = Listing {
        place_id: row.try_get("place_id")?,
        name: row.try_get("name")?,
        address: row.try_get("address")?,
        phone: row.try_get("phone")?,
        website: row.try_get("website")?,
        rating: row.try_get("rating")?,
        review_count: review_count.and_then(|v| u32::try_from(v).ok()),
        business_type: row.try_get("business_type")?,
        types: serde_json::from_str(&types)?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        opening_hours: opening_hours
            .map(|h| serde_json::from_str::<BTreeMap<String, String>>(&h))
            .transpose()?,
        photos: serde_json::from_str(&photos)?,
        price_level: price_level.and_then(|v| u8::try_from(v).ok()),
        business_status: row.try_get("business_status")?,
        maps_url: row.try_get("maps_url")?,
        description: row.try_get("description")?,
        verified: row.try_get("verified")?,
        owner_name: row.try_get("owner_name")?,
        cell_index: None,
        sources,
    };

    let enrichment = Enrichment {
        primary_email: row.try_get("primary_email")?,
        emails: serde_json::from_str(&emails)?,
        social_links: serde_json::from_str(&social_links)?,
        owner_name: row.try_get("owner_name")?,
        employee_count: row.try_get("employee_count")?,
        year_established: row.try_get("year_established")?,
    };

    let annotations = LeadAnnotations {
        is_favorite: row.try_get("is_favorite")?,
        is_archived: row.try_get("is_archived")?,
        notes: row.try_get("notes")?,
        tags: serde_json::from_str(&tags)?,
    };

    Ok(Lead {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        dedup_key: row.try_get("dedup_key")?,
        listing,
        enrichment,
        annotations,
        source,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::create_job;
    use crate::test_support::setup_test_db;
    use leadgrid_core::{JobRequest, LocationType};

    async fn job_id(db: &crate::Database) -> String {
        let request = JobRequest {
            keyword: "pizza".to_string(),
            location: "Chicago".to_string(),
            location_type: LocationType::City,
            radius_km: 2.0,
            latitude: None,
            longitude: None,
            notify_contact: None,
        };
        create_job(db.pool(), &request).await.expect("create job").id
    }

    fn listing(name: &str, place_id: Option<&str>) -> Listing {
        let mut l = Listing::new(name, Source::Primary);
        l.place_id = place_id.map(str::to_string);
        l.latitude = Some(41.88);
        l.longitude = Some(-87.63);
        l.types = vec!["pizza".to_string()];
        l
    }

    #[tokio::test]
    async fn test_replace_and_list_leads() {
        let db = setup_test_db().await;
        let job = job_id(&db).await;

        let mut with_phone = listing("Joe's Pizza", Some("abc123"));
        with_phone.phone = Some("555-0100".to_string());
        with_phone.sources.insert(Source::Supplement);
        let stored = replace_job_leads(db.pool(), &job, &[with_phone, listing("Lou's", None)])
            .await
            .expect("store");
        assert_eq!(stored, 2);
        assert_eq!(count_leads(db.pool(), &job).await.expect("count"), 2);

        let leads = list_leads(db.pool(), &job).await.expect("list");
        let joe = leads
            .iter()
            .find(|l| l.listing.name == "Joe's Pizza")
            .expect("joe");
        assert_eq!(joe.source, "primary+supplement");
        assert_eq!(joe.dedup_key, "pid:abc123");
        assert_eq!(joe.listing.phone.as_deref(), Some("555-0100"));
        assert_eq!(joe.listing.types, vec!["pizza"]);
    }

    #[tokio::test]
    async fn test_rewrite_keeps_annotations_and_enrichment() {
        let db = setup_test_db().await;
        let job = job_id(&db).await;
        replace_job_leads(db.pool(), &job, &[listing("Joe's Pizza", Some("abc123"))])
            .await
            .expect("store");
        let lead = list_leads(db.pool(), &job).await.expect("list").remove(0);

        update_annotations(
            db.pool(),
            &lead.id,
            &LeadAnnotations {
                is_favorite: true,
                notes: Some("call back".to_string()),
                tags: vec!["hot".to_string()],
                ..LeadAnnotations::default()
            },
        )
        .await
        .expect("annotate");
        apply_enrichment(
            db.pool(),
            &lead.id,
            &Enrichment {
                primary_email: Some("joe@example.com".to_string()),
                emails: vec!["joe@example.com".to_string()],
                ..Enrichment::default()
            },
        )
        .await
        .expect("enrich");

        let mut updated = listing("Joe's Pizza", Some("ABC123"));
        updated.rating = Some(4.5);
        replace_job_leads(db.pool(), &job, &[updated]).await.expect("rewrite");

        let after = get_lead(db.pool(), &lead.id).await.expect("same row");
        assert_eq!(after.listing.rating, Some(4.5));
        assert!(after.annotations.is_favorite);
        assert_eq!(after.annotations.tags, vec!["hot"]);
        assert_eq!(after.enrichment.primary_email.as_deref(), Some("joe@example.com"));
    }

    #[tokio::test]
    async fn test_rewrite_removes_stale_leads() {
        let db = setup_test_db().await;
        let job = job_id(&db).await;
        replace_job_leads(
            db.pool(),
            &job,
            &[listing("A", Some("p1")), listing("B", Some("p2"))],
        )
        .await
        .expect("store");
        replace_job_leads(db.pool(), &job, &[listing("A", Some("p1"))])
            .await
            .expect("rewrite");
        assert_eq!(count_leads(db.pool(), &job).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn test_same_key_listings_are_folded() {
        let db = setup_test_db().await;
        let job = job_id(&db).await;
        let mut second = listing("Joe's Pizza", Some(" abc123 "));
        second.website = Some("https://joes.example".to_string());
        let stored = replace_job_leads(
            db.pool(),
            &job,
            &[listing("Joe's Pizza", Some("abc123")), second],
        )
        .await
        .expect("store");
        assert_eq!(stored, 1);
        let lead = list_leads(db.pool(), &job).await.expect("list").remove(0);
        assert_eq!(lead.listing.website.as_deref(), Some("https://joes.example"));
    }

    #[tokio::test]
    async fn test_enrichment_never_overwrites_owner() {
        let db = setup_test_db().await;
        let job = job_id(&db).await;
        let mut owned = listing("Joe's Pizza", Some("abc123"));
        owned.owner_name = Some("Joe".to_string());
        replace_job_leads(db.pool(), &job, &[owned]).await.expect("store");
        let lead = list_leads(db.pool(), &job).await.expect("list").remove(0);

        apply_enrichment(
            db.pool(),
            &lead.id,
            &Enrichment {
                owner_name: Some("Someone Else".to_string()),
                year_established: Some(1987),
                ..Enrichment::default()
            },
        )
        .await
        .expect("enrich");

        let after = get_lead(db.pool(), &lead.id).await.expect("get");
        assert_eq!(after.listing.owner_name.as_deref(), Some("Joe"));
        assert_eq!(after.enrichment.year_established, Some(1987));
    }

    #[tokio::test]
    async fn test_deleting_job_cascades() {
        let db = setup_test_db().await;
        let job = job_id(&db).await;
        replace_job_leads(db.pool(), &job, &[listing("A", Some("p1"))])
            .await
            .expect("store");
        crate::jobs::delete_job(db.pool(), &job).await.expect("delete");
        assert_eq!(count_leads(db.pool(), &job).await.expect("count"), 0);
    }
}
