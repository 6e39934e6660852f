//! Metered search API collector (SerpAPI `google_maps` engine).
//!
//! One call per grid cell. Quota is reserved before the call and committed
//! only when the call succeeds; an exhausted quota yields an empty batch
//! flagged `skipped_over_limit` instead of an error.

use crate::error::{Result, ScanError};
use crate::quota::QuotaTracker;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::source::{CellQuery, DataSource, FetchScope, SourceBatch};
use async_trait::async_trait;
use leadgrid_core::{Listing, Source, SupplementConfig};
use leadgrid_geo::RateGate;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const SOURCE_NAME: &str = "search";

/// Error text the API uses for a successful search with zero results.
const NO_RESULTS: &str = "hasn't returned any results";

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_MS: u64 = 2000;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchResponse {
    error: Option<String>,
    local_results: Vec<LocalResult>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LocalResult {
    place_id: Option<String>,
    data_id: Option<String>,
    title: Option<String>,
    address: Option<String>,
    phone: Option<String>,
    website: Option<String>,
    rating: Option<f64>,
    reviews: Option<u32>,
    #[serde(rename = "type")]
    kind: Option<String>,
    types: Vec<String>,
    gps_coordinates: Option<GpsCoordinates>,
    operating_hours: Option<Value>,
    hours: Option<String>,
    thumbnail: Option<String>,
    price: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GpsCoordinates {
    latitude: f64,
    longitude: f64,
}

/// Search API collector.
pub struct SupplementCollector {
    client: Client,
    config: SupplementConfig,
    zoom: u8,
    quota: Arc<QuotaTracker>,
    gate: RateGate,
    retry: RetryPolicy,
}

impl SupplementCollector {
    pub fn new(config: SupplementConfig, zoom: u8, quota: Arc<QuotaTracker>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            gate: RateGate::per_second(config.requests_per_second),
            config,
            zoom,
            quota,
            retry: RetryPolicy::new(RETRY_ATTEMPTS, Duration::from_millis(RETRY_BASE_MS), 2),
        })
    }

    /// Override the retry schedule.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn api_key(&self) -> Option<&str> {
        self.config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    async fn search(&self, query: &CellQuery, api_key: &str) -> Result<Vec<Listing>> {
        self.gate.wait().await;

        let phrase = if query.location.trim().is_empty() {
            query.keyword.clone()
        } else {
            format!("{} in {}", query.keyword, query.location)
        };
        let center = query.cell.center;
        let params = [
            ("engine", "google_maps".to_string()),
            ("q", phrase),
            (
                "ll",
                format!("@{:.6},{:.6},{}z", center.latitude, center.longitude, self.zoom),
            ),
            ("type", "search".to_string()),
            ("no_cache", "false".to_string()),
            ("api_key", api_key.to_string()),
        ];

        let response = self
            .client
            .get(&self.config.base_url)
            .query(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ScanError::Api {
                source_name: SOURCE_NAME,
                status: status.as_u16(),
                message: truncate(&message, 500),
            });
        }

        parse_search_response(&response.text().await?)
    }
}

/// Listings from a search response body.
///
/// A "no results" error is an empty success; any other API error fails.
fn parse_search_response(body: &str) -> Result<Vec<Listing>> {
    let response: SearchResponse = serde_json::from_str(body)?;
    if let Some(error) = response.error {
        if error.contains(NO_RESULTS) {
            return Ok(Vec::new());
        }
        return Err(ScanError::ApiResponse {
            source_name: SOURCE_NAME,
            message: error,
        });
    }
    Ok(response
        .local_results
        .into_iter()
        .filter_map(to_listing)
        .collect())
}

fn to_listing(result: LocalResult) -> Option<Listing> {
    let name = result.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())?;
    let mut listing = Listing::new(name, Source::Supplement);

    listing.place_id = result
        .place_id
        .or(result.data_id)
        .filter(|id| !id.trim().is_empty());
    listing.address = result.address;
    listing.phone = result.phone;
    listing.website = result.website;
    listing.rating = result.rating.filter(|r| (0.0..=5.0).contains(r));
    listing.review_count = result.reviews;

    let mut types = result.types;
    if let Some(kind) = &result.kind {
        if !types.contains(kind) {
            types.insert(0, kind.clone());
        }
    }
    listing.business_type = result.kind.or_else(|| types.first().cloned());
    listing.types = types;

    if let Some(gps) = result.gps_coordinates {
        listing.latitude = Some(gps.latitude);
        listing.longitude = Some(gps.longitude);
    }

    listing.opening_hours = result
        .operating_hours
        .as_ref()
        .and_then(hours_map)
        .or_else(|| result.hours.map(|text| BTreeMap::from([("text".to_string(), text)])));
    listing.photos = result.thumbnail.into_iter().collect();
    listing.price_level = result.price.as_deref().and_then(price_level);
    listing.description = result.description;
    listing.maps_url = listing
        .place_id
        .as_deref()
        .filter(|id| id.starts_with("ChIJ"))
        .map(|id| format!("https://www.google.com/maps/place/?q=place_id:{id}"));

    Some(listing)
}

/// Day-keyed hours from an `operating_hours` object.
fn hours_map(value: &Value) -> Option<BTreeMap<String, String>> {
    let hours: BTreeMap<String, String> = value
        .as_object()?
        .iter()
        .filter_map(|(day, hours)| {
            let mut chars = day.chars();
            let first = chars.next()?.to_uppercase().collect::<String>();
            Some((first + chars.as_str(), hours.as_str()?.to_string()))
        })
        .collect();
    (!hours.is_empty()).then_some(hours)
}

fn price_level(price: &str) -> Option<u8> {
    let dollars = price.chars().filter(|c| *c == '$').count();
    u8::try_from(dollars).ok().filter(|n| (1..=4).contains(n))
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[async_trait]
impl DataSource for SupplementCollector {
    fn source(&self) -> Source {
        Source::Supplement
    }

    fn is_configured(&self) -> bool {
        self.api_key().is_some()
    }

    async fn fetch(&self, scope: &FetchScope) -> Result<SourceBatch> {
        let FetchScope::Cell(query) = scope else {
            return Ok(SourceBatch::default());
        };
        let Some(api_key) = self.api_key() else {
            tracing::warn!("Search API key not configured, skipping cell {}", query.cell.index);
            return Ok(SourceBatch::over_limit());
        };

        let Some(reservation) = self.quota.reserve(Source::Supplement, 1) else {
            tracing::warn!(
                "Search API quota exhausted, skipping cell {} for job {}",
                query.cell.index,
                query.job_id
            );
            return Ok(SourceBatch::over_limit());
        };

        let label = format!("Search API cell {} for job {}", query.cell.index, query.job_id);
        let mut listings =
            retry_with_backoff(&label, self.retry, || self.search(query, api_key)).await?;
        let used = reservation.commit();

        for listing in &mut listings {
            listing.cell_index = Some(query.cell.index);
        }
        tracing::debug!(
            "Search API cell {} for job {}: {} results [monthly usage: {}]",
            query.cell.index,
            query.job_id,
            listings.len(),
            used
        );

        Ok(SourceBatch {
            listings,
            units: 1,
            ..SourceBatch::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadgrid_core::Coordinates;
    use leadgrid_geo::GridCell;

    const RESPONSE: &str = r#"{
        "search_metadata": {"status": "Success"},
        "local_results": [
            {
                "position": 1,
                "title": "Joe's Pizza",
                "place_id": "ChIJabc123",
                "data_id": "0x8644b5a0c9f1c2d3:0x1a2b3c4d5e6f7a8b",
                "gps_coordinates": {"latitude": 30.2672, "longitude": -97.7431},
                "rating": 4.6,
                "reviews": 1204,
                "price": "$$",
                "type": "Pizza restaurant",
                "types": ["Pizza restaurant", "Italian restaurant"],
                "address": "123 Congress Ave, Austin, TX 78701",
                "phone": "(512) 555-0100",
                "website": "https://joespizza.example/",
                "operating_hours": {"monday": "11 AM–10 PM", "tuesday": "Closed"},
                "thumbnail": "https://lh5.googleusercontent.com/p/abc"
            },
            {
                "title": "Bean There",
                "data_id": "0x1:0x2",
                "hours": "Open ⋅ Closes 6 PM"
            },
            {"position": 3}
        ]
    }"#;

    #[test]
    fn test_parse_local_results() {
        let listings = parse_search_response(RESPONSE).expect("parses");
        assert_eq!(listings.len(), 2);

        let joes = &listings[0];
        assert_eq!(joes.place_id.as_deref(), Some("ChIJabc123"));
        assert_eq!(joes.business_type.as_deref(), Some("Pizza restaurant"));
        assert_eq!(joes.types.len(), 2);
        assert_eq!(joes.price_level, Some(2));
        assert_eq!(joes.latitude, Some(30.2672));
        assert_eq!(joes.review_count, Some(1204));
        assert_eq!(joes.photos.len(), 1);
        assert_eq!(joes.provenance(), "supplement");
        let hours = joes.opening_hours.as_ref().expect("hours");
        assert_eq!(hours.get("Tuesday").map(String::as_str), Some("Closed"));
        assert!(joes
            .maps_url
            .as_deref()
            .is_some_and(|u| u.ends_with("place_id:ChIJabc123")));

        let bean = &listings[1];
        assert_eq!(bean.place_id.as_deref(), Some("0x1:0x2"));
        assert!(bean.coordinates().is_none());
        assert!(bean.maps_url.is_none());
        assert!(bean
            .opening_hours
            .as_ref()
            .is_some_and(|h| h.contains_key("text")));
    }

    #[test]
    fn test_no_results_is_empty_success() {
        let body = r#"{"error": "Google hasn't returned any results for this query."}"#;
        assert!(parse_search_response(body).expect("empty").is_empty());
    }

    #[test]
    fn test_api_error_is_permanent() {
        let err = parse_search_response(r#"{"error": "Invalid API key."}"#).unwrap_err();
        assert!(matches!(err, ScanError::ApiResponse { .. }));
        assert!(!err.is_transient());
    }

    fn cell_scope() -> FetchScope {
        FetchScope::Cell(CellQuery {
            job_id: "job-1".to_string(),
            keyword: "pizza".to_string(),
            location: "Austin, TX".to_string(),
            cell: GridCell {
                index: 0,
                center: Coordinates::new(30.2672, -97.7431).expect("valid"),
                radius_km: 3.0,
                distance_km: 0.0,
            },
        })
    }

    #[tokio::test]
    async fn test_over_quota_skips_without_calling() {
        let quota = Arc::new(QuotaTracker::new([(Source::Supplement, 1)]));
        assert!(quota.try_increment(Source::Supplement, 1).is_some());

        let config = SupplementConfig {
            api_key: Some("key".to_string()),
            // Unroutable: any request would fail the test.
            base_url: "http://127.0.0.1:9/search.json".to_string(),
            ..SupplementConfig::default()
        };
        let collector = SupplementCollector::new(config, 14, quota.clone()).expect("client");
        let batch = collector.fetch(&cell_scope()).await.expect("skipped");

        assert!(batch.skipped_over_limit);
        assert!(batch.listings.is_empty());
        assert_eq!(batch.units, 0);
        assert_eq!(quota.usage(Source::Supplement), 1);
    }

    #[tokio::test]
    async fn test_failed_call_does_not_consume_quota() {
        let quota = Arc::new(QuotaTracker::new([(Source::Supplement, 10)]));
        let config = SupplementConfig {
            api_key: Some("key".to_string()),
            base_url: "http://127.0.0.1:9/search.json".to_string(),
            timeout_secs: 1,
            ..SupplementConfig::default()
        };
        let collector = SupplementCollector::new(config, 14, quota.clone())
            .expect("client")
            .with_retry_policy(RetryPolicy::new(1, Duration::ZERO, 1));

        assert!(collector.fetch(&cell_scope()).await.is_err());
        assert_eq!(quota.usage(Source::Supplement), 0);
        assert_eq!(quota.remaining(Source::Supplement), 10);
    }

    #[test]
    fn test_missing_key_is_not_configured() {
        let quota = Arc::new(QuotaTracker::default());
        let collector =
            SupplementCollector::new(SupplementConfig::default(), 14, quota).expect("client");
        assert!(!collector.is_configured());
    }
}
