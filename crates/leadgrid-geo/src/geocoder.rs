//! Nominatim geocoding client.
//!
//! Every request, forward or reverse, first passes the shared [`RateGate`],
//! so the public service's one-request-per-second policy holds across all
//! jobs running in the process.

use crate::error::{GeoError, Result};
use crate::rate_gate::RateGate;
use async_trait::async_trait;
use leadgrid_core::{retry_with_backoff, Coordinates, GeocoderConfig, RetryPolicy};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Base delay before retrying a transient failure.
const RETRY_DELAY_MS: u64 = 2000;

/// A resolved location.
#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeResult {
    /// Resolved point
    pub coordinates: Coordinates,
    /// Canonical name returned by the service, if any
    pub display_name: Option<String>,
}

/// Location resolution.
#[async_trait]
pub trait Geocode: Send + Sync {
    /// Resolve a free-form location string.
    ///
    /// Fails with [`GeoError::NotFound`] when nothing matches.
    async fn geocode(&self, query: &str) -> Result<GeocodeResult>;

    /// Resolve coordinates to a display address.
    async fn reverse(&self, coordinates: Coordinates) -> Result<String>;
}

/// Nominatim-compatible geocoder.
pub struct NominatimGeocoder {
    client: Client,
    base_url: String,
    gate: Arc<RateGate>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl NominatimGeocoder {
    /// Build a geocoder from configuration, sharing `gate` with every other
    /// user of the same service.
    pub fn new(config: &GeocoderConfig, gate: Arc<RateGate>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            gate,
            max_attempts: config.max_attempts.max(1),
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Override the base retry delay.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<String> {
        self.gate.wait().await;

        let response = self
            .client
            .get(format!("{}/{path}", self.base_url))
            .query(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GeoError::Http {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.text().await?)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.retry_delay, 2)
    }
}

#[async_trait]
impl Geocode for NominatimGeocoder {
    async fn geocode(&self, query: &str) -> Result<GeocodeResult> {
        let query = query.trim();
        if query.is_empty() {
            return Err(GeoError::Invalid("empty location".to_string()));
        }

        if let Some(coordinates) = Coordinates::parse_pair(query) {
            tracing::debug!("Location '{}' is a coordinate pair, skipping lookup", query);
            return Ok(GeocodeResult {
                coordinates,
                display_name: None,
            });
        }

        let params = [
            ("q", query.to_string()),
            ("format", "json".to_string()),
            ("limit", "1".to_string()),
            ("addressdetails", "1".to_string()),
        ];

        let label = format!("Geocoding {query}");
        let body =
            retry_with_backoff(&label, self.retry_policy(), || self.get("search", &params)).await?;
        let result = parse_search_response(&body, query)?;

        tracing::info!(
            "Geocoded '{}' to {} ({})",
            query,
            result.coordinates,
            result.display_name.as_deref().unwrap_or("no display name")
        );
        Ok(result)
    }

    async fn reverse(&self, coordinates: Coordinates) -> Result<String> {
        let params = [
            ("lat", coordinates.latitude.to_string()),
            ("lon", coordinates.longitude.to_string()),
            ("format", "json".to_string()),
        ];
        let label = coordinates.to_string();

        let body = retry_with_backoff(
            &format!("Reverse geocoding {label}"),
            self.retry_policy(),
            || self.get("reverse", &params),
        )
        .await?;
        parse_reverse_response(&body, &label)
    }
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReverseHit {
    display_name: Option<String>,
    error: Option<String>,
}

/// Interpret a `/search?format=json` body.
pub(crate) fn parse_search_response(body: &str, query: &str) -> Result<GeocodeResult> {
    let hits: Vec<SearchHit> =
        serde_json::from_str(body).map_err(|e| GeoError::Parse(e.to_string()))?;

    let hit = hits
        .into_iter()
        .next()
        .ok_or_else(|| GeoError::NotFound(query.to_string()))?;

    let lat: f64 = hit
        .lat
        .parse()
        .map_err(|_| GeoError::Parse(format!("bad latitude '{}'", hit.lat)))?;
    let lon: f64 = hit
        .lon
        .parse()
        .map_err(|_| GeoError::Parse(format!("bad longitude '{}'", hit.lon)))?;

    Ok(GeocodeResult {
        coordinates: Coordinates::new(lat, lon)?,
        display_name: hit.display_name,
    })
}

/// Interpret a `/reverse?format=json` body.
pub(crate) fn parse_reverse_response(body: &str, label: &str) -> Result<String> {
    let hit: ReverseHit =
        serde_json::from_str(body).map_err(|e| GeoError::Parse(e.to_string()))?;

    if let Some(error) = hit.error {
        tracing::debug!("Reverse geocoding {} returned error: {}", label, error);
        return Err(GeoError::NotFound(label.to_string()));
    }
    hit.display_name
        .ok_or_else(|| GeoError::NotFound(label.to_string()))
}
