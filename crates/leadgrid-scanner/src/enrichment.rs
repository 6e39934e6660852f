//! Metered enrichment collector (Outscraper maps search).
//!
//! Looks existing leads up by `"name, address"` and returns contact data
//! for the ones it can match back. Never creates leads and never touches
//! their core fields.

use crate::dedup::Deduplicator;
use crate::error::{Result, ScanError};
use crate::quota::QuotaTracker;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::source::{DataSource, EnrichmentTarget, FetchScope, SourceBatch};
use async_trait::async_trait;
use leadgrid_core::{Enrichment, EnrichmentConfig, Listing, Source};
use leadgrid_db::Lead;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const SOURCE_NAME: &str = "enrichment";

const SOCIAL_NETWORKS: [&str; 5] = ["facebook", "instagram", "twitter", "linkedin", "youtube"];

/// Pause between consecutive batch requests.
const BATCH_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchResponse {
    data: Vec<Value>,
}

/// Leads worth enriching: no primary email yet, with a name and address.
///
/// At most `remaining` targets are returned, in lead order.
pub fn select_targets(leads: &[Lead], remaining: u64) -> Vec<EnrichmentTarget> {
    let limit = usize::try_from(remaining).unwrap_or(usize::MAX);
    leads
        .iter()
        .filter(|lead| lead.enrichment.primary_email.is_none())
        .filter(|lead| !lead.listing.name.trim().is_empty())
        .filter_map(|lead| {
            let address = lead
                .listing
                .address
                .as_deref()
                .map(str::trim)
                .filter(|a| !a.is_empty())?;
            Some(EnrichmentTarget {
                lead_id: lead.id.clone(),
                name: lead.listing.name.clone(),
                address: Some(address.to_string()),
                place_id: lead.listing.place_id.clone(),
                coordinates: lead.listing.coordinates(),
                website: lead.listing.website.clone(),
            })
        })
        .take(limit)
        .collect()
}

/// Enrichment API collector.
pub struct EnrichmentCollector {
    client: Client,
    config: EnrichmentConfig,
    quota: Arc<QuotaTracker>,
    dedup: Deduplicator,
    retry: RetryPolicy,
}

impl EnrichmentCollector {
    pub fn new(
        config: EnrichmentConfig,
        quota: Arc<QuotaTracker>,
        dedup: Deduplicator,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            config,
            quota,
            dedup,
            retry: RetryPolicy::new(2, Duration::from_secs(5), 2),
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

    async fn lookup(&self, chunk: &[EnrichmentTarget], api_key: &str) -> Result<Vec<Value>> {
        let mut params: Vec<(&str, String)> = chunk
            .iter()
            .map(|t| {
                let query = match t.address.as_deref() {
                    Some(address) => format!("{}, {}", t.name, address),
                    None => t.name.clone(),
                };
                ("query", query)
            })
            .collect();
        params.push(("limit", "1".to_string()));
        params.push(("async", "false".to_string()));

        let response = self
            .client
            .get(&self.config.base_url)
            .header("X-API-KEY", api_key)
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
                message: message.chars().take(500).collect(),
            });
        }

        let body: SearchResponse = serde_json::from_str(&response.text().await?)?;
        Ok(body.data)
    }

    /// Pair result groups with the targets they describe.
    ///
    /// Results come back in query order, but the positional target is only
    /// accepted when it plausibly matches; otherwise the whole chunk is
    /// searched by place identifier and name plus proximity.
    fn match_results(
        &self,
        chunk: &[EnrichmentTarget],
        groups: &[Value],
    ) -> Vec<(String, Enrichment)> {
        let mut assigned = HashSet::new();
        let mut matched = Vec::new();

        for (i, group) in groups.iter().enumerate() {
            let Some(record) = first_record(group) else {
                continue;
            };
            let candidate = result_listing(record);
            let target = chunk
                .get(i)
                .filter(|t| self.dedup.matches_target(t, &candidate))
                .or_else(|| self.dedup.find_lead(chunk, &candidate).map(|j| &chunk[j]));

            let Some(target) = target else {
                tracing::debug!("Enrichment result '{}' matched no lead", candidate.name);
                continue;
            };
            if !assigned.insert(target.lead_id.clone()) {
                continue;
            }

            let enrichment = parse_enrichment(record);
            if !enrichment.is_empty() {
                matched.push((target.lead_id.clone(), enrichment));
            }
        }
        matched
    }
}

fn first_record(group: &Value) -> Option<&Map<String, Value>> {
    match group {
        Value::Array(records) => records.first().and_then(Value::as_object),
        Value::Object(record) => Some(record),
        _ => None,
    }
}

fn text(record: &Map<String, Value>, key: &str) -> Option<String> {
    record
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Identity fields of a result, for matching it back to a lead.
fn result_listing(record: &Map<String, Value>) -> Listing {
    let mut candidate = Listing::new(text(record, "name").unwrap_or_default(), Source::Enrichment);
    candidate.place_id = text(record, "place_id").or_else(|| text(record, "google_id"));
    candidate.latitude = record.get("latitude").and_then(Value::as_f64);
    candidate.longitude = record.get("longitude").and_then(Value::as_f64);
    candidate
}

/// Contact fields of a result. Field names vary between API versions, so
/// every known spelling is tried.
fn parse_enrichment(record: &Map<String, Value>) -> Enrichment {
    let mut emails: Vec<String> = Vec::new();
    let mut push_email = |email: String| {
        let email = email.to_lowercase();
        if email.contains('@') && !emails.contains(&email) {
            emails.push(email);
        }
    };
    if let Some(email) = text(record, "email") {
        push_email(email);
    }
    for n in 1..=5 {
        if let Some(email) = text(record, &format!("email_{n}")) {
            push_email(email);
        }
    }
    if let Some(Value::Array(list)) = record.get("emails") {
        for email in list.iter().filter_map(Value::as_str) {
            push_email(email.to_string());
        }
    }

    let social_links = SOCIAL_NETWORKS
        .iter()
        .filter_map(|network| text(record, network).map(|url| ((*network).to_string(), url)))
        .collect();

    let year_established = record
        .get("founded_year")
        .or_else(|| record.get("year_established"))
        .and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .and_then(|year| i32::try_from(year).ok())
        .filter(|year| (1000..=2100).contains(year));

    let employee_count = text(record, "employees")
        .or_else(|| text(record, "company_size"))
        .or_else(|| {
            record
                .get("employees")
                .and_then(Value::as_u64)
                .map(|n| n.to_string())
        });

    Enrichment {
        primary_email: emails.first().cloned(),
        emails,
        social_links,
        owner_name: text(record, "owner_title").or_else(|| text(record, "owner_name")),
        employee_count,
        year_established,
    }
}

#[async_trait]
impl DataSource for EnrichmentCollector {
    fn source(&self) -> Source {
        Source::Enrichment
    }

    fn is_configured(&self) -> bool {
        self.config.enabled && self.api_key().is_some()
    }

    async fn fetch(&self, scope: &FetchScope) -> Result<SourceBatch> {
        let FetchScope::Leads(targets) = scope else {
            return Ok(SourceBatch::default());
        };
        let Some(api_key) = self.api_key() else {
            return Ok(SourceBatch::default());
        };

        let mut batch = SourceBatch::default();
        let batch_size = self.config.batch_size.max(1);
        let chunks: Vec<&[EnrichmentTarget]> = targets.chunks(batch_size).collect();

        for (n, chunk) in chunks.iter().enumerate() {
            let units = u64::try_from(chunk.len()).unwrap_or(u64::MAX);
            let Some(reservation) = self.quota.reserve(Source::Enrichment, units) else {
                tracing::warn!(
                    "Enrichment quota exhausted after {} records, stopping",
                    batch.units
                );
                batch.skipped_over_limit = batch.units == 0;
                break;
            };

            if n > 0 {
                tokio::time::sleep(BATCH_PAUSE).await;
            }

            let label = format!("Enrichment batch {}/{}", n + 1, chunks.len());
            match retry_with_backoff(&label, self.retry, || self.lookup(chunk, api_key)).await {
                Ok(groups) => {
                    let used = reservation.commit();
                    batch.units += units;
                    let matched = self.match_results(chunk, &groups);
                    tracing::debug!(
                        "{}: {} of {} leads enriched [monthly usage: {}]",
                        label,
                        matched.len(),
                        chunk.len(),
                        used
                    );
                    batch.enrichments.extend(matched);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!("{} skipped: {}", label, e);
                }
                Err(e) if batch.units == 0 => return Err(e),
                Err(e) => {
                    tracing::error!("{} failed, stopping enrichment: {}", label, e);
                    break;
                }
            }
        }

        Ok(batch)
    }
}
