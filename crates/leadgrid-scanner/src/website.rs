//! Free enrichment fallback: contact details read from each lead's own
//! website.
//!
//! Used when no enrichment API key is configured. The home page and a few
//! common contact pages are fetched, and emails and social profile links
//! are pulled out of the combined HTML. Nothing here is metered.

use crate::error::Result;
use crate::source::{DataSource, EnrichmentTarget, FetchScope, SourceBatch};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use leadgrid_core::{Enrichment, EnrichmentConfig, Source};
use leadgrid_db::Lead;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::collections::HashSet;
use std::time::Duration;

/// Pages tried after the home page, relative to the site root.
const CONTACT_PATHS: [&str; 4] = ["/contact", "/contact-us", "/about", "/about-us"];

/// Emails kept per lead.
const MAX_EMAILS: usize = 5;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Matches that are tracking addresses, asset names or platform
/// boilerplate rather than a business contact.
const JUNK_EMAIL_PARTS: [&str; 22] = [
    "sentry@",
    "webpack@",
    "noreply@",
    "no-reply@",
    "example@",
    "test@",
    "wix.com",
    "sentry.io",
    "w3.org",
    "schema.org",
    "googleapis.com",
    "google.com",
    "cloudflare.com",
    "wordpress.org",
    "gravatar.com",
    ".png",
    ".jpg",
    ".jpeg",
    ".gif",
    ".svg",
    ".css",
    ".js",
];

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}")
        .expect("Email regex is hardcoded and valid")
});

static SOCIAL_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("facebook", r#"https?://(?:www\.)?facebook\.com/[^\s"'<>]+"#),
        ("instagram", r#"https?://(?:www\.)?instagram\.com/[^\s"'<>]+"#),
        (
            "linkedin",
            r#"https?://(?:www\.)?linkedin\.com/(?:company|in)/[^\s"'<>]+"#,
        ),
        ("twitter", r#"https?://(?:www\.)?(?:twitter|x)\.com/[^\s"'<>]+"#),
        ("youtube", r#"https?://(?:www\.)?youtube\.com/[^\s"'<>]+"#),
    ]
    .into_iter()
    .map(|(network, pattern)| {
        (
            network,
            Regex::new(pattern).expect("Social link regex is hardcoded and valid"),
        )
    })
    .collect()
});

/// Emails and social links found in `html`.
///
/// Emails are lower-cased, deduplicated and filtered of junk, keeping the
/// first five in page order. Each network keeps its first link.
#[must_use]
pub fn extract_contacts(html: &str) -> Enrichment {
    let mut seen = HashSet::new();
    let emails: Vec<String> = EMAIL_PATTERN
        .find_iter(html)
        .map(|m| m.as_str().trim().to_lowercase())
        .filter(|email| !JUNK_EMAIL_PARTS.iter().any(|junk| email.contains(junk)))
        .filter(|email| seen.insert(email.clone()))
        .take(MAX_EMAILS)
        .collect();

    let social_links = SOCIAL_PATTERNS
        .iter()
        .filter_map(|(network, pattern)| {
            let link = pattern.find(html)?;
            Some(((*network).to_string(), clean_social_url(link.as_str())))
        })
        .collect();

    Enrichment {
        primary_email: emails.first().cloned(),
        emails,
        social_links,
        ..Enrichment::default()
    }
}

fn clean_social_url(url: &str) -> String {
    url.trim_end_matches(['"', '\'', '/', '>', '#', ')', ';', ','])
        .to_string()
}

/// Leads with an http(s) website and no primary email yet.
#[must_use]
pub fn select_website_targets(leads: &[Lead]) -> Vec<EnrichmentTarget> {
    leads
        .iter()
        .filter(|lead| lead.enrichment.primary_email.is_none())
        .filter_map(|lead| {
            let website = lead
                .listing
                .website
                .as_deref()
                .map(str::trim)
                .filter(|w| w.starts_with("http://") || w.starts_with("https://"))?;
            Some(EnrichmentTarget {
                lead_id: lead.id.clone(),
                name: lead.listing.name.clone(),
                address: lead.listing.address.clone(),
                place_id: lead.listing.place_id.clone(),
                coordinates: lead.listing.coordinates(),
                website: Some(website.to_string()),
            })
        })
        .collect()
}

/// Website contact scraper.
pub struct WebsiteEnricher {
    client: Client,
    concurrency: usize,
}

impl WebsiteEnricher {
    /// Build the HTTP client from the fallback's timeout and concurrency.
    pub fn new(config: &EnrichmentConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.website_timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            concurrency: config.website_concurrency.max(1),
        })
    }

    /// Body of a page that loaded with a success status.
    async fn page(&self, url: &str) -> Option<String> {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Failed to load {}: {}", url, e);
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::debug!("{} returned {}", url, response.status());
            return None;
        }
        response.text().await.ok()
    }

    /// Contacts for one site. A home page that does not load yields nothing.
    async fn visit(&self, website: &str) -> Option<Enrichment> {
        let mut html = self.page(website).await?;
        let base = website.trim_end_matches('/');
        for path in CONTACT_PATHS {
            if let Some(body) = self.page(&format!("{base}{path}")).await {
                html.push_str(&body);
            }
        }
        let contacts = extract_contacts(&html);
        (!contacts.is_empty()).then_some(contacts)
    }
}

#[async_trait]
impl DataSource for WebsiteEnricher {
    fn source(&self) -> Source {
        Source::Enrichment
    }

    /// Free, so the metered quota does not bound the selection.
    fn targets(&self, leads: &[Lead], _remaining: u64) -> Vec<EnrichmentTarget> {
        select_website_targets(leads)
    }

    async fn fetch(&self, scope: &FetchScope) -> Result<SourceBatch> {
        let FetchScope::Leads(targets) = scope else {
            return Ok(SourceBatch::default());
        };

        let mut batch = SourceBatch::default();
        let mut futures = FuturesUnordered::new();
        for target in targets {
            let Some(website) = target.website.as_deref() else {
                continue;
            };
            futures.push(async move { (target.lead_id.clone(), self.visit(website).await) });

            while futures.len() >= self.concurrency {
                if let Some((lead_id, Some(found))) = futures.next().await {
                    batch.enrichments.push((lead_id, found));
                }
            }
        }
        while let Some((lead_id, found)) = futures.next().await {
            if let Some(found) = found {
                batch.enrichments.push((lead_id, found));
            }
        }

        tracing::info!(
            "Website contacts found for {} of {} leads",
            batch.enrichments.len(),
            targets.len()
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use leadgrid_core::Listing;
    use leadgrid_db::LeadAnnotations;

    fn lead(id: &str, website: Option<&str>, email: Option<&str>) -> Lead {
        let mut listing = Listing::new("Bean There", Source::Primary);
        listing.website = website.map(str::to_string);
        Lead {
            id: id.to_string(),
            job_id: "job-1".to_string(),
            dedup_key: format!("key-{id}"),
            listing,
            enrichment: Enrichment {
                primary_email: email.map(str::to_string),
                ..Enrichment::default()
            },
            annotations: LeadAnnotations::default(),
            source: "primary".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_extract_contacts() {
        let html = r#"
            <a href="mailto:Hello@BeanThere.com">Email us</a>
            <img src="logo@2x.png">
            <script>Sentry.init({dsn: "https://abc@sentry.io/1"})</script>
            <p>Bookings: bookings@beanthere.com or hello@beanthere.com</p>
            <a href="https://www.facebook.com/beanthere/">Facebook</a>
            <a href='https://instagram.com/bean.there'>Instagram</a>
            <a href="https://x.com/beanthere">X</a>
        "#;
        let found = extract_contacts(html);

        assert_eq!(
            found.emails,
            vec!["hello@beanthere.com", "bookings@beanthere.com"]
        );
        assert_eq!(found.primary_email.as_deref(), Some("hello@beanthere.com"));
        assert_eq!(
            found.social_links.get("facebook").map(String::as_str),
            Some("https://www.facebook.com/beanthere")
        );
        assert_eq!(
            found.social_links.get("instagram").map(String::as_str),
            Some("https://instagram.com/bean.there")
        );
        assert_eq!(
            found.social_links.get("twitter").map(String::as_str),
            Some("https://x.com/beanthere")
        );
        assert!(!found.social_links.contains_key("youtube"));
    }

    #[test]
    fn test_extract_contacts_caps_emails() {
        let html: String = (0..8).map(|i| format!("staff{i}@cafe.example ")).collect();
        let found = extract_contacts(&html);
        assert_eq!(found.emails.len(), MAX_EMAILS);
        assert_eq!(found.emails[0], "staff0@cafe.example");
        assert!(extract_contacts("<p>no contacts here</p>").is_empty());
    }

    #[test]
    fn test_select_website_targets() {
        let leads = vec![
            lead("a", Some("https://beanthere.example"), None),
            lead("b", Some("beanthere.example"), None),
            lead("c", Some("http://known.example"), Some("owner@known.example")),
            lead("d", None, None),
        ];
        let targets = select_website_targets(&leads);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].lead_id, "a");
        assert_eq!(targets[0].website.as_deref(), Some("https://beanthere.example"));
    }

    #[tokio::test]
    async fn test_unreachable_sites_yield_nothing() {
        let config = EnrichmentConfig {
            website_timeout_secs: 1,
            ..EnrichmentConfig::default()
        };
        let enricher = WebsiteEnricher::new(&config).expect("client");
        // Unroutable; connections are refused straight away.
        let leads = vec![lead("a", Some("http://127.0.0.1:9"), None)];
        let targets = enricher.targets(&leads, 0);
        assert_eq!(targets.len(), 1, "free source ignores the metered quota");

        let batch = enricher
            .fetch(&FetchScope::Leads(targets))
            .await
            .expect("best effort");
        assert!(batch.enrichments.is_empty());
        assert_eq!(batch.units, 0);
    }
}
