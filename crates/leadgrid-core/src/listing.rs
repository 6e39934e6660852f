//! Business listing records exchanged between collectors, the
//! deduplicator and the database.

use crate::geo::Coordinates;
use crate::types::Source;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One business listing as produced by a collector, or the merged result
/// of several such listings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Listing {
    /// Provider place identifier, if one was visible
    pub place_id: Option<String>,
    /// Business name
    pub name: String,
    /// Street address
    pub address: Option<String>,
    /// Phone number as displayed
    pub phone: Option<String>,
    /// Website URL
    pub website: Option<String>,
    /// Average rating, 0-5
    pub rating: Option<f64>,
    /// Number of reviews
    pub review_count: Option<u32>,
    /// Primary category
    pub business_type: Option<String>,
    /// All category tags
    pub types: Vec<String>,
    /// Latitude
    pub latitude: Option<f64>,
    /// Longitude
    pub longitude: Option<f64>,
    /// Opening hours keyed by day name
    pub opening_hours: Option<BTreeMap<String, String>>,
    /// Photo URLs
    pub photos: Vec<String>,
    /// Price level, 1-4
    pub price_level: Option<u8>,
    /// Operating status, e.g. `OPERATIONAL` or `CLOSED_PERMANENTLY`
    pub business_status: Option<String>,
    /// Link to the listing on the map surface
    pub maps_url: Option<String>,
    /// Short description
    pub description: Option<String>,
    /// Whether the owner claimed the listing
    pub verified: Option<bool>,
    /// Owner or manager name
    pub owner_name: Option<String>,
    /// Grid cell the record came from (unset after merging)
    pub cell_index: Option<usize>,
    /// Sources that contributed to this record
    pub sources: BTreeSet<Source>,
}

impl Listing {
    /// Create an otherwise empty listing with a name and a single source.
    #[must_use]
    pub fn new(name: impl Into<String>, source: Source) -> Self {
        Self {
            name: name.into(),
            sources: BTreeSet::from([source]),
            ..Self::default()
        }
    }

    /// Coordinates, when both halves are present and valid.
    #[must_use]
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Coordinates::new(lat, lon).ok(),
            _ => None,
        }
    }

    /// Place identifier trimmed and case-folded, `None` when blank.
    #[must_use]
    pub fn normalized_place_id(&self) -> Option<String> {
        normalize_place_id(self.place_id.as_deref()?)
    }

    /// Key identifying this record within a job.
    ///
    /// The normalized place identifier when present, otherwise the
    /// normalized name plus coordinates rounded to four decimals (~11 m).
    #[must_use]
    pub fn dedup_key(&self) -> String {
        if let Some(pid) = self.normalized_place_id() {
            return format!("pid:{pid}");
        }
        let name = normalize_name(&self.name);
        match self.coordinates() {
            Some(c) => format!("name:{name}@{:.4},{:.4}", c.latitude, c.longitude),
            None => format!("name:{name}@"),
        }
    }

    /// Provenance string: sorted, de-duplicated source tags joined by `+`.
    #[must_use]
    pub fn provenance(&self) -> String {
        let tags: BTreeSet<&str> = self.sources.iter().map(|s| s.as_str()).collect();
        tags.into_iter().collect::<Vec<_>>().join("+")
    }

    /// Fill every empty field of `self` from `other` and union list fields.
    ///
    /// Values already present on `self` always win, so callers merge in
    /// precedence order.
    pub fn absorb(&mut self, other: &Self) {
        fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(value);
            }
        }

        if self.name.trim().is_empty() {
            self.name.clone_from(&other.name);
        }
        fill(&mut self.place_id, &other.place_id);
        fill(&mut self.address, &other.address);
        fill(&mut self.phone, &other.phone);
        fill(&mut self.website, &other.website);
        fill(&mut self.rating, &other.rating);
        fill(&mut self.review_count, &other.review_count);
        fill(&mut self.business_type, &other.business_type);
        fill(&mut self.opening_hours, &other.opening_hours);
        fill(&mut self.price_level, &other.price_level);
        fill(&mut self.business_status, &other.business_status);
        fill(&mut self.maps_url, &other.maps_url);
        fill(&mut self.description, &other.description);
        fill(&mut self.verified, &other.verified);
        fill(&mut self.owner_name, &other.owner_name);
        if self.coordinates().is_none() && other.coordinates().is_some() {
            self.latitude = other.latitude;
            self.longitude = other.longitude;
        }

        union_into(&mut self.types, &other.types);
        union_into(&mut self.photos, &other.photos);
        self.sources.extend(other.sources.iter().copied());
    }
}

/// Contact and company data returned by the enrichment API for one lead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Enrichment {
    /// Best contact email
    pub primary_email: Option<String>,
    /// All emails found
    pub emails: Vec<String>,
    /// Social profile URLs keyed by network (`facebook`, `instagram`, ...)
    pub social_links: BTreeMap<String, String>,
    /// Owner or manager name
    pub owner_name: Option<String>,
    /// Employee-count bucket, e.g. `11-50`
    pub employee_count: Option<String>,
    /// Founding year
    pub year_established: Option<i32>,
}

impl Enrichment {
    /// Whether the API returned nothing useful.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.primary_email.is_none()
            && self.emails.is_empty()
            && self.social_links.is_empty()
            && self.owner_name.is_none()
            && self.employee_count.is_none()
            && self.year_established.is_none()
    }
}

/// Trim and case-fold a place identifier; blank ids become `None`.
#[must_use]
pub fn normalize_place_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Lowercase, strip punctuation and collapse whitespace.
///
/// Apostrophes are dropped rather than split on, so `Joe's` and `Joes`
/// normalize identically.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    let mut cleaned = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_alphanumeric() {
            cleaned.extend(ch.to_lowercase());
        } else if !matches!(ch, '\'' | '\u{2019}' | '`') {
            cleaned.push(' ');
        }
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn union_into(target: &mut Vec<String>, extra: &[String]) {
    for item in extra {
        if !target.iter().any(|existing| existing == item) {
            target.push(item.clone());
        }
    }
}
