//! Cross-cell, cross-source deduplication.
//!
//! Records are merged in two phases: exact grouping on the normalized place
//! identifier, then a fuzzy pass (name similarity plus distance) for records
//! without one. The fuzzy pass repeats until it stops merging, which makes
//! the output a fixed point: deduplicating it again changes nothing.

use crate::source::EnrichmentTarget;
use leadgrid_core::{normalize_name, Coordinates, DedupConfig, Listing, Source};
use std::collections::HashMap;

/// Bucket edge length in degrees (~1.1 km of latitude).
const BUCKET_DEG: f64 = 0.01;

/// Longitude buckets around the globe.
const LON_BUCKETS: i64 = 36_000;

/// Past this many buckets per side a linear scan is cheaper than the lookup.
const MAX_BUCKET_SPAN: u8 = 50;

/// Meters per degree of latitude.
const METERS_PER_DEGREE: f64 = 111_195.0;

/// Case-insensitive token-sort similarity of two business names, `[0, 1]`.
///
/// Names are normalized (punctuation dropped), their tokens sorted, and the
/// normalized Levenshtein similarity of the results returned. Blank names
/// never match anything.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a = sorted_tokens(a);
    let b = sorted_tokens(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    strsim::normalized_levenshtein(&a, &b)
}

fn sorted_tokens(name: &str) -> String {
    let normalized = normalize_name(name);
    let mut tokens: Vec<&str> = normalized.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Merge precedence of a record: its best contributing source.
fn rank(listing: &Listing) -> Source {
    listing.sources.first().copied().unwrap_or(Source::Enrichment)
}

/// Merge two records describing the same business.
///
/// The record with the higher-precedence source wins ties field by field;
/// with equal precedence the first argument wins.
pub fn merge_pair(a: Listing, b: Listing) -> Listing {
    let (mut winner, loser) = if rank(&b) < rank(&a) { (b, a) } else { (a, b) };
    winner.absorb(&loser);
    winner.cell_index = None;
    winner
}

/// Merges near-duplicate listings into canonical leads.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    name_threshold: f64,
    max_distance_m: f64,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::from_config(&DedupConfig::default())
    }
}

impl Deduplicator {
    pub fn new(name_threshold: f64, max_distance_m: f64) -> Self {
        Self {
            name_threshold: name_threshold.clamp(0.0, 1.0),
            max_distance_m: max_distance_m.max(0.0),
        }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.name_similarity_threshold, config.max_distance_m)
    }

    /// Whether two names are similar enough to be the same business.
    pub fn names_match(&self, a: &str, b: &str) -> bool {
        name_similarity(a, b) >= self.name_threshold
    }

    fn within_distance(&self, a: Coordinates, b: Coordinates) -> bool {
        a.distance_m(&b) <= self.max_distance_m
    }

    /// Fuzzy identity: similar names and both located within the distance
    /// threshold. Records without coordinates never match.
    pub fn is_near_duplicate(&self, a: &Listing, b: &Listing) -> bool {
        match (a.coordinates(), b.coordinates()) {
            (Some(ca), Some(cb)) => self.within_distance(ca, cb) && self.names_match(&a.name, &b.name),
            _ => false,
        }
    }

    /// Merge `records` into canonical leads.
    ///
    /// Output order: records with a place identifier in first-seen order,
    /// then the remaining records in input order.
    pub fn deduplicate(&self, records: &[Listing]) -> Vec<Listing> {
        let input = records.len();

        // Exact phase
        let mut groups: Vec<Vec<Listing>> = Vec::new();
        let mut group_of: HashMap<String, usize> = HashMap::new();
        let mut orphans = Vec::new();
        for record in records {
            match record.normalized_place_id() {
                Some(pid) => {
                    let slot = *group_of.entry(pid).or_insert_with(|| {
                        groups.push(Vec::new());
                        groups.len() - 1
                    });
                    groups[slot].push(record.clone());
                }
                None => orphans.push(record.clone()),
            }
        }

        let mut current: Vec<Listing> = groups.into_iter().filter_map(merge_group).collect();
        let exact = current.len();
        current.extend(orphans);

        // Fuzzy phase, to a fixed point
        let mut passes = 0;
        loop {
            passes += 1;
            let (next, merged) = self.fuzzy_pass(current);
            current = next;
            if !merged {
                break;
            }
        }

        tracing::debug!(
            "Deduplicated {} records into {} leads ({} by place id, {} fuzzy passes)",
            input,
            current.len(),
            exact,
            passes
        );
        current
    }

    /// One fuzzy pass. Records with a place identifier are kept as they
    /// are; each remaining record merges into the first kept record it
    /// matches, or is kept itself.
    fn fuzzy_pass(&self, records: Vec<Listing>) -> (Vec<Listing>, bool) {
        let (mut kept, orphans): (Vec<Listing>, Vec<Listing>) = records
            .into_iter()
            .partition(|r| r.normalized_place_id().is_some());

        let mut index = SpatialIndex::default();
        for (i, record) in kept.iter().enumerate() {
            index.insert(i, record.coordinates());
        }

        let mut merged_any = false;
        for orphan in orphans {
            let target = orphan.coordinates().and_then(|coords| {
                index
                    .candidates(coords, self.max_distance_m, kept.len())
                    .into_iter()
                    .find(|&i| self.is_near_duplicate(&kept[i], &orphan))
            });

            match target {
                Some(i) => {
                    let before = kept[i].coordinates();
                    let existing = std::mem::take(&mut kept[i]);
                    kept[i] = merge_pair(existing, orphan);
                    let after = kept[i].coordinates();
                    if before != after {
                        index.remove(i, before);
                        index.insert(i, after);
                    }
                    merged_any = true;
                }
                None => {
                    index.insert(kept.len(), orphan.coordinates());
                    kept.push(orphan);
                }
            }
        }

        (kept, merged_any)
    }

    /// Find the lead an enrichment result belongs to: same place identifier,
    /// else similar name within the distance threshold.
    pub fn find_lead(&self, targets: &[EnrichmentTarget], candidate: &Listing) -> Option<usize> {
        if let Some(pid) = candidate.normalized_place_id() {
            let by_pid = targets.iter().position(|t| {
                t.place_id
                    .as_deref()
                    .and_then(leadgrid_core::normalize_place_id)
                    .is_some_and(|tp| tp == pid)
            });
            if by_pid.is_some() {
                return by_pid;
            }
        }

        let coords = candidate.coordinates()?;
        targets.iter().position(|t| {
            t.coordinates
                .is_some_and(|tc| self.within_distance(tc, coords))
                && self.names_match(&t.name, &candidate.name)
        })
    }

    /// Whether an enrichment result plausibly describes `target`.
    ///
    /// Used to verify positional matches: differing place identifiers
    /// reject, equal ones accept; otherwise the names must match and, when
    /// both sides are located, lie within the distance threshold.
    pub fn matches_target(&self, target: &EnrichmentTarget, candidate: &Listing) -> bool {
        let target_pid = target
            .place_id
            .as_deref()
            .and_then(leadgrid_core::normalize_place_id);
        if let (Some(a), Some(b)) = (target_pid, candidate.normalized_place_id()) {
            return a == b;
        }
        if !self.names_match(&target.name, &candidate.name) {
            return false;
        }
        match (target.coordinates, candidate.coordinates()) {
            (Some(a), Some(b)) => self.within_distance(a, b),
            _ => true,
        }
    }
}

/// Fold one place-identifier group in source precedence order.
fn merge_group(mut group: Vec<Listing>) -> Option<Listing> {
    group.sort_by_key(rank);
    let mut members = group.into_iter();
    let mut merged = members.next()?;
    let mut size = 1;
    for member in members {
        merged.absorb(&member);
        size += 1;
    }
    if size > 1 {
        merged.cell_index = None;
    }
    Some(merged)
}

/// Lat/lon buckets of kept records, so candidate lookups only touch nearby
/// records.
#[derive(Debug, Default)]
struct SpatialIndex {
    buckets: HashMap<(i64, i64), Vec<usize>>,
}

impl SpatialIndex {
    fn key(coords: Coordinates) -> (i64, i64) {
        // Degrees divided by a fixed bucket size stay far inside i64.
        #[allow(clippy::cast_possible_truncation)]
        let key = (
            (coords.latitude / BUCKET_DEG).floor() as i64,
            ((coords.longitude + 180.0) / BUCKET_DEG).floor() as i64 % LON_BUCKETS,
        );
        key
    }

    fn insert(&mut self, i: usize, coords: Option<Coordinates>) {
        if let Some(coords) = coords {
            self.buckets.entry(Self::key(coords)).or_default().push(i);
        }
    }

    fn remove(&mut self, i: usize, coords: Option<Coordinates>) {
        if let Some(coords) = coords {
            if let Some(bucket) = self.buckets.get_mut(&Self::key(coords)) {
                bucket.retain(|&j| j != i);
            }
        }
    }

    /// Indices of records possibly within `radius_m` of `coords`, ascending.
    fn candidates(&self, coords: Coordinates, radius_m: f64, total: usize) -> Vec<usize> {
        let lat_deg = radius_m / METERS_PER_DEGREE;
        let cos_lat = (coords.latitude.abs() + lat_deg)
            .min(90.0)
            .to_radians()
            .cos();
        let lon_deg = if cos_lat > 1e-9 { lat_deg / cos_lat } else { f64::INFINITY };

        let span = |deg: f64| -> Option<i64> {
            let buckets = (deg / BUCKET_DEG).ceil();
            if !buckets.is_finite() || buckets > f64::from(MAX_BUCKET_SPAN) {
                return None;
            }
            #[allow(clippy::cast_possible_truncation)]
            let buckets = buckets as i64;
            Some(buckets)
        };

        let (Some(lat_span), Some(lon_span)) = (span(lat_deg), span(lon_deg)) else {
            return (0..total).collect();
        };

        let (lat_key, lon_key) = Self::key(coords);
        let mut found = Vec::new();
        for dlat in -lat_span..=lat_span {
            for dlon in -lon_span..=lon_span {
                let key = (lat_key + dlat, (lon_key + dlon).rem_euclid(LON_BUCKETS));
                if let Some(bucket) = self.buckets.get(&key) {
                    found.extend_from_slice(bucket);
                }
            }
        }
        found.sort_unstable();
        found.dedup();
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(name: &str, source: Source, lat: f64, lon: f64) -> Listing {
        let mut l = Listing::new(name, source);
        l.latitude = Some(lat);
        l.longitude = Some(lon);
        l
    }

    /// Point `meters` east of (lat, lon).
    fn east(lat: f64, lon: f64, meters: f64) -> (f64, f64) {
        let c = Coordinates::new(lat, lon).expect("valid").offset_km(0.0, meters / 1000.0);
        (c.latitude, c.longitude)
    }

    #[test]
    fn test_same_place_id_merges_with_primary_precedence() {
        let mut primary = Listing::new("Joe's Pizza", Source::Primary);
        primary.place_id = Some("abc123".to_string());
        primary.website = Some("https://joes.example".to_string());

        let mut supplement = Listing::new("Joe's Pizza NYC", Source::Supplement);
        supplement.place_id = Some(" ABC123 ".to_string());
        supplement.phone = Some("555-0100".to_string());
        supplement.website = Some("https://other.example".to_string());

        // Supplement first in input; primary still wins ties.
        let leads = Deduplicator::default().deduplicate(&[supplement, primary]);
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].name, "Joe's Pizza");
        assert_eq!(leads[0].phone.as_deref(), Some("555-0100"));
        assert_eq!(leads[0].website.as_deref(), Some("https://joes.example"));
        assert_eq!(leads[0].provenance(), "primary+supplement");
    }

    #[test]
    fn test_fuzzy_merge_within_distance() {
        let (lat, lon) = east(30.2672, -97.7431, 40.0);
        let a = listing("Joe's Pizza", Source::Primary, 30.2672, -97.7431);
        let b = listing("Joes Pizza", Source::Supplement, lat, lon);

        let leads = Deduplicator::default().deduplicate(&[a, b]);
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].name, "Joe's Pizza");
        assert_eq!(leads[0].provenance(), "primary+supplement");
    }

    #[test]
    fn test_different_names_close_together_stay_apart() {
        let (lat, lon) = east(30.2672, -97.7431, 10.0);
        let a = listing("Joe's Pizza", Source::Primary, 30.2672, -97.7431);
        let b = listing("Maria's Tacos", Source::Primary, lat, lon);
        assert_eq!(Deduplicator::default().deduplicate(&[a, b]).len(), 2);
    }

    #[test]
    fn test_same_name_far_apart_stays_apart() {
        let (lat, lon) = east(30.2672, -97.7431, 500.0);
        let a = listing("Starbucks", Source::Primary, 30.2672, -97.7431);
        let b = listing("Starbucks", Source::Primary, lat, lon);
        assert_eq!(Deduplicator::default().deduplicate(&[a, b]).len(), 2);
    }

    #[test]
    fn test_records_without_coordinates_never_fuzzy_merge() {
        let a = Listing::new("Joe's Pizza", Source::Primary);
        let b = Listing::new("Joe's Pizza", Source::Supplement);
        assert_eq!(Deduplicator::default().deduplicate(&[a, b]).len(), 2);
    }

    #[test]
    fn test_orphan_merges_into_place_id_record() {
        let mut with_pid = listing("Bean There Cafe", Source::Supplement, 30.0, -97.0);
        with_pid.place_id = Some("ChIJbean".to_string());
        let (lat, lon) = east(30.0, -97.0, 30.0);
        let mut orphan = listing("Bean There Cafe", Source::Primary, lat, lon);
        orphan.phone = Some("555-0199".to_string());

        let leads = Deduplicator::default().deduplicate(&[orphan, with_pid]);
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].place_id.as_deref(), Some("ChIJbean"));
        assert_eq!(leads[0].phone.as_deref(), Some("555-0199"));
        // Primary coordinates win the merge.
        assert_eq!(leads[0].latitude, Some(lat));
    }

    #[test]
    fn test_distinct_place_ids_never_merge() {
        let mut a = listing("Starbucks", Source::Primary, 30.0, -97.0);
        a.place_id = Some("one".to_string());
        let mut b = listing("Starbucks", Source::Primary, 30.0, -97.0);
        b.place_id = Some("two".to_string());
        assert_eq!(Deduplicator::default().deduplicate(&[a, b]).len(), 2);
    }

    #[test]
    fn test_first_kept_match_wins() {
        let a = listing("Corner Deli", Source::Primary, 40.0, -74.0);
        let (lat, lon) = east(40.0, -74.0, 150.0);
        let b = listing("Corner Deli", Source::Primary, lat, lon);
        // Between a and b: within 100 m of both.
        let (mid_lat, mid_lon) = east(40.0, -74.0, 75.0);
        let mut c = listing("Corner Deli", Source::Supplement, mid_lat, mid_lon);
        c.phone = Some("555-0123".to_string());

        let leads = Deduplicator::default().deduplicate(&[a, b, c]);
        assert_eq!(leads.len(), 2);
        assert_eq!(leads[0].phone.as_deref(), Some("555-0123"));
        assert!(leads[1].phone.is_none());
    }

    #[test]
    fn test_deduplicate_is_idempotent() {
        let dedup = Deduplicator::default();
        let mut records = Vec::new();
        for i in 0..40u32 {
            let cluster = i / 4;
            let member = i % 4;
            let (lat, lon) = east(
                30.0 + f64::from(cluster % 3) * 0.002,
                -97.0,
                f64::from(cluster) * 400.0 + f64::from(member) * 30.0,
            );
            let name = ["Joe's Pizza", "Joes Pizza", "Pizza Joe's", "Maria's Tacos"][member as usize];
            let source = if member == 1 { Source::Supplement } else { Source::Primary };
            let mut record = listing(name, source, lat, lon);
            if i % 5 == 0 {
                record.place_id = Some(format!("pid-{}", i % 10));
            }
            record.cell_index = Some(cluster as usize % 3);
            records.push(record);
        }

        let once = dedup.deduplicate(&records);
        let twice = dedup.deduplicate(&once);
        assert!(once.len() < records.len());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_bucketing_matches_across_antimeridian() {
        let a = listing("Island Dive Shop", Source::Primary, -16.5, 179.9996);
        let b = listing("Island Dive Shop", Source::Supplement, -16.5, -179.9998);
        assert!(a.coordinates().expect("a").distance_m(&b.coordinates().expect("b")) < 100.0);
        assert_eq!(Deduplicator::default().deduplicate(&[a, b]).len(), 1);
    }

    #[test]
    fn test_name_similarity() {
        assert!((name_similarity("Joe's Pizza", "Joes Pizza") - 1.0).abs() < f64::EPSILON);
        assert!((name_similarity("Pizza Joe's", "joes PIZZA") - 1.0).abs() < f64::EPSILON);
        assert!(name_similarity("Joe's Pizza", "Maria's Tacos") < 0.85);
        assert!(name_similarity("", "Anything").abs() < f64::EPSILON);
    }

    #[test]
    fn test_find_lead() {
        let dedup = Deduplicator::default();
        let targets = vec![
            EnrichmentTarget {
                lead_id: "lead-1".to_string(),
                name: "Joe's Pizza".to_string(),
                address: Some("123 Congress Ave".to_string()),
                place_id: Some("ChIJjoe".to_string()),
                coordinates: Coordinates::new(30.2672, -97.7431).ok(),
                website: None,
            },
            EnrichmentTarget {
                lead_id: "lead-2".to_string(),
                name: "Bean There".to_string(),
                address: None,
                place_id: None,
                coordinates: Coordinates::new(30.3, -97.7).ok(),
                website: None,
            },
        ];

        let mut by_pid = Listing::new("Totally Different", Source::Enrichment);
        by_pid.place_id = Some("chijjoe".to_string());
        assert_eq!(dedup.find_lead(&targets, &by_pid), Some(0));

        let by_name = listing("Bean There", Source::Enrichment, 30.3002, -97.7);
        assert_eq!(dedup.find_lead(&targets, &by_name), Some(1));

        let unlocated = Listing::new("Bean There", Source::Enrichment);
        assert_eq!(dedup.find_lead(&targets, &unlocated), None);
        assert!(dedup.matches_target(&targets[1], &unlocated));

        let mut wrong_pid = Listing::new("Joe's Pizza", Source::Enrichment);
        wrong_pid.place_id = Some("ChIJother".to_string());
        assert!(!dedup.matches_target(&targets[0], &wrong_pid));
    }
}
