//! Per-source monthly usage counters.
//!
//! One tracker is created per process and shared by `Arc` between every job
//! and worker. Counters are keyed by `(source, "YYYY-MM")`, so a new month
//! starts from zero without any reset call.

use chrono::{DateTime, Utc};
use leadgrid_core::{QuotaConfig, Source};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

/// Calendar month key used for counters.
#[must_use]
pub fn month_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

#[derive(Debug, Default, Clone, Copy)]
struct Counter {
    used: u64,
    reserved: u64,
}

/// Tracks metered usage against monthly limits.
#[derive(Debug, Default)]
pub struct QuotaTracker {
    /// Monthly limit per source. Missing or 0 = unlimited.
    limits: HashMap<Source, u64>,
    counters: Mutex<HashMap<(Source, String), Counter>>,
}

impl QuotaTracker {
    pub fn new(limits: impl IntoIterator<Item = (Source, u64)>) -> Self {
        Self {
            limits: limits.into_iter().filter(|(_, limit)| *limit > 0).collect(),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &QuotaConfig) -> Self {
        Self::new([
            (Source::Supplement, config.supplement_monthly_limit),
            (Source::Enrichment, config.enrichment_monthly_limit),
        ])
    }

    fn counters(&self) -> MutexGuard<'_, HashMap<(Source, String), Counter>> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Monthly limit, `None` when unlimited.
    pub fn limit(&self, source: Source) -> Option<u64> {
        self.limits.get(&source).copied()
    }

    /// Record usage that happened outside this process (e.g. before a restart).
    pub fn seed(&self, source: Source, month: &str, used: u64) {
        let mut counters = self.counters();
        let counter = counters.entry((source, month.to_string())).or_default();
        counter.used = counter.used.max(used);
    }

    /// Committed usage this month.
    pub fn usage(&self, source: Source) -> u64 {
        self.usage_at(source, Utc::now())
    }

    pub fn usage_at(&self, source: Source, at: DateTime<Utc>) -> u64 {
        self.counters()
            .get(&(source, month_key(at)))
            .map_or(0, |c| c.used)
    }

    /// Units still available this month (`u64::MAX` if unlimited).
    pub fn remaining(&self, source: Source) -> u64 {
        self.remaining_at(source, Utc::now())
    }

    pub fn remaining_at(&self, source: Source, at: DateTime<Utc>) -> u64 {
        let Some(limit) = self.limit(source) else {
            return u64::MAX;
        };
        let counter = self
            .counters()
            .get(&(source, month_key(at)))
            .copied()
            .unwrap_or_default();
        limit.saturating_sub(counter.used + counter.reserved)
    }

    /// Whether spending `units` now would go past the limit.
    pub fn would_exceed(&self, source: Source, units: u64) -> bool {
        self.would_exceed_at(source, units, Utc::now())
    }

    pub fn would_exceed_at(&self, source: Source, units: u64, at: DateTime<Utc>) -> bool {
        units > self.remaining_at(source, at)
    }

    /// Atomically record `units` if they fit under the limit.
    ///
    /// Returns the post-increment count, or `None` without recording anything
    /// when the limit would be exceeded.
    pub fn try_increment(&self, source: Source, units: u64) -> Option<u64> {
        self.try_increment_at(source, units, Utc::now())
    }

    pub fn try_increment_at(&self, source: Source, units: u64, at: DateTime<Utc>) -> Option<u64> {
        let limit = self.limit(source);
        let mut counters = self.counters();
        let counter = counters.entry((source, month_key(at))).or_default();
        if let Some(limit) = limit {
            if counter.used + counter.reserved + units > limit {
                return None;
            }
        }
        counter.used += units;
        Some(counter.used)
    }

    /// Hold `units` of this month's quota for a call about to be made.
    ///
    /// The units count against the limit immediately. They become usage on
    /// [`QuotaReservation::commit`] and are released if the reservation is
    /// dropped, so a failed call never consumes quota.
    pub fn reserve(self: &Arc<Self>, source: Source, units: u64) -> Option<QuotaReservation> {
        self.reserve_at(source, units, Utc::now())
    }

    pub fn reserve_at(
        self: &Arc<Self>,
        source: Source,
        units: u64,
        at: DateTime<Utc>,
    ) -> Option<QuotaReservation> {
        let month = month_key(at);
        let limit = self.limit(source);
        {
            let mut counters = self.counters();
            let counter = counters.entry((source, month.clone())).or_default();
            if let Some(limit) = limit {
                if counter.used + counter.reserved + units > limit {
                    warn!(
                        source = %source,
                        used = counter.used,
                        reserved = counter.reserved,
                        limit,
                        "Monthly quota exhausted"
                    );
                    return None;
                }
                if counter.used + counter.reserved + units + limit / 10 > limit {
                    warn!(source = %source, used = counter.used, limit, "Approaching monthly quota");
                }
            }
            counter.reserved += units;
        }
        Some(QuotaReservation {
            tracker: Arc::clone(self),
            source,
            month,
            units,
            settled: false,
        })
    }

    fn settle(&self, source: Source, month: &str, units: u64, commit: bool) -> u64 {
        let mut counters = self.counters();
        let counter = counters.entry((source, month.to_string())).or_default();
        counter.reserved = counter.reserved.saturating_sub(units);
        if commit {
            counter.used += units;
        }
        counter.used
    }

    /// Log current usage per limited source.
    pub fn log_status(&self) {
        for (source, limit) in &self.limits {
            info!(
                source = %source,
                used = self.usage(*source),
                limit = *limit,
                "Quota status"
            );
        }
    }
}

/// Quota held for an in-flight call.
#[derive(Debug)]
pub struct QuotaReservation {
    tracker: Arc<QuotaTracker>,
    source: Source,
    month: String,
    units: u64,
    settled: bool,
}

impl QuotaReservation {
    /// Units held.
    pub fn units(&self) -> u64 {
        self.units
    }

    /// Record the reserved units as used; returns the post-commit count.
    pub fn commit(mut self) -> u64 {
        self.settled = true;
        self.tracker
            .settle(self.source, &self.month, self.units, true)
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        if !self.settled {
            self.tracker
                .settle(self.source, &self.month, self.units, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(year: i32, month: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_unlimited_source() {
        let tracker = QuotaTracker::new([(Source::Supplement, 0)]);
        assert_eq!(tracker.limit(Source::Supplement), None);
        assert_eq!(tracker.try_increment(Source::Supplement, 1_000), Some(1_000));
        assert_eq!(tracker.remaining(Source::Supplement), u64::MAX);
        assert!(!tracker.would_exceed(Source::Primary, 10_000));
    }

    #[test]
    fn test_increment_stops_at_limit() {
        let tracker = QuotaTracker::new([(Source::Supplement, 3)]);
        let now = at(2026, 3);
        assert_eq!(tracker.try_increment_at(Source::Supplement, 2, now), Some(2));
        assert_eq!(tracker.try_increment_at(Source::Supplement, 2, now), None);
        assert_eq!(tracker.try_increment_at(Source::Supplement, 1, now), Some(3));
        assert_eq!(tracker.try_increment_at(Source::Supplement, 1, now), None);
        assert_eq!(tracker.usage_at(Source::Supplement, now), 3);
        assert!(tracker.would_exceed_at(Source::Supplement, 1, now));
    }

    #[test]
    fn test_month_rollover_by_key() {
        let tracker = QuotaTracker::new([(Source::Enrichment, 5)]);
        assert_eq!(tracker.try_increment_at(Source::Enrichment, 5, at(2026, 1)), Some(5));
        assert_eq!(tracker.remaining_at(Source::Enrichment, at(2026, 1)), 0);
        assert_eq!(tracker.remaining_at(Source::Enrichment, at(2026, 2)), 5);
        assert_eq!(tracker.try_increment_at(Source::Enrichment, 1, at(2026, 2)), Some(1));
    }

    #[test]
    fn test_reservation_commit_and_release() {
        let tracker = Arc::new(QuotaTracker::new([(Source::Supplement, 2)]));
        let now = at(2026, 5);

        let first = tracker.reserve_at(Source::Supplement, 1, now).expect("fits");
        let second = tracker.reserve_at(Source::Supplement, 1, now).expect("fits");
        assert!(tracker.reserve_at(Source::Supplement, 1, now).is_none());
        assert_eq!(tracker.usage_at(Source::Supplement, now), 0);

        assert_eq!(first.commit(), 1);
        drop(second);
        assert_eq!(tracker.usage_at(Source::Supplement, now), 1);
        assert_eq!(tracker.remaining_at(Source::Supplement, now), 1);
    }

    #[test]
    fn test_seed_restores_prior_usage() {
        let tracker = QuotaTracker::new([(Source::Supplement, 100)]);
        let now = at(2026, 7);
        tracker.seed(Source::Supplement, &month_key(now), 98);
        assert_eq!(tracker.remaining_at(Source::Supplement, now), 2);
    }

    #[tokio::test]
    async fn test_concurrent_increments_never_exceed_limit() {
        let tracker = Arc::new(QuotaTracker::new([(Source::Supplement, 50)]));

        let handles: Vec<_> = (0..200)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        tracker.try_increment(Source::Supplement, 1).is_some()
                    } else {
                        tracker
                            .reserve(Source::Supplement, 1)
                            .map(QuotaReservation::commit)
                            .is_some()
                    }
                })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            if handle.await.expect("task") {
                granted += 1;
            }
        }

        assert_eq!(granted, 50);
        assert_eq!(tracker.usage(Source::Supplement), 50);
    }
}
