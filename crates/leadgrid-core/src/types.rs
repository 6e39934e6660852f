//! Shared types used across the leadgrid pipeline.
//!
//! This module defines the status enums persisted by the database layer
//! and the validated request types accepted when creating jobs and batches.

use crate::error::{LeadgridError, Result};
use crate::geo::Coordinates;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum radius a job may request, in kilometers.
pub const MAX_RADIUS_KM: f64 = 50.0;

/// Maximum number of jobs accepted in a single batch.
pub const MAX_BATCH_JOBS: usize = 100;

/// Lifecycle of a single job.
///
/// The non-terminal states are ordered; a job only ever moves forward
/// through them, or jumps to [`JobStatus::Failed`] / [`JobStatus::Cancelled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet picked up
    Pending,
    /// Resolving the location string
    Geocoding,
    /// Building the search grid
    GridSearch,
    /// Browser collection across grid cells
    PrimaryScrape,
    /// Metered search API collection
    Supplement,
    /// Cross-source merge into leads
    Dedup,
    /// Metered enrichment of existing leads
    Enriching,
    /// Finished successfully
    Completed,
    /// Aborted by a fatal error
    Failed,
    /// Stopped on request
    Cancelled,
}

impl JobStatus {
    /// Stable string form stored in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Geocoding => "geocoding",
            Self::GridSearch => "grid_search",
            Self::PrimaryScrape => "primary_scrape",
            Self::Supplement => "supplement",
            Self::Dedup => "dedup",
            Self::Enriching => "enriching",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from the database string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "geocoding" => Self::Geocoding,
            "grid_search" => Self::GridSearch,
            "primary_scrape" => Self::PrimaryScrape,
            "supplement" => Self::Supplement,
            "dedup" => Self::Dedup,
            "enriching" => Self::Enriching,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the job ended in `failed` or `cancelled`.
    #[must_use]
    pub fn is_terminal_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }

    /// Progress window `(start, end)` owned by this step.
    ///
    /// Terminal failure states have no window; progress is left where it was.
    #[must_use]
    pub fn progress_range(self) -> Option<(u8, u8)> {
        match self {
            Self::Pending => Some((0, 0)),
            Self::Geocoding => Some((0, 10)),
            Self::GridSearch => Some((10, 15)),
            Self::PrimaryScrape => Some((15, 65)),
            Self::Supplement => Some((65, 80)),
            Self::Dedup => Some((80, 90)),
            Self::Enriching => Some((90, 99)),
            Self::Completed => Some((100, 100)),
            Self::Failed | Self::Cancelled => None,
        }
    }

    /// Human readable label for the current step.
    #[must_use]
    pub fn step_label(self) -> &'static str {
        match self {
            Self::Pending => "Queued",
            Self::Geocoding => "Geocoding location",
            Self::GridSearch => "Generating search grid",
            Self::PrimaryScrape => "Scraping map listings",
            Self::Supplement => "Querying search API",
            Self::Dedup => "Deduplicating results",
            Self::Enriching => "Enriching contacts",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Geocoding => 1,
            Self::GridSearch => 2,
            Self::PrimaryScrape => 3,
            Self::Supplement => 4,
            Self::Dedup => 5,
            Self::Enriching => 6,
            Self::Completed => 7,
            Self::Failed | Self::Cancelled => 8,
        }
    }

    /// Whether `self` comes strictly before `other` in pipeline order.
    #[must_use]
    pub fn precedes(self, other: Self) -> bool {
        self.rank() < other.rank()
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// Re-entering the current step is allowed so that a resumed job can
    /// persist the step it crashed in again.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal_failure() {
            return true;
        }
        next.rank() >= self.rank()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-status of one collector layer within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerStatus {
    /// Not started
    Idle,
    /// In progress
    Running,
    /// Finished
    Completed,
    /// Not run (quota exhausted, no API key, disabled)
    Skipped,
    /// Gave up on the layer
    Failed,
}

impl LayerStatus {
    /// Stable string form stored in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    /// Parse from the database string form, defaulting to `Idle`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "skipped" => Self::Skipped,
            "failed" => Self::Failed,
            _ => Self::Idle,
        }
    }

    /// Whether the layer will not run again for this job.
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }
}

impl fmt::Display for LayerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the job's location string should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    /// Street address
    Address,
    /// Explicit latitude/longitude
    Coordinates,
    /// City name
    City,
    /// State or region
    State,
    /// Country
    Country,
    /// Postal code
    Pincode,
}

impl LocationType {
    /// Stable string form stored in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Address => "address",
            Self::Coordinates => "coordinates",
            Self::City => "city",
            Self::State => "state",
            Self::Country => "country",
            Self::Pincode => "pincode",
        }
    }

    /// Parse from the string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "address" => Self::Address,
            "coordinates" => Self::Coordinates,
            "city" => Self::City,
            "state" => Self::State,
            "country" => Self::Country,
            "pincode" => Self::Pincode,
            _ => return None,
        })
    }
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External data source a record came from.
///
/// Declaration order is merge precedence: earlier sources win ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Browser-driven map scraping
    Primary,
    /// Metered search API
    Supplement,
    /// Metered enrichment API
    Enrichment,
}

impl Source {
    /// Provenance tag used in the database and in lead `source` strings.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Supplement => "supplement",
            Self::Enrichment => "enrichment",
        }
    }

    /// Parse a single provenance tag.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "primary" => Self::Primary,
            "supplement" => Self::Supplement,
            "enrichment" => Self::Enrichment,
            _ => return None,
        })
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated status of a batch of jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Created, never aggregated
    Pending,
    /// At least one child is not terminal
    Running,
    /// Every child completed
    Completed,
    /// Every child terminal and at least one failed or cancelled
    Failed,
}

impl BatchStatus {
    /// Stable string form stored in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse from the database string form, defaulting to `Pending`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Derive the batch status from its children's statuses.
    ///
    /// Cancelled children count as failures. A batch without children stays
    /// `Pending`.
    pub fn aggregate<I>(children: I) -> Self
    where
        I: IntoIterator<Item = JobStatus>,
    {
        let mut any = false;
        let mut all_terminal = true;
        let mut any_failure = false;

        for status in children {
            any = true;
            all_terminal &= status.is_terminal();
            any_failure |= status.is_terminal_failure();
        }

        match (any, all_terminal, any_failure) {
            (false, _, _) => Self::Pending,
            (true, true, false) => Self::Completed,
            (true, true, true) => Self::Failed,
            (true, false, _) => Self::Running,
        }
    }

    /// Whether the batch will not change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input for creating a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Business keyword, e.g. `"coffee shop"`
    pub keyword: String,
    /// Free-form location string
    pub location: String,
    /// Interpretation of `location`
    pub location_type: LocationType,
    /// Search radius in kilometers, `(0, 50]`
    pub radius_km: f64,
    /// Latitude, required when `location_type` is `coordinates`
    #[serde(default)]
    pub latitude: Option<f64>,
    /// Longitude, required when `location_type` is `coordinates`
    #[serde(default)]
    pub longitude: Option<f64>,
    /// Optional contact to notify on completion
    #[serde(default)]
    pub notify_contact: Option<String>,
}

impl JobRequest {
    /// Check all field constraints.
    pub fn validate(&self) -> Result<()> {
        check_length("keyword", &self.keyword, 200)?;
        check_length("location", &self.location, 500)?;

        if !self.radius_km.is_finite() || self.radius_km <= 0.0 || self.radius_km > MAX_RADIUS_KM
        {
            return Err(LeadgridError::Validation(format!(
                "radius_km must be within (0, {MAX_RADIUS_KM}], got {}",
                self.radius_km
            )));
        }

        if let Some(lat) = self.latitude {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(LeadgridError::Validation(format!(
                    "latitude must be within [-90, 90], got {lat}"
                )));
            }
        }
        if let Some(lon) = self.longitude {
            if !(-180.0..=180.0).contains(&lon) {
                return Err(LeadgridError::Validation(format!(
                    "longitude must be within [-180, 180], got {lon}"
                )));
            }
        }

        if self.location_type == LocationType::Coordinates
            && (self.latitude.is_none() || self.longitude.is_none())
        {
            return Err(LeadgridError::Validation(
                "latitude and longitude are required for location_type 'coordinates'".to_string(),
            ));
        }

        Ok(())
    }

    /// Coordinates supplied with the request, if both halves are present.
    #[must_use]
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Coordinates::new(lat, lon).ok(),
            _ => None,
        }
    }
}

/// Input for creating a batch of jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Optional display name
    #[serde(default)]
    pub name: Option<String>,
    /// Optional contact to notify when the batch settles
    #[serde(default)]
    pub notify_contact: Option<String>,
    /// Child jobs, in submission order
    pub jobs: Vec<JobRequest>,
}

impl BatchRequest {
    /// Check the batch size and every child job.
    pub fn validate(&self) -> Result<()> {
        if self.jobs.is_empty() || self.jobs.len() > MAX_BATCH_JOBS {
            return Err(LeadgridError::Validation(format!(
                "a batch must contain between 1 and {MAX_BATCH_JOBS} jobs, got {}",
                self.jobs.len()
            )));
        }
        for (index, job) in self.jobs.iter().enumerate() {
            job.validate().map_err(|e| {
                LeadgridError::Validation(format!("job {index}: {e}"))
            })?;
        }
        Ok(())
    }
}

fn check_length(field: &str, value: &str, max: usize) -> Result<()> {
    let len = value.trim().chars().count();
    if len == 0 || len > max {
        return Err(LeadgridError::Validation(format!(
            "{field} must be between 1 and {max} characters, got {len}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> JobRequest {
        JobRequest {
            keyword: "coffee shop".to_string(),
            location: "Austin, TX".to_string(),
            location_type: LocationType::City,
            radius_km: 3.0,
            latitude: None,
            longitude: None,
            notify_contact: None,
        }
    }

    #[test]
    fn test_job_status_round_trip_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::GridSearch,
            JobStatus::PrimaryScrape,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn test_job_status_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Geocoding));
        assert!(JobStatus::Geocoding.can_transition_to(JobStatus::Geocoding));
        assert!(JobStatus::Supplement.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Dedup.can_transition_to(JobStatus::PrimaryScrape));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Geocoding));
        assert!(JobStatus::GridSearch.precedes(JobStatus::Dedup));
        assert!(!JobStatus::Dedup.precedes(JobStatus::Dedup));
    }

    #[test]
    fn test_progress_ranges_are_contiguous() {
        let steps = [
            JobStatus::Geocoding,
            JobStatus::GridSearch,
            JobStatus::PrimaryScrape,
            JobStatus::Supplement,
            JobStatus::Dedup,
            JobStatus::Enriching,
        ];
        for pair in steps.windows(2) {
            let (_, end) = pair[0].progress_range().expect("range");
            let (start, _) = pair[1].progress_range().expect("range");
            assert_eq!(end, start);
        }
        assert_eq!(JobStatus::Failed.progress_range(), None);
    }

    #[test]
    fn test_batch_aggregate() {
        use JobStatus::{Cancelled, Completed, Failed, PrimaryScrape};

        assert_eq!(BatchStatus::aggregate(std::iter::empty()), BatchStatus::Pending);
        assert_eq!(
            BatchStatus::aggregate([Completed, Completed]),
            BatchStatus::Completed
        );
        assert_eq!(
            BatchStatus::aggregate([Completed, Failed]),
            BatchStatus::Failed
        );
        assert_eq!(
            BatchStatus::aggregate([Cancelled, Completed]),
            BatchStatus::Failed
        );
        assert_eq!(
            BatchStatus::aggregate([Failed, PrimaryScrape]),
            BatchStatus::Running
        );
    }

    #[test]
    fn test_job_request_validation() {
        assert!(request().validate().is_ok());

        let mut r = request();
        r.radius_km = 0.0;
        assert!(r.validate().is_err());

        let mut r = request();
        r.radius_km = 50.5;
        assert!(r.validate().is_err());

        let mut r = request();
        r.keyword = "   ".to_string();
        assert!(r.validate().is_err());

        let mut r = request();
        r.location_type = LocationType::Coordinates;
        r.latitude = Some(30.0);
        assert!(r.validate().is_err());
        r.longitude = Some(-97.0);
        assert!(r.validate().is_ok());
        assert!(r.coordinates().is_some());
    }

    #[test]
    fn test_batch_request_validation() {
        let empty = BatchRequest {
            name: None,
            notify_contact: None,
            jobs: vec![],
        };
        assert!(empty.validate().is_err());

        let mut bad = request();
        bad.radius_km = -1.0;
        let batch = BatchRequest {
            name: Some("Texas cafes".to_string()),
            notify_contact: None,
            jobs: vec![request(), bad],
        };
        let err = batch.validate().expect_err("second job is invalid");
        assert!(err.to_string().contains("job 1"));
    }

    #[test]
    fn test_location_type_serde() {
        let json = serde_json::to_string(&LocationType::Pincode).expect("serialize");
        assert_eq!(json, "\"pincode\"");
        assert_eq!(LocationType::parse("state"), Some(LocationType::State));
    }

    #[test]
    fn test_source_ordering() {
        assert!(Source::Primary < Source::Supplement);
        assert!(Source::Supplement < Source::Enrichment);
    }
}
