//! Leadgrid Core - Foundation crate for the leadgrid collection pipeline.
//!
//! This crate provides the shared types, error handling, configuration and
//! spherical geometry that every other leadgrid crate depends on.
//!
//! # Modules
//!
//! - [`error`] - Central error types using thiserror
//! - [`config`] - TOML-based configuration with XDG paths and `LEADGRID_*` overrides
//! - [`types`] - Shared enums and request types (`JobStatus`, `Source`, `JobRequest`, ...)
//! - [`geo`] - Coordinates and great-circle distance helpers
//! - [`listing`] - Listing and enrichment records shared by collectors and storage
//! - [`retry`] - Bounded exponential backoff used by every remote call
//!
//! # Example
//!
//! ```rust
//! use leadgrid_core::{AppConfig, Coordinates};
//!
//! let config = AppConfig::default();
//! let austin = Coordinates::new(30.2672, -97.7431).expect("valid coordinates");
//! let dallas = Coordinates::new(32.7767, -96.7970).expect("valid coordinates");
//! assert!(austin.distance_km(&dallas) > 250.0);
//! assert_eq!(config.batch.concurrency, 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod config;
pub mod error;
pub mod geo;
pub mod listing;
pub mod retry;
pub mod types;

// Re-export commonly used types
pub use config::{
    AppConfig, BatchConfig, BrowserConfig, DatabaseConfig, DedupConfig, EnrichmentConfig,
    GeocoderConfig, GridConfig, QuotaConfig, ScrapingConfig, SupplementConfig,
    MIN_CELL_RADIUS_KM,
};
pub use error::{ConfigError, ConfigResult, LeadgridError, Result};
pub use geo::{Coordinates, EARTH_RADIUS_KM};
pub use listing::{normalize_name, normalize_place_id, Enrichment, Listing};
pub use retry::{retry_with_backoff, RetryPolicy, Transient};
pub use types::{
    BatchRequest, BatchStatus, JobRequest, JobStatus, LayerStatus, LocationType, Source,
};
