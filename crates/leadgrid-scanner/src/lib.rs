//! Leadgrid Scanner - multi-source listing collection.
//!
//! This crate runs lead-generation jobs: it resolves a location, covers
//! the search area with a grid of cells, collects listings from a headless
//! Maps browser and a paid search API, merges duplicates into leads and
//! optionally enriches them with contact data, from a paid API or, without
//! a key, from each business's own website.
//!
//! # Features
//!
//! - Per-cell checkpoints so interrupted jobs resume without repeating work
//! - Retry with exponential backoff for transient browser and API failures
//! - CAPTCHA and consent-wall detection
//! - Monthly quota enforcement for metered sources
//! - Bounded parallelism for cells and for batch children
//!
//! # Example
//!
//! ```rust,ignore
//! use leadgrid_scanner::Pipeline;
//! use std::sync::Arc;
//!
//! let pipeline = Pipeline::new(
//!     database,
//!     Arc::new(config),
//!     Arc::new(geocoder),
//!     Arc::new(primary),
//!     Arc::new(supplement),
//!     quota,
//! )
//! .with_enrichment(Arc::new(enrichment));
//!
//! let status = pipeline.run_job(&job_id).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod batch;
pub mod dedup;
pub mod enrichment;
#[allow(missing_docs)]
pub mod error;
pub mod orchestrator;
#[allow(missing_docs)]
pub mod parser;
pub mod primary;
pub mod quota;
pub mod retry;
pub mod source;
pub mod supplement;
#[allow(missing_docs)]
pub mod url_builder;
pub mod website;

// Re-export commonly used types
pub use batch::BatchRunner;
pub use dedup::{name_similarity, Deduplicator};
pub use enrichment::{select_targets, EnrichmentCollector};
pub use error::{Result, ScanError};
pub use orchestrator::{CellOutcome, Pipeline};
pub use primary::PrimaryCollector;
pub use quota::{month_key, QuotaReservation, QuotaTracker};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use source::{CellQuery, DataSource, EnrichmentTarget, FetchScope, SourceBatch};
pub use supplement::SupplementCollector;
pub use url_builder::build_search_url;
pub use website::{extract_contacts, select_website_targets, WebsiteEnricher};
