//! The data source abstraction every collector implements.

use crate::enrichment::select_targets;
use crate::error::Result;
use async_trait::async_trait;
use leadgrid_core::{Coordinates, Enrichment, Listing, Source};
use leadgrid_db::Lead;
use leadgrid_geo::GridCell;

/// One grid cell to search for a keyword.
#[derive(Debug, Clone)]
pub struct CellQuery {
    /// Owning job, for log context
    pub job_id: String,
    /// Business keyword
    pub keyword: String,
    /// Location label as submitted (used in search phrases)
    pub location: String,
    /// Cell to search
    pub cell: GridCell,
}

/// An existing lead to enrich.
#[derive(Debug, Clone)]
pub struct EnrichmentTarget {
    /// Lead identifier the result is written back to
    pub lead_id: String,
    /// Business name
    pub name: String,
    /// Street address
    pub address: Option<String>,
    /// Place identifier, if known
    pub place_id: Option<String>,
    /// Lead coordinates, if known
    pub coordinates: Option<Coordinates>,
    /// Business website, if known
    pub website: Option<String>,
}

/// What a source is asked to fetch.
#[derive(Debug, Clone)]
pub enum FetchScope {
    /// Listings around one grid cell
    Cell(CellQuery),
    /// Contact data for existing leads
    Leads(Vec<EnrichmentTarget>),
}

/// Result of one fetch.
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    /// New listings (cell fetches)
    pub listings: Vec<Listing>,
    /// Enrichment data keyed by lead id (lead fetches)
    pub enrichments: Vec<(String, Enrichment)>,
    /// Metered units consumed: pages loaded, API calls or records
    pub units: u64,
    /// Nothing was fetched because the monthly quota is used up
    pub skipped_over_limit: bool,
}

impl SourceBatch {
    /// Empty, non-error result for an exhausted quota.
    #[must_use]
    pub fn over_limit() -> Self {
        Self {
            skipped_over_limit: true,
            ..Self::default()
        }
    }
}

/// A collector the orchestrator can dispatch to.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Provenance tag for records from this source.
    fn source(&self) -> Source;

    /// Whether the source can run at all (credentials present, enabled).
    fn is_configured(&self) -> bool {
        true
    }

    /// Leads this source can enrich, at most `remaining` of them.
    fn targets(&self, leads: &[Lead], remaining: u64) -> Vec<EnrichmentTarget> {
        select_targets(leads, remaining)
    }

    /// Fetch one unit of work.
    async fn fetch(&self, scope: &FetchScope) -> Result<SourceBatch>;
}
