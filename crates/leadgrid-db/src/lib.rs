//! Leadgrid Database Layer
//!
//! Provides `SQLite` persistence for the collection pipeline: jobs, batches,
//! deduplicated leads and the raw per-cell collector output that makes jobs
//! resumable.
//!
//! # Example
//!
//! ```ignore
//! use leadgrid_db::Database;
//!
//! let db = Database::new("leadgrid.db").await?;
//! db.run_migrations().await?;
//! ```
//!
//! # Design Principles
//!
//! - Runtime `sqlx::query` with explicit binds and manual row parsing
//! - Timestamps are stored as RFC 3339 strings
//! - Every job state change is a guarded `UPDATE` that refuses to touch
//!   terminal jobs, so a late writer can never resurrect a finished job

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

/// Batch creation and status aggregation.
pub mod batches;
pub mod connection;
pub mod error;
/// Job records and their state machine writes.
pub mod jobs;
/// Deduplicated lead storage.
pub mod leads;
pub mod migrations;
/// Per-cell collector output and checkpoints.
pub mod raw_listings;

// Re-export commonly used types
pub use batches::Batch;
pub use error::{DatabaseError, Result};
pub use jobs::{CancelOutcome, Job};
pub use leads::{Lead, LeadAnnotations};

use sqlx::{Pool, Sqlite};
use std::path::Path;

/// High-level database interface.
///
/// Pools are `Arc`-based, so cloning a `Database` shares connections.
#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open (creating if needed) the database at `path`.
    ///
    /// # Arguments
    /// * `path` - Path to the database file (or `:memory:` for in-memory)
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_max_connections(path, connection::DEFAULT_MAX_CONNECTIONS).await
    }

    /// Open the database with an explicit pool size.
    pub async fn with_max_connections(path: impl AsRef<Path>, max: u32) -> Result<Self> {
        let pool = connection::open_pool(path, max).await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Run all pending database migrations.
    ///
    /// # Errors
    /// Returns `DatabaseError::Migration` if any migration fails.
    pub async fn run_migrations(&self) -> Result<()> {
        migrations::run_migrations(&self.pool).await
    }

    /// Get the current schema version.
    pub async fn get_schema_version(&self) -> Result<i64> {
        migrations::get_schema_version(&self.pool).await
    }

    /// Get a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Close the database connection gracefully.
    pub async fn close(self) {
        self.pool.close().await;
        tracing::info!("Database pool closed");
    }
}

/// Current time as an RFC 3339 string.
pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Parse a stored RFC 3339 timestamp.
pub(crate) fn parse_timestamp(
    field: &str,
    value: &str,
) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| DatabaseError::Decode(format!("{field}: {e}")))
}

/// Parse an optional stored RFC 3339 timestamp.
pub(crate) fn parse_optional_timestamp(
    field: &str,
    value: Option<String>,
) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    value.map(|v| parse_timestamp(field, &v)).transpose()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Database;

    pub async fn setup_test_db() -> Database {
        let db = Database::new(":memory:")
            .await
            .expect("create test database");
        db.run_migrations().await.expect("run migrations");
        db
    }
}
