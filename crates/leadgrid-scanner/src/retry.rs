//! Retry glue for collectors: the shared backoff loop plus the timeout
//! mapping used around browser and HTTP waits.

use crate::error::ScanError;

pub use leadgrid_core::retry::{retry_with_backoff, RetryPolicy};

/// Map an elapsed tokio timeout into a transient error.
pub(crate) fn timeout_error(what: impl Into<String>) -> ScanError {
    ScanError::Timeout(what.into())
}
