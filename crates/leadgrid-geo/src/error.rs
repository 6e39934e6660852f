//! Error types for geocoding.

use thiserror::Error;

/// Errors that can occur while resolving a location.
#[derive(Error, Debug)]
pub enum GeoError {
    /// The service answered but had no match for the query
    #[error("location not found: {0}")]
    NotFound(String),

    /// Non-success HTTP status from the service
    #[error("geocoder returned status {status}: {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Transport-level failure
    #[error("geocoder request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The response body could not be interpreted
    #[error("failed to parse geocoder response: {0}")]
    Parse(String),

    /// Invalid input or output coordinates
    #[error("invalid location: {0}")]
    Invalid(String),
}

impl GeoError {
    /// Whether retrying the same request may succeed.
    ///
    /// Server errors, throttling and transport failures are transient; a
    /// missing match or a client error is not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Request(_) => true,
            Self::NotFound(_) | Self::Parse(_) | Self::Invalid(_) => false,
        }
    }
}

impl leadgrid_core::Transient for GeoError {
    fn is_transient(&self) -> bool {
        GeoError::is_transient(self)
    }
}

impl From<leadgrid_core::LeadgridError> for GeoError {
    fn from(err: leadgrid_core::LeadgridError) -> Self {
        Self::Invalid(err.to_string())
    }
}

/// Result type alias for geocoding operations.
pub type Result<T> = std::result::Result<T, GeoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(GeoError::Http {
            status: 503,
            message: "unavailable".to_string()
        }
        .is_transient());
        assert!(GeoError::Http {
            status: 429,
            message: "slow down".to_string()
        }
        .is_transient());
        assert!(!GeoError::Http {
            status: 403,
            message: "forbidden".to_string()
        }
        .is_transient());
        assert!(!GeoError::NotFound("Atlantis".to_string()).is_transient());
    }
}
