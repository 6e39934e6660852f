use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("CAPTCHA or unusual-traffic page at {url}")]
    CaptchaRequired { url: String },

    #[error("consent page could not be dismissed at {url}")]
    ConsentWall { url: String },

    #[error("{source_name} API returned status {status}: {message}")]
    Api {
        source_name: &'static str,
        status: u16,
        message: String,
    },

    #[error("{source_name} API error: {message}")]
    ApiResponse {
        source_name: &'static str,
        message: String,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("job cancelled")]
    Cancelled,

    #[error("Geocoding error: {0}")]
    Geo(#[from] leadgrid_geo::GeoError),

    #[error("Database error: {0}")]
    Database(#[from] leadgrid_db::DatabaseError),

    #[error("Browser error: {0}")]
    Browser(#[from] leadgrid_browser::BrowserError),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ScanError {
    /// Whether the failed unit of work may succeed if attempted again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::CaptchaRequired { .. }
            | Self::ConsentWall { .. }
            | Self::Timeout(_)
            | Self::Browser(_)
            | Self::Request(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Geo(e) => e.is_transient(),
            Self::ApiResponse { .. }
            | Self::Cancelled
            | Self::Database(_)
            | Self::Parse(_) => false,
        }
    }
}

impl leadgrid_core::Transient for ScanError {
    fn is_transient(&self) -> bool {
        ScanError::is_transient(self)
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ScanError::CaptchaRequired {
            url: "https://www.google.com/sorry/index".to_string()
        }
        .is_transient());
        assert!(ScanError::Api {
            source_name: "search",
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(!ScanError::Api {
            source_name: "search",
            status: 401,
            message: "Invalid API key".to_string()
        }
        .is_transient());
        assert!(!ScanError::Cancelled.is_transient());
    }
}
