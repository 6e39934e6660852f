use crate::error::{BrowserError, Result};

/// Page-level actions used by the map collector.
///
/// Implemented by [`crate::BrowserSession`] for a real browser and by test
/// doubles that serve canned HTML.
#[async_trait::async_trait]
pub trait BrowserActions: Send + Sync {
    /// Navigate to a URL
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Click an element by selector
    async fn click(&self, selector: &str) -> Result<()>;

    /// Wait for a selector to appear
    async fn wait_for_selector(&self, selector: &str, timeout_ms: u64) -> Result<()>;

    /// Number of elements matching a selector
    async fn count(&self, selector: &str) -> Result<usize>;

    /// Scroll a scrollable container to its bottom.
    ///
    /// Returns `false` if no element matched.
    async fn scroll_to_bottom(&self, selector: &str) -> Result<bool>;

    /// Full HTML of the current page
    async fn content(&self) -> Result<String>;

    /// URL the page ended up on after redirects
    async fn current_url(&self) -> Result<Option<String>>;

    /// Close the page
    async fn close(&self) -> Result<()>;
}

/// Opens independent browser sessions.
#[async_trait::async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open a fresh session with its own fingerprint.
    async fn open_session(&self) -> Result<Box<dyn BrowserActions>>;
}

/// Helper to extract domain from URL
pub fn extract_domain(url: &str) -> Result<String> {
    let url = url::Url::parse(url)
        .map_err(|e| BrowserError::NavigationError(format!("Invalid URL: {}", e)))?;

    url.host_str()
        .ok_or_else(|| BrowserError::NavigationError("No host in URL".to_string()))
        .map(|s| s.to_string())
}

/// Whether a URL is a cookie-consent interstitial rather than the target page.
pub fn is_consent_url(url: &str) -> bool {
    extract_domain(url)
        .map(|host| host.starts_with("consent."))
        .unwrap_or(false)
}

/// JavaScript that scrolls the first element matching `selector` to its
/// bottom and reports whether it exists.
pub(crate) fn scroll_script(selector: &str) -> String {
    // JSON string quoting is valid JavaScript string syntax.
    let quoted = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        "(() => {{ const el = document.querySelector({quoted}); \
         if (!el) {{ return false; }} el.scrollTop = el.scrollHeight; return true; }})()"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            extract_domain("https://www.google.com/maps/search/coffee").unwrap(),
            "www.google.com"
        );
        assert_eq!(
            extract_domain("http://subdomain.example.com:8080/path").unwrap(),
            "subdomain.example.com"
        );
    }

    #[test]
    fn test_extract_domain_invalid() {
        assert!(extract_domain("not-a-url").is_err());
    }

    #[test]
    fn test_is_consent_url() {
        assert!(is_consent_url(
            "https://consent.google.com/ml?continue=https://www.google.com/maps"
        ));
        assert!(!is_consent_url("https://www.google.com/maps/search/coffee"));
        assert!(!is_consent_url("garbage"));
    }

    #[test]
    fn test_scroll_script_quotes_selector() {
        let script = scroll_script(r#"div[role="feed"]"#);
        assert!(script.contains(r#"document.querySelector("div[role=\"feed\"]")"#));
    }
}
