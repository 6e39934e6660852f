//! Configuration management for leadgrid.
//!
//! Provides TOML-based configuration with XDG-compliant paths and
//! `LEADGRID_*` environment variable overrides.

use crate::error::{ConfigError, ConfigResult};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration.
///
/// This is loaded from `~/.config/leadgrid/config.toml` (or platform equivalent).
/// If the file doesn't exist, default values are used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Database location
    pub database: DatabaseConfig,
    /// Geocoding service settings
    pub geocoder: GeocoderConfig,
    /// Search grid geometry
    pub grid: GridConfig,
    /// Browser automation settings
    pub browser: BrowserConfig,
    /// Retry and timeout policy for collectors
    pub scraping: ScrapingConfig,
    /// Monthly limits per metered source
    pub quota: QuotaConfig,
    /// Metered search API settings
    pub supplement: SupplementConfig,
    /// Metered enrichment API settings
    pub enrichment: EnrichmentConfig,
    /// Deduplication thresholds
    pub dedup: DedupConfig,
    /// Batch execution settings
    pub batch: BatchConfig,
}

impl AppConfig {
    /// Load configuration from disk, falling back to defaults if not found.
    ///
    /// # Errors
    /// Returns error if:
    /// - Config directory cannot be determined
    /// - File exists but cannot be read
    /// - File contents are not valid TOML
    pub fn load() -> ConfigResult<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path, falling back to defaults
    /// if the file does not exist.
    pub fn load_from(config_path: &Path) -> ConfigResult<Self> {
        if config_path.exists() {
            tracing::debug!("Loading config from {}", config_path.display());
            let contents = fs::read_to_string(config_path)?;
            let config: Self = toml::from_str(&contents)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::debug!("Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Load configuration with environment variable overrides.
    ///
    /// See [`AppConfig::apply_env_overrides`] for the supported variables.
    pub fn load_with_env() -> ConfigResult<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `LEADGRID_*` overrides using `lookup` to read variables.
    ///
    /// Supports the following environment variables:
    /// - `LEADGRID_DATABASE_PATH`: Database file path
    /// - `LEADGRID_HEADLESS`: Browser headless mode (true/false)
    /// - `LEADGRID_BROWSER_WORKERS`: Concurrent browser sessions
    /// - `LEADGRID_DETAIL_LIMIT`: Detail pages visited per cell
    /// - `LEADGRID_GEOCODER_USER_AGENT`: User agent sent to the geocoder
    /// - `LEADGRID_SUPPLEMENT_API_KEY`: Search API key
    /// - `LEADGRID_SUPPLEMENT_MONTHLY_LIMIT`: Search API monthly limit
    /// - `LEADGRID_ENRICHMENT_API_KEY`: Enrichment API key
    /// - `LEADGRID_ENRICHMENT_ENABLED`: Enrichment on/off (true/false)
    /// - `LEADGRID_ENRICHMENT_MONTHLY_LIMIT`: Enrichment monthly record limit
    /// - `LEADGRID_BATCH_CONCURRENCY`: Jobs run in parallel per batch
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("LEADGRID_DATABASE_PATH") {
            tracing::debug!("Override database.path from env: {}", val);
            self.database.path = Some(PathBuf::from(val));
        }

        if let Some(val) = lookup("LEADGRID_HEADLESS") {
            if let Ok(headless) = val.parse() {
                self.browser.headless = headless;
                tracing::debug!("Override browser.headless from env: {}", headless);
            }
        }

        if let Some(val) = lookup("LEADGRID_BROWSER_WORKERS") {
            if let Ok(workers) = val.parse() {
                self.browser.workers = workers;
                tracing::debug!("Override browser.workers from env: {}", workers);
            }
        }

        if let Some(val) = lookup("LEADGRID_DETAIL_LIMIT") {
            if let Ok(limit) = val.parse() {
                self.browser.detail_limit = limit;
                tracing::debug!("Override browser.detail_limit from env: {}", limit);
            }
        }

        if let Some(val) = lookup("LEADGRID_GEOCODER_USER_AGENT") {
            tracing::debug!("Override geocoder.user_agent from env");
            self.geocoder.user_agent = val;
        }

        if let Some(val) = lookup("LEADGRID_SUPPLEMENT_API_KEY") {
            tracing::debug!("Override supplement.api_key from env");
            self.supplement.api_key = Some(val).filter(|k| !k.is_empty());
        }

        if let Some(val) = lookup("LEADGRID_SUPPLEMENT_MONTHLY_LIMIT") {
            if let Ok(limit) = val.parse() {
                self.quota.supplement_monthly_limit = limit;
                tracing::debug!("Override quota.supplement_monthly_limit from env: {}", limit);
            }
        }

        if let Some(val) = lookup("LEADGRID_ENRICHMENT_API_KEY") {
            tracing::debug!("Override enrichment.api_key from env");
            self.enrichment.api_key = Some(val).filter(|k| !k.is_empty());
        }

        if let Some(val) = lookup("LEADGRID_ENRICHMENT_ENABLED") {
            if let Ok(enabled) = val.parse() {
                self.enrichment.enabled = enabled;
                tracing::debug!("Override enrichment.enabled from env: {}", enabled);
            }
        }

        if let Some(val) = lookup("LEADGRID_ENRICHMENT_MONTHLY_LIMIT") {
            if let Ok(limit) = val.parse() {
                self.quota.enrichment_monthly_limit = limit;
                tracing::debug!("Override quota.enrichment_monthly_limit from env: {}", limit);
            }
        }

        if let Some(val) = lookup("LEADGRID_BATCH_CONCURRENCY") {
            if let Ok(concurrency) = val.parse() {
                self.batch.concurrency = concurrency;
                tracing::debug!("Override batch.concurrency from env: {}", concurrency);
            }
        }
    }

    /// Reject values the pipeline cannot work with.
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.grid.max_cell_radius_km.is_finite()
            || self.grid.max_cell_radius_km < MIN_CELL_RADIUS_KM
        {
            return Err(invalid(
                "grid.max_cell_radius_km",
                &format!("must be at least {MIN_CELL_RADIUS_KM} km"),
            ));
        }
        if !self.grid.overlap_factor.is_finite() {
            return Err(invalid("grid.overlap_factor", "must be finite"));
        }
        if self.browser.workers == 0 {
            return Err(invalid("browser.workers", "must be at least 1"));
        }
        if self.batch.concurrency == 0 {
            return Err(invalid("batch.concurrency", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.dedup.name_similarity_threshold) {
            return Err(invalid(
                "dedup.name_similarity_threshold",
                "must be within [0, 1]",
            ));
        }
        if self.dedup.max_distance_m < 0.0 {
            return Err(invalid("dedup.max_distance_m", "must not be negative"));
        }
        if self.enrichment.batch_size == 0 {
            return Err(invalid("enrichment.batch_size", "must be at least 1"));
        }
        Ok(())
    }

    /// Save configuration to disk.
    ///
    /// Creates the config directory if it doesn't exist.
    pub fn save(&self) -> ConfigResult<()> {
        let config_path = Self::config_path()?;
        self.save_to(&config_path)
    }

    /// Save configuration to an explicit path.
    pub fn save_to(&self, config_path: &Path) -> ConfigResult<()> {
        let config_dir = config_path
            .parent()
            .ok_or_else(|| invalid("config_path", "no parent directory"))?;

        fs::create_dir_all(config_dir)?;
        tracing::debug!("Saving config to {}", config_path.display());

        let contents = toml::to_string_pretty(self)?;
        fs::write(config_path, contents)?;
        Ok(())
    }

    /// Get the path to the configuration file.
    ///
    /// Uses XDG base directories: `~/.config/leadgrid/config.toml`
    pub fn config_path() -> ConfigResult<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Get the data directory path.
    ///
    /// Uses XDG base directories: `~/.local/share/leadgrid`
    pub fn data_dir() -> ConfigResult<PathBuf> {
        Ok(Self::project_dirs()?.data_dir().to_path_buf())
    }

    /// Resolved database path: the configured one, else `leadgrid.db` in
    /// the data directory.
    pub fn database_path(&self) -> ConfigResult<PathBuf> {
        match &self.database.path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join("leadgrid.db")),
        }
    }

    fn project_dirs() -> ConfigResult<ProjectDirs> {
        ProjectDirs::from("com", "leadgrid", "leadgrid").ok_or(ConfigError::NoConfigDir)
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Database location and pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file; defaults to the XDG data directory
    pub path: Option<PathBuf>,
    /// Pool size
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 5,
        }
    }
}

/// Geocoding service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocoderConfig {
    /// Nominatim-compatible base URL
    pub base_url: String,
    /// User agent; the public service rejects anonymous clients
    pub user_agent: String,
    /// Minimum delay between any two requests in the process
    pub min_interval_ms: u64,
    /// Attempts for transient failures
    pub max_attempts: u32,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            user_agent: "leadgrid/0.1.0 (+https://github.com/leadgrid/leadgrid)".to_string(),
            min_interval_ms: 1000,
            max_attempts: 3,
            timeout_secs: 15,
        }
    }
}

/// Smallest cell radius accepted. Below it a 50 km job would need tens of
/// thousands of browser sessions.
pub const MIN_CELL_RADIUS_KM: f64 = 0.5;

/// Search grid geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Largest radius a single cell may cover, at least [`MIN_CELL_RADIUS_KM`]
    pub max_cell_radius_km: f64,
    /// Fraction of overlap between neighbouring cells, clamped to `[0, 0.5]`
    pub overlap_factor: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            max_cell_radius_km: 5.0,
            overlap_factor: 0.2,
        }
    }
}

/// Browser automation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Run browser in headless mode
    pub headless: bool,
    /// Concurrent browser sessions across grid cells
    pub workers: usize,
    /// Navigation timeout in seconds
    pub navigation_timeout_secs: u64,
    /// Listings per cell whose detail page is visited (0 disables)
    pub detail_limit: usize,
    /// Stop scrolling once this many listings are visible
    pub max_results_per_cell: usize,
    /// Upper bound on feed scrolls per cell
    pub max_scrolls: u32,
    /// Pause after each scroll in milliseconds
    pub scroll_pause_ms: u64,
    /// Map zoom level used in search URLs
    pub zoom: u8,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            workers: 2,
            navigation_timeout_secs: 30,
            detail_limit: 10,
            max_results_per_cell: 60,
            max_scrolls: 8,
            scroll_pause_ms: 1500,
            zoom: 14,
        }
    }
}

/// Retry and timeout policy for collectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapingConfig {
    /// Attempts per grid cell before it is skipped
    pub cell_attempts: u32,
    /// Attempts per detail page before it is skipped
    pub detail_attempts: u32,
    /// Base delay for exponential backoff in milliseconds
    pub retry_base_ms: u64,
    /// Wall-clock bound on one cell, retries included
    pub cell_timeout_secs: u64,
    /// Lower bound of the random pause between detail pages
    pub detail_delay_min_ms: u64,
    /// Upper bound of the random pause between detail pages
    pub detail_delay_max_ms: u64,
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            cell_attempts: 3,
            detail_attempts: 2,
            retry_base_ms: 5000,
            cell_timeout_secs: 300,
            detail_delay_min_ms: 3000,
            detail_delay_max_ms: 8000,
        }
    }
}

/// Monthly limits per metered source. `0` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Search API calls per calendar month
    pub supplement_monthly_limit: u64,
    /// Enrichment records per calendar month
    pub enrichment_monthly_limit: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            supplement_monthly_limit: 100,
            enrichment_monthly_limit: 500,
        }
    }
}

/// Metered search API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupplementConfig {
    /// API key; the layer is skipped without one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Endpoint URL
    pub base_url: String,
    /// Maximum requests per second
    pub requests_per_second: u32,
    /// Price per call, for the job cost estimate
    pub cost_per_call_usd: f64,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for SupplementConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://serpapi.com/search.json".to_string(),
            requests_per_second: 5,
            cost_per_call_usd: 0.0,
            timeout_secs: 30,
        }
    }
}

/// Metered enrichment API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Whether the enrichment step runs at all
    pub enabled: bool,
    /// API key; the layer is skipped without one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Endpoint URL
    pub base_url: String,
    /// Records per API request
    pub batch_size: usize,
    /// Price per enriched record, for the job cost estimate
    pub cost_per_record_usd: f64,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Scrape lead websites for contacts when no API key is set
    pub website_fallback: bool,
    /// Per-page timeout for the website fallback, in seconds
    pub website_timeout_secs: u64,
    /// Websites visited at once by the fallback
    pub website_concurrency: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            base_url: "https://api.app.outscraper.com/maps/search-v3".to_string(),
            batch_size: 20,
            cost_per_record_usd: 0.0,
            timeout_secs: 120,
            website_fallback: true,
            website_timeout_secs: 10,
            website_concurrency: 4,
        }
    }
}

/// Deduplication thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Minimum token-sort name similarity, `[0, 1]`
    pub name_similarity_threshold: f64,
    /// Maximum distance between fuzzy matches, meters
    pub max_distance_m: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            name_similarity_threshold: 0.85,
            max_distance_m: 100.0,
        }
    }
}

/// Batch execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Child jobs executed concurrently
    pub concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.quota.supplement_monthly_limit, 100);
        assert_eq!(config.quota.enrichment_monthly_limit, 500);
        assert!((config.grid.overlap_factor - 0.2).abs() < f64::EPSILON);
        assert!((config.grid.max_cell_radius_km - 5.0).abs() < f64::EPSILON);
        assert_eq!(config.geocoder.min_interval_ms, 1000);
        assert_eq!(config.batch.concurrency, 1);
        assert!(config.browser.headless);
        assert!(config.supplement.api_key.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("[grid]"));
        assert!(toml_str.contains("[quota]"));
        assert!(!toml_str.contains("api_key"));

        let parsed: AppConfig = toml::from_str(&toml_str).expect("parse serialized config");
        assert_eq!(parsed.browser.workers, config.browser.workers);
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().expect("create temp dir");
        let config_path = tmp.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.browser.workers = 4;
        config.supplement.api_key = Some("key-123".to_string());

        config.save_to(&config_path).expect("save config");
        let loaded = AppConfig::load_from(&config_path).expect("load config");

        assert_eq!(loaded.browser.workers, 4);
        assert_eq!(loaded.supplement.api_key.as_deref(), Some("key-123"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = TempDir::new().expect("create temp dir");
        let loaded =
            AppConfig::load_from(&tmp.path().join("absent.toml")).expect("defaults on missing");
        assert_eq!(loaded.enrichment.batch_size, 20);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LEADGRID_HEADLESS", "false"),
            ("LEADGRID_BROWSER_WORKERS", "6"),
            ("LEADGRID_SUPPLEMENT_API_KEY", "serp-key"),
            ("LEADGRID_ENRICHMENT_API_KEY", ""),
            ("LEADGRID_SUPPLEMENT_MONTHLY_LIMIT", "not-a-number"),
            ("LEADGRID_DATABASE_PATH", "/tmp/leads.db"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env_overrides(|key| vars.get(key).map(ToString::to_string));

        assert!(!config.browser.headless);
        assert_eq!(config.browser.workers, 6);
        assert_eq!(config.supplement.api_key.as_deref(), Some("serp-key"));
        assert!(config.enrichment.api_key.is_none());
        // Unparseable values leave the default in place
        assert_eq!(config.quota.supplement_monthly_limit, 100);
        assert_eq!(
            config.database_path().expect("database path"),
            PathBuf::from("/tmp/leads.db")
        );
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[grid]
overlap_factor = 0.3

[dedup]
max_distance_m = 75.0
"#;

        let config: AppConfig = toml::from_str(toml_str).expect("parse partial config");
        assert!((config.grid.overlap_factor - 0.3).abs() < f64::EPSILON);
        assert!((config.dedup.max_distance_m - 75.0).abs() < f64::EPSILON);
        // These should be defaults
        assert!((config.grid.max_cell_radius_km - 5.0).abs() < f64::EPSILON);
        assert_eq!(config.browser.workers, 2);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.browser.workers = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.dedup.name_similarity_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tiny_cells() {
        let mut config = AppConfig::default();
        config.grid.max_cell_radius_km = 0.001;
        let err = config.validate().expect_err("tiny cells");
        assert!(err.to_string().contains("grid.max_cell_radius_km"));

        config.grid.max_cell_radius_km = MIN_CELL_RADIUS_KM;
        assert!(config.validate().is_ok());
    }
}
