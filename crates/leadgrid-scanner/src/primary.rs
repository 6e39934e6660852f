//! Browser-driven collector for the map search surface.
//!
//! Each grid cell gets its own browser session: load the search URL pinned
//! to the cell center, get past the consent interstitial, scroll the results
//! feed until it stops growing, then visit the first few place pages for
//! contact details.

use crate::error::{Result, ScanError};
use crate::parser::{
    detect_captcha, is_end_of_results, parse_detail, parse_feed, parse_place_page, FEED_ITEM_SELECTOR,
    FEED_SELECTOR, PLACE_PANEL_SELECTOR,
};
use crate::retry::{retry_with_backoff, timeout_error, RetryPolicy};
use crate::source::{CellQuery, DataSource, FetchScope, SourceBatch};
use crate::url_builder::{build_search_url, is_place_url};
use async_trait::async_trait;
use leadgrid_browser::{is_consent_url, BrowserActions, BrowserError, SessionFactory};
use leadgrid_core::{BrowserConfig, Listing, ScrapingConfig, Source};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// How long to wait for the results feed to render.
const FEED_WAIT_MS: u64 = 15_000;

/// Extra settle time before concluding the feed stopped growing.
const SETTLE_PAUSE: Duration = Duration::from_secs(1);

/// Buttons that dismiss the cookie-consent interstitial, tried in order.
const CONSENT_BUTTONS: [&str; 4] = [
    "#L2AGLb",
    r#"button[aria-label="Accept all"]"#,
    r#"button[aria-label="Reject all"]"#,
    r#"form[action*="consent"] button"#,
];

/// Collects listings for one grid cell per fetch.
pub struct PrimaryCollector {
    sessions: Arc<dyn SessionFactory>,
    browser: BrowserConfig,
    scraping: ScrapingConfig,
}

impl PrimaryCollector {
    pub fn new(
        sessions: Arc<dyn SessionFactory>,
        browser: BrowserConfig,
        scraping: ScrapingConfig,
    ) -> Self {
        Self {
            sessions,
            browser,
            scraping,
        }
    }

    fn cell_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.scraping.cell_attempts,
            Duration::from_millis(self.scraping.retry_base_ms),
            3,
        )
    }

    fn detail_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.scraping.detail_attempts,
            Duration::from_millis(self.scraping.retry_base_ms),
            2,
        )
    }

    fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.browser.navigation_timeout_secs.max(1))
    }

    /// Random pause between detail pages.
    fn detail_pause(&self) -> Duration {
        let low = self.scraping.detail_delay_min_ms;
        let high = self.scraping.detail_delay_max_ms.max(low);
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }

    /// One attempt at a cell in a fresh session. The session is always
    /// closed, including when the attempt is dropped by an outer timeout.
    async fn scrape_cell(&self, query: &CellQuery) -> Result<SourceBatch> {
        let session: Arc<dyn BrowserActions> = Arc::from(self.sessions.open_session().await?);
        let guard = CloseOnDrop::new(Arc::clone(&session), query.cell.index);
        let result = self.scrape_with_session(session.as_ref(), query).await;
        guard.close().await;
        result
    }

    async fn scrape_with_session(
        &self,
        session: &dyn BrowserActions,
        query: &CellQuery,
    ) -> Result<SourceBatch> {
        let url = build_search_url(
            &query.keyword,
            &query.location,
            query.cell.center,
            self.browser.zoom,
        );
        tracing::debug!("Cell {} for job {}: loading {}", query.cell.index, query.job_id, url);

        self.with_timeout("search page", session.navigate(&url)).await?;
        self.dismiss_consent(session).await?;
        ensure_not_blocked(session).await?;

        let mut batch = SourceBatch {
            units: 1,
            ..SourceBatch::default()
        };

        match session.wait_for_selector(FEED_SELECTOR, FEED_WAIT_MS).await {
            Ok(()) => {}
            Err(BrowserError::Timeout(_) | BrowserError::SelectorNotFound(_)) => {
                // No feed: either a direct hit on a single place or no results.
                let current = session.current_url().await?.unwrap_or_default();
                if is_place_url(&current) {
                    let html = session.content().await?;
                    batch.listings.extend(parse_place_page(&html, &current));
                } else {
                    tracing::info!("Cell {} for job {}: no results", query.cell.index, query.job_id);
                }
                tag_cell(&mut batch.listings, query.cell.index);
                return Ok(batch);
            }
            Err(e) => return Err(e.into()),
        }

        self.scroll_feed(session).await?;

        let html = session.content().await?;
        let mut listings = parse_feed(&html);
        listings.truncate(self.browser.max_results_per_cell);

        batch.units += self.fetch_details(session, query, &mut listings).await;
        tag_cell(&mut listings, query.cell.index);

        tracing::info!(
            "Cell {} for job {}: {} listings",
            query.cell.index,
            query.job_id,
            listings.len()
        );
        batch.listings = listings;
        Ok(batch)
    }

    async fn with_timeout<T>(
        &self,
        what: &str,
        task: impl Future<Output = std::result::Result<T, BrowserError>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.navigation_timeout(), task).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(timeout_error(format!("{what} navigation"))),
        }
    }

    async fn dismiss_consent(&self, session: &dyn BrowserActions) -> Result<()> {
        let Some(url) = session.current_url().await? else {
            return Ok(());
        };
        if !is_consent_url(&url) {
            return Ok(());
        }

        tracing::debug!("Consent interstitial at {}", url);
        for selector in CONSENT_BUTTONS {
            if session.click(selector).await.is_ok() {
                tokio::time::sleep(SETTLE_PAUSE).await;
                break;
            }
        }

        match session.current_url().await? {
            Some(url) if is_consent_url(&url) => Err(ScanError::ConsentWall { url }),
            _ => Ok(()),
        }
    }

    /// Scroll until the end marker shows, the result cap is reached, the
    /// feed stops growing or the scroll budget runs out.
    async fn scroll_feed(&self, session: &dyn BrowserActions) -> Result<()> {
        let pause = Duration::from_millis(self.browser.scroll_pause_ms);
        let mut previous = session.count(FEED_ITEM_SELECTOR).await?;

        for _ in 0..self.browser.max_scrolls {
            if previous >= self.browser.max_results_per_cell {
                break;
            }
            if !session.scroll_to_bottom(FEED_SELECTOR).await? {
                break;
            }
            tokio::time::sleep(pause).await;

            if is_end_of_results(&session.content().await?) {
                break;
            }

            let mut count = session.count(FEED_ITEM_SELECTOR).await?;
            if count == previous {
                tokio::time::sleep(SETTLE_PAUSE).await;
                count = session.count(FEED_ITEM_SELECTOR).await?;
                if count == previous {
                    break;
                }
            }
            previous = count;
        }
        Ok(())
    }

    /// Visit place pages for the first `detail_limit` listings.
    ///
    /// A page that keeps failing leaves its stub untouched. Returns the
    /// number of pages loaded.
    async fn fetch_details(
        &self,
        session: &dyn BrowserActions,
        query: &CellQuery,
        listings: &mut [Listing],
    ) -> u64 {
        let mut loaded = 0;
        let limit = self.browser.detail_limit.min(listings.len());

        for (i, listing) in listings.iter_mut().take(limit).enumerate() {
            let Some(url) = listing.maps_url.clone() else {
                continue;
            };
            if i > 0 {
                tokio::time::sleep(self.detail_pause()).await;
            }

            let label = format!("Detail page '{}' (cell {})", listing.name, query.cell.index);
            let page_url = url.as_str();
            let page =
                retry_with_backoff(&label, self.detail_policy(), || self.load_detail(session, page_url))
                    .await;

            match page {
                Ok((html, current)) => {
                    parse_detail(&html, current.as_deref().or(Some(page_url)), listing);
                    loaded += 1;
                }
                Err(ScanError::CaptchaRequired { url }) => {
                    tracing::warn!("CAPTCHA on detail page {}, skipping remaining details", url);
                    break;
                }
                Err(e) => {
                    tracing::warn!("{} skipped: {}", label, e);
                }
            }
        }
        loaded
    }

    async fn load_detail(
        &self,
        session: &dyn BrowserActions,
        url: &str,
    ) -> Result<(String, Option<String>)> {
        self.with_timeout("detail page", session.navigate(url)).await?;
        let panel_wait_ms = u64::try_from(self.navigation_timeout().as_millis()).unwrap_or(u64::MAX);
        session
            .wait_for_selector(PLACE_PANEL_SELECTOR, panel_wait_ms)
            .await?;
        let html = session.content().await?;
        let current = session.current_url().await?;
        if detect_captcha(&html, current.as_deref()) {
            return Err(ScanError::CaptchaRequired {
                url: current.unwrap_or_else(|| url.to_string()),
            });
        }
        Ok((html, current))
    }
}

/// Owns a session until it is closed. Dropping it unclosed (a cancelled
/// or timed-out cell) closes the tab on a background task.
struct CloseOnDrop {
    session: Option<Arc<dyn BrowserActions>>,
    cell_index: usize,
}

impl CloseOnDrop {
    fn new(session: Arc<dyn BrowserActions>, cell_index: usize) -> Self {
        Self {
            session: Some(session),
            cell_index,
        }
    }

    async fn close(mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                tracing::debug!("Failed to close session for cell {}: {}", self.cell_index, e);
            }
        }
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let cell_index = self.cell_index;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!("Cell {} abandoned, closing its session", cell_index);
                handle.spawn(async move {
                    if let Err(e) = session.close().await {
                        tracing::debug!("Failed to close session for cell {}: {}", cell_index, e);
                    }
                });
            }
            Err(_) => tracing::warn!(
                "Cell {} abandoned outside a runtime, session left open",
                cell_index
            ),
        }
    }
}

async fn ensure_not_blocked(session: &dyn BrowserActions) -> Result<()> {
    let html = session.content().await?;
    let current = session.current_url().await?;
    if detect_captcha(&html, current.as_deref()) {
        return Err(ScanError::CaptchaRequired {
            url: current.unwrap_or_default(),
        });
    }
    Ok(())
}

fn tag_cell(listings: &mut [Listing], cell_index: usize) {
    for listing in listings {
        listing.cell_index = Some(cell_index);
    }
}

#[async_trait]
impl DataSource for PrimaryCollector {
    fn source(&self) -> Source {
        Source::Primary
    }

    async fn fetch(&self, scope: &FetchScope) -> Result<SourceBatch> {
        let FetchScope::Cell(query) = scope else {
            return Ok(SourceBatch::default());
        };
        let label = format!("Cell {} for job {}", query.cell.index, query.job_id);
        retry_with_backoff(&label, self.cell_policy(), || self.scrape_cell(query)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadgrid_browser::Result as BrowserResult;
    use leadgrid_core::Coordinates;
    use leadgrid_geo::GridCell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const FEED: &str = r#"
        <div role="feed">
          <div><div jsaction="mouseover:pane.a" class="Nv2PK">
            <a class="hfpxzc" aria-label="Joe's Pizza"
               href="https://www.google.com/maps/place/Joe's+Pizza/data=!1s0xabc:0x123!3d30.2672!4d-97.7431"></a>
          </div></div>
          <div><div jsaction="mouseover:pane.b" class="Nv2PK">
            <a class="hfpxzc" aria-label="Bean There"
               href="https://www.google.com/maps/place/Bean+There/data=!3d30.27!4d-97.74"></a>
          </div></div>
        </div>
    "#;

    const DETAIL: &str = r#"
        <div role="main">
          <button data-item-id="phone:tel:+15125550100"><div class="fontBodyMedium">(512) 555-0100</div></button>
        </div>
    "#;

    #[derive(Default)]
    struct Script {
        captcha: bool,
        consent_stuck: bool,
        place_hit: bool,
        feed_hangs: bool,
    }

    struct FakeSession {
        script: Arc<Script>,
        url: Mutex<String>,
        navigations: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrowserActions for FakeSession {
        async fn navigate(&self, url: &str) -> BrowserResult<()> {
            self.navigations.fetch_add(1, Ordering::SeqCst);
            let landed = if self.script.consent_stuck {
                "https://consent.google.com/ml?continue=x".to_string()
            } else if self.script.captcha {
                "https://www.google.com/sorry/index".to_string()
            } else if self.script.place_hit {
                "https://www.google.com/maps/place/Solo+Cafe/data=!3d30.1!4d-97.2".to_string()
            } else {
                url.to_string()
            };
            *self.url.lock().expect("url") = landed;
            Ok(())
        }

        async fn click(&self, selector: &str) -> BrowserResult<()> {
            Err(BrowserError::SelectorNotFound(selector.to_string()))
        }

        async fn wait_for_selector(&self, selector: &str, _timeout_ms: u64) -> BrowserResult<()> {
            if self.script.feed_hangs {
                std::future::pending::<()>().await;
            }
            let url = self.url.lock().expect("url").clone();
            let present = if selector == FEED_SELECTOR {
                url.contains("/maps/search/")
            } else {
                url.contains("/maps/place/")
            };
            if present {
                Ok(())
            } else {
                Err(BrowserError::Timeout(selector.to_string()))
            }
        }

        async fn count(&self, _selector: &str) -> BrowserResult<usize> {
            Ok(2)
        }

        async fn scroll_to_bottom(&self, _selector: &str) -> BrowserResult<bool> {
            Ok(true)
        }

        async fn content(&self) -> BrowserResult<String> {
            let url = self.url.lock().expect("url").clone();
            Ok(if url.contains("/sorry/") {
                "<div class=\"g-recaptcha\"></div>".to_string()
            } else if url.contains("/maps/search/") {
                FEED.to_string()
            } else if url.contains("Solo+Cafe") {
                "<div role=\"main\"><h1>Solo Cafe</h1></div>".to_string()
            } else {
                DETAIL.to_string()
            })
        }

        async fn current_url(&self) -> BrowserResult<Option<String>> {
            Ok(Some(self.url.lock().expect("url").clone()))
        }

        async fn close(&self) -> BrowserResult<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeFactory {
        script: Arc<Script>,
        opened: AtomicUsize,
        navigations: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    impl FakeFactory {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script: Arc::new(script),
                opened: AtomicUsize::new(0),
                navigations: Arc::new(AtomicUsize::new(0)),
                closed: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    #[async_trait]
    impl SessionFactory for FakeFactory {
        async fn open_session(&self) -> BrowserResult<Box<dyn BrowserActions>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSession {
                script: self.script.clone(),
                url: Mutex::new(String::new()),
                navigations: self.navigations.clone(),
                closed: self.closed.clone(),
            }))
        }
    }

    fn query() -> FetchScope {
        FetchScope::Cell(CellQuery {
            job_id: "job-1".to_string(),
            keyword: "pizza".to_string(),
            location: "Austin, TX".to_string(),
            cell: GridCell {
                index: 4,
                center: Coordinates::new(30.2672, -97.7431).expect("valid"),
                radius_km: 5.0,
                distance_km: 0.0,
            },
        })
    }

    fn collector(factory: Arc<FakeFactory>, detail_limit: usize) -> PrimaryCollector {
        let browser = BrowserConfig {
            detail_limit,
            ..BrowserConfig::default()
        };
        PrimaryCollector::new(factory, browser, ScrapingConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_cell_with_details() {
        let factory = FakeFactory::new(Script::default());
        let batch = collector(factory.clone(), 1)
            .fetch(&query())
            .await
            .expect("cell succeeds");

        assert_eq!(batch.listings.len(), 2);
        assert_eq!(batch.units, 2);
        assert!(batch.listings.iter().all(|l| l.cell_index == Some(4)));
        assert_eq!(batch.listings[0].phone.as_deref(), Some("(512) 555-0100"));
        assert!(batch.listings[1].phone.is_none());
        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_place_hit() {
        let factory = FakeFactory::new(Script {
            place_hit: true,
            ..Script::default()
        });
        let batch = collector(factory, 0).fetch(&query()).await.expect("cell succeeds");
        assert_eq!(batch.listings.len(), 1);
        assert_eq!(batch.listings[0].name, "Solo Cafe");
        assert_eq!(batch.listings[0].latitude, Some(30.1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_captcha_retried_then_fails() {
        let factory = FakeFactory::new(Script {
            captcha: true,
            ..Script::default()
        });
        let result = collector(factory.clone(), 0).fetch(&query()).await;
        assert!(matches!(result, Err(ScanError::CaptchaRequired { .. })));
        // Each attempt uses a fresh session.
        assert_eq!(factory.opened.load(Ordering::SeqCst), 3);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_cell_closes_its_session() {
        let factory = FakeFactory::new(Script {
            feed_hangs: true,
            ..Script::default()
        });
        let collector = collector(factory.clone(), 0);

        let outcome = tokio::time::timeout(Duration::from_secs(300), collector.fetch(&query())).await;
        assert!(outcome.is_err(), "hung cell should time out");

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
        assert_eq!(
            factory.closed.load(Ordering::SeqCst),
            1,
            "browser session left open after the cell timed out"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_consent_is_reported() {
        let factory = FakeFactory::new(Script {
            consent_stuck: true,
            ..Script::default()
        });
        let result = collector(factory, 0).fetch(&query()).await;
        assert!(matches!(result, Err(ScanError::ConsentWall { .. })));
    }

    #[tokio::test]
    async fn test_lead_scope_is_ignored() {
        let factory = FakeFactory::new(Script::default());
        let batch = collector(factory.clone(), 0)
            .fetch(&FetchScope::Leads(Vec::new()))
            .await
            .expect("no-op");
        assert!(batch.listings.is_empty());
        assert_eq!(factory.opened.load(Ordering::SeqCst), 0);
    }
}
