use crate::actions::{scroll_script, BrowserActions, SessionFactory};
use crate::error::{BrowserError, Result};
use crate::fingerprint::FingerprintConfig;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetTimezoneOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::Page;
use futures::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One shared Chromium process from which sessions are opened.
pub struct BrowserEngine {
    browser: Browser,
    handler: JoinHandle<()>,
    navigation_timeout: Duration,
}

impl BrowserEngine {
    /// Launch Chromium with the given settings
    pub async fn launch(settings: &leadgrid_core::BrowserConfig) -> Result<Self> {
        let navigation_timeout = Duration::from_secs(settings.navigation_timeout_secs.max(1));

        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .request_timeout(navigation_timeout)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--lang=en-US");
        if !settings.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(BrowserError::ChromiumError)?;

        let (browser, mut handler) = Browser::launch(config).await?;

        // Spawn browser handler
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::debug!("Browser handler event error: {}", e);
                }
            }
        });

        tracing::info!(headless = settings.headless, "Browser launched");
        Ok(Self {
            browser,
            handler,
            navigation_timeout,
        })
    }

    /// Open a page with a freshly randomized fingerprint
    pub async fn new_session(&self) -> Result<BrowserSession> {
        self.new_session_with(FingerprintConfig::randomized()).await
    }

    /// Open a page with a specific fingerprint
    pub async fn new_session_with(&self, fingerprint: FingerprintConfig) -> Result<BrowserSession> {
        let page = self.browser.new_page("about:blank").await?;

        page.set_user_agent(SetUserAgentOverrideParams::new(fingerprint.user_agent.clone()))
            .await?;
        page.execute(SetDeviceMetricsOverrideParams::new(
            i64::from(fingerprint.viewport_width),
            i64::from(fingerprint.viewport_height),
            1.0,
            false,
        ))
        .await?;
        page.execute(SetTimezoneOverrideParams::new(fingerprint.timezone.clone()))
            .await?;

        tracing::debug!(
            user_agent = %fingerprint.user_agent,
            width = fingerprint.viewport_width,
            height = fingerprint.viewport_height,
            "Opened browser session"
        );
        Ok(BrowserSession {
            page,
            navigation_timeout: self.navigation_timeout,
        })
    }

    /// Close the browser and stop its event loop
    pub async fn shutdown(mut self) {
        if let Err(e) = self.browser.close().await {
            tracing::warn!("Failed to close browser cleanly: {}", e);
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
        tracing::info!("Browser shut down");
    }
}

#[async_trait::async_trait]
impl SessionFactory for BrowserEngine {
    async fn open_session(&self) -> Result<Box<dyn BrowserActions>> {
        Ok(Box::new(self.new_session().await?))
    }
}

/// A single browser tab
pub struct BrowserSession {
    page: Page,
    navigation_timeout: Duration,
}

#[async_trait::async_trait]
impl BrowserActions for BrowserSession {
    async fn navigate(&self, url: &str) -> Result<()> {
        match tokio::time::timeout(self.navigation_timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(BrowserError::NavigationError(format!("{url}: {e}"))),
            Err(_) => Err(BrowserError::Timeout(format!("navigation to {url}"))),
        }
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| BrowserError::SelectorNotFound(selector.to_string()))?;
        element.click().await?;
        Ok(())
    }

    async fn wait_for_selector(&self, selector: &str, timeout_ms: u64) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BrowserError::Timeout(format!("waiting for {selector}")));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn count(&self, selector: &str) -> Result<usize> {
        // find_elements errors when nothing matches.
        Ok(self
            .page
            .find_elements(selector)
            .await
            .map(|els| els.len())
            .unwrap_or(0))
    }

    async fn scroll_to_bottom(&self, selector: &str) -> Result<bool> {
        self.page
            .evaluate(scroll_script(selector))
            .await?
            .into_value::<bool>()
            .map_err(|e| BrowserError::ScriptError(e.to_string()))
    }

    async fn content(&self) -> Result<String> {
        Ok(self.page.content().await?)
    }

    async fn current_url(&self) -> Result<Option<String>> {
        Ok(self.page.url().await?)
    }

    async fn close(&self) -> Result<()> {
        self.page.clone().close().await?;
        Ok(())
    }
}
