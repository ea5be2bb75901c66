use std::time::Duration;

use thirtyfour::error::WebDriverResult;
use thirtyfour::prelude::*;
use thirtyfour::ChromeCapabilities;
use tracing::{debug, error, info};

use crate::cli::config::{BrowserSettings, Settings};
use crate::crawler::error::CrawlError;

/// Creates and tears down WebDriver sessions.
///
/// Every journey attempt gets a fresh session and the session is always
/// closed when the attempt ends, whatever the outcome. Sessions are never
/// reused across attempts; a crashed browser is recovered from by starting
/// over, not by resurrecting the session.
pub struct DriverManager {
    webdriver_url: String,
    browser: BrowserSettings,
    page_load_timeout: Duration,
}

impl DriverManager {
    pub fn new(settings: &Settings) -> Self {
        Self {
            webdriver_url: settings.webdriver_url.clone(),
            browser: settings.browser.clone(),
            page_load_timeout: Duration::from_secs(settings.browser.page_load_timeout_secs),
        }
    }

    /// Starts a new browser session with the stability flags needed for
    /// long unattended crawls.
    pub async fn initialize(&self) -> Result<WebDriver, CrawlError> {
        let caps = self.build_capabilities().map_err(CrawlError::DriverInit)?;

        debug!("Starting WebDriver session at {}", self.webdriver_url);
        let driver = WebDriver::new(&self.webdriver_url, caps)
            .await
            .map_err(CrawlError::DriverInit)?;

        driver
            .set_page_load_timeout(self.page_load_timeout)
            .await
            .map_err(CrawlError::DriverInit)?;

        info!("Browser session started");
        Ok(driver)
    }

    fn build_capabilities(&self) -> WebDriverResult<ChromeCapabilities> {
        let mut caps = DesiredCapabilities::chrome();
        if self.browser.headless {
            caps.set_headless()?;
        }

        // Flags for stability in containers and to keep the disk cache from
        // growing over multi-hour runs.
        caps.add_arg("--no-sandbox")?;
        caps.add_arg("--disable-dev-shm-usage")?;
        caps.add_arg("--disable-gpu")?;
        caps.add_arg("--disable-extensions")?;
        caps.add_arg("--disable-application-cache")?;
        caps.add_arg("--disk-cache-size=0")?;
        caps.add_arg("--media-cache-size=0")?;
        caps.add_arg(&format!(
            "--window-size={},{}",
            self.browser.window_width, self.browser.window_height
        ))?;

        Ok(caps)
    }

    /// Quits the session. A failed quit is logged and swallowed: the
    /// attempt's outcome has already been decided by this point and a
    /// half-dead browser must not overwrite it.
    pub async fn close(&self, driver: WebDriver) {
        match driver.quit().await {
            Ok(()) => debug!("Browser session closed"),
            Err(e) => error!("Failed to close browser session: {}", e),
        }
    }
}
