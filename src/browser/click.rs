use std::time::Duration;

use thirtyfour::error::WebDriverError;
use thirtyfour::prelude::*;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::cli::config::WaitSettings;
use crate::crawler::error::CrawlError;
use crate::crawler::sitemap::Locator;

/// Result of a click request against a configured locator.
///
/// `Clicked` carries the element's visible text, which loop handlers use as
/// the path segment label (e.g. the letter of an A-Z index). `NotFound`
/// covers an absent or never-clickable target within the wait budget; for
/// pagination controls that is the normal end-of-listing signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    Clicked(String),
    NotFound,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClickOptions {
    /// Pagination probes use the shorter wait: an absent next control is
    /// expected on the last page and should not stall the crawl.
    pub pagination: bool,
    /// Dispatch the click through JavaScript instead of the WebDriver click
    /// command. Per-site configuration, not a fallback.
    pub force_js: bool,
}

/// How a WebDriver error should steer the crawl.
pub(crate) enum DriverFailure {
    /// The session itself is gone. Nothing further can run in this attempt.
    Crash(String),
    /// The element reference went stale; re-locating it may succeed.
    Stale(WebDriverError),
    /// The element is absent, not interactable, or timed out appearing.
    NotFound(WebDriverError),
    Other(WebDriverError),
}

pub(crate) fn classify(err: WebDriverError) -> DriverFailure {
    match &err {
        WebDriverError::InvalidSessionId(_)
        | WebDriverError::SessionNotCreated(_)
        | WebDriverError::NoSuchWindow(_) => DriverFailure::Crash(err.to_string()),
        WebDriverError::StaleElementReference(_) => DriverFailure::Stale(err),
        WebDriverError::NoSuchElement(_)
        | WebDriverError::ElementNotInteractable(_)
        | WebDriverError::ElementClickIntercepted(_)
        | WebDriverError::Timeout(_) => DriverFailure::NotFound(err),
        _ => {
            // Some drivers surface a dead session as a generic error whose
            // message names the condition.
            let message = err.to_string();
            if message.contains("invalid session id") || message.contains("browser has closed") {
                DriverFailure::Crash(message)
            } else {
                DriverFailure::Other(err)
            }
        }
    }
}

/// Maps a WebDriver error into the crawl taxonomy without losing the crash
/// distinction. Used where no softer handling applies.
pub(crate) fn to_crawl_error(err: WebDriverError) -> CrawlError {
    match classify(err) {
        DriverFailure::Crash(message) => CrawlError::BrowserCrashed(message),
        DriverFailure::Stale(e) | DriverFailure::NotFound(e) | DriverFailure::Other(e) => {
            CrawlError::WebDriver(e)
        }
    }
}

/// Locates and clicks the configured target.
///
/// Waits for presence, scrolls the element to the viewport center, lets the
/// page settle, then polls for clickability within the same budget. Stale
/// element references are retried a bounded number of times by re-locating
/// from scratch; exhausting the bound is a step failure. A dead session is
/// the only fatal error.
pub async fn perform_click(
    driver: &WebDriver,
    target: &Locator,
    opts: ClickOptions,
    waits: &WaitSettings,
) -> Result<ClickOutcome, CrawlError> {
    let timeout = if opts.pagination {
        waits.pagination_timeout()
    } else {
        waits.click_timeout()
    };

    let mut stale_attempts: u32 = 0;
    loop {
        match try_click(driver, target, timeout, opts.force_js, waits).await {
            Ok(Some(text)) => return Ok(ClickOutcome::Clicked(text)),
            Ok(None) => {
                if !opts.pagination {
                    warn!("Click target never became clickable: {}", target);
                }
                return Ok(ClickOutcome::NotFound);
            }
            Err(err) => match classify(err) {
                DriverFailure::Crash(message) => {
                    return Err(CrawlError::BrowserCrashed(message));
                }
                DriverFailure::Stale(_) => {
                    stale_attempts += 1;
                    if stale_attempts > waits.stale_retries {
                        return Err(CrawlError::StepFailed(format!(
                            "element kept going stale after {} retries: {}",
                            waits.stale_retries, target
                        )));
                    }
                    debug!(
                        "Stale element reference for {}, retry {}/{}",
                        target, stale_attempts, waits.stale_retries
                    );
                }
                DriverFailure::NotFound(err) => {
                    if !opts.pagination {
                        warn!("Click target not found: {} ({})", target, err);
                    }
                    return Ok(ClickOutcome::NotFound);
                }
                DriverFailure::Other(err) => return Err(CrawlError::WebDriver(err)),
            },
        }
    }
}

/// One location-and-click pass. `Ok(None)` means the target was present but
/// never reported clickable within the budget.
async fn try_click(
    driver: &WebDriver,
    target: &Locator,
    timeout: Duration,
    force_js: bool,
    waits: &WaitSettings,
) -> Result<Option<String>, WebDriverError> {
    let element = driver
        .query(target.by())
        .wait(timeout, waits.poll_interval())
        .first()
        .await?;

    element.scroll_into_view().await?;
    sleep(waits.settle_delay()).await;

    let deadline = Instant::now() + timeout;
    while !element.is_clickable().await? {
        if Instant::now() >= deadline {
            return Ok(None);
        }
        sleep(waits.poll_interval()).await;
    }

    let text = element.text().await?.trim().to_string();
    click_element(driver, &element, force_js, waits).await?;
    Ok(Some(text))
}

/// Clicks an already-located element, scrolling it into view first. Callers
/// that hold a live element (alphabet loops re-locate their link list on
/// every iteration) use this directly and classify the error themselves.
pub async fn click_element(
    driver: &WebDriver,
    element: &WebElement,
    force_js: bool,
    waits: &WaitSettings,
) -> Result<(), WebDriverError> {
    element.scroll_into_view().await?;
    sleep(waits.settle_delay()).await;
    if force_js {
        driver
            .execute("arguments[0].click();", vec![element.to_json()?])
            .await?;
    } else {
        element.click().await?;
    }
    Ok(())
}
