use std::collections::HashMap;

use thirtyfour::error::WebDriverError;
use thirtyfour::prelude::*;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::click::{classify, DriverFailure};
use crate::cli::config::WaitSettings;
use crate::crawler::error::CrawlError;
use crate::crawler::sitemap::{ColumnConfig, ExtractKind, Locator, ScrapingConfig};

/// One scraped row: column name to extracted value. A column whose cell is
/// missing or unreadable is `None`; the row is kept.
pub type Record = HashMap<String, Option<String>>;

/// Scrapes every configured column from every row of the current listing.
///
/// Waits for the container (when configured) and then for the first row. A
/// timeout on either wait means the page legitimately has no results for the
/// current selection and yields an empty batch, not an error. Only a dead
/// browser session is fatal.
pub async fn scrape_rows(
    driver: &WebDriver,
    container: Option<&Locator>,
    config: &ScrapingConfig,
    waits: &WaitSettings,
) -> Result<Vec<Record>, CrawlError> {
    if let Some(container) = container {
        if let Err(err) = await_present(driver, container, waits).await {
            return empty_unless_fatal(err, container);
        }
    }
    if let Err(err) = await_present(driver, &config.row, waits).await {
        return empty_unless_fatal(err, &config.row);
    }

    // The first row appearing does not mean the listing finished rendering.
    sleep(waits.settle_delay()).await;

    let rows = driver
        .find_all(config.row.by())
        .await
        .map_err(super::click::to_crawl_error)?;
    info!("Found {} result rows", rows.len());

    let current_url = driver
        .current_url()
        .await
        .map_err(super::click::to_crawl_error)?;
    let current_url = current_url.as_str().to_string();

    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut record = Record::with_capacity(config.columns.len());
        for column in &config.columns {
            let value = extract_cell(row, column, &current_url).await?;
            record.insert(column.name.clone(), value);
        }
        records.push(record);
    }
    Ok(records)
}

async fn await_present(
    driver: &WebDriver,
    locator: &Locator,
    waits: &WaitSettings,
) -> Result<(), WebDriverError> {
    driver
        .query(locator.by())
        .wait(waits.scrape_timeout(), waits.poll_interval())
        .first()
        .await?;
    Ok(())
}

fn empty_unless_fatal(err: WebDriverError, locator: &Locator) -> Result<Vec<Record>, CrawlError> {
    match classify(err) {
        DriverFailure::Crash(message) => Err(CrawlError::BrowserCrashed(message)),
        DriverFailure::Other(err) => Err(CrawlError::WebDriver(err)),
        DriverFailure::Stale(_) | DriverFailure::NotFound(_) => {
            debug!("No results matched {} within the wait budget", locator);
            Ok(Vec::new())
        }
    }
}

/// Extracts one cell. The `.` locator addresses the row element itself, for
/// listings whose rows are the links.
async fn extract_cell(
    row: &WebElement,
    column: &ColumnConfig,
    current_url: &str,
) -> Result<Option<String>, CrawlError> {
    let cell = if column.locator.value == "." {
        row.clone()
    } else {
        match row.find(column.locator.by()).await {
            Ok(cell) => cell,
            Err(err) => return none_unless_fatal(err, column),
        }
    };

    match column.kind {
        ExtractKind::Text => match cell.text().await {
            Ok(text) => Ok(Some(text.trim().to_string())),
            Err(err) => none_unless_fatal(err, column),
        },
        ExtractKind::Href => match cell.attr("href").await {
            Ok(Some(href)) => Ok(resolve_href(current_url, &href)),
            Ok(None) => {
                warn!("Column '{}' matched an element with no href", column.name);
                Ok(None)
            }
            Err(err) => none_unless_fatal(err, column),
        },
    }
}

fn none_unless_fatal(err: WebDriverError, column: &ColumnConfig) -> Result<Option<String>, CrawlError> {
    match classify(err) {
        DriverFailure::Crash(message) => Err(CrawlError::BrowserCrashed(message)),
        _ => {
            debug!("Column '{}' missing from row", column.name);
            Ok(None)
        }
    }
}

/// Resolves a scraped href against the page it was found on. Already
/// absolute URLs pass through; anything unresolvable becomes `None` rather
/// than polluting the data with fragments.
pub(crate) fn resolve_href(current_url: &str, href: &str) -> Option<String> {
    if let Ok(absolute) = Url::parse(href) {
        return Some(absolute.to_string());
    }
    Url::parse(current_url)
        .ok()?
        .join(href)
        .ok()
        .map(|u| u.to_string())
}
