use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use futures::future::BoxFuture;
use thirtyfour::prelude::*;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::browser::click::{classify, click_element, perform_click, DriverFailure};
use crate::browser::click::{to_crawl_error, ClickOptions, ClickOutcome};
use crate::browser::scrape::scrape_rows;
use crate::cli::config::Settings;
use crate::crawler::error::{CrawlError, StepOutcome};
use crate::crawler::path::NavigationPath;
use crate::crawler::sitemap::{
    AlphabetLoopStep, DisabledCheckOn, NextButtonLoopStep, NumericLoopStep, ProcessResultsStep,
    Step, UrlLoopStep,
};
use crate::storage::records::{persist_records, PersistRequest, RecordStore};

/// Everything a step needs to act: the live session, the record sink, the
/// tunables, and the per-run accumulators. One context per journey attempt.
pub struct StepContext<'a> {
    pub driver: &'a WebDriver,
    pub store: &'a dyn RecordStore,
    pub settings: &'a Settings,
    pub parent_url_id: &'a str,
    pub destination_table: &'a str,
    /// Total new records stored this run. Incremented in exactly one place,
    /// after a batch commits.
    pub records_saved: &'a AtomicU64,
    pub resume: &'a ResumeState,
}

/// Progress shared between retries of a single journey. Never persisted and
/// never visible to other journeys: a fresh journey always starts blank.
#[derive(Debug, Default)]
pub struct ResumeState {
    // Last alphabet-index position fully processed plus one; zero means
    // nothing completed yet.
    last_letter_index: AtomicUsize,
}

impl ResumeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_completed_index(&self) -> Option<usize> {
        match self.last_letter_index.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n - 1),
        }
    }

    pub fn record_completed_index(&self, index: usize) {
        self.last_letter_index.store(index + 1, Ordering::Relaxed);
    }
}

/// Dispatches one configured step. Boxed because loop steps recurse into
/// their nested steps through this same entry point.
pub fn process_step<'a>(
    ctx: &'a StepContext<'a>,
    step: &'a Step,
    path: &'a NavigationPath,
    page: u32,
) -> BoxFuture<'a, Result<StepOutcome, CrawlError>> {
    Box::pin(async move {
        debug!("Processing step: {}", step.label());
        match step {
            Step::Click(click) => {
                let opts = ClickOptions {
                    force_js: click.force_js,
                    ..ClickOptions::default()
                };
                match perform_click(ctx.driver, &click.target, opts, &ctx.settings.waits).await? {
                    ClickOutcome::Clicked(_) => Ok(StepOutcome::Completed),
                    ClickOutcome::NotFound => {
                        error!("Required click target missing: {}", step.label());
                        Ok(StepOutcome::Failed)
                    }
                }
            }
            Step::AlphabetLoop(loop_step) => alphabet_loop(ctx, loop_step, path).await,
            Step::NextButtonPaginationLoop(loop_step) => {
                next_button_loop(ctx, loop_step, path).await
            }
            Step::NumericPaginationLoop(loop_step) => {
                numeric_loop(ctx, loop_step, path, page).await
            }
            Step::UrlLoop(loop_step) => url_loop(ctx, loop_step, path).await,
            Step::ProcessResults(results) => process_results(ctx, results, path, page).await,
            Step::Unknown { action, .. } => {
                warn!("Unknown step action '{}', skipping", action);
                Ok(StepOutcome::Completed)
            }
        }
    })
}

/// Runs a loop body. `Ok(true)` means every nested step completed.
async fn run_nested(
    ctx: &StepContext<'_>,
    steps: &[Step],
    path: &NavigationPath,
    page: u32,
) -> Result<bool, CrawlError> {
    for step in steps {
        if !process_step(ctx, step, path, page).await?.completed() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Walks an A-Z style index. The link list is re-located from scratch on
/// every iteration because selecting an index usually re-renders the page
/// and invalidates previously held elements. Stale references retry the
/// same position a bounded number of times.
async fn alphabet_loop(
    ctx: &StepContext<'_>,
    step: &AlphabetLoopStep,
    path: &NavigationPath,
) -> Result<StepOutcome, CrawlError> {
    let waits = &ctx.settings.waits;

    let links = match ctx
        .driver
        .query(step.target.by())
        .wait(waits.scrape_timeout(), waits.poll_interval())
        .all()
        .await
    {
        Ok(links) => links,
        Err(err) => match classify(err) {
            DriverFailure::Crash(message) => return Err(CrawlError::BrowserCrashed(message)),
            DriverFailure::Stale(_) | DriverFailure::NotFound(_) => Vec::new(),
            DriverFailure::Other(err) => return Err(CrawlError::WebDriver(err)),
        },
    };
    let total = links.len();
    if total == 0 {
        warn!("No index links matched {}, skipping loop", step.target);
        return Ok(StepOutcome::Completed);
    }
    info!("Found {} index links to process", total);

    if step.visit_by_href {
        return alphabet_by_href(ctx, step, path, links).await;
    }

    let mut index = 0;
    if step.track_resume_index {
        if let Some(done) = ctx.resume.last_completed_index() {
            index = done + 1;
            info!("Resuming index loop from position {}", index + 1);
        }
    }

    let mut stale_attempts: u32 = 0;
    while index < total {
        // Fresh lookup; elements held across an iteration are unreliable.
        let fresh = match ctx
            .driver
            .query(step.target.by())
            .wait(waits.click_timeout(), waits.poll_interval())
            .all()
            .await
        {
            Ok(fresh) => fresh,
            Err(err) => match classify(err) {
                DriverFailure::Crash(message) => {
                    return Err(CrawlError::BrowserCrashed(message))
                }
                DriverFailure::Stale(_) => {
                    stale_attempts += 1;
                    if stale_attempts > waits.stale_retries {
                        return Err(CrawlError::StepFailed(format!(
                            "index links kept going stale at position {}",
                            index + 1
                        )));
                    }
                    continue;
                }
                DriverFailure::NotFound(_) | DriverFailure::Other(_) => {
                    error!("Index links disappeared at position {}", index + 1);
                    return Ok(StepOutcome::Failed);
                }
            },
        };
        if index >= fresh.len() {
            error!(
                "Index position {} out of bounds after re-locating {} links",
                index + 1,
                fresh.len()
            );
            return Ok(StepOutcome::Failed);
        }

        let link = &fresh[index];
        let letter = match link.text().await {
            Ok(text) => text.trim().to_string(),
            Err(err) => match classify(err) {
                DriverFailure::Crash(message) => {
                    return Err(CrawlError::BrowserCrashed(message))
                }
                DriverFailure::Stale(_) => {
                    stale_attempts += 1;
                    if stale_attempts > waits.stale_retries {
                        return Err(CrawlError::StepFailed(format!(
                            "index link kept going stale at position {}",
                            index + 1
                        )));
                    }
                    continue;
                }
                _ => String::new(),
            },
        };
        let segment = if letter.is_empty() {
            format!("{}{}", step.segment_prefix, index + 1)
        } else {
            format!("{}{}", step.segment_prefix, letter)
        };
        info!("Processing index link {}/{} ({})", index + 1, total, segment);

        if let Err(err) = click_element(ctx.driver, link, step.use_js_click, waits).await {
            match classify(err) {
                DriverFailure::Crash(message) => {
                    return Err(CrawlError::BrowserCrashed(message))
                }
                DriverFailure::Stale(_) => {
                    stale_attempts += 1;
                    if stale_attempts > waits.stale_retries {
                        return Err(CrawlError::StepFailed(format!(
                            "index link kept going stale at position {}",
                            index + 1
                        )));
                    }
                    warn!("Index link went stale before the click, retrying position");
                    continue;
                }
                DriverFailure::NotFound(err) | DriverFailure::Other(err) => {
                    error!("Could not click index link {}: {}", segment, err);
                    return Ok(StepOutcome::Failed);
                }
            }
        }
        stale_attempts = 0;

        let letter_path = path.child(segment.clone());
        let nested_ok = run_nested(ctx, &step.loop_steps, &letter_path, 1).await?;
        if !nested_ok {
            if step.breadcrumb.is_some() {
                // With a breadcrumb return configured, a failure means the
                // crawler's position is unknown; pressing on would mislabel
                // every following letter.
                error!("Step failed under {}, halting journey", segment);
                return Ok(StepOutcome::Failed);
            }
            warn!("Step failed under {}, moving to next index", segment);
        }

        if let Some(breadcrumb) = &step.breadcrumb {
            match perform_click(ctx.driver, breadcrumb, ClickOptions::default(), waits).await? {
                ClickOutcome::Clicked(_) => {}
                ClickOutcome::NotFound => {
                    error!("Could not return via breadcrumb after {}", segment);
                    return Ok(StepOutcome::Failed);
                }
            }
        }

        if step.track_resume_index {
            ctx.resume.record_completed_index(index);
        }
        index += 1;
    }

    Ok(StepOutcome::Completed)
}

/// Href-visiting variant for sites that rebuild the index DOM on every
/// selection: collect all destinations first, then navigate to each.
async fn alphabet_by_href(
    ctx: &StepContext<'_>,
    step: &AlphabetLoopStep,
    path: &NavigationPath,
    links: Vec<WebElement>,
) -> Result<StepOutcome, CrawlError> {
    let mut urls = Vec::with_capacity(links.len());
    for link in &links {
        match link.attr("href").await {
            Ok(Some(href)) => urls.push(href),
            Ok(None) => {}
            Err(err) => match classify(err) {
                DriverFailure::Crash(message) => {
                    return Err(CrawlError::BrowserCrashed(message))
                }
                _ => debug!("Skipping index link without a readable href"),
            },
        }
    }
    if urls.is_empty() {
        warn!("No index links carried hrefs, skipping loop");
        return Ok(StepOutcome::Completed);
    }

    for (position, url) in urls.iter().enumerate() {
        let segment = match url.rsplit_once('=') {
            Some((_, label)) if !label.is_empty() => label.to_string(),
            _ => format!("{}{}", step.segment_prefix, position + 1),
        };
        info!(
            "Visiting index page {}/{} ({})",
            position + 1,
            urls.len(),
            segment
        );
        ctx.driver.goto(url).await.map_err(to_crawl_error)?;

        let letter_path = path.child(segment.clone());
        if !run_nested(ctx, &step.loop_steps, &letter_path, 1).await? {
            warn!("Step failed under {}, moving to next index", segment);
        }
    }

    Ok(StepOutcome::Completed)
}

/// Scrape-then-advance over a "next" control. The loop ends only when the
/// control is absent or carries the configured disabled class.
async fn next_button_loop(
    ctx: &StepContext<'_>,
    step: &NextButtonLoopStep,
    path: &NavigationPath,
) -> Result<StepOutcome, CrawlError> {
    let waits = &ctx.settings.waits;
    let mut page: u32 = 1;

    loop {
        info!("Scraping results on page {}", page);
        if !run_nested(ctx, &step.loop_steps, path, page).await? {
            error!("Step failed on page {}, stopping pagination", page);
            return Ok(StepOutcome::Failed);
        }

        if next_control_disabled(ctx, step).await? {
            info!("Next control is disabled, pagination complete after page {}", page);
            break;
        }
        let opts = ClickOptions {
            pagination: true,
            ..ClickOptions::default()
        };
        match perform_click(ctx.driver, &step.next_button, opts, waits).await? {
            ClickOutcome::Clicked(_) => {
                page += 1;
                sleep(waits.post_click_delay()).await;
            }
            ClickOutcome::NotFound => {
                info!("No next control found, pagination complete after page {}", page);
                break;
            }
        }
    }

    Ok(StepOutcome::Completed)
}

/// Checks whether the next control (or its parent, for `<li><a>` markup) is
/// marked disabled. An absent control is reported as not disabled; the
/// click probe handles absence.
async fn next_control_disabled(
    ctx: &StepContext<'_>,
    step: &NextButtonLoopStep,
) -> Result<bool, CrawlError> {
    let waits = &ctx.settings.waits;
    let control = match ctx
        .driver
        .query(step.next_button.by())
        .wait(waits.pagination_timeout(), waits.poll_interval())
        .first()
        .await
    {
        Ok(control) => control,
        Err(err) => match classify(err) {
            DriverFailure::Crash(message) => return Err(CrawlError::BrowserCrashed(message)),
            _ => return Ok(false),
        },
    };

    let checked = match step.disabled_check_on {
        DisabledCheckOn::Control => control,
        DisabledCheckOn::Parent => match control.find(By::XPath("./..")).await {
            Ok(parent) => parent,
            Err(err) => match classify(err) {
                DriverFailure::Crash(message) => {
                    return Err(CrawlError::BrowserCrashed(message))
                }
                _ => return Ok(false),
            },
        },
    };

    match checked.attr("class").await {
        Ok(Some(class)) => Ok(class.contains(&step.disabled_class)),
        Ok(None) => Ok(false),
        Err(err) => match classify(err) {
            DriverFailure::Crash(message) => Err(CrawlError::BrowserCrashed(message)),
            _ => Ok(false),
        },
    }
}

/// The page-number controls that must be clicked to fast-forward from page
/// 1 to `start_page` without scraping. Clicking through `start_page` itself
/// leaves the listing showing the page scraping resumes on.
pub(crate) fn fast_forward_targets(start_page: u32) -> Vec<u32> {
    if start_page <= 1 {
        Vec::new()
    } else {
        (2..=start_page).collect()
    }
}

/// Numbered pagination with resume support. Intermediate pages are clicked
/// through without running the loop body; normal scrape-then-advance begins
/// at `start_page`.
async fn numeric_loop(
    ctx: &StepContext<'_>,
    step: &NumericLoopStep,
    path: &NavigationPath,
    start_page: u32,
) -> Result<StepOutcome, CrawlError> {
    let waits = &ctx.settings.waits;
    let opts = ClickOptions {
        pagination: true,
        ..ClickOptions::default()
    };

    let targets = fast_forward_targets(start_page);
    if !targets.is_empty() {
        info!("Fast-forwarding to resume from page {}", start_page);
        for target in targets {
            let locator = step.page_locator(target);
            let advanced = match perform_click(ctx.driver, &locator, opts, waits).await? {
                ClickOutcome::Clicked(_) => true,
                ClickOutcome::NotFound => {
                    // Numbered control outside the visible window; the next
                    // control slides the window forward one page.
                    matches!(
                        perform_click(ctx.driver, &step.next_button_fallback, opts, waits).await?,
                        ClickOutcome::Clicked(_)
                    )
                }
            };
            if !advanced {
                error!("Could not fast-forward to page {}", target);
                return Ok(StepOutcome::Failed);
            }
            sleep(waits.post_click_delay()).await;
        }
    }

    let mut page = start_page.max(1);
    loop {
        info!("Scraping results on page {}", page);
        if !run_nested(ctx, &step.loop_steps, path, page).await? {
            error!("Step failed on page {}, stopping pagination", page);
            return Ok(StepOutcome::Failed);
        }

        let next = page + 1;
        if matches!(
            perform_click(ctx.driver, &step.page_locator(next), opts, waits).await?,
            ClickOutcome::Clicked(_)
        ) {
            page = next;
            sleep(waits.post_click_delay()).await;
            continue;
        }
        if matches!(
            perform_click(ctx.driver, &step.next_button_fallback, opts, waits).await?,
            ClickOutcome::Clicked(_)
        ) {
            page = next;
            sleep(waits.post_click_delay()).await;
            continue;
        }
        info!("No further page controls, pagination complete after page {}", page);
        break;
    }

    Ok(StepOutcome::Completed)
}

/// Collects section URLs up front and visits each directly. Used for sites
/// whose index is a set of plain links with meaningful query parameters.
async fn url_loop(
    ctx: &StepContext<'_>,
    step: &UrlLoopStep,
    path: &NavigationPath,
) -> Result<StepOutcome, CrawlError> {
    let waits = &ctx.settings.waits;
    let links = match ctx
        .driver
        .query(step.target.by())
        .wait(waits.click_timeout(), waits.poll_interval())
        .all()
        .await
    {
        Ok(links) => links,
        Err(err) => match classify(err) {
            DriverFailure::Crash(message) => return Err(CrawlError::BrowserCrashed(message)),
            DriverFailure::Stale(_) | DriverFailure::NotFound(_) => Vec::new(),
            DriverFailure::Other(err) => return Err(CrawlError::WebDriver(err)),
        },
    };

    let mut urls = Vec::with_capacity(links.len());
    for link in &links {
        match link.attr("href").await {
            Ok(Some(href)) => urls.push(href),
            Ok(None) => {}
            Err(err) => match classify(err) {
                DriverFailure::Crash(message) => {
                    return Err(CrawlError::BrowserCrashed(message))
                }
                _ => debug!("Skipping link without a readable href"),
            },
        }
    }
    if urls.is_empty() {
        warn!("No section links matched {}, skipping loop", step.target);
        return Ok(StepOutcome::Completed);
    }
    info!("Found {} section URLs to visit", urls.len());

    for (position, url) in urls.iter().enumerate() {
        let label = query_param(url, &step.label_param)
            .unwrap_or_else(|| format!("URL-{}", position + 1));
        let segment = format!("{}{}", step.segment_prefix, label);
        info!("Visiting section {}/{} ({})", position + 1, urls.len(), segment);
        ctx.driver.goto(url).await.map_err(to_crawl_error)?;

        let section_path = path.child(segment.clone());
        if !run_nested(ctx, &step.loop_steps, &section_path, 1).await? {
            // Direct navigation leaves no page to fall back to; an
            // unprocessed section would silently vanish from the data.
            error!("Step failed under {}, halting journey", segment);
            return Ok(StepOutcome::Failed);
        }
    }

    Ok(StepOutcome::Completed)
}

/// Scrapes the current listing and stores the new records, crediting the
/// run accumulator with the inserted count.
async fn process_results(
    ctx: &StepContext<'_>,
    step: &ProcessResultsStep,
    path: &NavigationPath,
    page: u32,
) -> Result<StepOutcome, CrawlError> {
    let records = scrape_rows(
        ctx.driver,
        step.container.as_ref(),
        &step.scraping_config,
        &ctx.settings.waits,
    )
    .await?;
    if records.is_empty() {
        debug!("No rows to store at {}", path.render_with_page(page));
        return Ok(StepOutcome::Completed);
    }

    let request = PersistRequest {
        table: ctx.destination_table,
        parent_url_id: ctx.parent_url_id,
        path,
        page,
        key_column: &step.scraping_config.key_column,
        dedup_depth: ctx.settings.crawl.navigation_path_depth,
    };
    let inserted = persist_records(ctx.store, &request, records).await?;
    ctx.records_saved.fetch_add(inserted, Ordering::Relaxed);
    Ok(StepOutcome::Completed)
}

/// Reads a query parameter from a URL string, if both parse.
pub(crate) fn query_param(url: &str, name: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}
