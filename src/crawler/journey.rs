use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thirtyfour::prelude::*;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::browser::click::to_crawl_error;
use crate::browser::DriverManager;
use crate::cli::config::Settings;
use crate::crawler::error::{CrawlError, StepOutcome};
use crate::crawler::sitemap::{Journey, Sitemap, Step};
use crate::crawler::steps::{process_step, ResumeState, StepContext};
use crate::storage::audit::{AuditLog, RunStatus};
use crate::storage::records::{validate_table_name, PostgresRecordStore, RecordStore};
use crate::storage::registry::fetch_base_url;

/// Final report of one crawl run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub status: RunStatus,
    pub records_saved: u64,
    pub message: String,
}

/// One attempt at completing a journey. Implemented by the live
/// driver-backed runner; the trait exists so the retry policy can be tested
/// with scripted attempts and no browser.
#[async_trait]
pub trait JourneyAttempt: Send {
    async fn run(&mut self, attempt: u32) -> Result<AttemptOutcome, CrawlError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed { error: String },
}

#[derive(Debug)]
pub struct JourneyRunResult {
    pub succeeded: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Runs attempts until one succeeds or the bound is reached, cooling down
/// between attempts. Configuration errors stop immediately: a bad sitemap
/// will not get better on the third try.
pub async fn run_journey_with_retries(
    max_retries: u32,
    cooldown: Duration,
    attempt: &mut dyn JourneyAttempt,
) -> JourneyRunResult {
    let mut attempts = 0;
    let mut last_error = None;

    while attempts < max_retries {
        match attempt.run(attempts + 1).await {
            Ok(AttemptOutcome::Succeeded) => {
                return JourneyRunResult {
                    succeeded: true,
                    attempts: attempts + 1,
                    last_error: None,
                };
            }
            Ok(AttemptOutcome::Failed { error }) => {
                attempts += 1;
                warn!("Attempt {}/{} failed: {}", attempts, max_retries, error);
                last_error = Some(error);
            }
            Err(err @ CrawlError::Config(_)) => {
                error!("Configuration defect, not retrying: {}", err);
                return JourneyRunResult {
                    succeeded: false,
                    attempts: attempts + 1,
                    last_error: Some(err.to_string()),
                };
            }
            Err(err) => {
                attempts += 1;
                warn!("Attempt {}/{} failed: {}", attempts, max_retries, err);
                last_error = Some(err.to_string());
            }
        }

        if attempts < max_retries && !cooldown.is_zero() {
            let jitter = rand::thread_rng().gen_range(0..1000);
            let wait = cooldown + Duration::from_millis(jitter);
            info!("Cooling down for {:.1}s before retrying", wait.as_secs_f64());
            sleep(wait).await;
        }
    }

    JourneyRunResult {
        succeeded: false,
        attempts,
        last_error,
    }
}

/// Orchestrates a full crawl run: one audit entry, every journey in the
/// sitemap, serial execution, per-journey retries.
pub struct Crawler {
    settings: Settings,
    pool: PgPool,
    store: Arc<dyn RecordStore>,
    audit: AuditLog,
    drivers: DriverManager,
}

impl Crawler {
    pub async fn connect(settings: Settings) -> Result<Self, CrawlError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&settings.database_url)
            .await?;
        let store = Arc::new(PostgresRecordStore::new(pool.clone()));
        let audit = AuditLog::new(pool.clone());
        let drivers = DriverManager::new(&settings);
        Ok(Self {
            settings,
            pool,
            store,
            audit,
            drivers,
        })
    }

    /// Runs every journey in the sitemap against one registered source
    /// site. Failures of one journey never stop the others; the run as a
    /// whole is failed if any journey exhausted its retries.
    pub async fn run(
        &self,
        parent_url_id: &str,
        sitemap_path: &Path,
        destination_table: &str,
    ) -> Result<RunSummary, CrawlError> {
        let sitemap = Sitemap::load(sitemap_path)?;
        validate_table_name(destination_table)?;
        let base_url = fetch_base_url(&self.pool, parent_url_id)
            .await?
            .ok_or_else(|| {
                CrawlError::Config(format!(
                    "no registry entry for parent url id '{}'",
                    parent_url_id
                ))
            })?;

        let job_name = format!("Surface crawling for parent url ID: {}", parent_url_id);
        let audit_id = self.audit.start(&job_name).await?;

        let records_saved = AtomicU64::new(0);
        let (status, last_error) = self
            .run_journeys(
                &sitemap,
                parent_url_id,
                &base_url,
                destination_table,
                &records_saved,
            )
            .await;

        let total = records_saved.load(Ordering::Relaxed);
        let message = match status {
            RunStatus::Success => {
                format!("Successfully processed {} new records.", total)
            }
            RunStatus::Failed => format!(
                "Job failed. Processed {} new records. Last error: {}",
                total,
                last_error.as_deref().unwrap_or("unknown")
            ),
        };
        // The audit entry exists; its finalization must not be lost to a
        // late database hiccup without at least a trace.
        if let Err(err) = self.audit.finish(&audit_id, status, &message).await {
            error!("Could not finalize audit log entry {}: {}", audit_id, err);
        }

        Ok(RunSummary {
            status,
            records_saved: total,
            message,
        })
    }

    async fn run_journeys(
        &self,
        sitemap: &Sitemap,
        parent_url_id: &str,
        base_url: &str,
        destination_table: &str,
        records_saved: &AtomicU64,
    ) -> (RunStatus, Option<String>) {
        let mut status = RunStatus::Success;
        let mut last_error = None;

        for journey in &sitemap.journeys {
            info!(
                "=== Starting journey '{}' ({}) ===",
                journey.journey_id, journey.description
            );
            let mut attempt = DriverAttempt {
                crawler: self,
                journey,
                parent_url_id,
                base_url,
                destination_table,
                records_saved,
                resume: ResumeState::new(),
                resume_url: None,
            };
            let result = run_journey_with_retries(
                self.settings.crawl.max_retries,
                self.settings.crawl.retry_cooldown(),
                &mut attempt,
            )
            .await;

            if result.succeeded {
                info!(
                    "Journey '{}' completed after {} attempt(s)",
                    journey.journey_id, result.attempts
                );
            } else {
                status = RunStatus::Failed;
                let error = result.last_error.unwrap_or_else(|| {
                    format!("journey '{}' failed with no recorded error", journey.journey_id)
                });
                error!(
                    "Journey '{}' failed after {} attempt(s): {}",
                    journey.journey_id, result.attempts, error
                );
                last_error = Some(error);
            }
        }

        (status, last_error)
    }
}

/// How a retried attempt re-enters the site.
enum ResumePlan {
    /// Start over from the registered base URL. Alphabet loops that track
    /// their resume index still skip completed letters.
    FromStart,
    /// Go straight to the URL recorded when the previous attempt failed and
    /// fast-forward its numeric pagination to the page in that URL.
    Pagination { url: String, page: u32 },
}

/// Live attempt runner: fresh browser session per attempt, teardown on
/// every path, resume bookkeeping across attempts of the same journey.
struct DriverAttempt<'a> {
    crawler: &'a Crawler,
    journey: &'a Journey,
    parent_url_id: &'a str,
    base_url: &'a str,
    destination_table: &'a str,
    records_saved: &'a AtomicU64,
    resume: ResumeState,
    resume_url: Option<String>,
}

#[async_trait]
impl JourneyAttempt for DriverAttempt<'_> {
    async fn run(&mut self, attempt: u32) -> Result<AttemptOutcome, CrawlError> {
        let driver = self.crawler.drivers.initialize().await?;
        let result = self.run_with_driver(&driver, attempt).await;
        self.crawler.drivers.close(driver).await;
        result
    }
}

impl DriverAttempt<'_> {
    async fn run_with_driver(
        &mut self,
        driver: &WebDriver,
        attempt: u32,
    ) -> Result<AttemptOutcome, CrawlError> {
        let plan = self.resume_plan();
        let result = self.execute_steps(driver, &plan, attempt).await;

        match result {
            Ok(StepOutcome::Completed) => {
                info!("Journey '{}' attempt #{} completed", self.journey.journey_id, attempt);
                Ok(AttemptOutcome::Succeeded)
            }
            Ok(StepOutcome::Failed) => {
                self.capture_resume_url(driver).await;
                Ok(AttemptOutcome::Failed {
                    error: format!(
                        "a step failed during journey '{}'",
                        self.journey.journey_id
                    ),
                })
            }
            Err(err @ CrawlError::Config(_)) => Err(err),
            Err(err) => {
                self.capture_resume_url(driver).await;
                Err(err)
            }
        }
    }

    fn resume_plan(&self) -> ResumePlan {
        match &self.resume_url {
            Some(url) if self.journey.has_numeric_pagination() => ResumePlan::Pagination {
                url: url.clone(),
                page: page_from_url(url),
            },
            _ => ResumePlan::FromStart,
        }
    }

    async fn execute_steps(
        &self,
        driver: &WebDriver,
        plan: &ResumePlan,
        attempt: u32,
    ) -> Result<StepOutcome, CrawlError> {
        let ctx = StepContext {
            driver,
            store: self.crawler.store.as_ref(),
            settings: &self.crawler.settings,
            parent_url_id: self.parent_url_id,
            destination_table: self.destination_table,
            records_saved: self.records_saved,
            resume: &self.resume,
        };
        let path = self.journey.initial_path();

        match plan {
            ResumePlan::FromStart => {
                info!(
                    "Journey '{}' attempt #{} starting from {}",
                    self.journey.journey_id, attempt, self.base_url
                );
                driver.goto(self.base_url).await.map_err(to_crawl_error)?;
                for step in &self.journey.steps {
                    if !process_step(&ctx, step, &path, 1).await?.completed() {
                        return Ok(StepOutcome::Failed);
                    }
                }
                Ok(StepOutcome::Completed)
            }
            ResumePlan::Pagination { url, page } => {
                // The navigation clicks that led to the listing are baked
                // into the recorded URL; replaying them would land on page 1
                // and redo work the dedup check already filters.
                info!(
                    "Journey '{}' attempt #{} resuming from {} (page {})",
                    self.journey.journey_id, attempt, url, page
                );
                driver.goto(url).await.map_err(to_crawl_error)?;
                for step in &self.journey.steps {
                    if let Step::NumericPaginationLoop(_) = step {
                        if !process_step(&ctx, step, &path, *page).await?.completed() {
                            return Ok(StepOutcome::Failed);
                        }
                    } else {
                        debug!("Skipping pre-pagination step while resuming: {}", step.label());
                    }
                }
                Ok(StepOutcome::Completed)
            }
        }
    }

    /// Records where the attempt died so the next one can pick up nearby.
    /// Best effort: a crashed session has no URL to give.
    async fn capture_resume_url(&mut self, driver: &WebDriver) {
        match driver.current_url().await {
            Ok(url) => {
                let url = url.as_str().to_string();
                info!("Recording resume URL for the next attempt: {}", url);
                self.resume_url = Some(url);
            }
            Err(err) => {
                debug!("Could not capture resume URL: {}", err);
            }
        }
    }
}

/// Reads the page number a listing URL is on; URLs without a readable
/// `page` parameter are treated as page 1.
pub(crate) fn page_from_url(url: &str) -> u32 {
    Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .query_pairs()
                .find(|(key, _)| key == "page")
                .and_then(|(_, value)| value.parse().ok())
        })
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_from_url_reads_the_page_parameter() {
        assert_eq!(
            page_from_url("https://example.gov.au/listing?view=all&page=5"),
            5
        );
    }

    #[test]
    fn page_from_url_defaults_to_one() {
        assert_eq!(page_from_url("https://example.gov.au/listing"), 1);
        assert_eq!(page_from_url("https://example.gov.au/listing?page=abc"), 1);
        assert_eq!(page_from_url("not a url"), 1);
    }

    /// Scripted attempt runner: plays back a fixed sequence of outcomes.
    struct ScriptedAttempt {
        script: Vec<Result<AttemptOutcome, CrawlError>>,
        calls: u32,
    }

    impl ScriptedAttempt {
        fn new(script: Vec<Result<AttemptOutcome, CrawlError>>) -> Self {
            Self { script, calls: 0 }
        }
    }

    #[async_trait]
    impl JourneyAttempt for ScriptedAttempt {
        async fn run(&mut self, _attempt: u32) -> Result<AttemptOutcome, CrawlError> {
            self.calls += 1;
            if self.script.is_empty() {
                Ok(AttemptOutcome::Succeeded)
            } else {
                self.script.remove(0)
            }
        }
    }

    #[tokio::test]
    async fn retry_bound_is_respected() {
        let mut attempt = ScriptedAttempt::new(vec![
            Ok(AttemptOutcome::Failed {
                error: "first".to_string(),
            }),
            Ok(AttemptOutcome::Failed {
                error: "second".to_string(),
            }),
            Ok(AttemptOutcome::Failed {
                error: "third".to_string(),
            }),
        ]);
        let result = run_journey_with_retries(3, Duration::ZERO, &mut attempt).await;
        assert!(!result.succeeded);
        assert_eq!(result.attempts, 3);
        assert_eq!(attempt.calls, 3);
        assert_eq!(result.last_error.as_deref(), Some("third"));
    }

    #[tokio::test]
    async fn success_stops_further_attempts() {
        let mut attempt = ScriptedAttempt::new(vec![
            Ok(AttemptOutcome::Failed {
                error: "first".to_string(),
            }),
            Ok(AttemptOutcome::Succeeded),
            Ok(AttemptOutcome::Failed {
                error: "never reached".to_string(),
            }),
        ]);
        let result = run_journey_with_retries(3, Duration::ZERO, &mut attempt).await;
        assert!(result.succeeded);
        assert_eq!(result.attempts, 2);
        assert_eq!(attempt.calls, 2);
        assert_eq!(result.last_error, None);
    }

    #[tokio::test]
    async fn fatal_errors_are_retried_like_failures() {
        let mut attempt = ScriptedAttempt::new(vec![
            Err(CrawlError::BrowserCrashed("invalid session id".to_string())),
            Ok(AttemptOutcome::Succeeded),
        ]);
        let result = run_journey_with_retries(3, Duration::ZERO, &mut attempt).await;
        assert!(result.succeeded);
        assert_eq!(attempt.calls, 2);
    }

    #[tokio::test]
    async fn configuration_errors_stop_immediately() {
        let mut attempt = ScriptedAttempt::new(vec![
            Err(CrawlError::Config("bad sitemap".to_string())),
            Ok(AttemptOutcome::Succeeded),
        ]);
        let result = run_journey_with_retries(3, Duration::ZERO, &mut attempt).await;
        assert!(!result.succeeded);
        assert_eq!(attempt.calls, 1);
        assert!(result.last_error.unwrap().contains("bad sitemap"));
    }
}
