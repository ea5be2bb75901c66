use thiserror::Error;

/// Failure taxonomy for a crawl run.
///
/// Soft conditions (an absent pagination control, an empty results page, a
/// click target that never appeared) are expressed as outcome values, not
/// errors; see [`StepOutcome`] and `ClickOutcome`. `CrawlError` is reserved
/// for faults that abort the current journey attempt or the whole run.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// The WebDriver session could not be started at all.
    #[error("failed to start browser session: {0}")]
    DriverInit(#[source] thirtyfour::error::WebDriverError),

    /// The browser session died mid-crawl (invalid session, closed window).
    /// Aborts the current journey attempt; remaining steps are skipped.
    #[error("browser session crashed: {0}")]
    BrowserCrashed(String),

    /// A configured action could not complete after its bounded retries.
    #[error("step failed: {0}")]
    StepFailed(String),

    /// A static configuration defect. Never retried, since retrying cannot
    /// fix a bad sitemap or an invalid table name.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    WebDriver(#[from] thirtyfour::error::WebDriverError),
}

/// Result of dispatching one configured step.
///
/// `Failed` is a soft step failure: the journey attempt is abandoned and the
/// orchestrator decides whether to retry. Fatal faults travel as `CrawlError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Failed,
}

impl StepOutcome {
    pub fn completed(self) -> bool {
        self == StepOutcome::Completed
    }
}
