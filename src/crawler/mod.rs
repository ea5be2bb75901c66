pub mod error;
pub mod journey;
pub mod path;
pub mod sitemap;
pub mod steps;

// Re-export common types
pub use error::{CrawlError, StepOutcome};
pub use journey::{Crawler, RunSummary};
pub use path::NavigationPath;
pub use sitemap::{Journey, Sitemap, Step};
