pub mod click;
pub mod driver;
pub mod scrape;

// Re-export common types
pub use click::{perform_click, ClickOptions, ClickOutcome};
pub use driver::DriverManager;
pub use scrape::{scrape_rows, Record};
