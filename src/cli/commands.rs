use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::error;

use crate::cli::config::Settings;
use crate::crawler::error::CrawlError;
use crate::crawler::journey::Crawler;
use crate::crawler::sitemap::{Sitemap, Step};
use crate::storage::audit::RunStatus;

/// Run every journey in the sitemap against one registered source site.
pub async fn run(parent_url_id: String, sitemap: PathBuf, table: String) -> Result<i32> {
    let settings = Settings::load_default().context("Failed to load settings")?;
    let crawler = Crawler::connect(settings)
        .await
        .context("Failed to connect to the database")?;

    match crawler.run(&parent_url_id, &sitemap, &table).await {
        Ok(summary) => {
            println!("{}", summary.message);
            Ok(match summary.status {
                RunStatus::Success => 0,
                RunStatus::Failed => 1,
            })
        }
        Err(CrawlError::Config(message)) => {
            error!("Configuration error: {}", message);
            Ok(2)
        }
        Err(err) => Err(err.into()),
    }
}

/// Decode and validate a sitemap file, printing a summary of its journeys.
pub async fn validate(sitemap: PathBuf) -> Result<i32> {
    match Sitemap::load(&sitemap) {
        Ok(sitemap) => {
            println!("Sitemap is valid: {} journey(s)", sitemap.journeys.len());
            for journey in &sitemap.journeys {
                println!(
                    "  - {} ({}): {} step(s)",
                    journey.journey_id,
                    journey.description,
                    count_steps(&journey.steps)
                );
            }
            Ok(0)
        }
        Err(CrawlError::Config(message)) => {
            error!("Sitemap is invalid: {}", message);
            Ok(2)
        }
        Err(err) => Err(err.into()),
    }
}

fn count_steps(steps: &[Step]) -> usize {
    steps
        .iter()
        .map(|step| {
            1 + match step {
                Step::AlphabetLoop(s) => count_steps(&s.loop_steps),
                Step::NextButtonPaginationLoop(s) => count_steps(&s.loop_steps),
                Step::NumericPaginationLoop(s) => count_steps(&s.loop_steps),
                Step::UrlLoop(s) => count_steps(&s.loop_steps),
                Step::Click(_) | Step::ProcessResults(_) | Step::Unknown { .. } => 0,
            }
        })
        .sum()
}

/// Show the current configuration
pub async fn show_config() -> Result<i32> {
    let settings = Settings::load_default()?;
    println!("Current configuration:");
    println!("{:#?}", settings);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_nested_steps() {
        let steps: Vec<Step> = serde_json::from_str(
            r#"[
                {"action": "click", "target": {"value": "//a"}},
                {"action": "alphabet_loop", "target": {"value": "//a"},
                 "loop_steps": [
                    {"action": "process_results", "scraping_config": {
                        "row": {"value": "//tr"},
                        "columns": [{"name": "title", "locator": {"value": "."}}]
                    }}
                 ]}
            ]"#,
        )
        .unwrap();
        assert_eq!(count_steps(&steps), 3);
    }
}
