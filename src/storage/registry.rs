use sqlx::PgPool;
use tracing::debug;

use crate::crawler::error::CrawlError;

/// Looks up the entry point for a registered source site. Crawl targets are
/// rows in `parent_urls`; an id with no row there is a configuration
/// mistake, which the caller reports without starting a browser.
pub async fn fetch_base_url(
    pool: &PgPool,
    parent_url_id: &str,
) -> Result<Option<String>, CrawlError> {
    let base_url: Option<String> =
        sqlx::query_scalar("SELECT base_url FROM parent_urls WHERE id = $1")
            .bind(parent_url_id)
            .fetch_optional(pool)
            .await?;

    match &base_url {
        Some(url) => debug!("Resolved parent url {} to {}", parent_url_id, url),
        None => debug!("No registry entry for parent url {}", parent_url_id),
    }
    Ok(base_url)
}
