use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::crawler::error::CrawlError;

/// Terminal status of a crawl job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

/// Writes the `audit_log` lifecycle for one crawl job: a `running` entry at
/// start and exactly one finalization with end time, duration and a summary
/// message.
pub struct AuditLog {
    pool: PgPool,
}

impl AuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Records the start of a job and returns the entry id.
    pub async fn start(&self, job_name: &str) -> Result<String, CrawlError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO audit_log (id, job_name, start_time, job_status) \
             VALUES ($1, $2, $3, 'running')",
        )
        .bind(&id)
        .bind(job_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        info!("Audit log entry {} created for '{}'", id, job_name);
        Ok(id)
    }

    /// Finalizes the entry. The duration is derived from the stored start
    /// time; a missing start row records a negative duration rather than
    /// losing the terminal status.
    pub async fn finish(
        &self,
        audit_id: &str,
        status: RunStatus,
        message: &str,
    ) -> Result<(), CrawlError> {
        let start_time: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT start_time FROM audit_log WHERE id = $1")
                .bind(audit_id)
                .fetch_optional(&self.pool)
                .await?;

        let end_time = Utc::now();
        let duration_secs = start_time
            .map(|start| (end_time - start).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(-1.0);

        sqlx::query(
            "UPDATE audit_log SET end_time = $1, job_status = $2, job_duration = $3, \
             message = $4 WHERE id = $5",
        )
        .bind(end_time)
        .bind(status.as_str())
        .bind(duration_secs)
        .bind(message)
        .bind(audit_id)
        .execute(&self.pool)
        .await?;

        info!(
            "Audit log entry {} finalized as '{}' after {:.1}s",
            audit_id,
            status.as_str(),
            duration_secs
        );
        Ok(())
    }
}
