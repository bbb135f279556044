//! Display sink that writes progress to the log.

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::traits::display::DisplaySink;
use crate::types::job::JobSummary;
use crate::types::progress::ProgressSnapshot;

/// Renders snapshots as `tracing` events. Used when no progress message
/// is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDisplay;

impl LogDisplay {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DisplaySink for LogDisplay {
    async fn render(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        info!(
            title = %snapshot.title,
            author = %snapshot.author_label,
            at = %snapshot.timestamp,
            "{}",
            snapshot.description
        );
        Ok(())
    }

    async fn render_completion(&self, summary: &JobSummary) -> Result<()> {
        info!(
            job_id = %summary.job_id,
            completed = summary.completed(),
            failed = summary.failed(),
            records = summary.records_committed(),
            "backfill finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_render_never_fails() {
        let snapshot = ProgressSnapshot::new("Processing messages", "text", "someone", Utc::now());
        assert!(LogDisplay::new().render(&snapshot).await.is_ok());
    }
}
