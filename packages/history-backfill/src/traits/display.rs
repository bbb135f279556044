//! Display sink trait for progress rendering.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::types::job::JobSummary;
use crate::types::progress::ProgressSnapshot;

/// Best-effort, possibly slow and rate-limited progress display.
///
/// Only the throttled render loop and the coordinator call this; crawlers
/// never do.
#[async_trait]
pub trait DisplaySink: Send + Sync {
    async fn render(&self, snapshot: &ProgressSnapshot) -> Result<()>;

    /// Show the final outcome of a job that ran to completion.
    ///
    /// Not called for cancelled jobs. Defaults to doing nothing.
    async fn render_completion(&self, _summary: &JobSummary) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: DisplaySink + ?Sized> DisplaySink for Arc<T> {
    async fn render(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        (**self).render(snapshot).await
    }

    async fn render_completion(&self, summary: &JobSummary) -> Result<()> {
        (**self).render_completion(summary).await
    }
}
