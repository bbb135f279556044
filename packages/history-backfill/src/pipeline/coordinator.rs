//! Backfill coordinator: runs one crawler per channel under shared limits.
//!
//! A job gets one progress slot and one render loop, whatever the number
//! of channels. Channels run as independent tasks, at most
//! `max_concurrent_channels` at a time, and a failing channel never stops
//! the others.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{BackfillError, Result};
use crate::pipeline::crawler::ChannelCrawler;
use crate::pipeline::dispatcher::WriteDispatcher;
use crate::pipeline::progress::ProgressReporter;
use crate::pipeline::retry::{retry_fetch, Retried};
use crate::traits::cursor::CursorStore;
use crate::traits::display::DisplaySink;
use crate::traits::source::HistorySource;
use crate::types::config::BackfillConfig;
use crate::types::job::{BackfillJob, ChannelReport, JobSummary};
use crate::types::record::{ChannelId, Direction, GuildId};

pub struct BackfillCoordinator<S: ?Sized, C: ?Sized, D: ?Sized> {
    source: Arc<S>,
    cursors: Arc<C>,
    display: Arc<D>,
    dispatcher: WriteDispatcher,
    config: BackfillConfig,
    channel_permits: Arc<Semaphore>,
}

impl<S, C, D> BackfillCoordinator<S, C, D>
where
    S: HistorySource + ?Sized + 'static,
    C: CursorStore + ?Sized + 'static,
    D: DisplaySink + ?Sized + 'static,
{
    /// Build a coordinator. Fails if `config` does not validate.
    ///
    /// The channel limit is shared by every job this coordinator runs, as
    /// is the dispatcher's worker budget.
    pub fn new(
        source: Arc<S>,
        cursors: Arc<C>,
        display: Arc<D>,
        dispatcher: WriteDispatcher,
        config: BackfillConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            cursors,
            display,
            dispatcher,
            channel_permits: Arc::new(Semaphore::new(config.max_concurrent_channels)),
            config,
        })
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &WriteDispatcher {
        &self.dispatcher
    }

    /// Backfill every text channel of a guild, oldest message first.
    pub async fn run_guild_backfill(
        &self,
        guild_id: GuildId,
        cancel: &CancellationToken,
    ) -> Result<JobSummary> {
        let channels = match retry_fetch(&self.config.fetch_retry, cancel, "list_channels", || {
            self.source.list_channels(guild_id)
        })
        .await
        {
            Retried::Ok(channels) => channels,
            Retried::Cancelled => return Err(BackfillError::Cancelled),
            Retried::Failed { attempts, error } => {
                error!(guild_id = %guild_id, attempts, error = %error, "listing channels failed");
                return Err(BackfillError::ChannelListing {
                    guild_id,
                    attempts,
                    source: error,
                });
            }
        };

        info!(guild_id = %guild_id, channels = channels.len(), "starting guild backfill");
        let ids = channels.into_iter().map(|c| c.id).collect();
        Ok(self.run_channels(ids, Direction::Forward, cancel).await)
    }

    /// Backfill one channel in the given direction.
    pub async fn run_single_channel_backfill(
        &self,
        channel_id: ChannelId,
        direction: Direction,
        cancel: &CancellationToken,
    ) -> JobSummary {
        self.run_channels(vec![channel_id], direction, cancel).await
    }

    /// Crawl `channels` concurrently and wait for all of them.
    pub async fn run_channels(
        &self,
        channels: Vec<ChannelId>,
        direction: Direction,
        cancel: &CancellationToken,
    ) -> JobSummary {
        let mut summary = JobSummary::new(Uuid::new_v4());
        let job_id = summary.job_id;
        info!(
            job_id = %job_id,
            channels = channels.len(),
            direction = %direction,
            "backfill job started"
        );

        let reporter = ProgressReporter::new();
        let render_cancel = cancel.child_token();
        let render_task = reporter.spawn_render_loop(
            self.display.clone(),
            self.config.render_interval,
            render_cancel.clone(),
        );

        let tasks: Vec<_> = channels
            .into_iter()
            .map(|channel_id| {
                let job = BackfillJob::new(channel_id, direction);
                let handle = tokio::spawn(run_channel(
                    ChannelCrawler::new(
                        self.source.clone(),
                        self.cursors.clone(),
                        self.dispatcher.clone(),
                        reporter.clone(),
                        self.config.clone(),
                    ),
                    job.clone(),
                    self.channel_permits.clone(),
                    cancel.clone(),
                ));
                (job, handle)
            })
            .collect();

        let (jobs, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        for (job, joined) in jobs.iter().zip(join_all(handles).await) {
            let report = joined.unwrap_or_else(|join_error| {
                error!(channel_id = %job.channel_id, error = %join_error, "crawler task panicked");
                ChannelReport::failed_with(job, format!("crawler task panicked: {join_error}"))
            });
            summary.channels.push(report);
        }

        render_cancel.cancel();
        if let Err(e) = render_task.await {
            warn!(error = %e, "render loop task failed");
        }

        if !cancel.is_cancelled() {
            if let Err(e) = self.display.render_completion(&summary).await {
                warn!(error = %e, "completion render failed");
            }
        }

        info!(
            job_id = %job_id,
            completed = summary.completed(),
            failed = summary.failed(),
            cancelled = summary.cancelled(),
            records = summary.records_committed(),
            "backfill job finished"
        );
        summary
    }
}

async fn run_channel<S, C>(
    crawler: ChannelCrawler<S, C>,
    job: BackfillJob,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
) -> ChannelReport
where
    S: HistorySource + ?Sized,
    C: CursorStore + ?Sized,
{
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return ChannelReport::cancelled_before_start(&job),
        permit = permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return ChannelReport::failed_with(&job, "channel limiter closed"),
        },
    };

    crawler
        .crawl(job.channel_id, job.direction, &cancel)
        .await
        .unwrap_or_else(|failure| failure.report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::{MemoryCursorStore, MemoryRecordStore};
    use crate::testing::{MockHistorySource, RecordingDisplay};
    use crate::types::config::RetryPolicy;
    use crate::types::job::JobStatus;
    use crate::types::record::RecordId;
    use std::time::Duration;

    fn coordinator(
        source: MockHistorySource,
        config: BackfillConfig,
    ) -> (
        BackfillCoordinator<MockHistorySource, MemoryCursorStore, RecordingDisplay>,
        Arc<MemoryRecordStore>,
        Arc<RecordingDisplay>,
    ) {
        let records = Arc::new(MemoryRecordStore::new());
        let display = Arc::new(RecordingDisplay::new());
        let coordinator = BackfillCoordinator::new(
            Arc::new(source),
            Arc::new(MemoryCursorStore::new()),
            display.clone(),
            WriteDispatcher::from_config(records.clone(), &config),
            config,
        )
        .unwrap();
        (coordinator, records, display)
    }

    fn config() -> BackfillConfig {
        BackfillConfig::new()
            .with_page_size(5)
            .with_max_workers(4)
            .with_max_concurrent_channels(2)
            .with_fetch_retry(RetryPolicy::new(2, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_guild_backfill_isolates_failures() {
        let source = MockHistorySource::new()
            .with_guild(GuildId(1), [ChannelId(10), ChannelId(20), ChannelId(30)])
            .with_channel(ChannelId(10), 1..=12)
            .with_channel(ChannelId(20), 100..=110)
            .with_channel(ChannelId(30), 200..=203)
            .failing_page(ChannelId(20), 1);
        let (coordinator, records, display) = coordinator(source, config());

        let summary = coordinator
            .run_guild_backfill(GuildId(1), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.channels.len(), 3);
        assert_eq!(summary.completed(), 2);
        assert_eq!(summary.failed(), 1);
        assert_eq!(
            summary.channel(ChannelId(20)).unwrap().status,
            JobStatus::Failed
        );
        assert_eq!(records.ids_for_channel(ChannelId(10)).len(), 12);
        assert_eq!(records.ids_for_channel(ChannelId(30)).len(), 4);
        assert_eq!(display.completions(), 1);
    }

    #[tokio::test]
    async fn test_failed_channel_summary_keeps_progress() {
        let source = MockHistorySource::new()
            .with_guild(GuildId(1), [ChannelId(20)])
            .with_channel(ChannelId(20), 31..=60)
            .failing_page(ChannelId(20), 2);
        let (coordinator, records, _) = coordinator(source, config().with_page_size(10));

        let summary = coordinator
            .run_guild_backfill(GuildId(1), &CancellationToken::new())
            .await
            .unwrap();

        let report = summary.channel(ChannelId(20)).unwrap();
        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.pages_fetched, 1);
        assert_eq!(report.records_submitted, 10);
        assert_eq!(report.records_committed, 10);
        assert_eq!(report.cursor, Some(RecordId(40)));
        assert_eq!(summary.records_committed(), records.len());
    }

    #[tokio::test]
    async fn test_channel_concurrency_is_bounded() {
        let source = MockHistorySource::new()
            .with_guild(GuildId(1), (1..=6).map(ChannelId))
            .with_page_delay(Duration::from_millis(20));
        let source = (1..=6).fold(source, |s, c| s.with_channel(ChannelId(c), 1..=3));
        let (coordinator, _, _) = coordinator(source, config());

        let summary = coordinator
            .run_guild_backfill(GuildId(1), &CancellationToken::new())
            .await
            .unwrap();

        assert!(summary.is_success());
        let source = coordinator.source.clone();
        assert!(source.peak_active_channels() <= 2);
    }

    #[tokio::test]
    async fn test_single_channel_backfill() {
        let source = MockHistorySource::new().with_channel(ChannelId(5), 1..=9);
        let (coordinator, records, _) = coordinator(source, config());

        let cancel = CancellationToken::new();
        let summary = coordinator
            .run_single_channel_backfill(ChannelId(5), Direction::Backward, &cancel)
            .await;

        assert!(summary.is_success());
        assert_eq!(records.len(), 9);
        assert_eq!(summary.channel(ChannelId(5)).unwrap().direction, Direction::Backward);
    }

    #[tokio::test]
    async fn test_cancelled_job_skips_completion_render() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let source = MockHistorySource::new()
            .with_guild(GuildId(1), [ChannelId(1)])
            .with_channel(ChannelId(1), 1..=3);
        let (coordinator, records, display) = coordinator(source, config());

        let summary = coordinator
            .run_channels(vec![ChannelId(1)], Direction::Forward, &cancel)
            .await;

        assert_eq!(summary.cancelled(), 1);
        assert!(records.is_empty());
        assert_eq!(display.completions(), 0);
        assert_eq!(display.render_count(), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = BackfillCoordinator::new(
            Arc::new(MockHistorySource::new()),
            Arc::new(MemoryCursorStore::new()),
            Arc::new(RecordingDisplay::new()),
            WriteDispatcher::new(Arc::new(MemoryRecordStore::new()), 1),
            BackfillConfig::new().with_page_size(0),
        );
        assert!(matches!(result, Err(BackfillError::Config(_))));
    }
}
