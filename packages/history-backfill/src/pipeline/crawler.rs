//! Per-channel crawler.
//!
//! Pages through one channel's history in a fixed direction, hands every
//! record to the shared write dispatcher, publishes throttled progress
//! snapshots and keeps the channel's resume cursor.
//!
//! With [`CursorPolicy::AfterCommit`] the persisted cursor only ever
//! covers the contiguous prefix of records whose writes have settled
//! (committed, or failed and dead-lettered). A crash between cursor writes
//! replays records instead of skipping them, and sinks are idempotent.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BackfillError, FetchError, Result};
use crate::pipeline::dispatcher::{WriteDispatcher, WriteHandle, WriteResult};
use crate::pipeline::progress::ProgressReporter;
use crate::pipeline::retry::{retry_fetch, Retried};
use crate::traits::cursor::CursorStore;
use crate::traits::source::{HistorySource, PageRequest};
use crate::types::config::BackfillConfig;
use crate::types::cursor::{ChannelCursor, CursorKey, CursorPolicy};
use crate::types::job::{BackfillJob, ChannelReport, CrawlState, JobStatus};
use crate::types::progress::ProgressSnapshot;
use crate::types::record::{ChannelId, Direction, Record, RecordId};

/// A crawl that ended in an error.
///
/// `report` keeps everything the crawl did before failing: pages, settled
/// writes and the cursor it flushed. Its status is `Failed` and its `error`
/// holds the reason.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct CrawlFailure {
    pub report: ChannelReport,
    #[source]
    pub error: BackfillError,
}

/// Crawls a single channel. Cheap to build, one per channel job.
pub struct ChannelCrawler<S: ?Sized, C: ?Sized> {
    source: Arc<S>,
    cursors: Arc<C>,
    dispatcher: WriteDispatcher,
    reporter: ProgressReporter,
    config: BackfillConfig,
}

impl<S, C> ChannelCrawler<S, C>
where
    S: HistorySource + ?Sized,
    C: CursorStore + ?Sized,
{
    pub fn new(
        source: Arc<S>,
        cursors: Arc<C>,
        dispatcher: WriteDispatcher,
        reporter: ProgressReporter,
        config: BackfillConfig,
    ) -> Self {
        Self {
            source,
            cursors,
            dispatcher,
            reporter,
            config,
        }
    }

    /// Crawl `channel_id` in `direction` until the history is exhausted or
    /// `cancel` fires.
    ///
    /// Resumes from the stored cursor when there is one. Whatever the
    /// outcome, writes already submitted are awaited and the cursor is
    /// flushed to the furthest safe point before returning.
    pub async fn crawl(
        &self,
        channel_id: ChannelId,
        direction: Direction,
        cancel: &CancellationToken,
    ) -> std::result::Result<ChannelReport, CrawlFailure> {
        let mut run = CrawlRun::new(channel_id, direction, self.config.cursor_policy);
        info!(
            channel_id = %channel_id,
            direction = %direction,
            "starting channel crawl"
        );

        let outcome = self.traverse(&mut run, cancel).await;

        run.tracker.drain().await;
        run.sync_counts();
        let flushed = self.persist_cursor(&mut run).await;

        let end_state = match (outcome, flushed) {
            (Ok(state), Ok(())) => state,
            (Err(e), flushed) => {
                if let Err(flush_error) = flushed {
                    warn!(
                        channel_id = %channel_id,
                        error = %flush_error,
                        "final cursor flush failed"
                    );
                }
                error!(
                    channel_id = %channel_id,
                    kind = e.kind(),
                    error = %e,
                    committed = run.report.records_committed,
                    cursor = ?run.report.cursor,
                    "channel crawl failed"
                );
                return Err(run.into_failure(e));
            }
            (Ok(_), Err(e)) => {
                error!(channel_id = %channel_id, error = %e, "final cursor flush failed");
                return Err(run.into_failure(e));
            }
        };

        run.report.visit(end_state);
        run.report.status = match end_state {
            CrawlState::Cancelled => JobStatus::Cancelled,
            _ => JobStatus::Completed,
        };

        info!(
            channel_id = %channel_id,
            direction = %direction,
            status = ?run.report.status,
            pages = run.report.pages_fetched,
            committed = run.report.records_committed,
            failed = run.report.records_failed,
            cursor = ?run.report.cursor,
            "channel crawl finished"
        );
        Ok(run.report)
    }

    async fn traverse(&self, run: &mut CrawlRun, cancel: &CancellationToken) -> Result<CrawlState> {
        let channel_id = run.key.channel_id;
        let direction = run.key.direction;

        let stored = self.cursors.get(&run.key).await?;
        run.persisted = stored.map(|last_record_id| ChannelCursor {
            channel_id,
            direction,
            last_record_id,
        });
        run.report.cursor = stored;

        let anchor = match stored {
            None => None,
            Some(record_id) => match self.resolve(channel_id, record_id, cancel).await? {
                Some(anchor) => Some(anchor),
                None => return Ok(CrawlState::Cancelled),
            },
        };
        if let Some(anchor) = anchor {
            info!(channel_id = %channel_id, resume_from = %anchor, "resuming from stored cursor");
        }

        let mut request = PageRequest::new(channel_id, direction, self.config.page_size)
            .with_anchor(anchor);

        loop {
            if cancel.is_cancelled() {
                return Ok(CrawlState::Cancelled);
            }
            run.report.visit(CrawlState::Fetching);

            let page = match retry_fetch(&self.config.fetch_retry, cancel, "fetch_page", || {
                self.source.fetch_page(&request)
            })
            .await
            {
                Retried::Ok(page) => page,
                Retried::Cancelled => return Ok(CrawlState::Cancelled),
                Retried::Failed { attempts, error } => {
                    return Err(BackfillError::SourceFetch {
                        channel_id,
                        attempts,
                        source: error,
                    })
                }
            };
            run.report.pages_fetched += 1;
            let last_page = request.is_last_page(page.len());
            debug!(
                channel_id = %channel_id,
                page = run.report.pages_fetched,
                records = page.len(),
                anchor = ?request.anchor,
                "fetched page"
            );

            let before = run.last_seen;
            for record in page {
                if cancel.is_cancelled() {
                    return Ok(CrawlState::Cancelled);
                }

                let reference = run.last_seen.or(request.anchor);
                if let Some(reference) = reference {
                    if !direction.is_beyond(record.id, reference) {
                        warn!(
                            channel_id = %channel_id,
                            record_id = %record.id,
                            after = %reference,
                            "skipping out-of-order record"
                        );
                        continue;
                    }
                }

                run.report.visit(CrawlState::RecordEmit);
                if !self.emit(run, record, cancel).await? {
                    return Ok(CrawlState::Cancelled);
                }
            }

            if last_page {
                return Ok(CrawlState::Done);
            }
            if run.last_seen == before {
                return Err(BackfillError::SourceFetch {
                    channel_id,
                    attempts: 1,
                    source: FetchError::Decode(format!(
                        "full page did not advance past {:?}",
                        request.anchor
                    )),
                });
            }
            request.anchor = run.last_seen;
        }
    }

    /// Resolve a stored cursor to a page anchor. `None` means cancelled.
    ///
    /// Only a missing record is a resolution error; any other failure is a
    /// source failure and leaves the cursor trustworthy.
    async fn resolve(
        &self,
        channel_id: ChannelId,
        record_id: RecordId,
        cancel: &CancellationToken,
    ) -> Result<Option<RecordId>> {
        match retry_fetch(&self.config.fetch_retry, cancel, "resolve_anchor", || {
            self.source.resolve_anchor(channel_id, record_id)
        })
        .await
        {
            Retried::Ok(anchor) => Ok(Some(anchor)),
            Retried::Cancelled => Ok(None),
            Retried::Failed {
                error: error @ FetchError::NotFound { .. },
                ..
            } => Err(BackfillError::CursorResolution {
                channel_id,
                record_id,
                reason: error.to_string(),
            }),
            Retried::Failed { attempts, error } => Err(BackfillError::SourceFetch {
                channel_id,
                attempts,
                source: error,
            }),
        }
    }

    /// Submit one record. Returns `false` if cancelled while waiting for a
    /// worker.
    async fn emit(
        &self,
        run: &mut CrawlRun,
        record: Record,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if run.tracker.pending() >= self.config.max_pending_writes {
            run.tracker.settle_oldest().await;
        }

        let snapshot = (run.last_progress.elapsed() >= self.config.progress_threshold)
            .then(|| ProgressSnapshot::from_record(&record));
        let record_id = record.id;

        let handle = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(false),
            handle = self.dispatcher.submit(record) => handle?,
        };
        run.tracker.push(handle);
        run.last_seen = Some(record_id);
        run.report.records_submitted += 1;
        run.tracker.settle_ready();

        if let Some(snapshot) = snapshot {
            self.reporter.update_snapshot(snapshot);
            run.report.snapshots_published += 1;
            run.sync_counts();
            self.persist_cursor(run).await?;
            run.last_progress = Instant::now();
        }
        Ok(true)
    }

    /// Write the cursor if the safe point moved past the stored value.
    async fn persist_cursor(&self, run: &mut CrawlRun) -> Result<()> {
        let target = match run.policy {
            CursorPolicy::AfterCommit => run.tracker.watermark,
            CursorPolicy::OnSubmit => run.last_seen,
        };
        let Some(target) = target else {
            return Ok(());
        };
        if let Some(current) = &run.persisted {
            if !current.can_advance_to(target) {
                return Ok(());
            }
        }

        self.cursors.set(&run.key, target).await?;
        run.persisted = Some(ChannelCursor {
            channel_id: run.key.channel_id,
            direction: run.key.direction,
            last_record_id: target,
        });
        run.report.cursor = Some(target);
        run.report.cursor_writes += 1;
        debug!(key = %run.key, cursor = %target, "cursor persisted");
        Ok(())
    }
}

/// Mutable state of one crawl.
struct CrawlRun {
    key: CursorKey,
    policy: CursorPolicy,
    report: ChannelReport,
    tracker: CommitTracker,
    /// Last record handed to the dispatcher
    last_seen: Option<RecordId>,
    /// Cursor currently in the store
    persisted: Option<ChannelCursor>,
    last_progress: Instant,
}

impl CrawlRun {
    fn new(channel_id: ChannelId, direction: Direction, policy: CursorPolicy) -> Self {
        let mut job = BackfillJob::new(channel_id, direction);
        job.status = JobStatus::Running;
        let mut report = ChannelReport::new(&job);
        report.visit(CrawlState::Init);

        Self {
            key: CursorKey::new(channel_id, direction),
            policy,
            report,
            tracker: CommitTracker::new(channel_id),
            last_seen: None,
            persisted: None,
            last_progress: Instant::now(),
        }
    }

    fn into_failure(mut self, error: BackfillError) -> CrawlFailure {
        self.report.fail(&error);
        CrawlFailure {
            report: self.report,
            error,
        }
    }

    fn sync_counts(&mut self) {
        self.report.records_committed = self.tracker.committed;
        self.report.records_failed = self.tracker.failed;
        self.report.records_dead_lettered = self.tracker.dead_lettered;
    }
}

/// Outstanding writes of one crawl, in traversal order.
///
/// Settles handles strictly from the front, so `watermark` is always the
/// last record of a contiguous settled prefix. A failure that was not
/// dead-lettered pins the watermark for the rest of the crawl.
struct CommitTracker {
    channel_id: ChannelId,
    pending: VecDeque<WriteHandle>,
    watermark: Option<RecordId>,
    blocked: bool,
    committed: usize,
    failed: usize,
    dead_lettered: usize,
}

impl CommitTracker {
    fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            pending: VecDeque::new(),
            watermark: None,
            blocked: false,
            committed: 0,
            failed: 0,
            dead_lettered: 0,
        }
    }

    fn push(&mut self, handle: WriteHandle) {
        self.pending.push_back(handle);
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Settle finished writes at the front without waiting.
    fn settle_ready(&mut self) {
        while let Some(front) = self.pending.front_mut() {
            if !front.is_finished() {
                break;
            }
            let Some(result) = front.now_or_never() else {
                break;
            };
            self.pending.pop_front();
            self.settle(result);
        }
    }

    async fn settle_oldest(&mut self) {
        if let Some(handle) = self.pending.pop_front() {
            let result = handle.await;
            self.settle(result);
        }
    }

    async fn drain(&mut self) {
        while let Some(handle) = self.pending.pop_front() {
            let result = handle.await;
            self.settle(result);
        }
    }

    fn settle(&mut self, result: WriteResult) {
        match result {
            Ok(committed) => {
                self.committed += 1;
                self.advance(committed.record_id);
            }
            Err(failure) => {
                self.failed += 1;
                if failure.dead_lettered {
                    self.dead_lettered += 1;
                    self.advance(failure.record_id);
                } else if !self.blocked {
                    self.blocked = true;
                    warn!(
                        channel_id = %self.channel_id,
                        record_id = %failure.record_id,
                        error = %failure.error,
                        "cursor held before failed record"
                    );
                }
            }
        }
    }

    fn advance(&mut self, record_id: RecordId) {
        if !self.blocked {
            self.watermark = Some(record_id);
        }
    }
}
