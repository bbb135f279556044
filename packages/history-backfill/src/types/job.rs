//! Job bookkeeping: per-channel jobs, crawl states and summaries.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BackfillError;
use crate::types::record::{ChannelId, Direction, RecordId};

/// Lifecycle status of a channel job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }
}

/// Crawler state machine: `Init → Fetching ⇄ RecordEmit → Done`,
/// with `Cancelled` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlState {
    Init,
    Fetching,
    RecordEmit,
    Done,
    Cancelled,
}

impl CrawlState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CrawlState::Done | CrawlState::Cancelled)
    }
}

/// One channel's backfill, created pending and owned by its crawler while
/// running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillJob {
    pub channel_id: ChannelId,
    pub direction: Direction,
    pub status: JobStatus,
}

impl BackfillJob {
    pub fn new(channel_id: ChannelId, direction: Direction) -> Self {
        Self {
            channel_id,
            direction,
            status: JobStatus::Pending,
        }
    }
}

/// What happened to one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelReport {
    pub channel_id: ChannelId,
    pub direction: Direction,
    pub status: JobStatus,
    /// Distinct crawler states, in first-visit order
    pub states_visited: Vec<CrawlState>,
    pub pages_fetched: usize,
    pub records_submitted: usize,
    pub records_committed: usize,
    pub records_failed: usize,
    /// Failed records that were routed to the dead-letter sink
    pub records_dead_lettered: usize,
    /// Last cursor value persisted by this run
    pub cursor: Option<RecordId>,
    pub cursor_writes: usize,
    pub snapshots_published: usize,
    /// Failure reason for `Failed` channels
    pub error: Option<String>,
}

impl ChannelReport {
    pub fn new(job: &BackfillJob) -> Self {
        Self {
            channel_id: job.channel_id,
            direction: job.direction,
            status: job.status,
            states_visited: Vec::new(),
            pages_fetched: 0,
            records_submitted: 0,
            records_committed: 0,
            records_failed: 0,
            records_dead_lettered: 0,
            cursor: None,
            cursor_writes: 0,
            snapshots_published: 0,
            error: None,
        }
    }

    /// Mark the channel failed, keeping the progress made before `error`.
    pub fn fail(&mut self, error: &BackfillError) {
        self.status = JobStatus::Failed;
        self.error = Some(error.to_string());
    }

    pub fn failed_with(job: &BackfillJob, reason: impl Into<String>) -> Self {
        let mut report = Self::new(job);
        report.status = JobStatus::Failed;
        report.error = Some(reason.into());
        report
    }

    /// Record entering `state`. Revisits are not repeated.
    pub fn visit(&mut self, state: CrawlState) {
        if !self.states_visited.contains(&state) {
            self.states_visited.push(state);
        }
    }

    /// Report for a channel that never started because the job was cancelled.
    pub fn cancelled_before_start(job: &BackfillJob) -> Self {
        let mut report = Self::new(job);
        report.status = JobStatus::Cancelled;
        report
    }

    /// Records handed to the dispatcher whose outcome is known.
    pub fn records_settled(&self) -> usize {
        self.records_committed + self.records_failed
    }
}

/// Aggregated outcome of a backfill job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub channels: Vec<ChannelReport>,
}

impl JobSummary {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            channels: Vec::new(),
        }
    }

    pub fn completed(&self) -> usize {
        self.count(JobStatus::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(JobStatus::Failed)
    }

    pub fn cancelled(&self) -> usize {
        self.count(JobStatus::Cancelled)
    }

    pub fn records_committed(&self) -> usize {
        self.channels.iter().map(|c| c.records_committed).sum()
    }

    /// Check if every channel completed.
    pub fn is_success(&self) -> bool {
        self.channels
            .iter()
            .all(|c| c.status == JobStatus::Completed)
    }

    pub fn channel(&self, channel_id: ChannelId) -> Option<&ChannelReport> {
        self.channels.iter().find(|c| c.channel_id == channel_id)
    }

    fn count(&self, status: JobStatus) -> usize {
        self.channels.iter().filter(|c| c.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(channel: u64, status: JobStatus) -> ChannelReport {
        let mut job = BackfillJob::new(ChannelId(channel), Direction::Forward);
        job.status = status;
        ChannelReport::new(&job)
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = JobSummary::new(Uuid::new_v4());
        summary.channels.push(report(1, JobStatus::Completed));
        summary.channels.push(report(2, JobStatus::Failed));
        summary.channels.push(report(3, JobStatus::Completed));
        summary.channels.push(report(4, JobStatus::Cancelled));

        assert_eq!(summary.completed(), 2);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.cancelled(), 1);
        assert!(!summary.is_success());
        assert_eq!(summary.channel(ChannelId(2)).unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn test_failed_report_keeps_progress() {
        let mut report = report(9, JobStatus::Running);
        report.pages_fetched = 2;
        report.records_committed = 10;
        report.cursor = Some(RecordId(40));
        let err = BackfillError::CursorResolution {
            channel_id: ChannelId(9),
            record_id: RecordId(7),
            reason: "deleted".into(),
        };

        report.fail(&err);

        assert_eq!(report.status, JobStatus::Failed);
        assert!(report.error.as_deref().unwrap().contains("could not be resolved"));
        assert_eq!(report.pages_fetched, 2);
        assert_eq!(report.records_committed, 10);
        assert_eq!(report.cursor, Some(RecordId(40)));
    }

    #[test]
    fn test_visit_records_first_visit_only() {
        let mut report = report(1, JobStatus::Running);
        for state in [
            CrawlState::Init,
            CrawlState::Fetching,
            CrawlState::RecordEmit,
            CrawlState::Fetching,
            CrawlState::RecordEmit,
            CrawlState::Done,
        ] {
            report.visit(state);
        }
        assert_eq!(
            report.states_visited,
            vec![
                CrawlState::Init,
                CrawlState::Fetching,
                CrawlState::RecordEmit,
                CrawlState::Done
            ]
        );
    }
}
