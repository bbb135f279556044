//! Configuration types for crawling, dispatch and progress reporting.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{BackfillError, Result};
use crate::types::cursor::CursorPolicy;

/// Retry schedule with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `1` disables retries.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub initial_backoff: Duration,

    /// Cap for the doubled delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff: initial_backoff.saturating_mul(64),
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Configuration for a backfill run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Records requested per page.
    ///
    /// Default: 100 (the largest page Discord serves).
    pub page_size: usize,

    /// Minimum time between progress snapshots (and throttled cursor writes)
    /// from a single crawler.
    ///
    /// Default: 3s.
    pub progress_threshold: Duration,

    /// Render cadence of the progress display.
    ///
    /// Default: 1s.
    pub render_interval: Duration,

    /// Maximum concurrent persistence calls, shared by every active job.
    ///
    /// Default: 16.
    pub max_workers: usize,

    /// Maximum channels crawled at once in a multi-channel job.
    ///
    /// Default: 4.
    pub max_concurrent_channels: usize,

    /// Submitted-but-unsettled writes a crawler may hold before it waits
    /// for the oldest one.
    ///
    /// Default: 256.
    pub max_pending_writes: usize,

    /// Retry schedule for page fetches and anchor resolution.
    pub fetch_retry: RetryPolicy,

    /// Retry schedule for a single record write.
    pub write_retry: RetryPolicy,

    /// When the cursor may move past a record.
    ///
    /// Default: `AfterCommit`.
    #[serde(default)]
    pub cursor_policy: CursorPolicy,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            progress_threshold: Duration::from_secs(3),
            render_interval: Duration::from_secs(1),
            max_workers: 16,
            max_concurrent_channels: 4,
            max_pending_writes: 256,
            fetch_retry: RetryPolicy::default(),
            write_retry: RetryPolicy::new(3, Duration::from_millis(200)),
            cursor_policy: CursorPolicy::AfterCommit,
        }
    }
}

impl BackfillConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the progress threshold.
    pub fn with_progress_threshold(mut self, threshold: Duration) -> Self {
        self.progress_threshold = threshold;
        self
    }

    /// Set the render interval.
    pub fn with_render_interval(mut self, interval: Duration) -> Self {
        self.render_interval = interval;
        self
    }

    /// Set the write worker count.
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// Set the channel concurrency cap.
    pub fn with_max_concurrent_channels(mut self, channels: usize) -> Self {
        self.max_concurrent_channels = channels;
        self
    }

    /// Set the per-crawler pending write cap.
    pub fn with_max_pending_writes(mut self, pending: usize) -> Self {
        self.max_pending_writes = pending;
        self
    }

    /// Set the fetch retry policy.
    pub fn with_fetch_retry(mut self, policy: RetryPolicy) -> Self {
        self.fetch_retry = policy;
        self
    }

    /// Set the write retry policy.
    pub fn with_write_retry(mut self, policy: RetryPolicy) -> Self {
        self.write_retry = policy;
        self
    }

    /// Set the cursor policy.
    pub fn with_cursor_policy(mut self, policy: CursorPolicy) -> Self {
        self.cursor_policy = policy;
        self
    }

    /// Reject values that would stall or spin the engine.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.page_size == 0, "page_size must be > 0"),
            (self.max_workers == 0, "max_workers must be > 0"),
            (
                self.max_concurrent_channels == 0,
                "max_concurrent_channels must be > 0",
            ),
            (self.max_pending_writes == 0, "max_pending_writes must be > 0"),
            (
                self.render_interval.is_zero(),
                "render_interval must be non-zero",
            ),
            (
                self.fetch_retry.max_attempts == 0,
                "fetch_retry.max_attempts must be > 0",
            ),
            (
                self.write_retry.max_attempts == 0,
                "write_retry.max_attempts must be > 0",
            ),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(BackfillError::Config((*message).to_string())),
            None => Ok(()),
        }
    }
}
