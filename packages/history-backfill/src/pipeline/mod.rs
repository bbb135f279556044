//! Backfill pipeline: coordinator, per-channel crawler, write dispatcher
//! and progress reporting.

pub mod coordinator;
pub mod crawler;
pub mod dispatcher;
pub mod progress;
pub mod retry;

pub use coordinator::BackfillCoordinator;
pub use crawler::{ChannelCrawler, CrawlFailure};
pub use dispatcher::{
    Committed, DispatcherStats, WriteDispatcher, WriteDispatcherBuilder, WriteFailure, WriteHandle,
    WriteResult,
};
pub use progress::ProgressReporter;
pub use retry::{retry_fetch, Retried};
