//! Resumable Channel History Backfill
//!
//! Ingests the complete history of paginated, ordered channels into
//! durable storage. Crawls survive restarts through per-channel cursors,
//! writes run on a bounded shared pool, and progress is shown through a
//! throttled display that can never slow the crawl down.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use backfill::{BackfillConfig, BackfillCoordinator, LogDisplay, MemoryCursorStore,
//!     MemoryRecordStore, WriteDispatcher};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = BackfillConfig::default();
//! let dispatcher = WriteDispatcher::from_config(Arc::new(MemoryRecordStore::new()), &config);
//! let coordinator = BackfillCoordinator::new(
//!     Arc::new(source),
//!     Arc::new(MemoryCursorStore::new()),
//!     Arc::new(LogDisplay::new()),
//!     dispatcher,
//!     config,
//! )?;
//!
//! let summary = coordinator.run_guild_backfill(guild_id, &CancellationToken::new()).await?;
//! println!("{} channels completed", summary.completed());
//! ```
//!
//! # Modules
//!
//! - [`traits`] - Collaborator abstractions (HistorySource, PersistenceSink, CursorStore,
//!   DisplaySink)
//! - [`types`] - Records, cursors, jobs, snapshots and config
//! - [`pipeline`] - Coordinator, crawler, write dispatcher, progress reporter
//! - [`stores`] - Storage implementations (memory, JSON file, SQLite)
//! - [`sources`] - History sources (Discord REST, rate limiting)
//! - [`display`] - Progress displays (log, Discord message)
//! - [`testing`] - Mock implementations for testing

pub mod display;
pub mod error;
pub mod pipeline;
pub mod sources;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;

// Re-export core types at crate root
pub use error::{BackfillError, FetchError, PersistenceError, Result};
pub use traits::{
    cursor::CursorStore,
    display::DisplaySink,
    sink::{DeadLetterSink, PersistenceSink},
    source::{HistorySource, PageRequest},
};
pub use types::{
    config::{BackfillConfig, RetryPolicy},
    cursor::{ChannelCursor, CursorKey, CursorPolicy},
    job::{BackfillJob, ChannelReport, CrawlState, JobStatus, JobSummary},
    progress::ProgressSnapshot,
    record::{AuthorId, ChannelId, ChannelInfo, Direction, GuildId, Record, RecordId},
};

// Re-export pipeline components
pub use pipeline::{
    BackfillCoordinator, ChannelCrawler, CrawlFailure, ProgressReporter, WriteDispatcher,
    WriteFailure, WriteHandle,
};

// Re-export stores
pub use stores::{JsonFileCursorStore, MemoryCursorStore, MemoryRecordStore};

#[cfg(feature = "sqlite")]
pub use stores::SqliteStore;

// Re-export sources and displays
pub use display::LogDisplay;
pub use sources::RateLimitedSource;

#[cfg(feature = "discord")]
pub use display::DiscordMessageDisplay;
#[cfg(feature = "discord")]
pub use sources::{DiscordApi, DiscordHistorySource};
