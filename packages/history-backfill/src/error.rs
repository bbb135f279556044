//! Typed errors for the backfill engine.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so callers can match
//! on the failure kind and decide a recovery policy.

use std::time::Duration;

use thiserror::Error;

use crate::types::record::{ChannelId, GuildId, RecordId};

/// Errors that can end a crawl or a backfill job.
#[derive(Debug, Error)]
pub enum BackfillError {
    /// The history source failed after all retry attempts
    #[error("source fetch failed for channel {channel_id} after {attempts} attempt(s): {source}")]
    SourceFetch {
        channel_id: ChannelId,
        attempts: u32,
        #[source]
        source: FetchError,
    },

    /// Listing a guild's channels failed after all retry attempts
    #[error("listing channels of guild {guild_id} failed after {attempts} attempt(s): {source}")]
    ChannelListing {
        guild_id: GuildId,
        attempts: u32,
        #[source]
        source: FetchError,
    },

    /// A stored cursor no longer resolves to a record in the source
    #[error("cursor {record_id} for channel {channel_id} could not be resolved: {reason}")]
    CursorResolution {
        channel_id: ChannelId,
        record_id: RecordId,
        reason: String,
    },

    /// Cursor store read or write failed
    #[error("cursor store error: {0}")]
    CursorStore(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The write dispatcher no longer accepts submissions
    #[error("write dispatcher is closed")]
    DispatcherClosed,

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("config error: {0}")]
    Config(String),

    /// Storage setup or query failed
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Progress display failed to render
    #[error("display error: {0}")]
    Display(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl BackfillError {
    /// Short machine-friendly label, used in job summaries and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            BackfillError::SourceFetch { .. } => "source_fetch",
            BackfillError::ChannelListing { .. } => "channel_listing",
            BackfillError::CursorResolution { .. } => "cursor_resolution",
            BackfillError::CursorStore(_) => "cursor_store",
            BackfillError::DispatcherClosed => "dispatcher_closed",
            BackfillError::Cancelled => "cancelled",
            BackfillError::Config(_) => "config",
            BackfillError::Storage(_) => "storage",
            BackfillError::Display(_) => "display",
        }
    }
}

/// Errors returned by a history source.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The remote asked us to slow down
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Transport-level failure
    #[error("HTTP error: {0}")]
    Http(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Unexpected response status
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// The requested channel or record does not exist
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Response body could not be decoded
    #[error("decode error: {0}")]
    Decode(String),
}

impl FetchError {
    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::RateLimited { .. } | FetchError::Http(_) => true,
            FetchError::Status { status, .. } => *status >= 500,
            FetchError::NotFound { .. } | FetchError::Decode(_) => false,
        }
    }

    /// Server-provided delay hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Errors returned by a persistence sink for a single record.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    /// The backing store failed
    #[error("storage error: {0}")]
    Storage(String),

    /// The store refused the record (constraint, validation)
    #[error("record rejected: {0}")]
    Rejected(String),

    /// The worker running the write panicked
    #[error("write worker panicked: {0}")]
    WorkerPanicked(String),
}

/// Result type alias for backfill operations.
pub type Result<T> = std::result::Result<T, BackfillError>;

/// Result type alias for history source operations.
pub type FetchResult<T> = std::result::Result<T, FetchError>;
