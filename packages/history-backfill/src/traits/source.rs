//! History source trait: paginated, ordered channel history.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::FetchResult;
use crate::types::record::{ChannelId, ChannelInfo, Direction, GuildId, Record, RecordId};

/// One page request against a history source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub channel_id: ChannelId,
    pub direction: Direction,
    /// Exclusive anchor: records strictly past it in `direction`.
    /// `None` starts at the oldest (forward) or newest (backward) record.
    pub anchor: Option<RecordId>,
    pub limit: usize,
}

impl PageRequest {
    pub fn new(channel_id: ChannelId, direction: Direction, limit: usize) -> Self {
        Self {
            channel_id,
            direction,
            anchor: None,
            limit,
        }
    }

    pub fn with_anchor(mut self, anchor: Option<RecordId>) -> Self {
        self.anchor = anchor;
        self
    }

    /// A page shorter than the limit marks the end of the history.
    pub fn is_last_page(&self, page_len: usize) -> bool {
        page_len < self.limit
    }
}

/// Paginated source of ordered records.
///
/// Implementations must return pages ordered strictly by id in the requested
/// direction and must be restartable from any previously seen anchor.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Fetch up to `request.limit` records past the anchor.
    async fn fetch_page(&self, request: &PageRequest) -> FetchResult<Vec<Record>>;

    /// Confirm a stored cursor still names an existing record and return the
    /// anchor to page from.
    ///
    /// Returns `FetchError::NotFound` when the record is gone.
    async fn resolve_anchor(&self, channel_id: ChannelId, record_id: RecordId)
        -> FetchResult<RecordId>;

    /// List the crawlable channels of a guild.
    async fn list_channels(&self, guild_id: GuildId) -> FetchResult<Vec<ChannelInfo>>;
}

#[async_trait]
impl<T: HistorySource + ?Sized> HistorySource for Arc<T> {
    async fn fetch_page(&self, request: &PageRequest) -> FetchResult<Vec<Record>> {
        (**self).fetch_page(request).await
    }

    async fn resolve_anchor(
        &self,
        channel_id: ChannelId,
        record_id: RecordId,
    ) -> FetchResult<RecordId> {
        (**self).resolve_anchor(channel_id, record_id).await
    }

    async fn list_channels(&self, guild_id: GuildId) -> FetchResult<Vec<ChannelInfo>> {
        (**self).list_channels(guild_id).await
    }
}
