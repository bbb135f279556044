//! Rate-limited history source wrapper.
//!
//! Wraps any HistorySource with a client-side quota using the governor
//! crate, so concurrent crawlers sharing one API token stay under the
//! remote limit instead of collecting 429s. A page larger than one
//! upstream request is charged one permit per request it costs.

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::error::FetchResult;
use crate::traits::source::{HistorySource, PageRequest};
use crate::types::record::{ChannelId, ChannelInfo, GuildId, Record, RecordId};

/// Records one upstream request returns at most.
pub const DEFAULT_RECORDS_PER_REQUEST: usize = 100;

type DefaultRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// A history source that waits for a permit before every upstream request.
pub struct RateLimitedSource<S: HistorySource> {
    inner: S,
    limiter: Arc<DefaultRateLimiter>,
    records_per_request: usize,
}

impl<S: HistorySource> RateLimitedSource<S> {
    /// Limit `source` to `requests_per_second`. Zero is treated as one.
    pub fn new(source: S, requests_per_second: u32) -> Self {
        Self::with_quota(source, Quota::per_second(non_zero(requests_per_second)))
    }

    /// Sustained rate with a burst allowance.
    pub fn with_burst(source: S, requests_per_second: u32, burst: u32) -> Self {
        let quota = Quota::per_second(non_zero(requests_per_second)).allow_burst(non_zero(burst));
        Self::with_quota(source, quota)
    }

    pub fn with_quota(source: S, quota: Quota) -> Self {
        Self {
            inner: source,
            limiter: Arc::new(RateLimiter::direct(quota)),
            records_per_request: DEFAULT_RECORDS_PER_REQUEST,
        }
    }

    /// Page size of a single upstream request. Zero is treated as one.
    pub fn with_records_per_request(mut self, records: usize) -> Self {
        self.records_per_request = records.max(1);
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn wait_for_permit(&self) {
        self.limiter.until_ready().await;
    }

    /// Upstream requests needed to serve a page of `limit` records.
    fn requests_for(&self, limit: usize) -> u32 {
        let requests = limit.div_ceil(self.records_per_request).max(1);
        u32::try_from(requests).unwrap_or(u32::MAX)
    }

    async fn wait_for_permits(&self, requests: u32) {
        if requests <= 1 {
            return self.wait_for_permit().await;
        }
        // More permits than the burst can never be granted at once.
        if self.limiter.until_n_ready(non_zero(requests)).await.is_err() {
            for _ in 0..requests {
                self.wait_for_permit().await;
            }
        }
    }
}

fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

#[async_trait]
impl<S: HistorySource> HistorySource for RateLimitedSource<S> {
    async fn fetch_page(&self, request: &PageRequest) -> FetchResult<Vec<Record>> {
        self.wait_for_permits(self.requests_for(request.limit)).await;
        self.inner.fetch_page(request).await
    }

    async fn resolve_anchor(
        &self,
        channel_id: ChannelId,
        record_id: RecordId,
    ) -> FetchResult<RecordId> {
        self.wait_for_permit().await;
        self.inner.resolve_anchor(channel_id, record_id).await
    }

    async fn list_channels(&self, guild_id: GuildId) -> FetchResult<Vec<ChannelInfo>> {
        self.wait_for_permit().await;
        self.inner.list_channels(guild_id).await
    }
}
