//! Testing utilities including mock implementations.
//!
//! These are useful for testing applications that drive the backfill
//! engine without a real chat API or database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{BackfillError, FetchError, FetchResult, PersistenceError, Result};
use crate::traits::display::DisplaySink;
use crate::traits::sink::{DeadLetterSink, PersistenceSink};
use crate::traits::source::{HistorySource, PageRequest};
use crate::types::job::JobSummary;
use crate::types::progress::ProgressSnapshot;
use crate::types::record::{ChannelId, ChannelInfo, Direction, GuildId, Record, RecordId};

/// Deterministic record for `id` in `channel_id`.
///
/// Timestamps grow with the id, one second apart.
pub fn mock_record(channel_id: ChannelId, id: u64) -> Record {
    let timestamp =
        DateTime::<Utc>::from_timestamp(1_600_000_000 + id as i64, 0).unwrap_or_default();
    Record::new(id, channel_id, format!("message {id}"))
        .with_author(id % 7, format!("user{}", id % 7))
        .with_timestamp(timestamp)
}

/// Record of a call made to the mock source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockSourceCall {
    FetchPage {
        channel_id: ChannelId,
        direction: Direction,
        anchor: Option<RecordId>,
        limit: usize,
    },
    ResolveAnchor {
        channel_id: ChannelId,
        record_id: RecordId,
    },
    ListChannels {
        guild_id: GuildId,
    },
}

/// A mock history source over in-memory channels.
///
/// Serves ids in strict order, supports failure injection per page and can
/// trip a cancellation token after a number of pages.
#[derive(Default)]
pub struct MockHistorySource {
    channels: HashMap<ChannelId, BTreeSet<u64>>,
    guilds: HashMap<GuildId, Vec<ChannelId>>,
    missing: HashSet<(ChannelId, RecordId)>,
    failing_pages: HashMap<ChannelId, usize>,
    failing_anchors: HashSet<ChannelId>,
    raw_pages: HashMap<ChannelId, Vec<u64>>,
    page_delay: Duration,
    cancel_after: Option<(usize, CancellationToken)>,

    /// Sizes of successfully served pages per channel
    served: RwLock<HashMap<ChannelId, Vec<usize>>>,
    pages_served: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,

    /// Call tracking
    calls: RwLock<Vec<MockSourceCall>>,
}

impl MockHistorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel holding `ids`.
    pub fn with_channel(
        mut self,
        channel_id: ChannelId,
        ids: impl IntoIterator<Item = u64>,
    ) -> Self {
        self.channels.entry(channel_id).or_default().extend(ids);
        self
    }

    pub fn with_guild(
        mut self,
        guild_id: GuildId,
        channels: impl IntoIterator<Item = ChannelId>,
    ) -> Self {
        self.guilds.entry(guild_id).or_default().extend(channels);
        self
    }

    /// Delete a record: it is no longer served or resolvable.
    pub fn without_record(mut self, channel_id: ChannelId, record_id: impl Into<RecordId>) -> Self {
        let record_id = record_id.into();
        if let Some(ids) = self.channels.get_mut(&channel_id) {
            ids.remove(&record_id.get());
        }
        self.missing.insert((channel_id, record_id));
        self
    }

    /// Fail every attempt at the channel's `page`-th page (1-based) with a
    /// retryable 503.
    pub fn failing_page(mut self, channel_id: ChannelId, page: usize) -> Self {
        self.failing_pages.insert(channel_id, page);
        self
    }

    /// Fail every anchor resolution in the channel with a retryable 503.
    pub fn failing_anchor(mut self, channel_id: ChannelId) -> Self {
        self.failing_anchors.insert(channel_id);
        self
    }

    /// Serve `ids` verbatim as the channel's first page.
    pub fn with_raw_page(mut self, channel_id: ChannelId, ids: Vec<u64>) -> Self {
        self.raw_pages.insert(channel_id, ids);
        self
    }

    /// Sleep before answering each page request.
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    /// Cancel `token` once `pages` pages were served, across all channels.
    pub fn cancel_after_pages(mut self, pages: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((pages, token));
        self
    }

    /// Sizes of the pages served for a channel, in order.
    pub fn page_sizes(&self, channel_id: ChannelId) -> Vec<usize> {
        self.served
            .read()
            .unwrap()
            .get(&channel_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Page requests made for a channel, including failed ones.
    pub fn fetch_count(&self, channel_id: ChannelId) -> usize {
        self.calls
            .read()
            .unwrap()
            .iter()
            .filter(|c| {
                matches!(c, MockSourceCall::FetchPage { channel_id: id, .. } if *id == channel_id)
            })
            .count()
    }

    /// Most page requests ever in flight at once.
    pub fn peak_active_channels(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    /// Get all calls made to this mock.
    pub fn calls(&self) -> Vec<MockSourceCall> {
        self.calls.read().unwrap().clone()
    }

    fn slice(&self, request: &PageRequest, ids: &BTreeSet<u64>) -> Vec<u64> {
        match (request.direction, request.anchor) {
            (Direction::Forward, None) => ids.iter().take(request.limit).copied().collect(),
            (Direction::Forward, Some(anchor)) => ids
                .range((Bound::Excluded(anchor.get()), Bound::Unbounded))
                .take(request.limit)
                .copied()
                .collect(),
            (Direction::Backward, None) => ids.iter().rev().take(request.limit).copied().collect(),
            (Direction::Backward, Some(anchor)) => ids
                .range(..anchor.get())
                .rev()
                .take(request.limit)
                .copied()
                .collect(),
        }
    }

    fn serve(&self, request: &PageRequest) -> FetchResult<Vec<Record>> {
        let channel_id = request.channel_id;
        let served_before = self.page_sizes(channel_id).len();

        if self.failing_pages.get(&channel_id) == Some(&(served_before + 1)) {
            return Err(FetchError::Status {
                status: 503,
                body: "mock outage".into(),
            });
        }

        let ids = match self.raw_pages.get(&channel_id) {
            Some(raw) if served_before == 0 => raw.clone(),
            _ => {
                let ids = self.channels.get(&channel_id).ok_or_else(|| FetchError::NotFound {
                    what: format!("channel {channel_id}"),
                })?;
                self.slice(request, ids)
            }
        };

        self.served
            .write()
            .unwrap()
            .entry(channel_id)
            .or_default()
            .push(ids.len());
        let total = self.pages_served.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = &self.cancel_after {
            if total >= *after {
                token.cancel();
            }
        }

        Ok(ids.into_iter().map(|id| mock_record(channel_id, id)).collect())
    }
}

#[async_trait]
impl HistorySource for MockHistorySource {
    async fn fetch_page(&self, request: &PageRequest) -> FetchResult<Vec<Record>> {
        self.calls.write().unwrap().push(MockSourceCall::FetchPage {
            channel_id: request.channel_id,
            direction: request.direction,
            anchor: request.anchor,
            limit: request.limit,
        });

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);
        if !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        self.serve(request)
    }

    async fn resolve_anchor(
        &self,
        channel_id: ChannelId,
        record_id: RecordId,
    ) -> FetchResult<RecordId> {
        self.calls.write().unwrap().push(MockSourceCall::ResolveAnchor {
            channel_id,
            record_id,
        });

        if self.failing_anchors.contains(&channel_id) {
            return Err(FetchError::Status {
                status: 503,
                body: "mock outage".into(),
            });
        }

        let exists = self
            .channels
            .get(&channel_id)
            .is_some_and(|ids| ids.contains(&record_id.get()));
        if !exists || self.missing.contains(&(channel_id, record_id)) {
            return Err(FetchError::NotFound {
                what: format!("message {record_id} in channel {channel_id}"),
            });
        }
        Ok(record_id)
    }

    async fn list_channels(&self, guild_id: GuildId) -> FetchResult<Vec<ChannelInfo>> {
        self.calls
            .write()
            .unwrap()
            .push(MockSourceCall::ListChannels { guild_id });

        self.guilds
            .get(&guild_id)
            .map(|channels| {
                channels
                    .iter()
                    .map(|id| ChannelInfo::new(*id, format!("channel-{id}")))
                    .collect()
            })
            .ok_or_else(|| FetchError::NotFound {
                what: format!("guild {guild_id}"),
            })
    }
}

/// A persistence sink that records what it saved.
///
/// Supports per-record failure injection and a blocking delay, and tracks
/// the peak number of concurrent `save` calls.
#[derive(Default)]
pub struct RecordingSink {
    delay: Duration,
    failing: HashSet<RecordId>,
    failing_times: HashMap<RecordId, u32>,
    panicking: HashSet<RecordId>,

    saved: Mutex<Vec<RecordId>>,
    attempts: Mutex<HashMap<RecordId, u32>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block each save for `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every save of `record_id`.
    pub fn failing(mut self, record_id: impl Into<RecordId>) -> Self {
        self.failing.insert(record_id.into());
        self
    }

    /// Fail the first `times` saves of `record_id`.
    pub fn failing_times(mut self, record_id: impl Into<RecordId>, times: u32) -> Self {
        self.failing_times.insert(record_id.into(), times);
        self
    }

    /// Panic when saving `record_id`.
    pub fn panicking(mut self, record_id: impl Into<RecordId>) -> Self {
        self.panicking.insert(record_id.into());
        self
    }

    /// Successfully saved ids, in completion order.
    pub fn saved(&self) -> Vec<RecordId> {
        self.saved.lock().unwrap().clone()
    }

    pub fn saved_count(&self) -> usize {
        self.saved.lock().unwrap().len()
    }

    /// Save attempts made for one record.
    pub fn attempts(&self, record_id: impl Into<RecordId>) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(&record_id.into())
            .copied()
            .unwrap_or(0)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl PersistenceSink for RecordingSink {
    fn save(&self, record: &Record) -> std::result::Result<(), PersistenceError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(record.id).or_insert(0);
            *count += 1;
            *count
        };

        if self.panicking.contains(&record.id) {
            panic!("mock sink panicked on record {}", record.id);
        }
        if self.failing.contains(&record.id) {
            return Err(PersistenceError::Storage(format!(
                "mock failure for record {}",
                record.id
            )));
        }
        if let Some(times) = self.failing_times.get(&record.id) {
            if attempt <= *times {
                return Err(PersistenceError::Storage(format!(
                    "mock transient failure {attempt} for record {}",
                    record.id
                )));
            }
        }

        self.saved.lock().unwrap().push(record.id);
        Ok(())
    }
}

/// A display sink that remembers every render.
#[derive(Default)]
pub struct RecordingDisplay {
    renders: Mutex<Vec<ProgressSnapshot>>,
    completions: AtomicUsize,
    delay: Duration,
    fail: bool,
}

impl RecordingDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `delay` per render, like a rate-limited remote.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Record renders but report each as failed.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn snapshots(&self) -> Vec<ProgressSnapshot> {
        self.renders.lock().unwrap().clone()
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.renders
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.description.clone())
            .collect()
    }

    pub fn render_count(&self) -> usize {
        self.renders.lock().unwrap().len()
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DisplaySink for RecordingDisplay {
    async fn render(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        self.renders.lock().unwrap().push(snapshot.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(BackfillError::Display("mock display failure".into()));
        }
        Ok(())
    }

    async fn render_completion(&self, _summary: &JobSummary) -> Result<()> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory dead-letter sink.
#[derive(Default)]
pub struct MemoryDeadLetter {
    entries: Mutex<Vec<(Record, String, u32)>>,
    reject: bool,
}

impl MemoryDeadLetter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every record.
    pub fn rejecting(mut self) -> Self {
        self.reject = true;
        self
    }

    pub fn record_ids(&self) -> Vec<RecordId> {
        self.entries.lock().unwrap().iter().map(|(r, _, _)| r.id).collect()
    }

    /// `(record, error, attempts)` per dead-lettered record.
    pub fn entries(&self) -> Vec<(Record, String, u32)> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetter {
    async fn dead_letter(
        &self,
        record: &Record,
        error: &PersistenceError,
        attempts: u32,
    ) -> std::result::Result<(), PersistenceError> {
        if self.reject {
            return Err(PersistenceError::Rejected("mock dead-letter refusal".into()));
        }
        self.entries
            .lock()
            .unwrap()
            .push((record.clone(), error.to_string(), attempts));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_source_pages_both_directions() {
        let source = MockHistorySource::new().with_channel(ChannelId(1), 1..=10);

        let request =
            PageRequest::new(ChannelId(1), Direction::Forward, 3).with_anchor(Some(RecordId(4)));
        let forward = source.fetch_page(&request).await.unwrap();
        let ids: Vec<_> = forward.iter().map(|r| r.id.get()).collect();
        assert_eq!(ids, vec![5, 6, 7]);

        let request =
            PageRequest::new(ChannelId(1), Direction::Backward, 3).with_anchor(Some(RecordId(4)));
        let backward = source.fetch_page(&request).await.unwrap();
        let ids: Vec<_> = backward.iter().map(|r| r.id.get()).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_mock_source_tracks_calls() {
        let source = MockHistorySource::new()
            .with_guild(GuildId(9), [ChannelId(1)])
            .with_channel(ChannelId(1), 1..=2);

        source.list_channels(GuildId(9)).await.unwrap();
        source.resolve_anchor(ChannelId(1), RecordId(2)).await.unwrap();

        assert_eq!(
            source.calls(),
            vec![
                MockSourceCall::ListChannels { guild_id: GuildId(9) },
                MockSourceCall::ResolveAnchor {
                    channel_id: ChannelId(1),
                    record_id: RecordId(2)
                },
            ]
        );
    }

    #[test]
    fn test_recording_sink_failure_injection() {
        let sink = RecordingSink::new().failing_times(3u64, 1);
        let record = mock_record(ChannelId(1), 3);

        assert!(sink.save(&record).is_err());
        assert!(sink.save(&record).is_ok());
        assert_eq!(sink.attempts(3u64), 2);
        assert_eq!(sink.saved(), vec![RecordId(3)]);
    }
}
