//! Property tests for resumability.
//!
//! For arbitrary channel sizes, page sizes and interruption points:
//! - every record at or before a persisted cursor has been stored
//! - an interrupted crawl followed by a fresh one stores the whole channel
//! - a crawl resumed from a seeded cursor stores exactly the records beyond it

use std::sync::Arc;
use std::time::Duration;

use backfill::testing::MockHistorySource;
use backfill::{
    BackfillConfig, ChannelCrawler, ChannelId, CursorKey, CursorStore, Direction,
    MemoryCursorStore, MemoryRecordStore, ProgressReporter, RecordId, RetryPolicy,
    WriteDispatcher,
};
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

const CHANNEL: ChannelId = ChannelId(77);

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn config(page_size: usize) -> BackfillConfig {
    BackfillConfig::new()
        .with_page_size(page_size)
        .with_max_workers(3)
        .with_max_pending_writes(4)
        .with_progress_threshold(Duration::ZERO)
        .with_fetch_retry(RetryPolicy::none())
        .with_write_retry(RetryPolicy::none())
}

/// Run one crawl over `source` against shared stores.
async fn crawl(
    source: MockHistorySource,
    cursors: Arc<MemoryCursorStore>,
    records: Arc<MemoryRecordStore>,
    direction: Direction,
    page_size: usize,
    cancel: &CancellationToken,
) {
    let crawler = ChannelCrawler::new(
        Arc::new(source),
        cursors,
        WriteDispatcher::new(records, 3),
        ProgressReporter::new(),
        config(page_size),
    );
    crawler.crawl(CHANNEL, direction, cancel).await.unwrap();
}

/// Records the cursor claims are done must all be stored.
fn assert_cursor_covered(
    records: &MemoryRecordStore,
    direction: Direction,
    cursor: Option<RecordId>,
    size: u64,
) {
    let Some(cursor) = cursor else { return };
    let covered: Vec<u64> = match direction {
        Direction::Forward => (1..=cursor.get()).collect(),
        Direction::Backward => (cursor.get()..=size).collect(),
    };
    for id in covered {
        assert!(records.contains(RecordId(id)), "record {id} is behind cursor {cursor}");
    }
}

fn direction() -> impl Strategy<Value = Direction> {
    prop_oneof![Just(Direction::Forward), Just(Direction::Backward)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn interrupted_then_resumed_crawl_stores_everything(
        size in 0u64..60,
        page_size in 1usize..8,
        interrupt_after in 1usize..6,
        direction in direction(),
    ) {
        runtime().block_on(async {
            let key = CursorKey::new(CHANNEL, direction);
            let cursors = Arc::new(MemoryCursorStore::new());
            let records = Arc::new(MemoryRecordStore::new());

            let cancel = CancellationToken::new();
            let interrupted = MockHistorySource::new()
                .with_channel(CHANNEL, 1..=size)
                .cancel_after_pages(interrupt_after, cancel.clone());
            crawl(interrupted, cursors.clone(), records.clone(), direction, page_size, &cancel)
                .await;
            assert_cursor_covered(&records, direction, cursors.get(&key).await.unwrap(), size);

            let fresh = MockHistorySource::new().with_channel(CHANNEL, 1..=size);
            let cancel = CancellationToken::new();
            crawl(fresh, cursors.clone(), records.clone(), direction, page_size, &cancel).await;

            let expected: Vec<RecordId> = (1..=size).map(RecordId).collect();
            assert_eq!(records.ids_for_channel(CHANNEL), expected);
            let end = match direction {
                Direction::Forward => size,
                Direction::Backward => 1,
            };
            let final_cursor = cursors.get(&key).await.unwrap();
            if size == 0 {
                assert_eq!(final_cursor, None);
            } else {
                assert_eq!(final_cursor, Some(RecordId(end)));
            }
        });
    }

    #[test]
    fn seeded_cursor_resumes_strictly_beyond_it(
        size in 1u64..60,
        page_size in 1usize..8,
        seed in 1u64..60,
        direction in direction(),
    ) {
        let seed = seed.min(size);
        runtime().block_on(async {
            let key = CursorKey::new(CHANNEL, direction);
            let cursors = Arc::new(MemoryCursorStore::new().with_cursor(key, RecordId(seed)));
            let records = Arc::new(MemoryRecordStore::new());

            let source = MockHistorySource::new().with_channel(CHANNEL, 1..=size);
            let cancel = CancellationToken::new();
            crawl(source, cursors.clone(), records.clone(), direction, page_size, &cancel).await;

            let expected: Vec<RecordId> = match direction {
                Direction::Forward => (seed + 1..=size).map(RecordId).collect(),
                Direction::Backward => (1..seed).map(RecordId).collect(),
            };
            assert_eq!(records.ids_for_channel(CHANNEL), expected);

            let writes = cursors.writes_for(&key);
            let advancing = match direction {
                Direction::Forward => writes.windows(2).all(|w| w[0] < w[1]),
                Direction::Backward => writes.windows(2).all(|w| w[0] > w[1]),
            };
            assert!(advancing, "{writes:?}");
            if let Some(first) = writes.first() {
                assert!(direction.is_beyond(*first, RecordId(seed)));
            }
        });
    }
}
