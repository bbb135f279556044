//! Bounded write dispatcher.
//!
//! One dispatcher is shared by every crawler of a process. It caps the
//! number of persistence calls in flight with a semaphore; when every
//! worker is busy, `submit` waits, which slows the crawlers down instead
//! of buffering an unbounded backlog.
//!
//! Each submission returns a [`WriteHandle`] resolving to the write's
//! outcome, so callers can tell which records actually reached storage.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{BackfillError, PersistenceError, Result};
use crate::traits::sink::{DeadLetterSink, PersistenceSink};
use crate::types::config::{BackfillConfig, RetryPolicy};
use crate::types::record::{Record, RecordId};

/// A record that reached storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    pub record_id: RecordId,
    pub attempts: u32,
}

/// A record whose write failed on every attempt.
#[derive(Debug, Clone, Error)]
#[error("write of record {record_id} failed after {attempts} attempt(s): {error}")]
pub struct WriteFailure {
    pub record_id: RecordId,
    pub attempts: u32,
    pub error: PersistenceError,
    /// Whether the dead-letter sink accepted the record
    pub dead_lettered: bool,
}

pub type WriteResult = std::result::Result<Committed, WriteFailure>;

/// Dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub submitted: usize,
    pub committed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub retries: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicUsize,
    committed: AtomicUsize,
    failed: AtomicUsize,
    dead_lettered: AtomicUsize,
    retries: AtomicUsize,
}

struct Inner {
    sink: Arc<dyn PersistenceSink>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    permits: Arc<Semaphore>,
    max_workers: usize,
    retry: RetryPolicy,
    counters: Counters,
}

/// Shared, bounded pool for blocking persistence calls.
///
/// Cloning is cheap and every clone draws from the same worker budget.
#[derive(Clone)]
pub struct WriteDispatcher {
    inner: Arc<Inner>,
}

impl WriteDispatcher {
    /// Dispatcher with `max_workers` workers and no retries.
    pub fn new(sink: Arc<dyn PersistenceSink>, max_workers: usize) -> Self {
        WriteDispatcherBuilder::new(sink).max_workers(max_workers).build()
    }

    /// Dispatcher sized and retried per `config`.
    pub fn from_config(sink: Arc<dyn PersistenceSink>, config: &BackfillConfig) -> Self {
        WriteDispatcherBuilder::new(sink)
            .max_workers(config.max_workers)
            .retry(config.write_retry)
            .build()
    }

    pub fn builder(sink: Arc<dyn PersistenceSink>) -> WriteDispatcherBuilder {
        WriteDispatcherBuilder::new(sink)
    }

    /// Hand a record to the pool.
    ///
    /// Waits while all workers are busy. The returned handle resolves once
    /// the write committed or failed for good; dropping it does not cancel
    /// the write.
    pub async fn submit(&self, record: Record) -> Result<WriteHandle> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BackfillError::DispatcherClosed)?;

        self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let record_id = record.id;
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let outcome = inner.write(record).await;
            drop(permit);
            outcome
        });

        Ok(WriteHandle { record_id, handle })
    }

    /// Stop accepting submissions. Writes already submitted still finish.
    pub fn close(&self) {
        self.inner.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// Workers currently running a write.
    pub fn in_flight(&self) -> usize {
        self.inner.max_workers - self.inner.permits.available_permits()
    }

    pub fn stats(&self) -> DispatcherStats {
        let c = &self.inner.counters;
        DispatcherStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            committed: c.committed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    async fn write(&self, record: Record) -> WriteResult {
        let record_id = record.id;
        let record = Arc::new(record);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.save_blocking(record.clone()).await {
                Ok(()) => {
                    self.counters.committed.fetch_add(1, Ordering::Relaxed);
                    debug!(record_id = %record_id, attempts = attempt, "record committed");
                    return Ok(Committed {
                        record_id,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };

            if self.retry.allows_retry(attempt) {
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                let delay = self.retry.backoff(attempt);
                warn!(
                    record_id = %record_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "record write failed, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            let dead_lettered = self.route_dead_letter(&record, &error, attempt).await;
            return Err(WriteFailure {
                record_id,
                attempts: attempt,
                error,
                dead_lettered,
            });
        }
    }

    async fn save_blocking(
        &self,
        record: Arc<Record>,
    ) -> std::result::Result<(), PersistenceError> {
        let sink = self.sink.clone();
        tokio::task::spawn_blocking(move || sink.save(&record))
            .await
            .unwrap_or_else(|join_error| {
                Err(PersistenceError::WorkerPanicked(join_error.to_string()))
            })
    }

    async fn route_dead_letter(
        &self,
        record: &Record,
        error: &PersistenceError,
        attempts: u32,
    ) -> bool {
        let Some(dead_letter) = &self.dead_letter else {
            error!(
                record_id = %record.id,
                channel_id = %record.channel_id,
                attempts,
                error = %error,
                "record write failed permanently"
            );
            return false;
        };

        match dead_letter.dead_letter(record, error, attempts).await {
            Ok(()) => {
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                warn!(
                    record_id = %record.id,
                    channel_id = %record.channel_id,
                    attempts,
                    error = %error,
                    "record dead-lettered"
                );
                true
            }
            Err(dl_error) => {
                error!(
                    record_id = %record.id,
                    channel_id = %record.channel_id,
                    error = %error,
                    dead_letter_error = %dl_error,
                    "dead-letter sink rejected record"
                );
                false
            }
        }
    }
}

/// Pending outcome of one submitted write.
#[derive(Debug)]
pub struct WriteHandle {
    record_id: RecordId,
    handle: JoinHandle<WriteResult>,
}

impl WriteHandle {
    pub fn record_id(&self) -> RecordId {
        self.record_id
    }

    /// Whether the write has settled, so awaiting will not wait.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Future for WriteHandle {
    type Output = WriteResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let record_id = self.record_id;
        Pin::new(&mut self.handle).poll(cx).map(|joined| {
            joined.unwrap_or_else(|join_error| {
                Err(WriteFailure {
                    record_id,
                    attempts: 0,
                    error: PersistenceError::WorkerPanicked(join_error.to_string()),
                    dead_lettered: false,
                })
            })
        })
    }
}

/// Builder for [`WriteDispatcher`].
pub struct WriteDispatcherBuilder {
    sink: Arc<dyn PersistenceSink>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    max_workers: usize,
    retry: RetryPolicy,
}

impl WriteDispatcherBuilder {
    pub fn new(sink: Arc<dyn PersistenceSink>) -> Self {
        Self {
            sink,
            dead_letter: None,
            max_workers: BackfillConfig::default().max_workers,
            retry: RetryPolicy::none(),
        }
    }

    /// Set the worker count. Clamped to at least one.
    pub fn max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Route permanently failed records here.
    pub fn dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    pub fn build(self) -> WriteDispatcher {
        WriteDispatcher {
            inner: Arc::new(Inner {
                sink: self.sink,
                dead_letter: self.dead_letter,
                permits: Arc::new(Semaphore::new(self.max_workers)),
                max_workers: self.max_workers,
                retry: self.retry,
                counters: Counters::default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryDeadLetter, RecordingSink};
    use std::time::Duration;

    fn record(id: u64) -> Record {
        Record::new(id, 1u64, format!("message {id}"))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_never_exceeds_workers() {
        let sink = Arc::new(RecordingSink::new().with_delay(Duration::from_millis(10)));
        let dispatcher = WriteDispatcher::new(sink.clone(), 3);

        let mut handles = Vec::new();
        for id in 1..=20 {
            handles.push(dispatcher.submit(record(id)).await.unwrap());
        }
        for handle in handles {
            assert!(handle.await.is_ok());
        }

        assert_eq!(sink.saved_count(), 20);
        assert!(sink.peak_concurrency() <= 3);
        assert_eq!(dispatcher.stats().committed, 20);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submit_blocks_when_saturated() {
        let sink = Arc::new(RecordingSink::new().with_delay(Duration::from_millis(300)));
        let dispatcher = WriteDispatcher::new(sink.clone(), 1);

        let first = dispatcher.submit(record(1)).await.unwrap();
        let mut blocked = tokio_test::task::spawn(dispatcher.submit(record(2)));
        tokio_test::assert_pending!(blocked.poll(), "second submit should wait for a worker");

        assert!(first.await.is_ok());
        assert!(blocked.is_woken());
        let second = tokio_test::assert_ready_ok!(blocked.poll());
        assert!(second.await.is_ok());
        assert_eq!(sink.saved(), vec![RecordId(1), RecordId(2)]);
    }

    #[tokio::test]
    async fn test_failure_is_reported_to_caller() {
        let sink = Arc::new(RecordingSink::new().failing(5u64));
        let dispatcher = WriteDispatcher::new(sink.clone(), 2);

        let ok = dispatcher.submit(record(4)).await.unwrap();
        let bad = dispatcher.submit(record(5)).await.unwrap();

        assert_eq!(ok.await.unwrap().record_id, RecordId(4));
        let failure = bad.await.unwrap_err();
        assert_eq!(failure.record_id, RecordId(5));
        assert_eq!(failure.attempts, 1);
        assert!(!failure.dead_lettered);
        assert_eq!(dispatcher.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let sink = Arc::new(RecordingSink::new().failing_times(3u64, 2));
        let dispatcher = WriteDispatcher::builder(sink.clone())
            .max_workers(1)
            .retry(RetryPolicy::new(3, Duration::from_millis(10)))
            .build();

        let committed = dispatcher.submit(record(3)).await.unwrap().await.unwrap();

        assert_eq!(committed.attempts, 3);
        assert_eq!(sink.attempts(3u64), 3);
        assert_eq!(dispatcher.stats().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_go_to_dead_letter() {
        let sink = Arc::new(RecordingSink::new().failing(8u64));
        let dead = Arc::new(MemoryDeadLetter::new());
        let dispatcher = WriteDispatcher::builder(sink.clone())
            .retry(RetryPolicy::new(2, Duration::from_millis(10)))
            .dead_letter(dead.clone())
            .build();

        let failure = dispatcher.submit(record(8)).await.unwrap().await.unwrap_err();

        assert!(failure.dead_lettered);
        assert_eq!(failure.attempts, 2);
        assert_eq!(dead.record_ids(), vec![RecordId(8)]);
        assert_eq!(dispatcher.stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_panicking_sink_is_a_failure() {
        let sink = Arc::new(RecordingSink::new().panicking(2u64));
        let dispatcher = WriteDispatcher::new(sink, 1);

        let failure = dispatcher.submit(record(2)).await.unwrap().await.unwrap_err();
        assert!(matches!(failure.error, PersistenceError::WorkerPanicked(_)));

        // The worker slot is released after the panic.
        let ok = dispatcher.submit(record(3)).await.unwrap();
        assert!(ok.await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_dispatcher_rejects_submit() {
        let dispatcher = WriteDispatcher::new(Arc::new(RecordingSink::new()), 1);
        dispatcher.close();
        assert!(matches!(
            dispatcher.submit(record(1)).await,
            Err(BackfillError::DispatcherClosed)
        ));
    }
}
