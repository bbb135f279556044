//! Progress reporting: a single latest-snapshot slot and a throttled
//! render loop.
//!
//! Crawlers publish into the slot without ever waiting on the display.
//! The render loop wakes once per interval and renders the slot only when
//! it changed since the last render, so a slow or rate-limited display
//! costs at most one call per tick no matter how fast crawlers publish.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::traits::display::DisplaySink;
use crate::types::progress::ProgressSnapshot;

/// Shared last-writer-wins progress slot.
#[derive(Clone)]
pub struct ProgressReporter {
    slot: Arc<watch::Sender<Option<ProgressSnapshot>>>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Replace the slot contents. Never blocks.
    pub fn update_snapshot(&self, snapshot: ProgressSnapshot) {
        self.slot.send_replace(Some(snapshot));
    }

    pub fn latest(&self) -> Option<ProgressSnapshot> {
        self.slot.borrow().clone()
    }

    /// Render the slot at most once per `interval` until `cancel` fires.
    ///
    /// A snapshot present when the loop starts is rendered on the first
    /// tick. Render errors are logged and the loop keeps going. Returns the
    /// number of render calls made.
    pub async fn render_loop<D>(
        &self,
        display: &D,
        interval: Duration,
        cancel: CancellationToken,
    ) -> usize
    where
        D: DisplaySink + ?Sized,
    {
        let mut rx = self.slot.subscribe();
        rx.mark_changed();

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut renders = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !rx.has_changed().unwrap_or(false) {
                continue;
            }
            let Some(snapshot) = rx.borrow_and_update().clone() else {
                continue;
            };

            renders += 1;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = display.render(&snapshot) => {
                    if let Err(e) = result {
                        warn!(error = %e, "progress render failed");
                    }
                }
            }
        }

        debug!(renders, "render loop stopped");
        renders
    }

    /// Run [`render_loop`](Self::render_loop) on its own task.
    pub fn spawn_render_loop<D>(
        &self,
        display: Arc<D>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<usize>
    where
        D: DisplaySink + ?Sized + 'static,
    {
        let reporter = self.clone();
        tokio::spawn(async move { reporter.render_loop(display.as_ref(), interval, cancel).await })
    }
}
