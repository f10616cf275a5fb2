// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic flush of buffered view counts to durable storage.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::storage::traits::ViewCountSink;
use crate::views::ViewBuffer;
use super::{spawn_periodic, SingleFlight};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushRun {
    Skipped,
    Empty,
    Flushed(usize),
    /// Sink failed; the batch went back into the buffer
    Restored(usize),
}

pub struct ViewFlusher {
    buffer: Arc<ViewBuffer>,
    sink: Arc<dyn ViewCountSink>,
    interval: Duration,
    flight: SingleFlight,
}

impl ViewFlusher {
    pub fn new(buffer: Arc<ViewBuffer>, sink: Arc<dyn ViewCountSink>, interval: Duration) -> Self {
        Self {
            buffer,
            sink,
            interval,
            flight: SingleFlight::new(),
        }
    }

    pub async fn flush_once(&self) -> FlushRun {
        let Some(_flight) = self.flight.try_begin() else {
            crate::metrics::record_task_skipped("view_flush");
            return FlushRun::Skipped;
        };

        let purged = self.buffer.purge_expired_markers();
        if purged > 0 {
            debug!(purged, "Expired view markers purged");
        }

        let batch = self.buffer.get_and_clear_view_counts();
        if batch.is_empty() {
            return FlushRun::Empty;
        }

        match self.sink.flush(&batch).await {
            Ok(written) => {
                debug!(items = written, "View counts flushed");
                crate::metrics::record_view_flush(true, written);
                FlushRun::Flushed(written)
            }
            Err(e) => {
                let items = batch.len();
                warn!(items, error = %e, "View count flush failed, counts kept for next run");
                crate::metrics::record_view_flush(false, 0);
                self.buffer.restore_view_counts(batch);
                FlushRun::Restored(items)
            }
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.interval;
        spawn_periodic("view_flush", interval, move || {
            let flusher = Arc::clone(&self);
            async move {
                flusher.flush_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::ItemId;
    use crate::storage::memory::InMemoryScoreStore;
    use crate::storage::traits::SinkError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        totals: Mutex<HashMap<ItemId, u64>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl ViewCountSink for RecordingSink {
        async fn flush(&self, counts: &HashMap<ItemId, u64>) -> Result<usize, SinkError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SinkError::Backend("deadlock detected".into()));
            }
            let mut totals = self.totals.lock();
            for (item, count) in counts {
                *totals.entry(*item).or_insert(0) += count;
            }
            Ok(counts.len())
        }
    }

    fn flusher() -> (Arc<ViewBuffer>, Arc<RecordingSink>, ViewFlusher) {
        let buffer = Arc::new(ViewBuffer::new(
            Arc::new(InMemoryScoreStore::new()),
            2.0,
            Duration::from_secs(600),
        ));
        let sink = Arc::new(RecordingSink::default());
        let flusher = ViewFlusher::new(buffer.clone(), sink.clone(), Duration::from_secs(60));
        (buffer, sink, flusher)
    }

    #[tokio::test]
    async fn test_flush_moves_counts_to_sink() {
        let (buffer, sink, flusher) = flusher();
        buffer.mark_viewed_and_increment(1, "a").await;
        buffer.mark_viewed_and_increment(1, "b").await;
        buffer.mark_viewed_and_increment(2, "a").await;

        assert_eq!(flusher.flush_once().await, FlushRun::Flushed(2));
        assert_eq!(sink.totals.lock().get(&1), Some(&2));
        assert_eq!(buffer.pending_items(), 0);
        assert_eq!(flusher.flush_once().await, FlushRun::Empty);
    }

    #[tokio::test]
    async fn test_failed_flush_restores_counts() {
        let (buffer, sink, flusher) = flusher();
        buffer.mark_viewed_and_increment(1, "a").await;
        sink.fail.store(true, Ordering::SeqCst);

        assert_eq!(flusher.flush_once().await, FlushRun::Restored(1));
        assert_eq!(buffer.pending_items(), 1);

        sink.fail.store(false, Ordering::SeqCst);
        buffer.mark_viewed_and_increment(1, "b").await;
        assert_eq!(flusher.flush_once().await, FlushRun::Flushed(1));
        assert_eq!(sink.totals.lock().get(&1), Some(&2));
    }
}
