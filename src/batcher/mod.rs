//! Backpressure-aware batching from the ingestion queue into the sink.
//!
//! Records enter through [`BatcherHandle::enqueue`], which tries a non-blocking
//! send and otherwise waits at most the configured enqueue timeout before
//! giving up with [`IngestError::Backpressure`]. A single accumulation task
//! owns the receiving side. It flushes when the batch reaches `batch_size` or
//! the flush timer fires, whichever comes first. Each flush hands the batch to
//! a spawned writer holding one of `max_concurrent_flushes` permits, so at most
//! that many batches are being written at once.
//!
//! Writes are at-most-once: a point the sink rejects is logged and skipped.
//! Batches written concurrently may land out of order.
//!
//! Duplicate suppression remembers each vehicle's last timestamp for
//! `dedup_window`; entries for vehicles quiet longer than that are evicted on
//! the flush timer.
//!
//! Shutdown closes the queue, drains what is already buffered, performs one
//! final flush and waits for every writer to finish.

mod payload;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{BatcherConfig, FanoutMode};
use crate::directory::VehicleDirectory;
use crate::hub::{BroadcastHub, Payload};
use crate::sink::{Point, TimeSeriesSink};
use crate::types::VehicleStateRecord;
use crate::{IngestError, Result};

pub use payload::{CompactPosition, LivePayload, batch_payload, live_payload};

/// Upper bound on `max_concurrent_flushes`.
pub const MAX_CONCURRENT_FLUSHES: usize = 1024;

/// Snapshot of batcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatcherStats {
    pub enqueued: u64,
    pub backpressure_dropped: u64,
    pub duplicates: u64,
    pub batches_flushed: u64,
    pub records_written: u64,
    pub write_failures: u64,
    pub live_dropped: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    backpressure_dropped: AtomicU64,
    duplicates: AtomicU64,
    batches_flushed: AtomicU64,
    records_written: AtomicU64,
    write_failures: AtomicU64,
    live_dropped: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BatcherStats {
        BatcherStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            backpressure_dropped: self.backpressure_dropped.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            live_dropped: self.live_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Shared pieces both the handle and the accumulation task need.
struct Shared {
    hub: BroadcastHub,
    directory: Arc<dyn VehicleDirectory>,
    counters: Counters,
    fanout: FanoutMode,
    live_retry_timeout: Duration,
}

impl Shared {
    /// Non-blocking hub submit with one bounded background retry.
    fn submit_live(self: &Arc<Self>, payload: Payload) {
        match self.hub.submit(payload.clone()) {
            Ok(()) => {}
            Err(IngestError::Backpressure { .. }) => {
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    if shared.hub.submit_timeout(payload, shared.live_retry_timeout).await.is_err()
                    {
                        Counters::bump(&shared.counters.live_dropped);
                        trace!("Live payload dropped after retry");
                    }
                });
            }
            Err(_) => Counters::bump(&self.counters.live_dropped),
        }
    }
}

/// Spawns the accumulation task.
pub struct Batcher;

impl Batcher {
    pub fn spawn(
        config: &BatcherConfig,
        sink: Arc<dyn TimeSeriesSink>,
        hub: BroadcastHub,
        directory: Arc<dyn VehicleDirectory>,
    ) -> BatcherHandle {
        let (tx, rx) = mpsc::channel(config.queue_capacity());
        let shared = Arc::new(Shared {
            hub,
            directory,
            counters: Counters::default(),
            fanout: config.fanout,
            live_retry_timeout: config.live_retry_timeout(),
        });
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let flushes = config.max_concurrent_flushes.clamp(1, MAX_CONCURRENT_FLUSHES);

        let task = AccumulationTask {
            rx,
            sink,
            shared: Arc::clone(&shared),
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval(),
            permits: Arc::new(Semaphore::new(flushes)),
            max_permits: flushes as u32,
            last_seen: HashMap::new(),
            dedup_window: config.dedup_window(),
            last_evicted: Instant::now(),
        };
        let loop_cancel = cancel.clone();
        let loop_finished = finished.clone();
        tokio::spawn(async move {
            task.run(loop_cancel).await;
            loop_finished.cancel();
        });

        BatcherHandle { tx, shared, enqueue_timeout: config.enqueue_timeout(), cancel, finished }
    }
}

/// Cloneable producer side of the batcher.
#[derive(Clone)]
pub struct BatcherHandle {
    tx: mpsc::Sender<VehicleStateRecord>,
    shared: Arc<Shared>,
    enqueue_timeout: Duration,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl BatcherHandle {
    /// Queue a record for batching.
    ///
    /// Fails with [`IngestError::Backpressure`] when the queue stays full for
    /// the whole enqueue timeout and with [`IngestError::ShuttingDown`] once
    /// shutdown has begun. Either way the record is dropped.
    pub async fn enqueue(&self, record: VehicleStateRecord) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(IngestError::ShuttingDown);
        }

        let live = if self.shared.fanout.per_record() {
            let profile = self.shared.directory.profile(&record.vehicle_id);
            live_payload(&record, profile.as_ref()).ok()
        } else {
            None
        };

        let counters = &self.shared.counters;
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(IngestError::ShuttingDown),
            Err(mpsc::error::TrySendError::Full(record)) => {
                match self.tx.send_timeout(record, self.enqueue_timeout).await {
                    Ok(()) => {}
                    Err(mpsc::error::SendTimeoutError::Timeout(record)) => {
                        Counters::bump(&counters.backpressure_dropped);
                        debug!(vehicle_id = %record.vehicle_id, "Ingestion queue full, record dropped");
                        return Err(IngestError::Backpressure { waited: self.enqueue_timeout });
                    }
                    Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                        return Err(IngestError::ShuttingDown);
                    }
                }
            }
        }
        Counters::bump(&counters.enqueued);

        if let Some(payload) = live {
            self.shared.submit_live(payload);
        }
        Ok(())
    }

    pub fn stats(&self) -> BatcherStats {
        self.shared.counters.snapshot()
    }

    /// Stop accepting records, flush what is buffered and wait for writers.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.finished.cancelled().await;
    }
}

struct AccumulationTask {
    rx: mpsc::Receiver<VehicleStateRecord>,
    sink: Arc<dyn TimeSeriesSink>,
    shared: Arc<Shared>,
    batch_size: usize,
    flush_interval: Duration,
    permits: Arc<Semaphore>,
    max_permits: u32,
    /// Last accepted timestamp per vehicle and when it arrived.
    last_seen: HashMap<String, (u64, Instant)>,
    dedup_window: Duration,
    last_evicted: Instant,
}

impl AccumulationTask {
    async fn run(mut self, cancel: CancellationToken) {
        info!(batch_size = self.batch_size, interval = ?self.flush_interval, "Batcher started");
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.flush(&mut batch).await;
                    self.evict_stale();
                }
                record = self.rx.recv() => match record {
                    Some(record) => {
                        self.accept(record, &mut batch);
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => break,
                },
            }
        }

        self.rx.close();
        while let Some(record) = self.rx.recv().await {
            self.accept(record, &mut batch);
            if batch.len() >= self.batch_size {
                self.flush(&mut batch).await;
            }
        }
        self.flush(&mut batch).await;

        if self.permits.acquire_many(self.max_permits).await.is_err() {
            warn!("Flush permits closed before writers finished");
        }
        info!(stats = ?self.shared.counters.snapshot(), "Batcher stopped");
    }

    fn accept(&mut self, record: VehicleStateRecord, batch: &mut Vec<VehicleStateRecord>) {
        let now = Instant::now();
        match self.last_seen.get_mut(&record.vehicle_id) {
            Some((last, _)) if *last == record.timestamp_ms => {
                Counters::bump(&self.shared.counters.duplicates);
                trace!(vehicle_id = %record.vehicle_id, "Duplicate timestamp suppressed");
                return;
            }
            Some(entry) => *entry = (record.timestamp_ms, now),
            None => {
                self.last_seen.insert(record.vehicle_id.clone(), (record.timestamp_ms, now));
            }
        }
        batch.push(record);
    }

    /// Forget vehicles not seen for a whole dedup window, at most once per window.
    fn evict_stale(&mut self) {
        if self.last_evicted.elapsed() < self.dedup_window {
            return;
        }
        self.last_evicted = Instant::now();
        let window = self.dedup_window;
        let before = self.last_seen.len();
        self.last_seen.retain(|_, (_, seen)| seen.elapsed() < window);
        let evicted = before - self.last_seen.len();
        if evicted > 0 {
            debug!(evicted, tracked = self.last_seen.len(), "Evicted stale dedup entries");
        }
    }

    async fn flush(&self, batch: &mut Vec<VehicleStateRecord>) {
        if batch.is_empty() {
            return;
        }
        let records = std::mem::replace(batch, Vec::with_capacity(self.batch_size));

        if self.shared.fanout.per_batch() {
            match batch_payload(&records) {
                Ok(payload) => self.shared.submit_live(payload),
                Err(e) => warn!(error = %e, "Batch payload serialization failed"),
            }
        }

        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(dropped = records.len(), "Flush permits closed, batch dropped");
                return;
            }
        };
        Counters::bump(&self.shared.counters.batches_flushed);

        let sink = Arc::clone(&self.sink);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            write_batch(sink.as_ref(), &records, &shared.counters).await;
            drop(permit);
        });
    }
}

async fn write_batch(sink: &dyn TimeSeriesSink, records: &[VehicleStateRecord], counters: &Counters) {
    let mut failures = 0usize;
    for record in records {
        match sink.write_point(Point::from_record(record)).await {
            Ok(()) => Counters::bump(&counters.records_written),
            Err(e) => {
                failures += 1;
                Counters::bump(&counters.write_failures);
                warn!(vehicle_id = %record.vehicle_id, error = %e, "Point write failed, skipped");
            }
        }
    }
    if let Err(e) = sink.flush().await {
        warn!(error = %e, "Sink flush failed");
    }
    debug!(records = records.len(), failures, "Batch written");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::directory::NoDirectory;
    use crate::test_utils::{MemorySink, record_at};

    fn config(batch_size: usize, flush_interval_ms: u64) -> BatcherConfig {
        BatcherConfig { batch_size, flush_interval_ms, ..BatcherConfig::default() }
    }

    fn spawn(config: &BatcherConfig, sink: Arc<MemorySink>) -> (BatcherHandle, BroadcastHub) {
        let hub = BroadcastHub::spawn(&HubConfig::default(), CancellationToken::new());
        let handle = Batcher::spawn(config, sink, hub.clone(), Arc::new(NoDirectory));
        (handle, hub)
    }

    #[tokio::test]
    async fn size_threshold_triggers_flush() {
        let sink = Arc::new(MemorySink::default());
        let (handle, _hub) = spawn(&config(5, 60_000), sink.clone());

        for i in 0..5 {
            handle.enqueue(record_at("V001", 1_000 + i)).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), sink.wait_for(5)).await.unwrap();
        assert_eq!(handle.stats().batches_flushed, 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_partial_batch() {
        let sink = Arc::new(MemorySink::default());
        let (handle, _hub) = spawn(&config(100, 1_000), sink.clone());

        handle.enqueue(record_at("V001", 1)).await.unwrap();
        handle.enqueue(record_at("V002", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert_eq!(sink.len(), 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_everything_enqueued() {
        let sink = Arc::new(MemorySink::default());
        let (handle, _hub) = spawn(&config(7, 60_000), sink.clone());

        for i in 0..30u64 {
            handle.enqueue(record_at(&format!("V{}", i % 3), i)).await.unwrap();
        }
        handle.shutdown().await;

        let stats = handle.stats();
        assert_eq!(sink.len(), 30);
        assert_eq!(stats.enqueued, 30);
        assert_eq!(stats.records_written, 30);
        assert_eq!(stats.backpressure_dropped, 0);
        assert!(matches!(
            handle.enqueue(record_at("V9", 99)).await,
            Err(IngestError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn duplicate_timestamps_are_suppressed() {
        let sink = Arc::new(MemorySink::default());
        let (handle, _hub) = spawn(&config(10, 60_000), sink.clone());

        handle.enqueue(record_at("V001", 5)).await.unwrap();
        handle.enqueue(record_at("V001", 5)).await.unwrap();
        handle.enqueue(record_at("V002", 5)).await.unwrap();
        handle.shutdown().await;

        assert_eq!(sink.len(), 2);
        assert_eq!(handle.stats().duplicates, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dedup_entries_expire_after_window() {
        let sink = Arc::new(MemorySink::default());
        let config = BatcherConfig {
            batch_size: 10,
            flush_interval_ms: 100,
            dedup_window_ms: 1_000,
            ..BatcherConfig::default()
        };
        let (handle, _hub) = spawn(&config, sink.clone());

        handle.enqueue(record_at("V001", 5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.enqueue(record_at("V001", 5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(handle.stats().duplicates, 1);

        handle.enqueue(record_at("V001", 5)).await.unwrap();
        handle.shutdown().await;
        assert_eq!(handle.stats().duplicates, 1);
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn oversized_flush_limit_is_clamped() {
        let sink = Arc::new(MemorySink::default());
        let config = BatcherConfig {
            batch_size: 1,
            max_concurrent_flushes: usize::MAX,
            ..BatcherConfig::default()
        };
        let (handle, _hub) = spawn(&config, sink.clone());

        handle.enqueue(record_at("V001", 1)).await.unwrap();
        handle.shutdown().await;
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_reports_backpressure() {
        let sink = Arc::new(MemorySink::blocked());
        let config = BatcherConfig {
            batch_size: 1,
            queue_capacity: Some(2),
            max_concurrent_flushes: 1,
            flush_interval_ms: 60_000,
            enqueue_timeout_ms: 200,
            ..BatcherConfig::default()
        };
        let (handle, _hub) = spawn(&config, sink.clone());

        let mut accepted = 0u64;
        let mut dropped = 0u64;
        for i in 0..10u64 {
            match handle.enqueue(record_at("V001", i)).await {
                Ok(()) => accepted += 1,
                Err(IngestError::Backpressure { waited }) => {
                    assert_eq!(waited, Duration::from_millis(200));
                    dropped += 1;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(dropped > 0);
        assert_eq!(handle.stats().backpressure_dropped, dropped);

        sink.unblock();
        handle.shutdown().await;
        assert_eq!(sink.len() as u64, accepted);
        assert_eq!(accepted + dropped, 10);
    }

    #[tokio::test]
    async fn sink_failures_are_skipped_per_record() {
        let sink = Arc::new(MemorySink::failing_for("BAD"));
        let (handle, _hub) = spawn(&config(10, 60_000), sink.clone());

        handle.enqueue(record_at("V001", 1)).await.unwrap();
        handle.enqueue(record_at("BAD", 1)).await.unwrap();
        handle.enqueue(record_at("V002", 1)).await.unwrap();
        handle.shutdown().await;

        let stats = handle.stats();
        assert_eq!(stats.records_written, 2);
        assert_eq!(stats.write_failures, 1);
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn records_and_batches_fan_out_to_hub() {
        let sink = Arc::new(MemorySink::default());
        let (handle, hub) = spawn(&config(2, 60_000), sink.clone());
        let mut subscriber = hub.register(None);

        handle.enqueue(record_at("V001", 1)).await.unwrap();
        handle.enqueue(record_at("V002", 1)).await.unwrap();

        let mut live = 0;
        let mut arrays = 0;
        for _ in 0..3 {
            let payload = tokio::time::timeout(Duration::from_secs(5), subscriber.recv())
                .await
                .unwrap()
                .unwrap();
            let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
            if value.is_array() {
                arrays += 1;
            } else {
                live += 1;
            }
        }
        assert_eq!((live, arrays), (2, 1));
        handle.shutdown().await;
    }
}
