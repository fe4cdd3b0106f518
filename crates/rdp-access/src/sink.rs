//! Bounded write-behind sinks
//!
//! Producers call [`WriteBehind::offer`], which never waits: when the queue
//! is full or the sink is closing the record is dropped and counted. One
//! worker task drains the queue and hands each record to a
//! [`RecordWriter`] under a per-record timeout. Failed writes are counted,
//! never retried.
//!
//! [`WriteBehind::close`] stops intake, drains for at most the configured
//! window and counts whatever is left (including a write cut off by the
//! deadline) as dropped. The window is measured from the stop signal and
//! covers a write already in flight, so `close` returns within
//! `drain_window` regardless of `write_timeout`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use rdp_types::{ApiMetric, AuditRecord};

#[derive(Debug, Clone, thiserror::Error)]
pub enum WriteError {
    #[error("write failed: {0}")]
    Failed(String),
}

/// Destination of a sink
#[async_trait]
pub trait RecordWriter<T>: Send + Sync {
    async fn write(&self, record: T) -> Result<(), WriteError>;
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Label on logs and metrics
    pub name: &'static str,
    pub capacity: usize,
    pub write_timeout: Duration,
    pub drain_window: Duration,
}

impl SinkConfig {
    /// Create new config with the default bounds (1000 records, 5 s, 5 s)
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            capacity: 1000,
            write_timeout: Duration::from_secs(5),
            drain_window: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_drain_window(mut self, window: Duration) -> Self {
        self.drain_window = window;
        self
    }
}

/// Snapshot of sink counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SinkStats {
    pub enqueued: u64,
    pub written: u64,
    pub dropped: u64,
    pub failed: u64,
}

#[derive(Debug)]
struct Counters {
    name: &'static str,
    enqueued: AtomicU64,
    written: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            enqueued: AtomicU64::new(0),
            written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    fn enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rdp_sink_enqueued_total", "sink" => self.name).increment(1);
    }

    fn written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rdp_sink_written_total", "sink" => self.name).increment(1);
    }

    fn dropped(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.dropped.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("rdp_sink_dropped_total", "sink" => self.name).increment(n);
    }

    fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rdp_sink_failed_total", "sink" => self.name).increment(1);
    }

    fn snapshot(&self) -> SinkStats {
        SinkStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Bounded queue with one background writer
pub struct WriteBehind<T> {
    config: SinkConfig,
    tx: mpsc::Sender<T>,
    counters: Arc<Counters>,
    closing: AtomicBool,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Audit record sink
pub type AuditSink = WriteBehind<AuditRecord>;

/// API timing sink
pub type MetricsBuffer = WriteBehind<ApiMetric>;

impl<T> fmt::Debug for WriteBehind<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBehind")
            .field("config", &self.config)
            .field("stats", &self.counters.snapshot())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> WriteBehind<T> {
    /// Start the worker; must be called inside a tokio runtime
    #[must_use]
    pub fn start(config: SinkConfig, writer: Arc<dyn RecordWriter<T>>) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let (shutdown, stop) = watch::channel(false);
        let counters = Arc::new(Counters::new(config.name));
        let worker = tokio::spawn(run(rx, writer, counters.clone(), config.clone(), stop));
        Self {
            config,
            tx,
            counters,
            closing: AtomicBool::new(false),
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue without waiting; `false` if the record was dropped
    pub fn offer(&self, record: T) -> bool {
        if self.closing.load(Ordering::Acquire) {
            self.counters.dropped(1);
            debug!(sink = self.config.name, "sink closing, record dropped");
            return false;
        }
        match self.tx.try_send(record) {
            Ok(()) => {
                self.counters.enqueued();
                true
            }
            Err(TrySendError::Full(_)) => {
                self.counters.dropped(1);
                warn!(sink = self.config.name, "sink queue full, record dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.dropped(1);
                warn!(sink = self.config.name, "sink worker gone, record dropped");
                false
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> SinkStats {
        self.counters.snapshot()
    }

    /// Records waiting for the worker
    #[must_use]
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.config.name
    }

    /// Stop intake, drain within the window, stop the worker. Idempotent.
    ///
    /// Returns no later than `drain_window` after the call, even with a
    /// write in flight.
    pub async fn close(&self) -> SinkStats {
        self.closing.store(true, Ordering::Release);
        let _ = self.shutdown.send(true);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(sink = self.config.name, error = %err, "sink worker failed");
            }
        }
        self.stats()
    }
}

async fn write_one<T>(writer: &dyn RecordWriter<T>, record: T, counters: &Counters, timeout: Duration) {
    match tokio::time::timeout(timeout, writer.write(record)).await {
        Ok(Ok(())) => counters.written(),
        Ok(Err(err)) => {
            counters.failed();
            warn!(sink = counters.name, error = %err, "sink write failed");
        }
        Err(_) => {
            counters.failed();
            warn!(sink = counters.name, ?timeout, "sink write timed out");
        }
    }
}

async fn run<T>(
    mut rx: mpsc::Receiver<T>,
    writer: Arc<dyn RecordWriter<T>>,
    counters: Arc<Counters>,
    config: SinkConfig,
    mut stop: watch::Receiver<bool>,
) {
    let deadline = loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break Instant::now() + config.drain_window,
            next = rx.recv() => {
                let Some(record) = next else { return };
                let write = write_one(&*writer, record, &counters, config.write_timeout);
                tokio::pin!(write);
                tokio::select! {
                    biased;
                    () = &mut write => {}
                    _ = stop.changed() => {
                        // the window starts at the stop signal, in-flight write included
                        let deadline = Instant::now() + config.drain_window;
                        if tokio::time::timeout_at(deadline, write).await.is_err() {
                            counters.dropped(1);
                            warn!(sink = config.name, "in-flight write cut off by drain window");
                        }
                        break deadline;
                    }
                }
            }
        }
    };

    rx.close();
    let mut in_flight = false;
    let drained = tokio::time::timeout_at(deadline, async {
        while let Some(record) = rx.recv().await {
            in_flight = true;
            write_one(&*writer, record, &counters, config.write_timeout).await;
            in_flight = false;
        }
    })
    .await;

    if drained.is_err() {
        let mut lost = u64::from(in_flight);
        while rx.try_recv().is_ok() {
            lost += 1;
        }
        counters.dropped(lost);
        warn!(sink = config.name, lost, "sink drain window elapsed");
    }
    debug!(sink = config.name, stats = ?counters.snapshot(), "sink stopped");
}

/// Writer that keeps everything in memory
#[derive(Debug)]
pub struct MemoryWriter<T> {
    records: Mutex<Vec<T>>,
}

impl<T> Default for MemoryWriter<T> {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> MemoryWriter<T> {
    /// Create new empty writer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<T> {
        self.records.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl<T: Send + 'static> RecordWriter<T> for MemoryWriter<T> {
    async fn write(&self, record: T) -> Result<(), WriteError> {
        self.records.lock().push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Semaphore;

    /// Blocks every write until a permit is released
    struct Gate {
        permits: Semaphore,
        inner: MemoryWriter<u32>,
    }

    #[async_trait]
    impl RecordWriter<u32> for Gate {
        async fn write(&self, record: u32) -> Result<(), WriteError> {
            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| WriteError::Failed(e.to_string()))?;
            permit.forget();
            self.inner.write(record).await
        }
    }

    #[tokio::test]
    async fn everything_offered_is_written() {
        let writer = Arc::new(MemoryWriter::new());
        let sink = WriteBehind::start(SinkConfig::new("test"), writer.clone());
        for n in 0..50u32 {
            assert!(sink.offer(n));
        }
        let stats = sink.close().await;
        assert_eq!(stats.enqueued, 50);
        assert_eq!(stats.written, 50);
        assert_eq!(stats.dropped, 0);
        assert_eq!(writer.records(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn full_queue_drops_without_waiting() {
        let gate = Arc::new(Gate {
            permits: Semaphore::new(0),
            inner: MemoryWriter::new(),
        });
        let sink = WriteBehind::start(SinkConfig::new("test").with_capacity(2), gate.clone());

        // First record is pulled by the worker and parks on the gate
        assert!(sink.offer(0));
        tokio::task::yield_now().await;
        while sink.queued() > 0 {
            tokio::task::yield_now().await;
        }
        assert!(sink.offer(1));
        assert!(sink.offer(2));
        assert!(!sink.offer(3));
        assert_eq!(sink.stats().dropped, 1);

        gate.permits.add_permits(3);
        let stats = sink.close().await;
        assert_eq!(stats.written, 3);
        assert_eq!(stats.dropped, 1);
        assert!(!sink.offer(4));
        assert_eq!(sink.stats().dropped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_window_bounds_shutdown() {
        let gate = Arc::new(Gate {
            permits: Semaphore::new(0),
            inner: MemoryWriter::new(),
        });
        let config = SinkConfig::new("test")
            .with_write_timeout(Duration::from_secs(60))
            .with_drain_window(Duration::from_secs(5));
        let sink = WriteBehind::start(config, gate);
        for n in 0..3u32 {
            assert!(sink.offer(n));
        }
        let started = tokio::time::Instant::now();
        let stats = sink.close().await;
        assert!(started.elapsed() <= Duration::from_secs(6));
        assert_eq!(stats.written, 0);
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.dropped + stats.failed, 3);
    }
}
