use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdp_access::{RecordWriter, SinkConfig, WriteBehind, WriteError};

#[derive(Default)]
struct Broken {
    calls: AtomicUsize,
}

#[async_trait]
impl RecordWriter<u64> for Broken {
    async fn write(&self, _: u64) -> Result<(), WriteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(WriteError::Failed("disk on fire".into()))
    }
}

struct Stalled;

#[async_trait]
impl RecordWriter<u64> for Stalled {
    async fn write(&self, _: u64) -> Result<(), WriteError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test]
async fn failures_are_counted_not_retried() {
    let writer = Arc::new(Broken::default());
    let sink = WriteBehind::start(SinkConfig::new("broken"), writer.clone());
    for n in 0..100 {
        assert!(sink.offer(n));
    }
    let stats = sink.close().await;
    assert_eq!(stats.enqueued, 100);
    assert_eq!(stats.failed, 100);
    assert_eq!(stats.written, 0);
    assert_eq!(writer.calls.load(Ordering::SeqCst), 100);
}

#[tokio::test(start_paused = true)]
async fn slow_writes_time_out() {
    let config = SinkConfig::new("stalled")
        .with_write_timeout(Duration::from_secs(5))
        .with_drain_window(Duration::from_secs(30));
    let sink = WriteBehind::start(config, Arc::new(Stalled));
    assert!(sink.offer(1));
    assert!(sink.offer(2));
    let stats = sink.close().await;
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.dropped, 0);
}

#[tokio::test(start_paused = true)]
async fn overload_drops_instead_of_blocking() {
    let config = SinkConfig::new("stalled")
        .with_capacity(8)
        .with_write_timeout(Duration::from_secs(5))
        .with_drain_window(Duration::from_secs(1));
    let sink = WriteBehind::start(config, Arc::new(Stalled));

    let mut accepted = 0;
    for n in 0..100 {
        if sink.offer(n) {
            accepted += 1;
        }
    }
    assert!(accepted <= 9, "accepted {accepted}");
    let stats = sink.stats();
    assert_eq!(stats.enqueued + stats.dropped, 100);
    assert!(stats.dropped >= 91);

    let offer_drops = 100 - accepted;
    let stats = sink.close().await;
    // every accepted record is accounted for exactly once
    assert_eq!(
        stats.written + stats.failed + (stats.dropped - offer_drops),
        stats.enqueued
    );
}

#[tokio::test(start_paused = true)]
async fn close_bounds_an_in_flight_write_by_the_drain_window() {
    let config = SinkConfig::new("stalled")
        .with_write_timeout(Duration::from_secs(60))
        .with_drain_window(Duration::from_secs(1));
    let sink = WriteBehind::start(config, Arc::new(Stalled));
    assert!(sink.offer(1));
    while sink.queued() > 0 {
        tokio::task::yield_now().await;
    }
    tokio::task::yield_now().await;

    let started = tokio::time::Instant::now();
    let stats = sink.close().await;
    assert!(started.elapsed() <= Duration::from_secs(1), "{:?}", started.elapsed());
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.written, 0);
}
