//! EventRelay: batched, ordered delivery of input events to one client.
//!
//! # How batching works (for beginners)
//!
//! Sending every mouse sample as its own network write would cost a syscall
//! and an encryption pass per event.  The relay instead collects events into
//! a batch and flushes it when either
//!
//! - the batch holds `batch_size` events, or
//! - `batch_timeout` has passed since the first event of the batch arrived.
//!
//! Each flushed batch is stamped with the next number from the session's
//! [`SequenceCounter`].  A batch that fails to send is retried with the same
//! number, so the receiver sees either the batch once or a duplicate it can
//! drop, never a batch that jumps backwards.
//!
//! `enqueue` never blocks: it is called from the capture path, and a full
//! queue means the event is dropped and counted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use kms_core::protocol::SequenceCounter;
use kms_core::{DeviceId, InputEvent, SessionId};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Number of recent events the rolling latency average covers.
const LATENCY_WINDOW: usize = 100;

/// Stand-in deadline while no batch is open.
const IDLE_DEADLINE: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RelayError {
    #[error("batch send failed: {0}")]
    Send(String),

    #[error("relay is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Bounded queue length between `enqueue` and the batching worker.
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// Total send attempts per batch, the first one included.
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            batch_size: 10,
            batch_timeout: Duration::from_millis(50),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Where flushed batches go.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Writes one batch stamped with `sequence`; returns the bytes written.
    async fn send_batch(&self, sequence: u64, events: &[InputEvent]) -> Result<usize, RelayError>;
}

// ── Metrics ───────────────────────────────────────────────────────────────────

/// Point-in-time copy of a relay's counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayMetricsSnapshot {
    /// Events accepted by `enqueue`.
    pub received: u64,
    /// Events delivered in a successfully sent batch.
    pub forwarded: u64,
    /// Events given up on after the last retry, or discarded by `stop`.
    pub failed: u64,
    /// Events refused by `enqueue` because the queue was full.
    pub dropped: u64,
    pub batches_sent: u64,
    pub bytes_sent: u64,
    /// Mean enqueue-to-send latency over the last 100 forwarded events.
    pub avg_latency_ms: f64,
    pub last_acked_sequence: Option<u64>,
}

#[derive(Debug, Default)]
struct RelayMetrics {
    snapshot: RelayMetricsSnapshot,
    latencies: VecDeque<Duration>,
}

impl RelayMetrics {
    fn record_latency(&mut self, latency: Duration) {
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
        let total: Duration = self.latencies.iter().sum();
        self.snapshot.avg_latency_ms = total.as_secs_f64() * 1000.0 / self.latencies.len() as f64;
    }
}

// ── Relay ─────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Queued {
    event: InputEvent,
    enqueued_at: Instant,
}

/// State the worker task needs, shared with the relay handle.
struct Worker {
    session_id: SessionId,
    config: RelayConfig,
    sink: Arc<dyn BatchSink>,
    sequence: Arc<SequenceCounter>,
    metrics: Mutex<RelayMetrics>,
    cancel: CancellationToken,
}

pub struct EventRelay {
    session_id: SessionId,
    client_id: DeviceId,
    tx: Mutex<Option<mpsc::Sender<Queued>>>,
    rx: Mutex<Option<mpsc::Receiver<Queued>>>,
    worker: Mutex<Option<JoinHandle<mpsc::Receiver<Queued>>>>,
    shared: Arc<Worker>,
}

impl EventRelay {
    pub fn new(
        session_id: SessionId,
        client_id: DeviceId,
        config: RelayConfig,
        sink: Arc<dyn BatchSink>,
        sequence: Arc<SequenceCounter>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            session_id,
            client_id,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
            shared: Arc::new(Worker {
                session_id,
                config,
                sink,
                sequence,
                metrics: Mutex::new(RelayMetrics::default()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn client_id(&self) -> DeviceId {
        self.client_id
    }

    /// Queues `event` without blocking.
    ///
    /// Returns `false` when the queue is full (backpressure: drop or sample)
    /// or the relay has been stopped.
    pub fn enqueue(&self, event: InputEvent) -> bool {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = tx.as_ref() else {
            return false;
        };
        let queued = Queued {
            event,
            enqueued_at: Instant::now(),
        };
        match tx.try_send(queued) {
            Ok(()) => {
                self.shared.counters().snapshot.received += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.counters().snapshot.dropped += 1;
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Spawns the batching worker.  A second call is a no-op.
    pub fn start(&self) {
        let Some(rx) = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move { shared.run(rx).await });
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        debug!(session_id = %self.session_id, client = %self.client_id, "relay started");
    }

    /// Stops the worker.  Queued and partially batched events are discarded
    /// and counted as failed.
    pub async fn stop(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.shared.cancel.cancel();

        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        let rx = match handle {
            Some(handle) => handle.await.ok(),
            None => self.rx.lock().unwrap_or_else(PoisonError::into_inner).take(),
        };
        if let Some(mut rx) = rx {
            rx.close();
            let mut discarded = 0u64;
            while rx.try_recv().is_ok() {
                discarded += 1;
            }
            if discarded > 0 {
                self.shared.counters().snapshot.failed += discarded;
                debug!(session_id = %self.session_id, discarded, "relay discarded queued events");
            }
        }
    }

    /// Records an INPUT_ACK from the client.
    pub fn record_ack(&self, sequence: u64) {
        let mut metrics = self.shared.counters();
        let last = &mut metrics.snapshot.last_acked_sequence;
        *last = Some(last.map_or(sequence, |l| l.max(sequence)));
    }

    pub fn metrics(&self) -> RelayMetricsSnapshot {
        self.shared.counters().snapshot.clone()
    }
}

impl Worker {
    fn counters(&self) -> std::sync::MutexGuard<'_, RelayMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(&self, mut rx: mpsc::Receiver<Queued>) -> mpsc::Receiver<Queued> {
        let batch_size = self.config.batch_size.max(1);
        let mut batch: Vec<Queued> = Vec::with_capacity(batch_size);
        let mut deadline: Option<Instant> = None;

        loop {
            let wake_at = deadline.unwrap_or_else(|| Instant::now() + IDLE_DEADLINE);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(queued) => {
                        if batch.is_empty() {
                            deadline = Some(Instant::now() + self.config.batch_timeout);
                        }
                        batch.push(queued);
                        if batch.len() >= batch_size {
                            self.flush(&mut batch).await;
                            deadline = None;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                    self.flush(&mut batch).await;
                    deadline = None;
                }
            }
        }

        if !batch.is_empty() {
            self.counters().snapshot.failed += batch.len() as u64;
        }
        debug!(session_id = %self.session_id, "relay worker stopped");
        rx
    }

    async fn flush(&self, batch: &mut Vec<Queued>) {
        if batch.is_empty() {
            return;
        }
        let sequence = self.sequence.next();
        let events: Vec<InputEvent> = batch.iter().map(|q| q.event.clone()).collect();
        let attempts = self.config.max_retries.max(1);

        for attempt in 1..=attempts {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(RelayError::Closed),
                r = self.sink.send_batch(sequence, &events) => r,
            };
            match result {
                Ok(bytes) => {
                    let sent_at = Instant::now();
                    let mut metrics = self.counters();
                    metrics.snapshot.forwarded += events.len() as u64;
                    metrics.snapshot.batches_sent += 1;
                    metrics.snapshot.bytes_sent += bytes as u64;
                    for queued in batch.iter() {
                        metrics.record_latency(sent_at - queued.enqueued_at);
                    }
                    trace!(session_id = %self.session_id, sequence, events = events.len(), bytes, "batch sent");
                    batch.clear();
                    return;
                }
                Err(RelayError::Closed) => break,
                Err(e) => {
                    warn!(session_id = %self.session_id, sequence, attempt, error = %e, "batch send failed");
                    if attempt < attempts {
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.config.retry_backoff) => {}
                        }
                    }
                }
            }
        }

        self.counters().snapshot.failed += events.len() as u64;
        warn!(session_id = %self.session_id, sequence, events = events.len(), "batch dropped");
        batch.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kms_core::InputPayload;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<(u64, usize)>>,
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn send_batch(&self, sequence: u64, events: &[InputEvent]) -> Result<usize, RelayError> {
            {
                let mut left = self.failures_left.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(RelayError::Send("link down".into()));
                }
            }
            self.batches.lock().unwrap().push((sequence, events.len()));
            Ok(events.len() * 10)
        }
    }

    fn event(x: i32) -> InputEvent {
        InputEvent::new(Uuid::new_v4(), InputPayload::Move { x, y: 0 }, 0, Utc::now())
    }

    fn relay(config: RelayConfig, sink: Arc<RecordingSink>) -> EventRelay {
        EventRelay::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            config,
            sink,
            Arc::new(SequenceCounter::starting_at(1)),
        )
    }

    #[test]
    fn test_enqueue_reports_backpressure_when_full() {
        // Arrange
        let config = RelayConfig {
            queue_capacity: 4,
            ..RelayConfig::default()
        };
        let relay = relay(config, Arc::new(RecordingSink::default()));

        // Act
        let accepted = (0..6).filter(|i| relay.enqueue(event(*i))).count();

        // Assert
        assert_eq!(accepted, 4);
        let m = relay.metrics();
        assert_eq!((m.received, m.dropped), (4, 2));
    }

    #[tokio::test]
    async fn test_full_batch_is_flushed_immediately() {
        // Arrange
        let sink = Arc::new(RecordingSink::default());
        let config = RelayConfig {
            batch_size: 3,
            batch_timeout: Duration::from_secs(60),
            ..RelayConfig::default()
        };
        let relay = relay(config, Arc::clone(&sink));
        relay.start();

        // Act
        for i in 0..3 {
            assert!(relay.enqueue(event(i)));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        relay.stop().await;

        // Assert
        assert_eq!(*sink.batches.lock().unwrap(), vec![(1, 3)]);
        let m = relay.metrics();
        assert_eq!((m.forwarded, m.batches_sent, m.bytes_sent), (3, 1, 30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_is_flushed_after_timeout() {
        let sink = Arc::new(RecordingSink::default());
        let relay = relay(RelayConfig::default(), Arc::clone(&sink));
        relay.start();

        relay.enqueue(event(1));
        relay.enqueue(event(2));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(*sink.batches.lock().unwrap(), vec![(1, 2)]);
        relay.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_is_retried_with_same_sequence() {
        // Arrange
        let sink = Arc::new(RecordingSink::default());
        *sink.failures_left.lock().unwrap() = 2;
        let config = RelayConfig {
            batch_size: 1,
            ..RelayConfig::default()
        };
        let relay = relay(config, Arc::clone(&sink));
        relay.start();

        // Act
        relay.enqueue(event(1));
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Assert: third attempt succeeds, still sequence 1
        assert_eq!(*sink.batches.lock().unwrap(), vec![(1, 1)]);
        assert_eq!(relay.metrics().failed, 0);
        relay.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_count_failed_and_next_batch_proceeds() {
        // Arrange
        let sink = Arc::new(RecordingSink::default());
        *sink.failures_left.lock().unwrap() = 3;
        let config = RelayConfig {
            batch_size: 1,
            ..RelayConfig::default()
        };
        let relay = relay(config, Arc::clone(&sink));
        relay.start();

        // Act
        relay.enqueue(event(1));
        tokio::time::sleep(Duration::from_millis(500)).await;
        relay.enqueue(event(2));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Assert
        let m = relay.metrics();
        assert_eq!(m.failed, 1);
        assert_eq!(m.forwarded, 1);
        assert_eq!(*sink.batches.lock().unwrap(), vec![(2, 1)]);
        relay.stop().await;
    }

    #[tokio::test]
    async fn test_stop_discards_pending_and_rejects_further_enqueues() {
        let relay = relay(RelayConfig::default(), Arc::new(RecordingSink::default()));
        for i in 0..5 {
            relay.enqueue(event(i));
        }

        relay.stop().await;

        assert!(!relay.enqueue(event(9)));
        assert_eq!(relay.metrics().failed, 5);
    }

    #[test]
    fn test_ack_keeps_highest_sequence() {
        let relay = relay(RelayConfig::default(), Arc::new(RecordingSink::default()));
        relay.record_ack(4);
        relay.record_ack(2);
        assert_eq!(relay.metrics().last_acked_sequence, Some(4));
    }

    #[test]
    fn test_latency_window_keeps_last_hundred() {
        let mut metrics = RelayMetrics::default();
        for _ in 0..100 {
            metrics.record_latency(Duration::from_millis(50));
        }
        for _ in 0..100 {
            metrics.record_latency(Duration::from_millis(10));
        }
        assert_eq!(metrics.latencies.len(), LATENCY_WINDOW);
        assert!((metrics.snapshot.avg_latency_ms - 10.0).abs() < 1e-9);
    }
}
