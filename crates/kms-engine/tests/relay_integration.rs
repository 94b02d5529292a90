//! Relay backpressure and delivery through an encrypted channel into the
//! client-side apply path.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kms_core::protocol::messages::InputBatchPayload;
use kms_core::protocol::{SequenceCheck, SequenceCounter};
use kms_core::{DeviceId, Envelope, InputEvent, InputPayload, Message};
use kms_engine::application::apply_input::ApplyInputUseCase;
use kms_engine::application::relay::{BatchSink, EventRelay, RelayConfig, RelayError};
use kms_engine::infrastructure::input_driver::mock::{Injected, RecordingInputDriver};
use kms_engine::infrastructure::network::secure_channel::{SecureChannel, SecureWriter, Side};
use tokio::io::{duplex, DuplexStream, WriteHalf};
use tokio::sync::mpsc;
use uuid::Uuid;

fn moves(source: DeviceId, target: DeviceId, n: i32) -> Vec<InputEvent> {
    (0..n)
        .map(|i| InputEvent::new(source, InputPayload::Move { x: i, y: i }, i as u64 + 1, Utc::now()).retarget(target))
        .collect()
}

struct NullSink;

#[async_trait]
impl BatchSink for NullSink {
    async fn send_batch(&self, _sequence: u64, _events: &[InputEvent]) -> Result<usize, RelayError> {
        Ok(0)
    }
}

/// Writes each batch as an INPUT_BATCH envelope on a secure channel.
struct ChannelSink {
    writer: tokio::sync::Mutex<SecureWriter<WriteHalf<DuplexStream>>>,
}

#[async_trait]
impl BatchSink for ChannelSink {
    async fn send_batch(&self, sequence: u64, events: &[InputEvent]) -> Result<usize, RelayError> {
        let envelope = Envelope::new(Message::InputBatch(InputBatchPayload {
            events: events.to_vec(),
        }))
        .with_sequence(sequence);
        self.writer
            .lock()
            .await
            .send_envelope(&envelope)
            .await
            .map_err(|e| RelayError::Send(e.to_string()))
    }
}

/// Delivers every batch but reports the first attempt of each as failed,
/// the way a lost acknowledgement looks to the sender.
struct LossyAckSink {
    delivered: mpsc::UnboundedSender<(u64, Vec<InputEvent>)>,
    attempts: Mutex<u32>,
}

#[async_trait]
impl BatchSink for LossyAckSink {
    async fn send_batch(&self, sequence: u64, events: &[InputEvent]) -> Result<usize, RelayError> {
        let _ = self.delivered.send((sequence, events.to_vec()));
        let mut attempts = self.attempts.lock().unwrap();
        *attempts += 1;
        if *attempts % 2 == 1 {
            return Err(RelayError::Send("ack lost".into()));
        }
        Ok(events.len())
    }
}

// ── Backpressure ──────────────────────────────────────────────────────────────

#[test]
fn test_overfilled_queue_rejects_exactly_the_excess() {
    // Arrange
    let client = Uuid::new_v4();
    let relay = EventRelay::new(
        Uuid::new_v4(),
        client,
        RelayConfig {
            queue_capacity: 1000,
            ..RelayConfig::default()
        },
        Arc::new(NullSink),
        Arc::new(SequenceCounter::new()),
    );

    // Act: the worker is never started, so nothing drains the queue.
    let rejected = moves(Uuid::new_v4(), client, 1500)
        .into_iter()
        .filter(|e| !relay.enqueue(e.clone()))
        .count();

    // Assert
    assert_eq!(rejected, 500);
    let metrics = relay.metrics();
    assert_eq!(metrics.received, 1000);
    assert_eq!(metrics.dropped, 500);
    assert_eq!(metrics.batches_sent, 0);
}

// ── Delivery over a secure channel ────────────────────────────────────────────

#[tokio::test]
async fn test_batches_arrive_in_order_and_are_injected() {
    // Arrange
    let (master_io, client_io) = duplex(256 * 1024);
    let (master_side, client_side) = tokio::join!(
        SecureChannel::establish(master_io, Side::Initiator),
        SecureChannel::establish(client_io, Side::Responder),
    );
    let (_master_reader, master_writer) = master_side.unwrap().split();
    let (mut client_reader, _client_writer) = client_side.unwrap().split();

    let master = Uuid::new_v4();
    let client = Uuid::new_v4();
    let relay = EventRelay::new(
        Uuid::new_v4(),
        client,
        RelayConfig {
            batch_size: 5,
            batch_timeout: Duration::from_millis(20),
            ..RelayConfig::default()
        },
        Arc::new(ChannelSink {
            writer: tokio::sync::Mutex::new(master_writer),
        }),
        Arc::new(SequenceCounter::starting_at(1)),
    );
    let driver = RecordingInputDriver::new();
    let mut applier = ApplyInputUseCase::new(client, Arc::new(driver.clone()));

    // Act
    relay.start();
    for event in moves(master, client, 12) {
        assert!(relay.enqueue(event));
    }
    let mut sequences = Vec::new();
    for _ in 0..3 {
        let envelope = tokio::time::timeout(Duration::from_secs(2), client_reader.recv_envelope())
            .await
            .expect("batch within two seconds")
            .unwrap();
        let Message::InputBatch(batch) = envelope.message else {
            panic!("expected INPUT_BATCH");
        };
        let sequence = envelope.sequence.unwrap();
        let outcome = applier.apply_batch(sequence, &batch.events);
        assert_eq!(outcome.check, SequenceCheck::InOrder);
        sequences.push((sequence, batch.events.len()));
    }
    relay.stop().await;

    // Assert
    assert_eq!(sequences, vec![(1, 5), (2, 5), (3, 2)]);
    let injected = driver.injected();
    assert_eq!(injected.len(), 12);
    assert!(matches!(injected[11], Injected::Mouse { x: 11, y: 11, .. }));
    let metrics = relay.metrics();
    assert_eq!((metrics.forwarded, metrics.batches_sent, metrics.failed), (12, 3, 0));
}

#[tokio::test]
async fn test_retried_batch_is_applied_once() {
    // Arrange
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = Uuid::new_v4();
    let relay = EventRelay::new(
        Uuid::new_v4(),
        client,
        RelayConfig {
            batch_size: 2,
            retry_backoff: Duration::from_millis(1),
            ..RelayConfig::default()
        },
        Arc::new(LossyAckSink {
            delivered: tx,
            attempts: Mutex::new(0),
        }),
        Arc::new(SequenceCounter::starting_at(1)),
    );
    let driver = RecordingInputDriver::new();
    let mut applier = ApplyInputUseCase::new(client, Arc::new(driver.clone()));

    // Act
    relay.start();
    for event in moves(Uuid::new_v4(), client, 4) {
        relay.enqueue(event);
    }
    let mut checks = Vec::new();
    for _ in 0..4 {
        let (sequence, events) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery within two seconds")
            .unwrap();
        checks.push(applier.apply_batch(sequence, &events).check);
    }
    relay.stop().await;

    // Assert
    assert_eq!(
        checks,
        vec![
            SequenceCheck::InOrder,
            SequenceCheck::Duplicate(1),
            SequenceCheck::InOrder,
            SequenceCheck::Duplicate(2),
        ]
    );
    assert_eq!(driver.injected().len(), 4);
    assert_eq!(relay.metrics().forwarded, 4);
}

#[tokio::test]
async fn test_acks_advance_the_acknowledged_sequence() {
    let relay = EventRelay::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        RelayConfig::default(),
        Arc::new(NullSink),
        Arc::new(SequenceCounter::starting_at(1)),
    );

    relay.record_ack(3);
    relay.record_ack(2);

    assert_eq!(relay.metrics().last_acked_sequence, Some(3));
}
