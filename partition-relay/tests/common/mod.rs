//! Shared helpers for the relay integration tests: an in-memory claim
//! source driven by the test, and an offset store that records marks.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use partition_relay::error::{SessionError, TransportError};
use partition_relay::events::{event_queue, EventReporter, RelayEvent};
use partition_relay::ready::ReadyGate;
use partition_relay::router::{PartitionRouter, RouteConfig, RouteDecision, RoutingPolicy, SourceMessage};
use partition_relay::session::claim::{Claim, ClaimEvent, ClaimSource, OffsetStore, Partition};
use partition_relay::session::handler::{RelayHandler, RoutingFailureMode};
use partition_relay::session::RelaySession;

pub const SOURCE_TOPIC: &str = "source";
pub const TARGET_TOPIC: &str = "target";

pub type SourceEvent = Result<ClaimEvent, SessionError>;

/// Claim source whose membership changes are pushed by the test.
pub struct FakeClaimSource {
    events: mpsc::UnboundedReceiver<SourceEvent>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl ClaimSource for FakeClaimSource {
    async fn next_event(&mut self) -> Result<Option<ClaimEvent>, SessionError> {
        match self.events.recv().await {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingOffsets {
    marked: Mutex<Vec<(i32, i64)>>,
}

impl RecordingOffsets {
    pub fn marked(&self) -> Vec<(i32, i64)> {
        self.marked.lock().unwrap().clone()
    }

    pub fn marked_for(&self, partition: i32) -> Vec<i64> {
        self.marked()
            .into_iter()
            .filter(|(p, _)| *p == partition)
            .map(|(_, offset)| offset)
            .collect()
    }
}

impl OffsetStore for RecordingOffsets {
    fn mark_consumed(&self, message: &SourceMessage) -> Result<(), TransportError> {
        self.marked
            .lock()
            .unwrap()
            .push((message.partition, message.offset));
        Ok(())
    }
}

/// Everything around one session under test.
pub struct Harness {
    pub source: mpsc::UnboundedSender<SourceEvent>,
    pub closed: Arc<AtomicBool>,
    pub offsets: Arc<RecordingOffsets>,
    pub decisions: mpsc::Receiver<RouteDecision>,
    pub ready: ReadyGate,
    pub shutdown: CancellationToken,
    pub consumer_events: EventReporter,
    pub producer_events: EventReporter,
    pub relay_events: mpsc::Receiver<RelayEvent>,
}

pub struct HarnessOptions {
    pub policy: RoutingPolicy,
    pub num_target_partitions: i32,
    pub on_routing_error: RoutingFailureMode,
    pub queue_capacity: usize,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            policy: RoutingPolicy::Modulo,
            num_target_partitions: 2,
            on_routing_error: RoutingFailureMode::Halt,
            queue_capacity: 64,
        }
    }
}

pub fn harness(options: HarnessOptions) -> (Harness, RelaySession<FakeClaimSource>) {
    let (source_tx, source_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let offsets = Arc::new(RecordingOffsets::default());
    let (queue, decisions) = mpsc::channel(options.queue_capacity);
    let (consumer_events, producer_events, relay_events) = event_queue(64);

    let router = PartitionRouter::new(RouteConfig {
        policy: options.policy,
        target_topic: TARGET_TOPIC.to_string(),
        num_target_partitions: options.num_target_partitions,
    })
    .unwrap();
    let handler = Arc::new(RelayHandler::new(
        router,
        queue,
        offsets.clone(),
        options.on_routing_error,
        consumer_events.clone(),
    ));

    let ready = ReadyGate::new();
    let shutdown = CancellationToken::new();
    let session = RelaySession::new(
        FakeClaimSource {
            events: source_rx,
            closed: closed.clone(),
        },
        handler,
        ready.clone(),
        shutdown.clone(),
    );

    (
        Harness {
            source: source_tx,
            closed,
            offsets,
            decisions,
            ready,
            shutdown,
            consumer_events,
            producer_events,
            relay_events,
        },
        session,
    )
}

impl Harness {
    /// Start a generation claiming `partitions`; returns one feed per partition.
    pub fn assign(&self, partitions: &[i32]) -> Vec<mpsc::Sender<SourceMessage>> {
        let mut feeds = Vec::new();
        let mut claims = Vec::new();
        for partition in partitions {
            let (tx, rx) = mpsc::channel(64);
            feeds.push(tx);
            claims.push(Claim::new(Partition::new(SOURCE_TOPIC, *partition), rx));
        }
        self.source.send(Ok(ClaimEvent::Assigned(claims))).unwrap();
        feeds
    }

    pub fn revoke(&self, partitions: &[i32]) {
        let partitions = partitions
            .iter()
            .map(|p| Partition::new(SOURCE_TOPIC, *p))
            .collect();
        self.source.send(Ok(ClaimEvent::Revoked(partitions))).unwrap();
    }

    /// Next routed message, failing the test if none arrives in time.
    pub async fn next_decision(&mut self) -> RouteDecision {
        tokio::time::timeout(Duration::from_secs(5), self.decisions.recv())
            .await
            .expect("no routed message in time")
            .expect("production queue closed")
    }

    pub async fn wait_for_marks(&self, count: usize) {
        let offsets = self.offsets.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while offsets.marked().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("offsets not marked in time");
    }
}

pub fn message(partition: i32, offset: i64, value: &str) -> SourceMessage {
    SourceMessage {
        topic: SOURCE_TOPIC.to_string(),
        partition,
        key: Bytes::from(format!("key-{offset}")),
        value: Bytes::from(value.to_string()),
        offset,
    }
}
