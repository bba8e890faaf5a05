use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::{ClientContext, TopicPartitionList};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::{SessionError, TransportError};
use crate::events::EventReporter;
use crate::metrics_consts::RELAY_REBALANCES;
use crate::router::SourceMessage;
use crate::session::claim::{
    Claim, ClaimEvent, ClaimSource, HandoffGate, OffsetStore, Partition,
};

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// Membership changes seen in the rebalance callbacks
#[derive(Debug)]
pub enum RebalanceEvent {
    /// Newly assigned partitions, each with the gate its claim must hold
    Assign(Vec<(Partition, Arc<HandoffGate>)>),
    Revoke(Vec<Partition>),
}

/// How long a revocation waits for in-progress handoffs to be marked
pub const REVOKE_HANDOFF_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RelayConsumerContext {
    rebalance_tx: mpsc::UnboundedSender<RebalanceEvent>,
    events: EventReporter,
    gates: Mutex<HashMap<Partition, Arc<HandoffGate>>>,
    revoke_timeout: Duration,
}

impl RelayConsumerContext {
    pub fn new(events: EventReporter) -> (Self, mpsc::UnboundedReceiver<RebalanceEvent>) {
        let (rebalance_tx, rebalance_rx) = mpsc::unbounded_channel();
        (
            Self {
                rebalance_tx,
                events,
                gates: Mutex::new(HashMap::new()),
                revoke_timeout: REVOKE_HANDOFF_TIMEOUT,
            },
            rebalance_rx,
        )
    }

    /// Open a gate per assigned partition and pass the claims on.
    pub fn assign(&self, partitions: &TopicPartitionList) {
        let Some(partitions) = self.rebalanced("assign", partitions) else {
            return;
        };

        let mut gates = self.lock_gates();
        let assigned = partitions
            .into_iter()
            .map(|partition| {
                let gate = Arc::new(HandoffGate::new());
                gates.insert(partition.clone(), gate.clone());
                (partition, gate)
            })
            .collect();
        drop(gates);

        self.send(RebalanceEvent::Assign(assigned));
    }

    /// Stop the revoked claims before librdkafka commits and unassigns: no
    /// new handoff starts, and handoffs already in progress are marked first.
    ///
    /// Runs inside the consumer poll. On a multi-threaded runtime the wait
    /// happens in `block_in_place` so the claim tasks keep running.
    pub fn revoke(&self, partitions: &TopicPartitionList) {
        let Some(partitions) = self.rebalanced("revoke", partitions) else {
            return;
        };

        let revoked: Vec<Arc<HandoffGate>> = {
            let mut gates = self.lock_gates();
            partitions.iter().filter_map(|p| gates.remove(p)).collect()
        };
        for gate in &revoked {
            gate.revoke();
        }
        self.send(RebalanceEvent::Revoke(partitions));

        let unfinished = wait_for_handoffs(&revoked, self.revoke_timeout);
        if unfinished > 0 {
            warn!(
                unfinished,
                "Revoking with handoffs still in progress, their messages may be relayed again"
            );
        }
    }

    fn rebalanced(
        &self,
        event_type: &'static str,
        partitions: &TopicPartitionList,
    ) -> Option<Vec<Partition>> {
        // Range assignment never sends empty deltas that matter
        if partitions.count() == 0 {
            debug!("Skipping empty {event_type} rebalance");
            return None;
        }
        metrics::counter!(RELAY_REBALANCES, "event_type" => event_type).increment(1);

        let partitions: Vec<Partition> = partitions
            .elements()
            .into_iter()
            .map(Partition::from)
            .collect();
        info!("{} {} partitions", event_type, partitions.len());
        Some(partitions)
    }

    fn send(&self, event: RebalanceEvent) {
        if let Err(e) = self.rebalance_tx.send(event) {
            error!("Failed to forward rebalance to the claim source: {e}");
        }
    }

    fn lock_gates(&self) -> MutexGuard<'_, HashMap<Partition, Arc<HandoffGate>>> {
        self.gates.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wait for every gate to go idle within one shared timeout. Returns how many
/// were still busy.
fn wait_for_handoffs(gates: &[Arc<HandoffGate>], timeout: Duration) -> usize {
    let multi_thread = Handle::try_current()
        .is_ok_and(|handle| handle.runtime_flavor() == RuntimeFlavor::MultiThread);
    // a single-threaded runtime cannot advance the claims while we block
    let timeout = if multi_thread { timeout } else { Duration::ZERO };

    let wait = || {
        let deadline = Instant::now() + timeout;
        gates
            .iter()
            .filter(|gate| !gate.wait_idle(deadline.saturating_duration_since(Instant::now())))
            .count()
    };
    if multi_thread {
        tokio::task::block_in_place(wait)
    } else {
        wait()
    }
}

impl ClientContext for RelayConsumerContext {
    fn error(&self, error: KafkaError, reason: &str) {
        self.events
            .transport(TransportError::warn("client", format!("{error}: {reason}")));
    }
}

impl ConsumerContext for RelayConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => self.revoke(partitions),
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => {
                self.events
                    .transport(TransportError::warn("rebalance", e.to_string()));
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            self.assign(partitions);
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!("Committed offsets for {} partitions", offsets.count()),
            // nothing stored since the last commit
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => self
                .events
                .transport(TransportError::warn("commit", e.to_string())),
        }
    }
}

pub type RelayConsumer = StreamConsumer<RelayConsumerContext>;

struct ClaimFeed {
    sender: mpsc::Sender<SourceMessage>,
    gate: Arc<HandoffGate>,
}

/// Turns the group consumer into claim events: one bounded message stream
/// per assigned partition, fed from the single consumer stream.
///
/// There is one pending slot for the whole consumer. While a claim's buffer is
/// full, messages for every other partition wait behind it: a slow partition
/// slows the others once its `claim_buffer_size` messages are queued.
pub struct KafkaClaimSource {
    consumer: Arc<RelayConsumer>,
    rebalance_rx: mpsc::UnboundedReceiver<RebalanceEvent>,
    claims: HashMap<Partition, ClaimFeed>,
    /// Received but not yet accepted by its claim
    pending: Option<SourceMessage>,
    buffer_size: usize,
    events: EventReporter,
    error_count: u64,
}

impl KafkaClaimSource {
    pub fn new(
        consumer: Arc<RelayConsumer>,
        rebalance_rx: mpsc::UnboundedReceiver<RebalanceEvent>,
        buffer_size: usize,
        events: EventReporter,
    ) -> Self {
        Self {
            consumer,
            rebalance_rx,
            claims: HashMap::new(),
            pending: None,
            buffer_size: buffer_size.max(1),
            events,
            error_count: 0,
        }
    }

    fn apply_rebalance(&mut self, event: RebalanceEvent) -> ClaimEvent {
        match event {
            RebalanceEvent::Assign(assigned) => {
                let claims = assigned
                    .into_iter()
                    .map(|(partition, gate)| {
                        let (sender, rx) = mpsc::channel(self.buffer_size);
                        self.claims.insert(
                            partition.clone(),
                            ClaimFeed {
                                sender,
                                gate: gate.clone(),
                            },
                        );
                        Claim::with_gate(partition, rx, gate)
                    })
                    .collect();
                ClaimEvent::Assigned(claims)
            }
            RebalanceEvent::Revoke(partitions) => {
                for partition in &partitions {
                    self.claims.remove(partition);
                }
                // buffered messages of revoked partitions were never marked
                if self
                    .pending
                    .as_ref()
                    .is_some_and(|m| !self.claims.contains_key(&partition_of(m)))
                {
                    self.pending = None;
                }
                ClaimEvent::Revoked(partitions)
            }
        }
    }

    /// Hand the pending message to its claim, waiting for buffer space.
    /// Cancel safe: the message stays pending until a slot is reserved.
    async fn dispatch_pending(&mut self) {
        let Some(partition) = self.pending.as_ref().map(partition_of) else {
            return;
        };
        let Some(feed) = self.claims.get(&partition) else {
            debug!(%partition, "dropping message for unclaimed partition");
            self.pending = None;
            return;
        };
        if feed.gate.is_revoked() {
            // the revoke event is queued behind this message
            debug!(%partition, "dropping message for revoked partition");
            self.pending = None;
            return;
        }

        let claim_gone = match feed.sender.reserve().await {
            Ok(permit) => {
                if let Some(message) = self.pending.take() {
                    permit.send(message);
                }
                None
            }
            Err(_) => Some(feed.gate.is_revoked()),
        };

        let Some(revoked) = claim_gone else {
            return;
        };
        self.pending = None;
        self.claims.remove(&partition);
        if revoked {
            return;
        }

        // the claim loop halted, hold the partition until the next rebalance
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(partition.topic(), partition.partition_number());
        match self.consumer.pause(&tpl) {
            Ok(()) => warn!(%partition, "claim halted, partition paused until next rebalance"),
            Err(e) => self
                .events
                .transport(TransportError::warn("pause", e.to_string())),
        }
    }

    /// Classify a consumer error, backing off on retriable ones. Returns the
    /// error when the session cannot continue.
    async fn handle_kafka_error(&mut self, e: KafkaError) -> Option<KafkaError> {
        self.error_count += 1;
        let current_count = self.error_count;
        match &e {
            KafkaError::MessageConsumption(code) => {
                match code {
                    RDKafkaErrorCode::PartitionEOF => {
                        self.events
                            .transport(TransportError::info("partition_eof", e.to_string()));
                    }
                    RDKafkaErrorCode::OperationTimedOut => {
                        self.events
                            .transport(TransportError::info("op_timed_out", e.to_string()));
                    }
                    RDKafkaErrorCode::OffsetOutOfRange => {
                        // auto.offset.reset seeks to the configured end
                        self.events
                            .transport(TransportError::info("offset_out_of_range", e.to_string()));
                        sleep(Duration::from_millis(500)).await;
                    }
                    _ => {
                        self.events
                            .transport(TransportError::warn("consumer", e.to_string()));
                        sleep(Duration::from_millis(100 * current_count.min(10))).await;
                    }
                }
                None
            }

            KafkaError::MessageConsumptionFatal(code) => {
                error!("Fatal Kafka consumer error: {code:?}");
                Some(e)
            }

            KafkaError::Global(code) => {
                match code {
                    RDKafkaErrorCode::AllBrokersDown => {
                        self.events
                            .transport(TransportError::warn("all_brokers_down", e.to_string()));
                        sleep(Duration::from_secs(current_count.min(5))).await;
                    }
                    RDKafkaErrorCode::BrokerTransportFailure => {
                        self.events
                            .transport(TransportError::warn("broker_transport", e.to_string()));
                        sleep(Duration::from_secs(current_count.min(3))).await;
                    }
                    RDKafkaErrorCode::Authentication => {
                        error!("Authentication failed: {code:?}");
                        return Some(e);
                    }
                    _ => {
                        self.events
                            .transport(TransportError::warn("global", e.to_string()));
                        sleep(Duration::from_millis(500 * current_count.min(6))).await;
                    }
                }
                None
            }

            KafkaError::Canceled => Some(e),

            _ => {
                self.events
                    .transport(TransportError::warn("unexpected", e.to_string()));
                sleep(Duration::from_millis(100 * current_count.min(10))).await;
                None
            }
        }
    }
}

#[async_trait]
impl ClaimSource for KafkaClaimSource {
    async fn next_event(&mut self) -> Result<Option<ClaimEvent>, SessionError> {
        loop {
            // membership changes always go before messages received after them
            if let Ok(event) = self.rebalance_rx.try_recv() {
                return Ok(Some(self.apply_rebalance(event)));
            }
            if self.pending.is_some() {
                self.dispatch_pending().await;
                continue;
            }

            let polled = tokio::select! {
                event = self.rebalance_rx.recv() => Polled::Rebalance(event),
                received = self.consumer.recv() => {
                    Polled::Message(received.map(|m| to_source_message(&m)))
                }
            };

            let received = match polled {
                Polled::Rebalance(Some(event)) => return Ok(Some(self.apply_rebalance(event))),
                Polled::Rebalance(None) => return Ok(None),
                Polled::Message(received) => received,
            };

            match received {
                Ok(message) => {
                    self.error_count = 0;
                    self.pending = Some(message);
                }
                Err(KafkaError::Canceled) => {
                    info!("Consumer canceled, ending claim source");
                    return Ok(None);
                }
                Err(e) => {
                    if let Some(fatal) = self.handle_kafka_error(e).await {
                        return Err(SessionError::Source(fatal.to_string()));
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        self.claims.clear();
        self.pending = None;

        let consumer = self.consumer.clone();
        let closed = tokio::task::spawn_blocking(move || {
            match consumer.commit_consumer_state(CommitMode::Sync) {
                Ok(()) => info!("Committed stored offsets on close"),
                Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {
                    debug!("No stored offsets to commit on close")
                }
                Err(e) => warn!("Failed to commit stored offsets on close: {e}"),
            }
            consumer.unsubscribe();
        })
        .await;
        if let Err(e) = closed {
            error!("Consumer close task failed: {e}");
        }
    }
}

enum Polled {
    Rebalance(Option<RebalanceEvent>),
    Message(KafkaResult<SourceMessage>),
}

fn partition_of(message: &SourceMessage) -> Partition {
    Partition::new(message.topic.as_str(), message.partition)
}

fn to_source_message(message: &BorrowedMessage<'_>) -> SourceMessage {
    SourceMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        key: message.key().map(Bytes::copy_from_slice).unwrap_or_default(),
        value: message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
        offset: message.offset(),
    }
}

/// Stores the next offset to consume, for the client's periodic commit.
pub struct KafkaOffsetStore {
    consumer: Arc<RelayConsumer>,
}

impl KafkaOffsetStore {
    pub fn new(consumer: Arc<RelayConsumer>) -> Self {
        Self { consumer }
    }
}

impl OffsetStore for KafkaOffsetStore {
    fn mark_consumed(&self, message: &SourceMessage) -> Result<(), TransportError> {
        self.consumer
            .store_offset(&message.topic, message.partition, message.offset + 1)
            .map_err(|e| TransportError::warn("offset_store", e.to_string()))
    }
}
