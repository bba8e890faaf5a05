use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::ClientContext;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::TransportError;
use crate::events::EventReporter;
use crate::metrics_consts::RELAY_MESSAGES_PRODUCED;
use crate::router::RouteDecision;

const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(50);

pub struct RelayProducerContext {
    events: EventReporter,
}

impl RelayProducerContext {
    pub fn new(events: EventReporter) -> Self {
        Self { events }
    }
}

impl ClientContext for RelayProducerContext {
    fn error(&self, error: KafkaError, reason: &str) {
        self.events
            .transport(TransportError::warn("client", format!("{error}: {reason}")));
    }
}

/// Drains the production queue into the destination producer.
///
/// Delivery is asynchronous: acks are awaited alongside new sends, and every
/// failure goes to the producer-side event stream. On stop, the queue is
/// closed to new messages, what it already holds is sent, the producer is
/// flushed and every outstanding delivery is awaited.
pub struct ProductionWorker<C: ClientContext + 'static = RelayProducerContext> {
    producer: FutureProducer<C>,
    receiver: mpsc::Receiver<RouteDecision>,
    events: EventReporter,
    stop: CancellationToken,
    flush_timeout: Duration,
}

impl<C: ClientContext + 'static> ProductionWorker<C> {
    pub fn new(
        producer: FutureProducer<C>,
        receiver: mpsc::Receiver<RouteDecision>,
        events: EventReporter,
        stop: CancellationToken,
        flush_timeout: Duration,
    ) -> Self {
        Self {
            producer,
            receiver,
            events,
            stop,
            flush_timeout,
        }
    }

    pub async fn run(mut self) {
        let mut in_flight = FuturesUnordered::new();

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                Some(delivery) = in_flight.next(), if !in_flight.is_empty() => {
                    self.on_delivery(delivery);
                }
                decision = self.receiver.recv() => match decision {
                    Some(decision) => {
                        if let Some(delivery) = self.send(decision).await {
                            in_flight.push(delivery);
                        }
                    }
                    None => break,
                },
            }
        }

        // accepted messages already had their offsets marked, they must go out
        self.receiver.close();
        let mut drained = 0;
        while let Some(decision) = self.receiver.recv().await {
            drained += 1;
            if let Some(delivery) = self.send(decision).await {
                in_flight.push(delivery);
            }
        }
        info!(drained, in_flight = in_flight.len(), "production queue closed, flushing");

        let producer = self.producer.clone();
        let timeout = self.flush_timeout;
        match tokio::task::spawn_blocking(move || producer.flush(timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self
                .events
                .transport(TransportError::warn("flush", e.to_string())),
            Err(e) => error!("producer flush task failed: {e}"),
        }

        while let Some(delivery) = in_flight.next().await {
            self.on_delivery(delivery);
        }
        info!("producer drained");
    }

    /// Enqueue one message with the client, waiting while its local queue is full.
    async fn send(&self, decision: RouteDecision) -> Option<DeliveryFuture> {
        let mut record = FutureRecord::<[u8], [u8]>::to(&decision.topic)
            .payload(decision.value.as_ref());
        if let Some(key) = &decision.key {
            record = record.key(key.as_ref());
        }
        if let Some(partition) = decision.partition {
            record = record.partition(partition);
        }

        loop {
            match self.producer.send_result(record) {
                Ok(delivery) => return Some(delivery),
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned)) => {
                    record = returned;
                    sleep(QUEUE_FULL_BACKOFF).await;
                }
                Err((e, _)) => {
                    self.events
                        .transport(TransportError::warn("produce", e.to_string()));
                    return None;
                }
            }
        }
    }

    fn on_delivery(&self, delivery: <DeliveryFuture as std::future::Future>::Output) {
        match delivery {
            Ok(Ok(_)) => metrics::counter!(RELAY_MESSAGES_PRODUCED).increment(1),
            Ok(Err((e, _))) => self
                .events
                .transport(TransportError::warn("delivery", e.to_string())),
            // dropped by the client before an outcome was known
            Err(_) => self
                .events
                .transport(TransportError::warn("delivery", "delivery canceled")),
        }
    }
}
