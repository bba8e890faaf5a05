use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use common_kafka::kafka_consumer::create_kafka_consumer;
use common_kafka::kafka_producer::{create_kafka_producer, topic_partition_count};
use rdkafka::producer::Producer;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::RelaySettings;
use crate::error::{RelayError, RoutingError};
use crate::events::{drain_events, event_queue, run_until_shutdown, EventReporter, RelayEvent};
use crate::kafka::producer::{ProductionWorker, RelayProducerContext};
use crate::kafka::source::{KafkaClaimSource, KafkaOffsetStore, RelayConsumerContext};
use crate::ready::ReadyGate;
use crate::router::{PartitionRouter, RouteConfig};
use crate::session::claim::ClaimSource;
use crate::session::handler::RelayHandler;
use crate::session::RelaySession;
use crate::shutdown::ShutdownCoordinator;

const EVENT_QUEUE_CAPACITY: usize = 1024;

/// The running halves of a relay and the control loop that stops them.
pub struct Pipeline {
    events: mpsc::Receiver<RelayEvent>,
    shutdown: CancellationToken,
    session: JoinHandle<()>,
    producer_stop: CancellationToken,
    production: JoinHandle<()>,
}

impl Pipeline {
    pub fn new(
        events: mpsc::Receiver<RelayEvent>,
        shutdown: CancellationToken,
        session: JoinHandle<()>,
        producer_stop: CancellationToken,
        production: JoinHandle<()>,
    ) -> Self {
        Self {
            events,
            shutdown,
            session,
            producer_stop,
            production,
        }
    }

    /// Drain events until shutdown is triggered, then close both sides in
    /// parallel under the coordinator's deadline.
    pub async fn run<S: Future>(
        self,
        signal: S,
        coordinator: &ShutdownCoordinator,
    ) -> Result<(), RelayError> {
        let Pipeline {
            mut events,
            shutdown,
            session,
            producer_stop,
            production,
        } = self;

        let trigger = run_until_shutdown(&mut events, signal, &shutdown).await;
        info!(?trigger, deadline = ?coordinator.deadline(), "shutting down");
        let drain = tokio::spawn(drain_events(events));

        let consumer_close = async move {
            shutdown.cancel();
            if let Err(e) = session.await {
                error!("session task failed: {e}");
            }
        };
        let producer_close = async move {
            producer_stop.cancel();
            if let Err(e) = production.await {
                error!("production task failed: {e}");
            }
        };
        let result = coordinator.close(consumer_close, producer_close).await;

        drain.abort();
        result
    }
}

/// Run a session to completion. A session that ends, with or without an
/// error, cancels the token so the control loop starts shutdown even when the
/// fatal event could not be queued.
pub fn spawn_session<S>(
    session: RelaySession<S>,
    shutdown: CancellationToken,
    events: EventReporter,
) -> JoinHandle<()>
where
    S: ClaimSource + 'static,
{
    tokio::spawn(async move {
        match session.run().await {
            Ok(()) => {
                if !shutdown.is_cancelled() {
                    warn!("relay session ended without a shutdown request");
                    shutdown.cancel();
                }
            }
            Err(e) => {
                events.fatal(format!("session ended: {e}"));
                shutdown.cancel();
            }
        }
    })
}

pub struct RelayService {
    pipeline: Pipeline,
    ready: ReadyGate,
    shutdown: CancellationToken,
    coordinator: ShutdownCoordinator,
}

impl RelayService {
    /// Connect both clusters and start the session and the production worker.
    pub async fn new(settings: RelaySettings) -> Result<Self> {
        let (consumer_events, producer_events, events) = event_queue(EVENT_QUEUE_CAPACITY);

        let producer = create_kafka_producer(
            &settings.destination,
            &settings.producer,
            RelayProducerContext::new(producer_events.clone()),
        )
        .await
        .context("Failed to create destination producer")?;

        let num_target_partitions = match settings.destination_partitions {
            Some(partitions) => partitions,
            None => {
                let count = topic_partition_count(producer.client(), &settings.target_topic)
                    .context("Failed to fetch destination topic metadata")?;
                match count {
                    Some(count) if count > 0 => i32::try_from(count)
                        .context("Destination partition count out of range")?,
                    _ => {
                        return Err(RoutingError::Configuration(format!(
                            "destination topic '{}' has no partitions",
                            settings.target_topic
                        ))
                        .into())
                    }
                }
            }
        };

        let router = PartitionRouter::new(RouteConfig {
            policy: settings.policy,
            target_topic: settings.target_topic.clone(),
            num_target_partitions,
        })?;

        let (queue, receiver) = mpsc::channel(settings.production_queue_capacity);
        let producer_stop = CancellationToken::new();
        let worker = ProductionWorker::new(
            producer,
            receiver,
            producer_events,
            producer_stop.clone(),
            settings.shutdown_timeout,
        );
        let production = tokio::spawn(worker.run());

        let (context, rebalance_rx) = RelayConsumerContext::new(consumer_events.clone());
        let consumer = Arc::new(
            create_kafka_consumer(&settings.source, &settings.consumer, context)
                .context("Failed to create source consumer")?,
        );
        let offsets = Arc::new(KafkaOffsetStore::new(consumer.clone()));
        let source = KafkaClaimSource::new(
            consumer,
            rebalance_rx,
            settings.claim_buffer_size,
            consumer_events.clone(),
        );

        let handler = Arc::new(RelayHandler::new(
            router,
            queue,
            offsets,
            settings.on_routing_error,
            consumer_events.clone(),
        ));
        let ready = ReadyGate::new();
        let shutdown = CancellationToken::new();
        let session = RelaySession::new(source, handler, ready.clone(), shutdown.clone());
        let session = spawn_session(session, shutdown.clone(), consumer_events);

        info!(
            policy = %settings.policy,
            topics = ?settings.consumer.kafka_consumer_topics,
            target = %settings.target_topic,
            num_target_partitions,
            "partition relay started"
        );

        Ok(Self {
            pipeline: Pipeline::new(events, shutdown.clone(), session, producer_stop, production),
            ready,
            shutdown,
            coordinator: ShutdownCoordinator::new(settings.shutdown_timeout),
        })
    }

    pub fn ready_gate(&self) -> ReadyGate {
        self.ready.clone()
    }

    /// Cancelled as soon as shutdown begins
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run<S: Future>(self, signal: S) -> Result<(), RelayError> {
        self.pipeline.run(signal, &self.coordinator).await
    }
}
