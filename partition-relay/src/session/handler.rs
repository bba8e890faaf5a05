use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{ClaimError, RoutingError};
use crate::events::EventReporter;
use crate::metrics_consts::{
    RELAY_MESSAGES_CONSUMED, RELAY_MESSAGES_PROCESSED, RELAY_ROUTING_ERRORS,
};
use crate::router::{PartitionRouter, RouteDecision};
use crate::session::claim::{Claim, OffsetStore};

/// What a claim loop does with a message it cannot route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RoutingFailureMode {
    /// Stop consuming the partition until the next rebalance
    #[default]
    Halt,
    /// Log, count, and move on to the next message
    Skip,
}

impl FromStr for RoutingFailureMode {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "halt" => Ok(RoutingFailureMode::Halt),
            "skip" => Ok(RoutingFailureMode::Skip),
            other => Err(RoutingError::Configuration(format!(
                "unknown routing failure mode: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimExit {
    /// The partition's stream ended (revoked)
    Exhausted,
    /// The session token was cancelled
    Cancelled,
    /// The partition was revoked before the next handoff could start
    Revoked,
}

/// Everything a claim loop needs, shared by all claims of every generation.
pub struct RelayHandler {
    router: PartitionRouter,
    queue: mpsc::Sender<RouteDecision>,
    offsets: Arc<dyn OffsetStore>,
    on_routing_error: RoutingFailureMode,
    consumer_events: EventReporter,
}

impl RelayHandler {
    pub fn new(
        router: PartitionRouter,
        queue: mpsc::Sender<RouteDecision>,
        offsets: Arc<dyn OffsetStore>,
        on_routing_error: RoutingFailureMode,
        consumer_events: EventReporter,
    ) -> Self {
        Self {
            router,
            queue,
            offsets,
            on_routing_error,
            consumer_events,
        }
    }

    /// Drive one claimed partition: route, hand off, mark, in arrival order.
    ///
    /// Cancellation is only observed between messages. A message whose
    /// handoff has started is pushed (waiting on a full queue if needed)
    /// and marked before the token is checked again. The claim's gate is held
    /// for that whole span, so a revocation waits for the mark.
    pub async fn consume_claim(
        &self,
        mut claim: Claim,
        cancel: CancellationToken,
    ) -> Result<ClaimExit, ClaimError> {
        let topic = claim.partition.topic().to_string();
        let partition = claim.partition.partition_number();
        debug!(topic = topic.as_str(), partition, "claim started");

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(ClaimExit::Cancelled),
                message = claim.messages.recv() => match message {
                    Some(message) => message,
                    None => return Ok(ClaimExit::Exhausted),
                },
            };
            let Some(handoff) = claim.gate.begin() else {
                debug!(topic = topic.as_str(), partition, "partition revoked, claim stops");
                return Ok(ClaimExit::Revoked);
            };
            metrics::counter!(RELAY_MESSAGES_CONSUMED).increment(1);

            let decision = match self.router.route(&message) {
                Ok(decision) => decision,
                Err(e) => {
                    metrics::counter!(RELAY_ROUTING_ERRORS, "error" => e.label()).increment(1);
                    match self.on_routing_error {
                        RoutingFailureMode::Halt => {
                            error!(
                                topic = topic.as_str(),
                                partition,
                                offset = message.offset,
                                "routing failed, halting claim: {e}"
                            );
                            return Err(ClaimError::Routing {
                                topic,
                                partition,
                                offset: message.offset,
                                source: e,
                            });
                        }
                        RoutingFailureMode::Skip => {
                            warn!(
                                topic = topic.as_str(),
                                partition,
                                offset = message.offset,
                                "routing failed, skipping message: {e}"
                            );
                            continue;
                        }
                    }
                }
            };

            if self.queue.send(decision).await.is_err() {
                return Err(ClaimError::QueueClosed);
            }

            if let Err(e) = self.offsets.mark_consumed(&message) {
                self.consumer_events.transport(e);
            }
            drop(handoff);
            metrics::counter!(RELAY_MESSAGES_PROCESSED).increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::error::TransportError;
    use crate::events::event_queue;
    use crate::router::{RouteConfig, RoutingPolicy, SourceMessage};
    use crate::session::claim::Partition;

    #[derive(Default)]
    struct RecordingOffsets {
        marked: Mutex<Vec<(i32, i64)>>,
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

    fn message(partition: i32, offset: i64, value: &'static [u8]) -> SourceMessage {
        SourceMessage {
            topic: "source".to_string(),
            partition,
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(value),
            offset,
        }
    }

    fn handler(
        policy: RoutingPolicy,
        mode: RoutingFailureMode,
        queue_size: usize,
    ) -> (
        RelayHandler,
        mpsc::Receiver<RouteDecision>,
        Arc<RecordingOffsets>,
    ) {
        let router = PartitionRouter::new(RouteConfig {
            policy,
            target_topic: "target".to_string(),
            num_target_partitions: 2,
        })
        .unwrap();
        let (queue, decisions) = mpsc::channel(queue_size);
        let offsets = Arc::new(RecordingOffsets::default());
        let (consumer_events, _producer_events, _events) = event_queue(16);
        let handler = RelayHandler::new(router, queue, offsets.clone(), mode, consumer_events);
        (handler, decisions, offsets)
    }

    #[tokio::test]
    async fn revoked_gate_stops_before_the_next_handoff() {
        let (handler, mut decisions, offsets) =
            handler(RoutingPolicy::Modulo, RoutingFailureMode::Halt, 8);
        let claim = claim(vec![message(0, 1, b"a")]);
        claim.gate.revoke();

        let exit = handler
            .consume_claim(claim, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(exit, ClaimExit::Revoked);
        assert!(decisions.try_recv().is_err());
        assert!(offsets.marked.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn revocation_waits_for_the_blocked_handoff_to_be_marked() {
        let (handler, mut decisions, offsets) =
            handler(RoutingPolicy::Modulo, RoutingFailureMode::Halt, 1);
        let handler = Arc::new(handler);
        let claim = claim(vec![
            message(0, 1, b"a"),
            message(0, 2, b"b"),
            message(0, 3, b"c"),
        ]);
        let gate = claim.gate.clone();

        let task = {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler
                    .consume_claim(claim, CancellationToken::new())
                    .await
            })
        };
        // "b" is blocked on the full queue with its handoff in progress
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.revoke();

        let waiter = {
            let gate = gate.clone();
            tokio::task::spawn_blocking(move || gate.wait_idle(Duration::from_secs(5)))
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        assert_eq!(decisions.recv().await.unwrap().value, Bytes::from_static(b"a"));
        assert!(waiter.await.unwrap());
        assert_eq!(*offsets.marked.lock().unwrap(), vec![(0, 1), (0, 2)]);

        let exit = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, ClaimExit::Revoked);
        assert_eq!(decisions.recv().await.unwrap().value, Bytes::from_static(b"b"));
        assert!(decisions.try_recv().is_err());
    }

    fn claim(messages: Vec<SourceMessage>) -> Claim {
        let (tx, rx) = mpsc::channel(messages.len().max(1));
        for message in messages {
            tx.try_send(message).unwrap();
        }
        Claim::new(Partition::new("source", 0), rx)
    }

    #[test]
    fn parses_failure_modes() {
        assert_eq!("".parse::<RoutingFailureMode>().unwrap(), RoutingFailureMode::Halt);
        assert_eq!("HALT".parse::<RoutingFailureMode>().unwrap(), RoutingFailureMode::Halt);
        assert_eq!("skip".parse::<RoutingFailureMode>().unwrap(), RoutingFailureMode::Skip);
        assert!(matches!(
            "retry".parse::<RoutingFailureMode>(),
            Err(RoutingError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn hands_off_then_marks_in_order() {
        let (handler, mut decisions, offsets) =
            handler(RoutingPolicy::Modulo, RoutingFailureMode::Halt, 8);
        let claim = claim(vec![message(0, 10, b"a"), message(0, 11, b"b")]);

        let exit = handler
            .consume_claim(claim, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(exit, ClaimExit::Exhausted);

        assert_eq!(decisions.recv().await.unwrap().value, Bytes::from_static(b"a"));
        assert_eq!(decisions.recv().await.unwrap().value, Bytes::from_static(b"b"));
        assert_eq!(*offsets.marked.lock().unwrap(), vec![(0, 10), (0, 11)]);
    }

    #[tokio::test]
    async fn routing_error_halts_without_marking() {
        let (handler, mut decisions, offsets) =
            handler(RoutingPolicy::Modulo, RoutingFailureMode::Halt, 8);
        let claim = claim(vec![
            message(0, 1, b"ok"),
            message(0, 2, b""),
            message(0, 3, b"never"),
        ]);

        let err = handler
            .consume_claim(claim, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClaimError::Routing {
                offset: 2,
                source: RoutingError::Validation(_),
                ..
            }
        ));
        assert_eq!(decisions.recv().await.unwrap().value, Bytes::from_static(b"ok"));
        assert!(decisions.try_recv().is_err());
        assert_eq!(*offsets.marked.lock().unwrap(), vec![(0, 1)]);
    }

    #[tokio::test]
    async fn skip_mode_continues_past_bad_messages() {
        let (handler, mut decisions, offsets) =
            handler(RoutingPolicy::Modulo, RoutingFailureMode::Skip, 8);
        let claim = claim(vec![
            message(0, 1, b"ok"),
            message(0, 2, b""),
            message(0, 3, b"after"),
        ]);

        let exit = handler
            .consume_claim(claim, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(exit, ClaimExit::Exhausted);
        assert_eq!(decisions.recv().await.unwrap().value, Bytes::from_static(b"ok"));
        assert_eq!(decisions.recv().await.unwrap().value, Bytes::from_static(b"after"));
        assert_eq!(*offsets.marked.lock().unwrap(), vec![(0, 1), (0, 3)]);
    }

    #[tokio::test]
    async fn cancelled_claim_takes_no_further_messages() {
        let (handler, mut decisions, offsets) =
            handler(RoutingPolicy::Modulo, RoutingFailureMode::Halt, 8);
        let claim = claim(vec![message(0, 1, b"a")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let exit = handler.consume_claim(claim, cancel).await.unwrap();
        assert_eq!(exit, ClaimExit::Cancelled);
        assert!(decisions.try_recv().is_err());
        assert!(offsets.marked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_queue_blocks_before_marking() {
        let (handler, mut decisions, offsets) =
            handler(RoutingPolicy::Modulo, RoutingFailureMode::Halt, 1);
        let handler = Arc::new(handler);
        let claim = claim(vec![message(0, 1, b"a"), message(0, 2, b"b")]);

        let task = {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler
                    .consume_claim(claim, CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        // the second message is stuck behind the full queue
        assert_eq!(*offsets.marked.lock().unwrap(), vec![(0, 1)]);

        assert_eq!(decisions.recv().await.unwrap().value, Bytes::from_static(b"a"));
        assert_eq!(decisions.recv().await.unwrap().value, Bytes::from_static(b"b"));
        let exit = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, ClaimExit::Exhausted);
        assert_eq!(*offsets.marked.lock().unwrap(), vec![(0, 1), (0, 2)]);
    }

    #[tokio::test]
    async fn closed_queue_stops_the_claim() {
        let (handler, decisions, offsets) =
            handler(RoutingPolicy::Modulo, RoutingFailureMode::Halt, 8);
        drop(decisions);
        let claim = claim(vec![message(0, 1, b"a")]);

        let err = handler
            .consume_claim(claim, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::QueueClosed));
        assert!(offsets.marked.lock().unwrap().is_empty());
    }
}
