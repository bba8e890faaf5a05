//! Fan-in of the consuming and producing sides' error streams.
//!
//! Both sides report through an [`EventReporter`] into one bounded queue.
//! The control loop drains it with [`dispatch`]: transport errors are logged
//! and counted, fatal events end the run.

use std::future::Future;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::metrics_consts::{
    RELAY_CONSUMER_ERRORS, RELAY_DROPPED_EVENTS, RELAY_PRODUCER_ERRORS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Consumer,
    Producer,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Consumer => "consumer",
            Side::Producer => "producer",
        }
    }

    fn error_counter(&self) -> &'static str {
        match self {
            Side::Consumer => RELAY_CONSUMER_ERRORS,
            Side::Producer => RELAY_PRODUCER_ERRORS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Transport { side: Side, error: TransportError },
    Fatal { side: Side, reason: String },
}

/// Sending half handed to one side of the relay.
#[derive(Clone)]
pub struct EventReporter {
    side: Side,
    sender: mpsc::Sender<RelayEvent>,
}

impl EventReporter {
    /// Report a retriable transport error. Never blocks, so it is safe to
    /// call from librdkafka callbacks; events are dropped when the queue is full.
    pub fn transport(&self, error: TransportError) {
        self.send(RelayEvent::Transport {
            side: self.side,
            error,
        });
    }

    /// Report an unrecoverable condition, which triggers shutdown.
    pub fn fatal(&self, reason: impl Into<String>) {
        self.send(RelayEvent::Fatal {
            side: self.side,
            reason: reason.into(),
        });
    }

    fn send(&self, event: RelayEvent) {
        if let Err(e) = self.sender.try_send(event) {
            metrics::counter!(RELAY_DROPPED_EVENTS, "side" => self.side.as_str()).increment(1);
            debug!(error = %e, "relay event queue full, event dropped");
        }
    }
}

/// Create the merged event queue and a reporter for each side.
pub fn event_queue(
    capacity: usize,
) -> (EventReporter, EventReporter, mpsc::Receiver<RelayEvent>) {
    let (sender, receiver) = mpsc::channel(capacity);
    let consumer = EventReporter {
        side: Side::Consumer,
        sender: sender.clone(),
    };
    let producer = EventReporter {
        side: Side::Producer,
        sender,
    };
    (consumer, producer, receiver)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Shutdown(String),
}

/// Log and count one event, and decide whether the relay keeps running.
pub fn dispatch(event: &RelayEvent) -> Dispatch {
    match event {
        RelayEvent::Transport { side, error } => {
            metrics::counter!(side.error_counter(), "level" => error.level, "error" => error.error)
                .increment(1);
            match error.level {
                "info" => info!(side = side.as_str(), "Kafka {} error: {error}", side.as_str()),
                _ => warn!(side = side.as_str(), "Kafka {} error: {error}", side.as_str()),
            }
            Dispatch::Continue
        }
        RelayEvent::Fatal { side, reason } => {
            metrics::counter!(side.error_counter(), "level" => "fatal", "error" => "unrecoverable")
                .increment(1);
            error!(side = side.as_str(), "Unrecoverable {} error: {reason}", side.as_str());
            Dispatch::Shutdown(format!("{} failed: {reason}", side.as_str()))
        }
    }
}

/// What ended the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Signal,
    Cancelled,
    Fatal(String),
    /// Every reporter was dropped, nothing can report anymore
    EventsClosed,
}

/// Drain events until a signal arrives, the token is cancelled, or a fatal
/// event is dispatched.
pub async fn run_until_shutdown<S>(
    events: &mut mpsc::Receiver<RelayEvent>,
    signal: S,
    shutdown: &CancellationToken,
) -> ShutdownTrigger
where
    S: Future,
{
    tokio::pin!(signal);
    loop {
        tokio::select! {
            biased;
            _ = &mut signal => return ShutdownTrigger::Signal,
            _ = shutdown.cancelled() => return ShutdownTrigger::Cancelled,
            event = events.recv() => match event {
                Some(event) => {
                    if let Dispatch::Shutdown(reason) = dispatch(&event) {
                        return ShutdownTrigger::Fatal(reason);
                    }
                }
                None => return ShutdownTrigger::EventsClosed,
            },
        }
    }
}

/// Keep logging and counting events while the close sequences run.
pub async fn drain_events(mut events: mpsc::Receiver<RelayEvent>) {
    while let Some(event) = events.recv().await {
        dispatch(&event);
    }
}
