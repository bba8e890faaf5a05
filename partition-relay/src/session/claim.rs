use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{SessionError, TransportError};
use crate::router::SourceMessage;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

/// Orders a claim's handoffs against the revocation of its partition.
///
/// The claim loop holds a [`Handoff`] from before the production push until the
/// offset is marked. Once revoked, no new handoff starts, and
/// [`HandoffGate::wait_idle`] returns when the one in progress has finished.
#[derive(Debug, Default)]
pub struct HandoffGate {
    state: Mutex<GateState>,
    idle: Condvar,
}

#[derive(Debug, Default)]
struct GateState {
    revoked: bool,
    in_flight: bool,
}

impl HandoffGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// A gate for a partition that is already gone
    pub fn revoked() -> Self {
        let gate = Self::new();
        gate.revoke();
        gate
    }

    /// Start a handoff, or `None` once the partition was revoked.
    pub fn begin(&self) -> Option<Handoff<'_>> {
        let mut state = self.lock();
        if state.revoked {
            return None;
        }
        state.in_flight = true;
        Some(Handoff { gate: self })
    }

    /// Refuse every handoff from now on. Does not wait.
    pub fn revoke(&self) {
        self.lock().revoked = true;
    }

    pub fn is_revoked(&self) -> bool {
        self.lock().revoked
    }

    /// Block until no handoff is in progress. Returns false if one still was
    /// at the timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.in_flight {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            state = match self.idle.wait_timeout(state, remaining) {
                Ok((state, _)) => state,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An in-progress handoff. Dropping it marks the gate idle.
#[derive(Debug)]
pub struct Handoff<'a> {
    gate: &'a HandoffGate,
}

impl Drop for Handoff<'_> {
    fn drop(&mut self) {
        self.gate.lock().in_flight = false;
        self.gate.idle.notify_all();
    }
}

/// One claimed partition: its ordered message stream for the current generation.
/// The stream ends when the partition is revoked.
pub struct Claim {
    pub partition: Partition,
    pub messages: mpsc::Receiver<SourceMessage>,
    pub gate: Arc<HandoffGate>,
}

impl Claim {
    pub fn new(partition: Partition, messages: mpsc::Receiver<SourceMessage>) -> Self {
        Self::with_gate(partition, messages, Arc::new(HandoffGate::new()))
    }

    pub fn with_gate(
        partition: Partition,
        messages: mpsc::Receiver<SourceMessage>,
        gate: Arc<HandoffGate>,
    ) -> Self {
        Self {
            partition,
            messages,
            gate,
        }
    }
}

impl fmt::Debug for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claim")
            .field("partition", &self.partition)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum ClaimEvent {
    /// A new generation begins with this claim set.
    Assigned(Vec<Claim>),
    /// The broker took these partitions back, ending the current generation.
    Revoked(Vec<Partition>),
}

/// Where claims come from: the consumer-group membership protocol, or a fake
/// in tests.
#[async_trait]
pub trait ClaimSource: Send {
    /// Next membership change. `Ok(None)` means the source is exhausted and the
    /// session should close; `Err` is unrecoverable.
    /// Must be cancel safe: the session polls it alongside its claim tasks.
    async fn next_event(&mut self) -> Result<Option<ClaimEvent>, SessionError>;

    /// Release group membership. Called once when the session closes.
    async fn close(&mut self);
}

/// Marks source offsets consumed. Only called after the message is in the
/// production queue.
pub trait OffsetStore: Send + Sync {
    fn mark_consumed(&self, message: &SourceMessage) -> Result<(), TransportError>;
}
