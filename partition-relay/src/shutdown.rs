use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::RelayError;
use crate::metrics_consts::RELAY_SHUTDOWN_COMPLETED;

pub const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(300);

/// Completion tag emitted by each close sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseTag {
    Consumer,
    Producer,
}

impl CloseTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseTag::Consumer => "consumer",
            CloseTag::Producer => "producer",
        }
    }
}

/// Runs the consumer and producer close sequences in parallel under one deadline.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    deadline: Duration,
}

impl ShutdownCoordinator {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Start both sequences and wait for their tags or the deadline.
    ///
    /// A sequence still running at the deadline is left detached; the
    /// process is expected to exit right after.
    pub async fn close<A, B>(&self, consumer: A, producer: B) -> Result<(), RelayError>
    where
        A: Future<Output = ()> + Send + 'static,
        B: Future<Output = ()> + Send + 'static,
    {
        let start = Instant::now();
        let (tags_tx, mut tags_rx) = mpsc::channel(2);
        spawn_sequence(CloseTag::Consumer, consumer, tags_tx.clone());
        spawn_sequence(CloseTag::Producer, producer, tags_tx);

        let mut remaining = vec![CloseTag::Consumer, CloseTag::Producer];
        let deadline = tokio::time::sleep(self.deadline);
        tokio::pin!(deadline);

        while !remaining.is_empty() {
            tokio::select! {
                _ = &mut deadline => break,
                tag = tags_rx.recv() => match tag {
                    Some(tag) => {
                        info!(sequence = tag.as_str(), elapsed = ?start.elapsed(), "close sequence completed");
                        remaining.retain(|t| *t != tag);
                    }
                    // a sequence died without reporting, nothing else can arrive
                    None => break,
                },
            }
        }

        let elapsed = start.elapsed();
        if remaining.is_empty() {
            metrics::counter!(RELAY_SHUTDOWN_COMPLETED, "clean" => "true").increment(1);
            info!(?elapsed, "shutdown complete");
            Ok(())
        } else {
            metrics::counter!(RELAY_SHUTDOWN_COMPLETED, "clean" => "false").increment(1);
            let remaining: Vec<&'static str> = remaining.iter().map(CloseTag::as_str).collect();
            error!(?elapsed, ?remaining, "shutdown did not complete before the deadline");
            Err(RelayError::ShutdownTimeout { elapsed, remaining })
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_DEADLINE)
    }
}

fn spawn_sequence<F>(tag: CloseTag, sequence: F, tags: mpsc::Sender<CloseTag>)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        sequence.await;
        if tags.send(tag).await.is_err() {
            warn!(sequence = tag.as_str(), "close sequence finished after the coordinator gave up");
        }
    });
}

/// Process exit status for the outcome of a run.
pub fn exit_code(result: &Result<(), RelayError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(_) => 1,
    }
}
