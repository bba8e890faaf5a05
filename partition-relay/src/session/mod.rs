//! Consumer-group session: one generation of partition claims at a time.
//!
//! ```text
//! Initializing --setup--> Ready --claims assigned--> Claiming
//!      ^                                                |
//!      |                                       revoked / source ended
//!      |                                                v
//!      +-----------------reinitialize------------- Rebalancing --> Closed
//! ```
//!
//! Each claimed partition runs in its own task through
//! [`RelayHandler::consume_claim`]. A generation ends when its claims are
//! revoked: the generation's child token is cancelled, every claim task is
//! joined, and only then does the next generation start.

pub mod claim;
pub mod handler;
pub mod state;

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{ClaimError, SessionError};
use crate::ready::ReadyGate;
use crate::session::claim::{Claim, ClaimEvent, ClaimSource, Partition};
use crate::session::handler::{ClaimExit, RelayHandler};
use crate::session::state::{SessionState, SessionStateMachine};

type ClaimResult = (Partition, Result<ClaimExit, ClaimError>);

struct Generation {
    id: u64,
    cancel: CancellationToken,
    claims: JoinSet<ClaimResult>,
}

pub struct RelaySession<S: ClaimSource> {
    source: S,
    handler: Arc<RelayHandler>,
    state: SessionStateMachine,
    ready: ReadyGate,
    shutdown: CancellationToken,
    generation: Option<Generation>,
}

impl<S: ClaimSource> RelaySession<S> {
    pub fn new(
        source: S,
        handler: Arc<RelayHandler>,
        ready: ReadyGate,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            handler,
            state: SessionStateMachine::new(),
            ready,
            shutdown,
            generation: None,
        }
    }

    /// Run generations until shutdown is requested or the claim source ends.
    ///
    /// Returns once every claim task has exited and group membership was
    /// released. An `Err` is unrecoverable and should trigger shutdown.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let result = self.run_generations().await;
        if let Err(e) = self.end_generation().await {
            warn!("failed to end generation on close: {e}");
        }
        self.state.close();
        self.source.close().await;
        info!("relay session closed");
        result
    }

    async fn run_generations(&mut self) -> Result<(), SessionError> {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                Some(joined) = join_next(&mut self.generation) => {
                    log_claim_exit(joined);
                    continue;
                }
                event = self.source.next_event() => event?,
            };

            match event {
                Some(ClaimEvent::Assigned(claims)) => self.start_generation(claims).await?,
                Some(ClaimEvent::Revoked(partitions)) => {
                    info!(count = partitions.len(), "claims revoked");
                    self.end_generation().await?;
                }
                None => {
                    info!("claim source exhausted");
                    return Ok(());
                }
            }
        }
    }

    async fn start_generation(&mut self, claims: Vec<Claim>) -> Result<(), SessionError> {
        if self.state.state() == SessionState::Claiming {
            // assignment without a revoke in between: the old claim set is gone
            self.end_generation().await?;
        }

        let id = self.state.setup()?;
        if self.ready.fire() {
            info!(generation = id, "relay session ready");
        }
        self.state.claim()?;

        let cancel = self.shutdown.child_token();
        let mut tasks = JoinSet::new();
        info!(generation = id, count = claims.len(), "claiming partitions");
        for claim in claims {
            let handler = self.handler.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let partition = claim.partition.clone();
                let result = handler.consume_claim(claim, cancel).await;
                (partition, result)
            });
        }
        self.generation = Some(Generation {
            id,
            cancel,
            claims: tasks,
        });
        Ok(())
    }

    /// Cancel the current generation and wait for all of its claim tasks.
    async fn end_generation(&mut self) -> Result<(), SessionError> {
        if !matches!(
            self.state.state(),
            SessionState::Claiming | SessionState::Ready
        ) {
            return Ok(());
        }
        self.state.revoke()?;

        if let Some(mut generation) = self.generation.take() {
            generation.cancel.cancel();
            while let Some(joined) = generation.claims.join_next().await {
                log_claim_exit(joined);
            }
            info!(generation = generation.id, "generation cleaned up");
        }

        self.state.reinitialize()?;
        Ok(())
    }
}

/// Next finished claim task of the current generation. Pending forever when
/// there is none, so it never wins a select.
async fn join_next(
    generation: &mut Option<Generation>,
) -> Option<Result<ClaimResult, tokio::task::JoinError>> {
    match generation {
        Some(generation) if !generation.claims.is_empty() => generation.claims.join_next().await,
        _ => std::future::pending().await,
    }
}

fn log_claim_exit(joined: Result<ClaimResult, tokio::task::JoinError>) {
    match joined {
        Ok((partition, Ok(exit))) => info!(%partition, ?exit, "claim finished"),
        Ok((partition, Err(e))) => error!(%partition, "claim stopped: {e}"),
        Err(e) => error!("claim task failed: {e}"),
    }
}
