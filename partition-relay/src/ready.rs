use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

/// Single-use broadcast fired the first time the relay session becomes ready.
///
/// Owned by the top-level orchestrator and handed to the session. Later
/// generations call [`ReadyGate::fire`] again, which is a no-op: the gate
/// never resets.
#[derive(Clone)]
pub struct ReadyGate {
    sender: Arc<watch::Sender<bool>>,
}

impl ReadyGate {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Fire the gate. Returns true only for the call that actually opened it.
    pub fn fire(&self) -> bool {
        self.sender.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub fn is_ready(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once the gate has fired, immediately if it already has.
    pub async fn wait(&self) {
        let mut receiver = self.sender.subscribe();
        if let Err(e) = receiver.wait_for(|ready| *ready).await {
            debug!("ready gate closed before firing: {e}");
        };
    }
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}
