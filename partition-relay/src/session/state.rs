use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Ready,
    Claiming,
    Rebalancing,
    Closed,
}

/// Generation bookkeeping for one consumer-group member.
///
/// Every change goes through a named transition; anything not on the
/// lifecycle graph is rejected, so at most one generation can be claiming.
#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    generation: u64,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Initializing,
            generation: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Initializing -> Ready. Returns the generation being set up.
    pub fn setup(&mut self) -> Result<u64, SessionError> {
        self.transition("setup", SessionState::Ready, |from| {
            from == SessionState::Initializing
        })?;
        Ok(self.generation)
    }

    /// Ready -> Claiming
    pub fn claim(&mut self) -> Result<(), SessionError> {
        self.transition("claim", SessionState::Claiming, |from| {
            from == SessionState::Ready
        })
    }

    /// Claiming or Ready -> Rebalancing
    pub fn revoke(&mut self) -> Result<(), SessionError> {
        self.transition("revoke", SessionState::Rebalancing, |from| {
            matches!(from, SessionState::Claiming | SessionState::Ready)
        })
    }

    /// Rebalancing -> Initializing, starting the next generation.
    pub fn reinitialize(&mut self) -> Result<u64, SessionError> {
        self.transition("reinitialize", SessionState::Initializing, |from| {
            from == SessionState::Rebalancing
        })?;
        self.generation += 1;
        Ok(self.generation)
    }

    /// Any state -> Closed. Closing twice is allowed.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    fn transition(
        &mut self,
        event: &'static str,
        to: SessionState,
        allowed: impl Fn(SessionState) -> bool,
    ) -> Result<(), SessionError> {
        if !allowed(self.state) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                event,
            });
        }
        self.state = to;
        Ok(())
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
