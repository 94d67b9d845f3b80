//! # Valve
//!
//! A gate for backpressure. While engaged, `wait` blocks; disengaging lets
//! every waiter through. Poisoning fails every current and future waiter.
//!
//! ```text
//!   Open ──engage──► Engaged ──disengage──► Open
//!     │                 │
//!     └──── poison ─────┴──► Poisoned (final)
//! ```
//!
//! Engaging an engaged valve, or disengaging an open one, does nothing.

use std::sync::Arc;

use tokio::sync::watch;

use w3nrpc::FailureReason;

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Open,
    Engaged,
    Poisoned(FailureReason),
}

#[derive(Clone, Debug)]
pub struct Valve {
    state: Arc<watch::Sender<State>>,
}

impl Valve {
    pub fn new() -> Self {
        let (state, _) = watch::channel(State::Open);
        Self { state: Arc::new(state) }
    }

    pub fn engage(&self) {
        self.state.send_if_modified(|state| match state {
            State::Open => {
                *state = State::Engaged;
                true
            }
            _ => false,
        });
    }

    pub fn disengage(&self) {
        self.state.send_if_modified(|state| match state {
            State::Engaged => {
                *state = State::Open;
                true
            }
            _ => false,
        });
    }

    /// Fails all waiters with `reason`. The first poison wins.
    pub fn poison(&self, reason: FailureReason) {
        self.state.send_if_modified(|state| match state {
            State::Poisoned(_) => false,
            _ => {
                *state = State::Poisoned(reason);
                true
            }
        });
    }

    pub fn is_engaged(&self) -> bool {
        matches!(*self.state.borrow(), State::Engaged)
    }

    pub fn is_poisoned(&self) -> bool {
        matches!(*self.state.borrow(), State::Poisoned(_))
    }

    /// Resolves once the valve is open. Fails if it is or becomes poisoned.
    pub async fn wait(&self) -> Result<(), FailureReason> {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|s| !matches!(s, State::Engaged)).await {
            Ok(state) => (*state).clone(),
            Err(_) => return Err(FailureReason::Handler("valve dropped".into())),
        };
        match state {
            State::Poisoned(reason) => Err(reason),
            _ => Ok(()),
        }
    }
}

impl Default for Valve {
    fn default() -> Self {
        Self::new()
    }
}
