//! Observable gateway lifecycle.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

/// Gateway states, in the only order they can be visited.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Created,
    Starting,
    Serving,
    Draining,
    Stopped,
}

#[derive(Error, Debug, PartialEq)]
#[error("invalid lifecycle transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Shared handle on the lifecycle state.
#[derive(Clone, Debug)]
pub struct Lifecycle {
    tx: Arc<watch::Sender<LifecycleState>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(LifecycleState::Created)),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    /// Moves to `to`. A failed start may jump straight to `Stopped`; once
    /// serving, the gateway has to drain first.
    pub fn advance(&self, to: LifecycleState) -> Result<(), TransitionError> {
        let mut result = Ok(());
        self.tx.send_if_modified(|state| {
            if permits(*state, to) {
                *state = to;
                true
            } else {
                result = Err(TransitionError { from: *state, to });
                false
            }
        });
        if result.is_ok() {
            info!("Gateway is {:?}", to);
        }
        result
    }

    /// Waits until the state reaches `target` or a later one.
    pub async fn wait_for(&self, target: LifecycleState) -> LifecycleState {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        rx.wait_for(|state| *state >= target)
            .await
            .map(|state| *state)
            .unwrap_or(LifecycleState::Stopped)
    }
}

fn permits(from: LifecycleState, to: LifecycleState) -> bool {
    use self::LifecycleState::*;
    matches!(
        (from, to),
        (Created, Starting)
            | (Starting, Serving)
            | (Serving, Draining)
            | (Draining, Stopped)
            | (Created | Starting, Stopped)
    )
}
