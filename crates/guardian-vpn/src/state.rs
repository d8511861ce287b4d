//! Tunnel state and its observable feed

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::warn;

/// Transitions kept for slow observers before they start lagging
const FEED_CAPACITY: usize = 64;

/// Tunnel state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelState {
    /// No tunnel
    Disconnected,
    /// Start requested, waiting for the backend to confirm
    Connecting,
    /// Tunnel is up
    Connected,
    /// Stop requested, waiting for the backend to confirm
    Disconnecting,
}

impl TunnelState {
    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelState::Connected)
    }

    /// A start or stop is in flight
    pub fn is_transitioning(&self) -> bool {
        matches!(self, TunnelState::Connecting | TunnelState::Disconnecting)
    }

    /// Whether `next` is an edge of the lifecycle graph.
    ///
    /// `Connecting -> Disconnected` is the rollback of a failed attempt.
    pub fn can_transition_to(&self, next: TunnelState) -> bool {
        use TunnelState::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }

    pub fn description(&self) -> &'static str {
        match self {
            TunnelState::Disconnected => "Disconnected",
            TunnelState::Connecting => "Connecting...",
            TunnelState::Connected => "Connected",
            TunnelState::Disconnecting => "Disconnecting...",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Rejected state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal tunnel transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: TunnelState,
    pub to: TunnelState,
}

/// Authoritative state plus its change feed.
///
/// Publishing and subscribing happen under the same lock, so a new
/// subscriber sees the state current at that instant followed by
/// exactly the transitions published after it.
pub(crate) struct StateFeed {
    current: Mutex<TunnelState>,
    tx: broadcast::Sender<TunnelState>,
}

impl StateFeed {
    pub(crate) fn new(initial: TunnelState) -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            current: Mutex::new(initial),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TunnelState> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn current(&self) -> TunnelState {
        *self.lock()
    }

    pub(crate) fn advance(&self, next: TunnelState) -> Result<(), TransitionError> {
        let mut current = self.lock();
        if !current.can_transition_to(next) {
            return Err(TransitionError { from: *current, to: next });
        }

        *current = next;
        // No receivers is fine
        let _ = self.tx.send(next);
        Ok(())
    }

    pub(crate) fn subscribe(&self) -> StateStream {
        let current = self.lock();
        StateStream {
            pending: Some(*current),
            rx: self.tx.subscribe(),
        }
    }
}

/// Latest state followed by every later transition.
///
/// Ends only when the coordinator that produced it is gone.
pub struct StateStream {
    pending: Option<TunnelState>,
    rx: broadcast::Receiver<TunnelState>,
}

impl StateStream {
    pub async fn next(&mut self) -> Option<TunnelState> {
        if let Some(state) = self.pending.take() {
            return Some(state);
        }

        loop {
            match self.rx.recv().await {
                Ok(state) => return Some(state),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("State observer lagged, skipped {} transitions", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
