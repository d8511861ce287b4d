//! Simulated tunnel backend
//!
//! An in-process stand-in for the platform tunnel engine. It accepts
//! requests immediately and confirms them after a short fake handshake,
//! or fails in a configurable way. In manual mode it never confirms
//! anything on its own and the owner of the [`BackendNotifier`] decides
//! what the engine reports.

use crate::backend::{BackendError, BackendEvent, BackendNotifier, TunnelBackend};
use crate::config::TunnelConfig;
use crate::state::TunnelState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// How the next start request ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulatedOutcome {
    /// Handshake completes
    #[default]
    Establish,
    /// `start` itself is refused
    RejectStart,
    /// Accepted, then the handshake fails
    FailHandshake,
    /// Accepted, then the handshake times out
    TimeOut,
}

/// Simulated engine
pub struct SimulatedBackend {
    notifier: BackendNotifier,
    handshake: Duration,
    manual: bool,
    outcome: RwLock<SimulatedOutcome>,
    state: Arc<RwLock<TunnelState>>,
    last_config: RwLock<Option<TunnelConfig>>,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

impl SimulatedBackend {
    /// Engine that confirms requests after `handshake`
    pub fn new(notifier: BackendNotifier, handshake: Duration) -> Self {
        Self {
            notifier,
            handshake,
            manual: false,
            outcome: RwLock::new(SimulatedOutcome::Establish),
            state: Arc::new(RwLock::new(TunnelState::Disconnected)),
            last_config: RwLock::new(None),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        }
    }

    /// Engine that never sends notifications by itself
    pub fn manual(notifier: BackendNotifier) -> Self {
        Self {
            manual: true,
            ..Self::new(notifier, Duration::ZERO)
        }
    }

    pub fn with_outcome(self, outcome: SimulatedOutcome) -> Self {
        Self {
            outcome: RwLock::new(outcome),
            ..self
        }
    }

    pub async fn set_outcome(&self, outcome: SimulatedOutcome) {
        *self.outcome.write().await = outcome;
    }

    /// Pretend the engine already has a tunnel up (e.g. survived a restart)
    pub async fn set_reported_state(&self, state: TunnelState) {
        *self.state.write().await = state;
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Config passed to the most recent `start`
    pub async fn last_config(&self) -> Option<TunnelConfig> {
        self.last_config.read().await.clone()
    }

    /// Drop the tunnel as if the network went away
    pub async fn drop_tunnel(&self) {
        warn!("Simulated tunnel dropped");
        *self.state.write().await = TunnelState::Disconnected;
        self.notifier.notify(BackendEvent::Down);
    }

    fn settle_later(&self, settled: TunnelState, event: BackendEvent) {
        if self.manual {
            return;
        }

        let state = self.state.clone();
        let notifier = self.notifier.clone();
        let delay = self.handshake;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            *state.write().await = settled;
            debug!("Simulated engine reports {:?}", event);
            notifier.notify(event);
        });
    }
}

#[async_trait]
impl TunnelBackend for SimulatedBackend {
    async fn start(&self, config: &TunnelConfig) -> Result<(), BackendError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_config.write().await = Some(config.clone());

        let outcome = *self.outcome.read().await;
        if outcome == SimulatedOutcome::RejectStart {
            return Err(BackendError::StartFailed("engine refused the configuration".into()));
        }

        let endpoint = config.peers().first().map(|p| p.endpoint.to_string()).unwrap_or_default();
        info!("Simulated engine starting tunnel to {}", endpoint);
        *self.state.write().await = TunnelState::Connecting;

        match outcome {
            SimulatedOutcome::Establish => {
                self.settle_later(TunnelState::Connected, BackendEvent::Up);
            }
            SimulatedOutcome::FailHandshake => {
                let err = BackendError::StartFailed("handshake did not complete".into());
                self.settle_later(TunnelState::Disconnected, BackendEvent::Failed(err));
            }
            SimulatedOutcome::TimeOut => {
                self.settle_later(TunnelState::Disconnected, BackendEvent::Failed(BackendError::Timeout));
            }
            SimulatedOutcome::RejectStart => {}
        }

        Ok(())
    }

    async fn stop(&self) -> Result<(), BackendError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        info!("Simulated engine stopping tunnel");

        *self.state.write().await = TunnelState::Disconnecting;
        self.settle_later(TunnelState::Disconnected, BackendEvent::Down);
        Ok(())
    }

    async fn query_state(&self) -> TunnelState {
        *self.state.read().await
    }
}
