//! Tunnel backend adapter
//!
//! The coordinator drives the platform tunnel engine through
//! [`TunnelBackend`]. `start`/`stop` return as soon as the engine has
//! accepted the request; whether the tunnel actually came up or went
//! down is reported later as a [`BackendEvent`] on the notification
//! channel created by [`notification_channel`].

use crate::config::TunnelConfig;
use crate::state::TunnelState;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

/// Backend errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Tunnel start failed: {0}")]
    StartFailed(String),

    #[error("Tunnel stop failed: {0}")]
    StopFailed(String),

    #[error("Tunnel handshake timed out")]
    Timeout,
}

/// Asynchronous confirmation from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// Tunnel is up
    Up,
    /// Tunnel is down (requested or not)
    Down,
    /// A previously accepted request failed
    Failed(BackendError),
}

/// Platform tunnel engine
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Ask the engine to bring the tunnel up with `config`
    async fn start(&self, config: &TunnelConfig) -> Result<(), BackendError>;

    /// Ask the engine to take the tunnel down
    async fn stop(&self) -> Result<(), BackendError>;

    /// What the engine currently reports
    async fn query_state(&self) -> TunnelState;
}

/// Sending half of the notification channel, owned by the backend
#[derive(Debug, Clone)]
pub struct BackendNotifier {
    tx: mpsc::UnboundedSender<BackendEvent>,
}

impl BackendNotifier {
    /// Deliver an event to the coordinator.
    ///
    /// Events sent after the coordinator is gone are dropped.
    pub fn notify(&self, event: BackendEvent) {
        if self.tx.send(event).is_err() {
            debug!("Backend event dropped, coordinator is gone");
        }
    }
}

/// Receiving half of the notification channel, handed to the coordinator
#[derive(Debug)]
pub struct BackendEvents {
    rx: mpsc::UnboundedReceiver<BackendEvent>,
}

impl BackendEvents {
    pub(crate) async fn recv(&mut self) -> Option<BackendEvent> {
        self.rx.recv().await
    }

    /// Discard events that are already queued
    pub(crate) fn drain(&mut self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// Create the channel a backend uses to confirm state changes
pub fn notification_channel() -> (BackendNotifier, BackendEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (BackendNotifier { tx }, BackendEvents { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notifications_in_order() {
        let (notifier, mut events) = notification_channel();

        notifier.notify(BackendEvent::Up);
        notifier.notify(BackendEvent::Failed(BackendError::Timeout));
        notifier.notify(BackendEvent::Down);

        assert_eq!(events.recv().await, Some(BackendEvent::Up));
        assert_eq!(events.recv().await, Some(BackendEvent::Failed(BackendError::Timeout)));
        assert_eq!(events.recv().await, Some(BackendEvent::Down));
    }

    #[tokio::test]
    async fn test_drain_and_close() {
        let (notifier, mut events) = notification_channel();
        notifier.notify(BackendEvent::Up);
        notifier.notify(BackendEvent::Down);

        assert_eq!(events.drain(), 2);

        drop(notifier);
        assert_eq!(events.recv().await, None);
    }

    #[test]
    fn test_notify_after_close() {
        let (notifier, events) = notification_channel();
        drop(events);

        // Must not panic
        notifier.notify(BackendEvent::Up);
    }
}
