//! Command dispatch surface
//!
//! Maps the signals the platform delivers (switch toggles, service start
//! commands, the permission prompt's answer) onto coordinator commands.
//!
//! Process lifetime is not decided here or in the coordinator. The
//! foreground claim on [`ServiceHost`] is held while the tunnel is up:
//! taken once a turn on (or always-on restart) connects, released on turn
//! off or when a turn on fails. The platform stops the hosting service
//! once the claim is gone.

use crate::coordinator::{Command, Coordinator, CoordinatorError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Start-command extra for an explicit turn on
pub const COMMAND_TURN_ON: &str = "turn_on";
/// Start-command extra for an explicit turn off
pub const COMMAND_TURN_OFF: &str = "turn_off";

/// Signal from the outside world
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// The user flipped the VPN switch
    Toggle { on: bool },
    /// The service was started, with the command extra if one was given.
    /// No extra means the OS started us (always-on).
    StartCommand(Option<String>),
    /// Answer to the permission prompt
    PermissionResult { granted: bool },
}

impl Signal {
    pub fn to_command(&self) -> Result<Command, DispatchError> {
        let command = match self {
            Signal::Toggle { on: true } => Command::TurnOn,
            Signal::Toggle { on: false } => Command::TurnOff,
            Signal::StartCommand(None) => Command::SystemRestart,
            Signal::StartCommand(Some(extra)) => match extra.as_str() {
                COMMAND_TURN_ON => Command::TurnOn,
                COMMAND_TURN_OFF => Command::TurnOff,
                other => return Err(DispatchError::UnknownCommand(other.to_string())),
            },
            Signal::PermissionResult { granted: true } => Command::PermissionGranted,
            Signal::PermissionResult { granted: false } => Command::PermissionDenied,
        };
        Ok(command)
    }
}

/// Dispatch errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown service command: {0}")]
    UnknownCommand(String),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// The process hosting the tunnel (a foreground service on mobile)
pub trait ServiceHost: Send + Sync {
    /// Keep the process alive while the tunnel is wanted
    fn enter_foreground(&self);

    /// Allow the platform to reclaim the process again
    fn leave_foreground(&self);
}

/// Host for environments without a foreground concept
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedHost;

impl ServiceHost for DetachedHost {
    fn enter_foreground(&self) {}

    fn leave_foreground(&self) {}
}

/// Forwards signals to the coordinator
#[derive(Clone)]
pub struct CommandDispatcher {
    coordinator: Coordinator,
    host: Arc<dyn ServiceHost>,
    in_foreground: Arc<AtomicBool>,
}

impl CommandDispatcher {
    pub fn new(coordinator: Coordinator, host: Arc<dyn ServiceHost>) -> Self {
        Self {
            coordinator,
            host,
            in_foreground: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub async fn dispatch(&self, signal: Signal) -> Result<(), DispatchError> {
        let command = signal.to_command()?;
        info!("Handling '{}' command", command);

        if command == Command::TurnOff {
            self.hold_foreground(false);
        }

        let result = self.coordinator.handle(command).await;

        match (command, &result) {
            // The copy already in progress settles the claim
            (_, Err(CoordinatorError::AlreadyInProgress)) => {}
            // Follow the live state, a queued command may have run since
            (Command::TurnOn | Command::TurnOff | Command::SystemRestart, _) => {
                self.hold_foreground(self.coordinator.current_state().is_connected());
            }
            _ => debug!("No host change for {}", command),
        }

        result.map_err(DispatchError::from)
    }

    /// Enter or leave the foreground, only on an actual change
    fn hold_foreground(&self, wanted: bool) {
        if self.in_foreground.swap(wanted, Ordering::SeqCst) == wanted {
            return;
        }

        if wanted {
            self.host.enter_foreground();
        } else {
            self.host.leave_foreground();
        }
    }
}
