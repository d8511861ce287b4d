//! Guardian VPN - Tunnel Lifecycle Coordinator
//!
//! Decides, from user intent and OS lifecycle signals, whether the
//! WireGuard tunnel should be up, builds its configuration, and keeps
//! that decision in step with what the tunnel engine reports.
//!
//! # Architecture
//!
//! ```text
//!  UI toggle ──┐
//!  OS restart ─┼─▶ CommandDispatcher ──▶ Coordinator (single worker)
//!  permission ─┘                            │        ▲
//!                                           │        │ BackendEvent
//!                        TunnelConfigBuilder│        │ (Up / Down / Failed)
//!                                           ▼        │
//!                                     TunnelBackend ─┘
//!                                           │
//!                 observe_state() ◀─────────┘ TunnelState transitions
//! ```
//!
//! # Guarantees
//!
//! - **Serialized**: one command at a time, later ones queue
//! - **Acknowledged**: state moves only when the backend confirms
//! - **Always-on aware**: the connect intent is persisted and replayed
//!   on a system restart

mod backend;
mod builder;
mod config;
mod coordinator;
mod dispatch;
mod intent;
mod keys;
mod provider;
mod settings;
mod simulated;
mod state;

pub use backend::{notification_channel, BackendError, BackendEvent, BackendEvents, BackendNotifier, TunnelBackend};
pub use builder::{ConfigError, DeviceRecord, ServerRecord, TunnelConfigBuilder, DEFAULT_KEEPALIVE};
pub use config::{Cidr, CidrParseError, Endpoint, InterfaceConfig, Peer, TunnelConfig};
pub use coordinator::{Collaborators, Command, Coordinator, CoordinatorError, CoordinatorEvent};
pub use dispatch::{CommandDispatcher, DetachedHost, DispatchError, ServiceHost, Signal, COMMAND_TURN_OFF, COMMAND_TURN_ON};
pub use intent::{ConnectionIntent, JsonFilePreferences, MemoryPreferences, PreferenceError, PreferenceStore, CONNECTION_INTENT_KEY};
pub use keys::{KeyError, PrivateKey, PublicKey};
pub use provider::{DeviceRepository, PermissionGate, ServerRepository, SharedPermission};
pub use settings::{BackendSettings, ClientSettings, SettingsError, SettingsRepository};
pub use simulated::{SimulatedBackend, SimulatedOutcome};
pub use state::{StateStream, TransitionError, TunnelState};
