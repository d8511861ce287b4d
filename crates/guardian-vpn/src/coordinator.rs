//! VPN Lifecycle Coordinator
//!
//! Decides whether the tunnel should be up, and makes the backend agree.
//!
//! All commands funnel into one worker task. It owns the tunnel state and
//! processes commands strictly one after another. While a start or stop
//! waits for the backend's confirmation the worker only listens to the
//! backend, so later commands stay queued and are applied to whatever
//! state the tunnel settles in.
//!
//! # Usage
//!
//! ```rust,ignore
//! let (notifier, events) = notification_channel();
//! let backend = Arc::new(SimulatedBackend::new(notifier, Duration::from_millis(300)));
//!
//! let coordinator = Coordinator::spawn(collaborators, events, TunnelConfigBuilder::default()).await;
//! let mut states = coordinator.observe_state();
//!
//! coordinator.handle(Command::TurnOn).await?;
//! assert!(coordinator.current_state().is_connected());
//! ```

use crate::backend::{BackendError, BackendEvent, BackendEvents, TunnelBackend};
use crate::builder::{ConfigError, DeviceRecord, ServerRecord, TunnelConfigBuilder};
use crate::config::TunnelConfig;
use crate::intent::{ConnectionIntent, PreferenceStore};
use crate::provider::{DeviceRepository, PermissionGate, ServerRepository};
use crate::state::{StateFeed, StateStream, TunnelState};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Command for the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// User wants the tunnel up
    TurnOn,
    /// User wants the tunnel down
    TurnOff,
    /// Process started without an explicit command (always-on restart)
    SystemRestart,
    /// User accepted the OS permission prompt
    PermissionGranted,
    /// User rejected the OS permission prompt
    PermissionDenied,
}

impl Command {
    /// Commands for which a second identical copy is redundant
    fn is_deduplicated(&self) -> bool {
        matches!(self, Command::TurnOn | Command::TurnOff | Command::SystemRestart)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::TurnOn => "turn on",
            Command::TurnOff => "turn off",
            Command::SystemRestart => "system restart",
            Command::PermissionGranted => "permission granted",
            Command::PermissionDenied => "permission denied",
        };
        f.write_str(name)
    }
}

/// Coordinator errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("VPN permission refused")]
    PermissionRefused,

    #[error("Connect failed: {0}")]
    ConnectFailed(BackendError),

    #[error("Same command already in progress")]
    AlreadyInProgress,

    #[error("Cannot build tunnel config: {0}")]
    Config(#[from] ConfigError),

    #[error("Disconnect failed: {0}")]
    DisconnectFailed(BackendError),

    #[error("Turn on superseded by turn off")]
    Superseded,

    #[error("Coordinator stopped")]
    Stopped,
}

/// Non-state notifications for observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// The platform permission prompt should be shown
    PermissionRequired,
    /// The backend lost an established tunnel
    TunnelLost,
    /// A command failed
    Error(CoordinatorError),
}

/// Everything the coordinator talks to
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn TunnelBackend>,
    pub devices: Arc<dyn DeviceRepository>,
    pub servers: Arc<dyn ServerRepository>,
    pub permission: Arc<dyn PermissionGate>,
    pub preferences: Arc<dyn PreferenceStore>,
}

type Reply = oneshot::Sender<Result<(), CoordinatorError>>;

struct Request {
    command: Command,
    reply: Reply,
}

/// Commands currently queued, running or suspended
#[derive(Default)]
struct Pending {
    kinds: Mutex<HashSet<Command>>,
}

impl Pending {
    fn claim(self: &Arc<Self>, command: Command) -> Result<Option<PendingGuard>, CoordinatorError> {
        if !command.is_deduplicated() {
            return Ok(None);
        }

        let mut kinds = self.kinds.lock().unwrap_or_else(PoisonError::into_inner);
        if !kinds.insert(command) {
            debug!("Rejecting duplicate {}", command);
            return Err(CoordinatorError::AlreadyInProgress);
        }

        Ok(Some(PendingGuard {
            pending: self.clone(),
            command,
        }))
    }
}

/// Releases the claim when the caller stops waiting, whatever the outcome
struct PendingGuard {
    pending: Arc<Pending>,
    command: Command,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.kinds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.command);
    }
}

/// Handle to the coordinator worker
///
/// Cheap to clone; the worker stops once every handle is dropped.
#[derive(Clone)]
pub struct Coordinator {
    requests: mpsc::UnboundedSender<Request>,
    state: Arc<StateFeed>,
    events: broadcast::Sender<CoordinatorEvent>,
    pending: Arc<Pending>,
}

impl Coordinator {
    /// Start the worker.
    ///
    /// The initial state is taken from the backend: a tunnel the engine
    /// still holds (e.g. across a process restart) starts as Connected.
    pub async fn spawn(
        collaborators: Collaborators,
        notifications: BackendEvents,
        builder: TunnelConfigBuilder,
    ) -> Self {
        let initial = match collaborators.backend.query_state().await {
            TunnelState::Connected => TunnelState::Connected,
            _ => TunnelState::Disconnected,
        };
        info!("VPN coordinator starting ({})", initial);

        let state = Arc::new(StateFeed::new(initial));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (requests, rx) = mpsc::unbounded_channel();

        let worker = Worker {
            state: state.clone(),
            events: events.clone(),
            collaborators,
            notifications,
            builder,
            suspended: None,
            cached: None,
        };
        tokio::spawn(worker.run(rx));

        Self {
            requests,
            state,
            events,
            pending: Arc::new(Pending::default()),
        }
    }

    /// Process one command and wait for its outcome.
    ///
    /// A `TurnOn` that needs the OS permission resolves only after the
    /// matching permission command.
    pub async fn handle(&self, command: Command) -> Result<(), CoordinatorError> {
        let _claim = self.pending.claim(command)?;

        let (reply, outcome) = oneshot::channel();
        self.requests
            .send(Request { command, reply })
            .map_err(|_| CoordinatorError::Stopped)?;

        outcome.await.map_err(|_| CoordinatorError::Stopped)?
    }

    /// Current state, never blocks on the worker
    pub fn current_state(&self) -> TunnelState {
        self.state.current()
    }

    /// Current state followed by every later transition
    pub fn observe_state(&self) -> StateStream {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }
}

struct CachedConfig {
    device: DeviceRecord,
    server: ServerRecord,
    config: Arc<TunnelConfig>,
}

/// Single writer of the tunnel state
struct Worker {
    state: Arc<StateFeed>,
    events: broadcast::Sender<CoordinatorEvent>,
    collaborators: Collaborators,
    notifications: BackendEvents,
    builder: TunnelConfigBuilder,
    /// `TurnOn` parked until the permission answer arrives
    suspended: Option<Reply>,
    cached: Option<CachedConfig>,
}

impl Worker {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        loop {
            tokio::select! {
                biased;

                Some(event) = self.notifications.recv() => self.on_idle_event(event),

                request = requests.recv() => match request {
                    Some(Request { command, reply }) => self.dispatch(command, reply).await,
                    None => break,
                },
            }
        }

        if let Some(reply) = self.suspended.take() {
            let _ = reply.send(Err(CoordinatorError::Stopped));
        }
        debug!("VPN coordinator stopped");
    }

    async fn dispatch(&mut self, command: Command, reply: Reply) {
        debug!("Handling {} in state {}", command, self.state.current());

        match command {
            Command::TurnOn => self.turn_on(reply).await,
            Command::SystemRestart => {
                match ConnectionIntent::load(self.collaborators.preferences.as_ref()) {
                    ConnectionIntent::Connected => {
                        info!("System restart with connect intent, reconnecting");
                        self.turn_on(reply).await;
                    }
                    ConnectionIntent::Disconnected => {
                        info!("System restart without connect intent, staying down");
                        let _ = reply.send(Ok(()));
                    }
                }
            }
            Command::TurnOff => {
                let result = self.turn_off().await;
                let _ = reply.send(result);
            }
            Command::PermissionGranted => {
                let result = match self.suspended.take() {
                    Some(parked) => {
                        info!("VPN permission granted, resuming turn on");
                        let result = self.connect().await;
                        let _ = parked.send(result.clone());
                        result
                    }
                    None => {
                        debug!("Permission granted with nothing waiting");
                        Ok(())
                    }
                };
                let _ = reply.send(result);
            }
            Command::PermissionDenied => {
                let result = match self.suspended.take() {
                    Some(parked) => {
                        warn!("VPN permission denied");
                        let err = CoordinatorError::PermissionRefused;
                        self.publish_error(&err);
                        let _ = parked.send(Err(err.clone()));
                        Err(err)
                    }
                    None => {
                        debug!("Permission denied with nothing waiting");
                        Ok(())
                    }
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn turn_on(&mut self, reply: Reply) {
        if self.state.current().is_connected() {
            debug!("Already connected");
            self.save_intent(ConnectionIntent::Connected);
            let _ = reply.send(Ok(()));
            return;
        }

        if self.suspended.is_some() {
            let _ = reply.send(Err(CoordinatorError::AlreadyInProgress));
            return;
        }

        if !self.collaborators.permission.is_granted() {
            info!("VPN permission missing, waiting for the user");
            self.collaborators.permission.request();
            let _ = self.events.send(CoordinatorEvent::PermissionRequired);
            self.suspended = Some(reply);
            return;
        }

        let result = self.connect().await;
        let _ = reply.send(result);
    }

    async fn connect(&mut self) -> Result<(), CoordinatorError> {
        let config = match self.resolve_config() {
            Ok(config) => config,
            Err(e) => {
                error!("Cannot build tunnel config: {}", e);
                let err = CoordinatorError::Config(e);
                self.publish_error(&err);
                return Err(err);
            }
        };

        if let Some(peer) = config.peers().first() {
            info!("Connecting VPN ({})", peer.endpoint);
        }

        let stale = self.notifications.drain();
        if stale > 0 {
            debug!("Discarded {} stale backend events", stale);
        }

        self.transition(TunnelState::Connecting);

        if let Err(e) = self.collaborators.backend.start(&config).await {
            return Err(self.connect_failed(e));
        }

        loop {
            match self.notifications.recv().await {
                Some(BackendEvent::Up) => break,
                Some(BackendEvent::Failed(e)) => return Err(self.connect_failed(e)),
                Some(BackendEvent::Down) => {
                    let e = BackendError::StartFailed("tunnel went down during handshake".into());
                    return Err(self.connect_failed(e));
                }
                None => {
                    let e = BackendError::StartFailed("backend notifications closed".into());
                    return Err(self.connect_failed(e));
                }
            }
        }

        self.transition(TunnelState::Connected);
        self.save_intent(ConnectionIntent::Connected);
        info!("VPN connected");
        Ok(())
    }

    fn connect_failed(&mut self, e: BackendError) -> CoordinatorError {
        error!("VPN connection failed: {}", e);
        self.transition(TunnelState::Disconnected);

        let err = CoordinatorError::ConnectFailed(e);
        self.publish_error(&err);
        err
    }

    async fn turn_off(&mut self) -> Result<(), CoordinatorError> {
        if let Some(parked) = self.suspended.take() {
            info!("Turn off cancels the turn on waiting for permission");
            let _ = parked.send(Err(CoordinatorError::Superseded));
        }

        if self.state.current() == TunnelState::Disconnected {
            debug!("Already disconnected");
            self.save_intent(ConnectionIntent::Disconnected);
            return Ok(());
        }

        info!("Disconnecting VPN");
        self.transition(TunnelState::Disconnecting);

        let result = match self.collaborators.backend.stop().await {
            Ok(()) => self.await_down().await,
            Err(e) => Err(e),
        };

        self.transition(TunnelState::Disconnected);
        self.save_intent(ConnectionIntent::Disconnected);

        match result {
            Ok(()) => {
                info!("VPN disconnected");
                Ok(())
            }
            Err(e) => {
                error!("VPN disconnect failed: {}", e);
                let err = CoordinatorError::DisconnectFailed(e);
                self.publish_error(&err);
                Err(err)
            }
        }
    }

    async fn await_down(&mut self) -> Result<(), BackendError> {
        loop {
            match self.notifications.recv().await {
                Some(BackendEvent::Down) => return Ok(()),
                Some(BackendEvent::Failed(e)) => return Err(e),
                Some(BackendEvent::Up) => debug!("Ignoring stale up while stopping"),
                None => return Err(BackendError::StopFailed("backend notifications closed".into())),
            }
        }
    }

    /// Backend event with no command in flight
    fn on_idle_event(&mut self, event: BackendEvent) {
        if !self.state.current().is_connected() {
            debug!("Ignoring backend event {:?} while {}", event, self.state.current());
            return;
        }

        match event {
            BackendEvent::Up => {}
            BackendEvent::Down => {
                warn!("VPN tunnel lost");
                self.lose_tunnel();
            }
            BackendEvent::Failed(e) => {
                warn!("VPN tunnel failed: {}", e);
                self.lose_tunnel();
                self.publish_error(&CoordinatorError::ConnectFailed(e));
            }
        }
    }

    fn lose_tunnel(&mut self) {
        self.transition(TunnelState::Disconnecting);
        self.transition(TunnelState::Disconnected);
        let _ = self.events.send(CoordinatorEvent::TunnelLost);
    }

    /// Build a config, or reuse the last one if its inputs are unchanged
    fn resolve_config(&mut self) -> Result<Arc<TunnelConfig>, ConfigError> {
        let device = self.collaborators.devices.device()
            .ok_or(ConfigError::MissingCredentials)?;
        let server = self.collaborators.servers.selected_server()
            .ok_or(ConfigError::NoServerSelected)?;

        if let Some(cached) = &self.cached {
            if cached.device == device && cached.server == server {
                debug!("Reusing tunnel config for {}", server.name);
                return Ok(cached.config.clone());
            }
        }

        let config = Arc::new(self.builder.build(&device, &server)?);
        debug!("Built tunnel config for {}", server.name);

        self.cached = Some(CachedConfig {
            device,
            server,
            config: config.clone(),
        });
        Ok(config)
    }

    fn transition(&self, next: TunnelState) {
        match self.state.advance(next) {
            Ok(()) => debug!("VPN state -> {}", next),
            Err(e) => error!("{}", e),
        }
    }

    fn save_intent(&self, intent: ConnectionIntent) {
        if let Err(e) = intent.save(self.collaborators.preferences.as_ref()) {
            warn!("Failed to persist connection intent: {}", e);
        }
    }

    fn publish_error(&self, err: &CoordinatorError) {
        let _ = self.events.send(CoordinatorEvent::Error(err.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{notification_channel, BackendNotifier};
    use crate::intent::{MemoryPreferences, CONNECTION_INTENT_KEY};
    use crate::provider::SharedPermission;
    use crate::settings::{ClientSettings, SettingsRepository};
    use crate::simulated::{SimulatedBackend, SimulatedOutcome};
    use std::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        coordinator: Coordinator,
        backend: Arc<SimulatedBackend>,
        notifier: BackendNotifier,
        settings: Arc<SettingsRepository>,
        permission: Arc<SharedPermission>,
        prefs: Arc<MemoryPreferences>,
    }

    async fn harness_with(
        manual: bool,
        granted: bool,
        prefs: MemoryPreferences,
    ) -> Harness {
        let (notifier, events) = notification_channel();
        let backend = if manual {
            SimulatedBackend::manual(notifier.clone())
        } else {
            SimulatedBackend::new(notifier.clone(), Duration::from_millis(5))
        };
        let backend = Arc::new(backend);

        let settings = Arc::new(SettingsRepository::new(ClientSettings::default_config()));
        let permission = Arc::new(SharedPermission::new(granted));
        let prefs = Arc::new(prefs);

        let collaborators = Collaborators {
            backend: backend.clone(),
            devices: settings.clone(),
            servers: settings.clone(),
            permission: permission.clone(),
            preferences: prefs.clone(),
        };
        let coordinator = Coordinator::spawn(collaborators, events, TunnelConfigBuilder::default()).await;

        Harness { coordinator, backend, notifier, settings, permission, prefs }
    }

    async fn harness() -> Harness {
        harness_with(false, true, MemoryPreferences::new()).await
    }

    async fn collect(stream: &mut StateStream, n: usize) -> Vec<TunnelState> {
        let mut seen = Vec::new();
        for _ in 0..n {
            let state = timeout(Duration::from_secs(2), stream.next()).await.unwrap().unwrap();
            seen.push(state);
        }
        seen
    }

    fn assert_graph(states: &[TunnelState]) {
        for pair in states.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "illegal {:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[tokio::test]
    async fn test_turn_on_and_off() {
        let h = harness().await;
        let mut states = h.coordinator.observe_state();

        h.coordinator.handle(Command::TurnOn).await.unwrap();
        assert_eq!(h.coordinator.current_state(), TunnelState::Connected);
        assert_eq!(h.prefs.get_bool(CONNECTION_INTENT_KEY), Some(true));

        h.coordinator.handle(Command::TurnOff).await.unwrap();
        assert_eq!(h.coordinator.current_state(), TunnelState::Disconnected);
        assert_eq!(h.prefs.get_bool(CONNECTION_INTENT_KEY), Some(false));

        let seen = collect(&mut states, 5).await;
        assert_eq!(seen, vec![
            TunnelState::Disconnected,
            TunnelState::Connecting,
            TunnelState::Connected,
            TunnelState::Disconnecting,
            TunnelState::Disconnected,
        ]);
        assert_graph(&seen);
        assert_eq!(h.backend.start_calls(), 1);
        assert_eq!(h.backend.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_state_only_changes_on_acknowledgment() {
        let h = harness_with(true, true, MemoryPreferences::new()).await;

        let coordinator = h.coordinator.clone();
        let turn_on = tokio::spawn(async move { coordinator.handle(Command::TurnOn).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.coordinator.current_state(), TunnelState::Connecting);
        assert_eq!(h.backend.start_calls(), 1);

        h.notifier.notify(BackendEvent::Up);
        turn_on.await.unwrap().unwrap();
        assert_eq!(h.coordinator.current_state(), TunnelState::Connected);
    }

    #[tokio::test]
    async fn test_permission_required_before_connect() {
        let h = harness_with(false, false, MemoryPreferences::new()).await;
        let mut events = h.coordinator.subscribe_events();

        let coordinator = h.coordinator.clone();
        let turn_on = tokio::spawn(async move { coordinator.handle(Command::TurnOn).await });

        assert_eq!(events.recv().await.unwrap(), CoordinatorEvent::PermissionRequired);
        assert_eq!(h.permission.requests(), 1);
        assert_eq!(h.coordinator.current_state(), TunnelState::Disconnected);
        assert_eq!(h.backend.start_calls(), 0);

        h.coordinator.handle(Command::PermissionGranted).await.unwrap();
        turn_on.await.unwrap().unwrap();

        assert_eq!(h.coordinator.current_state(), TunnelState::Connected);
        assert_eq!(h.backend.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let h = harness_with(false, false, MemoryPreferences::new()).await;
        let mut events = h.coordinator.subscribe_events();

        let coordinator = h.coordinator.clone();
        let turn_on = tokio::spawn(async move { coordinator.handle(Command::TurnOn).await });
        assert_eq!(events.recv().await.unwrap(), CoordinatorEvent::PermissionRequired);

        assert_eq!(
            h.coordinator.handle(Command::PermissionDenied).await,
            Err(CoordinatorError::PermissionRefused)
        );
        assert_eq!(turn_on.await.unwrap(), Err(CoordinatorError::PermissionRefused));
        assert_eq!(
            events.recv().await.unwrap(),
            CoordinatorEvent::Error(CoordinatorError::PermissionRefused)
        );

        assert_eq!(h.coordinator.current_state(), TunnelState::Disconnected);
        assert_eq!(h.backend.start_calls(), 0);
        assert_eq!(h.prefs.get_bool(CONNECTION_INTENT_KEY), None);
    }

    #[tokio::test]
    async fn test_turn_off_supersedes_waiting_turn_on() {
        let h = harness_with(false, false, MemoryPreferences::new()).await;
        let mut events = h.coordinator.subscribe_events();

        let coordinator = h.coordinator.clone();
        let turn_on = tokio::spawn(async move { coordinator.handle(Command::TurnOn).await });
        assert_eq!(events.recv().await.unwrap(), CoordinatorEvent::PermissionRequired);

        h.coordinator.handle(Command::TurnOff).await.unwrap();
        assert_eq!(turn_on.await.unwrap(), Err(CoordinatorError::Superseded));

        // Late answer has nothing to resume
        h.coordinator.handle(Command::PermissionGranted).await.unwrap();
        assert_eq!(h.coordinator.current_state(), TunnelState::Disconnected);
        assert_eq!(h.backend.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_turn_on() {
        let h = harness().await;

        let (first, second) = tokio::join!(
            h.coordinator.handle(Command::TurnOn),
            h.coordinator.handle(Command::TurnOn),
        );

        assert_eq!(first, Ok(()));
        assert_eq!(second, Err(CoordinatorError::AlreadyInProgress));
        assert_eq!(h.backend.start_calls(), 1);

        // Once settled the same command is accepted again, as a no-op
        h.coordinator.handle(Command::TurnOn).await.unwrap();
        assert_eq!(h.backend.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_turn_off_while_stopping() {
        let h = harness_with(true, true, MemoryPreferences::new()).await;

        let on = h.coordinator.clone();
        let turn_on = tokio::spawn(async move { on.handle(Command::TurnOn).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.notifier.notify(BackendEvent::Up);
        turn_on.await.unwrap().unwrap();

        let off = h.coordinator.clone();
        let turn_off = tokio::spawn(async move { off.handle(Command::TurnOff).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.coordinator.current_state(), TunnelState::Disconnecting);

        assert_eq!(
            h.coordinator.handle(Command::TurnOff).await,
            Err(CoordinatorError::AlreadyInProgress)
        );

        h.notifier.notify(BackendEvent::Down);
        turn_off.await.unwrap().unwrap();
        assert_eq!(h.coordinator.current_state(), TunnelState::Disconnected);
        assert_eq!(h.backend.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_system_restart() {
        let prefs = MemoryPreferences::new();
        ConnectionIntent::Connected.save(&prefs).unwrap();
        let h = harness_with(true, true, prefs).await;

        let first = h.coordinator.clone();
        let restart = tokio::spawn(async move { first.handle(Command::SystemRestart).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.coordinator.current_state(), TunnelState::Connecting);

        assert_eq!(
            h.coordinator.handle(Command::SystemRestart).await,
            Err(CoordinatorError::AlreadyInProgress)
        );

        h.notifier.notify(BackendEvent::Up);
        restart.await.unwrap().unwrap();
        assert_eq!(h.coordinator.current_state(), TunnelState::Connected);
        assert_eq!(h.backend.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_turn_on_rejected_while_waiting_for_permission() {
        let prefs = MemoryPreferences::new();
        ConnectionIntent::Connected.save(&prefs).unwrap();
        let h = harness_with(false, false, prefs).await;
        let mut events = h.coordinator.subscribe_events();

        let coordinator = h.coordinator.clone();
        let turn_on = tokio::spawn(async move { coordinator.handle(Command::TurnOn).await });
        assert_eq!(events.recv().await.unwrap(), CoordinatorEvent::PermissionRequired);

        // Same command is refused before reaching the worker
        assert_eq!(
            h.coordinator.handle(Command::TurnOn).await,
            Err(CoordinatorError::AlreadyInProgress)
        );
        // A restart reaches the worker and finds the parked turn on
        assert_eq!(
            h.coordinator.handle(Command::SystemRestart).await,
            Err(CoordinatorError::AlreadyInProgress)
        );
        assert_eq!(h.permission.requests(), 1);

        h.coordinator.handle(Command::PermissionGranted).await.unwrap();
        turn_on.await.unwrap().unwrap();
        assert_eq!(h.coordinator.current_state(), TunnelState::Connected);
        assert_eq!(h.backend.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_system_restart_waits_for_permission() {
        let prefs = MemoryPreferences::new();
        ConnectionIntent::Connected.save(&prefs).unwrap();
        let h = harness_with(false, false, prefs).await;
        let mut events = h.coordinator.subscribe_events();
        let mut states = h.coordinator.observe_state();

        let coordinator = h.coordinator.clone();
        let restart = tokio::spawn(async move { coordinator.handle(Command::SystemRestart).await });

        assert_eq!(events.recv().await.unwrap(), CoordinatorEvent::PermissionRequired);
        assert_eq!(h.permission.requests(), 1);
        assert_eq!(h.coordinator.current_state(), TunnelState::Disconnected);
        assert_eq!(h.backend.start_calls(), 0);

        h.coordinator.handle(Command::PermissionGranted).await.unwrap();
        restart.await.unwrap().unwrap();

        let seen = collect(&mut states, 3).await;
        assert_eq!(seen, vec![
            TunnelState::Disconnected,
            TunnelState::Connecting,
            TunnelState::Connected,
        ]);
        assert_eq!(h.backend.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_turn_off_queued_behind_turn_on() {
        let h = harness_with(true, true, MemoryPreferences::new()).await;
        let mut states = h.coordinator.observe_state();

        let on = h.coordinator.clone();
        let turn_on = tokio::spawn(async move { on.handle(Command::TurnOn).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let off = h.coordinator.clone();
        let turn_off = tokio::spawn(async move { off.handle(Command::TurnOff).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Still waiting for the handshake, stop not issued yet
        assert_eq!(h.backend.stop_calls(), 0);
        assert_eq!(h.coordinator.current_state(), TunnelState::Connecting);

        h.notifier.notify(BackendEvent::Up);
        turn_on.await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.backend.stop_calls(), 1);
        h.notifier.notify(BackendEvent::Down);
        turn_off.await.unwrap().unwrap();

        let seen = collect(&mut states, 5).await;
        assert_eq!(seen.last(), Some(&TunnelState::Disconnected));
        assert_graph(&seen);
        assert_eq!(h.prefs.get_bool(CONNECTION_INTENT_KEY), Some(false));
    }

    #[tokio::test]
    async fn test_system_restart_with_intent() {
        let prefs = MemoryPreferences::new();
        ConnectionIntent::Connected.save(&prefs).unwrap();
        let h = harness_with(false, true, prefs).await;

        h.coordinator.handle(Command::SystemRestart).await.unwrap();

        assert_eq!(h.coordinator.current_state(), TunnelState::Connected);
        assert_eq!(h.backend.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_system_restart_without_intent() {
        let prefs = MemoryPreferences::new();
        ConnectionIntent::Disconnected.save(&prefs).unwrap();
        let h = harness_with(false, true, prefs).await;

        h.coordinator.handle(Command::SystemRestart).await.unwrap();

        assert_eq!(h.coordinator.current_state(), TunnelState::Disconnected);
        assert_eq!(h.backend.start_calls(), 0);
        assert_eq!(h.backend.stop_calls(), 0);
    }

    #[tokio::test]
    async fn test_start_failure_reported_once() {
        for outcome in [SimulatedOutcome::RejectStart, SimulatedOutcome::FailHandshake, SimulatedOutcome::TimeOut] {
            let h = harness().await;
            h.backend.set_outcome(outcome).await;

            let mut states = h.coordinator.observe_state();
            let mut events = h.coordinator.subscribe_events();

            let result = h.coordinator.handle(Command::TurnOn).await;
            assert!(matches!(result, Err(CoordinatorError::ConnectFailed(_))), "{:?}", outcome);
            if outcome == SimulatedOutcome::TimeOut {
                assert_eq!(result, Err(CoordinatorError::ConnectFailed(BackendError::Timeout)));
            }

            let seen = collect(&mut states, 3).await;
            assert_eq!(seen, vec![
                TunnelState::Disconnected,
                TunnelState::Connecting,
                TunnelState::Disconnected,
            ]);

            assert!(matches!(
                events.recv().await.unwrap(),
                CoordinatorEvent::Error(CoordinatorError::ConnectFailed(_))
            ));
            assert!(events.try_recv().is_err());

            // Nothing further is published
            assert!(timeout(Duration::from_millis(30), states.next()).await.is_err());
            assert_eq!(h.prefs.get_bool(CONNECTION_INTENT_KEY), None);
        }
    }

    #[tokio::test]
    async fn test_missing_credentials_never_reach_backend() {
        let h = harness().await;
        h.settings.set_device(Some(DeviceRecord {
            address: "10.64.0.2/32".to_string(),
            private_key: None,
        }));

        assert_eq!(
            h.coordinator.handle(Command::TurnOn).await,
            Err(CoordinatorError::Config(ConfigError::MissingCredentials))
        );
        assert_eq!(h.coordinator.current_state(), TunnelState::Disconnected);
        assert_eq!(h.backend.start_calls(), 0);

        h.settings.set_device(None);
        assert_eq!(
            h.coordinator.handle(Command::TurnOn).await,
            Err(CoordinatorError::Config(ConfigError::MissingCredentials))
        );
        assert_eq!(h.backend.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_config_rebuilt_when_server_changes() {
        let h = harness().await;

        h.coordinator.handle(Command::TurnOn).await.unwrap();
        let first = h.backend.last_config().await.unwrap();
        h.coordinator.handle(Command::TurnOff).await.unwrap();

        h.coordinator.handle(Command::TurnOn).await.unwrap();
        let same = h.backend.last_config().await.unwrap();
        assert_eq!(first, same);
        h.coordinator.handle(Command::TurnOff).await.unwrap();

        h.settings.select_server("fallback").unwrap();
        h.coordinator.handle(Command::TurnOn).await.unwrap();
        let switched = h.backend.last_config().await.unwrap();

        assert_ne!(first, switched);
        assert_eq!(switched.peers()[0].endpoint.to_string(), "103.231.88.2:32768");
    }

    #[tokio::test]
    async fn test_idle_tunnel_loss() {
        let h = harness().await;
        h.coordinator.handle(Command::TurnOn).await.unwrap();

        let mut states = h.coordinator.observe_state();
        let mut events = h.coordinator.subscribe_events();

        h.backend.drop_tunnel().await;

        let seen = collect(&mut states, 3).await;
        assert_eq!(seen, vec![
            TunnelState::Connected,
            TunnelState::Disconnecting,
            TunnelState::Disconnected,
        ]);
        assert_eq!(events.recv().await.unwrap(), CoordinatorEvent::TunnelLost);

        // Intent survives so an always-on restart reconnects
        assert_eq!(h.prefs.get_bool(CONNECTION_INTENT_KEY), Some(true));
    }

    #[tokio::test]
    async fn test_startup_adopts_backend_state() {
        let (notifier, events) = notification_channel();
        let backend = Arc::new(SimulatedBackend::new(notifier, Duration::from_millis(5)));
        backend.set_reported_state(TunnelState::Connected).await;

        let settings = Arc::new(SettingsRepository::new(ClientSettings::default_config()));
        let collaborators = Collaborators {
            backend: backend.clone(),
            devices: settings.clone(),
            servers: settings,
            permission: Arc::new(SharedPermission::new(true)),
            preferences: Arc::new(MemoryPreferences::new()),
        };
        let coordinator = Coordinator::spawn(collaborators, events, TunnelConfigBuilder::default()).await;

        assert_eq!(coordinator.current_state(), TunnelState::Connected);
        coordinator.handle(Command::TurnOn).await.unwrap();
        assert_eq!(backend.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_stop_failure_ends_disconnected() {
        let h = harness_with(true, true, MemoryPreferences::new()).await;

        let coordinator = h.coordinator.clone();
        let turn_on = tokio::spawn(async move { coordinator.handle(Command::TurnOn).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.notifier.notify(BackendEvent::Up);
        turn_on.await.unwrap().unwrap();

        let coordinator = h.coordinator.clone();
        let turn_off = tokio::spawn(async move { coordinator.handle(Command::TurnOff).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = BackendError::StopFailed("engine wedged".into());
        h.notifier.notify(BackendEvent::Failed(err.clone()));

        assert_eq!(turn_off.await.unwrap(), Err(CoordinatorError::DisconnectFailed(err)));
        assert_eq!(h.coordinator.current_state(), TunnelState::Disconnected);
        assert_eq!(h.prefs.get_bool(CONNECTION_INTENT_KEY), Some(false));
    }

    #[tokio::test]
    async fn test_random_command_sequences_respect_graph() {
        use rand::Rng;

        let h = harness().await;
        let mut states = h.coordinator.observe_state();
        let mut rng = rand::thread_rng();

        let commands = [Command::TurnOn, Command::TurnOff, Command::SystemRestart];
        let mut published = 1;
        for _ in 0..25 {
            let before = h.coordinator.current_state();
            let command = commands[rng.gen_range(0..commands.len())];
            let _ = h.coordinator.handle(command).await;
            let after = h.coordinator.current_state();
            if before != after {
                published += 2;
            }
        }

        let seen = collect(&mut states, published).await;
        assert_graph(&seen);
    }
}
