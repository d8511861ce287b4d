//! Guardian: VPN tunnel lifecycle daemon
//!
//! Loads the client settings, wires the coordinator to the simulated
//! tunnel engine, replays the OS start signal (so a persisted connect
//! intent reconnects on its own) and then takes commands on stdin.

mod console;

use anyhow::{Context, Result};
use console::{ConsoleCommand, HELP};
use guardian_vpn::{
    notification_channel, ClientSettings, Collaborators, CommandDispatcher, Coordinator,
    CoordinatorEvent, DeviceRepository, JsonFilePreferences, ServerRepository, ServiceHost,
    SettingsRepository, SharedPermission, Signal, SimulatedBackend, TunnelConfigBuilder,
};
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Logs foreground changes; a desktop process has nothing else to do
struct ConsoleHost;

impl ServiceHost for ConsoleHost {
    fn enter_foreground(&self) {
        info!("Service entering foreground");
    }

    fn leave_foreground(&self) {
        info!("Service leaving foreground");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let settings = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => ClientSettings::from_file(&path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => {
            info!("No settings file given, using defaults with a fresh device key");
            ClientSettings::default_config()
        }
    };

    info!("Guardian starting...");

    let preferences = JsonFilePreferences::open(settings.preferences_path.clone())
        .with_context(|| format!("opening preferences at {}", settings.preferences_path.display()))?;
    let (notifier, events) = notification_channel();
    let backend = Arc::new(
        SimulatedBackend::new(notifier, settings.backend.handshake())
            .with_outcome(settings.backend.outcome),
    );
    let permission = Arc::new(SharedPermission::new(settings.permission_granted));
    let builder = TunnelConfigBuilder::new(settings.dns.clone());
    let repository = Arc::new(SettingsRepository::new(settings));

    let collaborators = Collaborators {
        backend: backend.clone(),
        devices: repository.clone(),
        servers: repository.clone(),
        permission: permission.clone(),
        preferences: Arc::new(preferences),
    };
    let coordinator = Coordinator::spawn(collaborators, events, builder.clone()).await;
    spawn_observers(&coordinator);

    let dispatcher = CommandDispatcher::new(coordinator.clone(), Arc::new(ConsoleHost));

    // Started without an explicit command, as the OS does for always-on
    if let Err(e) = dispatcher.dispatch(Signal::StartCommand(None)).await {
        warn!("Startup reconnect failed: {}", e);
    }

    let signals = spawn_forwarder(dispatcher);

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let command = match ConsoleCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(msg) => {
                println!("{}", msg);
                continue;
            }
        };

        match command {
            ConsoleCommand::Signal(signal) => {
                if let Signal::PermissionResult { granted } = signal {
                    permission.set_granted(granted);
                }

                if signals.send(signal).is_err() {
                    warn!("Signal forwarder stopped");
                    break;
                }
            }
            ConsoleCommand::Status => println!("{}", coordinator.current_state()),
            ConsoleCommand::Config => {
                let device = repository.device();
                let server = repository.selected_server();
                match (device, server) {
                    (Some(device), Some(server)) => match builder.build(&device, &server) {
                        Ok(config) => print!("{}", config.to_wg_quick()),
                        Err(e) => println!("error: {}", e),
                    },
                    (None, _) => println!("error: no device registered"),
                    (_, None) => println!("error: no server selected"),
                }
            }
            ConsoleCommand::Server(name) => {
                if let Err(e) = repository.select_server(&name) {
                    println!("error: {}", e);
                }
            }
            ConsoleCommand::Drop => backend.drop_tunnel().await,
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Quit => break,
        }
    }

    info!("Guardian shutting down ({})", coordinator.current_state());
    Ok(())
}

/// Forward console signals in line order without waiting on each outcome
///
/// A newly queued dispatch is polled up to the coordinator's queue before
/// the next signal is taken, so a turn on parked on the permission prompt
/// never holds back the `grant` that resumes it.
fn spawn_forwarder(dispatcher: CommandDispatcher) -> mpsc::UnboundedSender<Signal> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Signal>();

    tokio::spawn(async move {
        let mut running = FuturesUnordered::new();

        loop {
            tokio::select! {
                biased;

                Some(result) = running.next(), if !running.is_empty() => {
                    if let Err(e) = result {
                        println!("error: {}", e);
                    }
                }

                signal = rx.recv() => match signal {
                    Some(signal) => {
                        let dispatcher = dispatcher.clone();
                        running.push(async move { dispatcher.dispatch(signal).await });
                    }
                    None => break,
                },
            }
        }
    });

    tx
}

fn spawn_observers(coordinator: &Coordinator) {
    let mut states = coordinator.observe_state();
    tokio::spawn(async move {
        while let Some(state) = states.next().await {
            println!("state: {}", state);
        }
    });

    let mut events = coordinator.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CoordinatorEvent::PermissionRequired) => {
                    println!("VPN permission required: answer with 'grant' or 'deny'");
                }
                Ok(CoordinatorEvent::TunnelLost) => println!("tunnel lost"),
                Ok(CoordinatorEvent::Error(e)) => error!("{}", e),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event observer lagged, skipped {}", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
