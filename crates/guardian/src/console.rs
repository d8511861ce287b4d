//! Line-oriented control console.
//!
//! Stands in for the switch, the permission prompt and the OS start
//! command so the coordinator can be driven from a terminal.

use guardian_vpn::{Signal, COMMAND_TURN_OFF, COMMAND_TURN_ON};

/// One console line, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Forward to the dispatcher
    Signal(Signal),
    /// Print the current tunnel state
    Status,
    /// Print the wg-quick config for the current selection
    Config,
    /// Select another server
    Server(String),
    /// Make the simulated engine lose the tunnel
    Drop,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  on | off            flip the VPN switch
  start [turn_on|turn_off]
                      service start command (no argument = always-on restart)
  grant | deny        answer the permission prompt
  server <name>       select a server
  status              show tunnel state
  config              print the wg-quick config
  drop                simulate losing the tunnel
  quit";

impl ConsoleCommand {
    /// `None` for blank lines.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Ok(None);
        };
        let arg = words.next();

        let command = match (head.to_ascii_lowercase().as_str(), arg) {
            ("on", None) => Self::Signal(Signal::Toggle { on: true }),
            ("off", None) => Self::Signal(Signal::Toggle { on: false }),
            ("start", extra) => match extra {
                None | Some(COMMAND_TURN_ON) | Some(COMMAND_TURN_OFF) => {
                    Self::Signal(Signal::StartCommand(extra.map(str::to_string)))
                }
                Some(other) => return Err(format!("unknown start command: {}", other)),
            },
            ("grant", None) => Self::Signal(Signal::PermissionResult { granted: true }),
            ("deny", None) => Self::Signal(Signal::PermissionResult { granted: false }),
            ("server", Some(name)) => Self::Server(name.to_string()),
            ("server", None) => return Err("usage: server <name>".to_string()),
            ("status", None) => Self::Status,
            ("config", None) => Self::Config,
            ("drop", None) => Self::Drop,
            ("help" | "?", None) => Self::Help,
            ("quit" | "exit", None) => Self::Quit,
            _ => return Err(format!("unrecognized: {}", line.trim())),
        };

        Ok(Some(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(ConsoleCommand::parse("  "), Ok(None));
        assert_eq!(
            ConsoleCommand::parse("ON"),
            Ok(Some(ConsoleCommand::Signal(Signal::Toggle { on: true })))
        );
        assert_eq!(
            ConsoleCommand::parse("start"),
            Ok(Some(ConsoleCommand::Signal(Signal::StartCommand(None))))
        );
        assert_eq!(
            ConsoleCommand::parse("start turn_off"),
            Ok(Some(ConsoleCommand::Signal(Signal::StartCommand(Some("turn_off".into())))))
        );
        assert_eq!(
            ConsoleCommand::parse("deny"),
            Ok(Some(ConsoleCommand::Signal(Signal::PermissionResult { granted: false })))
        );
        assert_eq!(
            ConsoleCommand::parse("server fallback"),
            Ok(Some(ConsoleCommand::Server("fallback".into())))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(ConsoleCommand::parse("server").is_err());
        assert!(ConsoleCommand::parse("start reboot").is_err());
        assert!(ConsoleCommand::parse("on now").is_err());
        assert!(ConsoleCommand::parse("launch").is_err());
    }
}
