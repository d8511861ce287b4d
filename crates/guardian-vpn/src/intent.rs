//! Persisted connection intent
//!
//! Whether the user last wanted the tunnel up. It survives process
//! restarts so an always-on restart knows whether to reconnect.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Preference key holding the intent
pub const CONNECTION_INTENT_KEY: &str = "vpn_connection_intent";

/// Process-wide key-value preferences
pub trait PreferenceStore: Send + Sync {
    fn get_bool(&self, key: &str) -> Option<bool>;

    fn set_bool(&self, key: &str, value: bool) -> Result<(), PreferenceError>;
}

/// Preference errors
#[derive(Debug, thiserror::Error)]
pub enum PreferenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Should the tunnel be up?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionIntent {
    Connected,
    #[default]
    Disconnected,
}

impl ConnectionIntent {
    /// Read from `prefs`; missing means disconnected
    pub fn load(prefs: &dyn PreferenceStore) -> Self {
        match prefs.get_bool(CONNECTION_INTENT_KEY) {
            Some(true) => ConnectionIntent::Connected,
            _ => ConnectionIntent::Disconnected,
        }
    }

    pub fn save(self, prefs: &dyn PreferenceStore) -> Result<(), PreferenceError> {
        prefs.set_bool(CONNECTION_INTENT_KEY, self == ConnectionIntent::Connected)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Preferences that live only as long as the process
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: Mutex<HashMap<String, bool>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get_bool(&self, key: &str) -> Option<bool> {
        lock(&self.values).get(key).copied()
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), PreferenceError> {
        lock(&self.values).insert(key.to_string(), value);
        Ok(())
    }
}

/// Preferences persisted as a flat JSON object
#[derive(Debug)]
pub struct JsonFilePreferences {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl JsonFilePreferences {
    /// Open `path`, starting empty if it does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PreferenceError> {
        let path = path.into();

        let values = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Map::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No preferences at {}, starting empty", path.display());
                Map::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &Map<String, Value>) -> Result<(), PreferenceError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        // Readers only ever see a complete file
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(values)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl PreferenceStore for JsonFilePreferences {
    fn get_bool(&self, key: &str) -> Option<bool> {
        let values = lock(&self.values);
        match values.get(key) {
            Some(Value::Bool(b)) => Some(*b),
            Some(other) => {
                warn!("Preference {} is not a boolean: {}", key, other);
                None
            }
            None => None,
        }
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), PreferenceError> {
        let mut values = lock(&self.values);
        values.insert(key.to_string(), Value::Bool(value));
        self.persist(&values)
    }
}
