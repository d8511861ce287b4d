//! Client settings file
//!
//! Device credentials, the server list and the current selection, in
//! TOML or JSON. [`SettingsRepository`] serves them to the coordinator
//! and lets the selection change at runtime.

use crate::builder::{DeviceRecord, ServerRecord, DEFAULT_KEEPALIVE};
use crate::keys::PrivateKey;
use crate::provider::{DeviceRepository, ServerRepository};
use crate::simulated::SimulatedOutcome;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::info;

/// Simulated engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Fake handshake duration
    #[serde(default = "default_handshake_ms")]
    pub handshake_ms: u64,
    #[serde(default)]
    pub outcome: SimulatedOutcome,
}

fn default_handshake_ms() -> u64 {
    300
}

impl BackendSettings {
    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            handshake_ms: default_handshake_ms(),
            outcome: SimulatedOutcome::default(),
        }
    }
}

/// Settings file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Registered device, absent before login
    #[serde(default)]
    pub device: Option<DeviceRecord>,
    /// DNS servers used inside the tunnel
    #[serde(default = "default_dns")]
    pub dns: Vec<IpAddr>,
    pub servers: Vec<ServerRecord>,
    /// Name of the server to connect to
    #[serde(default)]
    pub selected_server: Option<String>,
    /// Start with the OS VPN permission already granted
    #[serde(default)]
    pub permission_granted: bool,
    /// Where the connection intent is persisted
    #[serde(default = "default_preferences_path")]
    pub preferences_path: PathBuf,
    #[serde(default)]
    pub backend: BackendSettings,
}

fn default_dns() -> Vec<IpAddr> {
    vec![IpAddr::from([1, 1, 1, 1])]
}

fn default_preferences_path() -> PathBuf {
    PathBuf::from("guardian-preferences.json")
}

impl ClientSettings {
    /// Load by file extension (`.toml` or `.json`)
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let ext = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        let content = std::fs::read_to_string(path)?;

        let settings = match ext {
            "toml" => Self::from_toml(&content)?,
            "json" => Self::from_json(&content)?,
            _ => return Err(SettingsError::UnsupportedFormat),
        };

        info!("Loaded settings with {} servers from {}", settings.servers.len(), path.display());
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json(content: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// A freshly keyed device and the two stock exit servers
    pub fn default_config() -> Self {
        Self {
            device: Some(DeviceRecord {
                address: "10.64.0.2/32".to_string(),
                private_key: Some(PrivateKey::generate().to_base64()),
            }),
            dns: default_dns(),
            servers: vec![
                ServerRecord {
                    name: "primary".to_string(),
                    public_key: "Wy2FhqDJcZU03O/D9IUG/U5BL0PLbF06nvsfgIwrmGk=".to_string(),
                    endpoint: "185.232.22.58:32768".to_string(),
                    keepalive: Some(DEFAULT_KEEPALIVE),
                    allowed_ips: vec!["0.0.0.0/0".to_string()],
                },
                ServerRecord {
                    name: "fallback".to_string(),
                    public_key: "Rzh64qPcg8W8klJq0H4EZdVCH7iaPuQ9falc99GTgRA=".to_string(),
                    endpoint: "103.231.88.2:32768".to_string(),
                    keepalive: Some(DEFAULT_KEEPALIVE),
                    allowed_ips: vec!["0.0.0.0/0".to_string()],
                },
            ],
            selected_server: Some("primary".to_string()),
            permission_granted: false,
            preferences_path: default_preferences_path(),
            backend: BackendSettings::default(),
        }
    }

    pub fn find_server(&self, name: &str) -> Option<&ServerRecord> {
        self.servers.iter().find(|s| s.name == name)
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported settings format")]
    UnsupportedFormat,

    #[error("Unknown server: {0}")]
    UnknownServer(String),
}

/// Settings-backed device and server repository
#[derive(Debug)]
pub struct SettingsRepository {
    settings: RwLock<ClientSettings>,
}

impl SettingsRepository {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    pub fn snapshot(&self) -> ClientSettings {
        self.settings.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Change the server used by the next connection
    pub fn select_server(&self, name: &str) -> Result<(), SettingsError> {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        if settings.find_server(name).is_none() {
            return Err(SettingsError::UnknownServer(name.to_string()));
        }

        info!("Selected server {}", name);
        settings.selected_server = Some(name.to_string());
        Ok(())
    }

    /// Replace the registered device (`None` after logout)
    pub fn set_device(&self, device: Option<DeviceRecord>) {
        self.settings.write().unwrap_or_else(PoisonError::into_inner).device = device;
    }
}

impl DeviceRepository for SettingsRepository {
    fn device(&self) -> Option<DeviceRecord> {
        self.settings.read().unwrap_or_else(PoisonError::into_inner).device.clone()
    }
}

impl ServerRepository for SettingsRepository {
    fn selected_server(&self) -> Option<ServerRecord> {
        let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
        let name = settings.selected_server.as_deref()?;
        settings.find_server(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
selected_server = "fallback"
permission_granted = true
preferences_path = "/tmp/guardian/prefs.json"

[device]
address = "10.67.44.12/32"
private_key = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk="

[[servers]]
name = "primary"
public_key = "Wy2FhqDJcZU03O/D9IUG/U5BL0PLbF06nvsfgIwrmGk="
endpoint = "185.232.22.58:32768"

[[servers]]
name = "fallback"
public_key = "Rzh64qPcg8W8klJq0H4EZdVCH7iaPuQ9falc99GTgRA="
endpoint = "103.231.88.2:32768"
keepalive = 25

[backend]
handshake_ms = 50
outcome = "fail_handshake"
"#;

    #[test]
    fn test_parse_toml() {
        let settings = ClientSettings::from_toml(SAMPLE).unwrap();

        assert_eq!(settings.servers.len(), 2);
        assert_eq!(settings.dns, default_dns());
        assert!(settings.permission_granted);
        assert_eq!(settings.backend.handshake(), Duration::from_millis(50));
        assert_eq!(settings.backend.outcome, SimulatedOutcome::FailHandshake);
        assert_eq!(settings.find_server("fallback").unwrap().keepalive, Some(25));
    }

    #[test]
    fn test_default_toml_roundtrip() {
        let settings = ClientSettings::default_config();
        let parsed = ClientSettings::from_toml(&settings.to_toml().unwrap()).unwrap();

        assert_eq!(parsed.servers, settings.servers);
        assert_eq!(parsed.device, settings.device);
    }

    #[test]
    fn test_from_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("guardian.toml");
        std::fs::write(&toml_path, SAMPLE).unwrap();
        assert_eq!(ClientSettings::from_file(&toml_path).unwrap().servers.len(), 2);

        let json_path = dir.path().join("guardian.json");
        let json = serde_json::to_string(&ClientSettings::default_config()).unwrap();
        std::fs::write(&json_path, json).unwrap();
        assert_eq!(ClientSettings::from_file(&json_path).unwrap().servers.len(), 2);

        let other = dir.path().join("guardian.ini");
        std::fs::write(&other, "").unwrap();
        assert!(matches!(ClientSettings::from_file(&other), Err(SettingsError::UnsupportedFormat)));
    }

    #[test]
    fn test_load_errors_keep_their_source() {
        use std::error::Error as _;

        let dir = tempfile::tempdir().unwrap();

        let missing = ClientSettings::from_file(&dir.path().join("absent.toml")).unwrap_err();
        match &missing {
            SettingsError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("expected Io, got {:?}", other),
        }
        assert!(missing.source().is_some());

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "selected_server = [").unwrap();
        assert!(matches!(ClientSettings::from_file(&broken), Err(SettingsError::Toml(_))));

        let json = dir.path().join("broken.json");
        std::fs::write(&json, "{ \"dns\": 7 }").unwrap();
        assert!(matches!(ClientSettings::from_file(&json), Err(SettingsError::Json(_))));
    }

    #[test]
    fn test_repository_selection() {
        let repo = SettingsRepository::new(ClientSettings::from_toml(SAMPLE).unwrap());
        assert_eq!(repo.selected_server().unwrap().name, "fallback");

        repo.select_server("primary").unwrap();
        assert_eq!(repo.selected_server().unwrap().name, "primary");

        assert!(matches!(
            repo.select_server("nowhere"),
            Err(SettingsError::UnknownServer(name)) if name == "nowhere"
        ));
        assert_eq!(repo.selected_server().unwrap().name, "primary");
    }

    #[test]
    fn test_repository_device() {
        let repo = SettingsRepository::new(ClientSettings::default_config());
        assert!(repo.device().is_some());

        repo.set_device(None);
        assert!(repo.device().is_none());
    }
}
