//! Tunnel config builder
//!
//! Turns the registered device and the selected server into a
//! [`TunnelConfig`]. Building is pure: no I/O, no hidden state, the
//! same inputs always give an equal config.

use crate::config::{Cidr, Endpoint, InterfaceConfig, Peer, TunnelConfig};
use crate::keys::{KeyError, PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Keepalive used when a server does not specify one (seconds)
pub const DEFAULT_KEEPALIVE: u16 = 60;

/// The registered device as the account backend knows it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Address assigned to this device inside the tunnel (`ip` or `ip/prefix`)
    pub address: String,
    /// Base64 private key, absent until the device has registered a key pair
    #[serde(default)]
    pub private_key: Option<String>,
}

/// One VPN server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub name: String,
    /// Base64 WireGuard public key
    pub public_key: String,
    /// `ip:port`
    pub endpoint: String,
    #[serde(default)]
    pub keepalive: Option<u16>,
    /// CIDR ranges routed to this server; empty means everything
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

/// Config building errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Device has no registered key pair")]
    MissingCredentials,

    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    #[error("Invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("Invalid server endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("No server selected")]
    NoServerSelected,
}

/// Builds tunnel configs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfigBuilder {
    dns: Vec<IpAddr>,
}

impl TunnelConfigBuilder {
    pub fn new(dns: Vec<IpAddr>) -> Self {
        Self { dns }
    }

    pub fn dns(&self) -> &[IpAddr] {
        &self.dns
    }

    /// Build the config for `device` talking to `server`.
    pub fn build(&self, device: &DeviceRecord, server: &ServerRecord) -> Result<TunnelConfig, ConfigError> {
        let private_key = match device.private_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => key.parse::<PrivateKey>()?,
            _ => return Err(ConfigError::MissingCredentials),
        };

        let address: Cidr = device.address.parse()
            .map_err(|_| ConfigError::InvalidAddress(device.address.clone()))?;

        let interface = InterfaceConfig {
            private_key,
            address,
            dns: self.dns.clone(),
        };

        Ok(TunnelConfig::new(interface, vec![Self::peer(server)?]))
    }

    fn peer(server: &ServerRecord) -> Result<Peer, ConfigError> {
        let public_key = server.public_key.parse::<PublicKey>()?;
        let endpoint: Endpoint = server.endpoint.parse()
            .map_err(|_| ConfigError::InvalidEndpoint(server.endpoint.clone()))?;

        let allowed_ips = if server.allowed_ips.is_empty() {
            vec![Cidr::default_v4()]
        } else {
            server.allowed_ips.iter()
                .map(|s| s.parse::<Cidr>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ConfigError::InvalidAddress(e.0))?
        };

        Ok(Peer {
            public_key,
            endpoint,
            allowed_ips,
            keepalive: Some(server.keepalive.unwrap_or(DEFAULT_KEEPALIVE)),
        })
    }
}

impl Default for TunnelConfigBuilder {
    /// Cloudflare resolver inside the tunnel
    fn default() -> Self {
        Self::new(vec![IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))])
    }
}
