//! Tunnel Configuration
//!
//! Immutable description of one tunnel: the local interface plus an
//! ordered list of peers. Values here are only ever produced by
//! [`TunnelConfigBuilder`](crate::TunnelConfigBuilder).

use crate::keys::{PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Network endpoint (IP + port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddr = s.trim().parse()?;
        Ok(Self::new(addr.ip(), addr.port()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

/// Address with prefix length, e.g. `10.64.0.2/32`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl Cidr {
    pub fn new(addr: IpAddr, prefix: u8) -> Option<Self> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        (prefix <= max).then_some(Self { addr, prefix })
    }

    /// Host route for a single address
    pub fn host(addr: IpAddr) -> Self {
        let prefix = if addr.is_ipv4() { 32 } else { 128 };
        Self { addr, prefix }
    }

    /// `0.0.0.0/0`
    pub fn default_v4() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            prefix: 0,
        }
    }
}

/// Error for strings that are neither `ip` nor `ip/prefix`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid network address: {0}")]
pub struct CidrParseError(pub String);

impl FromStr for Cidr {
    type Err = CidrParseError;

    /// A bare address is taken as a host route.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || CidrParseError(s.to_string());

        match s.split_once('/') {
            Some((ip, prefix)) => {
                let addr: IpAddr = ip.parse().map_err(|_| invalid())?;
                let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
                Self::new(addr, prefix).ok_or_else(invalid)
            }
            None => s.parse().map(Self::host).map_err(|_| invalid()),
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// WireGuard peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub public_key: PublicKey,
    pub endpoint: Endpoint,
    /// Traffic routed through this peer
    pub allowed_ips: Vec<Cidr>,
    /// Persistent keepalive interval (seconds)
    pub keepalive: Option<u16>,
}

/// Local side of the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub private_key: PrivateKey,
    pub address: Cidr,
    pub dns: Vec<IpAddr>,
}

/// Complete tunnel configuration
///
/// Fields are private so a built config cannot be edited afterwards;
/// a changed device or server always means a new config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    interface: InterfaceConfig,
    peers: Vec<Peer>,
}

impl TunnelConfig {
    pub(crate) fn new(interface: InterfaceConfig, peers: Vec<Peer>) -> Self {
        Self { interface, peers }
    }

    pub fn interface(&self) -> &InterfaceConfig {
        &self.interface
    }

    /// Peers in preference order
    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    /// Render in the `wg-quick` text format.
    ///
    /// The output contains the private key.
    pub fn to_wg_quick(&self) -> String {
        let mut out = String::new();
        let iface = &self.interface;

        let _ = writeln!(out, "[Interface]");
        let _ = writeln!(out, "PrivateKey = {}", iface.private_key.to_base64());
        let _ = writeln!(out, "Address = {}", iface.address);
        if !iface.dns.is_empty() {
            let dns: Vec<String> = iface.dns.iter().map(|d| d.to_string()).collect();
            let _ = writeln!(out, "DNS = {}", dns.join(", "));
        }

        for peer in &self.peers {
            let allowed: Vec<String> = peer.allowed_ips.iter().map(|c| c.to_string()).collect();

            let _ = writeln!(out);
            let _ = writeln!(out, "[Peer]");
            let _ = writeln!(out, "PublicKey = {}", peer.public_key);
            let _ = writeln!(out, "AllowedIPs = {}", allowed.join(", "));
            let _ = writeln!(out, "Endpoint = {}", peer.endpoint);
            if let Some(secs) = peer.keepalive {
                let _ = writeln!(out, "PersistentKeepalive = {}", secs);
            }
        }

        out
    }
}
