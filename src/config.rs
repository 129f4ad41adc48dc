//! Configuration for `weftd`.
//!
//! The file is JSON. The `Backend` section is the tunnel backend's own
//! knob set and is parsed at network registration; the rest describes the
//! overlay topology the static lease source serves.

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::subnet::StaticPeer;

pub const DEFAULT_PORT: u16 = 8285;
pub const DEFAULT_LOCAL_LISTEN_ADDR: &str = "127.0.0.1:9022";

/// Tunnel backend knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// UDP port carrying the overlay on every host.
    #[serde(rename = "Port", default = "default_port")]
    pub port: u16,

    /// Policy-server base URL. Empty disables whitelist polling.
    #[serde(rename = "PolicyURL", default)]
    pub policy_url: String,

    /// Listen address for the endpoint registrar.
    #[serde(rename = "LocalListenAddr", default = "default_local_listen_addr")]
    pub local_listen_addr: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_local_listen_addr() -> String {
    DEFAULT_LOCAL_LISTEN_ADDR.to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            policy_url: String::new(),
            local_listen_addr: DEFAULT_LOCAL_LISTEN_ADDR.to_string(),
        }
    }
}

/// Everything `weftd` reads from its config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// The overlay-wide network (e.g. a /16) shared by all hosts.
    #[serde(rename = "Network")]
    pub network: Ipv4Net,

    /// This host's slice of the overlay (e.g. a /24 inside `Network`).
    #[serde(rename = "Subnet")]
    pub subnet: Ipv4Net,

    /// Underlay address peers use to reach this host.
    #[serde(rename = "PublicIP")]
    pub public_ip: Ipv4Addr,

    /// Static peer table for the built-in lease source.
    #[serde(rename = "Peers", default)]
    pub peers: Vec<StaticPeer>,

    #[serde(rename = "Backend", default)]
    pub backend: BackendConfig,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("decoding config file {}", path.display()))?;
        if !config.network.contains(&config.subnet.addr()) {
            anyhow::bail!(
                "host subnet {} is not inside the overlay network {}",
                config.subnet,
                config.network
            );
        }
        Ok(config)
    }
}
