//! Call configuration

use crate::error::CallError;
use crate::identity::IdentitySource;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// How many remote peers a call connects to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Exactly one remote peer, no announce fan-out
    Pairwise,
    /// Full mesh between every announced participant
    #[default]
    Mesh,
}

impl FromStr for Topology {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pairwise" => Ok(Topology::Pairwise),
            "mesh" => Ok(Topology::Mesh),
            other => Err(CallError::Config(format!("unknown topology '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub topology: Topology,
    #[serde(default)]
    pub identity: IdentitySource,
    /// Upper bound for identity discovery
    #[serde(default = "default_identity_timeout_ms")]
    pub identity_timeout_ms: u64,
    /// STUN/TURN urls handed to the transport engine
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Broadcast `call_ended` when the local call stops
    #[serde(default = "default_announce_hangup")]
    pub announce_hangup: bool,
    /// PIN presented to the relay's login gate
    #[serde(default)]
    pub login: Option<String>,
}

fn default_identity_timeout_ms() -> u64 {
    5000
}

fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:8888/ws".to_string()
}

fn default_announce_hangup() -> bool {
    true
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            identity: IdentitySource::default(),
            identity_timeout_ms: default_identity_timeout_ms(),
            ice_servers: default_ice_servers(),
            relay_url: default_relay_url(),
            announce_hangup: default_announce_hangup(),
            login: None,
        }
    }
}

impl MeshConfig {
    /// Defaults overlaid with `MESHCALL_*` / `LOGIN` environment variables
    pub fn from_env() -> Result<Self, CallError> {
        Self::default().with_vars(std::env::vars())
    }

    /// Overlay values from `(name, value)` pairs; unknown names are ignored.
    pub fn with_vars<I>(mut self, vars: I) -> Result<Self, CallError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "MESHCALL_TOPOLOGY" => self.topology = value.parse()?,
                "MESHCALL_IDENTITY" => self.identity = value.parse()?,
                "MESHCALL_IDENTITY_TIMEOUT_MS" => {
                    self.identity_timeout_ms = value.trim().parse().map_err(|_| {
                        CallError::Config(format!("invalid identity timeout '{value}'"))
                    })?;
                }
                "MESHCALL_RELAY_URL" => self.relay_url = value,
                "MESHCALL_ICE_SERVERS" => {
                    self.ice_servers = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect();
                }
                "MESHCALL_ANNOUNCE_HANGUP" => {
                    self.announce_hangup = matches!(value.trim(), "1" | "true" | "yes");
                }
                "LOGIN" => self.login = Some(value),
                _ => {}
            }
        }
        Ok(self)
    }

    pub fn identity_timeout(&self) -> Duration {
        Duration::from_millis(self.identity_timeout_ms)
    }
}
