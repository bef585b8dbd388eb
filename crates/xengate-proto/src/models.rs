//! Persisted record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

use crate::{DEFAULT_CONNECTIONS, DEFAULT_MAX_RETRIES};

/// Remote SSH server a pool of tunnels is opened against
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerProfile {
    #[serde(default = "new_profile_id")]
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Number of tunnels kept open to this server
    #[serde(default = "default_connections")]
    pub connections: usize,
    /// Connection attempts per tunnel before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default)]
    pub proxy: ProxySettings,
}

impl ServerProfile {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            id: new_profile_id(),
            name: name.into(),
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            connections: DEFAULT_CONNECTIONS,
            max_retries: DEFAULT_MAX_RETRIES,
            proxy: ProxySettings::default(),
        }
    }

    /// `host:port` of the SSH endpoint, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Debug for ServerProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerProfile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("connections", &self.connections)
            .field("max_retries", &self.max_retries)
            .field("proxy", &self.proxy)
            .finish()
    }
}

/// Local front-end a profile exposes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxySettings {
    /// Bind address for socks5/http, interface address for tuntap
    pub listen_addr: String,
    pub listen_port: u16,
    /// `socks5`, `http` or `tuntap`
    pub mode: String,
    /// TUN device name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Interface used for NAT masquerading in tuntap mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_interface: Option<String>,
    /// Install a default route through the TUN device
    #[serde(default)]
    pub route_all: bool,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 1080,
            mode: "socks5".to_string(),
            device: None,
            egress_interface: None,
            route_all: false,
        }
    }
}

/// Access rule as stored in the configuration document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleRecord {
    pub id: String,
    pub title: String,
    pub ip: IpAddr,
    #[serde(default)]
    pub is_master: bool,
    pub daily_limit_secs: u64,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_access: Option<DateTime<Utc>>,
    #[serde(default)]
    pub used_time_secs: u64,
    #[serde(default)]
    pub is_blocked: bool,
}

/// Blocklist entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockedIpInfo {
    pub ip: IpAddr,
    pub timestamp: DateTime<Utc>,
}

fn new_profile_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connections() -> usize {
    DEFAULT_CONNECTIONS
}

fn default_max_retries() -> usize {
    DEFAULT_MAX_RETRIES
}
