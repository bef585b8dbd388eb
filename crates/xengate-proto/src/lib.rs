//! Shared data model for xengate
//!
//! Server profiles, access rule records, blocklist entries and the flat
//! configuration document they are persisted in, plus the [`ConfigStore`]
//! boundary through which the rest of the workspace loads and saves it.

pub mod config;
pub mod models;
pub mod target;

pub use config::{AppConfig, ConfigError, ConfigStore, MemoryConfigStore};
pub use models::{BlockedIpInfo, ProxySettings, RuleRecord, ServerProfile};
pub use target::{TargetAddr, TargetAddrError};

/// Default number of tunnels opened per server
pub const DEFAULT_CONNECTIONS: usize = 1;

/// Default number of connection attempts per tunnel
pub const DEFAULT_MAX_RETRIES: usize = 3;
