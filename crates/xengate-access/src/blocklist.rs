//! IP blocklist
//!
//! Addresses on the list are refused before any quota accounting happens.
//! Entries live until removed.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::RwLock;
use tracing::info;
use xengate_proto::BlockedIpInfo;

/// Set of blocked source addresses with the time each was added
#[derive(Debug, Default)]
pub struct IpBlocklist {
    blocked: RwLock<HashMap<IpAddr, DateTime<Utc>>>,
}

impl IpBlocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from persisted entries
    pub fn from_entries(entries: impl IntoIterator<Item = BlockedIpInfo>) -> Self {
        let blocked = entries
            .into_iter()
            .map(|entry| (entry.ip, entry.timestamp))
            .collect();
        Self {
            blocked: RwLock::new(blocked),
        }
    }

    /// Block an address. Returns `false` if it was already blocked.
    pub async fn add(&self, ip: IpAddr) -> bool {
        let mut blocked = self.blocked.write().await;
        if blocked.contains_key(&ip) {
            return false;
        }
        blocked.insert(ip, Utc::now());
        info!(ip = %ip, "IP blocked");
        true
    }

    /// Unblock an address. Returns `false` if it was not blocked.
    pub async fn remove(&self, ip: IpAddr) -> bool {
        let removed = self.blocked.write().await.remove(&ip).is_some();
        if removed {
            info!(ip = %ip, "IP unblocked");
        }
        removed
    }

    pub async fn is_blocked(&self, ip: IpAddr) -> bool {
        self.blocked.read().await.contains_key(&ip)
    }

    /// Snapshot ordered by block time
    pub async fn list(&self) -> Vec<BlockedIpInfo> {
        let mut entries: Vec<BlockedIpInfo> = self
            .blocked
            .read()
            .await
            .iter()
            .map(|(ip, timestamp)| BlockedIpInfo {
                ip: *ip,
                timestamp: *timestamp,
            })
            .collect();
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.ip.cmp(&b.ip)));
        entries
    }

    pub async fn len(&self) -> usize {
        self.blocked.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blocked.read().await.is_empty()
    }
}
