//! Pool registry and forward dispatch
//!
//! The manager owns every running pool, keyed by server name, together with
//! the blocklist and the shared access control. Front-ends hand each
//! accepted connection to [`Manager::forward`], which admits the client,
//! picks the least-loaded pool and relays the connection through it.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, RwLock};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xengate_access::{AccessControl, IpBlocklist};
use xengate_proto::{BlockedIpInfo, ConfigError, ConfigStore, ServerProfile, TargetAddr};
use xengate_transport::SessionConnector;

use crate::error::{ManagerError, PoolError};
use crate::pool::{ConnectionPool, PoolSettings, PoolStats};
use crate::tunnel::ForwardSummary;

/// Manager behaviour
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Budget for picking a tunnel and opening the remote stream
    pub forward_timeout: Duration,
    pub pool: PoolSettings,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            forward_timeout: Duration::from_secs(30),
            pool: PoolSettings::default(),
        }
    }
}

/// A running pool and the task that stops it when its scope is cancelled
struct Registered {
    pool: Arc<ConnectionPool>,
    scope_watcher: AbortHandle,
}

impl Registered {
    /// Abort the scope watcher and tear the pool down in the background.
    /// May abort the calling task when that task is the watcher itself.
    fn release(self) {
        self.scope_watcher.abort();
        let pool = self.pool;
        tokio::spawn(async move { pool.stop().await });
    }
}

pub struct Manager {
    pools: RwLock<HashMap<String, Registered>>,
    blocklist: IpBlocklist,
    access: Arc<AccessControl>,
    connector: Arc<dyn SessionConnector>,
    store: Option<Arc<dyn ConfigStore>>,
    /// Held across a blocklist change and its write to the store
    persist_lock: Mutex<()>,
    settings: ManagerSettings,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Manager {
    pub fn new(connector: Arc<dyn SessionConnector>, access: Arc<AccessControl>) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            blocklist: IpBlocklist::new(),
            access,
            connector,
            store: None,
            persist_lock: Mutex::new(()),
            settings: ManagerSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ManagerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_blocklist(mut self, blocklist: IpBlocklist) -> Self {
        self.blocklist = blocklist;
        self
    }

    /// Persist blocklist changes to `store`
    pub fn with_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn access(&self) -> &Arc<AccessControl> {
        &self.access
    }

    /// Create and start a pool for `profile`.
    ///
    /// The pool lives until [`stop`](Self::stop) is called for its name or
    /// `cancel` fires.
    pub async fn start(
        self: &Arc<Self>,
        profile: ServerProfile,
        cancel: CancellationToken,
    ) -> Result<(), ManagerError> {
        let name = profile.name.clone();
        if self.pools.read().await.contains_key(&name) {
            return Err(ManagerError::PoolExists(name));
        }

        let pool = Arc::new(ConnectionPool::new(
            profile,
            Arc::clone(&self.connector),
            self.settings.pool.clone(),
            &cancel,
        ));

        if let Err(e) = pool.start().await {
            pool.stop().await;
            return Err(e.into());
        }

        let mut pools = self.pools.write().await;
        if pools.contains_key(&name) {
            drop(pools);
            pool.stop().await;
            return Err(ManagerError::CreatedConcurrently(name));
        }

        // Spawned under the write lock, so the watcher's stop always finds
        // the entry registered here
        let manager: Weak<Self> = Arc::downgrade(self);
        let pool_name = name.clone();
        let scope_watcher = tokio::spawn(async move {
            cancel.cancelled().await;
            if let Some(manager) = manager.upgrade() {
                debug!(server = %pool_name, "Pool scope cancelled");
                let _ = manager.stop(&pool_name).await;
            }
        })
        .abort_handle();
        pools.insert(
            name.clone(),
            Registered {
                pool,
                scope_watcher,
            },
        );
        drop(pools);

        info!(server = %name, "Pool registered");
        Ok(())
    }

    /// Remove a pool and tear it down in the background
    pub async fn stop(&self, name: &str) -> Result<(), ManagerError> {
        let registered = self
            .pools
            .write()
            .await
            .remove(name)
            .ok_or_else(|| ManagerError::PoolNotFound(name.to_string()))?;

        info!(server = %name, "Pool removed");
        registered.release();
        Ok(())
    }

    /// Remove every pool and tear them down in the background
    pub async fn stop_all(&self) {
        let pools: Vec<Registered> = self
            .pools
            .write()
            .await
            .drain()
            .map(|(_, registered)| registered)
            .collect();

        info!(pools = pools.len(), "Stopping all pools");
        for registered in pools {
            registered.release();
        }
    }

    /// Relay `local` to `target` through the least-loaded pool.
    ///
    /// Blocked and over-quota clients are refused and `local` is dropped.
    /// The budget in [`ManagerSettings::forward_timeout`] covers choosing a
    /// tunnel and opening the remote stream; the relay itself is unbounded.
    pub async fn forward<S>(
        &self,
        local: S,
        client: SocketAddr,
        target: &TargetAddr,
    ) -> Result<ForwardSummary, ManagerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let ip = client.ip();

        if !self.access.is_master(ip).await && self.blocklist.is_blocked(ip).await {
            warn!(client = %client, target = %target, "Rejected connection from blocked IP");
            return Err(ManagerError::Blocked(ip));
        }

        let Some(session) = self.access.open_session(ip).await else {
            warn!(client = %client, target = %target, "Access denied");
            return Err(ManagerError::AccessDenied(ip));
        };

        // Dropping this future before completion ends the session through
        // the guard's drop
        let result = self.dispatch(local, client, target).await;
        session.end().await;
        result
    }

    async fn dispatch<S>(
        &self,
        local: S,
        client: SocketAddr,
        target: &TargetAddr,
    ) -> Result<ForwardSummary, ManagerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut pools: Vec<(String, Arc<ConnectionPool>)> = self
            .pools
            .read()
            .await
            .iter()
            .map(|(name, registered)| (name.clone(), Arc::clone(&registered.pool)))
            .collect();
        if pools.is_empty() {
            return Err(ManagerError::NoPools);
        }
        pools.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut candidates = Vec::with_capacity(pools.len());
        for (_, pool) in pools {
            if pool.has_connected_tunnel().await {
                let load = pool.active_forwards().await;
                candidates.push((pool, load));
            }
        }
        let pool = pick_least_loaded(candidates).ok_or(ManagerError::NoTunnels)?;

        debug!(client = %client, target = %target, server = %pool.name(), "Dispatching forward");

        let channel = tokio::time::timeout(self.settings.forward_timeout, pool.open_channel(target))
            .await
            .map_err(|_| ManagerError::Timeout {
                target: target.to_string(),
                timeout: self.settings.forward_timeout,
            })?
            .map_err(|e| match e {
                PoolError::NoTunnels(_) => ManagerError::NoTunnels,
                other => other.into(),
            })?;

        let summary = channel.relay(local).await?;
        info!(
            client = %client,
            target = %target,
            tunnel = %summary.tunnel_id,
            bytes_up = summary.bytes_up,
            bytes_down = summary.bytes_down,
            "Forward closed"
        );
        Ok(summary)
    }

    pub async fn get_pool(&self, name: &str) -> Option<Arc<ConnectionPool>> {
        self.pools
            .read()
            .await
            .get(name)
            .map(|registered| Arc::clone(&registered.pool))
    }

    pub async fn has_pool(&self, name: &str) -> bool {
        self.pools.read().await.contains_key(name)
    }

    pub async fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stats of every pool, ordered by server name
    pub async fn stats(&self) -> Vec<PoolStats> {
        let pools: Vec<Arc<ConnectionPool>> = self
            .pools
            .read()
            .await
            .values()
            .map(|registered| Arc::clone(&registered.pool))
            .collect();
        let mut stats = Vec::with_capacity(pools.len());
        for pool in pools {
            stats.push(pool.stats().await);
        }
        stats.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        stats
    }

    /// Block `ip`. Returns `false` when it was already blocked.
    pub async fn block_ip(&self, ip: IpAddr) -> Result<bool, ManagerError> {
        let _persist = self.persist_lock.lock().await;
        let added = self.blocklist.add(ip).await;
        if added {
            self.persist_blocklist().await?;
        }
        Ok(added)
    }

    /// Unblock `ip`. Returns `false` when it was not blocked.
    pub async fn unblock_ip(&self, ip: IpAddr) -> Result<bool, ManagerError> {
        let _persist = self.persist_lock.lock().await;
        let removed = self.blocklist.remove(ip).await;
        if removed {
            self.persist_blocklist().await?;
        }
        Ok(removed)
    }

    pub async fn is_ip_blocked(&self, ip: IpAddr) -> bool {
        self.blocklist.is_blocked(ip).await
    }

    pub async fn blocked_ips(&self) -> Vec<BlockedIpInfo> {
        self.blocklist.list().await
    }

    /// Callers hold `persist_lock`
    async fn persist_blocklist(&self) -> Result<(), ManagerError> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        let blocked = self.blocklist.list().await;
        tokio::task::spawn_blocking(move || {
            store.update(&mut |config| config.blocked_list = blocked.clone())
        })
        .await
        .map_err(|e| ConfigError::Unavailable(e.to_string()))??;
        Ok(())
    }
}

/// Candidate with the lowest load; ties go to the earliest candidate
pub fn pick_least_loaded<T>(candidates: impl IntoIterator<Item = (T, u64)>) -> Option<T> {
    let mut best: Option<(T, u64)> = None;
    for (candidate, load) in candidates {
        match &best {
            Some((_, best_load)) if *best_load <= load => {}
            _ => best = Some((candidate, load)),
        }
    }
    best.map(|(candidate, _)| candidate)
}
