//! Pool of tunnels to one server
//!
//! Tunnels are picked round-robin, skipping disconnected ones. A monitor
//! task restores disconnected tunnels in the background.

use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::interval_at;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use xengate_proto::{ServerProfile, TargetAddr};
use xengate_transport::SessionConnector;

use crate::backoff::BackoffConfig;
use crate::error::PoolError;
use crate::tunnel::{ForwardChannel, ForwardSummary, Tunnel, TunnelSettings, TunnelState, TunnelStats};

/// Pool behaviour
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// How often disconnected tunnels are looked for
    pub monitor_interval: Duration,
    /// Backoff between connection attempts at start and in the monitor
    pub connect_backoff: BackoffConfig,
    pub tunnel: TunnelSettings,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(15),
            connect_backoff: BackoffConfig::pool_connect(),
            tunnel: TunnelSettings::default(),
        }
    }
}

/// Aggregate view of a pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub server_name: String,
    pub total_tunnels: usize,
    pub connected_tunnels: usize,
    pub active_connections: u64,
    pub total_bytes: u64,
    pub total_requests: u64,
    pub tunnels: Vec<TunnelStats>,
}

pub struct ConnectionPool {
    profile: ServerProfile,
    settings: PoolSettings,
    connector: Arc<dyn SessionConnector>,
    tunnels: RwLock<Vec<Arc<Tunnel>>>,
    cursor: AtomicUsize,
    started: AtomicBool,
    cancel: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("server", &self.profile.name)
            .field("connections", &self.profile.connections)
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(
        profile: ServerProfile,
        connector: Arc<dyn SessionConnector>,
        settings: PoolSettings,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            profile,
            settings,
            connector,
            tunnels: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            cancel: parent.child_token(),
            monitor: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn profile(&self) -> &ServerProfile {
        &self.profile
    }

    /// Connect every tunnel of the pool.
    ///
    /// All-or-nothing: when any tunnel exhausts its attempts the whole pool
    /// is stopped and the start fails.
    pub async fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(PoolError::AlreadyStarted(self.profile.name.clone()));
        }

        let count = self.profile.connections.max(1);
        let attempts = self.profile.max_retries.max(1);
        let tunnels: Vec<Arc<Tunnel>> = (0..count)
            .map(|i| {
                Arc::new(Tunnel::new(
                    format!("{}-{}", self.profile.name, i + 1),
                    &self.profile,
                    Arc::clone(&self.connector),
                    self.settings.tunnel.clone(),
                    &self.cancel,
                ))
            })
            .collect();
        *self.tunnels.write().await = tunnels.clone();

        info!(
            server = %self.profile.name,
            address = %self.profile.address(),
            tunnels = count,
            "Starting connection pool"
        );

        let results = join_all(
            tunnels
                .iter()
                .map(|tunnel| tunnel.connect_with_retry(attempts, &self.settings.connect_backoff)),
        )
        .await;

        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|result| result.err().map(|e| e.to_string()))
            .collect();

        if let Some(last_error) = failures.last().cloned() {
            error!(
                server = %self.profile.name,
                failed = failures.len(),
                total = count,
                "Connection pool failed to start"
            );
            self.stop().await;
            return Err(PoolError::StartFailed {
                server: self.profile.name.clone(),
                failed: failures.len(),
                total: count,
                last_error,
            });
        }

        self.spawn_monitor();
        info!(server = %self.profile.name, tunnels = count, "Connection pool started");
        Ok(())
    }

    /// Next connected tunnel in round-robin order
    pub async fn get_tunnel(&self) -> Option<Arc<Tunnel>> {
        let tunnels = self.tunnels.read().await;
        let len = tunnels.len();
        if len == 0 {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        (0..len)
            .map(|i| &tunnels[(start + i) % len])
            .find(|tunnel| tunnel.is_connected())
            .cloned()
    }

    pub async fn has_connected_tunnel(&self) -> bool {
        self.tunnels
            .read()
            .await
            .iter()
            .any(|tunnel| tunnel.is_connected())
    }

    /// Forwards in flight across all tunnels
    pub async fn active_forwards(&self) -> u64 {
        self.tunnels
            .read()
            .await
            .iter()
            .map(|tunnel| tunnel.active_connections())
            .sum()
    }

    /// Pick a tunnel and open a stream to `target` through it
    pub async fn open_channel(&self, target: &TargetAddr) -> Result<ForwardChannel, PoolError> {
        let tunnel = self
            .get_tunnel()
            .await
            .ok_or_else(|| PoolError::NoTunnels(self.profile.name.clone()))?;
        Ok(tunnel.open_channel(target).await?)
    }

    pub async fn forward<S>(&self, local: S, target: &TargetAddr) -> Result<ForwardSummary, PoolError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let channel = self.open_channel(target).await?;
        Ok(channel.relay(local).await?)
    }

    /// Stop the monitor and disconnect every tunnel. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }

        let tunnels = self.tunnels.read().await.clone();
        join_all(tunnels.iter().map(|tunnel| tunnel.disconnect())).await;
        info!(server = %self.profile.name, "Connection pool stopped");
    }

    pub async fn stats(&self) -> PoolStats {
        let tunnels: Vec<TunnelStats> = self
            .tunnels
            .read()
            .await
            .iter()
            .map(|tunnel| tunnel.stats())
            .collect();

        PoolStats {
            server_name: self.profile.name.clone(),
            total_tunnels: tunnels.len(),
            connected_tunnels: tunnels
                .iter()
                .filter(|t| t.state == TunnelState::Connected)
                .count(),
            active_connections: tunnels.iter().map(|t| t.active_connections).sum(),
            total_bytes: tunnels.iter().map(|t| t.total_bytes).sum(),
            total_requests: tunnels.iter().map(|t| t.total_requests).sum(),
            tunnels,
        }
    }

    fn spawn_monitor(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = self.settings.monitor_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.restore_tunnels().await;
            }
            debug!("Pool monitor stopped");
        });

        *self.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Reconnect disconnected tunnels, at most `max_retries` at a time
    async fn restore_tunnels(&self) {
        let disconnected: Vec<Arc<Tunnel>> = self
            .tunnels
            .read()
            .await
            .iter()
            .filter(|tunnel| tunnel.state() == TunnelState::Disconnected)
            .cloned()
            .collect();

        if !disconnected.is_empty() {
            warn!(
                server = %self.profile.name,
                count = disconnected.len(),
                "Restoring disconnected tunnels"
            );

            let attempts = self.profile.max_retries.max(1);
            let permits = Arc::new(Semaphore::new(attempts));
            let tasks: Vec<JoinHandle<()>> = disconnected
                .into_iter()
                .map(|tunnel| {
                    let permits = Arc::clone(&permits);
                    let backoff = self.settings.connect_backoff.clone();
                    tokio::spawn(async move {
                        let Ok(_permit) = permits.acquire_owned().await else {
                            return;
                        };
                        if let Err(e) = tunnel.connect_with_retry(attempts, &backoff).await {
                            warn!(tunnel = %tunnel.id(), "Tunnel restore failed: {}", e);
                        }
                    })
                })
                .collect();
            join_all(tasks).await;
        }

        let stats = self.stats().await;
        debug!(
            server = %stats.server_name,
            connected = stats.connected_tunnels,
            total = stats.total_tunnels,
            active = stats.active_connections,
            bytes = stats.total_bytes,
            requests = stats.total_requests,
            "Pool status"
        );
    }
}
