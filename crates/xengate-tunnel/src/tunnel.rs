//! A single authenticated tunnel
//!
//! States: `Disconnected → Connecting → Connected`. A failed keepalive or an
//! explicit disconnect drops back to `Disconnected`. While connected two
//! watchers run: a keepalive probe that drops a dead session, and a health
//! check that reconnects with backoff when the session is gone.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::interval_at;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xengate_proto::{ServerProfile, TargetAddr};
use xengate_transport::{BoxedStream, ConnectRequest, Session, SessionConnector};

use crate::backoff::{Backoff, BackoffConfig};
use crate::error::TunnelError;
use crate::relay;

/// Timing knobs for a tunnel
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Bound on dial plus authentication
    pub dial_timeout: Duration,
    /// Bound on opening one stream through the session
    pub open_timeout: Duration,
    pub keepalive_interval: Duration,
    pub health_interval: Duration,
    /// Attempts made by a self-triggered reconnect
    pub reconnect_attempts: usize,
    pub reconnect_backoff: BackoffConfig,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(30),
            open_timeout: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(30),
            health_interval: Duration::from_secs(15),
            reconnect_attempts: 3,
            reconnect_backoff: BackoffConfig::tunnel_reconnect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Point-in-time view of a tunnel
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStats {
    pub id: String,
    pub server_name: String,
    pub state: TunnelState,
    pub active_connections: u64,
    pub total_bytes: u64,
    pub total_requests: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Outcome of one completed forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSummary {
    pub tunnel_id: String,
    pub target: String,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

pub struct Tunnel {
    id: String,
    server_name: String,
    request: ConnectRequest,
    connector: Arc<dyn SessionConnector>,
    settings: TunnelSettings,
    session: RwLock<Option<Arc<dyn Session>>>,
    connecting: AtomicBool,
    reconnecting: AtomicBool,
    active: AtomicU64,
    total_bytes: AtomicU64,
    requests: AtomicU64,
    last_used: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
    cancel: CancellationToken,
    watchers: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("server_name", &self.server_name)
            .field("state", &self.state())
            .finish()
    }
}

impl Tunnel {
    /// Create a disconnected tunnel. `parent` bounds every task the tunnel
    /// spawns.
    pub fn new(
        id: impl Into<String>,
        profile: &ServerProfile,
        connector: Arc<dyn SessionConnector>,
        settings: TunnelSettings,
        parent: &CancellationToken,
    ) -> Self {
        let id = id.into();
        Self {
            request: ConnectRequest {
                tunnel_id: id.clone(),
                address: profile.address(),
                user: profile.user.clone(),
                password: profile.password.clone(),
            },
            id,
            server_name: profile.name.clone(),
            connector,
            settings,
            session: RwLock::new(None),
            connecting: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            active: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            last_used: Mutex::new(None),
            last_error: Mutex::new(None),
            cancel: parent.child_token(),
            watchers: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn state(&self) -> TunnelState {
        if self.is_connected() {
            TunnelState::Connected
        } else if self.connecting.load(Ordering::Acquire) {
            TunnelState::Connecting
        } else {
            TunnelState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session()
            .map(|session| !session.is_closed())
            .unwrap_or(false)
    }

    /// Forwards currently in flight
    pub fn active_connections(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Dial and authenticate. No-op when already connected.
    pub async fn connect(self: &Arc<Self>) -> Result<(), TunnelError> {
        if self.cancel.is_cancelled() {
            return Err(TunnelError::Cancelled(self.id.clone()));
        }
        if self.is_connected() {
            return Ok(());
        }
        if self
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TunnelError::ConnectInProgress(self.id.clone()));
        }

        debug!(tunnel = %self.id, address = %self.request.address, "Connecting tunnel");

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(TunnelError::Cancelled(self.id.clone())),
            dialed = tokio::time::timeout(
                self.settings.dial_timeout,
                self.connector.connect(&self.request),
            ) => match dialed {
                Err(_) => Err(TunnelError::ConnectTimeout {
                    tunnel: self.id.clone(),
                    timeout: self.settings.dial_timeout,
                }),
                Ok(Err(source)) => Err(TunnelError::Connect {
                    tunnel: self.id.clone(),
                    source,
                }),
                Ok(Ok(session)) => Ok(session),
            },
        };

        let outcome = match result {
            Ok(session) if self.cancel.is_cancelled() => {
                session.close().await;
                Err(TunnelError::Cancelled(self.id.clone()))
            }
            Ok(session) => {
                *write(&self.session) = Some(session);
                *lock(&self.last_error) = None;
                self.spawn_watchers();
                info!(tunnel = %self.id, server = %self.server_name, "Tunnel connected");
                Ok(())
            }
            Err(e) => {
                *lock(&self.last_error) = Some(e.to_string());
                warn!(tunnel = %self.id, "{}", e);
                Err(e)
            }
        };

        self.connecting.store(false, Ordering::Release);
        outcome
    }

    /// Connect, retrying up to `attempts` times with backoff between tries
    pub async fn connect_with_retry(
        self: &Arc<Self>,
        attempts: usize,
        backoff: &BackoffConfig,
    ) -> Result<(), TunnelError> {
        let attempts = attempts.max(1);
        let mut backoff = Backoff::new(backoff.clone());
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e @ TunnelError::Cancelled(_)) => return Err(e),
                Err(e) if attempt >= attempts => {
                    warn!(tunnel = %self.id, attempts, "Giving up connecting tunnel");
                    return Err(e);
                }
                Err(e) => {
                    debug!(tunnel = %self.id, attempt, "Connect attempt failed: {}", e);
                    backoff
                        .wait(&self.cancel)
                        .await
                        .map_err(|_| TunnelError::Cancelled(self.id.clone()))?;
                }
            }
        }
    }

    /// Drop the current session and connect again with backoff
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), TunnelError> {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return Err(TunnelError::ConnectInProgress(self.id.clone()));
        }

        info!(tunnel = %self.id, "Reconnecting tunnel");
        if let Some(session) = self.take_session() {
            session.close().await;
        }

        let result = self
            .connect_with_retry(
                self.settings.reconnect_attempts,
                &self.settings.reconnect_backoff,
            )
            .await;

        self.reconnecting.store(false, Ordering::Release);
        result
    }

    /// Shut the tunnel down for good: stops watchers and pending reconnects
    /// and closes the session
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        if let Some(session) = self.take_session() {
            session.close().await;
            info!(tunnel = %self.id, "Tunnel disconnected");
        }
    }

    /// Open a stream to `target` through this tunnel's session.
    ///
    /// The returned channel counts as an active forward until dropped.
    pub async fn open_channel(
        self: &Arc<Self>,
        target: &TargetAddr,
    ) -> Result<ForwardChannel, TunnelError> {
        let session = self
            .session()
            .filter(|session| !session.is_closed())
            .ok_or_else(|| TunnelError::NotConnected(self.id.clone()))?;

        self.requests.fetch_add(1, Ordering::Relaxed);
        let active = ActiveGuard::new(Arc::clone(self));
        self.touch();

        let stream = tokio::time::timeout(
            self.settings.open_timeout,
            session.open_stream(target.host(), target.port()),
        )
        .await
        .map_err(|_| TunnelError::OpenTimeout {
            tunnel: self.id.clone(),
            target: target.to_string(),
            timeout: self.settings.open_timeout,
        })?
        .map_err(|source| TunnelError::OpenStream {
            tunnel: self.id.clone(),
            target: target.to_string(),
            source,
        })?;

        debug!(tunnel = %self.id, target = %target, "Stream opened");

        Ok(ForwardChannel {
            target: target.to_string(),
            stream,
            active,
        })
    }

    /// Open a stream to `target` and relay `local` through it until both
    /// sides finish
    pub async fn forward<S>(
        self: &Arc<Self>,
        local: S,
        target: &TargetAddr,
    ) -> Result<ForwardSummary, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.open_channel(target).await?.relay(local).await
    }

    pub fn stats(&self) -> TunnelStats {
        TunnelStats {
            id: self.id.clone(),
            server_name: self.server_name.clone(),
            state: self.state(),
            active_connections: self.active.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            total_requests: self.requests.load(Ordering::Relaxed),
            last_used: *lock(&self.last_used),
            last_error: lock(&self.last_error).clone(),
        }
    }

    fn session(&self) -> Option<Arc<dyn Session>> {
        read(&self.session).clone()
    }

    fn take_session(&self) -> Option<Arc<dyn Session>> {
        write(&self.session).take()
    }

    fn touch(&self) {
        *lock(&self.last_used) = Some(Utc::now());
    }

    /// Start keepalive and health watchers for a fresh session, replacing
    /// the previous generation
    fn spawn_watchers(self: &Arc<Self>) {
        let token = self.cancel.child_token();
        if let Some(previous) = lock(&self.watchers).replace(token.clone()) {
            previous.cancel();
        }

        tokio::spawn(keepalive_loop(
            Arc::downgrade(self),
            token.clone(),
            self.settings.keepalive_interval,
        ));
        tokio::spawn(health_loop(
            Arc::downgrade(self),
            token,
            self.settings.health_interval,
        ));
    }

    async fn probe_keepalive(&self) {
        let Some(session) = self.session() else {
            return;
        };
        if let Err(e) = session.keepalive().await {
            warn!(tunnel = %self.id, "Keepalive failed: {}", e);
            *lock(&self.last_error) = Some(format!("keepalive failed: {}", e));
            if let Some(session) = self.take_session() {
                session.close().await;
            }
        }
    }

    async fn is_healthy(&self) -> bool {
        match self.session() {
            Some(session) if !session.is_closed() => session.keepalive().await.is_ok(),
            _ => false,
        }
    }
}

/// Stream opened through a tunnel, ready to be relayed
pub struct ForwardChannel {
    target: String,
    stream: BoxedStream,
    active: ActiveGuard,
}

impl ForwardChannel {
    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.active.tunnel
    }

    /// Relay `local` through the channel until both directions finish
    pub async fn relay<S>(self, local: S) -> Result<ForwardSummary, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let ForwardChannel {
            target,
            stream,
            active,
        } = self;
        let tunnel = Arc::clone(&active.tunnel);
        let started = Instant::now();

        let result = relay::relay(local, stream, &tunnel.total_bytes).await;
        tunnel.touch();
        drop(active);

        match result {
            Ok(stats) => {
                debug!(
                    tunnel = %tunnel.id,
                    target = %target,
                    bytes_up = stats.bytes_up,
                    bytes_down = stats.bytes_down,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Forward finished"
                );
                Ok(ForwardSummary {
                    tunnel_id: tunnel.id.clone(),
                    target,
                    bytes_up: stats.bytes_up,
                    bytes_down: stats.bytes_down,
                })
            }
            Err(e) => {
                warn!(tunnel = %tunnel.id, target = %target, "Forward failed: {}", e);
                Err(TunnelError::Relay(e))
            }
        }
    }
}

impl std::fmt::Debug for ForwardChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardChannel")
            .field("tunnel", &self.active.tunnel.id)
            .field("target", &self.target)
            .finish()
    }
}

/// Keeps a tunnel's active-forward count raised while alive
struct ActiveGuard {
    tunnel: Arc<Tunnel>,
}

impl ActiveGuard {
    fn new(tunnel: Arc<Tunnel>) -> Self {
        tunnel.active.fetch_add(1, Ordering::Relaxed);
        Self { tunnel }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.tunnel.active.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn keepalive_loop(tunnel: Weak<Tunnel>, cancel: CancellationToken, period: Duration) {
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(tunnel) = tunnel.upgrade() else {
            return;
        };
        tunnel.probe_keepalive().await;
    }
}

async fn health_loop(tunnel: Weak<Tunnel>, cancel: CancellationToken, period: Duration) {
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(tunnel) = tunnel.upgrade() else {
            return;
        };
        if tunnel.is_healthy().await {
            continue;
        }

        warn!(tunnel = %tunnel.id, "Health check failed");
        // A successful reconnect installs a new watcher generation
        if let Err(e) = tunnel.reconnect().await {
            warn!(tunnel = %tunnel.id, "Reconnect failed: {}", e);
        }
        cancel.cancel();
        return;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
