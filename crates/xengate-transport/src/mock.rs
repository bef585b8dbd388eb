//! In-memory connector for tests
//!
//! Sessions echo every byte written to their streams back to the writer.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::{
    BoxedStream, ConnectRequest, Session, SessionConnector, TransportError, TransportResult,
};

/// Scriptable connector
#[derive(Debug, Default)]
pub struct MockConnector {
    fail_first: usize,
    unreachable: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    open_delay: Mutex<Option<Duration>>,
    attempts: Mutex<HashMap<String, usize>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` connection attempts of every tunnel
    pub fn failing_first(n: usize) -> Self {
        Self {
            fail_first: n,
            ..Self::default()
        }
    }

    /// Make every connection attempt fail (or succeed again)
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delay applied to every connection attempt before it resolves
    pub fn set_connect_delay(&self, delay: Duration) {
        if let Ok(mut connect_delay) = self.connect_delay.lock() {
            *connect_delay = Some(delay);
        }
    }

    /// Delay applied to `open_stream` on sessions created afterwards
    pub fn set_open_delay(&self, delay: Duration) {
        if let Ok(mut open_delay) = self.open_delay.lock() {
            *open_delay = Some(delay);
        }
    }

    pub fn attempts(&self, tunnel_id: &str) -> usize {
        self.attempts
            .lock()
            .map(|a| a.get(tunnel_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn total_attempts(&self) -> usize {
        self.attempts
            .lock()
            .map(|a| a.values().sum())
            .unwrap_or(0)
    }

    /// Every session handed out so far
    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionConnector for MockConnector {
    async fn connect(&self, request: &ConnectRequest) -> TransportResult<Arc<dyn Session>> {
        let attempt = {
            let mut attempts = self
                .attempts
                .lock()
                .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
            let count = attempts.entry(request.tunnel_id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let connect_delay = self.connect_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = connect_delay {
            tokio::time::sleep(delay).await;
        }

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionError(format!(
                "{} unreachable",
                request.address
            )));
        }
        if attempt <= self.fail_first {
            return Err(TransportError::ConnectionError(format!(
                "scripted failure {} for {}",
                attempt, request.tunnel_id
            )));
        }

        let open_delay = self.open_delay.lock().ok().and_then(|d| *d);
        let session = Arc::new(MockSession {
            tunnel_id: request.tunnel_id.clone(),
            open_delay,
            ..MockSession::default()
        });
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.push(Arc::clone(&session));
        }
        Ok(session)
    }
}

/// Echoing session
#[derive(Debug, Default)]
pub struct MockSession {
    tunnel_id: String,
    open_delay: Option<Duration>,
    closed: AtomicBool,
    refuse_streams: AtomicBool,
    opened: AtomicUsize,
    targets: Mutex<Vec<String>>,
}

impl MockSession {
    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    /// Simulate the server going away: probes and stream opens fail
    pub fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn set_refuse_streams(&self, refuse: bool) {
        self.refuse_streams.store(refuse, Ordering::SeqCst);
    }

    pub fn streams_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// `host:port` of every stream opened so far
    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Session for MockSession {
    async fn open_stream(&self, host: &str, port: u16) -> TransportResult<BoxedStream> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::SessionClosed);
        }
        if self.refuse_streams.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelError(format!(
                "connect to {}:{} refused",
                host, port
            )));
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut targets) = self.targets.lock() {
            targets.push(format!("{}:{}", host, port));
        }

        let (near, far) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(far);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
            let _ = writer.shutdown().await;
        });

        Ok(Box::new(near))
    }

    async fn keepalive(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
