//! Authenticated session abstraction for tunnels
//!
//! A [`SessionConnector`] dials and authenticates a [`Session`] to a remote
//! server. A session multiplexes many logical byte streams, each one opened
//! towards a `host:port` reachable from the server.
//!
//! ```text
//!   tunnel ──connect──▶ SessionConnector ──▶ Session
//!                                              │ open_stream(host, port)
//!                                              ▼
//!                                         BoxedStream (AsyncRead + AsyncWrite)
//! ```
//!
//! The production implementation is [`ssh::SshConnector`] (password
//! authenticated SSH with `direct-tcpip` channels). The `mock` feature adds
//! an in-memory connector for tests.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod ssh;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use ssh::SshConnector;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Byte stream carried inside a session
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for T {}

pub type BoxedStream = Box<dyn TunnelStream>;

/// Everything needed to dial one session
#[derive(Clone)]
pub struct ConnectRequest {
    /// Tunnel the session is dialed for, used for logging
    pub tunnel_id: String,
    /// `host:port` of the server
    pub address: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("tunnel_id", &self.tunnel_id)
            .field("address", &self.address)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// One authenticated connection to a server
#[async_trait]
pub trait Session: Send + Sync + fmt::Debug {
    /// Open a logical stream to `host:port` as seen from the server
    async fn open_stream(&self, host: &str, port: u16) -> TransportResult<BoxedStream>;

    /// Liveness probe; an error means the session is unusable
    async fn keepalive(&self) -> TransportResult<()>;

    fn is_closed(&self) -> bool;

    /// Close the session. Safe to call more than once.
    async fn close(&self);
}

/// Dials and authenticates sessions
#[async_trait]
pub trait SessionConnector: Send + Sync + fmt::Debug {
    async fn connect(&self, request: &ConnectRequest) -> TransportResult<Arc<dyn Session>>;
}
