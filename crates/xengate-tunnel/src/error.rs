//! Error types for tunnels, pools and the manager

use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use xengate_proto::ConfigError;
use xengate_transport::TransportError;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Tunnel {0} is not connected")]
    NotConnected(String),

    #[error("Tunnel {0} is already connecting")]
    ConnectInProgress(String),

    #[error("Tunnel {tunnel} failed to connect: {source}")]
    Connect {
        tunnel: String,
        #[source]
        source: TransportError,
    },

    #[error("Tunnel {tunnel} timed out connecting after {timeout:?}")]
    ConnectTimeout { tunnel: String, timeout: Duration },

    #[error("Tunnel {tunnel} failed to open stream to {target}: {source}")]
    OpenStream {
        tunnel: String,
        target: String,
        #[source]
        source: TransportError,
    },

    #[error("Tunnel {tunnel} timed out opening stream to {target} after {timeout:?}")]
    OpenTimeout {
        tunnel: String,
        target: String,
        timeout: Duration,
    },

    #[error("Relay failed: {0}")]
    Relay(#[source] std::io::Error),

    #[error("Tunnel {0} has been shut down")]
    Cancelled(String),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Pool {0} has already been started")]
    AlreadyStarted(String),

    #[error("{failed} of {total} tunnels to {server} failed to connect: {last_error}")]
    StartFailed {
        server: String,
        failed: usize,
        total: usize,
        last_error: String,
    },

    #[error("No connected tunnels to {0}")]
    NoTunnels(String),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Pool {0} already exists")]
    PoolExists(String),

    #[error("Pool {0} was created concurrently")]
    CreatedConcurrently(String),

    #[error("Pool {0} not found")]
    PoolNotFound(String),

    #[error("IP {0} is blocked")]
    Blocked(IpAddr),

    #[error("Access denied for {0}: daily limit reached")]
    AccessDenied(IpAddr),

    #[error("No connection pools available")]
    NoPools,

    #[error("No connected tunnels available")]
    NoTunnels,

    #[error("Forward to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("Failed to persist blocklist: {0}")]
    Persistence(#[from] ConfigError),
}
