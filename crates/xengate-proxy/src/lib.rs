//! Protocol front-ends for xengate
//!
//! Each front-end accepts local clients and hands every connection to the
//! [`Manager`], which admits the client and relays it through a tunnel:
//! - SOCKS5 (no authentication, CONNECT only)
//! - HTTP proxy (CONNECT tunnelling, plain request relay, HTTP/2 passthrough)
//! - TUN device (root only, IPv4 TCP/UDP payload relay)
//!
//! [`Proxy::new`] is the single factory, picking the front-end from the
//! configured mode.

pub mod http;
pub mod netconfig;
pub mod packet;
pub mod socks5;
pub mod tuntap;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use xengate_proto::{ProxySettings, TargetAddr};
use xengate_tunnel::{ForwardSummary, Manager, ManagerError};

pub use http::{HttpProxy, HttpProxyError};
pub use netconfig::{CommandRunner, NetConfigError, NetworkConfigurator, SystemRunner};
pub use packet::PacketError;
pub use socks5::{Socks5Error, Socks5Proxy};
pub use tuntap::TunTapProxy;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Unsupported proxy mode: {0}")]
    UnsupportedMode(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TUN device error: {0}")]
    Device(String),

    #[error("Network configuration failed: {0}")]
    Network(#[from] NetConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    Socks5,
    Http,
    TunTap,
}

impl FromStr for ProxyMode {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "socks5" => Ok(ProxyMode::Socks5),
            "http" => Ok(ProxyMode::Http),
            "tuntap" | "tun" => Ok(ProxyMode::TunTap),
            _ => Err(ProxyError::UnsupportedMode(s.to_string())),
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyMode::Socks5 => "socks5",
            ProxyMode::Http => "http",
            ProxyMode::TunTap => "tuntap",
        };
        f.write_str(name)
    }
}

/// A configured front-end
#[derive(Debug)]
pub enum Proxy {
    Socks5(Socks5Proxy),
    Http(HttpProxy),
    TunTap(TunTapProxy),
}

impl Proxy {
    /// Build the front-end selected by `settings.mode`.
    ///
    /// Fails for unknown modes, and for TUN mode when not running as root.
    pub fn new(settings: &ProxySettings, manager: Arc<Manager>) -> Result<Self, ProxyError> {
        let mode: ProxyMode = settings.mode.parse()?;
        let proxy = match mode {
            ProxyMode::Socks5 => Proxy::Socks5(Socks5Proxy::new(
                settings.listen_addr.clone(),
                settings.listen_port,
                manager,
            )),
            ProxyMode::Http => Proxy::Http(HttpProxy::new(
                settings.listen_addr.clone(),
                settings.listen_port,
                manager,
            )),
            ProxyMode::TunTap => Proxy::TunTap(TunTapProxy::new(settings, manager)?),
        };
        Ok(proxy)
    }

    pub fn mode(&self) -> ProxyMode {
        match self {
            Proxy::Socks5(_) => ProxyMode::Socks5,
            Proxy::Http(_) => ProxyMode::Http,
            Proxy::TunTap(_) => ProxyMode::TunTap,
        }
    }

    /// Serve until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ProxyError> {
        match self {
            Proxy::Socks5(proxy) => proxy.run(cancel).await,
            Proxy::Http(proxy) => proxy.run(cancel).await,
            Proxy::TunTap(proxy) => proxy.run(cancel).await,
        }
    }
}

pub(crate) async fn bind_listener(host: &str, port: u16) -> Result<TcpListener, ProxyError> {
    TcpListener::bind((host, port))
        .await
        .map_err(|source| ProxyError::Bind {
            address: format!("{}:{}", host, port),
            source,
        })
}

/// Log the outcome of a forward. Refusals are already logged by the manager.
pub(crate) fn report_forward(
    front: &'static str,
    client: SocketAddr,
    target: &TargetAddr,
    result: &Result<ForwardSummary, ManagerError>,
) {
    match result {
        Ok(summary) => debug!(
            front,
            client = %client,
            target = %target,
            tunnel = %summary.tunnel_id,
            bytes_up = summary.bytes_up,
            bytes_down = summary.bytes_down,
            "Forward finished"
        ),
        Err(e @ (ManagerError::Blocked(_) | ManagerError::AccessDenied(_))) => {
            debug!(front, client = %client, target = %target, "Forward refused: {}", e)
        }
        Err(e) => warn!(front, client = %client, target = %target, "Forward failed: {}", e),
    }
}
