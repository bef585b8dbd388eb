//! SOCKS5 front-end
//!
//! Supports the no-authentication method and the CONNECT command with IPv4,
//! domain and IPv6 targets. The handshake must finish within
//! [`HANDSHAKE_TIMEOUT`]; afterwards the connection is relayed without a
//! deadline.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use xengate_proto::TargetAddr;
use xengate_tunnel::Manager;

use crate::{bind_listener, report_forward, ProxyError};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported SOCKS version {0}")]
    UnsupportedVersion(u8),

    #[error("Client offered no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("Unsupported command {0}")]
    UnsupportedCommand(u8),

    #[error("Unsupported address type {0}")]
    UnsupportedAddressType(u8),

    #[error("Invalid domain name in request")]
    InvalidDomain,
}

/// Reply with the given code and an unspecified `0.0.0.0:0` bind address
pub fn reply(code: u8) -> [u8; 10] {
    [SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

#[derive(Debug)]
pub struct Socks5Proxy {
    host: String,
    port: u16,
    manager: Arc<Manager>,
}

impl Socks5Proxy {
    pub fn new(host: impl Into<String>, port: u16, manager: Arc<Manager>) -> Self {
        Self {
            host: host.into(),
            port,
            manager,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), ProxyError> {
        let listener = bind_listener(&self.host, self.port).await?;
        self.serve(listener, cancel).await
    }

    /// Accept connections on `listener` until `cancel` fires. Connections
    /// still open at that point are closed.
    pub async fn serve(
        self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ProxyError> {
        info!(address = %listener.local_addr()?, "SOCKS5 proxy listening");

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(client = %peer, "SOCKS5 connection accepted");
                    let manager = Arc::clone(&self.manager);
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = handle_connection(stream, peer, manager) => {}
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept SOCKS5 connection: {}", e);
                }
            }
        }

        info!("SOCKS5 proxy stopped");
        Ok(())
    }
}

/// Run the handshake on `stream`, then forward it through `manager`
pub async fn handle_connection<S>(mut stream: S, client: SocketAddr, manager: Arc<Manager>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let target = match tokio::time::timeout(HANDSHAKE_TIMEOUT, negotiate(&mut stream)).await {
        Ok(Ok(target)) => target,
        Ok(Err(e)) => {
            debug!(client = %client, "SOCKS5 handshake failed: {}", e);
            return;
        }
        Err(_) => {
            debug!(client = %client, "SOCKS5 handshake timed out");
            return;
        }
    };

    debug!(client = %client, target = %target, "SOCKS5 CONNECT");
    if let Err(e) = stream.write_all(&reply(REPLY_SUCCEEDED)).await {
        debug!(client = %client, "Failed to send SOCKS5 reply: {}", e);
        return;
    }

    let result = manager.forward(stream, client, &target).await;
    report_forward("socks5", client, &target, &result);
}

/// Method negotiation and request parsing.
///
/// Protocol errors with a defined reply send it before returning; a bad
/// version gets no reply.
pub async fn negotiate<S>(stream: &mut S) -> Result<TargetAddr, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS_VERSION {
        return Err(Socks5Error::UnsupportedVersion(greeting[0]));
    }

    let mut methods = vec![0u8; usize::from(greeting[1])];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        return Err(Socks5Error::NoAcceptableMethod);
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    let [version, command, _, address_type] = request;
    if version != SOCKS_VERSION {
        return Err(Socks5Error::UnsupportedVersion(version));
    }
    if command != CMD_CONNECT {
        stream.write_all(&reply(REPLY_COMMAND_NOT_SUPPORTED)).await?;
        return Err(Socks5Error::UnsupportedCommand(command));
    }

    let host = match address_type {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; usize::from(len[0])];
            stream.read_exact(&mut name).await?;
            match String::from_utf8(name) {
                Ok(name) if !name.is_empty() => name,
                _ => {
                    stream.write_all(&reply(REPLY_GENERAL_FAILURE)).await?;
                    return Err(Socks5Error::InvalidDomain);
                }
            }
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            stream
                .write_all(&reply(REPLY_ADDRESS_TYPE_NOT_SUPPORTED))
                .await?;
            return Err(Socks5Error::UnsupportedAddressType(other));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    Ok(TargetAddr::new(host, u16::from_be_bytes(port)))
}
