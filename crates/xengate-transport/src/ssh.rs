//! SSH sessions over russh
//!
//! Password authentication, `direct-tcpip` channels for streams and global
//! keepalive requests as the liveness probe.

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::ssh_key::PublicKey;
use russh::Disconnect;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    BoxedStream, ConnectRequest, Session, SessionConnector, TransportError, TransportResult,
};

/// Originator reported in `direct-tcpip` channel requests
const ORIGINATOR_ADDRESS: &str = "127.0.0.1";
const ORIGINATOR_PORT: u32 = 0;

/// Client handler that trusts every host key.
///
/// Servers are identified by the profile the operator configured; there is
/// no known-hosts store to check against.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustingHandler;

impl client::Handler for TrustingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Dials password-authenticated SSH sessions
#[derive(Clone)]
pub struct SshConnector {
    config: Arc<client::Config>,
}

impl SshConnector {
    pub fn new() -> Self {
        Self::with_config(client::Config::default())
    }

    pub fn with_config(config: client::Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SshConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConnector").finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn connect(&self, request: &ConnectRequest) -> TransportResult<Arc<dyn Session>> {
        debug!(tunnel = %request.tunnel_id, address = %request.address, "Dialing SSH server");

        let mut handle = client::connect(
            Arc::clone(&self.config),
            request.address.as_str(),
            TrustingHandler,
        )
        .await
        .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        let auth = handle
            .authenticate_password(request.user.clone(), request.password.clone())
            .await
            .map_err(|e| TransportError::AuthenticationFailed(e.to_string()))?;

        if !auth.success() {
            return Err(TransportError::AuthenticationFailed(format!(
                "password rejected for user {}",
                request.user
            )));
        }

        info!(tunnel = %request.tunnel_id, address = %request.address, "SSH session established");

        Ok(Arc::new(SshSession {
            tunnel_id: request.tunnel_id.clone(),
            handle,
        }))
    }
}

/// Authenticated SSH session
pub struct SshSession {
    tunnel_id: String,
    handle: Handle<TrustingHandler>,
}

impl fmt::Debug for SshSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshSession")
            .field("tunnel_id", &self.tunnel_id)
            .field("closed", &self.handle.is_closed())
            .finish()
    }
}

#[async_trait]
impl Session for SshSession {
    async fn open_stream(&self, host: &str, port: u16) -> TransportResult<BoxedStream> {
        if self.handle.is_closed() {
            return Err(TransportError::SessionClosed);
        }

        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), ORIGINATOR_ADDRESS, ORIGINATOR_PORT)
            .await
            .map_err(|e| TransportError::ChannelError(e.to_string()))?;

        Ok(Box::new(channel.into_stream()))
    }

    async fn keepalive(&self) -> TransportResult<()> {
        if self.handle.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        self.handle
            .send_keepalive(true)
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn close(&self) {
        if self.handle.is_closed() {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(tunnel = %self.tunnel_id, "SSH disconnect failed: {}", e);
        }
    }
}
