//! HTTP proxy front-end
//!
//! Reads one request head (at most [`MAX_HEAD_SIZE`] bytes within
//! [`HEAD_TIMEOUT`]) and then:
//! - `CONNECT host:port` answers `200 Connection Established` and tunnels
//!   the rest of the client stream verbatim
//! - plain requests are rewritten to origin form and relayed, one request per
//!   client connection
//! - `HTTP/2` request lines are passed through untouched as an opaque tunnel

use bytes::{Buf, Bytes};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use xengate_proto::TargetAddr;
use xengate_tunnel::Manager;

use crate::{bind_listener, report_forward, ProxyError};

pub const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_HEADERS: usize = 100;
const READ_CHUNK: usize = 4096;
const PIPE_CAPACITY: usize = 64 * 1024;

const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const RESPONSE_BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const RESPONSE_BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Hop-by-hop headers replaced when relaying a plain request
const DROPPED_HEADERS: [&str; 3] = ["proxy-connection", "connection", "keep-alive"];

#[derive(Debug, Error)]
pub enum HttpProxyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("Connection closed before the request head was complete")]
    ClosedBeforeHead,

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Request has no absolute URI and no Host header")]
    MissingHost,
}

/// What the client asked the proxy to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyRequest {
    /// `CONNECT`; everything after the head is tunnelled as-is
    Connect { target: TargetAddr },
    /// HTTP/1.x request with `head` rewritten for the origin server
    Plain { target: TargetAddr, head: Vec<u8> },
    /// HTTP/2 request line; the whole stream is tunnelled untouched
    Passthrough { target: TargetAddr },
}

#[derive(Debug)]
pub struct HttpProxy {
    host: String,
    port: u16,
    manager: Arc<Manager>,
}

impl HttpProxy {
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
        info!(address = %listener.local_addr()?, "HTTP proxy listening");

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(client = %peer, "HTTP connection accepted");
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
                    error!("Failed to accept HTTP connection: {}", e);
                }
            }
        }

        info!("HTTP proxy stopped");
        Ok(())
    }
}

pub async fn handle_connection<S>(mut stream: S, client: SocketAddr, manager: Arc<Manager>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let buf = match tokio::time::timeout(HEAD_TIMEOUT, read_head(&mut stream)).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(HttpProxyError::HeadTooLarge(limit))) => {
            debug!(client = %client, limit, "HTTP request head too large");
            let _ = stream.write_all(RESPONSE_BAD_REQUEST).await;
            return;
        }
        Ok(Err(e)) => {
            debug!(client = %client, "Failed to read HTTP request: {}", e);
            return;
        }
        Err(_) => {
            debug!(client = %client, "HTTP request head timed out");
            return;
        }
    };

    let (request, head_len) = match parse_request(&buf) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(client = %client, "Rejecting HTTP request: {}", e);
            let _ = stream.write_all(RESPONSE_BAD_REQUEST).await;
            return;
        }
    };

    match request {
        ProxyRequest::Connect { target } => {
            debug!(client = %client, target = %target, "HTTP CONNECT");
            if let Err(e) = stream.write_all(RESPONSE_ESTABLISHED).await {
                debug!(client = %client, "Failed to acknowledge CONNECT: {}", e);
                return;
            }
            let local = Prefixed::new(buf[head_len..].to_vec(), stream);
            let result = manager.forward(local, client, &target).await;
            report_forward("http", client, &target, &result);
        }
        ProxyRequest::Passthrough { target } => {
            debug!(client = %client, target = %target, "HTTP/2 passthrough");
            let local = Prefixed::new(buf, stream);
            let result = manager.forward(local, client, &target).await;
            report_forward("http", client, &target, &result);
        }
        ProxyRequest::Plain { target, head } => {
            debug!(client = %client, target = %target, "HTTP request");
            let body = buf[head_len..].to_vec();
            relay_plain(stream, client, manager, target, head, body).await;
        }
    }
}

/// Send one rewritten request through an in-memory pipe whose other end is
/// forwarded, and copy the response back to the client
async fn relay_plain<S>(
    stream: S,
    client: SocketAddr,
    manager: Arc<Manager>,
    target: TargetAddr,
    head: Vec<u8>,
    body: Vec<u8>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
    let forward = {
        let target = target.clone();
        tokio::spawn(async move { manager.forward(far, client, &target).await })
    };

    let (mut near_read, mut near_write) = tokio::io::split(near);
    let (mut client_read, mut client_write) = tokio::io::split(stream);
    let response_done = CancellationToken::new();

    let download = async {
        let copied = tokio::io::copy(&mut near_read, &mut client_write).await;
        response_done.cancel();
        copied
    };
    let upload = async {
        tokio::select! {
            _ = response_done.cancelled() => {}
            sent = send_request(&mut near_write, &head, &body, &mut client_read) => {
                if let Err(e) = sent {
                    debug!(client = %client, "Request upload ended: {}", e);
                }
            }
        }
    };

    let (response, ()) = tokio::join!(download, upload);
    drop(near_read);
    drop(near_write);

    let result = match forward.await {
        Ok(result) => result,
        Err(e) => {
            warn!(client = %client, target = %target, "Forward task failed: {}", e);
            return;
        }
    };

    let nothing_returned = matches!(response, Ok(0));
    if nothing_returned && result.is_err() {
        let _ = client_write.write_all(RESPONSE_BAD_GATEWAY).await;
    }
    let _ = client_write.shutdown().await;

    report_forward("http", client, &target, &result);
}

async fn send_request<W, R>(
    pipe: &mut W,
    head: &[u8],
    body: &[u8],
    client: &mut R,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    pipe.write_all(head).await?;
    pipe.write_all(body).await?;
    tokio::io::copy(client, pipe).await?;
    pipe.shutdown().await
}

/// Read until the end of the request head. The returned buffer may hold
/// bytes past the head.
pub async fn read_head<S>(stream: &mut S) -> Result<Vec<u8>, HttpProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        if find_head_end(&buf).is_some() {
            return Ok(buf);
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(HttpProxyError::HeadTooLarge(MAX_HEAD_SIZE));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpProxyError::ClosedBeforeHead);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Offset just past the blank line ending the head
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Parse the request head at the start of `buf`. Returns the request and the
/// length of the head.
pub fn parse_request(buf: &[u8]) -> Result<(ProxyRequest, usize), HttpProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    let head_len = match request.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            return Err(HttpProxyError::Malformed("incomplete request head".to_string()))
        }
        Err(httparse::Error::Version) if is_http2(buf) => return parse_passthrough(buf),
        Err(e) => return Err(HttpProxyError::Malformed(e.to_string())),
    };

    let method = request.method.unwrap_or_default();
    let path = request.path.unwrap_or_default();
    let version = request.version.unwrap_or(1);

    if method.eq_ignore_ascii_case("CONNECT") {
        let target = path
            .parse::<TargetAddr>()
            .map_err(|e| HttpProxyError::InvalidTarget(e.to_string()))?;
        return Ok((ProxyRequest::Connect { target }, head_len));
    }

    let host_header = request
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .and_then(|h| std::str::from_utf8(h.value).ok());
    let (target, origin_form) = resolve_target(path, host_header)?;

    let mut head = format!("{} {} HTTP/1.{}\r\n", method, origin_form, version).into_bytes();
    for header in request.headers.iter() {
        let name = header.name.to_ascii_lowercase();
        if DROPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        head.extend_from_slice(header.name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(header.value);
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"Connection: close\r\n\r\n");

    Ok((ProxyRequest::Plain { target, head }, head_len))
}

/// Target and origin-form path for an absolute URI or a path plus `Host`
fn resolve_target(
    uri: &str,
    host_header: Option<&str>,
) -> Result<(TargetAddr, String), HttpProxyError> {
    if uri.starts_with('/') {
        let host = host_header.ok_or(HttpProxyError::MissingHost)?;
        let target = TargetAddr::parse_with_default_port(host, 80)
            .map_err(|e| HttpProxyError::InvalidTarget(e.to_string()))?;
        return Ok((target, uri.to_string()));
    }

    let url = Url::parse(uri).map_err(|e| HttpProxyError::InvalidTarget(format!("{}: {}", uri, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| HttpProxyError::InvalidTarget(uri.to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| HttpProxyError::InvalidTarget(format!("no port for {}", uri)))?;

    let mut origin_form = url.path().to_string();
    if let Some(query) = url.query() {
        origin_form.push('?');
        origin_form.push_str(query);
    }
    Ok((TargetAddr::new(host, port), origin_form))
}

fn request_line(buf: &[u8]) -> Option<&str> {
    let end = buf.windows(2).position(|w| w == b"\r\n")?;
    std::str::from_utf8(&buf[..end]).ok()
}

fn is_http2(buf: &[u8]) -> bool {
    request_line(buf)
        .and_then(|line| line.split_whitespace().nth(2))
        .map(|version| version.starts_with("HTTP/2"))
        .unwrap_or(false)
}

fn parse_passthrough(buf: &[u8]) -> Result<(ProxyRequest, usize), HttpProxyError> {
    let line = request_line(buf)
        .ok_or_else(|| HttpProxyError::Malformed("unreadable request line".to_string()))?;
    let uri = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| HttpProxyError::Malformed(line.to_string()))?;

    let host_header = buf
        .split(|b| *b == b'\n')
        .skip(1)
        .filter_map(|l| std::str::from_utf8(l).ok())
        .filter_map(|l| l.trim_end_matches('\r').split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("host"))
        .map(|(_, value)| value.trim());

    let (target, _) = resolve_target(uri, host_header)?;
    let head_len = find_head_end(buf).unwrap_or(buf.len());
    Ok((ProxyRequest::Passthrough { target }, head_len))
}

/// Stream that yields already-buffered bytes before reading from `inner`.
/// Writes go straight to `inner`.
#[derive(Debug)]
pub struct Prefixed<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Prefixed<S> {
    pub fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.prefix.has_remaining() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
