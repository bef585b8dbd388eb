//! TUN front-end
//!
//! Reads IPv4 packets from a TUN device, relays the TCP/UDP payload of each
//! packet to its destination through the manager, and writes whatever comes
//! back to the device wrapped in a fresh IPv4 header. There is no TCP state
//! machine: every packet with a payload becomes its own short-lived flow.

use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use xengate_proto::{ProxySettings, TargetAddr};
use xengate_tunnel::{is_normal_close, Manager};

use crate::netconfig::{NetworkConfigurator, SystemRunner};
use crate::packet::{self, Transport, IPV4_HEADER_LEN};
use crate::{report_forward, ProxyError};

pub const DEFAULT_DEVICE: &str = "tun0";
pub const DEFAULT_EGRESS_INTERFACE: &str = "eth0";

/// A flow with no returned data for this long is closed
pub const FLOW_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_PACKET_SIZE: usize = 65535;
const MTU: usize = 1500;
const MAX_REPLY_PAYLOAD: usize = MTU - IPV4_HEADER_LEN;
const PACKET_QUEUE: usize = 1024;
const PIPE_CAPACITY: usize = 64 * 1024;

/// Whether the process runs with effective uid 0
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

#[derive(Debug, Default)]
struct Counters {
    active_flows: AtomicU64,
    total_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunStats {
    pub active_flows: u64,
    /// Bytes read from the device
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct Flow {
    transport: Transport,
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
}

#[derive(Debug)]
pub struct TunTapProxy {
    device: String,
    address: Ipv4Addr,
    egress: String,
    route_all: bool,
    manager: Arc<Manager>,
    counters: Arc<Counters>,
}

impl TunTapProxy {
    /// Fails with [`ProxyError::PermissionDenied`] unless running as root
    pub fn new(settings: &ProxySettings, manager: Arc<Manager>) -> Result<Self, ProxyError> {
        if !is_root() {
            return Err(ProxyError::PermissionDenied(
                "TUN mode requires root privileges".to_string(),
            ));
        }
        Self::from_settings(settings, manager)
    }

    fn from_settings(settings: &ProxySettings, manager: Arc<Manager>) -> Result<Self, ProxyError> {
        let address = settings.listen_addr.parse::<Ipv4Addr>().map_err(|_| {
            ProxyError::InvalidAddress(format!(
                "TUN address {} is not an IPv4 address",
                settings.listen_addr
            ))
        })?;

        Ok(Self {
            device: settings
                .device
                .clone()
                .unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            address,
            egress: settings
                .egress_interface
                .clone()
                .unwrap_or_else(|| DEFAULT_EGRESS_INTERFACE.to_string()),
            route_all: settings.route_all,
            manager,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn stats(&self) -> TunStats {
        TunStats {
            active_flows: self.counters.active_flows.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
        }
    }

    /// Create the device, configure the host and serve until `cancel`
    /// fires. Host configuration is restored on the way out, also when
    /// setup fails halfway.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ProxyError> {
        let device = self.create_device()?;
        info!(device = %self.device, address = %self.address, "TUN device created");

        let runner = SystemRunner;
        let mut network =
            NetworkConfigurator::new(&self.device, self.address, &self.egress, self.route_all);
        if let Err(e) = network.setup(&runner).await {
            network.teardown(&runner).await;
            return Err(e.into());
        }

        let device_name = self.device.clone();
        let result = self.serve(device, cancel).await;

        network.teardown(&runner).await;
        info!(device = %device_name, "TUN proxy stopped");
        result
    }

    fn create_device(&self) -> Result<tun::AsyncDevice, ProxyError> {
        let mut config = tun::Configuration::default();
        config.name(&self.device);

        #[cfg(target_os = "linux")]
        config.platform(|config| {
            config.packet_information(false);
        });

        tun::create_as_async(&config).map_err(|e| ProxyError::Device(e.to_string()))
    }

    /// Packet loop over an already configured device
    pub async fn serve<D>(self, device: D, cancel: CancellationToken) -> Result<(), ProxyError>
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(device);
        let (packets_tx, mut packets_rx) = mpsc::channel::<Bytes>(PACKET_QUEUE);

        // Single writer so replies from concurrent flows never interleave
        let writer_task = tokio::spawn(async move {
            while let Some(packet) = packets_rx.recv().await {
                if let Err(e) = writer.write_all(&packet).await {
                    warn!("Failed to write to TUN device: {}", e);
                    break;
                }
            }
        });

        let flows = cancel.child_token();
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        let result = loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => n,
                    Err(e) if is_normal_close(&e) => break Ok(()),
                    Err(e) => break Err(ProxyError::Io(e)),
                },
            };
            self.counters
                .total_bytes
                .fetch_add(n as u64, Ordering::Relaxed);

            let parsed = match packet::parse_ipv4(&buf[..n]) {
                Ok(parsed) => parsed,
                Err(e) => {
                    trace!("Dropping packet: {}", e);
                    continue;
                }
            };
            // Handshake and ack segments carry nothing to relay
            if parsed.payload.is_empty() {
                continue;
            }

            let flow = Flow {
                transport: parsed.transport,
                src: parsed.src,
                src_port: parsed.src_port,
                dst: parsed.dst,
                dst_port: parsed.dst_port,
            };
            tokio::spawn(relay_flow(
                Arc::clone(&self.manager),
                Arc::clone(&self.counters),
                flow,
                parsed.payload.to_vec(),
                packets_tx.clone(),
                flows.child_token(),
            ));
        };

        flows.cancel();
        drop(packets_tx);
        writer_task.abort();
        result
    }
}

async fn relay_flow(
    manager: Arc<Manager>,
    counters: Arc<Counters>,
    flow: Flow,
    payload: Vec<u8>,
    packets: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let client = SocketAddr::from((flow.src, flow.src_port));
    let target = TargetAddr::new(flow.dst.to_string(), flow.dst_port);
    debug!(transport = ?flow.transport, client = %client, target = %target, "TUN flow");

    counters.active_flows.fetch_add(1, Ordering::Relaxed);

    let (mut near, far) = tokio::io::duplex(PIPE_CAPACITY);
    let forward = {
        let target = target.clone();
        tokio::spawn(async move { manager.forward(far, client, &target).await })
    };

    if let Err(e) = near.write_all(&payload).await {
        if !is_normal_close(&e) {
            debug!(target = %target, "Failed to hand payload to tunnel: {}", e);
        }
    }

    let mut chunk = vec![0u8; MAX_REPLY_PAYLOAD];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = tokio::time::timeout(FLOW_IDLE_TIMEOUT, near.read(&mut chunk)) => read,
        };
        let n = match read {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                if !is_normal_close(&e) {
                    debug!(target = %target, "TUN flow read failed: {}", e);
                }
                break;
            }
            Err(_) => {
                debug!(target = %target, "TUN flow idle, closing");
                break;
            }
        };

        let reply = match packet::wrap_payload(
            flow.dst,
            flow.src,
            flow.transport.protocol(),
            &chunk[..n],
        ) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(target = %target, "Failed to build reply packet: {}", e);
                break;
            }
        };
        if packets.send(Bytes::from(reply)).await.is_err() {
            break;
        }
    }
    drop(near);

    if cancel.is_cancelled() {
        forward.abort();
    } else {
        match forward.await {
            Ok(result) => report_forward("tuntap", client, &target, &result),
            Err(e) => warn!(target = %target, "Forward task failed: {}", e),
        }
    }

    counters.active_flows.fetch_sub(1, Ordering::Relaxed);
}
