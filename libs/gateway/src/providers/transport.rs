//! The contract a VPN engine must satisfy.
//!
//! The concrete WireGuard / AmneziaWG engine is an external library; the
//! gateway consumes it exclusively through [`VpnStack`]. The in-memory
//! [`LoopbackStack`] implements the same contract for tests and local smoke
//! runs.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use futures::future::BoxFuture;
use ip_packet::IpPacket;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;

use crate::config::Priority;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A connected datagram socket.
pub trait DatagramSocket: Send + Sync + 'static {
    fn send<'a>(&'a self, buf: &'a [u8]) -> BoxFuture<'a, io::Result<usize>>;

    fn recv<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>>;
}

pub type InboundHandler = Box<dyn Fn(IpPacket) + Send + Sync>;

/// A userspace VPN network endpoint.
///
/// `dial_tcp` / `dial_udp` open L4 connections *through* the tunnel;
/// `inject_outbound` is the raw-IP fast path for traffic the gateway does
/// not terminate itself.
pub trait VpnStack: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    fn disconnect(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    fn dial_tcp(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<Box<dyn AsyncStream>>>;

    fn dial_udp(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<Arc<dyn DatagramSocket>>>;

    fn inject_outbound(&self, packet: IpPacket, priority: Priority) -> io::Result<()>;

    /// Registers the callback invoked for raw IP packets emitted from the
    /// tunnel. The dispatcher bridges these back into the TUN.
    fn set_inbound_handler(&self, handler: InboundHandler);

    /// The tunnel's remote endpoints, for bypass-route installation.
    fn server_endpoints(&self) -> Vec<SocketAddrV4>;

    /// The local endpoint IP within the tunnel's userspace stack.
    fn local_ip(&self) -> Option<Ipv4Addr>;

    /// Engine status as `key=value` lines, including
    /// `last_handshake_time_sec` and `persistent_keepalive_interval`.
    fn status_line(&self) -> String;
}

/// What a [`LoopbackStack`] accepted: the dialed address plus the far end of
/// the connection.
pub enum LoopbackAccept {
    Tcp(SocketAddr, DuplexStream),
    Udp(SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>, mpsc::UnboundedSender<Vec<u8>>),
}

/// In-memory [`VpnStack`]: every dial succeeds and its far end is handed to
/// the accept channel for inspection.
pub struct LoopbackStack {
    endpoints: Vec<SocketAddrV4>,
    accept_tx: mpsc::UnboundedSender<LoopbackAccept>,
    inbound_handler: Mutex<Option<InboundHandler>>,
    injected: Mutex<Vec<IpPacket>>,
    status: Mutex<String>,
}

impl LoopbackStack {
    pub fn new(endpoints: Vec<SocketAddrV4>) -> (Self, mpsc::UnboundedReceiver<LoopbackAccept>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        (
            Self {
                endpoints,
                accept_tx,
                inbound_handler: Mutex::new(None),
                injected: Mutex::new(Vec::new()),
                status: Mutex::new(String::new()),
            },
            accept_rx,
        )
    }

    /// Pushes a raw packet "from the tunnel" into the registered handler.
    pub fn emit_inbound(&self, packet: IpPacket) {
        if let Some(handler) = self.inbound_handler.lock().as_ref() {
            handler(packet);
        }
    }

    pub fn injected_packets(&self) -> Vec<IpPacket> {
        self.injected.lock().clone()
    }

    pub fn set_status(&self, status: &str) {
        *self.status.lock() = status.to_owned();
    }
}

impl VpnStack for LoopbackStack {
    fn connect(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn disconnect(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn dial_tcp(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<Box<dyn AsyncStream>>> {
        Box::pin(async move {
            let (near, far) = tokio::io::duplex(64 * 1024);

            self.accept_tx
                .send(LoopbackAccept::Tcp(addr, far))
                .map_err(|_| io::Error::other("Loopback closed"))?;

            Ok(Box::new(near) as Box<dyn AsyncStream>)
        })
    }

    fn dial_udp(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<Arc<dyn DatagramSocket>>> {
        Box::pin(async move {
            let (to_far_tx, to_far_rx) = mpsc::unbounded_channel();
            let (from_far_tx, from_far_rx) = mpsc::unbounded_channel();

            self.accept_tx
                .send(LoopbackAccept::Udp(addr, to_far_rx, from_far_tx))
                .map_err(|_| io::Error::other("Loopback closed"))?;

            Ok(Arc::new(LoopbackDatagram {
                tx: to_far_tx,
                rx: tokio::sync::Mutex::new(from_far_rx),
            }) as Arc<dyn DatagramSocket>)
        })
    }

    fn inject_outbound(&self, packet: IpPacket, _priority: Priority) -> io::Result<()> {
        self.injected.lock().push(packet);

        Ok(())
    }

    fn set_inbound_handler(&self, handler: InboundHandler) {
        *self.inbound_handler.lock() = Some(handler);
    }

    fn server_endpoints(&self) -> Vec<SocketAddrV4> {
        self.endpoints.clone()
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        Some(Ipv4Addr::new(10, 255, 0, 1))
    }

    fn status_line(&self) -> String {
        self.status.lock().clone()
    }
}

struct LoopbackDatagram {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl DatagramSocket for LoopbackDatagram {
    fn send<'a>(&'a self, buf: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            self.tx
                .send(buf.to_vec())
                .map_err(|_| io::Error::other("Loopback closed"))?;

            Ok(buf.len())
        })
    }

    fn recv<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            let datagram = self
                .rx
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| io::Error::other("Loopback closed"))?;

            let n = datagram.len().min(buf.len());
            buf[..n].copy_from_slice(&datagram[..n]);

            Ok(n)
        })
    }
}
