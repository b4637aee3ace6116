//! The "direct" provider: egress through the real NIC.
//!
//! Sockets are bound to the physical interface before connecting; the
//! backup copies of the capture routes make sure bound sockets actually
//! leave through it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};

use super::transport::{AsyncStream, DatagramSocket};

#[derive(Default)]
pub struct DirectProvider {
    bind_interface: RwLock<Option<String>>,
}

impl DirectProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the interface new sockets bind to. Existing connections keep
    /// their binding.
    pub fn set_bind_interface(&self, interface: Option<String>) {
        tracing::debug!(?interface, "Direct provider now binds to");

        *self.bind_interface.write() = interface;
    }

    pub async fn dial_tcp(&self, addr: SocketAddr) -> io::Result<Box<dyn AsyncStream>> {
        let socket = self.tcp_socket(addr)?;

        let stream = socket.connect(addr).await?;

        Ok(Box::new(stream))
    }

    pub async fn dial_udp(&self, addr: SocketAddr) -> io::Result<Arc<dyn DatagramSocket>> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        self.bind_to_device(&socket)?;

        let socket = std::net::UdpSocket::from(socket);
        let socket = tokio::net::UdpSocket::try_from(socket)?;
        socket.connect(addr).await?;

        Ok(Arc::new(DirectDatagram { socket }))
    }

    fn tcp_socket(&self, addr: SocketAddr) -> io::Result<tokio::net::TcpSocket> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        self.bind_to_device(&socket)?;

        let socket = tokio::net::TcpSocket::from_std_stream(socket.into());
        socket.set_nodelay(true)?;

        Ok(socket)
    }

    #[cfg(target_os = "linux")]
    fn bind_to_device(&self, socket: &Socket) -> io::Result<()> {
        let Some(interface) = self.bind_interface.read().clone() else {
            return Ok(());
        };

        socket.bind_device(Some(interface.as_bytes()))
    }

    #[cfg(not(target_os = "linux"))]
    fn bind_to_device(&self, _socket: &Socket) -> io::Result<()> {
        Ok(())
    }
}

struct DirectDatagram {
    socket: tokio::net::UdpSocket,
}

impl DatagramSocket for DirectDatagram {
    fn send<'a>(&'a self, buf: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(self.socket.send(buf))
    }

    fn recv<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(self.socket.recv(buf))
    }
}
