#![cfg_attr(test, allow(clippy::unwrap_used))]

mod device;

pub use device::QueueDevice;
pub use smoltcp::iface::{Interface, PollResult, SocketHandle, SocketSet};
pub use smoltcp::socket::tcp::{ListenError, RecvError, SendError, Socket, State};
pub use smoltcp::wire::{IpAddress, IpEndpoint, IpListenEndpoint};

use smoltcp::iface::Config;
use smoltcp::socket::tcp::SocketBuffer;
use smoltcp::wire::{HardwareAddress, Ipv4Address, Ipv4Cidr, Ipv6Address, Ipv6Cidr};
use std::time::Instant;

const SOCKET_BUFFER_SIZE: usize = 64 * 1024;

/// Builds the interface the proxy's sockets live on.
///
/// Nothing here is visible to the host network stack, which shapes the whole
/// configuration:
/// - Flows are accepted *as* their real destination, so the interface must
///   take packets addressed to arbitrary IPs (`set_any_ip`).
/// - The interface still needs addresses of its own; link-local placeholders
///   serve, they never appear on the wire.
/// - There is no next hop to resolve. Default routes through the placeholder
///   addresses make every destination "reachable".
pub fn create_interface(device: &mut QueueDevice) -> Interface {
    let placeholder_v4 = Ipv4Address::new(169, 254, 0, 1);
    let placeholder_v6 = Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 1);

    let mut interface = Interface::new(
        Config::new(HardwareAddress::Ip),
        device,
        smoltcp::time::Instant::ZERO,
    );

    interface.set_any_ip(true);

    interface.update_ip_addrs(|addrs| {
        addrs
            .push(Ipv4Cidr::new(placeholder_v4, 32).into())
            .expect("fresh interface has room for one IPv4 address");
        addrs
            .push(Ipv6Cidr::new(placeholder_v6, 128).into())
            .expect("fresh interface has room for one IPv6 address");
    });

    interface
        .routes_mut()
        .add_default_ipv4_route(placeholder_v4)
        .expect("fresh interface has room for one IPv4 route");
    interface
        .routes_mut()
        .add_default_ipv6_route(placeholder_v6)
        .expect("fresh interface has room for one IPv6 route");

    interface
}

pub fn create_tcp_socket() -> Socket<'static> {
    Socket::new(
        SocketBuffer::new(vec![0; SOCKET_BUFFER_SIZE]),
        SocketBuffer::new(vec![0; SOCKET_BUFFER_SIZE]),
    )
}

/// Converts a wall-clock [`Instant`] into smoltcp's epoch-relative time.
pub fn now(created_at: Instant, now: Instant) -> smoltcp::time::Instant {
    smoltcp::time::Instant::from_micros(
        now.saturating_duration_since(created_at).as_micros() as i64
    )
}
