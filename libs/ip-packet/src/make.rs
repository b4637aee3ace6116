//! Factory module for the packets the gateway synthesizes itself.

use crate::IpPacket;
use anyhow::{Context as _, Result, bail};
use etherparse::{PacketBuilder, icmpv4, icmpv6};
use std::net::IpAddr;

/// Helper macro to turn a [`PacketBuilder`] into an [`IpPacket`].
macro_rules! build {
    ($packet:expr, $payload:ident) => {{
        let size = $packet.size($payload.len());
        let mut buf = Vec::with_capacity(size);

        $packet
            .write(&mut buf, &$payload)
            .with_context(|| format!("Payload is too big; len={size}"))?;

        IpPacket::parse(buf).context("Failed to create IP packet")
    }};
}

pub fn udp_packet<SIP, DIP>(
    saddr: SIP,
    daddr: DIP,
    sport: u16,
    dport: u16,
    payload: Vec<u8>,
) -> Result<IpPacket>
where
    SIP: Into<IpAddr>,
    DIP: Into<IpAddr>,
{
    match (saddr.into(), daddr.into()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let packet = PacketBuilder::ipv4(src.octets(), dst.octets(), 64).udp(sport, dport);

            build!(packet, payload)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let packet = PacketBuilder::ipv6(src.octets(), dst.octets(), 64).udp(sport, dport);

            build!(packet, payload)
        }
        _ => bail!(IpVersionMismatch),
    }
}

/// Creates the TCP RST that refuses the connection attempt in `original`.
///
/// Addressed from the original destination back to the client, acknowledging
/// the SYN's sequence number so the client's stack accepts it.
pub fn tcp_rst_for(original: &IpPacket) -> Result<IpPacket> {
    let tcp = original
        .as_tcp()
        .context("Not a TCP packet")?;

    let sport = tcp.destination_port();
    let dport = tcp.source_port();
    let ack = tcp
        .sequence_number()
        .wrapping_add(1)
        .wrapping_add(tcp.payload().len() as u32);
    let payload = Vec::new();

    match (original.destination(), original.source()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let packet = PacketBuilder::ipv4(src.octets(), dst.octets(), 64)
                .tcp(sport, dport, 0, 0)
                .rst()
                .ack(ack);

            build!(packet, payload)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let packet = PacketBuilder::ipv6(src.octets(), dst.octets(), 64)
                .tcp(sport, dport, 0, 0)
                .rst()
                .ack(ack);

            build!(packet, payload)
        }
        _ => bail!(IpVersionMismatch),
    }
}

/// Creates the ICMP "port unreachable" that refuses the datagram in `original`.
pub fn icmp_port_unreachable(original: &IpPacket) -> Result<IpPacket> {
    icmp_dest_unreachable(
        original,
        icmpv4::DestUnreachableHeader::Port,
        icmpv6::DestUnreachableCode::Port,
    )
}

fn icmp_dest_unreachable(
    original: &IpPacket,
    code_v4: icmpv4::DestUnreachableHeader,
    code_v6: icmpv6::DestUnreachableCode,
) -> Result<IpPacket> {
    // The ICMP error quotes the offending IP header plus 8 payload bytes.
    let quoted_len = std::cmp::min(original.packet().len(), 28);
    let payload = original.packet()[..quoted_len].to_vec();

    match (original.destination(), original.source()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let packet = PacketBuilder::ipv4(src.octets(), dst.octets(), 64)
                .icmpv4(etherparse::Icmpv4Type::DestinationUnreachable(code_v4));

            build!(packet, payload)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let packet = PacketBuilder::ipv6(src.octets(), dst.octets(), 64)
                .icmpv6(etherparse::Icmpv6Type::DestinationUnreachable(code_v6));

            build!(packet, payload)
        }
        _ => bail!(IpVersionMismatch),
    }
}

#[derive(thiserror::Error, Debug)]
#[error("IPs must be of the same version")]
pub struct IpVersionMismatch;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn rst_reverses_direction_and_acks_syn() {
        let syn = PacketBuilder::ipv4([10, 0, 0, 2], [1, 1, 1, 1], 64)
            .tcp(40123, 443, 1000, 64240)
            .syn();
        let mut buf = Vec::new();
        syn.write(&mut buf, &[]).unwrap();
        let syn = IpPacket::parse(buf).unwrap();

        let rst = tcp_rst_for(&syn).unwrap();

        assert_eq!(rst.source(), IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(rst.destination(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));

        let tcp = rst.as_tcp().unwrap();
        assert!(tcp.rst());
        assert_eq!(tcp.source_port(), 443);
        assert_eq!(tcp.destination_port(), 40123);
        assert_eq!(tcp.acknowledgment_number(), 1001);
    }

    #[test]
    fn port_unreachable_quotes_original_header() {
        let datagram = udp_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(8, 8, 8, 8),
            50000,
            53,
            vec![0xAA; 32],
        )
        .unwrap();

        let unreachable = icmp_port_unreachable(&datagram).unwrap();

        assert_eq!(unreachable.source(), IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));
        assert_eq!(
            unreachable.destination(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))
        );
        assert!(unreachable.as_icmpv4().is_some());
    }
}
