#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod make;

pub use etherparse::*;

use anyhow::{Context as _, Result};
use std::fmt;
use std::net::IpAddr;

/// The maximum size of an IP packet we can handle.
pub const MAX_IP_SIZE: usize = 1500;

/// An owned, validated IP datagram.
///
/// Construction guarantees that the buffer holds exactly one well-formed,
/// unfragmented IPv4 or IPv6 packet and that a UDP / TCP / ICMP payload
/// parses as such.
#[derive(PartialEq, Clone)]
pub struct IpPacket {
    buf: Vec<u8>,
    version: IpVersion,
    ip_header_length: usize,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum IpVersion {
    V4,
    V6,
}

#[derive(Debug, thiserror::Error)]
#[error("Packet is fragmented")]
pub struct Fragmented;

impl IpPacket {
    pub fn parse(buf: Vec<u8>) -> Result<Self> {
        anyhow::ensure!(buf.len() <= MAX_IP_SIZE, "Packet too large ({})", buf.len());

        let ip = IpSlice::from_slice(&buf).context("Failed to parse IP packet")?;

        anyhow::ensure!(!ip.is_fragmenting_payload(), Fragmented);

        let src_ip = ip.source_addr();
        let dst_ip = ip.destination_addr();

        match ip.payload_ip_number() {
            IpNumber::UDP => {
                UdpSlice::from_slice(ip.payload().payload).with_context(|| {
                    format!("Failed to parse UDP packet; src IP = {src_ip}, dst IP = {dst_ip}")
                })?;
            }
            IpNumber::TCP => {
                TcpSlice::from_slice(ip.payload().payload).with_context(|| {
                    format!("Failed to parse TCP packet; src IP = {src_ip}, dst IP = {dst_ip}")
                })?;
            }
            IpNumber::ICMP => {
                anyhow::ensure!(
                    matches!(ip, IpSlice::Ipv4(_)),
                    "ICMPv4 is only allowed in IPv4 packets"
                );

                Icmpv4Slice::from_slice(ip.payload().payload).with_context(|| {
                    format!("Failed to parse ICMPv4 packet; src IP = {src_ip}, dst IP = {dst_ip}")
                })?;
            }
            IpNumber::IPV6_ICMP => {
                anyhow::ensure!(
                    matches!(ip, IpSlice::Ipv6(_)),
                    "ICMPv6 is only allowed in IPv6 packets"
                );

                Icmpv6Slice::from_slice(ip.payload().payload).with_context(|| {
                    format!("Failed to parse ICMPv6 packet; src IP = {src_ip}, dst IP = {dst_ip}")
                })?;
            }
            _ => {}
        }

        let version = match ip {
            IpSlice::Ipv4(_) => IpVersion::V4,
            IpSlice::Ipv6(_) => IpVersion::V6,
        };
        let ip_header_length = match ip {
            IpSlice::Ipv4(ref ipv4) => ipv4.header().ihl() as usize * 4,
            IpSlice::Ipv6(ref ipv6) => {
                ipv6.header().header_len() + ipv6.extensions().slice().len()
            }
        };

        Ok(Self {
            buf,
            version,
            ip_header_length,
        })
    }

    pub fn version(&self) -> IpVersion {
        self.version
    }

    pub fn source(&self) -> IpAddr {
        match self.version {
            IpVersion::V4 => self.ipv4_header_slice().source_addr().into(),
            IpVersion::V6 => self.ipv6_header_slice().source_addr().into(),
        }
    }

    pub fn destination(&self) -> IpAddr {
        match self.version {
            IpVersion::V4 => self.ipv4_header_slice().destination_addr().into(),
            IpVersion::V6 => self.ipv6_header_slice().destination_addr().into(),
        }
    }

    pub fn next_header(&self) -> IpNumber {
        match self.version {
            IpVersion::V4 => self.ipv4_header_slice().protocol(),
            IpVersion::V6 => {
                // Validated in `parse`.
                IpSlice::from_slice(&self.buf)
                    .map(|ip| ip.payload_ip_number())
                    .unwrap_or(IpNumber(0xFF))
            }
        }
    }

    pub fn is_udp(&self) -> bool {
        self.next_header() == IpNumber::UDP
    }

    pub fn is_tcp(&self) -> bool {
        self.next_header() == IpNumber::TCP
    }

    pub fn is_icmp(&self) -> bool {
        matches!(self.next_header(), IpNumber::ICMP | IpNumber::IPV6_ICMP)
    }

    pub fn as_udp(&self) -> Option<UdpSlice<'_>> {
        self.is_udp()
            .then(|| UdpSlice::from_slice(self.l4_payload()).ok())
            .flatten()
    }

    pub fn as_tcp(&self) -> Option<TcpSlice<'_>> {
        self.is_tcp()
            .then(|| TcpSlice::from_slice(self.l4_payload()).ok())
            .flatten()
    }

    pub fn as_icmpv4(&self) -> Option<Icmpv4Slice<'_>> {
        (self.next_header() == IpNumber::ICMP)
            .then(|| Icmpv4Slice::from_slice(self.l4_payload()).ok())
            .flatten()
    }

    /// The whole packet, including the IP header.
    pub fn packet(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Recomputes the IPv4 header checksum and the L4 checksum in place.
    ///
    /// Infallible on packets that passed `parse`.
    pub fn update_checksum(&mut self) {
        let _ = self.try_update_checksum();
    }

    fn try_update_checksum(&mut self) -> Result<()> {
        let (ip_v4, ip_v6) = match self.version {
            IpVersion::V4 => {
                let header = self.ipv4_header_slice().to_header();
                let checksum = header.calc_header_checksum();
                self.buf[10..12].copy_from_slice(&checksum.to_be_bytes());

                (Some(header), None)
            }
            IpVersion::V6 => (None, Some(self.ipv6_header_slice().to_header())),
        };

        let l4_start = self.ip_header_length;

        match self.next_header() {
            IpNumber::TCP => {
                let header = TcpHeaderSlice::from_slice(&self.buf[l4_start..])
                    .context("Failed to parse TCP header")?
                    .to_header();
                let payload_start = l4_start + header.header_len();
                let payload = self.buf[payload_start..].to_vec();

                let checksum = match (&ip_v4, &ip_v6) {
                    (Some(v4), _) => header.calc_checksum_ipv4(v4, &payload)?,
                    (_, Some(v6)) => header.calc_checksum_ipv6(v6, &payload)?,
                    _ => unreachable!(),
                };

                self.buf[l4_start + 16..l4_start + 18].copy_from_slice(&checksum.to_be_bytes());
            }
            IpNumber::UDP => {
                let header = UdpHeaderSlice::from_slice(&self.buf[l4_start..])
                    .context("Failed to parse UDP header")?
                    .to_header();
                let payload = self.buf[l4_start + 8..].to_vec();

                let checksum = match (&ip_v4, &ip_v6) {
                    (Some(v4), _) => header.calc_checksum_ipv4(v4, &payload)?,
                    (_, Some(v6)) => header.calc_checksum_ipv6(v6, &payload)?,
                    _ => unreachable!(),
                };

                self.buf[l4_start + 6..l4_start + 8].copy_from_slice(&checksum.to_be_bytes());
            }
            _ => {}
        }

        Ok(())
    }

    fn l4_payload(&self) -> &[u8] {
        &self.buf[self.ip_header_length..]
    }

    fn ipv4_header_slice(&self) -> Ipv4HeaderSlice<'_> {
        debug_assert_eq!(self.version, IpVersion::V4);

        // Validated in `parse`.
        Ipv4HeaderSlice::from_slice(&self.buf).expect("validated in `parse`")
    }

    fn ipv6_header_slice(&self) -> Ipv6HeaderSlice<'_> {
        debug_assert_eq!(self.version, IpVersion::V6);

        // Validated in `parse`.
        Ipv6HeaderSlice::from_slice(&self.buf).expect("validated in `parse`")
    }
}

impl fmt::Debug for IpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Packet");

        dbg.field("src", &self.source())
            .field("dst", &self.destination())
            .field(
                "protocol",
                &self.next_header().keyword_str().unwrap_or("unknown"),
            );

        if let Some(tcp) = self.as_tcp() {
            dbg.field("src_port", &tcp.source_port())
                .field("dst_port", &tcp.destination_port())
                .field("len", &tcp.payload().len());

            if tcp.syn() {
                dbg.field("syn", &true);
            }

            if tcp.rst() {
                dbg.field("rst", &true);
            }

            if tcp.fin() {
                dbg.field("fin", &true);
            }
        }

        if let Some(udp) = self.as_udp() {
            dbg.field("src_port", &udp.source_port())
                .field("dst_port", &udp.destination_port())
                .field("len", &udp.payload().len());
        }

        dbg.finish()
    }
}
