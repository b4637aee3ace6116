use std::collections::VecDeque;

use ip_packet::IpPacket;

/// The "wire" behind the userspace stack.
///
/// There is no physical medium; both directions are plain packet queues.
/// The proxy feeds packets from the TUN into the receive side and drains
/// whatever the stack emits from the transmit side.
#[derive(Debug, Default)]
pub struct QueueDevice {
    rx: VecDeque<IpPacket>,
    tx: VecDeque<IpPacket>,
}

impl QueueDevice {
    pub fn push_received(&mut self, packet: IpPacket) {
        self.rx.push_back(packet);
    }

    pub fn pop_transmitted(&mut self) -> Option<IpPacket> {
        self.tx.pop_front()
    }
}

impl smoltcp::phy::Device for QueueDevice {
    type RxToken<'a> = Consume;
    type TxToken<'a> = Produce<'a>;

    fn receive(
        &mut self,
        _timestamp: smoltcp::time::Instant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.rx.pop_front()?;

        Some((Consume(packet), Produce(&mut self.tx)))
    }

    fn transmit(&mut self, _timestamp: smoltcp::time::Instant) -> Option<Self::TxToken<'_>> {
        Some(Produce(&mut self.tx))
    }

    fn capabilities(&self) -> smoltcp::phy::DeviceCapabilities {
        let mut caps = smoltcp::phy::DeviceCapabilities::default();
        caps.medium = smoltcp::phy::Medium::Ip;
        caps.max_transmission_unit = ip_packet::MAX_IP_SIZE;

        caps
    }
}

/// Hands one queued packet to the stack.
pub struct Consume(IpPacket);

impl smoltcp::phy::RxToken for Consume {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(self.0.packet())
    }
}

/// Lets the stack write one frame straight into the transmit queue.
pub struct Produce<'a>(&'a mut VecDeque<IpPacket>);

impl smoltcp::phy::TxToken for Produce<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len];
        let result = f(&mut frame);

        // The advertised MTU bounds `len`; anything that still fails to
        // parse is unsendable and gets dropped here.
        match IpPacket::parse(frame) {
            Ok(mut packet) => {
                packet.update_checksum();
                self.0.push_back(packet);
            }
            Err(e) => tracing::debug!("Stack emitted an unsendable frame: {e:#}"),
        }

        result
    }
}
