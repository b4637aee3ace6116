//! Per-flow UDP forwarding.
//!
//! Each flow owns one provider socket. Datagrams from the provider are
//! wrapped back into IP/UDP packets sourced from the original destination
//! and written to the TUN. An idle timer closes the flow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ip_packet::IpPacket;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::flow::{FlowKey, FlowProtocol, FlowTable};
use crate::providers::Provider;

const CHANNEL_DEPTH: usize = 64;
const UDP_IDLE: Duration = Duration::from_secs(60);
const MAX_DATAGRAM: usize = 65535;

pub struct UdpFlows {
    flows: Mutex<HashMap<FlowKey, mpsc::Sender<Vec<u8>>>>,
    tun_tx: mpsc::Sender<IpPacket>,
    flow_table: Arc<FlowTable>,
}

impl UdpFlows {
    pub fn new(tun_tx: mpsc::Sender<IpPacket>, flow_table: Arc<FlowTable>) -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
            tun_tx,
            flow_table,
        }
    }

    /// Hands a datagram to its flow's forwarder.
    ///
    /// Gives the payload back if no forwarder exists so the caller can open
    /// one. A full channel drops the datagram; UDP senders expect loss.
    pub fn forward(&self, key: &FlowKey, payload: Vec<u8>) -> Result<(), Vec<u8>> {
        let flows = self.flows.lock();

        let Some(tx) = flows.get(key) else {
            return Err(payload);
        };

        let _ = tx.try_send(payload);

        Ok(())
    }

    /// Opens a new flow on `provider` and sends its first datagram.
    pub fn open(
        self: &Arc<Self>,
        key: FlowKey,
        provider: Arc<Provider>,
        first_payload: Vec<u8>,
        cancel: CancellationToken,
    ) {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);

        let _ = tx.try_send(first_payload);

        self.flows.lock().insert(key, tx);

        tokio::spawn({
            let flows = self.clone();

            async move {
                if let Err(e) = flow_task(&flows, key, provider, rx, cancel).await {
                    tracing::debug!(?key, "UDP flow ended: {e:#}");
                }

                flows.flows.lock().remove(&key);
                flows.flow_table.remove(&key);
            }
        });
    }
}

async fn flow_task(
    flows: &Arc<UdpFlows>,
    key: FlowKey,
    provider: Arc<Provider>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let socket = provider.dial_udp(key.dst).await?;

    let mut recv_buf = vec![0u8; MAX_DATAGRAM];
    let mut idle = Box::pin(tokio::time::sleep(UDP_IDLE));

    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = idle.as_mut() => {
                tracing::trace!(?key, "UDP flow idle");

                return Ok(());
            }
            payload = outbound.recv() => {
                let Some(payload) = payload else {
                    return Ok(());
                };

                socket.send(&payload).await?;
                idle.as_mut().reset(tokio::time::Instant::now() + UDP_IDLE);
            }
            result = socket.recv(&mut recv_buf) => {
                let n = result?;

                let reply = match reply_packet(&key, &recv_buf[..n]) {
                    Ok(reply) => reply,
                    Err(e) => {
                        // Larger than the TUN MTU; drop like any router would.
                        tracing::trace!(?key, "Dropping oversized reply: {e:#}");
                        continue;
                    }
                };

                if flows.tun_tx.send(reply).await.is_err() {
                    return Ok(()); // TUN is gone, shutdown under way.
                }

                flows.flow_table.get(&key, Instant::now());
                idle.as_mut().reset(tokio::time::Instant::now() + UDP_IDLE);
            }
        }
    }
}

/// Wraps a provider datagram as if it came from the original destination.
fn reply_packet(key: &FlowKey, payload: &[u8]) -> anyhow::Result<IpPacket> {
    debug_assert_eq!(key.protocol, FlowProtocol::Udp);

    ip_packet::make::udp_packet(
        key.dst.ip(),
        key.src.ip(),
        key.dst.port(),
        key.src.port(),
        payload.to_vec(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    #[test]
    fn replies_are_sourced_from_the_original_destination() {
        let key = FlowKey {
            protocol: FlowProtocol::Udp,
            src: SocketAddr::from(([10, 64, 0, 2], 50000)),
            dst: SocketAddr::from(([8, 8, 8, 8], 53)),
        };

        let reply = reply_packet(&key, b"answer").unwrap();

        assert_eq!(reply.source(), IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));
        assert_eq!(reply.destination(), IpAddr::V4(Ipv4Addr::new(10, 64, 0, 2)));

        let udp = reply.as_udp().unwrap();
        assert_eq!(udp.source_port(), 53);
        assert_eq!(udp.destination_port(), 50000);
        assert_eq!(udp.payload(), b"answer");
    }
}
