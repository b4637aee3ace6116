//! Transparent TCP proxying through a userspace stack.
//!
//! One task owns a smoltcp interface fed from the TUN. The first SYN of a
//! flow creates a listening socket bound to the packet's destination, so the
//! stack accepts the connection *as* the real server. Accepted byte streams
//! are spliced to the chosen provider through bounded channels; a full
//! channel stops the socket from consuming more data, which propagates as
//! TCP back-pressure to the client.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ip_packet::IpPacket;
use l3_tcp::{
    IpAddress, IpListenEndpoint, QueueDevice, SocketHandle, SocketSet, create_interface,
    create_tcp_socket,
};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::flow::{FlowKey, FlowProtocol, FlowTable};
use crate::providers::{AsyncStream, Provider};
use crate::sni;

const CHANNEL_DEPTH: usize = 32;
const READ_CHUNK: usize = 8 * 1024;
const TICK: Duration = Duration::from_millis(25);

/// How long we wait for a first client payload (and with it a possible SNI)
/// before dialing the original decision. Covers server-speaks-first
/// protocols.
const SNI_WAIT: Duration = Duration::from_millis(100);

pub enum TcpCommand {
    /// A TCP packet belonging to a known (or refused) flow.
    Packet(IpPacket),
    /// The first SYN of a flow, paired with the dispatcher's decision.
    Open { packet: IpPacket, target: FlowTarget },
}

pub enum FlowTarget {
    /// Splice to the provider's `dial_tcp`.
    Provider {
        provider: Arc<Provider>,
        /// Re-evaluate domain rules against the client's TLS SNI before
        /// dialing.
        needs_sni: bool,
    },
    /// Splice to a pre-connected stream (the DNS interceptor).
    Stream(Box<dyn AsyncStream>),
}

/// Resolves an SNI host name to a provider, if a domain rule says so.
pub type SniReevaluate = Arc<dyn Fn(&str) -> Option<Arc<Provider>> + Send + Sync>;

#[derive(Clone)]
pub struct TcpProxyHandle {
    commands: mpsc::Sender<TcpCommand>,
}

impl TcpProxyHandle {
    pub async fn send(&self, command: TcpCommand) {
        if self.commands.send(command).await.is_err() {
            tracing::debug!("TCP proxy is gone");
        }
    }

    /// Non-blocking variant for the hot path. A full queue drops the packet;
    /// TCP retransmits.
    pub fn try_send(&self, command: TcpCommand) {
        let _ = self.commands.try_send(command);
    }
}

pub fn spawn(
    tun_tx: mpsc::Sender<IpPacket>,
    flow_table: Arc<FlowTable>,
    reevaluate: SniReevaluate,
    cancel: CancellationToken,
) -> TcpProxyHandle {
    let (commands_tx, commands_rx) = mpsc::channel(CHANNEL_DEPTH * 4);

    let mut device = QueueDevice::default();
    let interface = create_interface(&mut device);

    let proxy = TcpProxy {
        device,
        interface,
        sockets: SocketSet::new(Vec::new()),
        flows: HashMap::new(),
        commands: commands_rx,
        tun_tx,
        flow_table,
        reevaluate,
        wake: Arc::new(Notify::new()),
        created_at: Instant::now(),
    };

    tokio::spawn(proxy.run(cancel));

    TcpProxyHandle {
        commands: commands_tx,
    }
}

struct TcpProxy {
    device: QueueDevice,
    interface: l3_tcp::Interface,
    sockets: SocketSet<'static>,
    flows: HashMap<SocketHandle, Flow>,
    commands: mpsc::Receiver<TcpCommand>,
    tun_tx: mpsc::Sender<IpPacket>,
    flow_table: Arc<FlowTable>,
    reevaluate: SniReevaluate,
    /// Poked by remote tasks when channel readiness changes.
    wake: Arc<Notify>,
    created_at: Instant,
}

struct Flow {
    key: FlowKey,
    to_remote: mpsc::Sender<Vec<u8>>,
    from_remote: mpsc::Receiver<Vec<u8>>,
    pending_write: Option<PendingWrite>,
    sni: Option<SniWait>,
}

struct PendingWrite {
    data: Vec<u8>,
    offset: usize,
}

struct SniWait {
    provider_tx: oneshot::Sender<Arc<Provider>>,
    original: Arc<Provider>,
    deadline: Instant,
}

enum RemoteTarget {
    Ready(Box<dyn AsyncStream>),
    Dial {
        provider_rx: oneshot::Receiver<Arc<Provider>>,
        dst: SocketAddr,
    },
}

impl TcpProxy {
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };

                    match command {
                        TcpCommand::Packet(packet) => self.device.push_received(packet),
                        TcpCommand::Open { packet, target } => self.handle_open(packet, target),
                    }
                }
                () = self.wake.notified() => {}
                () = tokio::time::sleep(TICK) => {}
            }

            self.step(Instant::now());
            self.flush_outbound().await;
        }
    }

    /// Creates the listening socket and the remote bridge for a new flow,
    /// then feeds the SYN.
    ///
    /// At most one socket is in LISTEN at any time: the SYN is processed in
    /// the `step` that directly follows, before the next `Open`.
    fn handle_open(&mut self, packet: IpPacket, target: FlowTarget) {
        let Some(tcp) = packet.as_tcp() else {
            return;
        };

        if !tcp.syn() {
            return; // Only a SYN can open a flow.
        }

        let local = SocketAddr::new(packet.destination(), tcp.destination_port());
        let remote = SocketAddr::new(packet.source(), tcp.source_port());

        let mut socket = create_tcp_socket();

        let listen_endpoint = IpListenEndpoint {
            addr: Some(IpAddress::from(local.ip())),
            port: local.port(),
        };

        if let Err(e) = socket.listen(listen_endpoint) {
            tracing::debug!(%local, "Failed to listen: {e}");

            return;
        }

        let (to_remote_tx, to_remote_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (from_remote_tx, from_remote_rx) = mpsc::channel(CHANNEL_DEPTH);

        let (remote_target, sni) = match target {
            FlowTarget::Stream(stream) => (RemoteTarget::Ready(stream), None),
            FlowTarget::Provider {
                provider,
                needs_sni,
            } => {
                let (provider_tx, provider_rx) = oneshot::channel();

                let sni = if needs_sni {
                    Some(SniWait {
                        provider_tx,
                        original: provider,
                        deadline: Instant::now() + SNI_WAIT,
                    })
                } else {
                    let _ = provider_tx.send(provider);

                    None
                };

                (
                    RemoteTarget::Dial {
                        provider_rx,
                        dst: local,
                    },
                    sni,
                )
            }
        };

        tokio::spawn(remote_task(
            remote_target,
            to_remote_rx,
            from_remote_tx,
            self.wake.clone(),
        ));

        let handle = self.sockets.add(socket);

        self.flows.insert(
            handle,
            Flow {
                key: FlowKey {
                    protocol: FlowProtocol::Tcp,
                    src: remote,
                    dst: local,
                },
                to_remote: to_remote_tx,
                from_remote: from_remote_rx,
                pending_write: None,
                sni,
            },
        );

        self.device.push_received(packet);
    }

    fn step(&mut self, now: Instant) {
        // Pump all flows regardless of the poll result; channel readiness
        // may have changed independently of socket state.
        let _ = self.interface.poll(
            l3_tcp::now(self.created_at, now),
            &mut self.device,
            &mut self.sockets,
        );

        let mut closed = Vec::new();

        for (handle, flow) in &mut self.flows {
            let socket = self.sockets.get_mut::<l3_tcp::Socket>(*handle);

            pump_client_to_remote(socket, flow, &self.reevaluate, now);
            pump_remote_to_client(socket, flow);

            if socket.state() == l3_tcp::State::Closed {
                closed.push(*handle);
            }
        }

        for handle in closed {
            if let Some(flow) = self.flows.remove(&handle) {
                self.flow_table.remove(&flow.key);
            }

            self.sockets.remove(handle);
        }
    }

    async fn flush_outbound(&mut self) {
        while let Some(packet) = self.device.pop_transmitted() {
            if self.tun_tx.send(packet).await.is_err() {
                return;
            }
        }
    }
}

fn pump_client_to_remote(
    socket: &mut l3_tcp::Socket,
    flow: &mut Flow,
    reevaluate: &SniReevaluate,
    now: Instant,
) {
    // The client never spoke; dial the original decision.
    if flow.sni.as_ref().is_some_and(|wait| now >= wait.deadline) {
        let wait = flow.sni.take().expect("checked above");
        let _ = wait.provider_tx.send(wait.original);
    }

    while socket.can_recv() {
        let permit = match flow.to_remote.try_reserve() {
            Ok(permit) => permit,
            Err(mpsc::error::TrySendError::Full(())) => break, // Back-pressure.
            Err(mpsc::error::TrySendError::Closed(())) => {
                socket.abort();
                return;
            }
        };

        let chunk = match socket.recv(|buf| (buf.len(), buf.to_vec())) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!("Failed to read from client socket: {e}");
                socket.abort();
                return;
            }
        };

        if chunk.is_empty() {
            break;
        }

        if let Some(wait) = flow.sni.take() {
            let provider = sni::parse_sni(&chunk)
                .and_then(|host| reevaluate(&host))
                .unwrap_or(wait.original);

            let _ = wait.provider_tx.send(provider);
        }

        permit.send(chunk);
    }
}

fn pump_remote_to_client(socket: &mut l3_tcp::Socket, flow: &mut Flow) {
    loop {
        if let Some(pending) = &mut flow.pending_write {
            if !socket.can_send() {
                return;
            }

            match socket.send_slice(&pending.data[pending.offset..]) {
                Ok(sent) => {
                    pending.offset += sent;

                    if pending.offset < pending.data.len() {
                        return; // Write buffer is full again.
                    }

                    flow.pending_write = None;
                }
                Err(e) => {
                    tracing::debug!("Failed to write to client socket: {e}");
                    socket.abort();
                    return;
                }
            }
        }

        if !socket.can_send() {
            return;
        }

        match flow.from_remote.try_recv() {
            Ok(data) => {
                flow.pending_write = Some(PendingWrite { data, offset: 0 });
            }
            Err(mpsc::error::TryRecvError::Empty) => return,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                // Remote side is done; close our half gracefully.
                socket.close();
                return;
            }
        }
    }
}

/// Bridges one provider connection (or pre-connected stream) to the engine's
/// channels.
async fn remote_task(
    target: RemoteTarget,
    mut to_remote: mpsc::Receiver<Vec<u8>>,
    from_remote: mpsc::Sender<Vec<u8>>,
    wake: Arc<Notify>,
) {
    let stream = match target {
        RemoteTarget::Ready(stream) => stream,
        RemoteTarget::Dial { provider_rx, dst } => {
            let Ok(provider) = provider_rx.await else {
                return;
            };

            match provider.dial_tcp(dst).await {
                Ok(stream) => stream,
                Err(e) => {
                    // Dropping the channels makes the engine abort the
                    // client socket with an RST.
                    tracing::debug!(%dst, "Failed to dial: {e}");
                    wake.notify_one();

                    return;
                }
            }
        }
    };

    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let writer = {
        let wake = wake.clone();

        async move {
            while let Some(chunk) = to_remote.recv().await {
                if write_half.write_all(&chunk).await.is_err() {
                    break;
                }

                wake.notify_one(); // A channel slot freed up.
            }

            let _ = write_half.shutdown().await;
        }
    };

    let reader = {
        let wake = wake.clone();

        async move {
            let mut buf = vec![0u8; READ_CHUNK];

            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if from_remote.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }

                        wake.notify_one();
                    }
                }
            }
        }
    };

    tokio::join!(writer, reader);

    wake.notify_one();
}
