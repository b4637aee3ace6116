//! The gateway core: TUN reader → per-flow dispatch → provider egress →
//! return path back into the TUN.
//!
//! [`Gateway`] is the entry-point. One task reads the TUN; per-flow work
//! (TCP splicing, UDP forwarding, DNS resolution) runs as child tasks under
//! a shared cancellation root.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
pub mod dns;
pub mod domain_rules;
pub mod flow;
pub mod process;
pub mod providers;
pub mod proxy;
pub mod rules;
pub mod sni;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use ip_packet::{IpPacket, IpVersion};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tun::Tun;

use crate::config::Config;
use crate::dns::{DNS_PORT, DnsCache, DnsInterceptor};
use crate::domain_rules::{DomainDecision, DomainRuleEngine};
use crate::flow::{FlowKey, FlowProtocol, FlowTable};
use crate::process::{ProcTable, ProcessIdentifier, ProcessInfo};
use crate::providers::{
    Provider, ProviderId, ProviderRegistry, ProviderSet, ProviderState, TransportFactory,
};
use crate::proxy::tcp::{FlowTarget, TcpCommand, TcpProxyHandle};
use crate::proxy::udp::UdpFlows;
use crate::rules::RuleEngine;

const TUN_BATCH: usize = 64;
const TUN_QUEUE: usize = 1024;
const FLOW_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Control-plane messages. The core does not marshal RPC; a collaborator
/// delivers these on a channel.
pub enum Command {
    Reload(Box<Config>),
    Connect(ProviderId),
    Disconnect(ProviderId),
}

#[derive(Clone)]
pub struct GatewayHandle {
    commands: mpsc::Sender<Command>,
}

impl GatewayHandle {
    pub async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("Gateway is gone"))
    }
}

struct Engines {
    rules: RwLock<Arc<RuleEngine>>,
    domain_rules: Arc<RwLock<Arc<DomainRuleEngine>>>,
}

/// Everything a per-flow decision task needs.
struct DispatchCtx<P> {
    engines: Engines,
    registry: Arc<ProviderRegistry>,
    interceptor: Arc<DnsInterceptor>,
    flow_table: Arc<FlowTable>,
    identifier: Arc<ProcessIdentifier<P>>,
    tcp: TcpProxyHandle,
    udp: Arc<UdpFlows>,
    tun_tx: mpsc::Sender<IpPacket>,
    /// Flows with a decision in flight; stops duplicate decision tasks for
    /// retransmitted first packets.
    pending: Mutex<HashSet<FlowKey>>,
    cancel: CancellationToken,
}

pub struct Gateway<P> {
    tun: Box<dyn Tun>,
    tun_rx: mpsc::Receiver<IpPacket>,
    commands: mpsc::Receiver<Command>,
    ctx: Arc<DispatchCtx<P>>,
    factory: Arc<dyn TransportFactory>,
    category_tables: HashMap<String, Vec<String>>,
    logging_reload: Option<Box<dyn Fn(&str) + Send + Sync>>,
    cancel: CancellationToken,
}

impl<P> Gateway<P>
where
    P: ProcTable,
{
    pub fn new(
        tun: Box<dyn Tun>,
        registry: Arc<ProviderRegistry>,
        identifier: Arc<ProcessIdentifier<P>>,
        config: Config,
        category_tables: HashMap<String, Vec<String>>,
        factory: Arc<dyn TransportFactory>,
        cancel: CancellationToken,
    ) -> Result<(Self, GatewayHandle)> {
        config
            .validate(&category_tables)
            .context("Invalid initial configuration")?;

        let (tun_tx, tun_rx) = mpsc::channel(TUN_QUEUE);
        let (commands_tx, commands_rx) = mpsc::channel(16);

        let rules = Arc::new(RuleEngine::new(&config.rules, &config.global, &config.tunnels));
        let domain_rules = Arc::new(DomainRuleEngine::new(
            &config.domain_rules,
            &category_tables,
            default_dns_provider(&config),
        ));

        let interceptor = Arc::new(DnsInterceptor::new(
            DnsCache::new(config.dns.cache.clone()),
            domain_rules.clone(),
            registry.clone(),
            config.dns.servers.clone(),
        ));

        let flow_table = Arc::new(FlowTable::default());

        let domain_rules = Arc::new(RwLock::new(domain_rules));

        let engines = Engines {
            rules: RwLock::new(rules),
            domain_rules: domain_rules.clone(),
        };

        let tcp = proxy::tcp::spawn(
            tun_tx.clone(),
            flow_table.clone(),
            sni_reevaluator(registry.clone(), domain_rules),
            cancel.child_token(),
        );

        let udp = Arc::new(UdpFlows::new(tun_tx.clone(), flow_table.clone()));

        let ctx = Arc::new(DispatchCtx {
            engines,
            registry: registry.clone(),
            interceptor,
            flow_table,
            identifier,
            tcp,
            udp,
            tun_tx,
            pending: Mutex::new(HashSet::new()),
            cancel: cancel.clone(),
        });

        let gateway = Self {
            tun,
            tun_rx,
            commands: commands_rx,
            ctx,
            factory,
            category_tables,
            logging_reload: None,
            cancel,
        };

        let outcome = registry.reload(&config.tunnels, gateway.factory.as_ref())?;
        gateway.register_inbound_handlers(&outcome.added);

        Ok((
            gateway,
            GatewayHandle {
                commands: commands_tx,
            },
        ))
    }

    /// Wires configuration reloads through to the log subscriber.
    pub fn set_logging_reload(&mut self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.logging_reload = Some(Box::new(f));
    }

    /// Shared with the health monitor so it can tear down a failed
    /// provider's flows.
    pub fn flow_table(&self) -> Arc<FlowTable> {
        self.ctx.flow_table.clone()
    }

    /// The main loop. Returns when the root token fires or the TUN dies.
    pub async fn run(mut self) -> Result<()> {
        let mut provider_events = self.ctx.registry.subscribe_events();
        let mut sweep = tokio::time::interval(FLOW_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut batch = Vec::with_capacity(TUN_BATCH);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,

                n = futures::future::poll_fn(|cx| {
                    self.tun.poll_recv_many(cx, &mut batch, TUN_BATCH)
                }) => {
                    if n == 0 {
                        anyhow::bail!("TUN device closed");
                    }

                    for packet in batch.drain(..) {
                        self.dispatch(packet);
                    }
                }

                Some(packet) = self.tun_rx.recv() => {
                    futures::future::poll_fn(|cx| self.tun.poll_send_ready(cx))
                        .await
                        .context("TUN not writable")?;
                    self.tun.send(packet).context("Failed to write to TUN")?;
                }

                Some(command) = self.commands.recv() => {
                    self.handle_command(command).await;
                }

                event = provider_events.recv() => {
                    if let Ok((id, state)) = event
                        && state == ProviderState::Up
                    {
                        tracing::debug!(%id, "Provider is up, flushing provisional DNS entries");

                        self.ctx.interceptor.cache().flush_provisional();
                    }
                }

                _ = sweep.tick() => {
                    self.ctx.flow_table.evict_idle(Instant::now());
                }
            }
        }

        Ok(())
    }

    /// Classifies one packet off the TUN and routes it to its handler.
    fn dispatch(&self, packet: IpPacket) {
        if packet.version() == IpVersion::V6 {
            // IPv6 is leak-blocked by the packet filter, not routed.
            tracing::trace!("Ignoring IPv6 packet");

            return;
        }

        if packet.is_tcp() {
            self.dispatch_tcp(packet);
        } else if packet.is_udp() {
            self.dispatch_udp(packet);
        } else {
            self.dispatch_raw(packet);
        }
    }

    fn dispatch_tcp(&self, packet: IpPacket) {
        let Some(tcp) = packet.as_tcp() else {
            return;
        };

        let key = FlowKey {
            protocol: FlowProtocol::Tcp,
            src: (packet.source(), tcp.source_port()).into(),
            dst: (packet.destination(), tcp.destination_port()).into(),
        };
        let is_syn = tcp.syn() && !tcp.ack();
        let now = Instant::now();

        if let Some(entry) = self.ctx.flow_table.get(&key, now) {
            if entry.provider == ProviderId::drop() {
                return;
            }

            if entry.provider == ProviderId::block() {
                if is_syn {
                    respond_rst(&self.ctx.tun_tx, &packet);
                }

                return;
            }

            self.ctx.tcp.try_send(TcpCommand::Packet(packet));

            return;
        }

        if !is_syn {
            // Unknown non-SYN; let the stack answer it with an RST.
            self.ctx.tcp.try_send(TcpCommand::Packet(packet));

            return;
        }

        if key.dst.port() == DNS_PORT {
            self.open_tcp_dns(key, packet, now);

            return;
        }

        if !self.ctx.pending.lock().insert(key) {
            return; // Decision already in flight; retransmit.
        }

        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            decide_and_open_tcp(ctx, key, packet).await;
        });
    }

    /// TCP/53 terminates in the DNS interceptor rather than a provider.
    fn open_tcp_dns(&self, key: FlowKey, packet: IpPacket, now: Instant) {
        let (near, far) = tokio::io::duplex(16 * 1024);

        let interceptor = self.ctx.interceptor.clone();
        let cancel = self.ctx.cancel.child_token();

        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                result = interceptor.serve_tcp(far) => {
                    if let Err(e) = result {
                        tracing::debug!("TCP DNS session ended: {e:#}");
                    }
                }
            }
        });

        self.ctx
            .flow_table
            .insert(key, None, None, ProviderId::direct(), now);

        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            ctx.tcp
                .send(TcpCommand::Open {
                    packet,
                    target: FlowTarget::Stream(Box::new(near)),
                })
                .await;
        });
    }

    fn dispatch_udp(&self, packet: IpPacket) {
        let Some(udp) = packet.as_udp() else {
            return;
        };

        if udp.destination_port() == DNS_PORT {
            let interceptor = self.ctx.interceptor.clone();
            let tun_tx = self.ctx.tun_tx.clone();

            tokio::spawn(async move {
                if let Some(reply) = interceptor.handle_udp_packet(packet).await {
                    let _ = tun_tx.send(reply).await;
                }
            });

            return;
        }

        let key = FlowKey {
            protocol: FlowProtocol::Udp,
            src: (packet.source(), udp.source_port()).into(),
            dst: (packet.destination(), udp.destination_port()).into(),
        };
        let mut payload = udp.payload().to_vec();
        let now = Instant::now();

        if let Some(entry) = self.ctx.flow_table.get(&key, now) {
            if entry.provider == ProviderId::drop() {
                return;
            }

            if entry.provider == ProviderId::block() {
                respond_port_unreachable(&self.ctx.tun_tx, &packet);

                return;
            }

            match self.ctx.udp.forward(&key, payload) {
                Ok(()) => return,
                // The forwarder is gone (idle or error); decide afresh.
                Err(returned) => payload = returned,
            }
        }

        if !self.ctx.pending.lock().insert(key) {
            return;
        }

        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            decide_and_open_udp(ctx, key, packet, payload).await;
        });
    }

    /// Neither TCP nor UDP: the raw fast path.
    ///
    /// Routed by destination via the reverse DNS map (no port, so no process
    /// lookup); VPN providers take it via `inject_outbound`, the direct path
    /// has nowhere to put a raw packet and drops it.
    fn dispatch_raw(&self, packet: IpPacket) {
        let set = self.ctx.registry.snapshot();
        let now = Instant::now();

        let provider = self
            .ctx
            .interceptor
            .cache()
            .reverse_lookup(packet.destination(), now)
            .map(|domain| self.ctx.engines.domain_rules.read().decide(&domain))
            .and_then(|decision| match decision {
                DomainDecision::Route(id) => set.get(&id),
                DomainDecision::Direct | DomainDecision::Block => None,
            });

        let Some(provider) = provider else {
            tracing::trace!(
                protocol = ?packet.next_header(),
                "No raw handler for packet, dropping"
            );

            return;
        };

        if provider.state() != ProviderState::Up {
            return;
        }

        if let Err(e) = provider.inject_outbound(packet, config::Priority::Auto) {
            tracing::debug!("Raw injection failed: {e}");
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Reload(config) => {
                if let Err(e) = self.apply_reload(*config) {
                    tracing::warn!("Rejecting configuration reload: {e:#}");
                }
            }
            Command::Connect(id) => {
                let registry = self.ctx.registry.clone();

                tokio::spawn(async move {
                    if let Err(e) = registry.connect(&id).await {
                        tracing::warn!(%id, "Connect failed: {e:#}");
                    }
                });
            }
            Command::Disconnect(id) => {
                let registry = self.ctx.registry.clone();
                let flow_table = self.ctx.flow_table.clone();

                tokio::spawn(async move {
                    flow_table.evict_provider(&id);

                    if let Err(e) = registry.disconnect(&id).await {
                        tracing::warn!(%id, "Disconnect failed: {e:#}");
                    }
                });
            }
        }
    }

    /// Validates and applies a new configuration.
    ///
    /// Rule engines are swapped atomically; flows in flight keep the
    /// provider they were decided onto.
    fn apply_reload(&self, config: Config) -> Result<()> {
        config.validate(&self.category_tables)?;

        let rules = Arc::new(RuleEngine::new(&config.rules, &config.global, &config.tunnels));
        let domain_rules = Arc::new(DomainRuleEngine::new(
            &config.domain_rules,
            &self.category_tables,
            default_dns_provider(&config),
        ));

        *self.ctx.engines.rules.write() = rules;
        *self.ctx.engines.domain_rules.write() = domain_rules.clone();
        self.ctx
            .interceptor
            .reload(domain_rules, config.dns.servers.clone());

        let outcome = self
            .ctx
            .registry
            .reload(&config.tunnels, self.factory.as_ref())?;

        self.register_inbound_handlers(&outcome.added);

        for removed in outcome.removed {
            let flow_table = self.ctx.flow_table.clone();

            tokio::spawn(async move {
                flow_table.evict_provider(&removed.id());

                if let Provider::Vpn(vpn) = &*removed {
                    vpn.disconnect().await;
                }
            });
        }

        for added in outcome.added {
            let registry = self.ctx.registry.clone();

            tokio::spawn(async move {
                if let Err(e) = registry.connect(&added).await {
                    tracing::warn!(id = %added, "Connect failed: {e:#}");
                }
            });
        }

        if let Some(reload) = &self.logging_reload {
            reload(&config.logging.directives);
        }

        tracing::info!("Configuration applied");

        Ok(())
    }

    /// Bridges raw packets emitted by VPN providers back into the TUN.
    fn register_inbound_handlers(&self, added: &[ProviderId]) {
        let set = self.ctx.registry.snapshot();

        for id in added {
            let Some(provider) = set.get(id) else {
                continue;
            };

            let Provider::Vpn(vpn) = &*provider else {
                continue;
            };

            let tun_tx = self.ctx.tun_tx.clone();

            vpn.set_inbound_handler(Box::new(move |packet| {
                if tun_tx.try_send(packet).is_err() {
                    tracing::trace!("TUN queue full, dropping inbound packet");
                }
            }));
        }
    }
}

fn default_dns_provider(config: &Config) -> ProviderId {
    config
        .dns
        .tunnel_ids
        .first()
        .cloned()
        .unwrap_or_else(ProviderId::direct)
}

/// What the dispatcher does with a new flow.
enum FlowVerdict {
    Via {
        provider: Arc<Provider>,
        needs_sni: bool,
    },
    Block,
    Drop,
}

/// The §-decision for a new flow: process rule first, then the reverse DNS
/// map plus domain rules, then the catch-all.
///
/// Pure in `(engines, provider states, reverse table)`; identical inputs
/// produce the identical provider choice.
fn evaluate_flow(
    rules: &RuleEngine,
    domain_rules: &DomainRuleEngine,
    set: &ProviderSet,
    cache: &DnsCache,
    exe: Option<&Path>,
    dst: IpAddr,
    now: Instant,
) -> FlowVerdict {
    let states = set.states();
    let decision = rules.decide(exe, &states);

    if decision.matched {
        // A destination carved out of the tunnel rides the real NIC instead.
        if !rules.tunnel_permits(&decision.provider, dst) {
            return verdict_for(set, &ProviderId::direct(), false);
        }

        return verdict_for(set, &decision.provider, false);
    }

    if let Some(domain) = cache.reverse_lookup(dst, now) {
        return match domain_rules.decide(&domain) {
            DomainDecision::Block => FlowVerdict::Block,
            DomainDecision::Direct => verdict_for(set, &ProviderId::direct(), false),
            DomainDecision::Route(id) => {
                if states.is_up(&id) && rules.tunnel_permits(&id, dst) {
                    verdict_for(set, &id, false)
                } else {
                    // Mirror the resolver: fall through to direct while the
                    // routing provider is down (or refuses the destination).
                    verdict_for(set, &ProviderId::direct(), false)
                }
            }
        };
    }

    // No rule, no known domain: direct, but let a TLS SNI override.
    verdict_for(set, &ProviderId::direct(), true)
}

fn verdict_for(set: &ProviderSet, id: &ProviderId, needs_sni: bool) -> FlowVerdict {
    if *id == ProviderId::block() {
        return FlowVerdict::Block;
    }

    if *id == ProviderId::drop() {
        return FlowVerdict::Drop;
    }

    match set.get(id) {
        Some(provider) => FlowVerdict::Via {
            provider,
            needs_sni,
        },
        None => {
            // A rule may reference a tunnel that a concurrent reload just
            // removed. Refuse rather than leak.
            tracing::warn!(%id, "Decision names a provider that no longer exists");

            FlowVerdict::Block
        }
    }
}

async fn decide_and_open_tcp<P>(ctx: Arc<DispatchCtx<P>>, key: FlowKey, packet: IpPacket)
where
    P: ProcTable,
{
    let info = identify(&ctx, FlowProtocol::Tcp, key.src.port()).await;
    let now = Instant::now();

    let verdict = {
        let rules = ctx.engines.rules.read().clone();
        let domain_rules = ctx.engines.domain_rules.read().clone();
        let set = ctx.registry.snapshot();

        evaluate_flow(
            &rules,
            &domain_rules,
            &set,
            ctx.interceptor.cache(),
            info.exe.as_deref(),
            key.dst.ip(),
            now,
        )
    };

    match verdict {
        FlowVerdict::Via {
            provider,
            needs_sni,
        } => {
            ctx.flow_table
                .insert(key, info.pid, info.exe, provider.id(), now);

            ctx.tcp
                .send(TcpCommand::Open {
                    packet,
                    target: FlowTarget::Provider {
                        provider,
                        needs_sni,
                    },
                })
                .await;
        }
        FlowVerdict::Block => {
            ctx.flow_table
                .insert(key, info.pid, info.exe, ProviderId::block(), now);

            respond_rst(&ctx.tun_tx, &packet);
        }
        FlowVerdict::Drop => {
            ctx.flow_table
                .insert(key, info.pid, info.exe, ProviderId::drop(), now);
        }
    }

    ctx.pending.lock().remove(&key);
}

async fn decide_and_open_udp<P>(
    ctx: Arc<DispatchCtx<P>>,
    key: FlowKey,
    packet: IpPacket,
    payload: Vec<u8>,
) where
    P: ProcTable,
{
    let info = identify(&ctx, FlowProtocol::Udp, key.src.port()).await;
    let now = Instant::now();

    let verdict = {
        let rules = ctx.engines.rules.read().clone();
        let domain_rules = ctx.engines.domain_rules.read().clone();
        let set = ctx.registry.snapshot();

        evaluate_flow(
            &rules,
            &domain_rules,
            &set,
            ctx.interceptor.cache(),
            info.exe.as_deref(),
            key.dst.ip(),
            now,
        )
    };

    match verdict {
        FlowVerdict::Via { provider, .. } => {
            ctx.flow_table
                .insert(key, info.pid, info.exe, provider.id(), now);

            ctx.udp
                .open(key, provider, payload, ctx.cancel.child_token());
        }
        FlowVerdict::Block => {
            ctx.flow_table
                .insert(key, info.pid, info.exe, ProviderId::block(), now);

            respond_port_unreachable(&ctx.tun_tx, &packet);
        }
        FlowVerdict::Drop => {
            ctx.flow_table
                .insert(key, info.pid, info.exe, ProviderId::drop(), now);
        }
    }

    ctx.pending.lock().remove(&key);
}

async fn identify<P>(
    ctx: &Arc<DispatchCtx<P>>,
    transport: FlowProtocol,
    local_port: u16,
) -> ProcessInfo
where
    P: ProcTable,
{
    let identifier = ctx.identifier.clone();

    tokio::task::spawn_blocking(move || identifier.find(transport, local_port, Instant::now()))
        .await
        .unwrap_or_default()
}

/// Maps an SNI host through the domain rules to a provider override.
///
/// Returning the synthetic block provider makes the dial fail, which the
/// proxy answers with an RST.
fn sni_reevaluator(
    registry: Arc<ProviderRegistry>,
    domain_rules: Arc<RwLock<Arc<DomainRuleEngine>>>,
) -> proxy::tcp::SniReevaluate {
    Arc::new(move |host| {
        let decision = domain_rules.read().decide(host);
        let set = registry.snapshot();

        match decision {
            DomainDecision::Route(id) if set.states().is_up(&id) => {
                tracing::debug!(%host, %id, "SNI overrides flow decision");

                set.get(&id)
            }
            DomainDecision::Block => set.get(&ProviderId::block()),
            DomainDecision::Route(_) | DomainDecision::Direct => None,
        }
    })
}

fn respond_rst(tun_tx: &mpsc::Sender<IpPacket>, packet: &IpPacket) {
    match ip_packet::make::tcp_rst_for(packet) {
        Ok(rst) => {
            let _ = tun_tx.try_send(rst);
        }
        Err(e) => tracing::debug!("Failed to build RST: {e:#}"),
    }
}

fn respond_port_unreachable(tun_tx: &mpsc::Sender<IpPacket>, packet: &IpPacket) {
    match ip_packet::make::icmp_port_unreachable(packet) {
        Ok(unreachable) => {
            let _ = tun_tx.try_send(unreachable);
        }
        Err(e) => tracing::debug!("Failed to build ICMP unreachable: {e:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DnsCacheConfig, DomainAction, DomainRuleConfig, Fallback, GlobalFilter, Priority,
        RuleConfig, TunnelConfig, TunnelProtocol,
    };
    use crate::providers::{LoopbackStack, VpnStack};
    use hickory_proto::rr::RecordType;
    use std::net::{Ipv4Addr, SocketAddrV4};

    struct LoopbackFactory;

    impl TransportFactory for LoopbackFactory {
        fn create(
            &self,
            _config: &TunnelConfig,
            _control_stream: &str,
        ) -> anyhow::Result<Arc<dyn VpnStack>> {
            let (stack, _accepts) = LoopbackStack::new(vec![SocketAddrV4::new(
                Ipv4Addr::new(198, 51, 100, 7),
                51820,
            )]);

            Ok(Arc::new(stack))
        }
    }

    struct Fixture {
        registry: Arc<ProviderRegistry>,
        rules: RuleEngine,
        domain_rules: DomainRuleEngine,
        cache: DnsCache,
    }

    impl Fixture {
        fn new(fallback: Fallback) -> Self {
            let registry = Arc::new(ProviderRegistry::new());

            registry
                .reload(
                    &[TunnelConfig {
                        id: ProviderId::from("vpn-a"),
                        protocol: TunnelProtocol::Wireguard,
                        name: "Exit A".to_owned(),
                        settings: Default::default(),
                        allowed_ips: Vec::new(),
                        disallowed_ips: Vec::new(),
                        disallowed_apps: Vec::new(),
                    }],
                    &LoopbackFactory,
                )
                .unwrap();

            let rules = RuleEngine::new(
                &[RuleConfig {
                    pattern: "curl.exe".to_owned(),
                    tunnel: ProviderId::from("vpn-a"),
                    fallback,
                    priority: Priority::Auto,
                }],
                &GlobalFilter::default(),
                &[],
            );

            let domain_rules = DomainRuleEngine::new(
                &[DomainRuleConfig {
                    pattern: "example.com".to_owned(),
                    action: DomainAction::Route,
                    tunnel: Some(ProviderId::from("vpn-a")),
                }],
                &HashMap::new(),
                ProviderId::direct(),
            );

            Self {
                registry,
                rules,
                domain_rules,
                cache: DnsCache::new(DnsCacheConfig::default()),
            }
        }

        async fn connect_vpn(&self) {
            self.registry
                .connect(&ProviderId::from("vpn-a"))
                .await
                .unwrap();
        }

        fn evaluate(&self, exe: Option<&str>, dst: IpAddr) -> FlowVerdict {
            evaluate_flow(
                &self.rules,
                &self.domain_rules,
                &self.registry.snapshot(),
                &self.cache,
                exe.map(Path::new),
                dst,
                Instant::now(),
            )
        }
    }

    #[tokio::test]
    async fn matched_rule_routes_through_its_tunnel() {
        let fixture = Fixture::new(Fallback::AllowDirect);
        fixture.connect_vpn().await;

        let verdict = fixture.evaluate(Some("curl.exe"), IpAddr::from([1, 1, 1, 1]));

        let FlowVerdict::Via {
            provider,
            needs_sni,
        } = verdict
        else {
            panic!("expected Via");
        };

        assert_eq!(provider.id(), ProviderId::from("vpn-a"));
        assert!(!needs_sni);
    }

    #[tokio::test]
    async fn down_tunnel_with_allow_direct_goes_direct() {
        let fixture = Fixture::new(Fallback::AllowDirect);

        let verdict = fixture.evaluate(Some("curl.exe"), IpAddr::from([1, 1, 1, 1]));

        let FlowVerdict::Via { provider, .. } = verdict else {
            panic!("expected Via");
        };

        assert_eq!(provider.id(), ProviderId::direct());
    }

    #[tokio::test]
    async fn down_tunnel_with_block_fallback_refuses() {
        let fixture = Fixture::new(Fallback::Block);

        let verdict = fixture.evaluate(Some("curl.exe"), IpAddr::from([1, 1, 1, 1]));

        assert!(matches!(verdict, FlowVerdict::Block));
    }

    #[tokio::test]
    async fn destination_carved_out_of_the_tunnel_goes_direct() {
        let fixture = Fixture::new(Fallback::AllowDirect);
        fixture.connect_vpn().await;

        let rules = RuleEngine::new(
            &[RuleConfig {
                pattern: "curl.exe".to_owned(),
                tunnel: ProviderId::from("vpn-a"),
                fallback: Fallback::AllowDirect,
                priority: Priority::Auto,
            }],
            &GlobalFilter::default(),
            &[TunnelConfig {
                id: ProviderId::from("vpn-a"),
                protocol: TunnelProtocol::Wireguard,
                name: "Exit A".to_owned(),
                settings: Default::default(),
                allowed_ips: Vec::new(),
                disallowed_ips: vec!["1.1.1.0/24".parse().unwrap()],
                disallowed_apps: Vec::new(),
            }],
        );

        let verdict = evaluate_flow(
            &rules,
            &fixture.domain_rules,
            &fixture.registry.snapshot(),
            &fixture.cache,
            Some(Path::new("curl.exe")),
            IpAddr::from([1, 1, 1, 1]),
            Instant::now(),
        );

        let FlowVerdict::Via { provider, .. } = verdict else {
            panic!("expected Via");
        };

        assert_eq!(provider.id(), ProviderId::direct());
    }

    #[tokio::test]
    async fn reverse_mapped_destination_follows_domain_rule() {
        let fixture = Fixture::new(Fallback::AllowDirect);
        fixture.connect_vpn().await;

        // A DNS answer for example.com returned 203.0.113.5 moments ago.
        let now = Instant::now();
        fixture.cache.insert(
            dns::CacheKey::new("example.com", RecordType::A),
            &answer("example.com.", Ipv4Addr::new(203, 0, 113, 5)),
            false,
            now,
        );

        // No process rule matches, yet the flow lands on vpn-a.
        let verdict = fixture.evaluate(Some("browser"), IpAddr::from([203, 0, 113, 5]));

        let FlowVerdict::Via {
            provider,
            needs_sni,
        } = verdict
        else {
            panic!("expected Via");
        };

        assert_eq!(provider.id(), ProviderId::from("vpn-a"));
        assert!(!needs_sni);
    }

    #[tokio::test]
    async fn unknown_destination_goes_direct_with_sni_probe() {
        let fixture = Fixture::new(Fallback::AllowDirect);
        fixture.connect_vpn().await;

        let verdict = fixture.evaluate(Some("browser"), IpAddr::from([203, 0, 113, 99]));

        let FlowVerdict::Via {
            provider,
            needs_sni,
        } = verdict
        else {
            panic!("expected Via");
        };

        assert_eq!(provider.id(), ProviderId::direct());
        assert!(needs_sni);
    }

    #[tokio::test]
    async fn process_rule_wins_over_reverse_map() {
        let fixture = Fixture::new(Fallback::Block);

        let now = Instant::now();
        fixture.cache.insert(
            dns::CacheKey::new("example.com", RecordType::A),
            &answer("example.com.", Ipv4Addr::new(203, 0, 113, 5)),
            false,
            now,
        );

        // vpn-a is down and the rule says BLOCK; the reverse map must not
        // rescue the flow onto another path.
        let verdict = fixture.evaluate(Some("curl.exe"), IpAddr::from([203, 0, 113, 5]));

        assert!(matches!(verdict, FlowVerdict::Block));
    }

    #[tokio::test]
    async fn sni_override_routes_through_domain_rule() {
        let fixture = Fixture::new(Fallback::AllowDirect);
        fixture.connect_vpn().await;

        let domain_rules = Arc::new(RwLock::new(Arc::new(DomainRuleEngine::new(
            &[DomainRuleConfig {
                pattern: "example.com".to_owned(),
                action: DomainAction::Route,
                tunnel: Some(ProviderId::from("vpn-a")),
            }],
            &HashMap::new(),
            ProviderId::direct(),
        ))));

        let reevaluate = sni_reevaluator(fixture.registry.clone(), domain_rules);

        let provider = reevaluate("www.example.com").expect("domain rule should match");
        assert_eq!(provider.id(), ProviderId::from("vpn-a"));

        assert!(reevaluate("unrelated.net").is_none());
    }

    fn answer(qname: &str, ip: Ipv4Addr) -> hickory_proto::op::Message {
        use hickory_proto::op::{Message, MessageType};
        use hickory_proto::rr::rdata::A;
        use hickory_proto::rr::{Name, RData, Record};
        use std::str::FromStr as _;

        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.add_answer(Record::from_rdata(
            Name::from_str(qname).unwrap(),
            300,
            RData::A(A(ip)),
        ));

        message
    }
}
