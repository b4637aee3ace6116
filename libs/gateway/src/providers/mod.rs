//! Named traffic carriers.
//!
//! A provider is either the direct path, a VPN tunnel, or one of the two
//! synthetic carriers (`block`, `drop`). The registry holds them in a
//! copy-on-write arena: a reload publishes a new snapshot atomically while
//! in-flight flows keep their clone of the old one.

mod direct;
pub mod health;
pub mod transport;
pub mod wireguard;

pub use direct::DirectProvider;
pub use transport::{AsyncStream, DatagramSocket, InboundHandler, LoopbackStack, VpnStack};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::config::{Priority, TunnelConfig, TunnelProtocol};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// A provider's stable identity.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn direct() -> Self {
        Self("direct".to_owned())
    }

    pub fn block() -> Self {
        Self("block".to_owned())
    }

    pub fn drop() -> Self {
        Self("drop".to_owned())
    }

    pub fn is_direct(&self) -> bool {
        self.0 == "direct"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProviderId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ProviderId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProviderId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Down,
    Connecting,
    Up,
    Error,
}

/// An immutable snapshot of every provider's state, taken at decision time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderStates(BTreeMap<ProviderId, ProviderState>);

impl ProviderStates {
    pub fn is_up(&self, id: &ProviderId) -> bool {
        matches!(self.0.get(id), Some(ProviderState::Up))
    }
}

impl FromIterator<(ProviderId, ProviderState)> for ProviderStates {
    fn from_iter<T: IntoIterator<Item = (ProviderId, ProviderState)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One carrier. The hot path matches on the variant directly instead of
/// going through a vtable.
pub enum Provider {
    Direct(DirectProvider),
    Vpn(VpnProvider),
    Block,
    Drop,
}

impl Provider {
    pub fn id(&self) -> ProviderId {
        match self {
            Provider::Direct(_) => ProviderId::direct(),
            Provider::Vpn(vpn) => vpn.id.clone(),
            Provider::Block => ProviderId::block(),
            Provider::Drop => ProviderId::drop(),
        }
    }

    pub fn state(&self) -> ProviderState {
        match self {
            // Synthetic providers and the direct path are always up.
            Provider::Direct(_) | Provider::Block | Provider::Drop => ProviderState::Up,
            Provider::Vpn(vpn) => vpn.state(),
        }
    }

    pub async fn dial_tcp(&self, addr: SocketAddr) -> io::Result<Box<dyn AsyncStream>> {
        match self {
            Provider::Direct(direct) => direct.dial_tcp(addr).await,
            Provider::Vpn(vpn) => vpn.stack.dial_tcp(addr).await,
            Provider::Block | Provider::Drop => {
                Err(io::Error::from(io::ErrorKind::ConnectionRefused))
            }
        }
    }

    pub async fn dial_udp(&self, addr: SocketAddr) -> io::Result<Arc<dyn DatagramSocket>> {
        match self {
            Provider::Direct(direct) => direct.dial_udp(addr).await,
            Provider::Vpn(vpn) => vpn.stack.dial_udp(addr).await,
            Provider::Block | Provider::Drop => {
                Err(io::Error::from(io::ErrorKind::ConnectionRefused))
            }
        }
    }

    /// Raw-IP fast path. Only VPN providers support injection.
    pub fn inject_outbound(&self, packet: ip_packet::IpPacket, priority: Priority) -> io::Result<()> {
        match self {
            Provider::Vpn(vpn) => vpn.stack.inject_outbound(packet, priority),
            Provider::Direct(_) | Provider::Block | Provider::Drop => {
                Err(io::Error::from(io::ErrorKind::Unsupported))
            }
        }
    }

    pub fn server_endpoints(&self) -> Vec<SocketAddrV4> {
        match self {
            Provider::Vpn(vpn) => vpn.stack.server_endpoints(),
            Provider::Direct(_) | Provider::Block | Provider::Drop => Vec::new(),
        }
    }

    pub fn adapter_ip(&self) -> Option<Ipv4Addr> {
        match self {
            Provider::Vpn(vpn) => vpn.stack.local_ip(),
            Provider::Direct(_) | Provider::Block | Provider::Drop => None,
        }
    }
}

pub struct VpnProvider {
    pub id: ProviderId,
    pub name: String,
    pub protocol: TunnelProtocol,
    stack: Arc<dyn VpnStack>,
    state: watch::Sender<ProviderState>,
    events: broadcast::Sender<(ProviderId, ProviderState)>,
}

impl VpnProvider {
    pub fn state(&self) -> ProviderState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProviderState> {
        self.state.subscribe()
    }

    pub fn stack(&self) -> &Arc<dyn VpnStack> {
        &self.stack
    }

    pub fn status_line(&self) -> String {
        self.stack.status_line()
    }

    pub fn set_inbound_handler(&self, handler: InboundHandler) {
        self.stack.set_inbound_handler(handler);
    }

    fn set_state(&self, state: ProviderState) {
        let changed = {
            let current = *self.state.borrow();
            current != state
        };

        if !changed {
            return;
        }

        tracing::info!(id = %self.id, ?state, "Provider state change");

        self.state.send_replace(state);
        let _ = self.events.send((self.id.clone(), state));
    }

    pub async fn connect(&self) -> anyhow::Result<()> {
        self.set_state(ProviderState::Connecting);

        match tokio::time::timeout(CONNECT_TIMEOUT, self.stack.connect()).await {
            Ok(Ok(())) => {
                self.set_state(ProviderState::Up);

                Ok(())
            }
            Ok(Err(e)) => {
                self.set_state(ProviderState::Error);

                Err(e).with_context(|| format!("Provider '{}' failed to connect", self.id))
            }
            Err(_) => {
                self.set_state(ProviderState::Error);

                Err(anyhow::anyhow!(
                    "Provider '{}' did not connect within {CONNECT_TIMEOUT:?}",
                    self.id
                ))
            }
        }
    }

    /// Disconnects, waiting up to the drain timeout before hard-aborting.
    pub async fn disconnect(&self) {
        if tokio::time::timeout(DRAIN_TIMEOUT, self.stack.disconnect())
            .await
            .is_err()
        {
            tracing::warn!(id = %self.id, "Stack did not drain within {DRAIN_TIMEOUT:?}, aborting");
        }

        self.set_state(ProviderState::Down);
    }

    pub async fn restart(&self) -> anyhow::Result<()> {
        self.disconnect().await;
        self.connect().await
    }
}

/// One published arena snapshot.
pub struct ProviderSet {
    providers: BTreeMap<ProviderId, Arc<Provider>>,
}

impl ProviderSet {
    pub fn get(&self, id: &ProviderId) -> Option<Arc<Provider>> {
        self.providers.get(id).cloned()
    }

    pub fn states(&self) -> ProviderStates {
        self.providers
            .iter()
            .map(|(id, provider)| (id.clone(), provider.state()))
            .collect()
    }

    pub fn vpn_providers(&self) -> impl Iterator<Item = (&ProviderId, &VpnProvider)> {
        self.providers.values().filter_map(|provider| match &**provider {
            Provider::Vpn(vpn) => Some((&vpn.id, vpn)),
            Provider::Direct(_) | Provider::Block | Provider::Drop => None,
        })
    }

    pub fn direct(&self) -> Arc<Provider> {
        self.get(&ProviderId::direct())
            .expect("the direct provider is always present")
    }

    /// The union of all VPN server endpoints, for bypass routes.
    pub fn endpoints(&self) -> BTreeSet<Ipv4Addr> {
        self.providers
            .values()
            .flat_map(|provider| provider.server_endpoints())
            .map(|endpoint| *endpoint.ip())
            .collect()
    }
}

/// Creates the engine behind a VPN provider.
///
/// The control stream is the §-parsed WireGuard configuration in `key=value`
/// form; its interpretation is the engine's concern.
pub trait TransportFactory: Send + Sync + 'static {
    fn create(
        &self,
        config: &TunnelConfig,
        control_stream: &str,
    ) -> anyhow::Result<Arc<dyn VpnStack>>;
}

pub struct ReloadOutcome {
    /// Providers no longer configured; the caller must disconnect them.
    pub removed: Vec<Arc<Provider>>,
    /// Providers that appeared with this reload (in `Down` state).
    pub added: Vec<ProviderId>,
}

/// Runs before a VPN provider connects, with its server endpoints.
///
/// The daemon installs bypass routes here: they must exist before the first
/// byte is sent to an endpoint, or that traffic loops back through the TUN.
pub type PreConnectHook = Arc<
    dyn Fn(Vec<SocketAddrV4>) -> futures::future::BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

pub struct ProviderRegistry {
    current: RwLock<Arc<ProviderSet>>,
    tunnel_configs: RwLock<BTreeMap<ProviderId, TunnelConfig>>,
    endpoints_tx: watch::Sender<BTreeSet<Ipv4Addr>>,
    events: broadcast::Sender<(ProviderId, ProviderState)>,
    pre_connect: RwLock<Option<PreConnectHook>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        let (endpoints_tx, _) = watch::channel(BTreeSet::new());

        let providers = BTreeMap::from([
            (
                ProviderId::direct(),
                Arc::new(Provider::Direct(DirectProvider::new())),
            ),
            (ProviderId::block(), Arc::new(Provider::Block)),
            (ProviderId::drop(), Arc::new(Provider::Drop)),
        ]);

        Self {
            current: RwLock::new(Arc::new(ProviderSet { providers })),
            tunnel_configs: RwLock::new(BTreeMap::new()),
            endpoints_tx,
            events,
            pre_connect: RwLock::new(None),
        }
    }

    pub fn set_pre_connect(&self, hook: PreConnectHook) {
        *self.pre_connect.write() = Some(hook);
    }

    pub fn snapshot(&self) -> Arc<ProviderSet> {
        self.current.read().clone()
    }

    pub fn states(&self) -> ProviderStates {
        self.snapshot().states()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<(ProviderId, ProviderState)> {
        self.events.subscribe()
    }

    pub fn endpoints_watch(&self) -> watch::Receiver<BTreeSet<Ipv4Addr>> {
        self.endpoints_tx.subscribe()
    }

    /// Applies a new tunnel list.
    ///
    /// Providers whose configuration is unchanged survive with their state;
    /// changed or removed ones are returned for teardown; new ones start
    /// `Down` and are connected by the caller.
    pub fn reload(
        &self,
        tunnels: &[TunnelConfig],
        factory: &dyn TransportFactory,
    ) -> anyhow::Result<ReloadOutcome> {
        let previous = self.snapshot();
        let mut previous_configs = self.tunnel_configs.write();

        let mut providers = BTreeMap::from([
            (
                ProviderId::direct(),
                previous.get(&ProviderId::direct()).expect("always present"),
            ),
            (ProviderId::block(), Arc::new(Provider::Block)),
            (ProviderId::drop(), Arc::new(Provider::Drop)),
        ]);

        let mut added = Vec::new();
        let mut next_configs = BTreeMap::new();

        for tunnel in tunnels {
            let unchanged = previous_configs
                .get(&tunnel.id)
                .is_some_and(|existing| tunnel_settings_eq(existing, tunnel));

            if unchanged && let Some(existing) = previous.get(&tunnel.id) {
                providers.insert(tunnel.id.clone(), existing);
                next_configs.insert(tunnel.id.clone(), tunnel.clone());
                continue;
            }

            let control_stream = match tunnel.settings.get("config") {
                Some(text) => wireguard::parse(text)
                    .with_context(|| format!("Invalid WireGuard config for '{}'", tunnel.id))?
                    .to_control_stream(),
                None => String::new(),
            };

            let stack = factory
                .create(tunnel, &control_stream)
                .with_context(|| format!("Failed to create transport for '{}'", tunnel.id))?;

            let (state, _) = watch::channel(ProviderState::Down);

            providers.insert(
                tunnel.id.clone(),
                Arc::new(Provider::Vpn(VpnProvider {
                    id: tunnel.id.clone(),
                    name: tunnel.name.clone(),
                    protocol: tunnel.protocol,
                    stack,
                    state,
                    events: self.events.clone(),
                })),
            );

            added.push(tunnel.id.clone());
            next_configs.insert(tunnel.id.clone(), tunnel.clone());
        }

        let removed = previous
            .providers
            .iter()
            .filter(|(id, _)| !providers.contains_key(*id))
            .map(|(_, provider)| provider.clone())
            .collect();

        let set = Arc::new(ProviderSet { providers });

        self.endpoints_tx.send_replace(set.endpoints());
        *previous_configs = next_configs;
        *self.current.write() = set;

        Ok(ReloadOutcome { removed, added })
    }

    pub async fn connect(&self, id: &ProviderId) -> anyhow::Result<()> {
        let provider = self
            .snapshot()
            .get(id)
            .with_context(|| format!("No provider '{id}'"))?;

        let Provider::Vpn(vpn) = &*provider else {
            return Ok(());
        };

        let hook = self.pre_connect.read().clone();

        if let Some(hook) = hook {
            hook(provider.server_endpoints())
                .await
                .context("Failed to prepare bypass routes")?;
        }

        vpn.connect().await
    }

    pub async fn disconnect(&self, id: &ProviderId) -> anyhow::Result<()> {
        let provider = self
            .snapshot()
            .get(id)
            .with_context(|| format!("No provider '{id}'"))?;

        if let Provider::Vpn(vpn) = &*provider {
            vpn.disconnect().await;
        }

        Ok(())
    }

    pub async fn restart(&self, id: &ProviderId) -> anyhow::Result<()> {
        let provider = self
            .snapshot()
            .get(id)
            .with_context(|| format!("No provider '{id}'"))?;

        match &*provider {
            Provider::Vpn(vpn) => vpn.restart().await,
            Provider::Direct(_) | Provider::Block | Provider::Drop => Ok(()),
        }
    }
}

fn tunnel_settings_eq(a: &TunnelConfig, b: &TunnelConfig) -> bool {
    a.protocol == b.protocol && a.settings == b.settings
}
