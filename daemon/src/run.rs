use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use firewall::{FirewallManager, NftFirewallOps};
use futures::FutureExt as _;
use logging::FilterReloadHandle;
use routing::{CaptureStrategy, NetlinkRouteOps, RouteManager, RouteOps as _, netmon};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use weir_gateway::config::{Config, TunnelConfig};
use weir_gateway::process::{ProcessIdentifier, ProcfsTable};
use weir_gateway::providers::{
    LoopbackStack, Provider, ProviderRegistry, TransportFactory, VpnStack, wireguard,
};
use weir_gateway::{Command, Gateway, GatewayHandle};

use crate::Cli;

pub async fn run(cli: Cli, reload_handle: FilterReloadHandle) -> Result<()> {
    let config = read_config(&cli.config)?;
    let category_tables = read_categories(cli.categories.as_deref())?;

    let cancel = CancellationToken::new();

    // The TUN device must exist before routes can point at it.
    let tun_device = tun::TunDevice::open(&cli.tun)
        .context("Failed to open TUN device (are we privileged?)")?;
    routing::configure_tun(&cli.tun, cli.tun_address, cli.tun_mtu).await?;

    let route_ops = NetlinkRouteOps::new()?;
    let tun_index = route_ops.interface_index(&cli.tun).await?;
    let route_manager = Arc::new(RouteManager::new(
        route_ops,
        tun_index,
        CaptureStrategy::Halves,
    ));

    // Packet filter before anything that could leak.
    let firewall = Arc::new(FirewallManager::new(NftFirewallOps::new()));
    firewall.sweep_stale();

    let nic = route_manager.discover_real_nic().await?;
    let nic_name = route_manager.ops().interface_name(nic.interface).await?;

    firewall.block_dns_on(&nic_name, current_uid())?;
    firewall.block_all_ipv6()?;

    let registry = Arc::new(ProviderRegistry::new());

    // Bypass routes are installed before a provider's first byte goes out.
    registry.set_pre_connect({
        let route_manager = route_manager.clone();

        Arc::new(move |endpoints: Vec<SocketAddrV4>| {
            let route_manager = route_manager.clone();

            async move {
                for endpoint in endpoints {
                    route_manager.add_bypass(*endpoint.ip()).await?;
                }

                Ok(())
            }
            .boxed()
        })
    });

    bind_direct_provider(&registry, Some(nic_name.clone()));

    let identifier = Arc::new(ProcessIdentifier::new(ProcfsTable));
    let factory: Arc<dyn TransportFactory> = Arc::new(DaemonTransportFactory {
        loopback: cli.loopback_transport,
    });

    let tunnel_ids = config
        .tunnels
        .iter()
        .map(|t| t.id.clone())
        .collect::<Vec<_>>();
    let global = config.global.clone();

    let (mut gateway, handle) = Gateway::new(
        Box::new(tun_device),
        registry.clone(),
        identifier,
        config,
        category_tables,
        factory,
        cancel.clone(),
    )?;
    gateway.set_logging_reload(move |directives| {
        if let Err(e) = reload_handle.reload(directives) {
            tracing::warn!("Failed to reload log filter: {e:#}");
        }
    });
    let flow_table = gateway.flow_table();

    if cli.kill_switch {
        let set = registry.snapshot();
        let endpoints = set
            .vpn_providers()
            .flat_map(|(_, vpn)| vpn.stack().server_endpoints())
            .collect::<Vec<_>>();

        firewall.enable_kill_switch(&cli.tun, &endpoints)?;
    }

    // Capture comes last: everything downstream of it is ready.
    route_manager.set_default_capture().await?;
    apply_ip_carveouts(&route_manager, &firewall, &global).await?;

    let gateway_task = tokio::spawn(gateway.run());

    tokio::spawn(weir_gateway::providers::health::run(
        registry.clone(),
        flow_table,
        cancel.clone(),
    ));

    let netmon_events = netmon::linux_event_stream()?;
    tokio::spawn(netmon::run(
        route_manager.clone(),
        netmon_events,
        registry.endpoints_watch(),
        cancel.clone(),
    ));

    for id in tunnel_ids {
        handle.send(Command::Connect(id)).await?;
    }

    let exit = supervise(
        &cli,
        &handle,
        &route_manager,
        &firewall,
        gateway_task,
        cancel.clone(),
    )
    .await;

    // Cleanup runs even though the root token has fired; both managers are
    // idempotent and remove exactly what they recorded.
    cancel.cancel();
    route_manager.cleanup_all().await;
    firewall.close();

    exit
}

/// Waits for a termination signal, feeding SIGHUP reloads to the gateway.
async fn supervise(
    cli: &Cli,
    handle: &GatewayHandle,
    route_manager: &RouteManager<NetlinkRouteOps>,
    firewall: &FirewallManager<NftFirewallOps>,
    mut gateway_task: tokio::task::JoinHandle<Result<()>>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("SIGINT, shutting down");

                return Ok(());
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM, shutting down");

                return Ok(());
            }
            _ = sighup.recv() => {
                tracing::info!("SIGHUP, re-reading configuration");

                match read_config(&cli.config) {
                    Ok(config) => {
                        if let Err(e) =
                            apply_ip_carveouts(route_manager, firewall, &config.global).await
                        {
                            tracing::warn!("Failed to refresh IP carve-outs: {e:#}");
                        }

                        handle.send(Command::Reload(Box::new(config))).await?;
                    }
                    Err(e) => {
                        // The old configuration stays in effect.
                        tracing::warn!("Ignoring unreadable configuration: {e:#}");
                    }
                }
            }
            result = &mut gateway_task => {
                cancel.cancel();

                return match result {
                    Ok(inner) => inner.context("Gateway exited"),
                    Err(e) => Err(e).context("Gateway panicked"),
                };
            }
        }
    }
}

/// Destination carve-outs: `allowed_ips` pin into the capture, the rest
/// leave on the real NIC, with matching kill-switch exemptions.
async fn apply_ip_carveouts(
    route_manager: &RouteManager<NetlinkRouteOps>,
    firewall: &FirewallManager<NftFirewallOps>,
    global: &weir_gateway::config::GlobalFilter,
) -> Result<()> {
    route_manager
        .set_ip_carveouts(&global.allowed_ips, &global.disallowed_ips, global.disable_local)
        .await?;

    firewall.add_bypass_prefixes(&global.disallowed_ips)?;

    Ok(())
}

fn read_config(path: &std::path::Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    serde_json::from_str(&contents).context("Failed to parse configuration")
}

fn read_categories(path: Option<&std::path::Path>) -> Result<HashMap<String, Vec<String>>> {
    let Some(path) = path else {
        return Ok(HashMap::new());
    };

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    serde_json::from_str(&contents).context("Failed to parse category tables")
}

fn bind_direct_provider(registry: &ProviderRegistry, interface: Option<String>) {
    let set = registry.snapshot();

    if let Provider::Direct(direct) = &*set.direct() {
        direct.set_bind_interface(interface);
    }
}

fn current_uid() -> u32 {
    // Safety: geteuid never fails.
    unsafe { libc::geteuid() }
}

/// Creates tunnel transports.
///
/// The VPN engine is an external library linked by the embedder; this build
/// only carries the in-memory loopback used for smoke runs.
struct DaemonTransportFactory {
    loopback: bool,
}

impl TransportFactory for DaemonTransportFactory {
    fn create(
        &self,
        config: &TunnelConfig,
        _control_stream: &str,
    ) -> Result<Arc<dyn VpnStack>> {
        if !self.loopback {
            bail!(
                "No VPN engine is linked into this build; pass --loopback-transport for a local smoke run"
            );
        }

        let endpoints = config
            .settings
            .get("config")
            .and_then(|text| wireguard::parse(text).ok())
            .map(|parsed| parsed.server_endpoints())
            .unwrap_or_default();

        let (stack, _accepts) = LoopbackStack::new(endpoints);

        Ok(Arc::new(stack))
    }
}
