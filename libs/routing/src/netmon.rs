//! Reacts to OS routing changes.
//!
//! Events are debounced with a resettable timer so interface flaps and
//! route-table bursts trigger a single re-discovery. In-flight flows are left
//! alone; their sockets fail naturally and the application layer rebuilds
//! them.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{RouteManager, RouteOps};

const DEBOUNCE: Duration = Duration::from_secs(2);

/// Drives the monitor until `cancel` fires.
///
/// `events` delivers one tick per OS routing/interface event; `endpoints`
/// tracks the union of all providers' server endpoints, re-bypassed whenever
/// the real NIC changes.
pub async fn run<R>(
    manager: std::sync::Arc<RouteManager<R>>,
    mut events: mpsc::Receiver<()>,
    endpoints: watch::Receiver<BTreeSet<Ipv4Addr>>,
    cancel: CancellationToken,
) where
    R: RouteOps,
{
    let mut debounce_timer = Box::pin(tokio::time::sleep(Duration::MAX));

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => {
                if event.is_none() {
                    break;
                }

                debounce_timer.as_mut().reset(Instant::now() + DEBOUNCE);
            }
            () = debounce_timer.as_mut() => {
                if let Err(e) = handle_network_change(&manager, &endpoints).await {
                    tracing::warn!("Failed to handle network change: {e}");
                }

                // Rearm far in the future so only a new event triggers us again.
                debounce_timer = Box::pin(tokio::time::sleep(Duration::MAX));
            }
        }
    }
}

async fn handle_network_change<R>(
    manager: &RouteManager<R>,
    endpoints: &watch::Receiver<BTreeSet<Ipv4Addr>>,
) -> Result<(), crate::Error>
where
    R: RouteOps,
{
    let before = manager.real_nic().await;
    let after = manager.discover_real_nic().await?;

    if before != Some(after) {
        tracing::info!(interface = %after.interface, gateway = %after.gateway, "Real NIC changed");

        manager.clear_bypass().await;

        let current = endpoints.borrow().clone();

        for endpoint in current {
            manager.add_bypass(endpoint).await?;
        }
    }

    // Re-install capture prefixes in case the change removed them. Idempotent.
    manager.set_default_capture().await?;

    Ok(())
}

/// Subscribes to rtnetlink route/link/address multicast groups.
///
/// Returns a channel that yields one tick per event.
#[cfg(target_os = "linux")]
pub fn linux_event_stream() -> anyhow::Result<mpsc::Receiver<()>> {
    use anyhow::Context as _;
    use futures::StreamExt as _;
    use rtnetlink::sys::AsyncSocket as _;

    let (mut cxn, _handle, mut messages) = rtnetlink::new_connection()?;

    let groups = (libc::RTMGRP_IPV4_ROUTE | libc::RTMGRP_LINK | libc::RTMGRP_IPV4_IFADDR) as u32;

    cxn.socket_mut()
        .socket_mut()
        .bind(&rtnetlink::sys::SocketAddr::new(0, groups))
        .context("Failed to bind netlink socket for events")?;

    tokio::spawn(cxn);

    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        while let Some((message, _)) = messages.next().await {
            let netlink_packet_core::NetlinkPayload::InnerMessage(_) = message.payload else {
                continue;
            };

            if tx.send(()).await.is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::mock::MockRouteOps;
    use crate::{CaptureStrategy, DefaultRoute};

    #[tokio::test(start_paused = true)]
    async fn nic_change_refreshes_bypass_routes() {
        let ops = MockRouteOps::with_default_route(1, Ipv4Addr::new(192, 168, 1, 1), 100);
        let manager = std::sync::Arc::new(RouteManager::new(ops, 7, CaptureStrategy::Halves));
        manager.discover_real_nic().await.unwrap();
        manager.set_default_capture().await.unwrap();
        manager
            .add_bypass(Ipv4Addr::new(198, 51, 100, 7))
            .await
            .unwrap();

        let (event_tx, event_rx) = mpsc::channel(4);
        let (_endpoint_tx, endpoint_rx) =
            watch::channel(BTreeSet::from([Ipv4Addr::new(198, 51, 100, 7)]));
        let cancel = CancellationToken::new();

        // Swap the default route to a different interface and gateway.
        {
            let mut defaults = manager.ops.defaults.lock();
            defaults.clear();
            defaults.push(DefaultRoute {
                interface: 2,
                gateway: Ipv4Addr::new(10, 0, 0, 1),
                metric: 50,
            });
        }
        manager
            .ops
            .interface_ips
            .lock()
            .insert(2, Ipv4Addr::new(10, 0, 0, 10));

        let monitor = run(manager.clone(), event_rx, endpoint_rx, cancel.clone());

        event_tx.send(()).await.unwrap();

        tokio::select! {
            () = monitor => unreachable!("monitor only stops when cancelled"),
            () = tokio::time::sleep(Duration::from_secs(5)) => {}
        }

        let nic = manager.real_nic().await.unwrap();
        assert_eq!(nic.interface, 2);

        let routes = manager.ops.routes.lock();
        let bypass = routes
            .iter()
            .find(|r| r.dest.network_address() == Ipv4Addr::new(198, 51, 100, 7))
            .unwrap();
        assert_eq!(bypass.interface, 2);
        assert_eq!(bypass.gateway, Some(Ipv4Addr::new(10, 0, 0, 1)));
    }
}
