//! Routing-table manipulation for the gateway.
//!
//! The manager owns two disjoint sets of rows: *default-capture* routes that
//! steer the whole IPv4 space into the TUN, and */32 bypass* routes that keep
//! VPN server endpoints on the real NIC. It is the sole writer of both; on
//! teardown it deletes exactly the rows it recorded, in reverse insertion
//! order.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod netmon;
mod ops;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::{NetlinkRouteOps, configure_tun};
pub use ops::{DefaultRoute, Route, RouteOps};

use std::net::Ipv4Addr;
use std::time::Duration;

use ip_network::Ipv4Network;
use tokio::sync::Mutex;

/// Metric for the backup copies of the capture prefixes via the real NIC.
///
/// Longest-prefix match would otherwise steal traffic from sockets that bind
/// to the real NIC explicitly.
const BACKUP_METRIC: u32 = 5000;

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("route already exists")]
    AlreadyExists,
    #[error("route not in table")]
    NotFound,
    #[error("no IPv4 default route outside the TUN")]
    NoDefaultRoute,
    #[error("operation requires elevated privileges")]
    Privilege,
    #[error("transient routing failure: {0}")]
    Transient(String),
    #[error("netlink failure: {0}")]
    Netlink(String),
}

/// The physical interface used for non-tunneled egress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealNic {
    pub interface: u32,
    pub gateway: Ipv4Addr,
    pub local_ip: Ipv4Addr,
}

/// How the IPv4 space is split into more-specific-than-default prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStrategy {
    /// Two /1 prefixes. Out-prioritises 0/0 everywhere that plain
    /// longest-prefix match decides.
    Halves,
    /// Eight /3 prefixes. Leaves 0/0 untouched on systems whose scoped-route
    /// semantics would break if it were shadowed by wider prefixes.
    Eighths,
}

impl CaptureStrategy {
    fn prefixes(&self) -> Vec<Ipv4Network> {
        let (count, prefix) = match self {
            CaptureStrategy::Halves => (2u32, 1u8),
            CaptureStrategy::Eighths => (8, 3),
        };

        (0..count)
            .map(|i| {
                let base = Ipv4Addr::from(i << (32 - prefix as u32));

                Ipv4Network::new(base, prefix).expect("split prefixes are valid networks")
            })
            .collect()
    }
}

pub struct RouteManager<R> {
    ops: R,
    tun_interface: u32,
    strategy: CaptureStrategy,
    state: Mutex<State>,
}

/// Private networks kept reachable on the real NIC unless local access is
/// disabled.
const RFC1918: [(Ipv4Addr, u8); 3] = [
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
];

#[derive(Default)]
struct State {
    real_nic: Option<RealNic>,
    capture: Vec<Route>,
    bypass: Vec<Route>,
    /// Per-destination carve-outs from the configuration; replaced wholesale
    /// on reload.
    exceptions: Vec<Route>,
}

impl<R> RouteManager<R>
where
    R: RouteOps,
{
    pub fn new(ops: R, tun_interface: u32, strategy: CaptureStrategy) -> Self {
        Self {
            ops,
            tun_interface,
            strategy,
            state: Mutex::new(State::default()),
        }
    }

    pub fn ops(&self) -> &R {
        &self.ops
    }

    /// Finds the real NIC: the lowest-metric IPv4 default route that does not
    /// point at the TUN. Ties go to the first route encountered.
    pub async fn discover_real_nic(&self) -> Result<RealNic, Error> {
        let defaults = self.ops.default_routes().await?;

        let best = defaults
            .iter()
            .filter(|r| r.interface != self.tun_interface)
            .min_by_key(|r| r.metric)
            .copied()
            .ok_or(Error::NoDefaultRoute)?;

        let local_ip = self.ops.interface_ipv4(best.interface).await?;

        let nic = RealNic {
            interface: best.interface,
            gateway: best.gateway,
            local_ip,
        };

        self.state.lock().await.real_nic = Some(nic);

        tracing::debug!(interface = %nic.interface, gateway = %nic.gateway, local_ip = %nic.local_ip, "Discovered real NIC");

        Ok(nic)
    }

    pub async fn real_nic(&self) -> Option<RealNic> {
        self.state.lock().await.real_nic
    }

    /// Installs the capture prefixes via the TUN, plus high-metric backups
    /// via the real NIC. Idempotent.
    pub async fn set_default_capture(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let nic = state.real_nic.ok_or(Error::NoDefaultRoute)?;

        for prefix in self.strategy.prefixes() {
            let capture = Route {
                dest: prefix,
                interface: self.tun_interface,
                gateway: None,
                metric: None,
            };
            let backup = Route {
                dest: prefix,
                interface: nic.interface,
                gateway: Some(nic.gateway),
                metric: Some(BACKUP_METRIC),
            };

            for route in [capture, backup] {
                self.add_recorded(&mut state.capture, route).await?;
            }
        }

        Ok(())
    }

    pub async fn remove_default_capture(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;

        Self::remove_all(&self.ops, &mut state.capture).await;

        Ok(())
    }

    /// Installs a /32 host route to `addr` via the real NIC's gateway.
    ///
    /// Must complete before the first byte is sent to `addr`, otherwise that
    /// traffic loops back through the TUN.
    pub async fn add_bypass(&self, addr: Ipv4Addr) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let nic = state.real_nic.ok_or(Error::NoDefaultRoute)?;

        let route = Route {
            dest: Ipv4Network::new(addr, 32).expect("/32 is always a valid network"),
            interface: nic.interface,
            gateway: Some(nic.gateway),
            metric: None,
        };

        self.add_recorded(&mut state.bypass, route).await?;

        Ok(())
    }

    pub async fn clear_bypass(&self) {
        let mut state = self.state.lock().await;

        Self::remove_all(&self.ops, &mut state.bypass).await;
    }

    /// Replaces the destination carve-outs.
    ///
    /// `allowed` prefixes are pinned into the TUN capture; `disallowed`
    /// prefixes leave via the real NIC. Unless `disable_local` is set, the
    /// RFC1918 networks are carved out with the disallowed set.
    pub async fn set_ip_carveouts(
        &self,
        allowed: &[Ipv4Network],
        disallowed: &[Ipv4Network],
        disable_local: bool,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let nic = state.real_nic.ok_or(Error::NoDefaultRoute)?;

        Self::remove_all(&self.ops, &mut state.exceptions).await;

        let mut routes = Vec::new();

        for prefix in allowed {
            routes.push(Route {
                dest: *prefix,
                interface: self.tun_interface,
                gateway: None,
                metric: None,
            });
        }

        let local = (!disable_local)
            .then(|| {
                RFC1918.iter().map(|(addr, prefix)| {
                    Ipv4Network::new(*addr, *prefix).expect("RFC1918 networks are valid")
                })
            })
            .into_iter()
            .flatten();

        for prefix in disallowed.iter().copied().chain(local) {
            routes.push(Route {
                dest: prefix,
                interface: nic.interface,
                gateway: Some(nic.gateway),
                metric: None,
            });
        }

        for route in routes {
            self.add_recorded(&mut state.exceptions, route).await?;
        }

        Ok(())
    }

    /// Deletes every row we recorded, bypass first, in reverse insertion
    /// order. Idempotent; runs on teardown even after cancellation.
    pub async fn cleanup_all(&self) {
        let mut state = self.state.lock().await;

        Self::remove_all(&self.ops, &mut state.exceptions).await;
        Self::remove_all(&self.ops, &mut state.bypass).await;
        Self::remove_all(&self.ops, &mut state.capture).await;
    }

    async fn add_recorded(&self, recorded: &mut Vec<Route>, route: Route) -> Result<(), Error> {
        if recorded.contains(&route) {
            return Ok(());
        }

        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.ops.add_route(&route).await {
                Ok(()) => break,
                Err(Error::AlreadyExists) => break,
                Err(Error::Transient(reason)) if attempt < MAX_ATTEMPTS => {
                    tracing::debug!(%reason, %attempt, "Retrying route installation");

                    tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt - 1))).await;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::debug!(route = ?route.dest, interface = %route.interface, "Installed route");

        recorded.push(route);

        Ok(())
    }

    async fn remove_all(ops: &R, recorded: &mut Vec<Route>) {
        while let Some(route) = recorded.pop() {
            match ops.remove_route(&route).await {
                Ok(()) => {
                    tracing::debug!(route = ?route.dest, "Removed route");
                }
                Err(Error::NotFound) => {}
                Err(e) => {
                    tracing::warn!(route = ?route.dest, "Failed to remove route: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ops::mock::MockRouteOps;
    use super::*;

    fn manager() -> RouteManager<MockRouteOps> {
        let ops = MockRouteOps::with_default_route(1, Ipv4Addr::new(192, 168, 1, 1), 100);

        RouteManager::new(ops, 7, CaptureStrategy::Halves)
    }

    #[tokio::test]
    async fn discovers_lowest_metric_default_route() {
        let ops = MockRouteOps::with_default_route(1, Ipv4Addr::new(192, 168, 1, 1), 100);
        ops.defaults.lock().push(DefaultRoute {
            interface: 2,
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            metric: 50,
        });
        ops.interface_ips
            .lock()
            .insert(2, Ipv4Addr::new(10, 0, 0, 10));

        let manager = RouteManager::new(ops, 7, CaptureStrategy::Halves);
        let nic = manager.discover_real_nic().await.unwrap();

        assert_eq!(nic.interface, 2);
        assert_eq!(nic.gateway, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[tokio::test]
    async fn ignores_default_route_on_tun() {
        let ops = MockRouteOps::with_default_route(1, Ipv4Addr::new(192, 168, 1, 1), 100);
        ops.defaults.lock().push(DefaultRoute {
            interface: 7,
            gateway: Ipv4Addr::new(10, 255, 0, 1),
            metric: 1,
        });

        let manager = RouteManager::new(ops, 7, CaptureStrategy::Halves);
        let nic = manager.discover_real_nic().await.unwrap();

        assert_eq!(nic.interface, 1);
    }

    #[tokio::test]
    async fn capture_is_idempotent() {
        let manager = manager();
        manager.discover_real_nic().await.unwrap();

        manager.set_default_capture().await.unwrap();
        let after_first = manager.ops.routes.lock().clone();

        manager.set_default_capture().await.unwrap();
        let after_second = manager.ops.routes.lock().clone();

        assert_eq!(after_first, after_second);
        // Two halves, each with a TUN row and a backup row.
        assert_eq!(after_first.len(), 4);
    }

    #[tokio::test]
    async fn cleanup_removes_every_recorded_row() {
        let manager = manager();
        manager.discover_real_nic().await.unwrap();

        manager.set_default_capture().await.unwrap();
        manager
            .add_bypass(Ipv4Addr::new(198, 51, 100, 7))
            .await
            .unwrap();

        manager.cleanup_all().await;

        assert!(manager.ops.routes.lock().is_empty());
    }

    #[tokio::test]
    async fn cleanup_twice_is_harmless() {
        let manager = manager();
        manager.discover_real_nic().await.unwrap();
        manager.set_default_capture().await.unwrap();

        manager.cleanup_all().await;
        manager.cleanup_all().await;

        assert!(manager.ops.routes.lock().is_empty());
    }

    #[tokio::test]
    async fn bypass_tolerates_existing_route() {
        let manager = manager();
        let nic = manager.discover_real_nic().await.unwrap();

        manager
            .ops
            .routes
            .lock()
            .push(Route {
                dest: Ipv4Network::new(Ipv4Addr::new(198, 51, 100, 7), 32).unwrap(),
                interface: nic.interface,
                gateway: Some(nic.gateway),
                metric: None,
            });

        manager
            .add_bypass(Ipv4Addr::new(198, 51, 100, 7))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn carveouts_split_between_tun_and_real_nic() {
        let manager = manager();
        manager.discover_real_nic().await.unwrap();

        let allowed = [Ipv4Network::new(Ipv4Addr::new(203, 0, 113, 0), 24).unwrap()];
        let disallowed = [Ipv4Network::new(Ipv4Addr::new(198, 51, 100, 0), 24).unwrap()];

        manager
            .set_ip_carveouts(&allowed, &disallowed, false)
            .await
            .unwrap();

        let routes = manager.ops.routes.lock().clone();

        let pinned = routes.iter().find(|r| r.dest == allowed[0]).unwrap();
        assert_eq!(pinned.interface, 7);

        let carved = routes.iter().find(|r| r.dest == disallowed[0]).unwrap();
        assert_eq!(carved.interface, 1);

        // disable_local is off, so RFC1918 is carved out too.
        assert!(
            routes
                .iter()
                .any(|r| r.dest == Ipv4Network::new(Ipv4Addr::new(192, 168, 0, 0), 16).unwrap())
        );
    }

    #[tokio::test]
    async fn carveout_reload_replaces_the_previous_set() {
        let manager = manager();
        manager.discover_real_nic().await.unwrap();

        let first = [Ipv4Network::new(Ipv4Addr::new(203, 0, 113, 0), 24).unwrap()];
        manager.set_ip_carveouts(&first, &[], true).await.unwrap();

        manager.set_ip_carveouts(&[], &[], true).await.unwrap();

        assert!(manager.ops.routes.lock().is_empty());
    }

    #[test]
    fn eighths_cover_the_v4_space() {
        let prefixes = CaptureStrategy::Eighths.prefixes();

        assert_eq!(prefixes.len(), 8);
        assert_eq!(prefixes[0], Ipv4Network::new(Ipv4Addr::new(0, 0, 0, 0), 3).unwrap());
        assert_eq!(
            prefixes[7],
            Ipv4Network::new(Ipv4Addr::new(224, 0, 0, 0), 3).unwrap()
        );
    }
}
