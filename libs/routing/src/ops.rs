use std::net::Ipv4Addr;

use ip_network::Ipv4Network;

use crate::Error;

/// A single row we install into the system routing table.
///
/// Carries everything required to remove the row exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub dest: Ipv4Network,
    pub interface: u32,
    pub gateway: Option<Ipv4Addr>,
    pub metric: Option<u32>,
}

/// A default route (0.0.0.0/0) as found in the system forwarding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultRoute {
    pub interface: u32,
    pub gateway: Ipv4Addr,
    pub metric: u32,
}

/// OS facade for routing-table manipulation.
///
/// The production implementation talks rtnetlink; tests use an in-memory
/// table.
pub trait RouteOps: Send + Sync + 'static {
    fn add_route(&self, route: &Route) -> impl Future<Output = Result<(), Error>> + Send;

    fn remove_route(&self, route: &Route) -> impl Future<Output = Result<(), Error>> + Send;

    /// Enumerates all IPv4 default routes currently installed.
    fn default_routes(&self) -> impl Future<Output = Result<Vec<DefaultRoute>, Error>> + Send;

    /// The first IPv4 address assigned to the given interface.
    fn interface_ipv4(&self, index: u32) -> impl Future<Output = Result<Ipv4Addr, Error>> + Send;

    fn interface_index(&self, name: &str) -> impl Future<Output = Result<u32, Error>> + Send;

    fn interface_name(&self, index: u32) -> impl Future<Output = Result<String, Error>> + Send;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// In-memory routing table for tests.
    #[derive(Default)]
    pub struct MockRouteOps {
        pub routes: Mutex<Vec<Route>>,
        pub defaults: Mutex<Vec<DefaultRoute>>,
        pub interface_ips: Mutex<BTreeMap<u32, Ipv4Addr>>,
    }

    impl MockRouteOps {
        pub fn with_default_route(interface: u32, gateway: Ipv4Addr, metric: u32) -> Self {
            let ops = Self::default();
            ops.defaults.lock().push(DefaultRoute {
                interface,
                gateway,
                metric,
            });
            ops.interface_ips
                .lock()
                .insert(interface, Ipv4Addr::new(192, 168, 1, 10));

            ops
        }
    }

    impl RouteOps for MockRouteOps {
        async fn add_route(&self, route: &Route) -> Result<(), Error> {
            let mut routes = self.routes.lock();

            if routes.contains(route) {
                return Err(Error::AlreadyExists);
            }

            routes.push(route.clone());

            Ok(())
        }

        async fn remove_route(&self, route: &Route) -> Result<(), Error> {
            let mut routes = self.routes.lock();

            let Some(idx) = routes.iter().position(|r| r == route) else {
                return Err(Error::NotFound);
            };

            routes.remove(idx);

            Ok(())
        }

        async fn default_routes(&self) -> Result<Vec<DefaultRoute>, Error> {
            Ok(self.defaults.lock().clone())
        }

        async fn interface_ipv4(&self, index: u32) -> Result<Ipv4Addr, Error> {
            self.interface_ips
                .lock()
                .get(&index)
                .copied()
                .ok_or(Error::NotFound)
        }

        async fn interface_index(&self, _name: &str) -> Result<u32, Error> {
            Ok(1)
        }

        async fn interface_name(&self, index: u32) -> Result<String, Error> {
            Ok(format!("eth{index}"))
        }
    }
}
