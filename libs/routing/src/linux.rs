use std::net::{IpAddr, Ipv4Addr};

use futures::TryStreamExt as _;
use libc::{EBUSY, EEXIST, ENOENT, EPERM, ESRCH};
use netlink_packet_route::AddressFamily;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::route::{RouteAttribute, RouteProtocol, RouteScope};
use rtnetlink::Error::NetlinkError;
use rtnetlink::{Handle, RouteMessageBuilder, new_connection};

use crate::ops::{DefaultRoute, Route, RouteOps};
use crate::Error;

/// [`RouteOps`] backed by rtnetlink.
pub struct NetlinkRouteOps {
    handle: Handle,
    connection_task: tokio::task::JoinHandle<()>,
}

impl Drop for NetlinkRouteOps {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}

impl NetlinkRouteOps {
    /// Opens a netlink connection.
    ///
    /// Panics if called without a Tokio runtime.
    pub fn new() -> anyhow::Result<Self> {
        let (cxn, handle, _messages) = new_connection()?;

        Ok(Self {
            handle,
            connection_task: tokio::spawn(cxn),
        })
    }
}

impl RouteOps for NetlinkRouteOps {
    async fn add_route(&self, route: &Route) -> Result<(), Error> {
        let message = build_route_message(route);

        self.handle
            .route()
            .add(message)
            .execute()
            .await
            .map_err(map_netlink_error)
    }

    async fn remove_route(&self, route: &Route) -> Result<(), Error> {
        let message = build_route_message(route);

        match self.handle.route().del(message).execute().await {
            Ok(()) => Ok(()),
            // Our view of the table may be stale; both codes mean "row is
            // already gone".
            Err(NetlinkError(e)) if e.raw_code() == -ENOENT || e.raw_code() == -ESRCH => {
                Err(Error::NotFound)
            }
            Err(e) => Err(map_netlink_error(e)),
        }
    }

    async fn default_routes(&self) -> Result<Vec<DefaultRoute>, Error> {
        let mut stream = self
            .handle
            .route()
            .get(RouteMessageBuilder::<Ipv4Addr>::new().build())
            .execute();

        let mut defaults = Vec::new();

        while let Some(message) = stream.try_next().await.map_err(map_netlink_error)? {
            if message.header.destination_prefix_length != 0 {
                continue;
            }

            if message.header.address_family != AddressFamily::Inet {
                continue;
            }

            let mut interface = None;
            let mut gateway = None;
            let mut metric = 0;

            #[expect(
                clippy::wildcard_enum_match_arm,
                reason = "We only care about three attributes."
            )]
            for attribute in &message.attributes {
                match attribute {
                    RouteAttribute::Oif(idx) => interface = Some(*idx),
                    RouteAttribute::Gateway(netlink_packet_route::route::RouteAddress::Inet(
                        addr,
                    )) => gateway = Some(*addr),
                    RouteAttribute::Priority(p) => metric = *p,
                    _ => {}
                }
            }

            let (Some(interface), Some(gateway)) = (interface, gateway) else {
                continue;
            };

            defaults.push(DefaultRoute {
                interface,
                gateway,
                metric,
            });
        }

        Ok(defaults)
    }

    async fn interface_ipv4(&self, index: u32) -> Result<Ipv4Addr, Error> {
        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        while let Some(message) = stream.try_next().await.map_err(map_netlink_error)? {
            #[expect(
                clippy::wildcard_enum_match_arm,
                reason = "We only care about the address attribute."
            )]
            let addr = message.attributes.iter().find_map(|a| match a {
                AddressAttribute::Address(IpAddr::V4(v4)) => Some(*v4),
                _ => None,
            });

            if let Some(addr) = addr {
                return Ok(addr);
            }
        }

        Err(Error::NotFound)
    }

    async fn interface_index(&self, name: &str) -> Result<u32, Error> {
        let index = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute()
            .try_next()
            .await
            .map_err(map_netlink_error)?
            .ok_or(Error::NotFound)?
            .header
            .index;

        Ok(index)
    }

    async fn interface_name(&self, index: u32) -> Result<String, Error> {
        let message = self
            .handle
            .link()
            .get()
            .match_index(index)
            .execute()
            .try_next()
            .await
            .map_err(map_netlink_error)?
            .ok_or(Error::NotFound)?;

        #[expect(
            clippy::wildcard_enum_match_arm,
            reason = "We only care about the name attribute."
        )]
        message
            .attributes
            .iter()
            .find_map(|a| match a {
                netlink_packet_route::link::LinkAttribute::IfName(name) => Some(name.clone()),
                _ => None,
            })
            .ok_or(Error::NotFound)
    }
}

/// Brings the freshly-opened TUN interface up with the given address.
pub async fn configure_tun(name: &str, address: Ipv4Addr, mtu: u32) -> anyhow::Result<()> {
    use anyhow::Context as _;
    use rtnetlink::LinkUnspec;

    let (cxn, handle, _messages) = new_connection()?;
    let task = tokio::spawn(cxn);

    let index = handle
        .link()
        .get()
        .match_name(name.to_string())
        .execute()
        .try_next()
        .await
        .context("Failed to look up TUN interface")?
        .context("No such interface")?
        .header
        .index;

    handle
        .address()
        .add(index, address.into(), 32)
        .execute()
        .await
        .or_else(|e| match e {
            NetlinkError(ref inner) if inner.raw_code() == -EEXIST => Ok(()),
            other => Err(other),
        })
        .context("Failed to assign TUN address")?;

    handle
        .link()
        .set(LinkUnspec::new_with_index(index).mtu(mtu).build())
        .execute()
        .await
        .context("Failed to set TUN MTU")?;

    handle
        .link()
        .set(LinkUnspec::new_with_index(index).up().build())
        .execute()
        .await
        .context("Failed to bring TUN up")?;

    task.abort();

    Ok(())
}

fn build_route_message(route: &Route) -> netlink_packet_route::route::RouteMessage {
    let mut builder = RouteMessageBuilder::<Ipv4Addr>::new()
        .output_interface(route.interface)
        .protocol(RouteProtocol::Static)
        .scope(RouteScope::Universe)
        .destination_prefix(route.dest.network_address(), route.dest.netmask());

    if let Some(gateway) = route.gateway {
        builder = builder.gateway(gateway);
    }

    if let Some(metric) = route.metric {
        builder = builder.priority(metric);
    }

    builder.build()
}

fn map_netlink_error(e: rtnetlink::Error) -> Error {
    match &e {
        NetlinkError(inner) if inner.raw_code() == -EEXIST => Error::AlreadyExists,
        NetlinkError(inner) if inner.raw_code() == -ENOENT || inner.raw_code() == -ESRCH => {
            Error::NotFound
        }
        NetlinkError(inner) if inner.raw_code() == -EPERM => Error::Privilege,
        NetlinkError(inner) if inner.raw_code() == -EBUSY => Error::Transient(e.to_string()),
        _ => Error::Netlink(e.to_string()),
    }
}
