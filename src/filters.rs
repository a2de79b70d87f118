//! Address classification, and the filters deciding which peers are worth
//! querying or keeping in the routing table.

mod routes;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use multiaddr::{Multiaddr, Protocol};

use crate::common::{PeerId, PeerInfo};
use crate::net::Host;

pub use routes::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Which peers found by a query are worth querying further.
pub enum QueryFilter {
    /// Peers with a public, non relayed address.
    Public,
    #[default]
    /// Any peer with an address.
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Which peers may enter the routing table.
pub enum RoutingTableFilter {
    #[default]
    /// Every peer.
    None,
    /// Connected peers with a public, non relayed address.
    Public,
    /// Peers that look like they are on our local network.
    Private,
}

impl QueryFilter {
    pub fn allows(&self, peer: &PeerInfo) -> bool {
        match self {
            QueryFilter::Public => has_public_addr(&peer.addrs),
            QueryFilter::Private => peer.has_addrs(),
        }
    }
}

impl RoutingTableFilter {
    pub fn allows(&self, host: &dyn Host, routes: &RouteCache, peer: &PeerId) -> bool {
        match self {
            RoutingTableFilter::None => true,
            RoutingTableFilter::Public => {
                let connected = !host.remote_addrs(peer).is_empty();

                connected && has_public_addr(&host.peer_addrs(peer))
            }
            RoutingTableFilter::Private => {
                let remote_addrs = host.remote_addrs(peer);
                if remote_addrs.is_empty() {
                    return false;
                }

                is_local_peer(&host.addrs(), &remote_addrs, routes.get().as_ref())
            }
        }
    }
}

fn has_public_addr(addrs: &[Multiaddr]) -> bool {
    addrs
        .iter()
        .any(|addr| !is_relay_addr(addr) && is_public_addr(addr))
}

/// Whether a peer seen at `remote_addrs` looks like it shares a network with us.
///
/// True if any of its addresses is private, or is public and either one of our
/// own public addresses (the same /64 when both are EUI-64 IPv6 addresses) or
/// reachable through a route with no gateway.
pub fn is_local_peer(
    own_addrs: &[Multiaddr],
    remote_addrs: &[Multiaddr],
    routes: &dyn RouteTable,
) -> bool {
    for addr in remote_addrs {
        if is_relay_addr(addr) {
            continue;
        }

        if is_private_addr(addr) {
            return true;
        }

        let Some(ip) = ip_of(addr) else {
            continue;
        };

        if is_public_addr(addr) {
            let own_public = own_addrs
                .iter()
                .filter(|own| !is_relay_addr(own) && is_public_addr(own))
                .filter_map(ip_of);

            for own in own_public {
                if ip == own {
                    return true;
                }

                if let (IpAddr::V6(ip), IpAddr::V6(own)) = (ip, own) {
                    if is_eui64(&ip) && is_eui64(&own) && same_v6_net(&ip, &own) {
                        return true;
                    }
                }
            }

            if let Some(route) = routes.route(&ip) {
                if route.gateway.is_none() {
                    return true;
                }
            }
        }
    }

    false
}

/// Relayed addresses go through a circuit relay.
pub fn is_relay_addr(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

/// IPv4 outside the private and unroutable ranges, or IPv6 in `2000::/3`.
pub fn is_public_addr(addr: &Multiaddr) -> bool {
    match ip_of(addr) {
        Some(IpAddr::V4(ip)) => !is_private_v4(&ip) && !is_unroutable_v4(&ip),
        Some(IpAddr::V6(ip)) => is_global_unicast_v6(&ip),
        None => false,
    }
}

/// Private IPv4 ranges and loopback, or any IPv6 outside `2000::/3`.
pub fn is_private_addr(addr: &Multiaddr) -> bool {
    match ip_of(addr) {
        Some(IpAddr::V4(ip)) => is_private_v4(&ip),
        Some(IpAddr::V6(ip)) => !is_global_unicast_v6(&ip),
        None => false,
    }
}

/// The IP address an address starts with.
pub fn ip_of(addr: &Multiaddr) -> Option<IpAddr> {
    match addr.iter().next()? {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    }
}

/// Interface identifier derived from a MAC address.
pub fn is_eui64(ip: &Ipv6Addr) -> bool {
    let octets = ip.octets();

    octets[11] == 0xff && octets[12] == 0xfe
}

/// Same /64 network.
pub fn same_v6_net(a: &Ipv6Addr, b: &Ipv6Addr) -> bool {
    a.octets()[..8] == b.octets()[..8]
}

fn is_private_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();

    ip.is_private()
        || ip.is_link_local()
        || ip.is_loopback()
        // 100.64.0.0/10
        || (a == 100 && b & 0xc0 == 64)
}

fn is_unroutable_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, c, d] = ip.octets();

    a == 0
        || ip.is_documentation()
        || ip.is_broadcast()
        || ip.is_multicast()
        // 192.0.0.0/26
        || (a == 192 && b == 0 && c == 0 && d < 64)
}

fn is_global_unicast_v6(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xe000 == 0x2000
}
