//! The operating system's routing table, cached for a short while.

use std::fmt::{self, Debug, Formatter};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

const IPV4_ROUTES_PATH: &str = "/proc/net/route";
const IPV6_ROUTES_PATH: &str = "/proc/net/ipv6_route";

const RTF_UP: u32 = 0x0001;
const RTF_REJECT: u32 = 0x0200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The route a packet to some address would take.
pub struct Route {
    /// `None` when the destination is on a directly attached link.
    pub gateway: Option<IpAddr>,
}

/// Resolves the route to an address.
pub trait RouteTable: Send + Sync {
    /// `None` when there is no usable route.
    fn route(&self, ip: &IpAddr) -> Option<Route>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry<T> {
    destination: T,
    prefix_len: u32,
    gateway: Option<T>,
    metric: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Routes read from `/proc/net`, empty where those are not available.
pub struct SystemRoutes {
    v4: Vec<Entry<Ipv4Addr>>,
    v6: Vec<Entry<Ipv6Addr>>,
}

impl SystemRoutes {
    pub fn load() -> Self {
        let v4 = fs::read_to_string(IPV4_ROUTES_PATH).unwrap_or_else(|error| {
            debug!(?error, "Could not read IPv4 routes");
            String::new()
        });
        let v6 = fs::read_to_string(IPV6_ROUTES_PATH).unwrap_or_else(|error| {
            debug!(?error, "Could not read IPv6 routes");
            String::new()
        });

        Self::parse(&v4, &v6)
    }

    /// Parse the contents of `/proc/net/route` and `/proc/net/ipv6_route`.
    /// Malformed lines are skipped.
    pub fn parse(v4: &str, v6: &str) -> Self {
        SystemRoutes {
            v4: v4.lines().skip(1).filter_map(parse_v4_line).collect(),
            v6: v6.lines().filter_map(parse_v6_line).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

impl RouteTable for SystemRoutes {
    fn route(&self, ip: &IpAddr) -> Option<Route> {
        match ip {
            IpAddr::V4(ip) => {
                let ip = u32::from(*ip);

                best(&self.v4, |entry| {
                    let mask = prefix_mask_v4(entry.prefix_len);
                    ip & mask == u32::from(entry.destination) & mask
                })
                .map(|entry| Route {
                    gateway: entry.gateway.map(IpAddr::V4),
                })
            }
            IpAddr::V6(ip) => {
                let ip = u128::from(*ip);

                best(&self.v6, |entry| {
                    let mask = prefix_mask_v6(entry.prefix_len);
                    ip & mask == u128::from(entry.destination) & mask
                })
                .map(|entry| Route {
                    gateway: entry.gateway.map(IpAddr::V6),
                })
            }
        }
    }
}

/// Longest matching prefix, lowest metric among equals.
fn best<T>(entries: &[Entry<T>], matches: impl Fn(&Entry<T>) -> bool) -> Option<&Entry<T>> {
    entries
        .iter()
        .filter(|entry| matches(entry))
        .max_by(|a, b| {
            a.prefix_len
                .cmp(&b.prefix_len)
                .then(b.metric.cmp(&a.metric))
        })
}

fn prefix_mask_v4(prefix_len: u32) -> u32 {
    u32::MAX.checked_shl(32 - prefix_len.min(32)).unwrap_or(0)
}

fn prefix_mask_v6(prefix_len: u32) -> u128 {
    u128::MAX.checked_shl(128 - prefix_len.min(128)).unwrap_or(0)
}

// Iface Destination Gateway Flags RefCnt Use Metric Mask ...
fn parse_v4_line(line: &str) -> Option<Entry<Ipv4Addr>> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 8 {
        return None;
    }

    let flags = u32::from_str_radix(fields[3], 16).ok()?;
    if flags & RTF_UP == 0 || flags & RTF_REJECT != 0 {
        return None;
    }

    // Addresses are printed as native endian integers holding network order bytes.
    let hex_v4 = |field: &str| {
        u32::from_str_radix(field, 16)
            .ok()
            .map(|raw| Ipv4Addr::from(raw.to_ne_bytes()))
    };

    let destination = hex_v4(fields[1])?;
    let gateway = hex_v4(fields[2])?;
    let mask = hex_v4(fields[7])?;

    Some(Entry {
        destination,
        prefix_len: u32::from(mask).count_ones(),
        gateway: (!gateway.is_unspecified()).then_some(gateway),
        metric: fields[6].parse().ok()?,
    })
}

// Destination PrefixLen Source SourcePrefixLen NextHop Metric RefCnt Use Flags Iface
fn parse_v6_line(line: &str) -> Option<Entry<Ipv6Addr>> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }

    let flags = u32::from_str_radix(fields[8], 16).ok()?;
    if flags & RTF_UP == 0 || flags & RTF_REJECT != 0 {
        return None;
    }

    let hex_v6 = |field: &str| {
        if field.len() != 32 {
            return None;
        }
        u128::from_str_radix(field, 16).ok().map(Ipv6Addr::from)
    };

    let destination = hex_v6(fields[0])?;
    let gateway = hex_v6(fields[4])?;

    Some(Entry {
        destination,
        prefix_len: u32::from_str_radix(fields[1], 16).ok()?,
        gateway: (!gateway.is_unspecified()).then_some(gateway),
        metric: u32::from_str_radix(fields[5], 16).ok()?,
    })
}

type Loader = Box<dyn Fn() -> Arc<dyn RouteTable> + Send + Sync>;

/// A [RouteTable] reloaded at most once per `ttl`.
pub struct RouteCache {
    ttl: Duration,
    loader: Loader,
    cached: RwLock<Option<(Instant, Arc<dyn RouteTable>)>>,
}

impl RouteCache {
    /// Cache of the system routing table.
    pub fn new(ttl: Duration) -> Self {
        Self::with_loader(ttl, || Arc::new(SystemRoutes::load()))
    }

    pub fn with_loader<F>(ttl: Duration, loader: F) -> Self
    where
        F: Fn() -> Arc<dyn RouteTable> + Send + Sync + 'static,
    {
        RouteCache {
            ttl,
            loader: Box::new(loader),
            cached: RwLock::new(None),
        }
    }

    pub fn get(&self) -> Arc<dyn RouteTable> {
        {
            let cached = self.cached.read().unwrap_or_else(PoisonError::into_inner);
            if let Some((loaded_at, routes)) = cached.as_ref() {
                if loaded_at.elapsed() < self.ttl {
                    return routes.clone();
                }
            }
        }

        let mut cached = self.cached.write().unwrap_or_else(PoisonError::into_inner);

        // Someone else may have reloaded while we waited for the write lock.
        if let Some((loaded_at, routes)) = cached.as_ref() {
            if loaded_at.elapsed() < self.ttl {
                return routes.clone();
            }
        }

        let routes = (self.loader)();
        *cached = Some((Instant::now(), routes.clone()));

        routes
    }
}

impl Debug for RouteCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteCache").field("ttl", &self.ttl).finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    const ROUTE: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
eth0\t0001A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
eth1\t0000000A\t00000000\t0001\t0\t0\t0\t000000FF\t0\t0\t0
eth1\t0000000A\t00000000\t0200\t0\t0\t0\t0000FFFF\t0\t0\t0
";

    const IPV6_ROUTE: &str = "\
fe800000000000000000000000000000 40 00000000000000000000000000000000 00 00000000000000000000000000000000 00000100 00000001 00000000 00000001     eth0
20010db8000000000000000000000000 20 00000000000000000000000000000000 00 00000000000000000000000000000000 00000100 00000001 00000000 00200201     eth0
00000000000000000000000000000000 00 00000000000000000000000000000000 00 fe800000000000000000000000000001 00000400 00000001 00000000 00000003     eth0
";

    #[test]
    fn ipv4_routes() {
        let routes = SystemRoutes::parse(ROUTE, "");

        let direct = routes.route(&"192.168.1.20".parse().unwrap()).unwrap();
        assert_eq!(direct.gateway, None);

        let direct = routes.route(&"10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(direct.gateway, None);

        let default = routes.route(&"8.8.8.8".parse().unwrap()).unwrap();
        assert_eq!(default.gateway, Some("192.168.1.1".parse().unwrap()));

        assert_eq!(routes.route(&"::1".parse().unwrap()), None);
    }

    #[test]
    fn ipv6_routes() {
        let routes = SystemRoutes::parse("", IPV6_ROUTE);

        let direct = routes.route(&"fe80::1234".parse().unwrap()).unwrap();
        assert_eq!(direct.gateway, None);

        // The documentation prefix is a reject route, so the default route wins.
        let default = routes.route(&"2001:db8::1".parse().unwrap()).unwrap();
        assert_eq!(default.gateway, Some("fe80::1".parse().unwrap()));
    }

    #[test]
    fn malformed_lines() {
        let routes = SystemRoutes::parse("header\ngarbage\n", "zz 40\n");

        assert!(routes.is_empty());
        assert_eq!(routes.route(&"1.1.1.1".parse().unwrap()), None);
    }

    #[test]
    fn load_once_per_ttl() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();

        let cache = Arc::new(RouteCache::with_loader(Duration::from_secs(60), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(SystemRoutes::parse(ROUTE, ""))
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || cache.get().route(&"8.8.8.8".parse().unwrap()))
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap().is_some());
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reload_after_ttl() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();

        let cache = RouteCache::with_loader(Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(SystemRoutes::default())
        });

        cache.get();
        cache.get();
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        thread::sleep(Duration::from_millis(20));

        cache.get();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }
}
