use heapless::Vec;

use crate::config::IFACE_MAX_ROUTE_COUNT;
use crate::time::Instant;
use crate::wire::{IpAddress, Ipv4Cidr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteTableFull;

impl core::fmt::Display for RouteTableFull {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Route table full")
    }
}

impl core::error::Error for RouteTableFull {}

/// A prefix of addresses that should be routed via a router
#[derive(Debug, Clone, Copy)]
pub struct Route {
    pub cidr: Ipv4Cidr,
    pub via_router: IpAddress,
    /// `None` means "forever".
    pub expires_at: Option<Instant>,
}

const IPV4_DEFAULT: Ipv4Cidr = Ipv4Cidr::new(IpAddress::new(0, 0, 0, 0), 0);

impl Route {
    /// Returns a route to 0.0.0.0/0 via the `gateway`, with no expiry.
    pub fn new_ipv4_gateway(gateway: IpAddress) -> Route {
        Route {
            cidr: IPV4_DEFAULT,
            via_router: gateway,
            expires_at: None,
        }
    }
}

/// A routing table.
#[derive(Debug, Default)]
pub struct Routes {
    storage: Vec<Route, IFACE_MAX_ROUTE_COUNT>,
}

impl Routes {
    /// Creates a new empty routing table.
    pub fn new() -> Self {
        Self {
            storage: Vec::new(),
        }
    }

    /// Update the routes of this node.
    pub fn update<F: FnOnce(&mut Vec<Route, IFACE_MAX_ROUTE_COUNT>)>(&mut self, f: F) {
        f(&mut self.storage);
    }

    /// Add a route, failing if the table is full.
    pub fn add(&mut self, route: Route) -> Result<(), RouteTableFull> {
        self.storage.push(route).map_err(|_| RouteTableFull)
    }

    /// Add a default gateway (ie. "ip route add 0.0.0.0/0 via `gateway`").
    ///
    /// On success, returns the previous default route, if any.
    pub fn add_default_ipv4_route(
        &mut self,
        gateway: IpAddress,
    ) -> Result<Option<Route>, RouteTableFull> {
        let old = self.remove_default_ipv4_route();
        self.storage
            .push(Route::new_ipv4_gateway(gateway))
            .map_err(|_| RouteTableFull)?;
        Ok(old)
    }

    /// Remove the default gateway
    ///
    /// On success, returns the previous default route, if any.
    pub fn remove_default_ipv4_route(&mut self) -> Option<Route> {
        if let Some((i, _)) = self
            .storage
            .iter()
            .enumerate()
            .find(|(_, r)| r.cidr == IPV4_DEFAULT)
        {
            Some(self.storage.remove(i))
        } else {
            None
        }
    }

    /// Find the router a datagram for `addr` should be sent through.
    pub(crate) fn lookup(&self, addr: &IpAddress, timestamp: Instant) -> Option<IpAddress> {
        self.storage
            .iter()
            // Keep only matching routes
            .filter(|route| {
                if let Some(expires_at) = route.expires_at {
                    if timestamp > expires_at {
                        return false;
                    }
                }
                route.cidr.contains_addr(addr)
            })
            // pick the most specific one (highest prefix_len)
            .max_by_key(|route| route.cidr.prefix_len())
            .map(|route| route.via_router)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const GATEWAY: IpAddress = IpAddress::new(10, 0, 0, 254);

    #[test]
    fn test_default_route() {
        let mut routes = Routes::new();
        assert_eq!(
            routes.lookup(&IpAddress::new(192, 168, 1, 1), Instant::ZERO),
            None
        );
        assert!(routes.add_default_ipv4_route(GATEWAY).unwrap().is_none());
        assert_eq!(
            routes.lookup(&IpAddress::new(192, 168, 1, 1), Instant::ZERO),
            Some(GATEWAY)
        );
        assert!(routes.add_default_ipv4_route(GATEWAY).unwrap().is_some());
        assert!(routes.remove_default_ipv4_route().is_some());
        assert!(routes.remove_default_ipv4_route().is_none());
    }

    #[test]
    fn test_most_specific_wins() {
        let mut routes = Routes::new();
        routes.add_default_ipv4_route(GATEWAY).unwrap();
        routes
            .add(Route {
                cidr: Ipv4Cidr::new(IpAddress::new(192, 168, 0, 0), 16),
                via_router: IpAddress::new(10, 0, 0, 253),
                expires_at: None,
            })
            .unwrap();
        assert_eq!(
            routes.lookup(&IpAddress::new(192, 168, 1, 1), Instant::ZERO),
            Some(IpAddress::new(10, 0, 0, 253))
        );
        assert_eq!(
            routes.lookup(&IpAddress::new(172, 16, 0, 1), Instant::ZERO),
            Some(GATEWAY)
        );
    }

    #[test]
    fn test_expired_route_ignored() {
        let mut routes = Routes::new();
        routes
            .add(Route {
                cidr: IPV4_DEFAULT,
                via_router: GATEWAY,
                expires_at: Some(Instant::from_millis(100)),
            })
            .unwrap();
        let dst = IpAddress::new(8, 8, 8, 8);
        assert_eq!(routes.lookup(&dst, Instant::from_millis(100)), Some(GATEWAY));
        assert_eq!(routes.lookup(&dst, Instant::from_millis(101)), None);
    }

    #[test]
    fn test_table_full() {
        let mut routes = Routes::new();
        for i in 0..IFACE_MAX_ROUTE_COUNT {
            routes
                .add(Route {
                    cidr: Ipv4Cidr::new(IpAddress::new(10, i as u8, 0, 0), 16),
                    via_router: GATEWAY,
                    expires_at: None,
                })
                .unwrap();
        }
        assert_eq!(
            routes.add(Route::new_ipv4_gateway(GATEWAY)),
            Err(RouteTableFull)
        );
    }
}
