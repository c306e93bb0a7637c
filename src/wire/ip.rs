use core::fmt;

use super::IpAddress;

enum_with_unknown! {
    /// IP datagram encapsulated protocol.
    pub enum Protocol(u8) {
        Tcp = 0x06,
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Unknown(id) => write!(f, "0x{id:02x}"),
        }
    }
}

/// An internet endpoint address.
///
/// `Endpoint` always fully specifies both the address and the port.
///
/// See also ['ListenEndpoint'], which allows not specifying the address
/// in order to listen on a given port on any address.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct Endpoint {
    pub addr: IpAddress,
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint address from given address and port.
    pub const fn new(addr: IpAddress, port: u16) -> Endpoint {
        Endpoint { addr, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl<T: Into<IpAddress>> From<(T, u16)> for Endpoint {
    fn from((addr, port): (T, u16)) -> Endpoint {
        Endpoint {
            addr: addr.into(),
            port,
        }
    }
}

/// An internet endpoint address for listening.
///
/// In contrast with [`Endpoint`], `ListenEndpoint` allows not specifying the address,
/// in order to listen on a given port at all our addresses.
///
/// An endpoint can be constructed from a port, in which case the address is unspecified.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct ListenEndpoint {
    pub addr: Option<IpAddress>,
    pub port: u16,
}

impl ListenEndpoint {
    /// Query whether the endpoint has a specified address and port.
    pub const fn is_specified(&self) -> bool {
        self.addr.is_some() && self.port != 0
    }

    /// Query whether a segment addressed to `dst` would be accepted by this endpoint.
    pub fn accepts(&self, dst: &Endpoint) -> bool {
        self.port == dst.port && self.addr.map(|addr| addr == dst.addr).unwrap_or(true)
    }
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(addr) = self.addr {
            write!(f, "{}:{}", addr, self.port)
        } else {
            write!(f, "*:{}", self.port)
        }
    }
}

impl From<u16> for ListenEndpoint {
    fn from(port: u16) -> ListenEndpoint {
        ListenEndpoint { addr: None, port }
    }
}

impl From<Endpoint> for ListenEndpoint {
    fn from(endpoint: Endpoint) -> ListenEndpoint {
        ListenEndpoint {
            addr: Some(endpoint.addr),
            port: endpoint.port,
        }
    }
}

impl<T: Into<IpAddress>> From<(T, u16)> for ListenEndpoint {
    fn from((addr, port): (T, u16)) -> ListenEndpoint {
        ListenEndpoint {
            addr: Some(addr.into()),
            port,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_protocol_roundtrip() {
        assert_eq!(Protocol::from(6u8), Protocol::Tcp);
        assert_eq!(Protocol::from(17u8), Protocol::Unknown(17));
        assert_eq!(u8::from(Protocol::Tcp), 6);
    }

    #[test]
    fn test_listen_endpoint_accepts() {
        let dst = Endpoint::new(IpAddress::new(10, 0, 0, 1), 80);
        assert!(ListenEndpoint::from(80).accepts(&dst));
        assert!(ListenEndpoint::from((IpAddress::new(10, 0, 0, 1), 80)).accepts(&dst));
        assert!(!ListenEndpoint::from((IpAddress::new(10, 0, 0, 2), 80)).accepts(&dst));
        assert!(!ListenEndpoint::from(81).accepts(&dst));
    }

    #[test]
    fn test_display() {
        let endpoint = Endpoint::new(IpAddress::new(10, 0, 0, 1), 80);
        assert_eq!(format!("{endpoint}"), "10.0.0.1:80");
        assert_eq!(format!("{}", ListenEndpoint::from(80)), "*:80");
    }
}
