use alloc::vec::Vec;
use core::fmt;

use super::SocketHandle;
use crate::config::{EPHEMERAL_PORT_FIRST, EPHEMERAL_PORT_LAST};
use crate::wire::{IpAddress, IpEndpoint, IpListenEndpoint};

/// Error returned when an endpoint cannot be allocated.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AllocateError {
    /// The local endpoint (or the whole 4-tuple) is taken.
    AddrInUse,
    /// No ephemeral port is free.
    Exhausted,
}

impl fmt::Display for AllocateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            AllocateError::AddrInUse => write!(f, "address in use"),
            AllocateError::Exhausted => write!(f, "ephemeral ports exhausted"),
        }
    }
}

impl core::error::Error for AllocateError {}

/// Identifies one allocated endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(u32);

#[derive(Debug, Clone, Copy)]
struct Entry {
    id: EndpointId,
    socket: SocketHandle,
    local: IpListenEndpoint,
    remote: Option<IpEndpoint>,
}

/// The demultiplexer: which socket owns which local port and, once connected,
/// which 4-tuple.
#[derive(Debug)]
pub struct Endpoints {
    entries: Vec<Entry>,
    next_id: u32,
    next_ephemeral: u16,
}

impl Default for Endpoints {
    fn default() -> Endpoints {
        Endpoints::new()
    }
}

impl Endpoints {
    pub fn new() -> Endpoints {
        Endpoints {
            entries: Vec::new(),
            next_id: 0,
            next_ephemeral: EPHEMERAL_PORT_FIRST,
        }
    }

    fn port_in_use(&self, addr: Option<IpAddress>, port: u16) -> bool {
        self.entries.iter().any(|entry| {
            entry.remote.is_none()
                && entry.local.port == port
                && match (entry.local.addr, addr) {
                    (Some(a), Some(b)) => a == b,
                    _ => true,
                }
        })
    }

    fn ephemeral_port(&mut self, addr: Option<IpAddress>) -> Result<u16, AllocateError> {
        let range = (EPHEMERAL_PORT_LAST - EPHEMERAL_PORT_FIRST) as usize + 1;
        for _ in 0..range {
            let port = self.next_ephemeral;
            self.next_ephemeral = if port == EPHEMERAL_PORT_LAST {
                EPHEMERAL_PORT_FIRST
            } else {
                port + 1
            };
            if !self.entries.iter().any(|entry| entry.local.port == port)
                && !self.port_in_use(addr, port)
            {
                return Ok(port);
            }
        }
        Err(AllocateError::Exhausted)
    }

    fn push(
        &mut self,
        socket: SocketHandle,
        local: IpListenEndpoint,
        remote: Option<IpEndpoint>,
    ) -> EndpointId {
        let id = EndpointId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.entries.push(Entry {
            id,
            socket,
            local,
            remote,
        });
        net_trace!("endpoint: {} bound to {}", socket, local);
        id
    }

    /// Allocate a local endpoint. An unspecified address matches any local
    /// address; port 0 picks an ephemeral port.
    pub fn allocate(
        &mut self,
        socket: SocketHandle,
        local: IpListenEndpoint,
    ) -> Result<(EndpointId, IpListenEndpoint), AllocateError> {
        let port = match local.port {
            0 => self.ephemeral_port(local.addr)?,
            port if self.port_in_use(local.addr, port) => {
                return Err(AllocateError::AddrInUse);
            }
            port => port,
        };
        let local = IpListenEndpoint {
            addr: local.addr,
            port,
        };
        Ok((self.push(socket, local, None), local))
    }

    /// Allocate a fully specified endpoint for a connection accepted on a
    /// listening port.
    pub fn allocate_tuple(
        &mut self,
        socket: SocketHandle,
        local: IpEndpoint,
        remote: IpEndpoint,
    ) -> Result<EndpointId, AllocateError> {
        let taken = self.entries.iter().any(|entry| {
            entry.remote == Some(remote)
                && entry.local.port == local.port
                && entry.local.addr.is_none_or(|addr| addr == local.addr)
        });
        if taken {
            return Err(AllocateError::AddrInUse);
        }
        Ok(self.push(socket, local.into(), Some(remote)))
    }

    /// Pin an endpoint to a local address and a peer, so that it only
    /// receives that peer's segments.
    pub fn set_peer(&mut self, id: EndpointId, local: IpEndpoint, remote: IpEndpoint) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.id == id) {
            entry.local = local.into();
            entry.remote = Some(remote);
        }
    }

    /// Release an endpoint. Releasing an unknown id does nothing.
    pub fn deallocate(&mut self, id: EndpointId) {
        if let Some(index) = self.entries.iter().position(|entry| entry.id == id) {
            let entry = self.entries.swap_remove(index);
            net_trace!("endpoint: {} released {}", entry.socket, entry.local);
        }
    }

    /// Find the socket a segment from `src` to `dst` belongs to.
    ///
    /// A connected endpoint matching the whole 4-tuple wins over a listening one.
    pub fn lookup(&self, dst: &IpEndpoint, src: &IpEndpoint) -> Option<SocketHandle> {
        let connected = self.entries.iter().find(|entry| {
            entry.remote.as_ref() == Some(src) && entry.local.accepts(dst)
        });
        if let Some(entry) = connected {
            return Some(entry.socket);
        }
        self.entries
            .iter()
            .filter(|entry| entry.remote.is_none() && entry.local.accepts(dst))
            // Prefer an endpoint bound to this exact address over a wildcard.
            .max_by_key(|entry| entry.local.addr.is_some())
            .map(|entry| entry.socket)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
