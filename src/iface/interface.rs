use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

use bytes::Bytes;
use heapless::Vec as HVec;

use super::endpoint::{AllocateError, EndpointId, Endpoints};
use super::route::Routes;
use super::socket_set::{SocketHandle, SocketSet, SocketSetFull};
use super::timer::{TimerHandle, TimerKind, TimerQueue};
use crate::config::IFACE_MAX_ADDR_COUNT;
use crate::phy::{Device, RxToken, TxToken};
use crate::socket::tcp::{Notification, RxOutcome, Socket};
use crate::time::{Duration, Instant};
use crate::wire::ipv4::DEFAULT_HOP_LIMIT;
use crate::wire::{
    IpAddress, IpEndpoint, IpListenEndpoint, IpProtocol, Ipv4Cidr, Ipv4Packet, Ipv4Repr,
    TcpPacket, TcpRepr,
};

/// Configuration structure used for creating a network interface.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// The address the interface owns, with the prefix of its directly attached subnet.
    pub ip_addr: Ipv4Cidr,
}

impl Config {
    pub fn new(ip_addr: Ipv4Cidr) -> Self {
        Config { ip_addr }
    }
}

/// A segment waiting to be serialized and handed to the link.
#[derive(Debug, Clone)]
struct Outbound {
    ip_repr: Ipv4Repr,
    tcp_repr: TcpRepr,
    payload: Bytes,
}

/// A network interface.
///
/// The network interface logically owns a number of other data structures; to avoid
/// a dependency on heap allocation, it instead owns a `BorrowMut<[T]>`, which can be
/// a `&mut [T]`, or `Vec<T>` if a heap is available.
#[derive(Debug)]
pub struct Interface {
    inner: InterfaceInner,
    sockets: SocketSet<'static>,
}

/// The device independent part of an interface.
///
/// Separating the device from the data required for processing and dispatching makes
/// it possible to borrow them independently. For example, the tx and rx tokens borrow
/// the `device` mutably until they're used, which makes it impossible to call other
/// methods on the `Interface` in this time (since its `device` field is borrowed
/// exclusively). However, it is still possible to call methods on its `inner` field.
#[derive(Debug)]
pub struct InterfaceInner {
    now: Instant,
    ip_addrs: HVec<Ipv4Cidr, IFACE_MAX_ADDR_COUNT>,
    routes: Routes,
    timers: TimerQueue,
    endpoints: Endpoints,
    tx_queue: VecDeque<Outbound>,
    current: SocketHandle,
}

impl InterfaceInner {
    fn new(config: Config, now: Instant) -> InterfaceInner {
        let mut ip_addrs = HVec::new();
        // A fresh heapless vector always has room for one address.
        let _ = ip_addrs.push(config.ip_addr);
        InterfaceInner {
            now,
            ip_addrs,
            routes: Routes::new(),
            timers: TimerQueue::new(),
            endpoints: Endpoints::new(),
            tx_queue: VecDeque::new(),
            current: SocketHandle::default(),
        }
    }

    /// The current simulated time.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// The socket whose event is being processed.
    pub fn current_socket(&self) -> SocketHandle {
        self.current
    }

    /// Arm a timer of `kind` for the current socket, expiring `delay` from now.
    pub fn schedule(&mut self, kind: TimerKind, delay: Duration) -> TimerHandle {
        self.timers.schedule(self.current, kind, self.now + delay)
    }

    /// Queue a segment for transmission.
    pub fn transmit(&mut self, src_addr: IpAddress, dst_addr: IpAddress, repr: TcpRepr, payload: Bytes) {
        let ip_repr = Ipv4Repr {
            src_addr,
            dst_addr,
            next_header: IpProtocol::Tcp,
            payload_len: repr.buffer_len() + payload.len(),
            hop_limit: DEFAULT_HOP_LIMIT,
        };
        net_trace!(
            "{}: sending {} len={} to {}",
            self.current,
            repr,
            payload.len(),
            dst_addr
        );
        self.tx_queue.push_back(Outbound {
            ip_repr,
            tcp_repr: repr,
            payload,
        });
    }

    /// Allocate a local endpoint for the current socket.
    pub fn allocate_endpoint(
        &mut self,
        local: IpListenEndpoint,
    ) -> Result<(EndpointId, IpListenEndpoint), AllocateError> {
        self.endpoints.allocate(self.current, local)
    }

    /// Allocate a fully specified endpoint for the current socket.
    pub fn allocate_tuple(
        &mut self,
        local: IpEndpoint,
        remote: IpEndpoint,
    ) -> Result<EndpointId, AllocateError> {
        self.endpoints.allocate_tuple(self.current, local, remote)
    }

    pub fn set_peer(&mut self, id: EndpointId, local: IpEndpoint, remote: IpEndpoint) {
        self.endpoints.set_peer(id, local, remote)
    }

    pub fn deallocate_endpoint(&mut self, id: EndpointId) {
        self.endpoints.deallocate(id)
    }

    /// Check whether the interface has the given IP address assigned.
    pub fn has_ip_addr(&self, addr: IpAddress) -> bool {
        self.ip_addrs.iter().any(|cidr| cidr.address() == addr)
    }

    /// The local address to use when talking to `dst`, or `None` if `dst` is unreachable.
    pub fn route_source(&self, dst: &IpAddress) -> Option<IpAddress> {
        if let Some(cidr) = self.ip_addrs.iter().find(|cidr| cidr.contains_addr(dst)) {
            return Some(cidr.address());
        }

        let router = self.routes.lookup(dst, self.now)?;
        self.ip_addrs
            .iter()
            .find(|cidr| cidr.contains_addr(&router))
            .map(|cidr| cidr.address())
    }

    #[cfg(test)]
    pub(crate) fn mock() -> InterfaceInner {
        InterfaceInner::new(
            Config::new(Ipv4Cidr::new(IpAddress::new(192, 168, 1, 1), 24)),
            Instant::ZERO,
        )
    }

    #[cfg(test)]
    pub(crate) fn set_now(&mut self, now: Instant) {
        self.now = now;
    }

    #[cfg(test)]
    pub(crate) fn pop_transmitted(&mut self) -> Option<(Ipv4Repr, TcpRepr, Bytes)> {
        self.tx_queue
            .pop_front()
            .map(|out| (out.ip_repr, out.tcp_repr, out.payload))
    }

    #[cfg(test)]
    pub(crate) fn pop_due_timer(&mut self) -> Option<(SocketHandle, TimerKind)> {
        self.timers.pop_due(self.now)
    }

    #[cfg(test)]
    pub(crate) fn next_timer(&mut self) -> Option<Instant> {
        self.timers.poll_at()
    }
}

impl Interface {
    /// Create a network interface owning `config.ip_addr`, with its clock at `now`.
    pub fn new(config: Config, now: Instant) -> Interface {
        Interface {
            inner: InterfaceInner::new(config, now),
            sockets: SocketSet::new(vec![]),
        }
    }

    /// Get a reference to the inner interface.
    pub fn context(&mut self) -> &mut InterfaceInner {
        &mut self.inner
    }

    pub fn now(&self) -> Instant {
        self.inner.now
    }

    /// Get the IP addresses of the interface.
    pub fn ip_addrs(&self) -> &[Ipv4Cidr] {
        self.inner.ip_addrs.as_ref()
    }

    /// Update the IP addresses of the interface.
    pub fn update_ip_addrs<F: FnOnce(&mut HVec<Ipv4Cidr, IFACE_MAX_ADDR_COUNT>)>(&mut self, f: F) {
        f(&mut self.inner.ip_addrs);
    }

    pub fn routes(&self) -> &Routes {
        &self.inner.routes
    }

    pub fn routes_mut(&mut self) -> &mut Routes {
        &mut self.inner.routes
    }

    /// Add a socket to the interface, and return its handle.
    pub fn add_socket(&mut self, socket: Socket) -> Result<SocketHandle, SocketSetFull> {
        self.sockets.add(socket)
    }

    /// Get a socket by its handle.
    ///
    /// # Panics
    /// This function may panic if the handle does not belong to this interface.
    pub fn socket(&self, handle: SocketHandle) -> &Socket {
        self.sockets.get(handle)
    }

    pub fn sockets(&self) -> impl Iterator<Item = (SocketHandle, &Socket)> {
        self.sockets.iter()
    }

    /// Remove a socket, releasing its endpoint and timers.
    ///
    /// # Panics
    /// This function may panic if the handle does not belong to this interface.
    pub fn remove_socket(&mut self, handle: SocketHandle) -> Socket {
        self.inner.current = handle;
        self.sockets.get_mut(handle).detach(&mut self.inner);
        self.sockets.remove(handle)
    }

    /// Run an application call against one socket.
    ///
    /// # Panics
    /// This function may panic if the handle does not belong to this interface.
    pub fn with_socket<F, R>(&mut self, handle: SocketHandle, f: F) -> R
    where
        F: FnOnce(&mut Socket, &mut InterfaceInner) -> R,
    {
        self.inner.current = handle;
        f(self.sockets.get_mut(handle), &mut self.inner)
    }

    /// Parse one IPv4 datagram and hand the segment it carries to its socket.
    ///
    /// Malformed datagrams and segments nobody listens for are dropped.
    pub fn process_packet(&mut self, now: Instant, frame: &[u8]) {
        self.inner.now = now;

        let ip_packet = match Ipv4Packet::new_checked(frame) {
            Ok(packet) => packet,
            Err(_) => {
                net_debug!("iface: truncated datagram");
                return;
            }
        };
        let ip_repr = match Ipv4Repr::parse(&ip_packet) {
            Ok(repr) => repr,
            Err(_) => {
                net_debug!("iface: malformed datagram");
                return;
            }
        };
        if ip_repr.next_header != IpProtocol::Tcp {
            net_debug!("iface: dropping {}", ip_repr);
            return;
        }
        if !self.inner.has_ip_addr(ip_repr.dst_addr) {
            net_debug!("iface: {} is not for us", ip_repr);
            return;
        }

        let tcp_packet = match TcpPacket::new_checked(ip_packet.payload()) {
            Ok(packet) => packet,
            Err(_) => {
                net_debug!("iface: truncated segment");
                return;
            }
        };
        let tcp_repr = match TcpRepr::parse(&tcp_packet, &ip_repr.src_addr, &ip_repr.dst_addr) {
            Ok(repr) => repr,
            Err(_) => {
                net_debug!("iface: malformed segment");
                return;
            }
        };
        let payload = Bytes::copy_from_slice(tcp_packet.payload());

        let dst = IpEndpoint::new(ip_repr.dst_addr, tcp_repr.dst_port);
        let src = IpEndpoint::new(ip_repr.src_addr, tcp_repr.src_port);
        let Some(handle) = self.inner.endpoints.lookup(&dst, &src) else {
            net_debug!("iface: no endpoint for {} from {}, dropping {}", dst, src, tcp_repr);
            return;
        };

        self.inner.current = handle;
        let Some(socket) = self.sockets.try_get_mut(handle) else {
            net_debug!("iface: endpoint of {} outlived its socket", handle);
            return;
        };

        match socket.process(&mut self.inner, &ip_repr, &tcp_repr, payload) {
            RxOutcome::Processed => (),
            RxOutcome::Fork => {
                let child = socket.clone_for_accept();
                let child_handle = match self.sockets.add(child) {
                    Ok(child_handle) => child_handle,
                    Err(SocketSetFull) => {
                        net_debug!("iface: no room to accept a connection on {}", handle);
                        return;
                    }
                };
                net_trace!("iface: {} forked {} for {}", handle, child_handle, src);
                self.inner.current = child_handle;
                let forked = self
                    .sockets
                    .get_mut(child_handle)
                    .complete_fork(&mut self.inner, handle, &ip_repr, &tcp_repr);
                if let Err(err) = forked {
                    net_debug!("iface: cannot accept {} on {}: {}", src, handle, err);
                    self.sockets.remove(child_handle);
                }
            }
        }
    }

    /// Fire every timer due at or before `now`, returning how many fired.
    pub fn poll_timers(&mut self, now: Instant) -> usize {
        self.inner.now = now;
        let mut fired = 0;
        while let Some((handle, kind)) = self.inner.timers.pop_due(now) {
            self.inner.current = handle;
            match self.sockets.try_get_mut(handle) {
                Some(socket) => socket.on_timer(&mut self.inner, kind),
                None => net_debug!("iface: {} timer fired for removed {}", kind, handle),
            }
            fired += 1;
        }
        fired
    }

    /// Transmit queued packets, receive every frame the device has due, and fire
    /// due timers. Anything the received frames and timers cause to be sent
    /// goes out before this returns.
    ///
    /// Returns whether anything happened.
    pub fn poll<D>(&mut self, now: Instant, device: &mut D) -> bool
    where
        D: Device + ?Sized,
    {
        self.inner.now = now;
        let mut readiness = self.egress(device) > 0;
        while let Some(rx_token) = device.receive(now) {
            rx_token.consume(|frame| self.process_packet(now, frame));
            readiness = true;
        }
        if self.poll_timers(now) > 0 {
            readiness = true;
        }
        if self.egress(device) > 0 {
            readiness = true;
        }
        readiness
    }

    fn egress<D>(&mut self, device: &mut D) -> usize
    where
        D: Device + ?Sized,
    {
        let mtu = device.capabilities().max_transmission_unit;
        let mut count = 0;
        while let Some(out) = self.inner.tx_queue.pop_front() {
            if out.buffer_len() > mtu {
                net_debug!("iface: {} does not fit the MTU of {}", out.ip_repr, mtu);
                continue;
            }
            let Some(tx_token) = device.transmit(self.inner.now) else {
                self.inner.tx_queue.push_front(out);
                break;
            };
            tx_token.consume(out.buffer_len(), |frame| out.emit(frame));
            count += 1;
        }
        count
    }

    /// The instant the next timer expires at, if any is armed.
    pub fn poll_at(&mut self) -> Option<Instant> {
        self.inner.timers.poll_at()
    }

    /// Serialize queued segments into IPv4 datagrams and hand them to `emit`.
    ///
    /// Stops at the first error, leaving the failed datagram queued. Returns the
    /// number of datagrams emitted.
    pub fn dispatch<F, E>(&mut self, mut emit: F) -> Result<usize, E>
    where
        F: FnMut(&[u8]) -> Result<(), E>,
    {
        let mut count = 0;
        while let Some(out) = self.inner.tx_queue.pop_front() {
            let frame = serialize(&out);
            if let Err(err) = emit(&frame) {
                self.inner.tx_queue.push_front(out);
                return Err(err);
            }
            count += 1;
        }
        Ok(count)
    }

    /// Number of datagrams waiting for [`dispatch`](#method.dispatch).
    pub fn tx_pending(&self) -> usize {
        self.inner.tx_queue.len()
    }

    /// Pop the next application notification of any socket, lowest handle first.
    pub fn poll_notification(&mut self) -> Option<(SocketHandle, Notification)> {
        self.sockets
            .iter_mut()
            .find_map(|(handle, socket)| socket.poll_notification().map(|n| (handle, n)))
    }
}

impl Outbound {
    fn buffer_len(&self) -> usize {
        self.ip_repr.buffer_len() + self.ip_repr.payload_len
    }

    fn emit(&self, frame: &mut [u8]) {
        let mut ip_packet = Ipv4Packet::new_unchecked(frame);
        self.ip_repr.emit(&mut ip_packet);
        self.tcp_repr.emit(
            &mut TcpPacket::new_unchecked(ip_packet.payload_mut()),
            &self.ip_repr.src_addr,
            &self.ip_repr.dst_addr,
            &self.payload,
        );
    }
}

fn serialize(out: &Outbound) -> Vec<u8> {
    let mut frame = vec![0; out.buffer_len()];
    out.emit(&mut frame);
    frame
}
