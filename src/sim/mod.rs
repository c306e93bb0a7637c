/*! Two interfaces, one link, one clock.

[Network] is the smallest discrete-event loop that exercises the whole stack: it
owns two [interfaces](crate::iface::Interface) joined by a [Link], and advances a
shared clock from one event to the next. An event is a frame arriving at either
end or a timer expiring on either interface. Nothing happens between events, so
the clock jumps.

Applications act between steps with [Network::with_socket], and learn what
happened with [Network::poll_notification].
*/

use crate::iface::{self, Context, Interface, SocketHandle, SocketSetFull};
use crate::phy::{Link, LinkConfig, Side};
use crate::socket::tcp::{Notification, Socket};
use crate::time::Instant;

/// A simulated network of two hosts.
#[derive(Debug)]
pub struct Network {
    now: Instant,
    link: Link,
    ifaces: [Interface; 2],
}

impl Network {
    /// Connect interface `a` to interface `b`, starting the clock at zero.
    pub fn new(a: iface::Config, b: iface::Config, link: LinkConfig) -> Network {
        Network {
            now: Instant::ZERO,
            link: Link::new(link),
            ifaces: [Interface::new(a, Instant::ZERO), Interface::new(b, Instant::ZERO)],
        }
    }

    /// The current simulated time.
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }

    pub fn iface(&self, side: Side) -> &Interface {
        &self.ifaces[side.index()]
    }

    pub fn iface_mut(&mut self, side: Side) -> &mut Interface {
        &mut self.ifaces[side.index()]
    }

    pub fn add_socket(&mut self, side: Side, socket: Socket) -> Result<SocketHandle, SocketSetFull> {
        self.iface_mut(side).add_socket(socket)
    }

    pub fn socket(&self, side: Side, handle: SocketHandle) -> &Socket {
        self.iface(side).socket(handle)
    }

    /// Run an application call against a socket at the current time.
    ///
    /// Segments the call emits leave on the next [step](#method.step).
    pub fn with_socket<F, R>(&mut self, side: Side, handle: SocketHandle, f: F) -> R
    where
        F: FnOnce(&mut Socket, &mut Context) -> R,
    {
        self.iface_mut(side).with_socket(handle, f)
    }

    /// Pop the next notification of any socket on one side.
    pub fn poll_notification(&mut self, side: Side) -> Option<(SocketHandle, Notification)> {
        self.iface_mut(side).poll_notification()
    }

    /// The instant of the next event, if any.
    pub fn poll_at(&mut self) -> Option<Instant> {
        if self.ifaces.iter().any(|iface| iface.tx_pending() > 0) {
            return Some(self.now);
        }
        let timers = self
            .ifaces
            .iter_mut()
            .filter_map(|iface| iface.poll_at())
            .min();
        match (timers, self.link.next_delivery()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Advance the clock to the next event and process everything due then.
    ///
    /// Returns `false` when there is nothing left to happen.
    pub fn step(&mut self) -> bool {
        self.poll_all();
        let Some(at) = self.poll_at() else {
            return false;
        };
        if at > self.now {
            self.now = at;
        }
        self.poll_all();
        true
    }

    /// Step until the next event lies past `deadline`, then set the clock to it.
    pub fn run_until(&mut self, deadline: Instant) {
        self.poll_all();
        while let Some(at) = self.poll_at() {
            if at > deadline {
                break;
            }
            if at > self.now {
                self.now = at;
            }
            self.poll_all();
        }
        if self.now < deadline {
            self.now = deadline;
        }
    }

    /// Poll both interfaces until neither has anything left to do at this instant.
    fn poll_all(&mut self) {
        loop {
            let mut readiness = false;
            for side in [Side::A, Side::B] {
                let iface = &mut self.ifaces[side.index()];
                readiness |= iface.poll(self.now, &mut self.link.port(side));
            }
            if !readiness {
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::socket::tcp::{self, State};
    use crate::time::Duration;
    use crate::wire::{IpAddress, IpEndpoint, Ipv4Cidr, Ipv4Packet, TcpPacket};

    const ADDR_A: IpAddress = IpAddress::new(10, 0, 0, 1);
    const ADDR_B: IpAddress = IpAddress::new(10, 0, 0, 2);
    const SERVER: IpEndpoint = IpEndpoint::new(ADDR_B, 80);

    fn network() -> Network {
        Network::new(
            iface::Config::new(Ipv4Cidr::new(ADDR_A, 24)),
            iface::Config::new(Ipv4Cidr::new(ADDR_B, 24)),
            LinkConfig::new(Duration::from_millis(10)),
        )
    }

    /// Listen on B, connect from A, and return both handles once the handshake is done.
    fn connected(net: &mut Network, client: Socket) -> (SocketHandle, SocketHandle) {
        let listener = net.add_socket(Side::B, Socket::new()).unwrap();
        net.with_socket(Side::B, listener, |socket, cx| {
            socket.bind(cx, 80).unwrap();
            socket.listen(cx).unwrap();
        });
        let client = net.add_socket(Side::A, client).unwrap();
        net.with_socket(Side::A, client, |socket, cx| socket.connect(cx, SERVER))
            .unwrap();
        net.run_until(Instant::from_millis(100));

        assert_eq!(net.socket(Side::A, client).state(), State::Established);
        let mut server = None;
        while let Some((handle, notification)) = net.poll_notification(Side::B) {
            if let tcp::Notification::NewConnectionCreated {
                listener: from,
                remote,
            } = notification
            {
                assert_eq!(from, listener);
                assert_eq!(remote.addr, ADDR_A);
                server = Some(handle);
            }
        }
        let server = server.expect("no connection was accepted");
        assert_eq!(net.socket(Side::B, server).state(), State::Established);
        assert_eq!(net.socket(Side::B, listener).state(), State::Listen);
        (client, server)
    }

    fn drain(net: &mut Network, side: Side, handle: SocketHandle, into: &mut Vec<u8>) {
        net.with_socket(side, handle, |socket, _| {
            while let Ok(chunk) = socket.recv() {
                if chunk.is_empty() {
                    break;
                }
                into.extend_from_slice(&chunk);
            }
        });
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn tcp_payload_len(frame: &[u8]) -> usize {
        let ip = Ipv4Packet::new_unchecked(frame);
        TcpPacket::new_unchecked(ip.payload()).payload().len()
    }

    #[test]
    fn test_handshake() {
        let mut net = network();
        let (client, _) = connected(&mut net, Socket::new());
        // SYN at 0, SYN|ACK at 10ms, ACK at 20ms.
        assert_eq!(net.now(), Instant::from_millis(100));
        let mut notifications = vec![];
        while let Some((handle, notification)) = net.poll_notification(Side::A) {
            assert_eq!(handle, client);
            notifications.push(notification);
        }
        assert_eq!(
            notifications,
            [
                tcp::Notification::ConnectionSucceeded,
                tcp::Notification::SendAvailable(131072),
            ]
        );
        assert_eq!(
            net.socket(Side::A, client).remote_endpoint(),
            Some(SERVER)
        );
    }

    #[test]
    fn test_connection_refused_without_listener() {
        let mut net = network();
        let client = net.add_socket(Side::A, Socket::new()).unwrap();
        net.with_socket(Side::A, client, |socket, cx| {
            socket.set_connect_timeout(Duration::from_millis(100), 2);
            socket.connect(cx, SERVER)
        })
        .unwrap();
        net.run_until(Instant::from_secs(1));

        // Nobody answers on B: two SYNs, then the attempt is given up.
        assert_eq!(net.link().fault_injector().seen(Side::A), 2);
        assert_eq!(net.socket(Side::A, client).state(), State::Closed);
        assert_eq!(
            net.poll_notification(Side::A),
            Some((client, tcp::Notification::ConnectionFailed))
        );
    }

    #[test]
    fn test_bulk_transfer() {
        let mut net = network();
        let (client, server) = connected(&mut net, Socket::new());
        let data = payload(20000);
        net.with_socket(Side::A, client, |socket, cx| socket.send(cx, &data))
            .unwrap();

        let mut received = vec![];
        for _ in 0..100 {
            net.run_until(net.now() + Duration::from_millis(100));
            drain(&mut net, Side::B, server, &mut received);
            if received.len() == data.len() {
                break;
            }
        }
        assert_eq!(received, data);
        net.run_until(net.now() + Duration::from_secs(1));
        assert_eq!(net.socket(Side::A, client).bytes_in_flight(), 0);
        assert!(net.socket(Side::A, client).cwnd() > 536);
        assert!(net.socket(Side::A, client).last_rtt().is_some());
    }

    #[test]
    fn test_loss_recovered() {
        let mut net = network();
        let mut client = Socket::new();
        client.set_initial_window(10, 65535);
        let (client, server) = connected(&mut net, client);

        // Drop the second data segment from A, only once.
        let mut seen = 0;
        net.link_mut()
            .fault_injector_mut()
            .drop_if(move |side, frame| {
                if side != Side::A || tcp_payload_len(frame) == 0 {
                    return false;
                }
                seen += 1;
                seen == 2
            });

        let data = payload(536 * 10);
        net.with_socket(Side::A, client, |socket, cx| socket.send(cx, &data))
            .unwrap();
        let mut received = vec![];
        for _ in 0..100 {
            net.run_until(net.now() + Duration::from_millis(100));
            drain(&mut net, Side::B, server, &mut received);
            if received.len() == data.len() {
                break;
            }
        }
        assert_eq!(net.link().fault_injector().dropped(), 1);
        assert_eq!(received, data);
        assert!(net.socket(Side::A, client).ssthresh() < 65535);
    }

    /// The accepted side sends 30000 bytes while two of its data frames are lost.
    fn server_transfer_with_loss(congestion: tcp::CongestionControl) {
        let mut net = network();
        let (client, server) = connected(&mut net, Socket::new());
        net.with_socket(Side::B, server, |socket, _| {
            socket.set_congestion_control(congestion);
        });

        let sent_octets = Rc::new(Cell::new(0));
        let counter = sent_octets.clone();
        let mut data_frames = 0;
        net.link_mut()
            .fault_injector_mut()
            .drop_if(move |side, frame| {
                let len = tcp_payload_len(frame);
                if side != Side::B || len == 0 {
                    return false;
                }
                counter.set(counter.get() + len);
                data_frames += 1;
                data_frames == 3 || data_frames == 10
            });

        let data = payload(30000);
        net.with_socket(Side::B, server, |socket, cx| socket.send(cx, &data))
            .unwrap();
        let mut received = vec![];
        for _ in 0..200 {
            net.run_until(net.now() + Duration::from_millis(100));
            drain(&mut net, Side::A, client, &mut received);
            if received.len() == data.len() {
                break;
            }
        }

        assert_eq!(net.link().fault_injector().dropped(), 2);
        assert_eq!(received, data);
        // Lost bytes went out a second time.
        assert!(sent_octets.get() > data.len());
        net.run_until(net.now() + Duration::from_secs(1));
        assert_eq!(net.socket(Side::B, server).bytes_in_flight(), 0);
        assert_eq!(net.socket(Side::B, server).congestion_control(), congestion);
    }

    #[test]
    fn test_server_send_with_loss_tahoe() {
        server_transfer_with_loss(tcp::CongestionControl::Tahoe);
    }

    #[test]
    fn test_server_send_with_loss_westwood() {
        server_transfer_with_loss(tcp::CongestionControl::Westwood);
    }

    #[test]
    fn test_orderly_close() {
        let mut net = network();
        let (client, server) = connected(&mut net, Socket::new());
        while net.poll_notification(Side::A).is_some() {}
        while net.poll_notification(Side::B).is_some() {}

        net.with_socket(Side::A, client, |socket, cx| {
            socket.send(cx, b"goodbye").unwrap();
            socket.close(cx);
        });
        net.run_until(net.now() + Duration::from_secs(1));
        assert_eq!(net.socket(Side::A, client).state(), State::FinWait2);
        assert_eq!(net.socket(Side::B, server).state(), State::CloseWait);

        let mut received = vec![];
        drain(&mut net, Side::B, server, &mut received);
        assert_eq!(received, b"goodbye");
        let mut close_requested = false;
        while let Some((handle, notification)) = net.poll_notification(Side::B) {
            if notification == tcp::Notification::CloseRequested {
                assert_eq!(handle, server);
                close_requested = true;
            }
        }
        assert!(close_requested);
        assert_eq!(
            net.with_socket(Side::B, server, |socket, _| socket.recv()),
            Err(tcp::RecvError::Finished)
        );

        net.with_socket(Side::B, server, |socket, cx| socket.close(cx));
        net.run_until(net.now() + Duration::from_secs(1));
        assert_eq!(net.socket(Side::A, client).state(), State::TimeWait);
        assert_eq!(net.socket(Side::B, server).state(), State::Closed);

        let mut completed = 0;
        while let Some((_, notification)) = net.poll_notification(Side::A) {
            if notification == tcp::Notification::CloseCompleted {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);
        assert_eq!(
            net.poll_notification(Side::B),
            Some((server, tcp::Notification::CloseCompleted))
        );
        assert_eq!(net.poll_at(), None);
    }
}
