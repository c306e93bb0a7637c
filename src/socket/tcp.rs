// Heads up! Before working on this file you should read, at least, RFC 793 and
// RFC 2581. The engine is table driven: `state::transition` decides where a
// connection goes, and the `Action` it returns decides what the socket does.

use alloc::collections::VecDeque;
use core::fmt::Display;
use core::fmt;

use bytes::Bytes;

use crate::iface::{AllocateError, Context, EndpointId, SocketHandle, TimerHandle, TimerKind};
use crate::storage::{ReorderBuffer, SendBuffer};
use crate::time::Duration;
use crate::wire::{IpEndpoint, IpListenEndpoint, Ipv4Repr, TcpFlags, TcpRepr, TcpSeqNumber};

macro_rules! tcp_trace {
    ($($arg:expr),*) => (net_log!(trace, $($arg),*));
}

mod congestion;
pub mod rtte;
pub mod state;

use self::congestion::{AnyController, DupAckAction};
pub use self::congestion::CongestionControl;
use self::rtte::RttEstimator;
use self::state::{Action, Event};
pub use self::state::State;

/// Error returned by [`Socket::bind`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BindError {
    InvalidState,
    Unaddressable,
    AddrInUse,
}

impl Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            BindError::InvalidState => write!(f, "invalid state"),
            BindError::Unaddressable => write!(f, "unaddressable"),
            BindError::AddrInUse => write!(f, "address in use"),
        }
    }
}

impl core::error::Error for BindError {}

/// Error returned by [`Socket::listen`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ListenError {
    InvalidState,
    Unaddressable,
}

impl Display for ListenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ListenError::InvalidState => write!(f, "invalid state"),
            ListenError::Unaddressable => write!(f, "unaddressable destination"),
        }
    }
}

impl core::error::Error for ListenError {}

/// Error returned by [`Socket::connect`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnectError {
    InvalidState,
    Unaddressable,
    NoRouteToHost,
    AddrInUse,
}

impl Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ConnectError::InvalidState => write!(f, "invalid state"),
            ConnectError::Unaddressable => write!(f, "unaddressable destination"),
            ConnectError::NoRouteToHost => write!(f, "no route to host"),
            ConnectError::AddrInUse => write!(f, "no local port available"),
        }
    }
}

impl core::error::Error for ConnectError {}

/// Error returned by [`Socket::send`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SendError {
    NotConnected,
    Shutdown,
    MessageSize,
}

impl Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SendError::NotConnected => write!(f, "not connected"),
            SendError::Shutdown => write!(f, "shut down for sending"),
            SendError::MessageSize => write!(f, "not enough send buffer space"),
        }
    }
}

impl core::error::Error for SendError {}

/// Error returned by [`Socket::recv`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RecvError {
    InvalidState,
    Finished,
}

impl Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RecvError::InvalidState => write!(f, "invalid state"),
            RecvError::Finished => write!(f, "operation finished"),
        }
    }
}

impl core::error::Error for RecvError {}

/// Something the application should hear about.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Notification {
    /// An active open completed.
    ConnectionSucceeded,
    /// An active open was refused, or ran out of SYN retries.
    ConnectionFailed,
    /// The peer sent its FIN; nothing more will be received.
    CloseRequested,
    /// Both directions are closed.
    CloseCompleted,
    /// A segment carrying this many octets left the socket.
    DataSent(usize),
    /// This many octets were appended to the receive queue.
    DataReceived { len: usize, from: IpEndpoint },
    /// An acknowledgement freed send buffer space; this much is available now.
    SendAvailable(usize),
    /// A connection forked off `listener` finished its handshake.
    NewConnectionCreated {
        listener: SocketHandle,
        remote: IpEndpoint,
    },
}

/// What the interface has to do after handing a segment to a socket.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum RxOutcome {
    Processed,
    /// A listening socket got a SYN. The interface must clone it with
    /// [`Socket::clone_for_accept`] and finish with [`Socket::complete_fork`].
    Fork,
}

/// Per-connection parameters. Forked connections inherit them from their listener.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// Maximum payload of one segment.
    pub segment_size: usize,
    /// Initial congestion window, in segments.
    pub initial_cwnd: usize,
    /// Initial slow start threshold, in octets.
    pub initial_ssthresh: usize,
    pub snd_buf_size: usize,
    pub rcv_buf_size: usize,
    /// Timeout of the first SYN; every retry doubles it.
    pub connect_timeout: Duration,
    /// How many SYNs an active open sends before giving up.
    pub connect_count: u32,
    pub delayed_ack_timeout: Duration,
    /// Received segments after which an acknowledgement is sent right away.
    pub delayed_ack_max_count: u32,
    pub congestion: CongestionControl,
    pub rtt: rtte::Config,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            segment_size: 536,
            initial_cwnd: 1,
            initial_ssthresh: 65535,
            snd_buf_size: 131072,
            rcv_buf_size: 131072,
            connect_timeout: Duration::from_secs(3),
            connect_count: 6,
            delayed_ack_timeout: Duration::from_millis(200),
            delayed_ack_max_count: 2,
            congestion: CongestionControl::Tahoe,
            rtt: rtte::Config::default(),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Tuple {
    local: IpEndpoint,
    remote: IpEndpoint,
}

impl Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

/// A Transmission Control Protocol connection.
///
/// A socket either listens passively, forking a new socket for every SYN it
/// receives, or connects actively to a remote endpoint. It never blocks: every
/// call runs to completion against the [`Context`] of the interface that owns it,
/// queueing segments and arming timers there, and reports what happened through
/// [`poll_notification`](#method.poll_notification).
#[derive(Debug)]
pub struct Socket {
    state: State,
    config: Config,
    rtte: RttEstimator,
    controller: AnyController,
    listen_endpoint: IpListenEndpoint,
    tuple: Option<Tuple>,
    endpoint: Option<EndpointId>,
    /// The listening socket this one was forked from.
    listener: Option<SocketHandle>,

    connected: bool,
    close_on_empty: bool,
    close_notified: bool,
    close_requested: bool,
    fin_received: bool,
    /// Sequence number of a FIN that arrived ahead of missing data.
    pending_fin: Option<TcpSeqNumber>,
    /// Sequence number our FIN occupies, once one was sent.
    tx_fin: Option<TcpSeqNumber>,
    shutdown_send: bool,
    shutdown_recv: bool,

    first_pending_seq: TcpSeqNumber,
    next_tx_seq: TcpSeqNumber,
    high_tx_mark: TcpSeqNumber,
    highest_rx_ack: TcpSeqNumber,
    next_rx_seq: TcpSeqNumber,
    /// Window the peer advertised last.
    rx_window: usize,

    tx_buffer: Option<SendBuffer>,
    rx_queue: VecDeque<Bytes>,
    rx_queued: usize,
    reorder: ReorderBuffer,

    dup_ack_count: u32,
    del_ack_count: u32,
    cn_count: u32,
    cn_timeout: Duration,
    last_rtt: Option<Duration>,
    /// Sample taken from the segment being processed, if any.
    ack_sample: Option<Duration>,

    retx_timer: Option<TimerHandle>,
    del_ack_timer: Option<TimerHandle>,
    last_ack_timer: Option<TimerHandle>,

    notifications: VecDeque<Notification>,
}

impl Default for Socket {
    fn default() -> Socket {
        Socket::new()
    }
}

impl Socket {
    /// Create a socket with the default configuration.
    pub fn new() -> Socket {
        Socket::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Socket {
        Socket {
            state: State::Closed,
            config,
            rtte: RttEstimator::new(config.rtt),
            controller: Self::controller_for(&config),
            listen_endpoint: IpListenEndpoint::default(),
            tuple: None,
            endpoint: None,
            listener: None,
            connected: false,
            close_on_empty: false,
            close_notified: false,
            close_requested: false,
            fin_received: false,
            pending_fin: None,
            tx_fin: None,
            shutdown_send: false,
            shutdown_recv: false,
            first_pending_seq: TcpSeqNumber::default(),
            next_tx_seq: TcpSeqNumber::default(),
            high_tx_mark: TcpSeqNumber::default(),
            highest_rx_ack: TcpSeqNumber::default(),
            next_rx_seq: TcpSeqNumber::default(),
            rx_window: 0,
            tx_buffer: None,
            rx_queue: VecDeque::new(),
            rx_queued: 0,
            reorder: ReorderBuffer::new(),
            dup_ack_count: 0,
            del_ack_count: 0,
            cn_count: config.connect_count,
            cn_timeout: config.connect_timeout,
            last_rtt: None,
            ack_sample: None,
            retx_timer: None,
            del_ack_timer: None,
            last_ack_timer: None,
            notifications: VecDeque::new(),
        }
    }

    fn controller_for(config: &Config) -> AnyController {
        // A zero-sized segment never advances the send sequence.
        if config.segment_size == 0 {
            panic!("the segment size must not be zero")
        }
        AnyController::new(
            config.congestion,
            config.segment_size,
            config.initial_cwnd,
            config.initial_ssthresh,
        )
    }

    /// Return the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Set an algorithm for congestion control.
    ///
    /// The congestion window and threshold start over from the configured values.
    pub fn set_congestion_control(&mut self, congestion_control: CongestionControl) {
        self.config.congestion = congestion_control;
        self.controller = Self::controller_for(&self.config);
    }

    /// Return the current congestion control algorithm.
    pub fn congestion_control(&self) -> CongestionControl {
        self.controller.kind()
    }

    /// Set the maximum segment size. The congestion window starts over.
    ///
    /// # Panics
    /// This function panics if `segment_size` is zero.
    pub fn set_segment_size(&mut self, segment_size: usize) {
        self.config.segment_size = segment_size;
        self.controller = Self::controller_for(&self.config);
    }

    /// Set the initial congestion window (in segments) and slow start threshold.
    pub fn set_initial_window(&mut self, initial_cwnd: usize, initial_ssthresh: usize) {
        self.config.initial_cwnd = initial_cwnd;
        self.config.initial_ssthresh = initial_ssthresh;
        self.controller = Self::controller_for(&self.config);
    }

    /// Set the delayed acknowledgement timeout and the number of segments that
    /// force an immediate acknowledgement.
    pub fn set_delayed_ack(&mut self, timeout: Duration, max_count: u32) {
        self.config.delayed_ack_timeout = timeout;
        self.config.delayed_ack_max_count = max_count;
    }

    /// Set the timeout of the first SYN and the number of SYNs sent in total.
    pub fn set_connect_timeout(&mut self, timeout: Duration, count: u32) {
        self.config.connect_timeout = timeout;
        self.config.connect_count = count;
        self.cn_timeout = timeout;
        self.cn_count = count;
    }

    pub fn set_snd_buf_size(&mut self, size: usize) {
        self.config.snd_buf_size = size;
    }

    pub fn set_rcv_buf_size(&mut self, size: usize) {
        self.config.rcv_buf_size = size;
    }

    /// Replace the RTT estimator parameters, forgetting every sample taken so far.
    pub fn set_rtt_config(&mut self, config: rtte::Config) {
        self.config.rtt = config;
        self.rtte = RttEstimator::new(config);
    }

    /// Return the listen endpoint
    #[inline]
    pub fn listen_endpoint(&self) -> IpListenEndpoint {
        self.listen_endpoint
    }

    /// Return the local endpoint, or None if not connected.
    #[inline]
    pub fn local_endpoint(&self) -> Option<IpEndpoint> {
        Some(self.tuple?.local)
    }

    /// Return the remote endpoint, or None if not connected.
    #[inline]
    pub fn remote_endpoint(&self) -> Option<IpEndpoint> {
        Some(self.tuple?.remote)
    }

    /// Return the connection state, in terms of the TCP state machine.
    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    /// Return whether the handshake completed at some point.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Return the congestion window, in octets.
    pub fn cwnd(&self) -> usize {
        self.controller.inner().window()
    }

    pub fn ssthresh(&self) -> usize {
        self.controller.inner().ssthresh()
    }

    /// Return the number of octets sent but not yet acknowledged.
    pub fn bytes_in_flight(&self) -> usize {
        (self.high_tx_mark - self.highest_rx_ack).max(0) as usize
    }

    /// Return how many more octets [`send`](#method.send) would accept.
    pub fn tx_available(&self) -> usize {
        match &self.tx_buffer {
            Some(buffer) => self.config.snd_buf_size.saturating_sub(
                buffer.bytes_available_from(self.first_pending_seq, self.highest_rx_ack),
            ),
            None => self.config.snd_buf_size,
        }
    }

    /// Return the amount of octets queued for the application.
    pub fn rx_available(&self) -> usize {
        self.rx_queued
    }

    /// Return the last round-trip time sample.
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    pub fn rtt_estimator(&self) -> &RttEstimator {
        &self.rtte
    }

    /// Pop the next notification, oldest first.
    pub fn poll_notification(&mut self) -> Option<Notification> {
        self.notifications.pop_front()
    }

    fn notify(&mut self, notification: Notification) {
        // Only the latest amount of free space is interesting.
        if matches!(notification, Notification::SendAvailable(_))
            && matches!(self.notifications.back(), Some(Notification::SendAvailable(_)))
        {
            self.notifications.pop_back();
        }
        tcp_trace!("notify {:?}", notification);
        self.notifications.push_back(notification);
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            tcp_trace!("state={}=>{}", self.state, state);
        }

        self.state = state;
    }

    /// Forget everything about a previous connection, keeping the binding.
    fn reset(&mut self) {
        self.state = State::Closed;
        self.rtte.clear_sent();
        self.rtte.reset_multiplier();
        self.controller = Self::controller_for(&self.config);
        self.tuple = None;
        self.listener = None;
        self.connected = false;
        self.close_on_empty = false;
        self.close_notified = false;
        self.close_requested = false;
        self.fin_received = false;
        self.pending_fin = None;
        self.tx_fin = None;
        self.shutdown_send = false;
        self.shutdown_recv = false;
        self.first_pending_seq = TcpSeqNumber::default();
        self.next_tx_seq = TcpSeqNumber::default();
        self.high_tx_mark = TcpSeqNumber::default();
        self.highest_rx_ack = TcpSeqNumber::default();
        self.next_rx_seq = TcpSeqNumber::default();
        self.rx_window = 0;
        self.tx_buffer = None;
        self.rx_queue.clear();
        self.rx_queued = 0;
        self.reorder.clear();
        self.dup_ack_count = 0;
        self.del_ack_count = 0;
        self.cn_count = self.config.connect_count;
        self.cn_timeout = self.config.connect_timeout;
        self.last_rtt = None;
        self.ack_sample = None;
    }

    /// Bind the socket to a local endpoint.
    ///
    /// An unspecified address accepts segments for any address of the interface;
    /// port 0 picks an ephemeral port.
    pub fn bind<T>(&mut self, cx: &mut Context, local_endpoint: T) -> Result<(), BindError>
    where
        T: Into<IpListenEndpoint>,
    {
        let local_endpoint = local_endpoint.into();
        if self.endpoint.is_some() || self.state != State::Closed {
            return Err(BindError::InvalidState);
        }
        if let Some(addr) = local_endpoint.addr {
            if !cx.has_ip_addr(addr) {
                return Err(BindError::Unaddressable);
            }
        }

        let (id, local_endpoint) = cx
            .allocate_endpoint(local_endpoint)
            .map_err(|_| BindError::AddrInUse)?;
        self.endpoint = Some(id);
        self.listen_endpoint = local_endpoint;
        Ok(())
    }

    /// Start listening on the bound endpoint.
    ///
    /// This function returns `Err(Error::Unaddressable)` if the socket is not bound,
    /// and `Err(Error::InvalidState)` if it is neither closed nor listening already.
    pub fn listen(&mut self, cx: &mut Context) -> Result<(), ListenError> {
        if self.endpoint.is_none() {
            return Err(ListenError::Unaddressable);
        }
        if !matches!(self.state, State::Closed | State::Listen) {
            return Err(ListenError::InvalidState);
        }

        let action = self.process_event(cx, Event::AppListen);
        self.process_action(cx, action);
        Ok(())
    }

    /// Connect to a given endpoint.
    ///
    /// An unbound socket is bound to an ephemeral port first. The local address is
    /// the bound one, or else the address the route to `remote_endpoint` leaves from.
    ///
    /// This function returns an error if the socket is neither closed nor listening,
    /// if the remote port is zero or the remote address unspecified, or if there is
    /// no route to the remote address. Retries of the SYN are automatic; running out
    /// of them is reported as [`Notification::ConnectionFailed`].
    pub fn connect<T>(&mut self, cx: &mut Context, remote_endpoint: T) -> Result<(), ConnectError>
    where
        T: Into<IpEndpoint>,
    {
        let remote_endpoint: IpEndpoint = remote_endpoint.into();

        if remote_endpoint.port == 0 || remote_endpoint.addr.is_unspecified() {
            return Err(ConnectError::Unaddressable);
        }
        if !matches!(self.state, State::Closed | State::Listen) {
            return Err(ConnectError::InvalidState);
        }

        // If local address is not provided, choose it automatically.
        let local_addr = match self.listen_endpoint.addr {
            Some(addr) => addr,
            None => cx
                .route_source(&remote_endpoint.addr)
                .ok_or(ConnectError::NoRouteToHost)?,
        };

        let id = match self.endpoint {
            Some(id) => id,
            None => {
                let (id, local_endpoint) = cx
                    .allocate_endpoint(self.listen_endpoint)
                    .map_err(|_| ConnectError::AddrInUse)?;
                self.endpoint = Some(id);
                self.listen_endpoint = local_endpoint;
                id
            }
        };

        if self.state == State::Closed {
            self.reset();
        }
        let local_endpoint = IpEndpoint::new(local_addr, self.listen_endpoint.port);
        self.tuple = Some(Tuple {
            local: local_endpoint,
            remote: remote_endpoint,
        });
        cx.set_peer(id, local_endpoint, remote_endpoint);
        self.cn_count = self.config.connect_count;
        self.cn_timeout = self.config.connect_timeout;
        net_trace!("{}: connecting {}", cx.current_socket(), Tuple {
            local: local_endpoint,
            remote: remote_endpoint,
        });

        let action = self.process_event(cx, Event::AppConnect);
        self.process_action(cx, action);
        Ok(())
    }

    /// Close the transmit half of the full-duplex connection.
    ///
    /// Data still in the send buffer is transmitted first; the FIN goes out with,
    /// or right after, its last octet.
    pub fn close(&mut self, cx: &mut Context) {
        if self.tx_buffer.as_ref().is_some_and(|buffer| !buffer.is_empty()) {
            tcp_trace!("close deferred until the send buffer drains");
            self.close_on_empty = true;
            return;
        }

        let action = self.process_event(cx, Event::AppClose);
        self.process_action(cx, action);
        self.shutdown_send();
    }

    /// Refuse any further [`send`](#method.send), and stop transmitting queued data.
    pub fn shutdown_send(&mut self) {
        self.shutdown_send = true;
    }

    /// Discard every segment that arrives from now on.
    pub fn shutdown_recv(&mut self) {
        self.shutdown_recv = true;
    }

    /// Queue data for transmission, and send as much of it as the windows allow.
    ///
    /// Returns the number of octets accepted, which is always all of `data`.
    pub fn send(&mut self, cx: &mut Context, data: &[u8]) -> Result<usize, SendError> {
        if self.shutdown_send || self.close_on_empty {
            return Err(SendError::Shutdown);
        }
        if !matches!(
            self.state,
            State::Established | State::SynSent | State::CloseWait
        ) {
            return Err(SendError::NotConnected);
        }
        if data.len() > self.tx_available() {
            return Err(SendError::MessageSize);
        }

        let first_seq = self.next_tx_seq;
        let buffer = self.tx_buffer.get_or_insert_with(SendBuffer::new);
        if buffer.is_empty() {
            self.first_pending_seq = first_seq;
        }
        buffer.add(data);
        tcp_trace!("tx buffer: enqueueing {} octets", data.len());

        let action = self.process_event(cx, Event::AppSend);
        self.process_action(cx, action);
        Ok(data.len())
    }

    /// Dequeue the oldest chunk of received data.
    ///
    /// An empty chunk means nothing is queued at the moment. Once the peer has
    /// closed and everything was read, `Err(RecvError::Finished)` is returned.
    pub fn recv(&mut self) -> Result<Bytes, RecvError> {
        if self.shutdown_recv {
            return Err(RecvError::InvalidState);
        }
        match self.rx_queue.pop_front() {
            Some(data) => {
                self.rx_queued -= data.len();
                tcp_trace!("rx buffer: dequeueing {} octets", data.len());
                Ok(data)
            }
            None if self.fin_received => Err(RecvError::Finished),
            None => Ok(Bytes::new()),
        }
    }

    /// Dequeue received data into a slice, returning the number of octets copied.
    ///
    /// See also [recv](#method.recv).
    pub fn recv_slice(&mut self, data: &mut [u8]) -> Result<usize, RecvError> {
        if self.shutdown_recv {
            return Err(RecvError::InvalidState);
        }
        if self.rx_queue.is_empty() && self.fin_received {
            return Err(RecvError::Finished);
        }

        let mut copied = 0;
        while copied < data.len() {
            let Some(chunk) = self.rx_queue.front_mut() else {
                break;
            };
            let size = chunk.len().min(data.len() - copied);
            data[copied..copied + size].copy_from_slice(&chunk[..size]);
            copied += size;
            if size == chunk.len() {
                self.rx_queue.pop_front();
            } else {
                let _ = chunk.split_to(size);
            }
        }
        self.rx_queued -= copied;
        Ok(copied)
    }

    /// A socket for a connection accepted on this listening socket: same
    /// configuration and round-trip estimate, no buffers, timers or peer.
    pub fn clone_for_accept(&self) -> Socket {
        let mut socket = Socket::with_config(self.config);
        socket.rtte = self.rtte.fork();
        socket.listen_endpoint = self.listen_endpoint;
        socket.state = State::Listen;
        socket
    }

    /// Finish accepting the connection whose SYN made `listener` fork this socket.
    pub(crate) fn complete_fork(
        &mut self,
        cx: &mut Context,
        listener: SocketHandle,
        ip_repr: &Ipv4Repr,
        repr: &TcpRepr,
    ) -> Result<(), AllocateError> {
        let remote = IpEndpoint::new(ip_repr.src_addr, repr.src_port);
        let local_addr = self
            .listen_endpoint
            .addr
            .or_else(|| cx.route_source(&remote.addr))
            .unwrap_or(ip_repr.dst_addr);
        let local = IpEndpoint::new(local_addr, self.listen_endpoint.port);

        self.endpoint = Some(cx.allocate_tuple(local, remote)?);
        self.listener = Some(listener);
        self.tuple = Some(Tuple { local, remote });
        self.rx_window = repr.window_len as usize;
        self.set_state(State::SynReceived);
        self.syn_ack_tx(cx, ip_repr, repr);
        Ok(())
    }

    /// Release the endpoint and cancel every timer. The socket can be dropped after.
    pub(crate) fn detach(&mut self, cx: &mut Context) {
        self.release(cx);
    }

    fn release(&mut self, cx: &mut Context) {
        self.cancel_retx();
        for timer in [self.del_ack_timer.take(), self.last_ack_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.cancel();
        }
        if let Some(id) = self.endpoint.take() {
            cx.deallocate_endpoint(id);
        }
    }

    /// Handle one inbound segment.
    pub(crate) fn process(
        &mut self,
        cx: &mut Context,
        ip_repr: &Ipv4Repr,
        repr: &TcpRepr,
        payload: Bytes,
    ) -> RxOutcome {
        if self.shutdown_recv {
            net_debug!("{}: receive side shut down, dropping {}", cx.current_socket(), repr);
            return RxOutcome::Processed;
        }
        tcp_trace!("{}: received {} len={}", cx.current_socket(), repr, payload.len());

        self.ack_sample = None;
        if repr.flags.contains(TcpFlags::ACK) {
            self.ack_sample = self.rtte.ack_seq(cx.now(), repr.ack_number);
            if self.ack_sample.is_some() {
                self.last_rtt = self.ack_sample;
            }
        }
        self.rx_window = repr.window_len as usize;

        let event = Event::from_flags(repr.flags.bits());
        let action = self.process_event(cx, event);
        self.process_packet_action(cx, action, ip_repr, repr, payload)
    }

    /// Fire an expired timer.
    pub(crate) fn on_timer(&mut self, cx: &mut Context, kind: TimerKind) {
        tcp_trace!("{}: {} timer fired in {}", cx.current_socket(), kind, self.state);
        match kind {
            TimerKind::Retransmit => self.retransmit_timeout(cx),
            TimerKind::DelayedAck => {
                self.del_ack_count = 0;
                self.send_empty(cx, TcpFlags::ACK);
            }
            TimerKind::LastAck => self.last_ack_timeout(cx),
        }
    }

    /// Run the state table, and the bookkeeping that comes with entering a state.
    fn process_event(&mut self, cx: &mut Context, event: Event) -> Action {
        let old = self.state;
        let (new, action) = state::transition(old, event);
        if action == Action::RstTx {
            net_debug!("{}: sending RST from {} on {}", cx.current_socket(), old, event);
        }
        let close_notify = new == State::Closed && old != State::Closed && event != Event::Timeout;
        self.set_state(new);

        if old == State::SynSent && new == State::Established {
            self.connected = true;
            self.notify(Notification::ConnectionSucceeded);
        }
        if close_notify && !self.close_notified {
            self.close_notified = true;
            if self.connected {
                self.notify(Notification::CloseCompleted);
            }
        }
        if new == State::TimeWait && old != State::TimeWait && !self.close_notified {
            self.close_notified = true;
            self.notify(Notification::CloseCompleted);
        }
        if new == State::LastAck && old != State::LastAck {
            self.arm_last_ack(cx);
        }
        if new == State::Closed && old != State::Closed {
            self.release(cx);
        }
        action
    }

    /// Carry out an action that needs no segment.
    fn process_action(&mut self, cx: &mut Context, action: Action) {
        match action {
            Action::AckTx => self.send_empty(cx, TcpFlags::ACK),
            Action::RstTx => self.send_empty(cx, TcpFlags::RST),
            Action::SynTx => self.send_empty(cx, TcpFlags::SYN),
            Action::SynAckTx => {
                self.next_rx_seq += 1;
                self.send_empty(cx, TcpFlags::SYN | TcpFlags::ACK);
            }
            Action::FinTx => self.send_empty(cx, TcpFlags::FIN),
            Action::FinAckTx => self.send_empty(cx, TcpFlags::FIN | TcpFlags::ACK),
            Action::TxData => {
                self.send_pending_data(cx, self.connected);
            }
            Action::AppNotify => self.notify(Notification::ConnectionFailed),
            _ if action.needs_segment() => {
                net_debug!("{}: action {:?} needs a segment", cx.current_socket(), action)
            }
            _ => tcp_trace!("action {:?}", action),
        }
    }

    /// Carry out an action caused by a segment.
    fn process_packet_action(
        &mut self,
        cx: &mut Context,
        action: Action,
        ip_repr: &Ipv4Repr,
        repr: &TcpRepr,
        payload: Bytes,
    ) -> RxOutcome {
        let from = IpEndpoint::new(ip_repr.src_addr, repr.src_port);
        match action {
            Action::AckTx => {
                let end = repr.seq_number + payload.len();
                if !payload.is_empty() {
                    self.new_rx(cx, from, repr.seq_number, payload);
                }
                if repr.flags.contains(TcpFlags::FIN) && end == self.next_rx_seq {
                    self.fin_received = true;
                    self.next_rx_seq += 1;
                }
                self.send_empty(cx, TcpFlags::ACK);
            }
            Action::SynAckTx => {
                if self.state == State::Listen {
                    return RxOutcome::Fork;
                }
                self.syn_ack_tx(cx, ip_repr, repr);
            }
            Action::AckTx1 => {
                self.next_rx_seq = repr.seq_number + 1;
                self.next_tx_seq = repr.ack_number;
                self.first_pending_seq = self.next_tx_seq;
                self.high_tx_mark = self.next_tx_seq;
                // The SYN is acknowledged.
                self.cancel_retx();
                self.send_empty(cx, TcpFlags::ACK);
                if repr.ack_number > self.highest_rx_ack {
                    self.highest_rx_ack = repr.ack_number;
                    let available = self.tx_available();
                    if available > 0 {
                        self.notify(Notification::SendAvailable(available));
                    }
                }
                self.send_pending_data(cx, self.connected);
            }
            Action::NewAck => {
                let ack = repr.ack_number;
                if ack == self.highest_rx_ack {
                    if ack < self.next_tx_seq && payload.is_empty() {
                        self.dup_ack_count += 1;
                        self.dup_ack(cx);
                    }
                } else if ack > self.highest_rx_ack {
                    self.dup_ack_count = 0;
                    self.new_ack(cx, ack);
                }
                if !payload.is_empty() {
                    self.new_rx(cx, from, repr.seq_number, payload);
                }
            }
            Action::NewSeqRx => self.new_rx(cx, from, repr.seq_number, payload),
            Action::PeerClose => self.peer_close(cx, from, repr.seq_number, payload),
            Action::ServNotify => {
                self.connected = true;
                if let (Some(id), Some(tuple)) = (self.endpoint, self.tuple) {
                    cx.set_peer(id, tuple.local, tuple.remote);
                }
                self.common_new_ack(cx, repr.ack_number, true);
                let listener = self.listener.unwrap_or(cx.current_socket());
                self.notify(Notification::NewConnectionCreated {
                    listener,
                    remote: from,
                });
                if !payload.is_empty() {
                    self.new_rx(cx, from, repr.seq_number, payload);
                }
            }
            _ => self.process_action(cx, action),
        }
        RxOutcome::Processed
    }

    /// Answer a SYN on a connection that already has its own endpoint.
    fn syn_ack_tx(&mut self, cx: &mut Context, ip_repr: &Ipv4Repr, repr: &TcpRepr) {
        let remote = IpEndpoint::new(ip_repr.src_addr, repr.src_port);
        let local_addr = self
            .listen_endpoint
            .addr
            .or_else(|| cx.route_source(&remote.addr))
            .unwrap_or(ip_repr.dst_addr);
        let local = IpEndpoint::new(local_addr, self.listen_endpoint.port);
        self.tuple = Some(Tuple { local, remote });
        if let Some(id) = self.endpoint {
            cx.set_peer(id, local, remote);
        }

        // The SYN occupies one sequence number.
        self.next_rx_seq = repr.seq_number + 1;
        self.send_empty(cx, TcpFlags::SYN | TcpFlags::ACK);
    }

    fn peer_close(&mut self, cx: &mut Context, from: IpEndpoint, seq: TcpSeqNumber, payload: Bytes) {
        let end = seq + payload.len();
        if seq != self.next_rx_seq {
            tcp_trace!("FIN at {} ahead of {}, closing later", end, self.next_rx_seq);
            self.pending_fin = Some(end);
            self.new_rx(cx, from, seq, payload);
            return;
        }

        if !payload.is_empty() {
            self.new_rx(cx, from, seq, payload);
            if self.next_rx_seq != end {
                // Only part of the data fit; the FIN waits for the rest.
                if !self.fin_received {
                    self.pending_fin = Some(end);
                }
                return;
            }
        }
        if !self.fin_received {
            self.peer_closed(cx);
        }
    }

    /// The stream from the peer is complete up to and including its FIN.
    fn peer_closed(&mut self, cx: &mut Context) {
        self.pending_fin = None;
        self.fin_received = true;
        // The FIN occupies one sequence number.
        self.next_rx_seq += 1;
        if !self.close_requested {
            self.close_requested = true;
            self.notify(Notification::CloseRequested);
        }
        self.send_empty(cx, TcpFlags::ACK);
        if self.state == State::LastAck && !Self::is_pending(&self.last_ack_timer) {
            self.arm_last_ack(cx);
        }
    }

    /// Accept data from the peer: deliver it if it is next in sequence, hold it
    /// back if it arrived ahead of a gap, drop what was seen before.
    fn new_rx(&mut self, cx: &mut Context, from: IpEndpoint, seq: TcpSeqNumber, mut payload: Bytes) {
        let free = self.rx_free_space();
        if payload.len() > free {
            tcp_trace!("rx buffer: trimming {} octets to {}", payload.len(), free);
            payload.truncate(free);
        }
        if payload.is_empty() {
            self.send_empty(cx, TcpFlags::ACK);
            return;
        }

        let len = payload.len();
        if seq == self.next_rx_seq {
            if let Some(next) = self.reorder.next_after(self.next_rx_seq) {
                if self.next_rx_seq + len > next {
                    payload.truncate((next - self.next_rx_seq) as usize);
                }
            }
            self.deliver(payload, from);
            self.drain_reorder(from);
        } else if seq > self.next_rx_seq {
            let mut start = seq;
            if let Some(end) = self.reorder.end_before(seq) {
                if end > seq {
                    start = end;
                }
            }
            let end = seq + len;
            if start < end {
                let mut data = payload.slice((start - seq) as usize..);
                if let Some(next) = self.reorder.next_after(start) {
                    if start + data.len() > next {
                        data.truncate((next - start) as usize);
                    }
                }
                tcp_trace!("rx: buffering {}+{} ahead of {}", start, data.len(), self.next_rx_seq);
                self.reorder.insert(start, data);
            }
        } else if seq + len > self.next_rx_seq {
            let mut data = payload.slice((self.next_rx_seq - seq) as usize..);
            if let Some(next) = self.reorder.next_after(self.next_rx_seq) {
                if self.next_rx_seq + data.len() > next {
                    data.truncate((next - self.next_rx_seq) as usize);
                }
            }
            self.deliver(data, from);
            self.drain_reorder(from);
        } else {
            tcp_trace!("rx: duplicate {}+{}, expected {}", seq, len, self.next_rx_seq);
        }

        if self.pending_fin == Some(self.next_rx_seq) {
            self.peer_closed(cx);
        }

        self.del_ack_count += 1;
        if self.del_ack_count >= self.config.delayed_ack_max_count {
            if let Some(timer) = self.del_ack_timer.take() {
                timer.cancel();
            }
            self.del_ack_count = 0;
            self.send_empty(cx, TcpFlags::ACK);
        } else if !Self::is_pending(&self.del_ack_timer) {
            self.del_ack_timer =
                Some(cx.schedule(TimerKind::DelayedAck, self.config.delayed_ack_timeout));
        }
    }

    fn deliver(&mut self, data: Bytes, from: IpEndpoint) {
        let len = data.len();
        if len == 0 {
            return;
        }
        self.next_rx_seq += len;
        self.rx_queued += len;
        self.rx_queue.push_back(data);
        tcp_trace!("rx buffer: enqueued {} octets, next {}", len, self.next_rx_seq);
        self.notify(Notification::DataReceived { len, from });
    }

    fn drain_reorder(&mut self, from: IpEndpoint) {
        while let Some(data) = self.reorder.pop_contiguous(self.next_rx_seq) {
            self.deliver(data, from);
        }
    }

    fn rx_free_space(&self) -> usize {
        self.config
            .rcv_buf_size
            .saturating_sub(self.rx_queued + self.reorder.size())
    }

    fn advertised_window(&self) -> u16 {
        self.rx_free_space().min(0xffff) as u16
    }

    fn window(&self) -> usize {
        self.rx_window.min(self.cwnd())
    }

    fn available_window(&self) -> usize {
        let unacked = (self.next_tx_seq - self.highest_rx_ack).max(0) as usize;
        self.window().saturating_sub(unacked)
    }

    fn fin_outstanding(&self) -> bool {
        self.tx_fin.is_some_and(|fin| self.highest_rx_ack <= fin)
    }

    fn is_pending(timer: &Option<TimerHandle>) -> bool {
        timer.as_ref().is_some_and(|timer| timer.is_pending())
    }

    fn arm_retx(&mut self, cx: &mut Context, rto: Duration) {
        self.retx_timer = Some(cx.schedule(TimerKind::Retransmit, rto));
    }

    fn cancel_retx(&mut self) {
        if let Some(timer) = self.retx_timer.take() {
            timer.cancel();
        }
    }

    fn arm_last_ack(&mut self, cx: &mut Context) {
        let rto = self.rtte.retransmit_timeout();
        self.last_ack_timer = Some(cx.schedule(TimerKind::LastAck, rto));
    }

    /// Put a segment on the wire, carrying our current acknowledgement and window.
    fn transmit(&mut self, cx: &mut Context, flags: TcpFlags, seq: TcpSeqNumber, payload: Bytes) -> bool {
        let Some(tuple) = self.tuple else {
            net_debug!("{}: no peer to send {} to", cx.current_socket(), flags);
            return false;
        };
        let repr = TcpRepr {
            src_port: tuple.local.port,
            dst_port: tuple.remote.port,
            seq_number: seq,
            ack_number: self.next_rx_seq,
            flags,
            window_len: self.advertised_window(),
        };
        cx.transmit(tuple.local.addr, tuple.remote.addr, repr, payload);
        true
    }

    /// Send a segment without payload. SYN and FIN segments arm the
    /// retransmission timer; a SYN uses and doubles the connection timeout.
    fn send_empty(&mut self, cx: &mut Context, mut flags: TcpFlags) {
        let seq = self.next_tx_seq;
        if flags.contains(TcpFlags::FIN) {
            flags |= TcpFlags::ACK;
            self.tx_fin = Some(seq);
        }
        if !self.transmit(cx, flags, seq, Bytes::new()) {
            return;
        }

        let mut rto = self.rtte.retransmit_timeout();
        if flags.contains(TcpFlags::SYN) {
            rto = self.cn_timeout;
            self.cn_timeout = self.cn_timeout * 2;
            self.cn_count = self.cn_count.saturating_sub(1);
        }
        if flags.intersects(TcpFlags::SYN | TcpFlags::FIN) && !Self::is_pending(&self.retx_timer) {
            self.arm_retx(cx, rto);
        }
    }

    /// Send as much buffered data as the congestion and receive windows allow.
    ///
    /// Returns whether at least one segment was sent.
    fn send_pending_data(&mut self, cx: &mut Context, with_ack: bool) -> bool {
        let mut sent = 0;
        loop {
            let Some(buffer) = &self.tx_buffer else {
                break;
            };
            let unsent = buffer.bytes_available_from(self.first_pending_seq, self.next_tx_seq);
            if unsent == 0 {
                break;
            }
            let window = self.available_window();
            if window < self.config.segment_size && unsent > window {
                break;
            }

            let size = window.min(self.config.segment_size);
            let data = buffer.extract(size, self.first_pending_seq, self.next_tx_seq);
            let sz = data.len();
            let remaining = buffer.bytes_available_from(self.first_pending_seq, self.next_tx_seq + sz);

            let mut flags = TcpFlags::empty();
            if self.close_on_empty && remaining == 0 {
                flags |= TcpFlags::FIN;
                self.tx_fin = Some(self.next_tx_seq + sz);
                if self.state == State::CloseWait {
                    self.set_state(State::LastAck);
                    self.arm_last_ack(cx);
                } else {
                    self.set_state(State::FinWait1);
                }
            }
            if with_ack {
                flags |= TcpFlags::ACK;
            }
            if self.shutdown_send {
                net_debug!("{}: shut down for sending, {} octets left", cx.current_socket(), unsent);
                break;
            }

            if !Self::is_pending(&self.retx_timer) {
                let rto = self.rtte.retransmit_timeout();
                self.arm_retx(cx, rto);
            }
            let seq = self.next_tx_seq;
            if !self.transmit(cx, flags, seq, data) {
                break;
            }
            self.rtte.sent_seq(cx.now(), seq, sz);
            self.notify(Notification::DataSent(sz));
            self.next_tx_seq += sz;
            self.high_tx_mark = self.high_tx_mark.max(self.next_tx_seq);
            sent += 1;
        }
        if sent > 0 {
            tcp_trace!(
                "sent {} segments, next={} cwnd={} in flight={}",
                sent,
                self.next_tx_seq,
                self.cwnd(),
                self.bytes_in_flight()
            );
        }
        sent > 0
    }

    /// A new acknowledgement: grow the congestion window, then do the common part.
    fn new_ack(&mut self, cx: &mut Context, ack: TcpSeqNumber) {
        let acked = (ack - self.highest_rx_ack) as usize;
        self.controller
            .inner_mut()
            .on_new_ack(cx.now(), acked, self.ack_sample);
        tcp_trace!("new ack {}: cwnd={} ssthresh={}", ack, self.cwnd(), self.ssthresh());
        self.common_new_ack(cx, ack, false);
    }

    fn common_new_ack(&mut self, cx: &mut Context, ack: TcpSeqNumber, skip_timer: bool) {
        if !skip_timer {
            self.cancel_retx();
            let rto = self.rtte.retransmit_timeout();
            self.arm_retx(cx, rto);
        }

        self.highest_rx_ack = ack;
        let available = self.tx_available();
        if available > 0 {
            self.notify(Notification::SendAvailable(available));
        }
        if ack > self.next_tx_seq {
            self.next_tx_seq = ack;
        }

        let (first, highest) = (self.first_pending_seq, self.highest_rx_ack);
        if self
            .tx_buffer
            .as_ref()
            .is_some_and(|buffer| buffer.bytes_available_from(first, highest) == 0)
        {
            tcp_trace!("tx buffer: everything acknowledged");
            self.tx_buffer = None;
        }
        if self.tx_buffer.is_none() && !self.fin_outstanding() {
            self.cancel_retx();
        }

        if self.tx_buffer.is_none()
            && self.close_on_empty
            && matches!(
                self.state,
                State::Established | State::CloseWait | State::SynReceived
            )
        {
            self.close_on_empty = false;
            let action = self.process_event(cx, Event::AppClose);
            self.process_action(cx, action);
            self.shutdown_send();
        }

        self.send_pending_data(cx, self.connected);
    }

    fn dup_ack(&mut self, cx: &mut Context) {
        let window = self.window();
        let count = self.dup_ack_count;
        tcp_trace!("duplicate ack {} #{}", self.highest_rx_ack, count);
        match self
            .controller
            .inner_mut()
            .on_duplicate_ack(cx.now(), count, window)
        {
            DupAckAction::GoBackN => {
                self.next_tx_seq = self.highest_rx_ack;
                self.send_pending_data(cx, self.connected);
            }
            DupAckAction::Transmit => {
                self.send_pending_data(cx, self.connected);
            }
            DupAckAction::None => (),
        }
    }

    fn retransmit_timeout(&mut self, cx: &mut Context) {
        match self.state {
            State::Closed | State::Listen | State::TimeWait => return,
            State::SynSent => {
                self.retransmit(cx);
                return;
            }
            _ => (),
        }
        if self.tx_buffer.is_none() && !self.fin_outstanding() {
            tcp_trace!("retransmit timer fired with nothing outstanding");
            return;
        }

        let window = self.window();
        self.controller
            .inner_mut()
            .on_retransmit_timeout(cx.now(), window);
        self.next_tx_seq = self.highest_rx_ack;
        self.rtte.increase_multiplier();
        self.retransmit(cx);
    }

    /// Resend the oldest unacknowledged segment, or the SYN or FIN if that is
    /// what is outstanding.
    fn retransmit(&mut self, cx: &mut Context) {
        if self.state == State::SynSent {
            if self.cn_count > 0 {
                self.send_empty(cx, TcpFlags::SYN);
            } else {
                net_debug!("{}: no answer to {} SYNs", cx.current_socket(), self.config.connect_count);
                self.notify(Notification::ConnectionFailed);
                let action = self.process_event(cx, Event::Timeout);
                self.process_action(cx, action);
            }
            return;
        }

        if self.tx_buffer.is_none() {
            if self.fin_outstanding() {
                // The FIN was lost.
                self.send_empty(cx, TcpFlags::FIN);
            }
            return;
        }

        let seq = self.next_tx_seq;
        let (data, remaining) = match &self.tx_buffer {
            Some(buffer) => {
                let data = buffer.extract(self.config.segment_size, self.first_pending_seq, seq);
                let remaining =
                    buffer.bytes_available_from(self.first_pending_seq, seq + data.len());
                (data, remaining)
            }
            None => return,
        };
        let mut flags = TcpFlags::empty();
        if self.close_on_empty && remaining == 0 {
            flags |= TcpFlags::FIN;
            self.tx_fin = Some(seq + data.len());
        }

        tcp_trace!("retransmitting {}+{}", seq, data.len());
        if !Self::is_pending(&self.retx_timer) {
            let rto = self.rtte.retransmit_timeout();
            self.arm_retx(cx, rto);
        }
        self.rtte.sent_seq(cx.now(), seq, data.len());
        self.transmit(cx, flags, seq, data);
    }

    fn last_ack_timeout(&mut self, cx: &mut Context) {
        if let Some(timer) = self.last_ack_timer.take() {
            timer.cancel();
        }
        if self.state == State::LastAck {
            let action = self.process_event(cx, Event::Timeout);
            self.process_action(cx, action);
        }
        if !self.close_notified {
            self.close_notified = true;
            self.notify(Notification::CloseCompleted);
        }
    }
}
