use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use super::{Device, DeviceCapabilities, FaultInjector, RxToken, TxToken};
use crate::time::{Duration, Instant};

/// One end of a [Link].
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub enum Side {
    A,
    B,
}

impl Side {
    /// The other end.
    pub const fn peer(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Side::A => 0,
            Side::B => 1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Side::A => write!(f, "A"),
            Side::B => write!(f, "B"),
        }
    }
}

/// Link parameters.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// One-way propagation delay.
    pub delay: Duration,
    /// Largest datagram the link carries; larger ones are dropped.
    pub mtu: usize,
}

impl Default for LinkConfig {
    fn default() -> LinkConfig {
        LinkConfig {
            delay: Duration::from_millis(10),
            mtu: 1500,
        }
    }
}

impl LinkConfig {
    pub fn new(delay: Duration) -> LinkConfig {
        LinkConfig {
            delay,
            ..LinkConfig::default()
        }
    }
}

#[derive(Debug)]
struct InFlight {
    deliver_at: Instant,
    frame: Vec<u8>,
}

/// A bidirectional point-to-point link.
///
/// Every frame arrives exactly `delay` after it was sent, unless the fault injector
/// drops it. Frames in one direction never overtake each other.
#[derive(Debug)]
pub struct Link {
    config: LinkConfig,
    /// Frames in flight, indexed by the side they travel to.
    queues: [VecDeque<InFlight>; 2],
    faults: FaultInjector,
}

impl Link {
    pub fn new(config: LinkConfig) -> Link {
        Link {
            config,
            queues: [VecDeque::new(), VecDeque::new()],
            faults: FaultInjector::new(),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn fault_injector(&self) -> &FaultInjector {
        &self.faults
    }

    pub fn fault_injector_mut(&mut self) -> &mut FaultInjector {
        &mut self.faults
    }

    /// Put a frame on the wire at `now`, travelling away from `from`.
    ///
    /// Returns `false` if the frame was lost.
    pub fn send(&mut self, now: Instant, from: Side, frame: Vec<u8>) -> bool {
        if frame.len() > self.config.mtu {
            net_debug!("phy: {} octets from {} exceed the MTU", frame.len(), from);
            return false;
        }
        if self.faults.should_drop(from, &frame) {
            return false;
        }
        let deliver_at = now + self.config.delay;
        net_trace!("phy: {} -> {} {} octets, arriving at {}", from, from.peer(), frame.len(), deliver_at);
        self.queues[from.peer().index()].push_back(InFlight { deliver_at, frame });
        true
    }

    /// Take the next frame that reached `at` by `now`.
    pub fn recv(&mut self, now: Instant, at: Side) -> Option<Vec<u8>> {
        let queue = &mut self.queues[at.index()];
        match queue.front() {
            Some(head) if head.deliver_at <= now => queue.pop_front().map(|f| f.frame),
            _ => None,
        }
    }

    /// The instant the earliest frame in flight arrives, in either direction.
    pub fn next_delivery(&self) -> Option<Instant> {
        self.queues
            .iter()
            .filter_map(|queue| queue.front().map(|f| f.deliver_at))
            .min()
    }

    /// Number of frames in flight, in both directions.
    pub fn in_flight(&self) -> usize {
        self.queues.iter().map(|queue| queue.len()).sum()
    }

    /// Borrow the port at one end, for an interface to poll.
    pub fn port(&mut self, side: Side) -> Port<'_> {
        Port { link: self, side }
    }
}

/// One end of a link, seen as a network device.
#[derive(Debug)]
pub struct Port<'a> {
    link: &'a mut Link,
    side: Side,
}

impl Device for Port<'_> {
    type RxToken<'a>
        = PortRxToken
    where
        Self: 'a;
    type TxToken<'a>
        = PortTxToken<'a>
    where
        Self: 'a;

    fn receive(&mut self, timestamp: Instant) -> Option<Self::RxToken<'_>> {
        let frame = self.link.recv(timestamp, self.side)?;
        Some(PortRxToken { frame })
    }

    fn transmit(&mut self, timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(PortTxToken {
            link: &mut *self.link,
            side: self.side,
            timestamp,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            max_transmission_unit: self.link.config.mtu,
        }
    }
}

#[doc(hidden)]
pub struct PortRxToken {
    frame: Vec<u8>,
}

impl RxToken for PortRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.frame)
    }
}

#[doc(hidden)]
pub struct PortTxToken<'a> {
    link: &'a mut Link,
    side: Side,
    timestamp: Instant,
}

impl TxToken for PortTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0; len];
        let result = f(&mut buffer);
        self.link.send(self.timestamp, self.side, buffer);
        result
    }
}
