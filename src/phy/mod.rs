/*! Access to the simulated medium.

The `phy` module deals with the *network devices*. It provides a trait
for transmitting and receiving frames, [Device](trait.Device.html),
and the one medium the simulator has:

  * the point-to-point [Link](struct.Link.html), which delays frames by a fixed
    amount and delivers them in order;
  * the [FaultInjector](struct.FaultInjector.html) sitting inside every link, which
    drops frames chosen by index or by predicate.

A link has two [ports](struct.Port.html), one for each attached interface. Ports
implement `Device`, so an interface polls its port the same way it would poll a
network card.
*/

use crate::time::Instant;

mod fault_injector;
mod link;

pub use self::fault_injector::FaultInjector;
pub use self::link::{Link, LinkConfig, Port, Side};

/// A description of device capabilities.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct DeviceCapabilities {
    /// Maximum transmission unit.
    ///
    /// The network device is unable to send or receive datagrams larger than this.
    /// The value is an IP MTU: there is no link layer header to account for.
    pub max_transmission_unit: usize,
}

/// An interface for sending and receiving raw network frames.
///
/// The interface is based on _tokens_, which are types that allow to receive/transmit a
/// single packet. The `receive` and `transmit` functions only construct such tokens, the
/// real sending/receiving operation are performed when the tokens are consumed.
pub trait Device {
    type RxToken<'a>: RxToken
    where
        Self: 'a;
    type TxToken<'a>: TxToken
    where
        Self: 'a;

    /// Construct a receive token for the next frame due at or before `timestamp`.
    fn receive(&mut self, timestamp: Instant) -> Option<Self::RxToken<'_>>;

    /// Construct a transmit token. The frame leaves the device at `timestamp`.
    fn transmit(&mut self, timestamp: Instant) -> Option<Self::TxToken<'_>>;

    /// Get a description of device capabilities.
    fn capabilities(&self) -> DeviceCapabilities;
}

/// A token to receive a single network packet.
pub trait RxToken {
    /// Consumes the token to receive a single network packet.
    ///
    /// This method receives a packet and then calls the given closure `f` with the raw
    /// packet bytes as argument.
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R;
}

/// A token to transmit a single network packet.
pub trait TxToken {
    /// Consumes the token to send a single network packet.
    ///
    /// This method constructs a transmit buffer of size `len` and calls the passed
    /// closure `f` with a mutable reference to that buffer. The closure should construct
    /// a valid IPv4 datagram in the buffer. When the closure returns, the transmit
    /// buffer is sent out.
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R;
}
