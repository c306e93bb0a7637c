/*! A TCP transport engine for discrete-event network simulation.

The crate is organized the same way a small embedded TCP/IP stack is, except that the
"hardware" is a simulated link and the clock is owned by the caller:

 * [wire] describes segments and addresses, and encodes them to and from octets;
 * [storage] holds the send buffer and the out-of-order receive buffer;
 * [socket] contains the TCP engine: state table, RTT estimation, congestion control;
 * [iface] demultiplexes segments to sockets, owns timers and routes;
 * [phy] moves octets between interfaces with delay and loss;
 * [sim] drives two interfaces over a link with a shared clock.

Nothing here blocks or spawns threads. Every piece of work happens inside a call
that delivers one external event: an application request, an inbound segment or
a timer expiry.
*/

#![deny(unsafe_code)]

extern crate alloc;

#[macro_use]
mod macros;

pub mod config;
pub mod iface;
pub mod phy;
pub mod sim;
pub mod socket;
pub mod storage;
pub mod time;
pub mod wire;
