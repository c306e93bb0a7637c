/*! Network interface logic.

The `iface` module deals with the *network interfaces*. It filters incoming datagrams,
demultiplexes segments to sockets by their endpoints, owns the timers sockets arm, and
picks the source address for outgoing connections.
*/

mod endpoint;
mod interface;
mod route;
mod socket_set;
mod timer;

pub use self::endpoint::{AllocateError, EndpointId, Endpoints};
pub use self::interface::{Config, Interface, InterfaceInner as Context};
pub use self::route::{Route, RouteTableFull, Routes};
pub use self::socket_set::{SocketHandle, SocketSet, SocketSetFull, SocketStorage};
pub use self::timer::{TimerHandle, TimerKind, TimerQueue};
