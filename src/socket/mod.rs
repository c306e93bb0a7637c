/*! Communication between endpoints.

The `socket` module holds the protocol state machines. There is one kind of socket,
[tcp::Socket], and it never touches the network directly: every operation gets the
[Context](crate::iface::Context) of the interface that owns the socket and leaves
outbound segments and timers there.
*/

pub mod tcp;
