//! Compile-time capacities.

/// Number of routes an interface can hold.
pub const IFACE_MAX_ROUTE_COUNT: usize = 4;

/// Number of addresses an interface can own.
pub const IFACE_MAX_ADDR_COUNT: usize = 2;

/// First port handed out by ephemeral binds.
pub const EPHEMERAL_PORT_FIRST: u16 = 49152;

/// Last port handed out by ephemeral binds.
pub const EPHEMERAL_PORT_LAST: u16 = 65535;
