/*! Segment and address representation.

The `wire` module deals with the packet *representation*. It provides two levels
of functionality.

 * First, it provides functions to extract fields from sequences of octets,
   and to insert fields into sequences of octets. This happens in the `Packet` family of
   structures, e.g. [Ipv4Packet] or [TcpPacket].
 * Second, it provides a compact, high-level representation of the header fields the
   transport engine reads and writes, e.g. [Ipv4Repr] or [TcpRepr]. The engine only ever
   sees `Repr` values; octets exist only between an interface and a link.

[Ipv4Packet]: struct.Ipv4Packet.html
[TcpPacket]: struct.TcpPacket.html
[Ipv4Repr]: struct.Ipv4Repr.html
[TcpRepr]: struct.TcpRepr.html

The `Packet` family of data structures guarantees that, if the `Packet::check_len()` method
returned `Ok(())`, then no accessor or setter method will panic.
When parsing untrusted input, it is *necessary* to use `Packet::new_checked()`.

In the `Repr` family of data structures, the `Repr::parse()` method never panics
as long as `Packet::new_checked()` (or `Packet::check_len()`) has succeeded, and
the `Repr::emit()` method never panics as long as the underlying buffer is exactly
`Repr::buffer_len()` octets long.

# Examples

To emit a TCP header into an octet buffer, and then parse it back:

```rust
use simtcp::wire::*;
let repr = TcpRepr {
    src_port:   49152,
    dst_port:   80,
    seq_number: TcpSeqNumber(1),
    ack_number: TcpSeqNumber(1),
    flags:      TcpFlags::ACK,
    window_len: 65535,
};
let src = Ipv4Address::new(10, 0, 0, 1);
let dst = Ipv4Address::new(10, 0, 0, 2);
let mut buffer = vec![0; repr.buffer_len() + 3];
{ // emission
    let mut packet = TcpPacket::new_unchecked(&mut buffer);
    repr.emit(&mut packet, &src, &dst, b"abc");
}
{ // parsing
    let packet = TcpPacket::new_checked(&buffer)
                           .expect("truncated packet");
    let parsed = TcpRepr::parse(&packet, &src, &dst)
                         .expect("malformed packet");
    assert_eq!(repr, parsed);
    assert_eq!(packet.payload(), b"abc");
}
```
*/

mod field {
    pub type Field = ::core::ops::Range<usize>;
    pub type Rest = ::core::ops::RangeFrom<usize>;
}

pub(crate) mod ip;
pub(crate) mod ipv4;
pub(crate) mod tcp;

use core::fmt;

pub use self::ip::{
    Endpoint as IpEndpoint, ListenEndpoint as IpListenEndpoint, Protocol as IpProtocol,
};

pub use self::ipv4::{
    Address as Ipv4Address, Cidr as Ipv4Cidr, Packet as Ipv4Packet, Repr as Ipv4Repr,
    HEADER_LEN as IPV4_HEADER_LEN,
};

/// The only network layer the engine runs over.
pub use self::ipv4::Address as IpAddress;
pub use self::ipv4::Repr as IpRepr;

pub use self::tcp::{
    Flags as TcpFlags, Packet as TcpPacket, Repr as TcpRepr, SeqNumber as TcpSeqNumber,
    HEADER_LEN as TCP_HEADER_LEN,
};

/// Parsing a packet failed.
///
/// Either it is malformed, or it is not supported by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error;

impl core::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;

pub(crate) mod checksum {
    use byteorder::{ByteOrder, NetworkEndian};

    use super::{IpAddress, IpProtocol};

    const fn propagate_carries(word: u32) -> u16 {
        let sum = (word >> 16) + (word & 0xffff);
        ((sum >> 16) as u16) + (sum as u16)
    }

    /// Compute an RFC 1071 compliant checksum (without the final complement).
    pub fn data(mut data: &[u8]) -> u16 {
        let mut accum = 0;

        while data.len() >= 2 {
            accum += NetworkEndian::read_u16(data) as u32;
            data = &data[2..];
        }

        if let Some(&value) = data.first() {
            accum += (value as u32) << 8;
        }

        propagate_carries(accum)
    }

    /// Combine several RFC 1071 compliant checksums.
    pub fn combine(checksums: &[u16]) -> u16 {
        let mut accum: u32 = 0;
        for &word in checksums {
            accum += word as u32;
        }
        propagate_carries(accum)
    }

    /// Compute an IPv4 pseudo header checksum.
    pub fn pseudo_header(
        src_addr: &IpAddress,
        dst_addr: &IpAddress,
        next_header: IpProtocol,
        length: u32,
    ) -> u16 {
        let mut proto_len = [0u8; 4];
        proto_len[1] = next_header.into();
        NetworkEndian::write_u16(&mut proto_len[2..4], length as u16);

        combine(&[
            data(&src_addr.octets()),
            data(&dst_addr.octets()),
            data(&proto_len[..]),
        ])
    }
}
