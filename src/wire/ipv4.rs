use byteorder::{ByteOrder, NetworkEndian};
use core::fmt;

use super::checksum;
use super::{Error, Result};

pub use super::IpProtocol as Protocol;

pub use core::net::Ipv4Addr as Address;

/// Hop limit written into every datagram an interface emits. Nothing on a
/// simulated link decrements it.
pub const DEFAULT_HOP_LIMIT: u8 = 64;

/// An interface address together with the prefix of the subnet it sits on.
///
/// The interface uses it twice: to decide whether a destination is on-link,
/// and to pick the source address of a new connection.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct Cidr {
    address: Address,
    prefix_len: u8,
}

impl Cidr {
    /// # Panics
    /// This function panics if the prefix length is larger than 32.
    pub const fn new(address: Address, prefix_len: u8) -> Cidr {
        assert!(prefix_len <= 32);
        Cidr {
            address,
            prefix_len,
        }
    }

    pub const fn address(&self) -> Address {
        self.address
    }

    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    const fn mask(&self) -> u32 {
        match self.prefix_len {
            0 => 0,
            len => u32::MAX << (32 - len),
        }
    }

    /// Query whether `addr` lies on this subnet.
    pub fn contains_addr(&self, addr: &Address) -> bool {
        (self.address.to_bits() ^ addr.to_bits()) & self.mask() == 0
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

mod field {
    use crate::wire::field::*;

    pub const VER_IHL: usize = 0;
    pub const TOS: usize = 1;
    pub const LENGTH: Field = 2..4;
    pub const IDENT_FRAG: Field = 4..8;
    pub const TTL: usize = 8;
    pub const PROTOCOL: usize = 9;
    pub const CHECKSUM: Field = 10..12;
    pub const SRC_ADDR: Field = 12..16;
    pub const DST_ADDR: Field = 16..20;
}

pub const HEADER_LEN: usize = field::DST_ADDR.end;

/// A frame on a simulated link: one IPv4 datagram carrying one TCP segment.
///
/// Only the option-less 20-octet header is understood, and fragments never
/// occur, so the identification and fragment fields are written as zero and
/// ignored on receipt.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Wrap `buffer` after making sure the header and the payload it announces fit.
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    pub fn check_len(&self) -> Result<()> {
        let data = self.buffer.as_ref();
        if data.len() < HEADER_LEN || self.header_len() != HEADER_LEN {
            return Err(Error);
        }
        let total_len = self.total_len();
        if total_len < HEADER_LEN || total_len > data.len() {
            return Err(Error);
        }
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    fn header_len(&self) -> usize {
        (self.buffer.as_ref()[field::VER_IHL] & 0x0f) as usize * 4
    }

    fn total_len(&self) -> usize {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::LENGTH]) as usize
    }

    fn addr(&self, range: super::field::Field) -> Address {
        Address::from_bits(NetworkEndian::read_u32(&self.buffer.as_ref()[range]))
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// The segment carried by the datagram, without link padding.
    pub fn payload(&self) -> &'a [u8] {
        let data = self.buffer.as_ref();
        &data[HEADER_LEN..self.total_len()]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let end = self.total_len();
        &mut self.buffer.as_mut()[HEADER_LEN..end]
    }
}

/// The header fields an interface reads from and writes to a datagram.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    pub src_addr: Address,
    pub dst_addr: Address,
    pub next_header: Protocol,
    pub payload_len: usize,
    pub hop_limit: u8,
}

impl Repr {
    /// Read the header of a length-checked datagram.
    ///
    /// Datagrams of another IP version or with a corrupt header checksum are rejected.
    pub fn parse<T: AsRef<[u8]> + ?Sized>(packet: &Packet<&T>) -> Result<Repr> {
        packet.check_len()?;
        let data = packet.buffer.as_ref();
        if data[field::VER_IHL] >> 4 != 4 {
            return Err(Error);
        }
        if checksum::data(&data[..HEADER_LEN]) != !0 {
            return Err(Error);
        }

        Ok(Repr {
            src_addr: packet.addr(field::SRC_ADDR),
            dst_addr: packet.addr(field::DST_ADDR),
            next_header: Protocol::from(data[field::PROTOCOL]),
            payload_len: packet.total_len() - HEADER_LEN,
            hop_limit: data[field::TTL],
        })
    }

    pub const fn buffer_len(&self) -> usize {
        HEADER_LEN
    }

    /// Write the header, checksum included, into the front of `packet`.
    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut Packet<T>) {
        let data = packet.buffer.as_mut();
        data[field::VER_IHL] = 0x40 | (HEADER_LEN / 4) as u8;
        data[field::TOS] = 0;
        NetworkEndian::write_u16(&mut data[field::LENGTH], (HEADER_LEN + self.payload_len) as u16);
        data[field::IDENT_FRAG].fill(0);
        data[field::TTL] = self.hop_limit;
        data[field::PROTOCOL] = self.next_header.into();
        data[field::CHECKSUM].fill(0);
        data[field::SRC_ADDR].copy_from_slice(&self.src_addr.octets());
        data[field::DST_ADDR].copy_from_slice(&self.dst_addr.octets());
        let sum = !checksum::data(&data[..HEADER_LEN]);
        NetworkEndian::write_u16(&mut data[field::CHECKSUM], sum);
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "IPv4 src={} dst={} proto={}",
            self.src_addr, self.dst_addr, self.next_header
        )
    }
}
