/*! Low-level packet access and construction.

The `wire` module deals with the packet *representation*: functions to
extract fields from sequences of octets, and to insert fields into
sequences of octets. This happens through the `Packet` family of
structures, e.g. [EthernetFrame] or [Ipv4Packet].

The `Packet` family of data structures guarantees that, if the
`Packet::check_len()` method returned `Ok(())`, then no accessor or setter
method will panic. `Packet::new_checked` is a shorthand for a combination
of `Packet::new_unchecked` and `Packet::check_len`. When parsing untrusted
input, it is *necessary* to use `Packet::new_checked()`.

Setters are provided alongside the accessors so that tools and tests can
emit frames bit-exactly; the analyzer itself only ever reads.

[EthernetFrame]: struct.EthernetFrame.html
[Ipv4Packet]: struct.Ipv4Packet.html
*/

mod field {
    pub type Field = ::core::ops::Range<usize>;
    pub type Rest = ::core::ops::RangeFrom<usize>;
}

use core::fmt;

mod ethernet;
pub use self::ethernet::{
    Address as EthernetAddress, Frame as EthernetFrame, ETHERTYPE_IPV4, ETHERTYPE_VLAN,
    HEADER_LEN as ETHERNET_HEADER_LEN, VLAN_HEADER_LEN,
};

pub(crate) mod ipv4;
pub use self::ipv4::{
    Address as Ipv4Address, Packet as Ipv4Packet, HEADER_LEN as IPV4_HEADER_LEN, PROTOCOL_TCP,
};

pub mod tcp;
pub use self::tcp::{
    Packet as TcpPacket, SackBlock, SeqNumber, TcpOption, HEADER_LEN as TCP_HEADER_LEN,
    MAX_SACK_BLOCKS,
};

/// Decoding a captured frame failed.
///
/// Every variant is recoverable at the driver level: the offending packet
/// is skipped and the capture loop continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame ended before a header or option that should be there.
    Truncated,
    /// The frame does not carry an IPv4 packet.
    NotIpv4,
    /// The IPv4 packet does not carry a TCP segment.
    NotTcp,
    /// The IPv4 header checksum does not verify.
    BadIpChecksum,
    /// The TCP checksum does not verify.
    BadTcpChecksum,
    /// A TCP option carries an impossible length byte.
    BadOptionLength,
    /// A SACK option carries more than [MAX_SACK_BLOCKS] blocks.
    TooManySackBlocks,
}

impl std::error::Error for DecodeError {}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "truncated packet"),
            DecodeError::NotIpv4 => write!(f, "not an IPv4 packet"),
            DecodeError::NotTcp => write!(f, "not a TCP segment"),
            DecodeError::BadIpChecksum => write!(f, "bad IPv4 header checksum"),
            DecodeError::BadTcpChecksum => write!(f, "bad TCP checksum"),
            DecodeError::BadOptionLength => write!(f, "bad TCP option length"),
            DecodeError::TooManySackBlocks => write!(f, "too many SACK blocks"),
        }
    }
}

pub type Result<T> = core::result::Result<T, DecodeError>;

pub mod checksum {
    use byteorder::{ByteOrder, NetworkEndian};

    use super::ipv4;

    const fn propagate_carries(word: u32) -> u16 {
        let sum = (word >> 16) + (word & 0xffff);
        ((sum >> 16) as u16) + (sum as u16)
    }

    /// Compute an RFC 1071 compliant checksum (without the final complement).
    pub fn data(mut data: &[u8]) -> u16 {
        let mut accum = 0;

        // For each 32-byte chunk...
        const CHUNK_SIZE: usize = 32;
        while data.len() >= CHUNK_SIZE {
            let mut d = &data[..CHUNK_SIZE];
            // ... take by 2 bytes and sum them.
            while d.len() >= 2 {
                accum += NetworkEndian::read_u16(d) as u32;
                d = &d[2..];
            }

            data = &data[CHUNK_SIZE..];
        }

        // Sum the rest that does not fit the last 32-byte chunk,
        // taking by 2 bytes.
        while data.len() >= 2 {
            accum += NetworkEndian::read_u16(data) as u32;
            data = &data[2..];
        }

        // Add the last remaining odd byte, if any.
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

    /// Compute the IPv4 pseudo-header checksum over `(src, dst, proto, len)`.
    pub fn pseudo_header_v4(
        src_addr: &ipv4::Address,
        dst_addr: &ipv4::Address,
        next_header: u8,
        length: u32,
    ) -> u16 {
        let mut proto_len = [0u8; 4];
        proto_len[1] = next_header;
        NetworkEndian::write_u16(&mut proto_len[2..4], length as u16);

        combine(&[
            data(&src_addr.octets()),
            data(&dst_addr.octets()),
            data(&proto_len[..]),
        ])
    }
}
