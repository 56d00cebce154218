use byteorder::{ByteOrder, NetworkEndian};

pub use core::net::Ipv4Addr as Address;

use super::{checksum, DecodeError, Result};

/// The protocol number assigned to TCP.
pub const PROTOCOL_TCP: u8 = 0x06;

/// A read/write wrapper around an IPv4 packet buffer.
#[derive(Debug, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    use crate::wire::field::*;

    pub const VER_IHL: usize = 0;
    pub const LENGTH: Field = 2..4;
    pub const IDENT: Field = 4..6;
    pub const FLG_OFF: Field = 6..8;
    pub const TTL: usize = 8;
    pub const PROTOCOL: usize = 9;
    pub const CHECKSUM: Field = 10..12;
    pub const SRC_ADDR: Field = 12..16;
    pub const DST_ADDR: Field = 16..20;
}

pub const HEADER_LEN: usize = field::DST_ADDR.end;

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with IPv4 packet structure.
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    ///
    /// Returns `Err(DecodeError::Truncated)` if the buffer is shorter than
    /// the header length field claims, or if the total length field points
    /// past the buffer or inside the header.
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(DecodeError::Truncated);
        }
        let header_len = self.header_len();
        if header_len < HEADER_LEN || header_len > len {
            return Err(DecodeError::Truncated);
        }
        let total_len = self.total_len();
        if total_len < header_len || total_len > len {
            return Err(DecodeError::Truncated);
        }
        Ok(())
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the version field.
    #[inline]
    pub fn version(&self) -> u8 {
        let data = self.buffer.as_ref();
        data[field::VER_IHL] >> 4
    }

    /// Return the header length, in octets.
    #[inline]
    pub fn header_len(&self) -> usize {
        let data = self.buffer.as_ref();
        ((data[field::VER_IHL] & 0x0f) as usize) * 4
    }

    /// Return the total length field, in octets.
    #[inline]
    pub fn total_len(&self) -> usize {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::LENGTH]) as usize
    }

    /// Return the fragment flags and offset field, as transmitted.
    #[inline]
    pub fn flags_and_frag_offset(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::FLG_OFF])
    }

    /// Query whether the packet is a fragment, or has more fragments
    /// coming: either case means the TCP span is not self-contained.
    ///
    /// Shifting out the reserved and don't-fragment bits leaves the
    /// more-fragments bit and the offset.
    #[inline]
    pub fn is_fragment(&self) -> bool {
        self.flags_and_frag_offset() << 2 != 0
    }

    /// Return the protocol field.
    #[inline]
    pub fn protocol(&self) -> u8 {
        let data = self.buffer.as_ref();
        data[field::PROTOCOL]
    }

    /// Return the header checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::CHECKSUM])
    }

    /// Return the source address field.
    #[inline]
    pub fn src_addr(&self) -> Address {
        let data = self.buffer.as_ref();
        Address::from_bits(NetworkEndian::read_u32(&data[field::SRC_ADDR]))
    }

    /// Return the destination address field.
    #[inline]
    pub fn dst_addr(&self) -> Address {
        let data = self.buffer.as_ref();
        Address::from_bits(NetworkEndian::read_u32(&data[field::DST_ADDR]))
    }

    /// Validate the header checksum.
    ///
    /// A sum of zero is accepted alongside the all-ones sum: traces in the
    /// wild carry segments captured before the NIC filled the field in,
    /// and the historical tooling treats them as valid.
    pub fn verify_checksum(&self) -> bool {
        let data = self.buffer.as_ref();
        let sum = checksum::data(&data[..self.header_len()]);
        sum == 0 || sum == !0
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// Return the payload, truncated to the total length field.
    ///
    /// The distinction matters: Ethernet frames shorter than 60 octets are
    /// padded, and the padding would otherwise read as TCP payload.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let data = self.buffer.as_ref();
        &data[self.header_len()..self.total_len()]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the version field.
    #[inline]
    pub fn set_version(&mut self, value: u8) {
        let data = self.buffer.as_mut();
        data[field::VER_IHL] = (data[field::VER_IHL] & 0x0f) | (value << 4);
    }

    /// Set the header length, in octets.
    #[inline]
    pub fn set_header_len(&mut self, value: usize) {
        let data = self.buffer.as_mut();
        data[field::VER_IHL] = (data[field::VER_IHL] & 0xf0) | ((value / 4) as u8 & 0x0f);
    }

    /// Set the total length field.
    #[inline]
    pub fn set_total_len(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::LENGTH], value)
    }

    /// Set the identification field.
    #[inline]
    pub fn set_ident(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::IDENT], value)
    }

    /// Set the fragment flags and offset field.
    #[inline]
    pub fn set_flags_and_frag_offset(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::FLG_OFF], value)
    }

    /// Set the time-to-live field.
    #[inline]
    pub fn set_hop_limit(&mut self, value: u8) {
        let data = self.buffer.as_mut();
        data[field::TTL] = value
    }

    /// Set the protocol field.
    #[inline]
    pub fn set_protocol(&mut self, value: u8) {
        let data = self.buffer.as_mut();
        data[field::PROTOCOL] = value
    }

    /// Set the header checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::CHECKSUM], value)
    }

    /// Set the source address field.
    #[inline]
    pub fn set_src_addr(&mut self, value: Address) {
        let data = self.buffer.as_mut();
        data[field::SRC_ADDR].copy_from_slice(&value.octets())
    }

    /// Set the destination address field.
    #[inline]
    pub fn set_dst_addr(&mut self, value: Address) {
        let data = self.buffer.as_mut();
        data[field::DST_ADDR].copy_from_slice(&value.octets())
    }

    /// Compute and fill in the header checksum.
    pub fn fill_checksum(&mut self) {
        self.set_checksum(0);
        let checksum = {
            let data = self.buffer.as_ref();
            !checksum::data(&data[..self.header_len()])
        };
        self.set_checksum(checksum)
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    static PACKET_BYTES: [u8; 24] = [
        0x45, 0x00, 0x00, 0x18, 0x00, 0x00, 0x40, 0x00, 0x40, 0x06, 0xb9, 0x8c, 0xc0, 0xa8, 0x00,
        0x01, 0xc0, 0xa8, 0x00, 0x02, 0xaa, 0xbb, 0xcc, 0xdd,
    ];

    #[test]
    fn test_deconstruct() {
        let packet = Packet::new_checked(&PACKET_BYTES[..]).unwrap();
        assert_eq!(packet.version(), 4);
        assert_eq!(packet.header_len(), 20);
        assert_eq!(packet.total_len(), 24);
        assert!(!packet.is_fragment());
        assert_eq!(packet.protocol(), PROTOCOL_TCP);
        assert_eq!(packet.src_addr(), Address::new(192, 168, 0, 1));
        assert_eq!(packet.dst_addr(), Address::new(192, 168, 0, 2));
        assert!(packet.verify_checksum());
        assert_eq!(packet.payload(), &[0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn test_construct() {
        let mut bytes = [0u8; 24];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        packet.set_version(4);
        packet.set_header_len(20);
        packet.set_total_len(24);
        packet.set_ident(0);
        packet.set_flags_and_frag_offset(0x4000);
        packet.set_hop_limit(0x40);
        packet.set_protocol(PROTOCOL_TCP);
        packet.set_src_addr(Address::new(192, 168, 0, 1));
        packet.set_dst_addr(Address::new(192, 168, 0, 2));
        packet.fill_checksum();
        bytes[20..].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(&bytes[..], &PACKET_BYTES[..]);
    }

    #[test]
    fn test_payload_stops_at_total_len() {
        // four octets of Ethernet padding after the IP datagram
        let mut bytes = [0u8; 28];
        bytes[..24].copy_from_slice(&PACKET_BYTES[..]);
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(packet.payload(), &[0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn test_fragment_bits() {
        let mut bytes = PACKET_BYTES;
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        // don't-fragment alone is not a fragment
        packet.set_flags_and_frag_offset(0x4000);
        assert!(!packet.is_fragment());
        // more-fragments is
        packet.set_flags_and_frag_offset(0x2000);
        assert!(packet.is_fragment());
        // as is a bare offset
        packet.set_flags_and_frag_offset(0x0001);
        assert!(packet.is_fragment());
    }

    #[test]
    fn test_truncated_total_len() {
        let mut bytes = PACKET_BYTES;
        bytes[3] = 0xff;
        assert_eq!(
            Packet::new_checked(&bytes[..]).unwrap_err(),
            DecodeError::Truncated
        );
    }

    #[test]
    fn test_corrupted_checksum() {
        let mut bytes = PACKET_BYTES;
        bytes[10] ^= 0x55;
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert!(!packet.verify_checksum());
    }
}
