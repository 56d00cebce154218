use byteorder::{ByteOrder, NetworkEndian};
use core::fmt;

use super::{DecodeError, Result};

/// The EtherType assigned to IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// The EtherType of an IEEE 802.1Q VLAN tag.
pub const ETHERTYPE_VLAN: u16 = 0x8100;

/// A six-octet Ethernet II address.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Address(pub [u8; 6]);

impl Address {
    pub const fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = self.0;
        write!(
            f,
            "{:02x}-{:02x}-{:02x}-{:02x}-{:02x}-{:02x}",
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
        )
    }
}

/// A read/write wrapper around an Ethernet II frame buffer.
#[derive(Debug, Clone)]
pub struct Frame<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    use crate::wire::field::*;

    pub const DESTINATION: Field = 0..6;
    pub const SOURCE: Field = 6..12;
    pub const ETHERTYPE: Field = 12..14;
    pub const PAYLOAD: Rest = 14..;
}

pub const HEADER_LEN: usize = field::PAYLOAD.start;

/// The length of one 802.1Q tag: TPID plus TCI.
pub const VLAN_HEADER_LEN: usize = 4;

impl<T: AsRef<[u8]>> Frame<T> {
    /// Imbue a raw octet buffer with Ethernet frame structure.
    pub const fn new_unchecked(buffer: T) -> Frame<T> {
        Frame { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Frame<T>> {
        let frame = Self::new_unchecked(buffer);
        frame.check_len()?;
        Ok(frame)
    }

    /// Ensure that no accessor method will panic if called.
    /// Returns `Err(DecodeError::Truncated)` if the buffer is too short.
    pub fn check_len(&self) -> Result<()> {
        if self.buffer.as_ref().len() < HEADER_LEN {
            Err(DecodeError::Truncated)
        } else {
            Ok(())
        }
    }

    /// Consume the frame, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the destination address field.
    #[inline]
    pub fn dst_addr(&self) -> Address {
        let data = self.buffer.as_ref();
        let mut bytes = [0; 6];
        bytes.copy_from_slice(&data[field::DESTINATION]);
        Address(bytes)
    }

    /// Return the source address field.
    #[inline]
    pub fn src_addr(&self) -> Address {
        let data = self.buffer.as_ref();
        let mut bytes = [0; 6];
        bytes.copy_from_slice(&data[field::SOURCE]);
        Address(bytes)
    }

    /// Return the EtherType field, without any VLAN tags skipped.
    #[inline]
    pub fn ethertype(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::ETHERTYPE])
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Frame<&'a T> {
    /// Return the IPv4 payload of the frame, skipping any stack of IEEE
    /// 802.1Q tags in front of the EtherType.
    ///
    /// Returns `Err(DecodeError::NotIpv4)` if the innermost EtherType is
    /// not IPv4, and `Err(DecodeError::Truncated)` if the frame is cut
    /// inside a tag.
    pub fn ipv4_payload(&self) -> Result<&'a [u8]> {
        let data = self.buffer.as_ref();

        let mut type_offset = field::ETHERTYPE.start;
        let mut payload_offset = field::PAYLOAD.start;
        while NetworkEndian::read_u16(&data[type_offset..type_offset + 2]) == ETHERTYPE_VLAN {
            type_offset += VLAN_HEADER_LEN;
            payload_offset += VLAN_HEADER_LEN;
            if data.len() < payload_offset {
                return Err(DecodeError::Truncated);
            }
        }

        if NetworkEndian::read_u16(&data[type_offset..type_offset + 2]) == ETHERTYPE_IPV4 {
            Ok(&data[payload_offset..])
        } else {
            Err(DecodeError::NotIpv4)
        }
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Frame<T> {
    /// Set the destination address field.
    #[inline]
    pub fn set_dst_addr(&mut self, value: Address) {
        let data = self.buffer.as_mut();
        data[field::DESTINATION].copy_from_slice(value.as_bytes())
    }

    /// Set the source address field.
    #[inline]
    pub fn set_src_addr(&mut self, value: Address) {
        let data = self.buffer.as_mut();
        data[field::SOURCE].copy_from_slice(value.as_bytes())
    }

    /// Set the EtherType field.
    #[inline]
    pub fn set_ethertype(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::ETHERTYPE], value)
    }

    /// Return a mutable pointer to the payload.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let data = self.buffer.as_mut();
        &mut data[field::PAYLOAD]
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Frame<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // A TCP-less frame is enough to exercise the link layer.
    static FRAME_BYTES: [u8; 18] = [
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x08, 0x00, 0xaa,
        0xbb, 0xcc, 0xdd,
    ];

    #[test]
    fn test_deconstruct() {
        let frame = Frame::new_checked(&FRAME_BYTES[..]).unwrap();
        assert_eq!(frame.dst_addr(), Address([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]));
        assert_eq!(frame.src_addr(), Address([0x11, 0x12, 0x13, 0x14, 0x15, 0x16]));
        assert_eq!(frame.ethertype(), ETHERTYPE_IPV4);
        assert_eq!(frame.ipv4_payload().unwrap(), &[0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn test_construct() {
        let mut bytes = [0u8; 18];
        let mut frame = Frame::new_unchecked(&mut bytes[..]);
        frame.set_dst_addr(Address([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]));
        frame.set_src_addr(Address([0x11, 0x12, 0x13, 0x14, 0x15, 0x16]));
        frame.set_ethertype(ETHERTYPE_IPV4);
        frame.payload_mut().copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(&frame.into_inner()[..], &FRAME_BYTES[..]);
    }

    #[test]
    fn test_vlan_tags_skipped() {
        // 802.1Q tag 0x8100/0x0001, then another, then IPv4
        let bytes = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x81, 0x00,
            0x00, 0x01, 0x81, 0x00, 0x00, 0x02, 0x08, 0x00, 0xaa, 0xbb,
        ];
        let frame = Frame::new_checked(&bytes[..]).unwrap();
        assert_eq!(frame.ipv4_payload().unwrap(), &[0xaa, 0xbb]);
    }

    #[test]
    fn test_truncated_inside_vlan_tag() {
        let bytes = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x81, 0x00,
            0x00,
        ];
        let frame = Frame::new_checked(&bytes[..]).unwrap();
        assert_eq!(frame.ipv4_payload(), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_not_ipv4() {
        let mut bytes = FRAME_BYTES;
        bytes[12] = 0x86;
        bytes[13] = 0xdd;
        let frame = Frame::new_checked(&bytes[..]).unwrap();
        assert_eq!(frame.ipv4_payload(), Err(DecodeError::NotIpv4));
    }
}
