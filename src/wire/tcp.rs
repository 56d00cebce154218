use byteorder::{ByteOrder, NetworkEndian};
use core::{cmp, fmt, ops};

use super::{checksum, ipv4, DecodeError, Result};

/// The maximum number of SACK blocks one option can carry (RFC 2018: four
/// fit a 40-octet option space, three when timestamps are in use).
pub const MAX_SACK_BLOCKS: usize = 4;

/// A TCP sequence number.
///
/// Sequence numbers wrap at 2^32; every comparison and subtraction goes
/// through the signed 32-bit difference, so ordering stays correct across
/// the wrap.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNumber(pub u32);

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        (*self - *other).partial_cmp(&0)
    }
}

impl ops::Add<u32> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: u32) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs))
    }
}

impl ops::Sub for SeqNumber {
    type Output = i32;

    fn sub(self, rhs: SeqNumber) -> i32 {
        self.0.wrapping_sub(rhs.0) as i32
    }
}

/// One selective-acknowledgement block, `[left_edge, right_edge)` in the
/// acked direction's sequence space.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SackBlock {
    pub left_edge: SeqNumber,
    pub right_edge: SeqNumber,
}

/// A read/write wrapper around a TCP segment buffer.
#[derive(Debug, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    use crate::wire::field::*;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const SEQ_NUM: Field = 4..8;
    pub const ACK_NUM: Field = 8..12;
    pub const FLAGS: Field = 12..14;
    pub const WIN_SIZE: Field = 14..16;
    pub const CHECKSUM: Field = 16..18;
    pub const URGENT: Field = 18..20;

    pub const FLG_FIN: u16 = 0x001;
    pub const FLG_SYN: u16 = 0x002;
    pub const FLG_RST: u16 = 0x004;
    pub const FLG_PSH: u16 = 0x008;
    pub const FLG_ACK: u16 = 0x010;
    pub const FLG_URG: u16 = 0x020;

    pub const OPT_END: u8 = 0x00;
    pub const OPT_NOP: u8 = 0x01;
    pub const OPT_MSS: u8 = 0x02;
    pub const OPT_WS: u8 = 0x03;
    pub const OPT_SACKPERM: u8 = 0x04;
    pub const OPT_SACKRNG: u8 = 0x05;
}

pub const HEADER_LEN: usize = field::URGENT.end;

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with TCP segment structure.
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
    /// Returns `Err(DecodeError::Truncated)` if the buffer is too short or
    /// the data offset points past it or inside the fixed header.
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(DecodeError::Truncated);
        }
        let header_len = self.header_len();
        if header_len < HEADER_LEN || header_len > len {
            return Err(DecodeError::Truncated);
        }
        Ok(())
    }

    /// Consume the segment, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the source port field.
    #[inline]
    pub fn src_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::SRC_PORT])
    }

    /// Return the destination port field.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::DST_PORT])
    }

    /// Return the sequence number field.
    #[inline]
    pub fn seq_number(&self) -> SeqNumber {
        let data = self.buffer.as_ref();
        SeqNumber(NetworkEndian::read_u32(&data[field::SEQ_NUM]))
    }

    /// Return the acknowledgement number field.
    #[inline]
    pub fn ack_number(&self) -> SeqNumber {
        let data = self.buffer.as_ref();
        SeqNumber(NetworkEndian::read_u32(&data[field::ACK_NUM]))
    }

    /// Return the header length, in octets, from the data offset field.
    #[inline]
    pub fn header_len(&self) -> usize {
        let data = self.buffer.as_ref();
        ((data[field::FLAGS.start] >> 4) as usize) * 4
    }

    /// Return the raw flag bits.
    #[inline]
    pub fn flags(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::FLAGS]) & 0x0fff
    }

    /// Return the FIN flag.
    #[inline]
    pub fn fin(&self) -> bool {
        self.flags() & field::FLG_FIN != 0
    }

    /// Return the SYN flag.
    #[inline]
    pub fn syn(&self) -> bool {
        self.flags() & field::FLG_SYN != 0
    }

    /// Return the RST flag.
    #[inline]
    pub fn rst(&self) -> bool {
        self.flags() & field::FLG_RST != 0
    }

    /// Return the PSH flag.
    #[inline]
    pub fn psh(&self) -> bool {
        self.flags() & field::FLG_PSH != 0
    }

    /// Return the ACK flag.
    #[inline]
    pub fn ack(&self) -> bool {
        self.flags() & field::FLG_ACK != 0
    }

    /// Return the URG flag.
    #[inline]
    pub fn urg(&self) -> bool {
        self.flags() & field::FLG_URG != 0
    }

    /// Return the receive window field, as advertised (unscaled).
    #[inline]
    pub fn window_len(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::WIN_SIZE])
    }

    /// Return the checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::CHECKSUM])
    }

    /// Validate the segment checksum over the IPv4 pseudo-header.
    pub fn verify_checksum(&self, src_addr: &ipv4::Address, dst_addr: &ipv4::Address) -> bool {
        let data = self.buffer.as_ref();
        checksum::combine(&[
            checksum::pseudo_header_v4(src_addr, dst_addr, ipv4::PROTOCOL_TCP, data.len() as u32),
            checksum::data(data),
        ]) == !0
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// Return the options span between the fixed header and the payload.
    #[inline]
    pub fn options(&self) -> &'a [u8] {
        let data = self.buffer.as_ref();
        &data[HEADER_LEN..self.header_len()]
    }

    /// Return the payload.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let data = self.buffer.as_ref();
        &data[self.header_len()..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the source port field.
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::DST_PORT], value)
    }

    /// Set the sequence number field.
    #[inline]
    pub fn set_seq_number(&mut self, value: SeqNumber) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u32(&mut data[field::SEQ_NUM], value.0)
    }

    /// Set the acknowledgement number field.
    #[inline]
    pub fn set_ack_number(&mut self, value: SeqNumber) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u32(&mut data[field::ACK_NUM], value.0)
    }

    /// Set the header length, in octets, into the data offset field.
    #[inline]
    pub fn set_header_len(&mut self, value: usize) {
        let data = self.buffer.as_mut();
        data[field::FLAGS.start] =
            (data[field::FLAGS.start] & 0x0f) | ((((value / 4) as u8) & 0x0f) << 4);
    }

    fn set_flag(&mut self, flag: u16, value: bool) {
        let data = self.buffer.as_mut();
        let raw = NetworkEndian::read_u16(&data[field::FLAGS]);
        let raw = if value { raw | flag } else { raw & !flag };
        NetworkEndian::write_u16(&mut data[field::FLAGS], raw)
    }

    /// Set the FIN flag.
    #[inline]
    pub fn set_fin(&mut self, value: bool) {
        self.set_flag(field::FLG_FIN, value)
    }

    /// Set the SYN flag.
    #[inline]
    pub fn set_syn(&mut self, value: bool) {
        self.set_flag(field::FLG_SYN, value)
    }

    /// Set the RST flag.
    #[inline]
    pub fn set_rst(&mut self, value: bool) {
        self.set_flag(field::FLG_RST, value)
    }

    /// Set the PSH flag.
    #[inline]
    pub fn set_psh(&mut self, value: bool) {
        self.set_flag(field::FLG_PSH, value)
    }

    /// Set the ACK flag.
    #[inline]
    pub fn set_ack(&mut self, value: bool) {
        self.set_flag(field::FLG_ACK, value)
    }

    /// Set the URG flag.
    #[inline]
    pub fn set_urg(&mut self, value: bool) {
        self.set_flag(field::FLG_URG, value)
    }

    /// Set the receive window field.
    #[inline]
    pub fn set_window_len(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::WIN_SIZE], value)
    }

    /// Set the checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::CHECKSUM], value)
    }

    /// Set the urgent pointer field.
    #[inline]
    pub fn set_urgent_at(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::URGENT], value)
    }

    /// Return a mutable pointer to the options.
    #[inline]
    pub fn options_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len();
        let data = self.buffer.as_mut();
        &mut data[HEADER_LEN..header_len]
    }

    /// Return a mutable pointer to the payload.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len();
        let data = self.buffer.as_mut();
        &mut data[header_len..]
    }

    /// Compute and fill in the checksum over the IPv4 pseudo-header.
    pub fn fill_checksum(&mut self, src_addr: &ipv4::Address, dst_addr: &ipv4::Address) {
        self.set_checksum(0);
        let checksum = {
            let data = self.buffer.as_ref();
            !checksum::combine(&[
                checksum::pseudo_header_v4(
                    src_addr,
                    dst_addr,
                    ipv4::PROTOCOL_TCP,
                    data.len() as u32,
                ),
                checksum::data(data),
            ])
        };
        self.set_checksum(checksum)
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

/// A parsed TCP option.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum TcpOption<'a> {
    EndOfList,
    NoOperation,
    MaxSegmentSize(u16),
    WindowScale(u8),
    SackPermitted,
    SackRange(heapless::Vec<SackBlock, MAX_SACK_BLOCKS>),
    Unknown { kind: u8, data: &'a [u8] },
}

impl<'a> TcpOption<'a> {
    /// Parse the option at the front of `buffer`, returning the rest of
    /// the span and the option.
    ///
    /// An [EndOfList] terminates the walk; length-carrying options with a
    /// length byte below 2 are rejected rather than looped on.
    ///
    /// [EndOfList]: #variant.EndOfList
    pub fn parse(buffer: &'a [u8]) -> Result<(&'a [u8], TcpOption<'a>)> {
        let (length, option);
        match *buffer.first().ok_or(DecodeError::Truncated)? {
            field::OPT_END => {
                length = 1;
                option = TcpOption::EndOfList;
            }
            field::OPT_NOP => {
                length = 1;
                option = TcpOption::NoOperation;
            }
            kind => {
                if buffer.len() < 2 {
                    return Err(DecodeError::Truncated);
                }
                length = buffer[1] as usize;
                if length < 2 {
                    return Err(DecodeError::BadOptionLength);
                }
                if buffer.len() < length {
                    return Err(DecodeError::Truncated);
                }
                let data = &buffer[2..length];
                match (kind, length) {
                    (field::OPT_MSS, 4) => option = TcpOption::MaxSegmentSize(NetworkEndian::read_u16(data)),
                    (field::OPT_MSS, _) => return Err(DecodeError::BadOptionLength),
                    (field::OPT_WS, 3) => option = TcpOption::WindowScale(data[0]),
                    (field::OPT_WS, _) => return Err(DecodeError::BadOptionLength),
                    (field::OPT_SACKPERM, 2) => option = TcpOption::SackPermitted,
                    (field::OPT_SACKRNG, _) => {
                        let count = data.len() / 8;
                        let mut blocks = heapless::Vec::new();
                        for i in 0..count {
                            let block = SackBlock {
                                left_edge: SeqNumber(NetworkEndian::read_u32(&data[i * 8..])),
                                right_edge: SeqNumber(NetworkEndian::read_u32(&data[i * 8 + 4..])),
                            };
                            blocks
                                .push(block)
                                .map_err(|_| DecodeError::TooManySackBlocks)?;
                        }
                        option = TcpOption::SackRange(blocks);
                    }
                    (_, _) => {
                        option = TcpOption::Unknown { kind, data };
                    }
                }
            }
        }
        Ok((&buffer[length..], option))
    }

    /// Return the number of octets this option occupies on the wire.
    pub fn buffer_len(&self) -> usize {
        match self {
            TcpOption::EndOfList => 1,
            TcpOption::NoOperation => 1,
            TcpOption::MaxSegmentSize(_) => 4,
            TcpOption::WindowScale(_) => 3,
            TcpOption::SackPermitted => 2,
            TcpOption::SackRange(blocks) => 2 + blocks.len() * 8,
            TcpOption::Unknown { data, .. } => 2 + data.len(),
        }
    }

    /// Emit the option at the front of `buffer`, returning the rest of
    /// the span.
    pub fn emit<'b>(&self, buffer: &'b mut [u8]) -> &'b mut [u8] {
        let length = self.buffer_len();
        match self {
            TcpOption::EndOfList => {
                buffer[0] = field::OPT_END;
            }
            TcpOption::NoOperation => {
                buffer[0] = field::OPT_NOP;
            }
            _ => {
                buffer[1] = length as u8;
                match self {
                    TcpOption::MaxSegmentSize(value) => {
                        buffer[0] = field::OPT_MSS;
                        NetworkEndian::write_u16(&mut buffer[2..], *value)
                    }
                    TcpOption::WindowScale(value) => {
                        buffer[0] = field::OPT_WS;
                        buffer[2] = *value;
                    }
                    TcpOption::SackPermitted => {
                        buffer[0] = field::OPT_SACKPERM;
                    }
                    TcpOption::SackRange(blocks) => {
                        buffer[0] = field::OPT_SACKRNG;
                        for (i, block) in blocks.iter().enumerate() {
                            NetworkEndian::write_u32(&mut buffer[2 + i * 8..], block.left_edge.0);
                            NetworkEndian::write_u32(
                                &mut buffer[2 + i * 8 + 4..],
                                block.right_edge.0,
                            );
                        }
                    }
                    TcpOption::Unknown { kind, data } => {
                        buffer[0] = *kind;
                        buffer[2..length].copy_from_slice(data)
                    }
                    _ => unreachable!(),
                }
            }
        }
        &mut buffer[length..]
    }
}
