/*! Normalized TCP segment observations.

A [Unit] is one captured frame reduced to the fields the flow trackers
care about: addresses, sequence space, flags, window, payload size and
the parsed options. [Unit::decode] takes the raw frame straight from the
capture and either produces a `Unit` or rejects the frame with a typed
[DecodeError]; a rejected frame is simply skipped by the driver.
*/

use log::warn;

use crate::phy::LinkType;
use crate::time::Instant;
use crate::wire::{
    DecodeError, EthernetFrame, Ipv4Address, Ipv4Packet, Result, SackBlock, SeqNumber, TcpOption,
    TcpPacket, MAX_SACK_BLOCKS, TCP_HEADER_LEN,
};

mod flag {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

/// A normalized TCP segment observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    /// Capture timestamp.
    pub when: Instant,
    pub src_addr: Ipv4Address,
    pub dst_addr: Ipv4Address,
    pub src_port: u16,
    pub dst_port: u16,
    pub data_sequence: SeqNumber,
    pub ack_sequence: SeqNumber,
    /// The advertised window, unscaled.
    pub recv_window: u32,
    /// Payload octets.
    pub data_length: u32,
    /// Option octets between the fixed header and the payload.
    pub option_length: u32,
    flags: u8,
    /// Maximum segment size option, when present.
    pub mss: Option<u16>,
    /// Window scale option, when present, as sent.
    pub wsc: Option<u8>,
    /// Selective acknowledgement blocks, in option order.
    pub sack: heapless::Vec<SackBlock, MAX_SACK_BLOCKS>,
}

impl Unit {
    pub fn is_fin(&self) -> bool {
        self.flags & flag::FIN != 0
    }

    pub fn is_syn(&self) -> bool {
        self.flags & flag::SYN != 0
    }

    pub fn is_rst(&self) -> bool {
        self.flags & flag::RST != 0
    }

    pub fn is_psh(&self) -> bool {
        self.flags & flag::PSH != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & flag::ACK != 0
    }

    pub fn is_urg(&self) -> bool {
        self.flags & flag::URG != 0
    }

    /// Whether the segment carries any selective-acknowledgement block.
    pub fn is_sack(&self) -> bool {
        !self.sack.is_empty()
    }

    /// Decode a captured frame into a `Unit`.
    ///
    /// Walks link, IPv4 and TCP layers, validating both checksums on the
    /// way. Fragmented datagrams bypass TCP checksum validation: the
    /// capture only holds the first fragment.
    pub fn decode(frame: &[u8], link_type: LinkType, when: Instant) -> Result<Unit> {
        let ip_span = unpack_link(frame, link_type)?;
        let (packet, tcp_span) = unpack_ipv4(ip_span)?;
        unpack_tcp(
            tcp_span,
            packet.src_addr(),
            packet.dst_addr(),
            packet.is_fragment(),
            when,
        )
    }
}

/// Strip the link-layer header, yielding the IPv4 span.
fn unpack_link(frame: &[u8], link_type: LinkType) -> Result<&[u8]> {
    match link_type {
        LinkType::Null | LinkType::Loop => unpack_loopback(frame),
        LinkType::Ethernet | LinkType::Ieee802 => unpack_ethernet(frame),
        LinkType::LinuxSll => unpack_linux_sll(frame),
        LinkType::Other(dlt) => {
            warn!("link type {dlt} not known, interpreting as Ethernet - be careful");
            unpack_ethernet(frame)
        }
    }
}

fn unpack_loopback(frame: &[u8]) -> Result<&[u8]> {
    // a 4-octet address-family tag, in whichever byte order the capturing
    // host used
    let family = frame.get(..4).ok_or(DecodeError::Truncated)?;
    if family == [0x02, 0x00, 0x00, 0x00] || family == [0x00, 0x00, 0x00, 0x02] {
        Ok(&frame[4..])
    } else {
        Err(DecodeError::NotIpv4)
    }
}

fn unpack_ethernet(frame: &[u8]) -> Result<&[u8]> {
    EthernetFrame::new_checked(frame)?.ipv4_payload()
}

fn unpack_linux_sll(frame: &[u8]) -> Result<&[u8]> {
    const HEADER_LEN: usize = 16;
    const TYPE_OFFSET: usize = 14;

    if frame.len() < HEADER_LEN {
        return Err(DecodeError::Truncated);
    }
    if frame[TYPE_OFFSET..TYPE_OFFSET + 2] == [0x08, 0x00] {
        Ok(&frame[HEADER_LEN..])
    } else {
        Err(DecodeError::NotIpv4)
    }
}

/// Validate the IPv4 header and carve out the TCP span.
///
/// The span is cut at the total length field rather than at the end of
/// the frame: Ethernet padding may extend past the datagram.
fn unpack_ipv4(span: &[u8]) -> Result<(Ipv4Packet<&[u8]>, &[u8])> {
    if span.len() < crate::wire::IPV4_HEADER_LEN {
        return Err(DecodeError::Truncated);
    }
    let packet = Ipv4Packet::new_unchecked(span);
    if packet.version() != 4 {
        return Err(DecodeError::NotIpv4);
    }
    packet.check_len()?;
    if packet.protocol() != crate::wire::PROTOCOL_TCP {
        return Err(DecodeError::NotTcp);
    }
    if !packet.verify_checksum() {
        return Err(DecodeError::BadIpChecksum);
    }
    let tcp_span = packet.payload();
    Ok((packet, tcp_span))
}

fn unpack_tcp(
    span: &[u8],
    src_addr: Ipv4Address,
    dst_addr: Ipv4Address,
    is_fragment: bool,
    when: Instant,
) -> Result<Unit> {
    let packet = TcpPacket::new_checked(span)?;

    // fragmented segments cannot be summed; treat them as valid
    if !is_fragment && !packet.verify_checksum(&src_addr, &dst_addr) {
        return Err(DecodeError::BadTcpChecksum);
    }

    let mut unit = Unit {
        when,
        src_addr,
        dst_addr,
        src_port: packet.src_port(),
        dst_port: packet.dst_port(),
        data_sequence: packet.seq_number(),
        ack_sequence: packet.ack_number(),
        recv_window: u32::from(packet.window_len()),
        data_length: packet.payload().len() as u32,
        option_length: (packet.header_len() - TCP_HEADER_LEN) as u32,
        flags: (packet.flags() & 0x3f) as u8,
        mss: None,
        wsc: None,
        sack: heapless::Vec::new(),
    };

    let mut options = packet.options();
    while !options.is_empty() {
        let (rest, option) = TcpOption::parse(options)?;
        match option {
            TcpOption::EndOfList => break,
            TcpOption::NoOperation => {}
            TcpOption::MaxSegmentSize(mss) => unit.mss = Some(mss),
            TcpOption::WindowScale(wsc) => unit.wsc = Some(wsc),
            TcpOption::SackRange(blocks) => unit.sack = blocks,
            TcpOption::SackPermitted | TcpOption::Unknown { .. } => {}
        }
        options = rest;
    }

    Ok(unit)
}
