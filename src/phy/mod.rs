/*! Packet capture sources.

An interface for pulling captured frames out of libpcap, either from a
live interface or from a saved trace. The rest of the crate only ever
sees `(timestamp, bytes)` pairs and the capture's [LinkType]; nothing
here is TCP-specific.
*/

use log::{debug, error};

use crate::time::Instant;

/// Link-layer framing of a capture, from the DLT code libpcap reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// BSD loopback: a 4-octet address-family tag.
    Null,
    /// OpenBSD loopback, same framing as [Null] on the wire.
    ///
    /// [Null]: #variant.Null
    Loop,
    /// Ethernet II.
    Ethernet,
    /// IEEE 802 networks carrying Ethernet-compatible framing.
    Ieee802,
    /// Linux "cooked" capture (`any` pseudo-interface).
    LinuxSll,
    /// Anything else; decoded as Ethernet on a best-effort basis.
    Other(i32),
}

impl LinkType {
    /// Map a raw DLT code to a link type.
    pub fn from_dlt(dlt: i32) -> LinkType {
        match dlt {
            0 => LinkType::Null,
            108 => LinkType::Loop,
            1 => LinkType::Ethernet,
            6 => LinkType::Ieee802,
            113 => LinkType::LinuxSll,
            other => LinkType::Other(other),
        }
    }
}

const SNAPLEN: i32 = 65560;

enum Inner {
    Live(pcap::Capture<pcap::Active>),
    Offline(pcap::Capture<pcap::Offline>),
}

/// A stream of captured frames.
pub struct PacketSource {
    inner: Inner,
    link_type: LinkType,
}

impl PacketSource {
    /// Open `name` as a live interface; when that fails, retry it as an
    /// offline trace file.
    pub fn open(name: &str) -> Result<PacketSource, pcap::Error> {
        match Self::open_live(name) {
            Ok(source) => Ok(source),
            Err(live_err) => {
                debug!("cannot capture on {name}: {live_err}, retrying as a file");
                Self::open_file(name)
            }
        }
    }

    /// Open a live capture on the named interface.
    pub fn open_live(name: &str) -> Result<PacketSource, pcap::Error> {
        let cap = pcap::Capture::from_device(name)?
            .snaplen(SNAPLEN)
            .promisc(true)
            .immediate_mode(true)
            .open()?;
        let link_type = LinkType::from_dlt(cap.get_datalink().0);
        Ok(PacketSource {
            inner: Inner::Live(cap),
            link_type,
        })
    }

    /// Open a saved trace file.
    pub fn open_file(path: &str) -> Result<PacketSource, pcap::Error> {
        let cap = pcap::Capture::from_file(path)?;
        let link_type = LinkType::from_dlt(cap.get_datalink().0);
        Ok(PacketSource {
            inner: Inner::Offline(cap),
            link_type,
        })
    }

    /// The link-layer framing of this capture.
    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    /// Pull the next frame, blocking on a live capture. Returns `None` at
    /// the end of the trace or on a capture error.
    pub fn next_frame(&mut self) -> Option<(Instant, Vec<u8>)> {
        loop {
            let result = match &mut self.inner {
                Inner::Live(cap) => cap.next_packet(),
                Inner::Offline(cap) => cap.next_packet(),
            };
            match result {
                Ok(packet) => {
                    let ts = &packet.header.ts;
                    let when =
                        Instant::from_micros(ts.tv_sec as i64 * 1_000_000 + ts.tv_usec as i64);
                    return Some((when, packet.data.to_vec()));
                }
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(pcap::Error::NoMorePackets) => return None,
                Err(e) => {
                    error!("capture error: {e}");
                    return None;
                }
            }
        }
    }
}
