/*! Per-connection delivery reconstruction.

[TcpFlow] replays one TCP connection's sender-side dynamics from the
captured segments: it keeps the in-flight queue, detects round-trip
boundaries and retransmissions, infers MSS and window scaling when the
handshake was missed, and turns every useful ACK into a [RateSample] in
the style of RFC 8985 / BBR delivery-rate estimation.

The tracker itself draws no conclusions. It reports per-ACK samples,
round-trip closures, slow-start exit and timeout retransmissions through
a [FlowObserver], and asks the observer for the current bandwidth-delay
product, the one piece of downstream knowledge the send-limit heuristics
need.
*/

pub mod filter;
pub mod registry;

use std::collections::VecDeque;

use log::{debug, error, info, warn};

use crate::time::Instant;
use crate::unit::Unit;
use crate::wire::{Ipv4Address, SeqNumber};

const MIN_MSS: u32 = 536;
const MIN_WSC: u32 = 0;
const MAX_WSC: u32 = 7;
/// How far back a retransmit may reach into the in-flight queue before
/// the scan is abandoned. A defense against pathological traces, not a
/// correctness bound.
const MAX_REORDERED: usize = 2000;
/// Samples with a shorter measurement interval carry more timer noise
/// than signal.
const MIN_INTERVAL_MICROS: i64 = 1000;

/// A per-ACK summary of delivery progress.
///
/// Time-typed fields are `None` until the walk over acked records fills
/// them in; a sample whose `prior_time` never became `Some` credited
/// nothing and is discarded.
#[derive(Debug, Clone)]
pub struct RateSample {
    /// Microseconds from the newest acked record's send to this ACK.
    pub rtt: i64,
    pub ack_received_time: Option<Instant>,
    /// Send time of the first record credited by this ACK.
    pub data_sent_time: Option<Instant>,
    /// Bytes per millisecond, which is to say kB/s.
    pub delivery_rate: i64,
    /// The longer of `send_elapsed` and `ack_elapsed`, microseconds.
    pub interval: i64,
    /// Bytes newly delivered by this ACK.
    pub delivered: i64,
    /// The flow's delivered counter when the newest acked record left.
    pub prior_delivered: u64,
    pub prior_time: Option<Instant>,
    pub send_elapsed: i64,
    pub ack_elapsed: i64,
    pub is_sender_limited: bool,
    pub is_receiver_limited: bool,
    pub see_small_unit: bool,
    /// A genuine retransmission was observed since the last sample.
    pub see_rexmit: bool,
}

impl RateSample {
    fn new(see_rexmit: bool) -> RateSample {
        RateSample {
            rtt: -1,
            ack_received_time: None,
            data_sent_time: None,
            delivery_rate: 0,
            interval: -1,
            delivered: 0,
            prior_delivered: 0,
            prior_time: None,
            send_elapsed: -1,
            ack_elapsed: -1,
            is_sender_limited: false,
            is_receiver_limited: false,
            see_small_unit: false,
            see_rexmit,
        }
    }
}

/// Everything the per-round-trip classification pass needs to know about
/// the round that just closed.
#[derive(Debug, Clone, Copy)]
pub struct RoundtripInfo {
    /// The closing ACK's timestamp.
    pub now: Instant,
    /// The previous closing ACK's timestamp (flow creation for the first
    /// round).
    pub last_ack_time: Instant,
    /// Bytes credited by acks during the round, the closing ACK included.
    pub bytes_acked: i64,
    /// Bytes sent within the round-trip window.
    pub flight_size: i32,
    /// The flow's current (possibly inferred) MSS.
    pub mss: u32,
    /// The index of the round being closed.
    pub round: u32,
}

/// The capability surface a flow tracker reports through.
pub trait FlowObserver {
    /// A useful ACK produced a delivery-rate sample. `sack` tells whether
    /// the ACK carried selective-acknowledgement blocks.
    fn on_rate_sample(&mut self, rs: &RateSample, sack: bool, round: u32);

    /// A round trip closed. Not invoked for the very first round.
    fn on_new_roundtrip(&mut self, info: &RoundtripInfo);

    /// The flow left slow start; `when` is the first-sent time of the
    /// flight that stopped growing.
    fn on_quit_slow_start(&mut self, when: Instant, round: u32);

    /// A segment was retransmitted with no ACK seen in between.
    fn on_timeout_rxmit(&mut self, first: Instant, rexmit: Instant, round: u32);

    /// The current bandwidth-delay product estimate, in bytes.
    fn bdp(&self) -> i64;
}

/// One sent-but-unacknowledged segment.
///
/// `delivered_time` doubles as the tombstone: `None` means the record was
/// already credited through a SACK block and must not be counted again by
/// the cumulative ack that eventually sweeps it out.
#[derive(Debug, Clone, Copy)]
struct Sent {
    sequence: SeqNumber,
    length: u32,
    delivered: u64,
    ack_unit_count: u32,
    sent_time: Instant,
    delivered_time: Option<Instant>,
    first_sent_time: Instant,
    is_slow_start: bool,
    is_sender_limited: bool,
    is_receiver_limited: bool,
    is_small_unit: bool,
}

/// The currently open round-trip window.
#[derive(Debug, Clone, Copy, Default)]
struct Roundtrip {
    started: bool,
    start_sequence: SeqNumber,
    end_sequence: SeqNumber,
    see_small_unit: bool,
}

impl Roundtrip {
    fn flight_size(&self) -> i32 {
        debug_assert!(self.started);
        self.end_sequence - self.start_sequence
    }
}

/// Sender-side reconstruction of one TCP connection.
///
/// `src` is always the data-sending direction; the registry hands
/// receiver-to-sender segments to [on_ack_unit] and everything else to
/// [on_data_unit].
///
/// [on_ack_unit]: #method.on_ack_unit
/// [on_data_unit]: #method.on_data_unit
#[derive(Debug)]
pub struct TcpFlow<O> {
    observer: O,

    see_mss: bool,
    see_wsc: bool,
    /// Peer MSS from the receiver SYN, or inferred from traffic.
    mss: u32,
    /// Peer window scale from the receiver SYN, or inferred.
    wsc: u32,

    src_addr: Ipv4Address,
    src_port: u16,
    dst_addr: Ipv4Address,
    dst_port: u16,

    next_send_sequence: SeqNumber,

    /// Number of acks received, duplicate acks included.
    ack_unit_count: u32,
    round_trip_count: u32,
    prev_flight_size: i32,

    delivered: u64,
    delivered_time: Instant,
    first_sent_time: Instant,
    pipe_size: u32,
    recv_window: u32,
    is_slow_start: bool,
    is_sender_limited: bool,
    is_receiver_limited: bool,

    in_flight: VecDeque<Sent>,
    curr_roundtrip: Roundtrip,

    /// Bytes acked since the last round-trip closure.
    round_bytes_acked: i64,
    /// Timestamp of the previous round-trip-closing ACK.
    last_round_close_time: Instant,
    /// Retransmission seen and not yet folded into a rate sample.
    pending_rexmit: bool,
}

impl<O: FlowObserver> TcpFlow<O> {
    /// Create a flow first observed through a sender segment.
    pub fn from_data_unit(u: &Unit, observer: O) -> TcpFlow<O> {
        debug_assert!(!u.is_fin() && !u.is_rst());
        Self::new(
            u,
            observer,
            u.src_addr,
            u.src_port,
            u.dst_addr,
            u.dst_port,
            u.data_sequence,
        )
    }

    /// Create a flow first observed through a receiver SYN; src and dst
    /// are reversed to keep `src` the sending direction.
    pub fn from_ack_unit(u: &Unit, observer: O) -> TcpFlow<O> {
        debug_assert!(u.is_syn());
        Self::new(
            u,
            observer,
            u.dst_addr,
            u.dst_port,
            u.src_addr,
            u.src_port,
            SeqNumber(0),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        u: &Unit,
        observer: O,
        src_addr: Ipv4Address,
        src_port: u16,
        dst_addr: Ipv4Address,
        dst_port: u16,
        next_send_sequence: SeqNumber,
    ) -> TcpFlow<O> {
        TcpFlow {
            observer,
            see_mss: false,
            see_wsc: false,
            mss: MIN_MSS,
            wsc: MIN_WSC,
            src_addr,
            src_port,
            dst_addr,
            dst_port,
            next_send_sequence,
            ack_unit_count: 0,
            round_trip_count: 0,
            prev_flight_size: 0,
            delivered: 0,
            delivered_time: u.when,
            first_sent_time: u.when,
            pipe_size: 0,
            recv_window: 0,
            is_slow_start: true,
            is_sender_limited: false,
            is_receiver_limited: false,
            in_flight: VecDeque::new(),
            curr_roundtrip: Roundtrip::default(),
            round_bytes_acked: 0,
            last_round_close_time: u.when,
            pending_rexmit: false,
        }
    }

    pub fn pipe_size(&self) -> u32 {
        self.pipe_size
    }

    pub fn recv_window(&self) -> u32 {
        self.recv_window
    }

    pub fn mss(&self) -> u32 {
        self.mss
    }

    pub fn roundtrip_count(&self) -> u32 {
        self.round_trip_count
    }

    pub fn src(&self) -> (Ipv4Address, u16) {
        (self.src_addr, self.src_port)
    }

    pub fn dst(&self) -> (Ipv4Address, u16) {
        (self.dst_addr, self.dst_port)
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// Consume the flow, handing its observer back.
    pub fn into_observer(self) -> O {
        self.observer
    }

    /// Process a segment sent by the data direction. The registry only
    /// forwards segments that carry payload, SYN or FIN.
    pub fn on_data_unit(&mut self, u: &Unit) {
        debug_assert_eq!((u.src_addr, u.src_port), (self.src_addr, self.src_port));
        debug_assert_eq!((u.dst_addr, u.dst_port), (self.dst_addr, self.dst_port));
        debug_assert!(u.data_length > 0 || u.is_syn() || u.is_fin());

        if u.is_syn() {
            info!("[{}] sender SYN", self.round_trip_count);
        } else if u.is_fin() {
            info!("[{}] sender FIN", self.round_trip_count);
        }

        self.pre_handle_data_unit(u);
        if self.handle_data_unit(u) {
            self.post_handle_data_unit(u);
        }
    }

    /// Process a segment sent by the acking direction.
    pub fn on_ack_unit(&mut self, u: &Unit) {
        debug_assert_eq!((u.src_addr, u.src_port), (self.dst_addr, self.dst_port));
        debug_assert_eq!((u.dst_addr, u.dst_port), (self.src_addr, self.src_port));
        if !(u.is_syn() || u.is_ack() || u.is_fin()) {
            warn!("[{}] receiver unit with no SYN/ACK/FIN", self.round_trip_count);
            return;
        }

        if u.is_syn() {
            info!("[{}] receiver SYN", self.round_trip_count);
        } else if u.is_fin() {
            info!("[{}] receiver FIN", self.round_trip_count);
        }

        self.pre_handle_ack_unit(u);
        self.handle_ack_unit(u);
    }

    fn is_small_unit(&self, u: &Unit) -> bool {
        !u.is_syn() && !u.is_fin() && u.option_length + u.data_length < self.mss
    }

    fn pre_handle_data_unit(&mut self, u: &Unit) {
        let small_unit = self.is_small_unit(u);
        let pipe_not_full = i64::from(self.pipe_size) < self.observer.bdp() * 9 / 10;

        self.is_receiver_limited = u64::from(self.pipe_size) > u64::from(self.recv_window) * 9 / 10
            || self.recv_window < self.mss;
        self.is_sender_limited = !self.is_receiver_limited && (small_unit || pipe_not_full);

        // continuously estimate the max segment size option if we missed
        // the receiver's SYN
        let data_and_option_len = u.data_length + u.option_length;
        if !self.see_mss && data_and_option_len > self.mss {
            self.mss = data_and_option_len;
        }
    }

    fn handle_data_unit(&mut self, u: &Unit) -> bool {
        // new or idle connection
        if self.pipe_size == 0 {
            self.first_sent_time = u.when;
            self.delivered_time = u.when;
        }

        let p = Sent {
            sequence: u.data_sequence,
            length: u.data_length,
            delivered: self.delivered,
            ack_unit_count: self.ack_unit_count,
            sent_time: u.when,
            delivered_time: Some(self.delivered_time),
            first_sent_time: self.first_sent_time,
            is_slow_start: self.is_slow_start,
            is_sender_limited: self.is_sender_limited,
            is_receiver_limited: self.is_receiver_limited,
            is_small_unit: self.is_small_unit(u),
        };

        if self.next_send_sequence > u.data_sequence {
            // reordering is rare at the sender side, so this should be a
            // retransmission
            debug!("[{}] sender retransmit", self.round_trip_count);

            let mut step = 0;
            let mut scanned_out = true;
            for r in self.in_flight.iter_mut().rev() {
                if r.sequence == u.data_sequence {
                    if r.ack_unit_count == self.ack_unit_count {
                        // no ack in between: a timeout retransmission,
                        // and the sender is back in slow start
                        self.observer
                            .on_timeout_rxmit(r.sent_time, u.when, self.round_trip_count);
                        self.is_slow_start = true;
                    }
                    self.pending_rexmit = true;
                    *r = p;
                    scanned_out = false;
                    break;
                } else if r.sequence < u.data_sequence {
                    error!(
                        "[{}] no matching data unit for rexmit, may be a reordered unit; \
                         please run at the sender side",
                        self.round_trip_count
                    );
                    scanned_out = false;
                    break;
                } else {
                    step += 1;
                    if step >= MAX_REORDERED {
                        warn!(
                            "[{}] backed up too many steps looking for a rexmit, giving up",
                            self.round_trip_count
                        );
                        scanned_out = false;
                        break;
                    }
                }
            }
            if scanned_out {
                warn!("[{}] spurious rexmit", self.round_trip_count);
            }
            false
        } else if self.next_send_sequence < u.data_sequence {
            error!(
                "[{}] found a reordered unit; please run at the sender side",
                self.round_trip_count
            );
            false
        } else {
            self.in_flight.push_back(p);
            true
        }
    }

    fn post_handle_data_unit(&mut self, u: &Unit) {
        self.pipe_size += u.data_length;
        self.next_send_sequence =
            u.data_sequence + (u.data_length + u32::from(u.is_syn()) + u32::from(u.is_fin()));

        if !self.curr_roundtrip.started {
            self.curr_roundtrip.started = true;
            self.curr_roundtrip.start_sequence = u.data_sequence;
            self.curr_roundtrip.see_small_unit = false;
        }

        if self.is_small_unit(u) {
            self.curr_roundtrip.see_small_unit = true;
        }
    }

    fn pre_handle_ack_unit(&mut self, u: &Unit) {
        if u.is_syn() {
            // luckily, we see the options in the receiver's SYN
            self.see_mss = u.mss.is_some();
            self.see_wsc = u.wsc.is_some();
            self.mss = u.mss.map(u32::from).unwrap_or(MIN_MSS);
            self.wsc = u.wsc.map(u32::from).unwrap_or(MIN_WSC);
            if self.wsc > MAX_WSC {
                error!("bad window scale option = {}", self.wsc);
                self.wsc = MAX_WSC;
            }
        }

        if !self.see_wsc {
            // continuously estimate the window scale option if we missed
            // the receiver's SYN
            while self.wsc <= MAX_WSC && self.pipe_size > (u.recv_window << self.wsc) {
                self.wsc += 1;
            }
            if self.wsc > MAX_WSC {
                error!("bad window scale option = {}", self.wsc);
                self.wsc = MAX_WSC;
            }
        }

        self.ack_unit_count += 1;

        // latest receiver window, scaled
        self.recv_window = u.recv_window << self.wsc;
    }

    fn handle_ack_unit(&mut self, u: &Unit) -> bool {
        let mut bytes_acked: u32 = 0;

        // a cumulative ack?
        let mut cum = 0;
        for r in self.in_flight.iter() {
            if r.sequence < u.ack_sequence {
                if r.delivered_time.is_some() {
                    // ensure this unit was not sacked
                    bytes_acked += r.length;
                }
                cum += 1;
            } else {
                break;
            }
        }

        // a selective ack?
        let mut sacked: Vec<usize> = Vec::with_capacity(u.sack.len());
        for block in u.sack.iter() {
            if block.right_edge <= u.ack_sequence {
                debug!(
                    "[{}] SACK block at or below the cumulative ack, dropped",
                    self.round_trip_count
                );
                continue;
            }
            let mut scanned_out = true;
            for (i, r) in self.in_flight.iter().enumerate().skip(cum) {
                if r.sequence >= block.left_edge {
                    if r.sequence < block.right_edge {
                        if r.delivered_time.is_some() {
                            sacked.push(i);
                            bytes_acked += r.length;
                        }
                    } else {
                        scanned_out = false;
                        break;
                    }
                }
            }
            if scanned_out {
                debug!("[{}] SACK block not found in flight", self.round_trip_count);
            }
        }

        // not a cumulative or selective ack
        if cum == 0 && sacked.is_empty() {
            return false;
        }

        debug_assert!(self.pipe_size >= bytes_acked);
        self.pipe_size = self.pipe_size.saturating_sub(bytes_acked);
        self.round_bytes_acked += i64::from(bytes_acked);

        if self.update_roundtrip_count(u) {
            // this ack ends the current round trip; units left in the
            // pipe after it constitute the next round's flight, opened by
            // the next data unit
            debug_assert!(self.curr_roundtrip.started);
            if self.round_trip_count > 0 {
                let info = RoundtripInfo {
                    now: u.when,
                    last_ack_time: self.last_round_close_time,
                    bytes_acked: self.round_bytes_acked,
                    flight_size: self.curr_roundtrip.flight_size(),
                    mss: self.mss,
                    round: self.round_trip_count,
                };
                self.observer.on_new_roundtrip(&info);
            }
            self.round_trip_count += 1;
            self.curr_roundtrip.started = false;
            self.last_round_close_time = u.when;
            self.round_bytes_acked = 0;
        }

        let mut rs = RateSample::new(self.pending_rexmit);

        // cumulatively acked records leave the queue for good
        for _ in 0..cum {
            if let Some(mut p) = self.in_flight.pop_front() {
                Self::update_rate_sample(
                    &mut self.delivered,
                    &mut self.delivered_time,
                    &mut self.first_sent_time,
                    &mut p,
                    u.when,
                    &mut rs,
                );
            }
        }

        // selectively acked records stay as tombstones so later
        // cumulative acks skip them
        for i in sacked {
            if let Some(p) = self.in_flight.get_mut(i - cum) {
                Self::update_rate_sample(
                    &mut self.delivered,
                    &mut self.delivered_time,
                    &mut self.first_sent_time,
                    p,
                    u.when,
                    &mut rs,
                );
            }
        }

        if rs.prior_time.is_none() {
            // nothing actually delivered on this ACK
            return false;
        }

        // use the longer of the send and ack elapsed times
        rs.interval = rs.send_elapsed.max(rs.ack_elapsed);
        rs.delivered = (self.delivered - rs.prior_delivered) as i64;

        if rs.interval < MIN_INTERVAL_MICROS {
            warn!(
                "{}:{} -> {}:{} interval too small, drop",
                self.src_addr, self.src_port, self.dst_addr, self.dst_port
            );
        } else {
            rs.delivery_rate = rs.delivered / (rs.interval / 1000);
            self.pending_rexmit = false;
            self.observer
                .on_rate_sample(&rs, u.is_sack(), self.round_trip_count);
        }
        true
    }

    fn update_roundtrip_count(&mut self, u: &Unit) -> bool {
        if self.curr_roundtrip.started && u.ack_sequence > self.curr_roundtrip.start_sequence {
            self.curr_roundtrip.end_sequence = self.next_send_sequence;

            let curr_flight_size = self.curr_roundtrip.flight_size();
            if !self.curr_roundtrip.see_small_unit
                && self.is_slow_start
                && curr_flight_size < self.prev_flight_size * 3 / 2
            {
                // the flight stopped growing exponentially
                self.is_slow_start = false;
                self.observer
                    .on_quit_slow_start(self.first_sent_time, self.round_trip_count);
                debug!("[{}] quit slow start", self.round_trip_count);
            }
            self.prev_flight_size = curr_flight_size;
            true
        } else {
            false
        }
    }

    fn update_rate_sample(
        delivered: &mut u64,
        delivered_time: &mut Instant,
        first_sent_time: &mut Instant,
        p: &mut Sent,
        ack_when: Instant,
        rs: &mut RateSample,
    ) {
        let Some(prior_time) = p.delivered_time else {
            // already SACKed
            return;
        };

        *delivered += u64::from(p.length);
        *delivered_time = ack_when;

        // update the sample from the newest record seen so far
        if p.delivered >= rs.prior_delivered {
            rs.rtt = (ack_when - p.sent_time).total_micros() as i64;
            if rs.data_sent_time.is_none() {
                rs.data_sent_time = Some(p.sent_time);
            }
            rs.ack_received_time = Some(ack_when);
            rs.prior_delivered = p.delivered;
            rs.prior_time = Some(prior_time);
            rs.send_elapsed = (p.sent_time - p.first_sent_time).total_micros() as i64;
            rs.ack_elapsed = (*delivered_time - prior_time).total_micros() as i64;
            rs.is_sender_limited = p.is_sender_limited;
            rs.is_receiver_limited = p.is_receiver_limited;
            if p.is_small_unit {
                rs.see_small_unit = true;
            }
            *first_sent_time = p.sent_time;
        }

        // mark the record delivered so it is never counted again when a
        // cumulative ack sweeps past it
        p.delivered_time = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::unit::test_support::UnitBuilder;

    #[derive(Debug, PartialEq)]
    enum Event {
        Sample {
            delivered: i64,
            rate: i64,
            rtt: i64,
            sender_limited: bool,
            receiver_limited: bool,
        },
        Roundtrip {
            round: u32,
            flight_size: i32,
            bytes_acked: i64,
        },
        QuitSlowStart,
        TimeoutRxmit,
    }

    /// Records tracker callbacks; `bdp` is fixed per test.
    struct Recorder {
        bdp: i64,
        events: Vec<Event>,
    }

    impl Recorder {
        fn new(bdp: i64) -> Recorder {
            Recorder {
                bdp,
                events: Vec::new(),
            }
        }
    }

    impl FlowObserver for Recorder {
        fn on_rate_sample(&mut self, rs: &RateSample, _sack: bool, _round: u32) {
            self.events.push(Event::Sample {
                delivered: rs.delivered,
                rate: rs.delivery_rate,
                rtt: rs.rtt,
                sender_limited: rs.is_sender_limited,
                receiver_limited: rs.is_receiver_limited,
            });
        }

        fn on_new_roundtrip(&mut self, info: &RoundtripInfo) {
            self.events.push(Event::Roundtrip {
                round: info.round,
                flight_size: info.flight_size,
                bytes_acked: info.bytes_acked,
            });
        }

        fn on_quit_slow_start(&mut self, _when: Instant, _round: u32) {
            self.events.push(Event::QuitSlowStart);
        }

        fn on_timeout_rxmit(&mut self, _first: Instant, _rexmit: Instant, _round: u32) {
            self.events.push(Event::TimeoutRxmit);
        }

        fn bdp(&self) -> i64 {
            self.bdp
        }
    }

    const MSS: u32 = 1460;

    fn handshake_flow(bdp: i64) -> TcpFlow<Recorder> {
        let syn = UnitBuilder::new().syn().seq(0).at(Instant::ZERO).build();
        let mut flow = TcpFlow::from_data_unit(&syn, Recorder::new(bdp));
        flow.on_data_unit(&syn);
        let syn_ack = UnitBuilder::new()
            .reversed()
            .syn()
            .ack_seq(1)
            .mss(MSS as u16)
            .wsc(7)
            .at(Instant::from_micros(10))
            .build();
        flow.on_ack_unit(&syn_ack);
        flow
    }

    fn send_burst(flow: &mut TcpFlow<Recorder>, start_seq: u32, count: u32, at: Instant) {
        for i in 0..count {
            let u = UnitBuilder::new()
                .seq(start_seq + i * MSS)
                .data(MSS)
                .at(at)
                .build();
            flow.on_data_unit(&u);
        }
    }

    #[test]
    fn test_handshake_tracks_options() {
        let flow = handshake_flow(0);
        assert_eq!(flow.mss(), MSS);
        assert_eq!(flow.pipe_size(), 0);
        // 65535 << 7
        assert_eq!(flow.recv_window(), 65535 << 7);
        assert_eq!(flow.roundtrip_count(), 1);
    }

    #[test]
    fn test_pipe_grows_and_drains() {
        let mut flow = handshake_flow(0);
        send_burst(&mut flow, 1, 10, Instant::from_millis(1));
        assert_eq!(flow.pipe_size(), 10 * MSS);

        let ack = UnitBuilder::new()
            .reversed()
            .ack_seq(1 + 10 * MSS)
            .at(Instant::from_millis(51))
            .build();
        flow.on_ack_unit(&ack);
        assert_eq!(flow.pipe_size(), 0);
    }

    #[test]
    fn test_bulk_round_produces_one_sample_and_roundtrip() {
        let mut flow = handshake_flow(0);
        send_burst(&mut flow, 1, 10, Instant::from_millis(1));
        let ack = UnitBuilder::new()
            .reversed()
            .ack_seq(1 + 10 * MSS)
            .at(Instant::from_millis(51))
            .build();
        flow.on_ack_unit(&ack);

        let events = &flow.observer().events;
        // round 1 closes (the handshake was round 0), then one sample
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            Event::Roundtrip {
                round: 1,
                flight_size: (10 * MSS) as i32,
                bytes_acked: (10 * MSS) as i64,
            }
        );
        match events[1] {
            Event::Sample {
                delivered,
                rate,
                rtt,
                ..
            } => {
                assert_eq!(delivered, (10 * MSS) as i64);
                // 14600 bytes over a 50ms ack interval
                assert_eq!(rtt, 50_000);
                assert_eq!(rate, 14600 / 50);
            }
            _ => panic!("expected a rate sample"),
        }
        assert_eq!(flow.roundtrip_count(), 2);
    }

    #[test]
    fn test_sample_dropped_when_interval_too_small() {
        let mut flow = handshake_flow(0);
        send_burst(&mut flow, 1, 2, Instant::from_millis(1));
        // acked 500us after sending: below the measurement floor
        let ack = UnitBuilder::new()
            .reversed()
            .ack_seq(1 + 2 * MSS)
            .at(Instant::from_micros(1500))
            .build();
        flow.on_ack_unit(&ack);

        assert!(!flow
            .observer()
            .events
            .iter()
            .any(|e| matches!(e, Event::Sample { .. })));
    }

    #[test]
    fn test_receiver_limited_when_window_small() {
        let syn = UnitBuilder::new().syn().seq(0).build();
        let mut flow = TcpFlow::from_data_unit(&syn, Recorder::new(0));
        flow.on_data_unit(&syn);
        // receiver advertises a single-MSS window, unscaled
        let syn_ack = UnitBuilder::new()
            .reversed()
            .syn()
            .ack_seq(1)
            .mss(MSS as u16)
            .wsc(0)
            .window(MSS)
            .at(Instant::from_micros(10))
            .build();
        flow.on_ack_unit(&syn_ack);

        send_burst(&mut flow, 1, 10, Instant::from_millis(1));
        let ack = UnitBuilder::new()
            .reversed()
            .window(MSS)
            .ack_seq(1 + 10 * MSS)
            .at(Instant::from_millis(51))
            .build();
        flow.on_ack_unit(&ack);

        let sample = flow
            .observer()
            .events
            .iter()
            .find(|e| matches!(e, Event::Sample { .. }));
        match sample {
            Some(Event::Sample {
                receiver_limited, ..
            }) => assert!(receiver_limited),
            _ => panic!("expected a rate sample"),
        }
    }

    #[test]
    fn test_timeout_rexmit_detected() {
        let mut flow = handshake_flow(0);
        send_burst(&mut flow, 1, 4, Instant::from_millis(1));

        // same first sequence again, no ack in between
        let rexmit = UnitBuilder::new()
            .seq(1)
            .data(MSS)
            .at(Instant::from_millis(201))
            .build();
        flow.on_data_unit(&rexmit);

        assert!(flow.observer().events.contains(&Event::TimeoutRxmit));
        // pipe must not double-count the retransmitted segment
        assert_eq!(flow.pipe_size(), 4 * MSS);
    }

    #[test]
    fn test_rexmit_after_ack_is_not_timeout() {
        let mut flow = handshake_flow(0);
        send_burst(&mut flow, 1, 4, Instant::from_millis(1));
        // a duplicate ack moves ack_unit_count forward
        let dup_ack = UnitBuilder::new()
            .reversed()
            .ack_seq(1)
            .at(Instant::from_millis(30))
            .build();
        flow.on_ack_unit(&dup_ack);

        let rexmit = UnitBuilder::new()
            .seq(1)
            .data(MSS)
            .at(Instant::from_millis(31))
            .build();
        flow.on_data_unit(&rexmit);

        assert!(!flow.observer().events.contains(&Event::TimeoutRxmit));
    }

    #[test]
    fn test_sack_tombstone_not_double_counted() {
        let mut flow = handshake_flow(0);
        send_burst(&mut flow, 1, 4, Instant::from_millis(1));

        // SACK the second segment
        let sack = UnitBuilder::new()
            .reversed()
            .ack_seq(1)
            .sack(1 + MSS, 1 + 2 * MSS)
            .at(Instant::from_millis(26))
            .build();
        flow.on_ack_unit(&sack);
        assert_eq!(flow.pipe_size(), 3 * MSS);

        // the cumulative ack that sweeps past it must only credit the
        // other three segments
        let ack = UnitBuilder::new()
            .reversed()
            .ack_seq(1 + 4 * MSS)
            .at(Instant::from_millis(51))
            .build();
        flow.on_ack_unit(&ack);
        // the tombstone is skipped by the sweep: crediting it again would
        // underflow the pipe
        assert_eq!(flow.pipe_size(), 0);

        // each sample's delivered counts from the newest acked record's
        // send-time snapshot, so the second one spans the SACK credit too
        let delivered: Vec<i64> = flow
            .observer()
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Sample { delivered, .. } => Some(*delivered),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![i64::from(MSS), i64::from(4 * MSS)]);
    }

    #[test]
    fn test_quit_slow_start_when_flight_stops_growing() {
        let mut flow = handshake_flow(0);

        // two rounds of identical flight size: growth below 3/2
        send_burst(&mut flow, 1, 4, Instant::from_millis(1));
        let ack = UnitBuilder::new()
            .reversed()
            .ack_seq(1 + 4 * MSS)
            .at(Instant::from_millis(51))
            .build();
        flow.on_ack_unit(&ack);

        send_burst(&mut flow, 1 + 4 * MSS, 4, Instant::from_millis(52));
        let ack = UnitBuilder::new()
            .reversed()
            .ack_seq(1 + 8 * MSS)
            .at(Instant::from_millis(101))
            .build();
        flow.on_ack_unit(&ack);

        assert!(flow.observer().events.contains(&Event::QuitSlowStart));
    }

    #[test]
    fn test_mss_inferred_without_handshake() {
        // first observation is a data segment: no receiver SYN seen
        let data = UnitBuilder::new().seq(0).data(1448).build();
        let mut flow = TcpFlow::from_data_unit(&data, Recorder::new(0));
        flow.on_data_unit(&data);
        assert_eq!(flow.mss(), 1448);
    }

    #[test]
    fn test_wsc_inferred_from_pipe() {
        let data = UnitBuilder::new().seq(0).data(1448).build();
        let mut flow = TcpFlow::from_data_unit(&data, Recorder::new(0));
        flow.on_data_unit(&data);
        for i in 1..64u32 {
            let u = UnitBuilder::new().seq(i * 1448).data(1448).build();
            flow.on_data_unit(&u);
        }
        // 64 * 1448 = 92672 in flight; a raw window of 1500 forces the
        // scale up to 1500 << 6
        let ack = UnitBuilder::new()
            .reversed()
            .window(1500)
            .ack_seq(1448)
            .at(Instant::from_millis(50))
            .build();
        flow.on_ack_unit(&ack);
        assert_eq!(flow.recv_window(), 1500 << 6);
    }

    #[test]
    fn test_reordered_unit_dropped() {
        let mut flow = handshake_flow(0);
        send_burst(&mut flow, 1, 2, Instant::from_millis(1));
        // a sequence from the future: observer is on the wrong side
        let reordered = UnitBuilder::new()
            .seq(1 + 5 * MSS)
            .data(MSS)
            .at(Instant::from_millis(2))
            .build();
        flow.on_data_unit(&reordered);
        assert_eq!(flow.pipe_size(), 2 * MSS);
    }

    #[test]
    fn test_invariants_under_random_lossless_trace() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let mut flow = handshake_flow(0);

        let mut seq = 1u32;
        let mut when = 1_000i64;
        let mut last_delivered = 0i64;
        for _ in 0..200 {
            let burst = rng.gen_range(1..8u32);
            let mut sent = Vec::new();
            for _ in 0..burst {
                let len = rng.gen_range(1..=MSS);
                let u = UnitBuilder::new()
                    .seq(seq)
                    .data(len)
                    .at(Instant::from_micros(when))
                    .build();
                flow.on_data_unit(&u);
                sent.push(len);
                seq = seq.wrapping_add(len);
                when += 100;
            }

            // I2: the pipe equals what is outstanding
            let outstanding: u32 = sent.iter().sum();
            assert_eq!(flow.pipe_size(), outstanding);

            when += rng.gen_range(2_000..20_000);
            let ack = UnitBuilder::new()
                .reversed()
                .ack_seq(seq)
                .at(Instant::from_micros(when))
                .build();
            flow.on_ack_unit(&ack);
            assert_eq!(flow.pipe_size(), 0);

            // I3: delivery totals never move backwards
            let delivered: i64 = flow
                .observer()
                .events
                .iter()
                .filter_map(|e| match e {
                    Event::Sample { delivered, .. } => Some(*delivered),
                    _ => None,
                })
                .sum();
            assert!(delivered >= last_delivered);
            last_delivered = delivered;
        }
    }
}
