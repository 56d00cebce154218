/*! Per-round-trip throughput-limit classification.

The [Analyzer] sits behind a flow tracker as its [FlowObserver]. Every
rate sample casts one vote for what limited the sender at the moment the
sampled data left; every round-trip closure counts the ballot, applies a
handful of overrides for evidence the votes cannot see (ack spacing,
retransmissions, flight-size history), prints the verdict, and folds the
round into per-category totals that the driver flushes when the flow
dies.

[FlowObserver]: ../flow/trait.FlowObserver.html
*/

use core::fmt;

use log::debug;

use crate::flow::filter::WindowedMaxFilter;
use crate::flow::{FlowObserver, RateSample, RoundtripInfo};
use crate::time::Instant;

/// rtprop evidence goes stale after this long without a new minimum.
const RTPROP_EXPIRATION_MICROS: i64 = 30 * 1_000_000;
/// Bandwidth filter window, in round trips.
const BANDWIDTH_WINDOW: u32 = 10;

/// One vote bucket per limiting regime. Ties break toward the earlier
/// variant; `Unknown` can only win an empty ballot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Limit {
    SlowStart,
    Bandwidth,
    Sender,
    Receiver,
    Congestion,
    Unknown,
}

const N_LIMITS: usize = 6;

/// Accumulator categories, in the order summary rows are printed.
/// `Sender` verdicts split into application, send-buffer and
/// congestion-control-limited; `Unknown` rounds are not accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    SlowStart,
    Application,
    SendBuffer,
    Cc,
    ReceiveWindow,
    Bandwidth,
    Congestion,
    BufferBloat,
}

pub const N_CATEGORIES: usize = 8;

/// Per-flow duration/byte/round totals for each [Category].
#[derive(Debug, Clone, Default)]
pub struct LimitTotals {
    pub duration_ms: [i64; N_CATEGORIES],
    pub bytes: [i64; N_CATEGORIES],
    pub count: [u32; N_CATEGORIES],
}

impl LimitTotals {
    fn account(&mut self, category: Category, duration_ms: i64, bytes: i64) {
        let i = category as usize;
        self.duration_ms[i] += duration_ms;
        self.bytes[i] += bytes;
        self.count[i] += 1;
    }
}

impl fmt::Display for LimitTotals {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for v in self.duration_ms.iter() {
            write!(f, "{v} ")?;
        }
        for v in self.bytes.iter() {
            write!(f, "{v} ")?;
        }
        for (i, v) in self.count.iter().enumerate() {
            if i + 1 < N_CATEGORIES {
                write!(f, "{v} ")?;
            } else {
                write!(f, "{v}")?;
            }
        }
        Ok(())
    }
}

/// Format a capture timestamp as a UTC time of day, `hh:mm:ss.uuuuuu`.
fn time_of_day(t: Instant) -> String {
    let micros = t.total_micros().rem_euclid(1_000_000);
    let secs = t.total_micros().div_euclid(1_000_000).rem_euclid(86_400);
    format!(
        "{:02}:{:02}:{:02}.{:06}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        micros
    )
}

/// The per-flow classifier.
pub struct Analyzer {
    dst_port: u16,

    bandwidth_filter: WindowedMaxFilter,
    /// Round-trip propagation delay estimate, microseconds; negative
    /// until the first sample.
    rtprop: i64,
    rtprop_timestamp: Option<Instant>,

    votes: [u32; N_LIMITS],

    small_unit_count: u32,
    prev_small_unit_count: u32,
    max_delivery_rate: i64,
    rtt_too_long_count: u32,
    rtt_huge_count: u32,
    /// Valid-RTT samples this round.
    ack_count: u32,
    see_rexmit: bool,
    /// First ack time in this round trip.
    first_ack_time: Option<Instant>,

    is_slow_start: bool,
    slow_start_quit_time: Option<Instant>,

    /// The last three closed rounds' flight sizes, oldest first.
    prev_flight_size: [i32; 3],

    totals: LimitTotals,
}

impl Analyzer {
    pub fn new(dst_port: u16) -> Analyzer {
        Analyzer {
            dst_port,
            bandwidth_filter: WindowedMaxFilter::new(BANDWIDTH_WINDOW),
            rtprop: -1,
            rtprop_timestamp: None,
            votes: [0; N_LIMITS],
            small_unit_count: 0,
            prev_small_unit_count: 0,
            max_delivery_rate: 0,
            rtt_too_long_count: 0,
            rtt_huge_count: 0,
            ack_count: 0,
            see_rexmit: false,
            first_ack_time: None,
            is_slow_start: true,
            slow_start_quit_time: None,
            prev_flight_size: [0; 3],
            totals: LimitTotals::default(),
        }
    }

    /// Estimated bottleneck bandwidth, kB/s.
    pub fn btlbw(&self) -> i64 {
        self.bandwidth_filter.best()
    }

    /// The per-category totals accumulated so far; the driver prints this
    /// as the flow's summary row.
    pub fn summary(&self) -> &LimitTotals {
        &self.totals
    }

    fn count_votes(&self) -> Limit {
        const BALLOT: [Limit; 5] = [
            Limit::SlowStart,
            Limit::Bandwidth,
            Limit::Sender,
            Limit::Receiver,
            Limit::Congestion,
        ];
        let mut ret = Limit::SlowStart;
        for &limit in &BALLOT[1..] {
            if self.votes[limit as usize] > self.votes[ret as usize] {
                ret = limit;
            }
        }

        if self.is_slow_start {
            return Limit::SlowStart;
        }
        if self.votes[ret as usize] == 0 {
            Limit::Unknown
        } else {
            ret
        }
    }

    /// Retransmissions alongside stretched RTTs, or a majority of
    /// stretched RTTs, point at queueing rather than the sender.
    fn congestion_evidence(&self) -> bool {
        (self.rtt_too_long_count > 0 && self.see_rexmit)
            || self.rtt_too_long_count > self.ack_count / 2
    }

    fn reset_round(&mut self, flight_size: i32) {
        self.votes = [0; N_LIMITS];
        self.prev_small_unit_count = self.small_unit_count;
        self.small_unit_count = 0;
        self.max_delivery_rate = 0;
        self.prev_flight_size = [
            self.prev_flight_size[1],
            self.prev_flight_size[2],
            flight_size,
        ];
        self.rtt_too_long_count = 0;
        self.rtt_huge_count = 0;
        self.ack_count = 0;
        self.see_rexmit = false;
        self.first_ack_time = None;
    }

    /// Split a sender-limited verdict by what the flight-size history
    /// suggests: a flight frozen at the same size for three rounds reads
    /// as a full send buffer, a moving flight with back-to-back full-MSS
    /// rounds reads as congestion control holding the sender back, and
    /// everything else as the application not producing data.
    fn label_sender(&self, info: &RoundtripInfo) -> (&'static str, Category) {
        let diffs = self
            .prev_flight_size
            .map(|prev| (info.flight_size - prev).unsigned_abs());
        let all_zero = diffs.iter().all(|&d| d == 0);

        if info.flight_size > info.mss as i32
            && (self.prev_small_unit_count == 0 || self.small_unit_count == 0 || all_zero)
        {
            if all_zero {
                ("(buffer)[kernel limited]", Category::SendBuffer)
            } else {
                ("(cc)[kernel limited]", Category::Cc)
            }
        } else {
            ("[application limited]", Category::Application)
        }
    }
}

impl FlowObserver for Analyzer {
    fn on_rate_sample(&mut self, rs: &RateSample, sack: bool, round: u32) {
        let Some(ack_time) = rs.ack_received_time else {
            return;
        };

        // an RTT measured across a retransmission or reported by a SACK
        // only counts when it is above the floor we already trust
        let rtt_is_valid = (!rs.see_rexmit && !sack) || rs.rtt > self.rtprop;

        if rtt_is_valid {
            self.ack_count += 1;
        }

        let expired = self
            .rtprop_timestamp
            .map_or(true, |at| (ack_time - at).total_micros() as i64 >= RTPROP_EXPIRATION_MICROS);
        if self.rtprop < 0 || (rtt_is_valid && self.rtprop > rs.rtt) || expired {
            self.rtprop = rs.rtt;
            self.rtprop_timestamp = Some(ack_time);
            debug!("[{round}] [update delay] {}us", self.rtprop);
        }

        if self.first_ack_time.is_none() {
            self.first_ack_time = Some(ack_time);
        }

        let btlbw = self.bandwidth_filter.best();

        if rs.see_small_unit {
            self.small_unit_count += 1;
        }
        if self.max_delivery_rate < rs.delivery_rate {
            self.max_delivery_rate = rs.delivery_rate;
        }
        if rs.see_rexmit || sack {
            self.see_rexmit = true;
        }

        let rtt_too_long = rtt_is_valid && rs.rtt > self.rtprop * 7 / 5;
        if rtt_too_long {
            self.rtt_too_long_count += 1;
        }
        if rtt_is_valid && rs.rtt > self.rtprop * 5 / 2 {
            self.rtt_huge_count += 1;
        }

        // only credible measurements may raise the bandwidth estimate
        if rs.delivery_rate >= btlbw
            || rtt_too_long
            || (!rs.is_sender_limited && !rs.is_receiver_limited)
        {
            self.bandwidth_filter.update(rs.delivery_rate, round);
        }

        let vote = if rs.is_receiver_limited {
            Limit::Receiver
        } else if rs.is_sender_limited {
            Limit::Sender
        } else if self.is_slow_start
            || matches!(
                (self.slow_start_quit_time, rs.data_sent_time),
                (Some(quit), Some(sent)) if quit >= sent
            )
        {
            Limit::SlowStart
        } else if rs.delivery_rate >= btlbw * 4 / 5 {
            Limit::Bandwidth
        } else if rtt_too_long {
            Limit::Congestion
        } else {
            Limit::Unknown
        };
        self.votes[vote as usize] += 1;

        debug!(
            "[{round}] delivery rate: {} rtt: {} max rate: {}",
            rs.delivery_rate, rs.rtt, self.max_delivery_rate
        );
    }

    fn on_new_roundtrip(&mut self, info: &RoundtripInfo) {
        debug!(
            "[{}] slow start: {} bandwidth: {} sender: {} receiver: {} congestion: {} unknown: {}",
            info.round,
            self.votes[Limit::SlowStart as usize],
            self.votes[Limit::Bandwidth as usize],
            self.votes[Limit::Sender as usize],
            self.votes[Limit::Receiver as usize],
            self.votes[Limit::Congestion as usize],
            self.votes[Limit::Unknown as usize],
        );

        let Some(first_ack_time) = self.first_ack_time else {
            // no sample landed this round; leave the ballot for the next
            return;
        };

        let total: u32 = self.votes.iter().sum();
        let duration_ms = (info.now - first_ack_time).total_micros() as i64 / 1000;

        // every trusted RTT blown past 5/2 of the floor: the path queue
        // ate the whole round
        if self.ack_count > 0 && self.rtt_huge_count == self.ack_count {
            self.emit(info, first_ack_time, "[buffer bloat]", self.rtt_huge_count, total);
            self.totals
                .account(Category::BufferBloat, duration_ms, info.bytes_acked);
            self.reset_round(info.flight_size);
            return;
        }

        let mut verdict = self.count_votes();

        if self.votes[Limit::Receiver as usize] > 0 {
            // any receiver-limited evidence wins outright
            verdict = Limit::Receiver;
        } else if verdict == Limit::Bandwidth || verdict == Limit::Unknown {
            // acks spread much wider than the propagation delay say the
            // flights were not back-to-back after all
            let segments = (info.bytes_acked + i64::from(info.mss)) / i64::from(info.mss);
            let spacing = (info.now - info.last_ack_time).total_micros() as i64 / segments;
            if spacing * 20 > self.rtprop {
                verdict = if self.congestion_evidence() {
                    Limit::Congestion
                } else {
                    Limit::Sender
                };
            }
        } else if verdict == Limit::Sender {
            if self.congestion_evidence() {
                verdict = Limit::Congestion;
            }
        } else if self.small_unit_count > 0 && verdict == Limit::SlowStart {
            // short writes during slow start are the application's doing
            verdict = Limit::Sender;
        }

        let wins = self.votes[verdict as usize];
        let (label, category) = match verdict {
            Limit::SlowStart => ("[slow start]", Some(Category::SlowStart)),
            Limit::Bandwidth => ("[bandwidth limited]", Some(Category::Bandwidth)),
            Limit::Sender => {
                let (label, category) = self.label_sender(info);
                (label, Some(category))
            }
            Limit::Receiver => ("[receiver limited]", Some(Category::ReceiveWindow)),
            Limit::Congestion => ("[congestion limited]", Some(Category::Congestion)),
            Limit::Unknown => ("[unknown limited]", None),
        };

        self.emit(info, first_ack_time, label, wins, total);
        if let Some(category) = category {
            self.totals.account(category, duration_ms, info.bytes_acked);
        }
        self.reset_round(info.flight_size);
    }

    fn on_quit_slow_start(&mut self, when: Instant, round: u32) {
        self.is_slow_start = false;
        self.slow_start_quit_time = Some(when);
        println!(
            "[{}] {}kB/s {}us {} [quit slow start]",
            round,
            self.bandwidth_filter.best(),
            self.rtprop,
            time_of_day(when),
        );
    }

    fn on_timeout_rxmit(&mut self, first: Instant, rexmit: Instant, round: u32) {
        println!(
            "[{}] {}kB/s {}us {} -> {} [timeout rexmit]",
            round,
            self.bandwidth_filter.best(),
            self.rtprop,
            time_of_day(first),
            time_of_day(rexmit),
        );
    }

    fn bdp(&self) -> i64 {
        // negative rtprop truncates to zero milliseconds
        (self.rtprop / 1000) * self.bandwidth_filter.best()
    }
}

impl Analyzer {
    fn emit(
        &self,
        info: &RoundtripInfo,
        first_ack_time: Instant,
        label: &str,
        wins: u32,
        total: u32,
    ) {
        println!(
            "[{}] [{}] {}kB/s {}us {} -> {} {} ({}/{})",
            info.round,
            self.dst_port,
            self.bandwidth_filter.best(),
            self.rtprop,
            time_of_day(first_ack_time),
            time_of_day(info.now),
            label,
            wins,
            total,
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample(rtt: i64, rate: i64, at: Instant) -> RateSample {
        RateSample {
            rtt,
            ack_received_time: Some(at),
            data_sent_time: Some(at - crate::time::Duration::from_micros(rtt as u64)),
            delivery_rate: rate,
            interval: rtt.max(1000),
            delivered: rate * (rtt.max(1000) / 1000),
            prior_delivered: 0,
            prior_time: Some(Instant::ZERO),
            send_elapsed: rtt,
            ack_elapsed: rtt,
            is_sender_limited: false,
            is_receiver_limited: false,
            see_small_unit: false,
            see_rexmit: false,
        }
    }

    fn roundtrip_info(round: u32, at: Instant) -> RoundtripInfo {
        RoundtripInfo {
            now: at,
            last_ack_time: at - crate::time::Duration::from_millis(50),
            bytes_acked: 14600,
            flight_size: 14600,
            mss: 1460,
            round,
        }
    }

    #[test]
    fn test_rtprop_tracks_minimum() {
        let mut analyzer = Analyzer::new(80);
        analyzer.on_rate_sample(&sample(50_000, 300, Instant::from_millis(50)), false, 0);
        assert_eq!(analyzer.rtprop, 50_000);
        analyzer.on_rate_sample(&sample(40_000, 300, Instant::from_millis(100)), false, 0);
        assert_eq!(analyzer.rtprop, 40_000);
        // a larger sample does not raise the floor...
        analyzer.on_rate_sample(&sample(60_000, 300, Instant::from_millis(150)), false, 0);
        assert_eq!(analyzer.rtprop, 40_000);
        // ...until the evidence has expired
        analyzer.on_rate_sample(&sample(60_000, 300, Instant::from_secs(35)), false, 0);
        assert_eq!(analyzer.rtprop, 60_000);
    }

    #[test]
    fn test_bdp_is_rtprop_times_btlbw() {
        let mut analyzer = Analyzer::new(80);
        assert_eq!(analyzer.bdp(), 0);
        analyzer.on_rate_sample(&sample(50_000, 300, Instant::from_millis(50)), false, 0);
        assert_eq!(analyzer.btlbw(), 300);
        assert_eq!(analyzer.bdp(), 50 * 300);
    }

    #[test]
    fn test_slow_start_round_accumulates() {
        let mut analyzer = Analyzer::new(80);
        analyzer.on_rate_sample(&sample(50_000, 300, Instant::from_millis(50)), false, 1);
        analyzer.on_new_roundtrip(&roundtrip_info(1, Instant::from_millis(100)));

        assert_eq!(analyzer.summary().count[Category::SlowStart as usize], 1);
        assert_eq!(analyzer.summary().bytes[Category::SlowStart as usize], 14600);
        // the ballot is cleared for the next round
        assert_eq!(analyzer.votes, [0; N_LIMITS]);
        assert_eq!(analyzer.ack_count, 0);
    }

    #[test]
    fn test_round_without_samples_not_accounted() {
        let mut analyzer = Analyzer::new(80);
        analyzer.on_new_roundtrip(&roundtrip_info(1, Instant::from_millis(100)));
        assert_eq!(analyzer.summary().count.iter().sum::<u32>(), 0);
    }

    #[test]
    fn test_buffer_bloat_round() {
        let mut analyzer = Analyzer::new(80);
        // establish the floor, close the round
        analyzer.on_rate_sample(&sample(10_000, 300, Instant::from_millis(10)), false, 1);
        analyzer.on_new_roundtrip(&roundtrip_info(1, Instant::from_millis(20)));
        analyzer.on_quit_slow_start(Instant::from_millis(20), 1);

        // every trusted RTT in the next round is over 5/2 the floor
        analyzer.on_rate_sample(&sample(30_000, 300, Instant::from_millis(60)), false, 2);
        analyzer.on_rate_sample(&sample(35_000, 300, Instant::from_millis(70)), false, 2);
        analyzer.on_new_roundtrip(&roundtrip_info(2, Instant::from_millis(80)));

        assert_eq!(analyzer.summary().count[Category::BufferBloat as usize], 1);
        assert!(analyzer.summary().duration_ms[Category::BufferBloat as usize] > 0);
    }

    #[test]
    fn test_receiver_vote_wins_outright() {
        let mut analyzer = Analyzer::new(80);
        analyzer.on_quit_slow_start(Instant::ZERO, 0);
        for _ in 0..5 {
            analyzer.on_rate_sample(&sample(50_000, 300, Instant::from_millis(50)), false, 1);
        }
        let mut receiver_limited = sample(50_000, 300, Instant::from_millis(55));
        receiver_limited.is_receiver_limited = true;
        analyzer.on_rate_sample(&receiver_limited, false, 1);

        analyzer.on_new_roundtrip(&roundtrip_info(1, Instant::from_millis(100)));
        assert_eq!(analyzer.summary().count[Category::ReceiveWindow as usize], 1);
    }

    #[test]
    fn test_steady_flight_reads_as_send_buffer() {
        let mut analyzer = Analyzer::new(80);
        analyzer.on_quit_slow_start(Instant::ZERO, 0);

        // four rounds with the identical flight size, all sender-limited
        for round in 1..=4 {
            let mut rs = sample(50_000, 300, Instant::from_millis(round as i64 * 50));
            rs.is_sender_limited = true;
            analyzer.on_rate_sample(&rs, false, round);
            analyzer.on_new_roundtrip(&roundtrip_info(
                round,
                Instant::from_millis(round as i64 * 50 + 25),
            ));
        }
        // the first rounds see a changing history; the last one has three
        // identical predecessors
        assert_eq!(analyzer.summary().count[Category::SendBuffer as usize], 1);
    }

    #[test]
    fn test_unknown_round_not_accumulated() {
        let mut analyzer = Analyzer::new(80);
        analyzer.on_quit_slow_start(Instant::ZERO, 0);
        // establish the floor and a 300kB/s bandwidth estimate
        analyzer.on_rate_sample(&sample(10_000, 300, Instant::from_millis(10)), false, 1);
        analyzer.on_new_roundtrip(&roundtrip_info(1, Instant::from_millis(20)));
        let before: u32 = analyzer.summary().count.iter().sum();

        // an unremarkable sample: rate well under the estimate, RTT under
        // the stretch threshold, no limits seen
        analyzer.on_rate_sample(&sample(12_000, 100, Instant::from_millis(100)), false, 2);
        // tight ack spacing keeps the spread-out override away
        let mut info = roundtrip_info(2, Instant::from_millis(110));
        info.last_ack_time = Instant::from_millis(109);
        analyzer.on_new_roundtrip(&info);

        let after: u32 = analyzer.summary().count.iter().sum();
        assert_eq!(after, before);
    }

    #[test]
    fn test_time_of_day_format() {
        let t = Instant::from_micros((13i64 * 3600 + 5 * 60 + 7) * 1_000_000 + 42);
        assert_eq!(time_of_day(t), "13:05:07.000042");
    }
}
