//! CUBIC congestion control, Chromium lineage.

use std::time::{Duration, Instant};

use tracing::trace;

use super::{RttStats, SendAlgorithm};
use crate::protocol::{
    ByteCount, PacketNumber, DEFAULT_MAX_CONGESTION_WINDOW, DEFAULT_TCP_MSS,
    INITIAL_CONGESTION_WINDOW,
};

/// 1024*1024^3; the first 1024 comes from the 100ms scaling round trip.
const CUBE_SCALE: u32 = 40;
const CUBE_CONGESTION_WINDOW_SCALE: u64 = 410;
const CUBE_FACTOR: u64 = (1 << CUBE_SCALE) / CUBE_CONGESTION_WINDOW_SCALE;

/// Emulated TCP flows per connection; CUBIC's fairness knob.
const NUM_CONNECTIONS: u64 = 2;
/// Default multiplicative decrease on loss.
const BETA: f64 = 0.7;
/// Extra backoff when a loss hits below the previous maximum, speeding up
/// convergence against new flows.
const BETA_LAST_MAX: f64 = 0.85;

const MIN_CONGESTION_WINDOW: ByteCount = 2;

/// Cwnd growth curve between loss events. Window arithmetic is in packets.
#[derive(Debug, Default)]
struct Cubic {
    epoch: Option<Instant>,
    last_max_congestion_window: ByteCount,
    acked_packets_count: u64,
    estimated_tcp_congestion_window: ByteCount,
    origin_point_congestion_window: ByteCount,
    /// Time to the curve's origin in 2^10 fractions of a second.
    time_to_origin_point: u64,
    last_target_congestion_window: ByteCount,
}

impl Cubic {
    fn reset(&mut self) {
        *self = Self::default();
    }

    /// β with the emulated-connections correction applied.
    fn beta(&self) -> f64 {
        (NUM_CONNECTIONS as f64 - 1.0 + BETA) / NUM_CONNECTIONS as f64
    }

    /// Reno-equivalent additive increase per congestion window of acks.
    fn alpha(&self) -> f64 {
        let beta = self.beta();
        3.0 * NUM_CONNECTIONS as f64 * NUM_CONNECTIONS as f64 * (1.0 - beta) / (1.0 + beta)
    }

    fn congestion_window_after_packet_loss(&mut self, current: ByteCount) -> ByteCount {
        if current < self.last_max_congestion_window {
            self.last_max_congestion_window =
                (BETA_LAST_MAX * current as f64) as ByteCount;
        } else {
            self.last_max_congestion_window = current;
        }
        self.epoch = None;
        (current as f64 * self.beta()) as ByteCount
    }

    fn congestion_window_after_ack(
        &mut self,
        now: Instant,
        current: ByteCount,
        delay_min: Duration,
    ) -> ByteCount {
        self.acked_packets_count += 1;

        if self.epoch.is_none() {
            // First ack after a loss event or a reset: restart the epoch.
            self.epoch = Some(now);
            self.acked_packets_count = 1;
            self.estimated_tcp_congestion_window = current;
            if self.last_max_congestion_window <= current {
                self.time_to_origin_point = 0;
                self.origin_point_congestion_window = current;
            } else {
                self.time_to_origin_point = ((CUBE_FACTOR
                    * (self.last_max_congestion_window - current))
                    as f64)
                    .cbrt() as u64;
                self.origin_point_congestion_window = self.last_max_congestion_window;
            }
        }

        let elapsed =
            (((now + delay_min - self.epoch.unwrap()).as_millis() as u64) << 10) / 1000;
        let offset = self.time_to_origin_point.abs_diff(elapsed);
        let delta = (CUBE_CONGESTION_WINDOW_SCALE * offset * offset * offset) >> CUBE_SCALE;
        let target = if elapsed > self.time_to_origin_point {
            self.origin_point_congestion_window + delta
        } else {
            self.origin_point_congestion_window.saturating_sub(delta)
        };

        // TCP-friendly region: grow at least as fast as emulated Reno.
        self.estimated_tcp_congestion_window += (self.acked_packets_count as f64 * self.alpha()
            / self.estimated_tcp_congestion_window as f64)
            as ByteCount;
        self.acked_packets_count = 0;

        self.last_target_congestion_window = target;
        target.max(self.estimated_tcp_congestion_window)
    }
}

/// Detects the end of the slow-start phase from RTT inflation, per the
/// HyStart algorithm.
#[derive(Debug, Default)]
struct HybridSlowStart {
    end_packet_number: PacketNumber,
    last_sent_packet_number: PacketNumber,
    started: bool,
    current_min_rtt: Duration,
    rtt_sample_count: u32,
    hystart_found: bool,
}

/// Samples examined per round before drawing a conclusion.
const HYBRID_START_MIN_SAMPLES: u32 = 8;
/// Slow start is never exited below this window (in packets).
const HYBRID_START_LOW_WINDOW: ByteCount = 16;
const HYBRID_START_DELAY_MIN_THRESHOLD: Duration = Duration::from_millis(4);
const HYBRID_START_DELAY_MAX_THRESHOLD: Duration = Duration::from_millis(16);

impl HybridSlowStart {
    fn on_packet_sent(&mut self, packet_number: PacketNumber) {
        self.last_sent_packet_number = packet_number;
    }

    fn on_packet_acked(&mut self, acked: PacketNumber) {
        if self.is_end_of_round(acked) {
            self.started = false;
        }
    }

    fn is_end_of_round(&self, ack: PacketNumber) -> bool {
        self.end_packet_number < ack
    }

    fn start_receive_round(&mut self) {
        self.end_packet_number = self.last_sent_packet_number;
        self.current_min_rtt = Duration::ZERO;
        self.rtt_sample_count = 0;
        self.started = true;
    }

    fn should_exit_slow_start(
        &mut self,
        latest_rtt: Duration,
        min_rtt: Duration,
        congestion_window: ByteCount,
    ) -> bool {
        if !self.started {
            self.start_receive_round();
        }
        if self.hystart_found {
            return true;
        }
        self.rtt_sample_count += 1;
        if self.rtt_sample_count <= HYBRID_START_MIN_SAMPLES
            && (self.current_min_rtt.is_zero() || self.current_min_rtt > latest_rtt)
        {
            self.current_min_rtt = latest_rtt;
        }
        if self.rtt_sample_count == HYBRID_START_MIN_SAMPLES {
            let increase_threshold = (min_rtt / 8)
                .clamp(HYBRID_START_DELAY_MIN_THRESHOLD, HYBRID_START_DELAY_MAX_THRESHOLD);
            if self.current_min_rtt > min_rtt + increase_threshold {
                self.hystart_found = true;
            }
        }
        congestion_window >= HYBRID_START_LOW_WINDOW && self.hystart_found
    }

    fn restart(&mut self) {
        self.started = false;
        self.hystart_found = false;
    }
}

/// CUBIC send algorithm.
#[derive(Debug)]
pub struct CubicSender {
    hybrid_slow_start: HybridSlowStart,
    cubic: Cubic,
    largest_sent_packet_number: PacketNumber,
    largest_acked_packet_number: PacketNumber,
    largest_sent_at_last_cutback: PacketNumber,
    /// Congestion window, in packets.
    congestion_window: ByteCount,
    /// Slow start exits above this window (in packets).
    slowstart_threshold: ByteCount,
    max_congestion_window: ByteCount,
    last_cutback_exited_slowstart: bool,
    /// Packets and bytes lost while still in slow start.
    slowstart_packets_lost: u64,
    slowstart_bytes_lost: ByteCount,
}

impl Default for CubicSender {
    fn default() -> Self {
        Self::new(INITIAL_CONGESTION_WINDOW, DEFAULT_MAX_CONGESTION_WINDOW)
    }
}

impl CubicSender {
    pub fn new(initial_window: ByteCount, max_window: ByteCount) -> Self {
        Self {
            hybrid_slow_start: HybridSlowStart::default(),
            cubic: Cubic::default(),
            largest_sent_packet_number: 0,
            largest_acked_packet_number: 0,
            largest_sent_at_last_cutback: 0,
            congestion_window: initial_window,
            slowstart_threshold: max_window,
            max_congestion_window: max_window,
            last_cutback_exited_slowstart: false,
            slowstart_packets_lost: 0,
            slowstart_bytes_lost: 0,
        }
    }

    fn in_recovery(&self) -> bool {
        self.largest_acked_packet_number <= self.largest_sent_at_last_cutback
            && self.largest_acked_packet_number != 0
    }

    fn is_cwnd_limited(&self, bytes_in_flight: ByteCount) -> bool {
        let congestion_window = self.congestion_window();
        if bytes_in_flight >= congestion_window {
            return true;
        }
        let available = congestion_window - bytes_in_flight;
        let slow_start_limited =
            self.in_slow_start() && bytes_in_flight > congestion_window / 2;
        slow_start_limited || available <= 3 * DEFAULT_TCP_MSS
    }

    fn maybe_increase_cwnd(
        &mut self,
        now: Instant,
        acked_packet_number: PacketNumber,
        bytes_in_flight: ByteCount,
        rtt: &RttStats,
    ) {
        if !self.is_cwnd_limited(bytes_in_flight) {
            return;
        }
        if self.congestion_window >= self.max_congestion_window {
            return;
        }
        if self.in_slow_start() {
            self.congestion_window += 1;
            return;
        }
        self.congestion_window = self
            .cubic
            .congestion_window_after_ack(now, self.congestion_window, rtt.min_rtt())
            .min(self.max_congestion_window);
        trace!(
            cwnd = self.congestion_window,
            acked = acked_packet_number,
            "congestion avoidance window update"
        );
    }
}

impl SendAlgorithm for CubicSender {
    fn on_packet_sent(
        &mut self,
        _now: Instant,
        _bytes_in_flight: ByteCount,
        packet_number: PacketNumber,
        _bytes: ByteCount,
        is_retransmittable: bool,
    ) {
        if !is_retransmittable {
            return;
        }
        self.largest_sent_packet_number = packet_number;
        self.hybrid_slow_start.on_packet_sent(packet_number);
    }

    fn on_packet_acked(
        &mut self,
        now: Instant,
        packet_number: PacketNumber,
        _acked_bytes: ByteCount,
        bytes_in_flight: ByteCount,
        rtt: &RttStats,
    ) {
        self.largest_acked_packet_number =
            self.largest_acked_packet_number.max(packet_number);
        if self.in_recovery() {
            return;
        }
        self.maybe_increase_cwnd(now, packet_number, bytes_in_flight, rtt);
        if self.in_slow_start() {
            self.hybrid_slow_start.on_packet_acked(packet_number);
        }
    }

    fn on_packet_lost(
        &mut self,
        packet_number: PacketNumber,
        lost_bytes: ByteCount,
        _bytes_in_flight: ByteCount,
    ) {
        // Already reacted to this loss event; only keep the slow-start
        // statistics current.
        if packet_number <= self.largest_sent_at_last_cutback {
            if self.last_cutback_exited_slowstart {
                self.slowstart_packets_lost += 1;
                self.slowstart_bytes_lost += lost_bytes;
            }
            return;
        }
        self.last_cutback_exited_slowstart = self.in_slow_start();
        if self.in_slow_start() {
            self.slowstart_packets_lost += 1;
            self.slowstart_bytes_lost += lost_bytes;
            self.congestion_window -= 1;
        }
        self.congestion_window = self
            .cubic
            .congestion_window_after_packet_loss(self.congestion_window)
            .max(MIN_CONGESTION_WINDOW);
        self.slowstart_threshold = self.congestion_window;
        self.largest_sent_at_last_cutback = self.largest_sent_packet_number;
        trace!(
            cwnd = self.congestion_window,
            lost = packet_number,
            "congestion window cut back"
        );
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        self.largest_sent_at_last_cutback = 0;
        if !packets_retransmitted {
            return;
        }
        self.hybrid_slow_start.restart();
        self.cubic.reset();
        self.slowstart_threshold = self.congestion_window / 2;
        self.congestion_window = MIN_CONGESTION_WINDOW;
    }

    fn maybe_exit_slow_start(&mut self, rtt: &RttStats) {
        if self.in_slow_start()
            && self.hybrid_slow_start.should_exit_slow_start(
                rtt.latest_rtt(),
                rtt.min_rtt(),
                self.congestion_window,
            )
        {
            self.slowstart_threshold = self.congestion_window;
        }
    }

    fn in_slow_start(&self) -> bool {
        self.congestion_window < self.slowstart_threshold
    }

    fn congestion_window(&self) -> ByteCount {
        self.congestion_window * DEFAULT_TCP_MSS
    }

    fn retransmission_delay(&self, rtt: &RttStats) -> Duration {
        if rtt.smoothed_rtt().is_zero() {
            return Duration::ZERO;
        }
        rtt.smoothed_rtt() + 4 * rtt.mean_deviation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtt_with(ms: u64) -> RttStats {
        let mut rtt = RttStats::new();
        rtt.update_rtt(Duration::from_millis(ms), Duration::ZERO);
        rtt
    }

    #[test]
    fn slow_start_grows_one_packet_per_ack() {
        let mut sender = CubicSender::default();
        let now = Instant::now();
        let rtt = rtt_with(50);
        assert!(sender.in_slow_start());
        let before = sender.congestion_window();
        for pn in 1..=4 {
            sender.on_packet_sent(now, 0, pn, DEFAULT_TCP_MSS, true);
        }
        for pn in 1..=4 {
            // keep the sender cwnd-limited so the window may grow
            sender.on_packet_acked(now, pn, DEFAULT_TCP_MSS, sender.congestion_window(), &rtt);
        }
        assert_eq!(sender.congestion_window(), before + 4 * DEFAULT_TCP_MSS);
    }

    #[test]
    fn loss_cuts_window_and_enters_recovery() {
        let mut sender = CubicSender::default();
        let now = Instant::now();
        for pn in 1..=10 {
            sender.on_packet_sent(now, 0, pn, DEFAULT_TCP_MSS, true);
        }
        let before = sender.congestion_window;
        sender.on_packet_lost(3, DEFAULT_TCP_MSS, 0);
        assert!(sender.congestion_window < before);
        assert!(!sender.in_slow_start());
        // A second loss from the same flight changes nothing.
        let after_first = sender.congestion_window;
        sender.on_packet_lost(5, DEFAULT_TCP_MSS, 0);
        assert_eq!(sender.congestion_window, after_first);
    }

    #[test]
    fn rto_collapses_window() {
        let mut sender = CubicSender::default();
        let before = sender.congestion_window;
        sender.on_retransmission_timeout(true);
        assert_eq!(sender.congestion_window, MIN_CONGESTION_WINDOW);
        assert_eq!(sender.slowstart_threshold, before / 2);
        assert!(sender.in_slow_start());
    }

    #[test]
    fn rto_without_retransmission_changes_nothing() {
        let mut sender = CubicSender::default();
        let before = sender.congestion_window;
        sender.on_retransmission_timeout(false);
        assert_eq!(sender.congestion_window, before);
    }

    #[test]
    fn retransmission_delay_needs_rtt_estimate() {
        let sender = CubicSender::default();
        assert_eq!(sender.retransmission_delay(&RttStats::new()), Duration::ZERO);
        let rtt = rtt_with(100);
        // srtt + 4 * mdev = 100ms + 4 * 50ms
        assert_eq!(
            sender.retransmission_delay(&rtt),
            Duration::from_millis(300)
        );
    }
}
