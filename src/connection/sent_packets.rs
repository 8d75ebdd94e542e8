//! Per-path reliability: in-flight bookkeeping, ACK processing, loss
//! detection and retransmission alarms.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

use crate::congestion::{BandwidthStats, CubicSender, RttStats, SendAlgorithm};
use crate::frame::{AckFrame, AckRange, ClosePathFrame, Frame, StopWaitingFrame};
use crate::protocol::{
    ByteCount, EncryptionLevel, PacketNumber, PathId, MAX_NON_RETRANSMITTABLE_PACKETS,
    MAX_TRACKED_SENT_PACKETS, MAX_TRACKED_SKIPPED_PACKETS,
};

/// Maximum reordering in time space before time-based loss detection
/// considers a packet lost, as a fraction of an RTT.
const TIME_REORDERING_FRACTION: f64 = 1.0 / 8.0;
/// RTO for connections without an RTT estimate.
const DEFAULT_RTO_TIMEOUT: Duration = Duration::from_millis(500);
/// Minimum time in the future an RTO alarm may be set for.
const MIN_RTO_TIMEOUT: Duration = Duration::from_millis(200);
const MAX_RTO_TIMEOUT: Duration = Duration::from_secs(60);
/// Up to two tail-loss probes are sent before an RTO fires, per
/// draft-dukkipati-tcpm-tcp-loss-probe.
const MAX_TAIL_LOSS_PROBES: u32 = 2;
/// Linux uses 200ms rather than the 1s the TCP RFC calls for; so do we.
const MIN_RETRANSMISSION_TIME: Duration = Duration::from_millis(200);
const MIN_TAIL_LOSS_PROBE_TIMEOUT: Duration = Duration::from_millis(10);

/// Errors raised by the sent-packet handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AckError {
    #[error("received ACK for an unsent packet")]
    AckForUnsentPacket,
    #[error("received an ACK for a skipped packet number")]
    AckForSkippedPacket,
    #[error("received a duplicate or an out-of-order ACK")]
    DuplicateOrOutOfOrderAck,
    #[error("too many outstanding non-acked and non-retransmitted packets")]
    TooManyTrackedSentPackets,
    #[error("already sent a packet with a higher packet number")]
    PacketNumberNotIncreasing,
    /// Range evaluation placed a packet outside the matched ACK range.
    #[error("would have acked wrong packet {packet:#x} while evaluating range {first:#x}..{last:#x}")]
    InvalidAckRange {
        packet: PacketNumber,
        first: PacketNumber,
        last: PacketNumber,
    },
}

/// Record of a sent packet, tracked until acked or declared lost.
///
/// Only retransmittable frames are kept; pure acknowledgement state is
/// stripped before the packet enters the history.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub packet_number: PacketNumber,
    /// Bytes on the wire, including header and seal overhead.
    pub length: ByteCount,
    pub frames: Vec<Frame>,
    pub send_time: Instant,
    pub encryption_level: EncryptionLevel,
}

impl SentPacket {
    pub fn is_retransmittable(&self) -> bool {
        self.frames.iter().any(Frame::is_retransmittable)
    }
}

/// Common shape of ACK and CLOSE_PATH frames.
struct AckView<'a> {
    largest_acked: PacketNumber,
    lowest_acked: PacketNumber,
    ack_ranges: &'a [AckRange],
}

impl<'a> AckView<'a> {
    fn has_missing_ranges(&self) -> bool {
        self.ack_ranges.len() > 1
    }

    fn acks_packet(&self, p: PacketNumber) -> bool {
        if p < self.lowest_acked || p > self.largest_acked {
            return false;
        }
        if self.has_missing_ranges() {
            return self.ack_ranges.iter().any(|r| r.first <= p && p <= r.last);
        }
        true
    }
}

impl<'a> From<&'a AckFrame> for AckView<'a> {
    fn from(f: &'a AckFrame) -> Self {
        Self {
            largest_acked: f.largest_acked,
            lowest_acked: f.lowest_acked,
            ack_ranges: &f.ack_ranges,
        }
    }
}

impl<'a> From<&'a ClosePathFrame> for AckView<'a> {
    fn from(f: &'a ClosePathFrame) -> Self {
        Self {
            largest_acked: f.largest_acked,
            lowest_acked: f.lowest_acked,
            ack_ranges: &f.ack_ranges,
        }
    }
}

/// Tracks the least-unacked packet number to emit STOP_WAITING frames.
#[derive(Debug, Default)]
pub(crate) struct StopWaitingManager {
    largest_least_unacked_sent: PacketNumber,
    next_least_unacked: PacketNumber,
    last_stop_waiting: Option<StopWaitingFrame>,
}

impl StopWaitingManager {
    /// A frame is emitted only when the least-unacked value advanced past
    /// the last one sent. With `force` the previous frame is re-emitted,
    /// synthesised if necessary.
    pub(crate) fn get_stop_waiting_frame(&mut self, force: bool) -> Option<StopWaitingFrame> {
        if self.next_least_unacked <= self.largest_least_unacked_sent {
            if force {
                if self.last_stop_waiting.is_none() && self.largest_least_unacked_sent > 0 {
                    // No previous frame exists, e.g. because the first
                    // packet was lost before any STOP_WAITING went out.
                    self.last_stop_waiting =
                        Some(StopWaitingFrame::new(self.next_least_unacked));
                }
                return self.last_stop_waiting.clone();
            }
            return None;
        }
        self.largest_least_unacked_sent = self.next_least_unacked;
        let frame = StopWaitingFrame::new(self.next_least_unacked);
        self.last_stop_waiting = Some(frame.clone());
        Some(frame)
    }

    pub(crate) fn received_ack(&mut self, largest_acked: PacketNumber) {
        if largest_acked >= self.next_least_unacked {
            self.next_least_unacked = largest_acked + 1;
        }
    }

    pub(crate) fn queued_retransmission(&mut self, packet_number: PacketNumber) {
        if packet_number >= self.next_least_unacked {
            self.next_least_unacked = packet_number + 1;
        }
    }
}

/// Per-path history of in-flight packets with loss detection and alarms.
pub(crate) struct SentPacketHandler {
    path_id: PathId,
    last_sent_packet_number: PacketNumber,
    skipped_packets: Vec<PacketNumber>,

    /// Non-retransmittable packets since the last retransmittable one.
    num_non_retransmittable_packets: usize,

    largest_acked: PacketNumber,
    largest_received_packet_with_ack: PacketNumber,

    packet_history: BTreeMap<PacketNumber, SentPacket>,
    stop_waiting: StopWaitingManager,
    retransmission_queue: VecDeque<SentPacket>,

    bytes_in_flight: ByteCount,

    congestion: Box<dyn SendAlgorithm>,
    rtt_stats: RttStats,
    bdw_stats: BandwidthStats,

    /// RTOs fired without an intervening ack.
    rto_count: u32,
    /// Tail-loss probes sent without an intervening ack.
    tlp_count: u32,

    /// When the next packet crosses the time-reordering threshold.
    loss_time: Option<Instant>,
    last_sent_time: Option<Instant>,
    alarm: Option<Instant>,

    packets: u64,
    retransmissions: u64,
    losses: u64,
}

impl SentPacketHandler {
    pub(crate) fn new(
        path_id: PathId,
        rtt_stats: RttStats,
        bdw_stats: BandwidthStats,
        congestion: Option<Box<dyn SendAlgorithm>>,
    ) -> Self {
        Self {
            path_id,
            last_sent_packet_number: 0,
            skipped_packets: Vec::new(),
            num_non_retransmittable_packets: 0,
            largest_acked: 0,
            largest_received_packet_with_ack: 0,
            packet_history: BTreeMap::new(),
            stop_waiting: StopWaitingManager::default(),
            retransmission_queue: VecDeque::new(),
            bytes_in_flight: 0,
            congestion: congestion.unwrap_or_else(|| Box::new(CubicSender::default())),
            rtt_stats,
            bdw_stats,
            rto_count: 0,
            tlp_count: 0,
            loss_time: None,
            last_sent_time: None,
            alarm: None,
            packets: 0,
            retransmissions: 0,
            losses: 0,
        }
    }

    /// (sent, retransmitted, lost) packet counts.
    pub(crate) fn statistics(&self) -> (u64, u64, u64) {
        (self.packets, self.retransmissions, self.losses)
    }

    fn largest_in_order_acked(&self) -> PacketNumber {
        match self.packet_history.first_key_value() {
            Some((&first, _)) => first - 1,
            None => self.largest_acked,
        }
    }

    pub(crate) fn should_send_retransmittable_packet(&self) -> bool {
        self.num_non_retransmittable_packets >= MAX_NON_RETRANSMITTABLE_PACKETS
    }

    pub(crate) fn sent_packet(
        &mut self,
        mut packet: SentPacket,
        now: Instant,
    ) -> Result<(), AckError> {
        if packet.packet_number <= self.last_sent_packet_number {
            return Err(AckError::PacketNumberNotIncreasing);
        }
        if self.retransmission_queue.len() + self.packet_history.len() + 1
            > MAX_TRACKED_SENT_PACKETS
        {
            return Err(AckError::TooManyTrackedSentPackets);
        }

        for skipped in self.last_sent_packet_number + 1..packet.packet_number {
            self.skipped_packets.push(skipped);
            if self.skipped_packets.len() > MAX_TRACKED_SKIPPED_PACKETS {
                self.skipped_packets.remove(0);
            }
        }

        self.last_sent_packet_number = packet.packet_number;
        self.packets += 1;
        self.last_sent_time = Some(now);

        packet.frames.retain(Frame::is_retransmittable);
        let is_retransmittable = !packet.frames.is_empty();
        let packet_number = packet.packet_number;
        let length = packet.length;

        if is_retransmittable {
            packet.send_time = now;
            self.bytes_in_flight += packet.length;
            self.packet_history.insert(packet.packet_number, packet);
            self.num_non_retransmittable_packets = 0;
        } else {
            self.num_non_retransmittable_packets += 1;
        }

        self.congestion.on_packet_sent(
            now,
            self.bytes_in_flight,
            packet_number,
            length,
            is_retransmittable,
        );

        self.update_loss_detection_alarm();
        Ok(())
    }

    pub(crate) fn received_ack(
        &mut self,
        ack: &AckFrame,
        with_packet_number: PacketNumber,
        rcv_time: Instant,
    ) -> Result<(), AckError> {
        if ack.largest_acked > self.last_sent_packet_number {
            return Err(AckError::AckForUnsentPacket);
        }

        if with_packet_number <= self.largest_received_packet_with_ack {
            return Err(AckError::DuplicateOrOutOfOrderAck);
        }
        self.largest_received_packet_with_ack = with_packet_number;

        // Repeated ACKs that do not raise the largest acked are stale but
        // harmless.
        if ack.largest_acked <= self.largest_in_order_acked() {
            return Ok(());
        }
        self.largest_acked = ack.largest_acked;

        let view = AckView::from(ack);
        if self.skipped_packets_acked(&view) {
            return Err(AckError::AckForSkippedPacket);
        }

        if self.maybe_update_rtt(ack.largest_acked, ack.delay_time, rcv_time) {
            self.congestion.maybe_exit_slow_start(&self.rtt_stats);
        }

        let acked_packets = self.determine_newly_acked(&view)?;

        if !acked_packets.is_empty() {
            let pre_inflight = self.bytes_in_flight;
            let mut largest_acked_matched = false;
            let mut sent_delay = Duration::ZERO;
            for &packet_number in &acked_packets {
                let packet = match self.on_packet_acked(packet_number) {
                    Some(packet) => packet,
                    None => continue,
                };
                if packet_number == ack.largest_acked {
                    largest_acked_matched = true;
                    sent_delay = rcv_time.saturating_duration_since(packet.send_time);
                    if sent_delay > ack.delay_time {
                        sent_delay -= ack.delay_time;
                    }
                }
                self.congestion.on_packet_acked(
                    rcv_time,
                    packet_number,
                    packet.length,
                    self.bytes_in_flight,
                    &self.rtt_stats,
                );
            }
            if largest_acked_matched {
                let change_in_flight = pre_inflight - self.bytes_in_flight;
                self.bdw_stats.update(change_in_flight, sent_delay);
            }
        }

        self.detect_lost_packets(rcv_time);
        self.update_loss_detection_alarm();

        self.garbage_collect_skipped_packets();
        self.stop_waiting.received_ack(ack.largest_acked);

        Ok(())
    }

    /// Processes a CLOSE_PATH frame: like an ACK, but duplicates of the
    /// largest acked are tolerated, the RTT is not updated, and every
    /// remaining in-flight packet at or below the largest acked is marked
    /// lost. The path is torn down for sending but not for reliability.
    pub(crate) fn received_close_path(
        &mut self,
        frame: &ClosePathFrame,
        with_packet_number: PacketNumber,
        rcv_time: Instant,
    ) -> Result<(), AckError> {
        if frame.largest_acked > self.last_sent_packet_number {
            return Err(AckError::AckForUnsentPacket);
        }

        // A CLOSE_PATH should be the last packet received on a path.
        if with_packet_number <= self.largest_received_packet_with_ack {
            return Err(AckError::DuplicateOrOutOfOrderAck);
        }
        self.largest_received_packet_with_ack = with_packet_number;

        let view = AckView::from(frame);
        if self.skipped_packets_acked(&view) {
            return Err(AckError::AckForSkippedPacket);
        }
        self.largest_acked = self.largest_acked.max(frame.largest_acked);

        let acked_packets = self.determine_newly_acked(&view)?;
        for &packet_number in &acked_packets {
            let packet = match self.on_packet_acked(packet_number) {
                Some(packet) => packet,
                None => continue,
            };
            self.congestion.on_packet_acked(
                rcv_time,
                packet_number,
                packet.length,
                self.bytes_in_flight,
                &self.rtt_stats,
            );
        }

        self.set_inflight_as_lost();

        self.garbage_collect_skipped_packets();
        // No STOP_WAITING will ever be sent on this path again.

        Ok(())
    }

    fn determine_newly_acked(&self, view: &AckView<'_>) -> Result<Vec<PacketNumber>, AckError> {
        let mut acked_packets = Vec::new();
        let mut range_index = 0;
        for (&packet_number, _) in self.packet_history.iter() {
            if packet_number < view.lowest_acked {
                continue;
            }
            if packet_number > view.largest_acked {
                break;
            }

            if view.has_missing_ranges() {
                let ranges = view.ack_ranges;
                // Ranges are stored descending; index them from the back to
                // walk them in ascending packet-number order.
                let mut range = &ranges[ranges.len() - 1 - range_index];
                while packet_number > range.last && range_index < ranges.len() - 1 {
                    range_index += 1;
                    range = &ranges[ranges.len() - 1 - range_index];
                }
                if packet_number >= range.first {
                    if packet_number > range.last {
                        return Err(AckError::InvalidAckRange {
                            packet: packet_number,
                            first: range.first,
                            last: range.last,
                        });
                    }
                    acked_packets.push(packet_number);
                }
            } else {
                acked_packets.push(packet_number);
            }
        }
        Ok(acked_packets)
    }

    fn maybe_update_rtt(
        &mut self,
        largest_acked: PacketNumber,
        ack_delay: Duration,
        rcv_time: Instant,
    ) -> bool {
        if let Some(packet) = self.packet_history.get(&largest_acked) {
            self.rtt_stats
                .update_rtt(rcv_time.saturating_duration_since(packet.send_time), ack_delay);
            return true;
        }
        false
    }

    fn detect_lost_packets(&mut self, now: Instant) {
        self.loss_time = None;

        let max_rtt = self.rtt_stats.latest_rtt().max(self.rtt_stats.smoothed_rtt());
        let delay_until_lost = max_rtt.mul_f64(1.0 + TIME_REORDERING_FRACTION);

        let mut lost_packets = Vec::new();
        for (&packet_number, packet) in self.packet_history.iter() {
            if packet_number > self.largest_acked {
                break;
            }

            let time_since_sent = now.saturating_duration_since(packet.send_time);
            if time_since_sent > delay_until_lost {
                self.losses += 1;
                lost_packets.push(packet_number);
            } else if self.loss_time.is_none() {
                // Only the first aging-but-not-yet-lost packet arms the
                // timer; the history is ascending, so it has the earliest
                // deadline.
                self.loss_time = Some(now + (delay_until_lost - time_since_sent));
            }
        }

        for packet_number in lost_packets {
            trace!(
                path_id = %self.path_id,
                packet = packet_number,
                "packet lost by time threshold"
            );
            if let Some(length) = self.queue_packet_for_retransmission(packet_number) {
                self.congestion
                    .on_packet_lost(packet_number, length, self.bytes_in_flight);
            }
        }
    }

    /// Marks every tracked packet at or below the largest acked as lost.
    fn set_inflight_as_lost(&mut self) {
        let lost_packets: Vec<PacketNumber> = self
            .packet_history
            .range(..=self.largest_acked)
            .map(|(&packet_number, _)| packet_number)
            .collect();

        for packet_number in lost_packets {
            self.losses += 1;
            if let Some(length) = self.queue_packet_for_retransmission(packet_number) {
                self.congestion
                    .on_packet_lost(packet_number, length, self.bytes_in_flight);
            }
        }
    }

    fn update_loss_detection_alarm(&mut self) {
        // No alarm without outstanding packets.
        if self.packet_history.is_empty() {
            self.alarm = None;
            return;
        }

        if let Some(loss_time) = self.loss_time {
            // Early retransmit timer or time loss detection.
            self.alarm = Some(loss_time);
        } else if !self.rtt_stats.smoothed_rtt().is_zero() && self.tlp_count < MAX_TAIL_LOSS_PROBES
        {
            self.alarm = self
                .last_sent_time
                .map(|sent| sent + self.compute_tlp_timeout());
        } else {
            self.alarm = self
                .last_sent_time
                .map(|sent| sent + self.compute_rto_timeout().max(MIN_RETRANSMISSION_TIME));
        }
    }

    /// Handles an expired loss-detection alarm. `on_rto` is consulted when
    /// a retransmission timeout fires and decides whether the path must be
    /// treated as potentially failed, in which case everything outstanding
    /// is queued for retransmission.
    pub(crate) fn on_alarm(&mut self, now: Instant, on_rto: impl FnOnce(Instant) -> bool) {
        if self.packet_history.is_empty() {
            self.alarm = None;
            return;
        }

        if self.loss_time.is_some() {
            // Early retransmit or time loss detection.
            self.detect_lost_packets(now);
        } else if self.tlp_count < MAX_TAIL_LOSS_PROBES {
            self.retransmit_tlp();
            self.tlp_count += 1;
        } else {
            let potentially_failed = on_rto(self.last_sent_time.unwrap_or(now));
            if potentially_failed {
                self.retransmit_all_packets();
            } else {
                self.retransmit_oldest_two_packets();
            }
            self.rto_count += 1;
        }

        self.update_loss_detection_alarm();
    }

    pub(crate) fn alarm_timeout(&self) -> Option<Instant> {
        self.alarm
    }

    fn on_packet_acked(&mut self, packet_number: PacketNumber) -> Option<SentPacket> {
        let packet = self.packet_history.remove(&packet_number)?;
        self.bytes_in_flight -= packet.length;
        self.rto_count = 0;
        self.tlp_count = 0;
        Some(packet)
    }

    pub(crate) fn dequeue_packet_for_retransmission(&mut self) -> Option<SentPacket> {
        let packet = self.retransmission_queue.pop_front()?;
        self.retransmissions += 1;
        Some(packet)
    }

    pub(crate) fn get_least_unacked(&self) -> PacketNumber {
        self.largest_in_order_acked() + 1
    }

    pub(crate) fn get_stop_waiting_frame(&mut self, force: bool) -> Option<StopWaitingFrame> {
        self.stop_waiting.get_stop_waiting_frame(force)
    }

    pub(crate) fn sending_allowed(&self) -> bool {
        let congestion_limited = self.bytes_in_flight > self.congestion.congestion_window();
        let max_tracked_limited = self.retransmission_queue.len() + self.packet_history.len()
            >= MAX_TRACKED_SENT_PACKETS;
        if congestion_limited {
            debug!(
                path_id = %self.path_id,
                bytes_in_flight = self.bytes_in_flight,
                window = self.congestion.congestion_window(),
                "congestion limited"
            );
        }
        // Retransmissions may always be sent, even congestion-limited;
        // only the tracked-packet ceiling is a hard stop.
        let have_retransmissions = !self.retransmission_queue.is_empty();
        !max_tracked_limited && (!congestion_limited || have_retransmissions)
    }

    fn retransmit_tlp(&mut self) {
        if let Some((&newest, _)) = self.packet_history.last_key_value() {
            trace!(path_id = %self.path_id, packet = newest, "tail-loss probe");
            self.queue_packet_for_retransmission(newest);
        }
    }

    fn retransmit_all_packets(&mut self) {
        while let Some((&oldest, _)) = self.packet_history.first_key_value() {
            self.queue_rto(oldest);
        }
        self.congestion.on_retransmission_timeout(true);
    }

    fn retransmit_oldest_two_packets(&mut self) {
        for _ in 0..2 {
            if let Some((&oldest, _)) = self.packet_history.first_key_value() {
                self.queue_rto(oldest);
            }
        }
        self.congestion.on_retransmission_timeout(true);
    }

    fn queue_rto(&mut self, packet_number: PacketNumber) {
        debug!(
            path_id = %self.path_id,
            packet = packet_number,
            outstanding = self.packet_history.len(),
            "queueing packet for retransmission (RTO)"
        );
        if let Some(length) = self.queue_packet_for_retransmission(packet_number) {
            self.losses += 1;
            self.congestion
                .on_packet_lost(packet_number, length, self.bytes_in_flight);
        }
    }

    fn queue_packet_for_retransmission(&mut self, packet_number: PacketNumber) -> Option<ByteCount> {
        let packet = self.packet_history.remove(&packet_number)?;
        self.bytes_in_flight -= packet.length;
        self.stop_waiting.queued_retransmission(packet_number);
        let length = packet.length;
        self.retransmission_queue.push_back(packet);
        Some(length)
    }

    fn compute_rto_timeout(&self) -> Duration {
        let mut rto = self.congestion.retransmission_delay(&self.rtt_stats);
        if rto.is_zero() {
            rto = DEFAULT_RTO_TIMEOUT;
        }
        rto = rto.max(MIN_RTO_TIMEOUT);
        // Exponential backoff, clamped well past the cap.
        let rto = rto.saturating_mul(1 << self.rto_count.min(16));
        rto.min(MAX_RTO_TIMEOUT)
    }

    fn has_multiple_outstanding_retransmittable_packets(&self) -> bool {
        self.packet_history.len() > 1
    }

    fn compute_tlp_timeout(&self) -> Duration {
        let rtt = self.rtt_stats.smoothed_rtt();
        if self.has_multiple_outstanding_retransmittable_packets() {
            (2 * rtt).max(rtt * 3 / 2 + MIN_RETRANSMISSION_TIME / 2)
        } else {
            (2 * rtt).max(MIN_TAIL_LOSS_PROBE_TIMEOUT)
        }
    }

    fn skipped_packets_acked(&self, view: &AckView<'_>) -> bool {
        self.skipped_packets.iter().any(|&p| view.acks_packet(p))
    }

    fn garbage_collect_skipped_packets(&mut self) {
        let largest_in_order_acked = self.largest_in_order_acked();
        self.skipped_packets.retain(|&p| p > largest_in_order_acked);
    }

    pub(crate) fn bytes_in_flight(&self) -> ByteCount {
        self.bytes_in_flight
    }

    pub(crate) fn largest_acked(&self) -> PacketNumber {
        self.largest_acked
    }

    pub(crate) fn rtt_stats(&self) -> &RttStats {
        &self.rtt_stats
    }

    pub(crate) fn bdw_stats(&self) -> &BandwidthStats {
        &self.bdw_stats
    }

    pub(crate) fn has_retransmissions(&self) -> bool {
        !self.retransmission_queue.is_empty()
    }

    #[cfg(test)]
    fn history_len(&self) -> usize {
        self.packet_history.len()
    }

    #[cfg(test)]
    fn skipped(&self) -> &[PacketNumber] {
        &self.skipped_packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::Bandwidth;
    use assert_matches::assert_matches;

    fn handler() -> SentPacketHandler {
        SentPacketHandler::new(
            PathId::INITIAL,
            RttStats::new(),
            BandwidthStats::new(Bandwidth::ZERO, false),
            None,
        )
    }

    fn retransmittable(packet_number: PacketNumber, length: ByteCount) -> SentPacket {
        SentPacket {
            packet_number,
            length,
            frames: vec![Frame::Ping],
            send_time: Instant::now(),
            encryption_level: EncryptionLevel::ForwardSecure,
        }
    }

    fn ack(largest: PacketNumber, lowest: PacketNumber, ranges: Vec<AckRange>) -> AckFrame {
        AckFrame {
            path_id: PathId::INITIAL,
            largest_acked: largest,
            lowest_acked: lowest,
            delay_time: Duration::ZERO,
            ack_ranges: ranges,
        }
    }

    #[test]
    fn acking_clears_history_and_in_flight() {
        let mut handler = handler();
        let now = Instant::now();
        for packet_number in 1..=3 {
            handler
                .sent_packet(retransmittable(packet_number, 500), now)
                .unwrap();
        }
        assert_eq!(handler.bytes_in_flight(), 1500);

        handler
            .received_ack(&ack(3, 1, vec![]), 1, now + Duration::from_millis(10))
            .unwrap();
        assert_eq!(handler.history_len(), 0);
        assert_eq!(handler.bytes_in_flight(), 0);
        assert_eq!(handler.largest_acked(), 3);
        assert!(handler.alarm_timeout().is_none());
    }

    #[test]
    fn ack_covering_a_skipped_number_is_an_attack() {
        let mut handler = handler();
        let now = Instant::now();
        handler.sent_packet(retransmittable(1, 100), now).unwrap();
        handler.sent_packet(retransmittable(5, 100), now).unwrap();
        assert_eq!(handler.skipped(), &[2, 3, 4]);

        // A contiguous ACK of 1..=5 claims the intentionally skipped
        // numbers 2..=4 were received.
        assert_matches!(
            handler.received_ack(&ack(5, 1, vec![]), 1, now),
            Err(AckError::AckForSkippedPacket)
        );
    }

    #[test]
    fn ack_leaving_out_the_skipped_numbers_is_fine() {
        let mut handler = handler();
        let now = Instant::now();
        handler.sent_packet(retransmittable(1, 100), now).unwrap();
        handler.sent_packet(retransmittable(5, 100), now).unwrap();

        let frame = ack(
            5,
            1,
            vec![AckRange { first: 5, last: 5 }, AckRange { first: 1, last: 1 }],
        );
        handler.received_ack(&frame, 1, now).unwrap();
        assert_eq!(handler.history_len(), 0);
        assert_eq!(handler.bytes_in_flight(), 0);
    }

    #[test]
    fn skipped_list_is_bounded() {
        let mut handler = handler();
        let now = Instant::now();
        handler.sent_packet(retransmittable(1, 10), now).unwrap();
        handler.sent_packet(retransmittable(20, 10), now).unwrap();
        assert_eq!(handler.skipped().len(), MAX_TRACKED_SKIPPED_PACKETS);
        assert_eq!(handler.skipped()[0], 10);
    }

    #[test]
    fn packet_numbers_must_increase() {
        let mut handler = handler();
        let now = Instant::now();
        handler.sent_packet(retransmittable(2, 10), now).unwrap();
        assert_matches!(
            handler.sent_packet(retransmittable(2, 10), now),
            Err(AckError::PacketNumberNotIncreasing)
        );
    }

    #[test]
    fn duplicate_acks_are_rejected_and_stale_acks_ignored() {
        let mut handler = handler();
        let now = Instant::now();
        for packet_number in 1..=2 {
            handler
                .sent_packet(retransmittable(packet_number, 10), now)
                .unwrap();
        }
        handler.received_ack(&ack(1, 1, vec![]), 5, now).unwrap();
        assert_matches!(
            handler.received_ack(&ack(2, 1, vec![]), 5, now),
            Err(AckError::DuplicateOrOutOfOrderAck)
        );
        // Not a higher largest acked: silently ignored.
        handler.received_ack(&ack(1, 1, vec![]), 6, now).unwrap();
        assert_eq!(handler.largest_acked(), 1);
    }

    #[test]
    fn ack_for_unsent_packet_is_rejected() {
        let mut handler = handler();
        let now = Instant::now();
        handler.sent_packet(retransmittable(1, 10), now).unwrap();
        assert_matches!(
            handler.received_ack(&ack(4, 1, vec![]), 1, now),
            Err(AckError::AckForUnsentPacket)
        );
    }

    #[test]
    fn pure_ack_packets_do_not_enter_history() {
        let mut handler = handler();
        let now = Instant::now();
        let packet = SentPacket {
            packet_number: 1,
            length: 30,
            frames: vec![Frame::Ack(ack(1, 1, vec![]))],
            send_time: now,
            encryption_level: EncryptionLevel::ForwardSecure,
        };
        handler.sent_packet(packet, now).unwrap();
        assert_eq!(handler.history_len(), 0);
        assert_eq!(handler.bytes_in_flight(), 0);

        assert!(!handler.should_send_retransmittable_packet());
        for packet_number in 2..=(MAX_NON_RETRANSMITTABLE_PACKETS as PacketNumber + 1) {
            let packet = SentPacket {
                packet_number,
                length: 30,
                frames: vec![Frame::Ack(ack(1, 1, vec![]))],
                send_time: now,
                encryption_level: EncryptionLevel::ForwardSecure,
            };
            handler.sent_packet(packet, now).unwrap();
        }
        assert!(handler.should_send_retransmittable_packet());
    }

    #[test]
    fn time_threshold_loss_detection() {
        let mut handler = handler();
        let start = Instant::now();
        handler.sent_packet(retransmittable(1, 100), start).unwrap();
        handler.sent_packet(retransmittable(2, 100), start).unwrap();

        // Ack only packet 2, 100ms later: packet 1 is now suspicious but
        // not yet past 1.125 * RTT.
        let rcv = start + Duration::from_millis(100);
        handler.received_ack(&ack(2, 2, vec![]), 1, rcv).unwrap();
        assert_eq!(handler.history_len(), 1);
        let alarm = handler.alarm_timeout().expect("loss alarm armed");
        assert!(alarm > rcv);

        // Once the alarm fires, the packet is declared lost.
        handler.on_alarm(alarm + Duration::from_millis(1), |_| false);
        assert_eq!(handler.history_len(), 0);
        assert_eq!(handler.bytes_in_flight(), 0);
        let lost = handler.dequeue_packet_for_retransmission().unwrap();
        assert_eq!(lost.packet_number, 1);
        assert_eq!(handler.get_least_unacked(), 3);
    }

    #[test]
    fn tlp_then_rto_progression() {
        let mut handler = handler();
        let start = Instant::now();
        let mut rtt = RttStats::new();
        rtt.set_initial_rtt(Duration::from_millis(50));
        handler.rtt_stats = rtt;

        for packet_number in 1..=3 {
            handler
                .sent_packet(retransmittable(packet_number, 100), start)
                .unwrap();
        }

        // Two tail-loss probes retransmit the newest packet.
        let alarm = handler.alarm_timeout().unwrap();
        handler.on_alarm(alarm, |_| panic!("no RTO yet"));
        assert_eq!(
            handler.dequeue_packet_for_retransmission().unwrap().packet_number,
            3
        );
        let alarm = handler.alarm_timeout().unwrap();
        handler.on_alarm(alarm, |_| panic!("no RTO yet"));

        // The third expiry is an RTO and queues the two oldest.
        let alarm = handler.alarm_timeout().unwrap();
        let mut rto_fired = false;
        handler.on_alarm(alarm, |_| {
            rto_fired = true;
            false
        });
        assert!(rto_fired);
        assert_eq!(
            handler.dequeue_packet_for_retransmission().unwrap().packet_number,
            2
        );
        assert_eq!(
            handler.dequeue_packet_for_retransmission().unwrap().packet_number,
            1
        );
    }

    #[test]
    fn rto_on_potentially_failed_path_queues_everything() {
        let mut handler = handler();
        let start = Instant::now();
        for packet_number in 1..=4 {
            handler
                .sent_packet(retransmittable(packet_number, 100), start)
                .unwrap();
        }
        handler.tlp_count = MAX_TAIL_LOSS_PROBES;

        let alarm = handler.alarm_timeout().unwrap();
        handler.on_alarm(alarm, |_| true);
        assert_eq!(handler.history_len(), 0);
        let mut queued = 0;
        while handler.dequeue_packet_for_retransmission().is_some() {
            queued += 1;
        }
        assert_eq!(queued, 4);
    }

    #[test]
    fn close_path_acks_and_strands_nothing_below_largest() {
        let mut handler = handler();
        let now = Instant::now();
        for packet_number in 1..=3 {
            handler
                .sent_packet(retransmittable(packet_number, 100), now)
                .unwrap();
        }

        let frame = ClosePathFrame {
            path_id: PathId::INITIAL,
            largest_acked: 2,
            lowest_acked: 2,
            ack_ranges: vec![],
        };
        handler.received_close_path(&frame, 1, now).unwrap();

        // Packet 2 was acked, packet 1 was below the ack and is queued for
        // retransmission, packet 3 stays in flight.
        assert_eq!(handler.history_len(), 1);
        assert_eq!(handler.bytes_in_flight(), 100);
        let requeued = handler.dequeue_packet_for_retransmission().unwrap();
        assert_eq!(requeued.packet_number, 1);
    }

    #[test]
    fn sending_allowed_despite_congestion_with_retransmissions() {
        let mut handler = handler();
        let now = Instant::now();
        handler.sent_packet(retransmittable(1, 100), now).unwrap();
        assert!(handler.sending_allowed());
        handler.queue_packet_for_retransmission(1).unwrap();
        assert!(handler.sending_allowed());
        assert!(handler.has_retransmissions());
    }

    #[test]
    fn stop_waiting_manager_advances_with_acks() {
        let mut manager = StopWaitingManager::default();
        assert!(manager.get_stop_waiting_frame(false).is_none());

        manager.received_ack(10);
        let frame = manager.get_stop_waiting_frame(false).unwrap();
        assert_eq!(frame.least_unacked, 11);
        // Nothing new: silent, unless forced.
        assert!(manager.get_stop_waiting_frame(false).is_none());
        assert_eq!(manager.get_stop_waiting_frame(true).unwrap().least_unacked, 11);

        manager.queued_retransmission(15);
        assert_eq!(manager.get_stop_waiting_frame(false).unwrap().least_unacked, 16);
    }
}
