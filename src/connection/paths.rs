//! Per-path state: packet numbering, reliability, link statistics and the
//! UDP 4-tuple.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::sent_packets::SentPacketHandler;
use crate::config::PathStatsSeed;
use crate::congestion::{BandwidthStats, RttStats};
use crate::frame::{AckFrame, StopWaitingFrame};
use crate::packet::PacketNumberGenerator;
use crate::protocol::{PacketNumber, PathId, StreamId, SKIP_PACKET_AVERAGE_PERIOD_LENGTH};

/// One network path of a multipath connection.
pub(crate) struct Path {
    pub(crate) path_id: PathId,
    pub(crate) local_addr: SocketAddr,
    pub(crate) remote_addr: SocketAddr,

    /// False once the path has been torn down for sending.
    pub(crate) open: bool,
    /// Set when an RTO fired without any network activity since the last
    /// send; such paths are skipped by the scheduler.
    pub(crate) potentially_failed: bool,

    pub(crate) packet_number_generator: PacketNumberGenerator,
    pub(crate) sent_packets: SentPacketHandler,

    /// Streams currently assigned to this path, in assignment order.
    pub(crate) stream_ids: Vec<StreamId>,

    /// Snapshot of the least-unacked packet number, refreshed before each
    /// pack so header packet-number lengths are computed consistently.
    pub(crate) least_unacked: PacketNumber,

    /// Acknowledgement for packets received on this path, deposited by the
    /// receive driver and consumed by the send loop.
    pending_ack: Option<AckFrame>,

    /// Last time anything arrived on this path.
    pub(crate) last_network_activity: Option<Instant>,
}

impl Path {
    pub(crate) fn new(
        path_id: PathId,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        seed: PathStatsSeed,
        bandwidth_filter: bool,
    ) -> Self {
        let mut rtt_stats = RttStats::new();
        rtt_stats.set_initial_rtt(seed.rtt);
        let bdw_stats = BandwidthStats::new(seed.bandwidth, bandwidth_filter);
        Self {
            path_id,
            local_addr,
            remote_addr,
            open: true,
            potentially_failed: false,
            packet_number_generator: PacketNumberGenerator::new(
                SKIP_PACKET_AVERAGE_PERIOD_LENGTH,
            ),
            sent_packets: SentPacketHandler::new(path_id, rtt_stats, bdw_stats, None),
            stream_ids: Vec::new(),
            least_unacked: 1,
            pending_ack: None,
            last_network_activity: None,
        }
    }

    pub(crate) fn set_least_unacked(&mut self, least_unacked: PacketNumber) {
        self.least_unacked = least_unacked;
    }

    /// Whether the scheduler may place new packets on this path.
    pub(crate) fn sending_allowed(&self) -> bool {
        self.open && self.sent_packets.sending_allowed()
    }

    pub(crate) fn smoothed_rtt(&self) -> Duration {
        self.sent_packets.rtt_stats().smoothed_rtt()
    }

    /// Estimated path bandwidth in whole Mbit/s.
    pub(crate) fn bandwidth_megabits(&self) -> u64 {
        self.sent_packets.bdw_stats().megabits()
    }

    /// Called by the receive driver for every packet that arrived on this
    /// path.
    pub(crate) fn on_network_activity(&mut self, now: Instant) {
        self.last_network_activity = Some(now);
    }

    /// Deposits the acknowledgement the receive side wants delivered.
    pub(crate) fn queue_ack(&mut self, ack: AckFrame) {
        self.pending_ack = Some(ack);
    }

    pub(crate) fn take_ack_frame(&mut self) -> Option<AckFrame> {
        self.pending_ack.take()
    }

    pub(crate) fn has_ack_pending(&self) -> bool {
        self.pending_ack.is_some()
    }

    pub(crate) fn get_stop_waiting_frame(&mut self, force: bool) -> Option<StopWaitingFrame> {
        self.sent_packets.get_stop_waiting_frame(force)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> Path {
        Path::new(
            PathId(2),
            "10.0.0.1:4433".parse().unwrap(),
            "10.1.0.1:4433".parse().unwrap(),
            PathStatsSeed::default(),
            false,
        )
    }

    #[test]
    fn fresh_path_allows_sending() {
        let mut path = path();
        assert!(path.sending_allowed());
        path.open = false;
        assert!(!path.sending_allowed());
    }

    #[test]
    fn ack_slot_is_consumed_once() {
        let mut path = path();
        assert!(!path.has_ack_pending());
        path.queue_ack(crate::frame::AckFrame {
            path_id: path.path_id,
            largest_acked: 1,
            lowest_acked: 1,
            delay_time: Duration::ZERO,
            ack_ranges: vec![],
        });
        assert!(path.has_ack_pending());
        assert!(path.take_ack_frame().is_some());
        assert!(path.take_ack_frame().is_none());
    }

    #[test]
    fn seeded_path_reports_initial_stats() {
        let seed = PathStatsSeed {
            rtt: Duration::from_millis(1),
            bandwidth: crate::congestion::Bandwidth::from_megabits(20),
        };
        let path = Path::new(
            PathId(2),
            "10.0.1.1:4433".parse().unwrap(),
            "10.1.0.1:4433".parse().unwrap(),
            seed,
            false,
        );
        assert_eq!(path.smoothed_rtt(), Duration::from_millis(1));
        assert_eq!(path.bandwidth_megabits(), 20);
    }
}
