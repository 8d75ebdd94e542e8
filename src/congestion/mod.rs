//! Per-path congestion control and link statistics.

use std::fmt;
use std::time::{Duration, Instant};

use crate::protocol::{ByteCount, PacketNumber};

mod bandwidth;
pub use bandwidth::BandwidthStats;

mod cubic;
pub use cubic::CubicSender;

mod rtt;
pub use rtt::RttStats;

/// A transfer rate in bits per second.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bandwidth(pub u64);

impl Bandwidth {
    pub const ZERO: Bandwidth = Bandwidth(0);

    pub fn from_megabits(mbps: u64) -> Self {
        Self(mbps << 20)
    }

    /// Whole megabits per second.
    pub fn megabits(self) -> u64 {
        self.0 >> 20
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Mbit/s", self.megabits())
    }
}

/// A congestion-control send algorithm, driven by the sent-packet handler.
///
/// All byte counts are wire bytes; `bytes_in_flight` is the handler's
/// accounting *after* the event has been applied, matching the call order
/// of the reliability engine.
pub trait SendAlgorithm: Send {
    fn on_packet_sent(
        &mut self,
        now: Instant,
        bytes_in_flight: ByteCount,
        packet_number: PacketNumber,
        bytes: ByteCount,
        is_retransmittable: bool,
    );

    fn on_packet_acked(
        &mut self,
        now: Instant,
        packet_number: PacketNumber,
        acked_bytes: ByteCount,
        bytes_in_flight: ByteCount,
        rtt: &RttStats,
    );

    fn on_packet_lost(
        &mut self,
        packet_number: PacketNumber,
        lost_bytes: ByteCount,
        bytes_in_flight: ByteCount,
    );

    /// An RTO fired. `packets_retransmitted` is false when the timeout
    /// produced nothing to retransmit.
    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool);

    /// Called when the RTT estimate moved; may end slow start.
    fn maybe_exit_slow_start(&mut self, rtt: &RttStats);

    fn in_slow_start(&self) -> bool;

    /// Current congestion window in bytes.
    fn congestion_window(&self) -> ByteCount;

    /// Base retransmission timeout derived from the RTT estimate; zero
    /// when no estimate exists yet.
    fn retransmission_delay(&self, rtt: &RttStats) -> Duration;
}
