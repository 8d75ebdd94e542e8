//! Max-filter bandwidth estimation.

use std::time::Duration;

use super::Bandwidth;
use crate::protocol::ByteCount;

/// Number of samples the max filter looks back over.
const COMPARE_WINDOW_SIZE: usize = 10;

/// Estimates path bandwidth from (acked bytes, send delay) samples.
///
/// The reported value is the maximum over the last
/// [`COMPARE_WINDOW_SIZE`] samples, which tolerates under-estimates caused
/// by ACK batching. Updates are gated by `enabled`
/// ([`crate::Config::bandwidth_filter`]); a disabled estimator reports only
/// its seed value.
#[derive(Debug, Clone)]
pub struct BandwidthStats {
    bandwidth: Bandwidth,
    compare_window: [Bandwidth; COMPARE_WINDOW_SIZE],
    round_robin_index: usize,
    enabled: bool,
}

impl BandwidthStats {
    pub fn new(initial: Bandwidth, enabled: bool) -> Self {
        Self {
            bandwidth: initial,
            compare_window: [Bandwidth::ZERO; COMPARE_WINDOW_SIZE],
            round_robin_index: 0,
            enabled,
        }
    }

    /// Feeds one sample: `sent_delta` bytes were acknowledged after
    /// `sent_delay` of network time.
    pub fn update(&mut self, sent_delta: ByteCount, sent_delay: Duration) {
        if !self.enabled || sent_delay.is_zero() {
            return;
        }
        let bits = sent_delta * 8;
        let sample = Bandwidth((u128::from(bits) * 1_000_000_000 / sent_delay.as_nanos()) as u64);
        self.compare_window[self.round_robin_index] = sample;
        self.round_robin_index = (self.round_robin_index + 1) % COMPARE_WINDOW_SIZE;
        for sample in self.compare_window {
            if self.bandwidth < sample {
                self.bandwidth = sample;
            }
        }
    }

    /// Estimated bandwidth in whole Mbit/s.
    pub fn megabits(&self) -> u64 {
        self.bandwidth.megabits()
    }

    pub fn bandwidth(&self) -> Bandwidth {
        self.bandwidth
    }
}
