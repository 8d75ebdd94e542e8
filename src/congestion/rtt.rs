//! Round-trip-time estimation from ACK samples.

use std::time::Duration;

/// EWMA weight of a new sample in the smoothed RTT.
const RTT_ALPHA: f64 = 0.125;
/// EWMA weight of a new sample in the mean deviation.
const RTT_BETA: f64 = 0.25;

/// Smoothed, latest and minimum RTT plus mean deviation.
#[derive(Debug, Default, Clone)]
pub struct RttStats {
    latest_rtt: Duration,
    min_rtt: Duration,
    smoothed_rtt: Duration,
    mean_deviation: Duration,
}

impl RttStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the estimator, for paths whose characteristics are known in
    /// advance. A zero duration leaves the estimator untouched.
    pub fn set_initial_rtt(&mut self, rtt: Duration) {
        if rtt.is_zero() {
            return;
        }
        self.latest_rtt = rtt;
        self.min_rtt = rtt;
        self.smoothed_rtt = rtt;
        self.mean_deviation = rtt / 2;
    }

    /// Feeds one sample. `send_delta` is receive time minus send time of
    /// the largest-acked packet; `ack_delay` is the peer-reported decoding
    /// delay, subtracted only while the corrected sample stays at or above
    /// the observed minimum.
    pub fn update_rtt(&mut self, send_delta: Duration, ack_delay: Duration) {
        if send_delta.is_zero() {
            return;
        }
        if self.min_rtt.is_zero() || self.min_rtt > send_delta {
            self.min_rtt = send_delta;
        }
        let mut sample = send_delta;
        if sample.saturating_sub(ack_delay) >= self.min_rtt {
            sample -= ack_delay;
        }
        self.latest_rtt = sample;
        if self.smoothed_rtt.is_zero() {
            self.smoothed_rtt = sample;
            self.mean_deviation = sample / 2;
        } else {
            let deviation = if self.smoothed_rtt > sample {
                self.smoothed_rtt - sample
            } else {
                sample - self.smoothed_rtt
            };
            self.mean_deviation = self
                .mean_deviation
                .mul_f64(1.0 - RTT_BETA)
                .saturating_add(deviation.mul_f64(RTT_BETA));
            self.smoothed_rtt = self
                .smoothed_rtt
                .mul_f64(1.0 - RTT_ALPHA)
                .saturating_add(sample.mul_f64(RTT_ALPHA));
        }
    }

    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    /// Zero until the first sample (or seed) arrives.
    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    pub fn mean_deviation(&self) -> Duration {
        self.mean_deviation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_initialises_everything() {
        let mut rtt = RttStats::new();
        rtt.update_rtt(Duration::from_millis(100), Duration::ZERO);
        assert_eq!(rtt.latest_rtt(), Duration::from_millis(100));
        assert_eq!(rtt.smoothed_rtt(), Duration::from_millis(100));
        assert_eq!(rtt.min_rtt(), Duration::from_millis(100));
        assert_eq!(rtt.mean_deviation(), Duration::from_millis(50));
    }

    #[test]
    fn smoothing_follows_seven_eighths_rule() {
        let mut rtt = RttStats::new();
        rtt.update_rtt(Duration::from_millis(100), Duration::ZERO);
        rtt.update_rtt(Duration::from_millis(200), Duration::ZERO);
        // 7/8 * 100ms + 1/8 * 200ms
        assert_eq!(rtt.smoothed_rtt(), Duration::from_micros(112_500));
        assert_eq!(rtt.latest_rtt(), Duration::from_millis(200));
    }

    #[test]
    fn ack_delay_subtracted_only_above_min() {
        let mut rtt = RttStats::new();
        rtt.update_rtt(Duration::from_millis(10), Duration::ZERO);
        // 30ms - 25ms would fall below the 10ms minimum, so the delay is
        // ignored for this sample.
        rtt.update_rtt(Duration::from_millis(30), Duration::from_millis(25));
        assert_eq!(rtt.latest_rtt(), Duration::from_millis(30));
        // 30ms - 15ms stays above the minimum and is corrected.
        rtt.update_rtt(Duration::from_millis(30), Duration::from_millis(15));
        assert_eq!(rtt.latest_rtt(), Duration::from_millis(15));
    }

    #[test]
    fn seeding_sets_smoothed_rtt() {
        let mut rtt = RttStats::new();
        rtt.set_initial_rtt(Duration::from_millis(1));
        assert_eq!(rtt.smoothed_rtt(), Duration::from_millis(1));
        rtt.set_initial_rtt(Duration::ZERO);
        assert_eq!(rtt.smoothed_rtt(), Duration::from_millis(1));
    }
}
