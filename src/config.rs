//! Endpoint configuration.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::congestion::Bandwidth;

/// Seed values applied to a freshly created path.
///
/// The path manager looks these up by the path's local IP (for locally
/// created paths) or remote IP (for paths created from an incoming packet).
#[derive(Debug, Clone, Copy, Default)]
pub struct PathStatsSeed {
    /// Initial smoothed RTT estimate; zero means unseeded.
    pub rtt: Duration,
    /// Initial bandwidth estimate.
    pub bandwidth: Bandwidth,
}

/// Parameters governing a connection's transport behaviour.
///
/// Values not exposed here are protocol constants in [`crate::protocol`].
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) create_paths: bool,
    pub(crate) bandwidth_filter: bool,
    pub(crate) truncate_connection_id: bool,
    pub(crate) initial_path_stats: HashMap<IpAddr, PathStatsSeed>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_paths: true,
            bandwidth_filter: false,
            truncate_connection_id: false,
            initial_path_stats: HashMap::new(),
        }
    }
}

impl Config {
    /// Whether this endpoint may initiate additional paths once the
    /// handshake completes. Currently only meaningful on clients.
    pub fn create_paths(&mut self, enabled: bool) -> &mut Self {
        self.create_paths = enabled;
        self
    }

    /// Enables the max-filter bandwidth estimator updates from ACK samples.
    ///
    /// When disabled, paths report only their seeded bandwidth.
    pub fn bandwidth_filter(&mut self, enabled: bool) -> &mut Self {
        self.bandwidth_filter = enabled;
        self
    }

    /// Whether public headers may omit the connection ID.
    ///
    /// Ignored on multipath connections, which always carry the full ID.
    pub fn truncate_connection_id(&mut self, enabled: bool) -> &mut Self {
        self.truncate_connection_id = enabled;
        self
    }

    /// Registers initial RTT and bandwidth estimates for paths whose local
    /// or remote address matches `ip`.
    pub fn seed_path_stats(&mut self, ip: IpAddr, seed: PathStatsSeed) -> &mut Self {
        self.initial_path_stats.insert(ip, seed);
        self
    }

    pub(crate) fn path_seed(&self, ip: IpAddr) -> PathStatsSeed {
        self.initial_path_stats.get(&ip).copied().unwrap_or_default()
    }
}
