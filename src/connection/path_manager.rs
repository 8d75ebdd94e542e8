//! Path lifecycle: address bookkeeping and path creation.
//!
//! The coordinator is a small state machine over waiting-handshake,
//! running and closed, driven by explicit events instead of channels:
//! handshake completion, address advertisements from the peer, and local
//! address changes.

use std::net::SocketAddr;
use std::time::Instant;

use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::{debug, trace};

use super::paths::Path;
use super::{Connection, ConnectionError, Event};
use crate::frame::{AddAddressFrame, ClosePathFrame, PathsFrame};
use crate::protocol::{PathId, Perspective};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("unknown IP version {0}")]
    UnknownIpVersion(u8),
    #[error("trying to create an already existing path")]
    PathAlreadyExists,
    #[error("path ID parity does not match the initiating side")]
    BadPathIdParity,
    #[error("malformed path address")]
    InvalidPathAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathManagerState {
    WaitingHandshake,
    Running,
    Closed,
}

/// Bookkeeping for path creation.
pub(crate) struct PathManager {
    state: PathManagerState,
    /// Next locally allocated path id; advances by two, preserving the
    /// parity rule (client-initiated even, server-initiated odd).
    next_path_id: u8,
    remote_addrs_v4: Vec<SocketAddr>,
    remote_addrs_v6: Vec<SocketAddr>,
    local_addrs: Vec<SocketAddr>,
    advertised_local_addrs: FxHashSet<SocketAddr>,
}

impl PathManager {
    pub(crate) fn new(
        perspective: Perspective,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Self {
        let next_path_id = match perspective {
            Perspective::Client => 2,
            Perspective::Server => 1,
        };
        let mut remote_addrs_v4 = Vec::new();
        let mut remote_addrs_v6 = Vec::new();
        if remote_addr.is_ipv4() {
            remote_addrs_v4.push(remote_addr);
        } else {
            remote_addrs_v6.push(remote_addr);
        }
        Self {
            state: PathManagerState::WaitingHandshake,
            next_path_id,
            remote_addrs_v4,
            remote_addrs_v6,
            local_addrs: vec![local_addr],
            advertised_local_addrs: FxHashSet::default(),
        }
    }

    pub(crate) fn add_local_address(&mut self, address: SocketAddr) {
        if !self.local_addrs.contains(&address) {
            self.local_addrs.push(address);
        }
    }

    fn allocate_path_id(&mut self) -> PathId {
        let path_id = PathId(self.next_path_id);
        self.next_path_id += 2;
        path_id
    }

    fn is_running(&self) -> bool {
        self.state == PathManagerState::Running
    }
}

impl Connection {
    pub(crate) fn on_handshake_complete(&mut self, now: Instant) -> Result<(), ConnectionError> {
        if self.path_manager.state != PathManagerState::WaitingHandshake {
            return Ok(());
        }
        self.path_manager.state = PathManagerState::Running;
        if self.config.create_paths {
            self.create_paths(now)?;
        }
        Ok(())
    }

    /// The set of usable local addresses changed; try to realise new
    /// paths.
    pub(crate) fn on_local_addresses_changed(&mut self, now: Instant) -> Result<(), ConnectionError> {
        if self.path_manager.is_running() && self.config.create_paths {
            self.create_paths(now)?;
        }
        Ok(())
    }

    /// Creates a path for every (local, remote) address pair of matching
    /// IP version that is not realised yet. Servers advertise their
    /// addresses instead; only clients open paths for now.
    fn create_paths(&mut self, now: Instant) -> Result<(), ConnectionError> {
        if self.perspective.is_server() {
            self.advertise_addresses();
            return Ok(());
        }

        let mut pairs = Vec::new();
        for &local in &self.path_manager.local_addrs {
            let remotes = if local.is_ipv4() {
                &self.path_manager.remote_addrs_v4
            } else {
                &self.path_manager.remote_addrs_v6
            };
            for &remote in remotes {
                pairs.push((local, remote));
            }
        }
        let mut created_any = false;
        for (local, remote) in pairs {
            created_any |= self.create_path(local, remote, now)?;
        }
        if created_any {
            self.schedule_paths_frame();
        }
        Ok(())
    }

    /// Creates a single locally initiated path, unless the 4-tuple is
    /// already realised. Returns whether a path was created.
    fn create_path(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        now: Instant,
    ) -> Result<bool, ConnectionError> {
        if self
            .paths
            .values()
            .any(|path| path.local_addr == local && path.remote_addr == remote)
        {
            return Ok(false);
        }

        let path_id = self.path_manager.allocate_path_id();
        let seed = self.config.path_seed(local.ip());
        let path = Path::new(path_id, local, remote, seed, self.config.bandwidth_filter);
        debug!(
            %path_id,
            %local,
            %remote,
            rtt = ?path.smoothed_rtt(),
            "created path"
        );
        self.paths.insert(path_id, path);
        self.open_paths.push(path_id);
        self.push_event(Event::PathCreated { id: path_id });

        // A PING probes the new path's latency and informs the peer of
        // its existence.
        self.send_ping(path_id, now)?;
        Ok(true)
    }

    /// Creates a path from an incoming packet carrying an unknown path
    /// id. The id must carry the peer's parity.
    pub(crate) fn create_path_from_remote(
        &mut self,
        path_id: PathId,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<PathId, ConnectionError> {
        if self.paths.contains_key(&path_id) {
            return Err(PathError::PathAlreadyExists.into());
        }
        let peer_initiated = match self.perspective {
            Perspective::Client => !path_id.client_initiated(),
            Perspective::Server => path_id.client_initiated(),
        };
        if !peer_initiated {
            return Err(PathError::BadPathIdParity.into());
        }

        let seed = self.config.path_seed(remote.ip());
        let path = Path::new(path_id, local, remote, seed, self.config.bandwidth_filter);
        debug!(%path_id, %local, %remote, "created path from remote");
        self.paths.insert(path_id, path);
        self.open_paths.push(path_id);
        self.push_event(Event::PathCreated { id: path_id });
        Ok(path_id)
    }

    /// Realises the paths a peer announced in a PATHS frame.
    pub(crate) fn handle_paths_frame(
        &mut self,
        frame: &PathsFrame,
        _now: Instant,
    ) -> Result<(), ConnectionError> {
        let local = self.paths[&PathId::INITIAL].local_addr;
        for entry in &frame.entries {
            if self.paths.contains_key(&entry.path_id) {
                // Already known; check the next entry.
                continue;
            }
            let ip = entry
                .remote_ip
                .parse()
                .map_err(|_| PathError::InvalidPathAddress)?;
            let port: u16 = entry
                .remote_port
                .parse()
                .map_err(|_| PathError::InvalidPathAddress)?;
            self.create_path_from_remote(entry.path_id, local, SocketAddr::new(ip, port))?;
        }
        Ok(())
    }

    /// Buffers a remote address advertisement and tries to realise new
    /// paths from it.
    pub(crate) fn handle_add_address_frame(
        &mut self,
        frame: AddAddressFrame,
        now: Instant,
    ) -> Result<(), ConnectionError> {
        match frame.ip_version {
            4 => self.path_manager.remote_addrs_v4.push(frame.address),
            6 => self.path_manager.remote_addrs_v6.push(frame.address),
            version => return Err(PathError::UnknownIpVersion(version).into()),
        }
        trace!(address = %frame.address, "peer advertised address");
        if self.path_manager.is_running() && self.config.create_paths {
            self.create_paths(now)?;
        }
        Ok(())
    }

    /// Queues ADD_ADDRESS frames for local addresses not yet advertised.
    fn advertise_addresses(&mut self) {
        let locals = self.path_manager.local_addrs.clone();
        for address in locals {
            if self.path_manager.advertised_local_addrs.insert(address) {
                self.streams.queue_add_address_frame(AddAddressFrame::new(address));
            }
        }
    }

    /// Closes a path locally: tells the peer via CLOSE_PATH and tears the
    /// path down for sending. A second close of the same path is a no-op.
    pub fn close_path(&mut self, path_id: PathId) {
        let path = match self.paths.get_mut(&path_id) {
            Some(path) => path,
            None => return,
        };
        if !path.open {
            return;
        }
        let frame = match path.take_ack_frame() {
            Some(ack) => ClosePathFrame {
                path_id,
                largest_acked: ack.largest_acked,
                lowest_acked: ack.lowest_acked,
                ack_ranges: ack.ack_ranges,
            },
            None => ClosePathFrame {
                path_id,
                largest_acked: 0,
                lowest_acked: 0,
                ack_ranges: Vec::new(),
            },
        };
        self.streams.queue_close_path_frame(frame);
        self.teardown_path(path_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{client_connection, server_connection};
    use assert_matches::assert_matches;

    #[test]
    fn client_creates_paths_once_the_handshake_completes() {
        let mut connection = client_connection();
        let now = Instant::now();
        connection.add_local_address("10.0.1.1:6121".parse().unwrap(), now);
        assert_eq!(connection.paths.len(), 1);

        connection.set_handshake_complete(now);
        // One new path: the second local address paired with the known
        // remote. The initial 4-tuple is not duplicated.
        assert_eq!(connection.paths.len(), 2);
        assert!(connection.paths.contains_key(&PathId(2)));
        assert_matches!(connection.poll(), Some(Event::PathCreated { id: PathId(2) }));
        // The new path was probed with a PING.
        let transmit = connection.poll_transmit().expect("probe packet");
        assert_eq!(transmit.path_id, PathId(2));
    }

    #[test]
    fn locally_allocated_path_ids_advance_by_two() {
        let mut connection = client_connection();
        let now = Instant::now();
        connection.add_local_address("10.0.1.1:6121".parse().unwrap(), now);
        connection.set_handshake_complete(now);
        connection.add_local_address("10.0.2.1:6121".parse().unwrap(), now);
        assert!(connection.paths.contains_key(&PathId(2)));
        assert!(connection.paths.contains_key(&PathId(4)));
    }

    #[test]
    fn server_advertises_addresses_instead_of_creating_paths() {
        let mut connection = server_connection();
        let now = Instant::now();
        connection.set_handshake_complete(now);
        assert_eq!(connection.paths.len(), 1);
        let frame = connection
            .streams
            .pop_add_address_frame()
            .expect("ADD_ADDRESS queued");
        assert_eq!(frame.ip_version, 4);
    }

    #[test]
    fn remote_path_creation_validates_id_parity() {
        let mut connection = client_connection();
        let local = "10.0.0.1:6121".parse().unwrap();
        let remote = "10.1.0.1:4433".parse().unwrap();

        // Even ids are client territory; a server must not use them.
        assert_matches!(
            connection.create_path_from_remote(PathId(2), local, remote),
            Err(ConnectionError::Path(PathError::BadPathIdParity))
        );
        connection
            .create_path_from_remote(PathId(3), local, remote)
            .unwrap();
        assert_matches!(
            connection.create_path_from_remote(PathId(3), local, remote),
            Err(ConnectionError::Path(PathError::PathAlreadyExists))
        );
    }

    #[test]
    fn paths_frame_realises_unknown_paths() {
        let mut connection = client_connection();
        let now = Instant::now();
        let frame = PathsFrame {
            entries: vec![crate::frame::PathsEntry {
                path_id: PathId(3),
                remote_ip: "10.1.0.2".into(),
                remote_port: "4433".into(),
            }],
        };
        connection.handle_paths_frame(&frame, now).unwrap();
        assert!(connection.paths.contains_key(&PathId(3)));
        // Replaying the same frame is harmless.
        connection.handle_paths_frame(&frame, now).unwrap();
    }

    #[test]
    fn unknown_ip_version_is_rejected() {
        let mut connection = client_connection();
        let now = Instant::now();
        let frame = AddAddressFrame {
            ip_version: 9,
            address: "10.1.0.9:4433".parse().unwrap(),
        };
        assert_matches!(
            connection.handle_add_address_frame(frame, now),
            Err(ConnectionError::Path(PathError::UnknownIpVersion(9)))
        );
    }

    #[test]
    fn local_path_close_is_idempotent_and_tells_the_peer() {
        let mut connection = client_connection();
        connection.close_path(PathId::INITIAL);
        assert!(!connection.path(PathId::INITIAL).open);
        assert!(connection.streams.pop_close_path_frame().is_some());

        connection.close_path(PathId::INITIAL);
        assert!(connection.streams.pop_close_path_frame().is_none());
    }
}
