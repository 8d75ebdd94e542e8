//! Connection state and logic.
//!
//! A [`Connection`] is a sans-I/O state machine: the embedder decrypts and
//! demultiplexes datagrams, then feeds frames in through
//! [`handle_frame`](Connection::handle_frame), drives timers via
//! [`poll_timeout`](Connection::poll_timeout) /
//! [`handle_timeout`](Connection::handle_timeout), triggers send ticks with
//! [`send_tick`](Connection::send_tick), and ships the resulting
//! [`Transmit`]s. Application-visible happenings surface through
//! [`poll`](Connection::poll).

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::crypto::CryptoSetup;
use crate::flow::FlowControl;
use crate::frame::{
    AckFrame, ConnectionCloseFrame, Frame, FrameError, PathsEntry, PathsFrame,
};
use crate::protocol::{
    ByteCount, ConnectionId, PacketNumber, PathId, Perspective, StreamId, Version,
};

mod packer;
pub use packer::PackError;
use packer::{PackedPacket, PacketPacker};

mod path_manager;
pub use path_manager::PathError;
use path_manager::PathManager;

mod paths;
use paths::Path;

mod scheduler;
use scheduler::Scheduler;

mod sent_packets;
pub use sent_packets::{AckError, SentPacket};

mod streams;
pub use streams::StreamPriority;
use streams::StreamsState;

/// QUIC error codes used in CONNECTION_CLOSE frames.
pub(crate) mod error_codes {
    pub const INTERNAL_ERROR: u32 = 1;
    pub const INVALID_ACK_DATA: u32 = 51;
}

/// A datagram to be sent over UDP.
#[derive(Debug)]
pub struct Transmit {
    pub path_id: PathId,
    pub local_addr: SocketAddr,
    pub destination: SocketAddr,
    pub contents: Vec<u8>,
}

/// Things the application learns via [`Connection::poll`].
#[derive(Debug)]
pub enum Event {
    /// A new path was established and probed.
    PathCreated { id: PathId },
    /// A path was torn down for sending.
    PathClosed { id: PathId },
    /// The connection is no longer usable.
    ConnectionLost { error: ConnectionError },
}

/// Reasons why a connection might be lost.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Ack(#[from] AckError),
    #[error(transparent)]
    Pack(#[from] PackError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// The peer closed the connection.
    #[error("aborted by peer: {error_code:#x} ({reason_phrase})")]
    PeerClosed { error_code: u32, reason_phrase: String },
}

impl ConnectionError {
    fn error_code(&self) -> u32 {
        match self {
            Self::Ack(
                AckError::AckForSkippedPacket
                | AckError::AckForUnsentPacket
                | AckError::DuplicateOrOutOfOrderAck,
            ) => error_codes::INVALID_ACK_DATA,
            Self::PeerClosed { error_code, .. } => *error_code,
            _ => error_codes::INTERNAL_ERROR,
        }
    }
}

/// Protocol state for one multipath connection.
pub struct Connection {
    pub(crate) connection_id: ConnectionId,
    pub(crate) perspective: Perspective,
    pub(crate) version: Version,
    pub(crate) config: Config,

    crypto: Box<dyn CryptoSetup>,
    flow: Box<dyn FlowControl>,

    /// All paths, keyed and iterated in path-id order so every send tick is
    /// deterministic.
    pub(crate) paths: BTreeMap<PathId, Path>,
    /// Paths still open for sending, in creation order.
    pub(crate) open_paths: Vec<PathId>,

    pub(crate) streams: StreamsState,
    pub(crate) packer: PacketPacker,
    pub(crate) scheduler: Scheduler,
    pub(crate) path_manager: PathManager,

    /// Which paths each stream has been assigned to.
    pub(crate) stream_to_path: FxHashMap<StreamId, Vec<PathId>>,

    pub(crate) handshake_complete: bool,
    /// Peer reported itself blocked; answered with window updates on the
    /// next ack round.
    pub(crate) peer_blocked: bool,
    closed: bool,

    events: VecDeque<Event>,
    transmits: VecDeque<Transmit>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection_id: ConnectionId,
        perspective: Perspective,
        version: Version,
        config: Config,
        crypto: Box<dyn CryptoSetup>,
        flow: Box<dyn FlowControl>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Self {
        let packer = PacketPacker::new(
            connection_id,
            perspective,
            version,
            config.truncate_connection_id,
        );
        let initial_path = Path::new(
            PathId::INITIAL,
            local_addr,
            remote_addr,
            config.path_seed(local_addr.ip()),
            config.bandwidth_filter,
        );
        let mut paths = BTreeMap::new();
        paths.insert(PathId::INITIAL, initial_path);

        let path_manager = PathManager::new(perspective, local_addr, remote_addr);

        Self {
            connection_id,
            perspective,
            version,
            config,
            crypto,
            flow,
            paths,
            open_paths: vec![PathId::INITIAL],
            streams: StreamsState::new(),
            packer,
            scheduler: Scheduler::new(),
            path_manager,
            stream_to_path: FxHashMap::default(),
            handshake_complete: false,
            peer_blocked: false,
            closed: false,
            events: VecDeque::new(),
            transmits: VecDeque::new(),
        }
    }

    /// Marks the handshake as complete, unlocking multipath headers and
    /// path creation.
    pub fn set_handshake_complete(&mut self, now: Instant) {
        self.handshake_complete = true;
        self.packer.set_handshake_complete();
        if let Err(error) = self.on_handshake_complete(now) {
            warn!(%error, "path setup after handshake failed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn perspective(&self) -> Perspective {
        self.perspective
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Registers a local address usable for additional paths.
    pub fn add_local_address(&mut self, address: SocketAddr, now: Instant) {
        self.path_manager.add_local_address(address);
        if self.handshake_complete {
            if let Err(error) = self.on_local_addresses_changed(now) {
                warn!(%error, "path creation for new local address failed");
            }
        }
    }

    /// Opens a stream for writing.
    pub fn open_stream(&mut self, stream_id: StreamId, priority: StreamPriority) {
        self.streams.open_stream(stream_id, priority);
    }

    /// Appends data to a stream's write buffer.
    pub fn write_stream(&mut self, stream_id: StreamId, data: &[u8]) {
        self.streams.write(stream_id, data);
    }

    /// Marks a stream as finished; a FIN goes out with its last frame.
    pub fn finish_stream(&mut self, stream_id: StreamId) {
        self.streams.finish(stream_id);
    }

    /// Deposits the acknowledgement the receive side wants delivered for
    /// packets received on `path_id`.
    pub fn queue_ack(&mut self, path_id: PathId, ack: AckFrame) {
        if let Some(path) = self.paths.get_mut(&path_id) {
            path.queue_ack(ack);
        }
    }

    /// Feeds one decrypted frame received on `path_id` into the state
    /// machine. `with_packet_number` is the number of the packet that
    /// carried the frame.
    pub fn handle_frame(
        &mut self,
        path_id: PathId,
        frame: Frame,
        with_packet_number: PacketNumber,
        now: Instant,
    ) -> Result<(), ConnectionError> {
        if self.closed {
            return Ok(());
        }
        if let Some(path) = self.paths.get_mut(&path_id) {
            path.on_network_activity(now);
        }
        let result = self.handle_frame_inner(path_id, frame, with_packet_number, now);
        if let Err(error) = result {
            self.close_with_error(error);
            return Ok(());
        }
        Ok(())
    }

    fn handle_frame_inner(
        &mut self,
        path_id: PathId,
        frame: Frame,
        with_packet_number: PacketNumber,
        now: Instant,
    ) -> Result<(), ConnectionError> {
        match frame {
            Frame::Ack(ack) => {
                let path = match self.paths.get_mut(&ack.path_id) {
                    Some(path) => path,
                    None => {
                        debug!(path_id = %ack.path_id, "ACK for unknown path");
                        return Ok(());
                    }
                };
                path.sent_packets
                    .received_ack(&ack, with_packet_number, now)?;
            }
            Frame::ClosePath(frame) => {
                let close_path_id = frame.path_id;
                if let Some(path) = self.paths.get_mut(&close_path_id) {
                    path.sent_packets
                        .received_close_path(&frame, with_packet_number, now)?;
                }
                self.teardown_path(close_path_id);
            }
            Frame::AddAddress(frame) => {
                self.handle_add_address_frame(frame, now)?;
            }
            Frame::Paths(frame) => {
                self.handle_paths_frame(&frame, now)?;
            }
            Frame::Blocked(_) => {
                self.peer_blocked = true;
            }
            Frame::ConnectionClose(frame) => {
                trace!(code = frame.error_code, "peer closed the connection");
                self.closed = true;
                self.events.push_back(Event::ConnectionLost {
                    error: ConnectionError::PeerClosed {
                        error_code: frame.error_code,
                        reason_phrase: frame.reason_phrase,
                    },
                });
            }
            Frame::Ping | Frame::WindowUpdate(_) | Frame::RstStream(_) => {
                // Nothing for the transport core to do: PING only elicits
                // an ACK, and window bookkeeping lives in the flow layer.
            }
            Frame::StopWaiting(_) | Frame::Stream(_) => {
                // Receive-side state (ack generation, reassembly) is
                // maintained by the embedder.
                let _ = path_id;
            }
        }
        Ok(())
    }

    /// Converts an internal error into a CONNECTION_CLOSE towards the
    /// peer and surfaces it as an event.
    pub(crate) fn close_with_error(&mut self, error: ConnectionError) {
        if self.closed {
            return;
        }
        self.closed = true;
        let frame = ConnectionCloseFrame {
            error_code: error.error_code(),
            reason_phrase: error.to_string(),
        };
        warn!(%error, "closing connection");
        let packed = {
            let path = self
                .paths
                .get_mut(&PathId::INITIAL)
                .expect("initial path always exists");
            self.packer.pack_connection_close(frame, path, &*self.crypto)
        };
        match packed {
            Ok(packet) => {
                // The close packet is fire-and-forget; it is not tracked
                // for retransmission.
                let path = &self.paths[&PathId::INITIAL];
                self.transmits.push_back(Transmit {
                    path_id: PathId::INITIAL,
                    local_addr: path.local_addr,
                    destination: path.remote_addr,
                    contents: packet.raw,
                });
            }
            Err(error) => warn!(%error, "failed to pack CONNECTION_CLOSE"),
        }
        self.events.push_back(Event::ConnectionLost { error });
    }

    /// Closes the connection from the application side.
    pub fn close(&mut self, error_code: u32, reason_phrase: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let frame = ConnectionCloseFrame {
            error_code,
            reason_phrase: reason_phrase.to_owned(),
        };
        let packed = {
            let path = self
                .paths
                .get_mut(&PathId::INITIAL)
                .expect("initial path always exists");
            self.packer.pack_connection_close(frame, path, &*self.crypto)
        };
        if let Ok(packet) = packed {
            let path = &self.paths[&PathId::INITIAL];
            self.transmits.push_back(Transmit {
                path_id: PathId::INITIAL,
                local_addr: path.local_addr,
                destination: path.remote_addr,
                contents: packet.raw,
            });
        }
        self.close_paths();
    }

    /// Tears a path down for sending; reliability state survives so its
    /// outstanding data is redistributed. Idempotent.
    pub(crate) fn teardown_path(&mut self, path_id: PathId) {
        let path = match self.paths.get_mut(&path_id) {
            Some(path) => path,
            None => return,
        };
        if !path.open {
            return;
        }
        path.open = false;
        self.open_paths.retain(|id| *id != path_id);
        trace!(%path_id, "path torn down for sending");

        // Everything queued on the dead path must find a new home.
        self.requeue_path_retransmissions(path_id);
        self.events.push_back(Event::PathClosed { id: path_id });
    }

    /// Drains a path's retransmission queue back into the stream framer
    /// and control queues so other paths can carry the data.
    fn requeue_path_retransmissions(&mut self, path_id: PathId) {
        loop {
            let packet = {
                let path = match self.paths.get_mut(&path_id) {
                    Some(path) => path,
                    None => return,
                };
                match path.sent_packets.dequeue_packet_for_retransmission() {
                    Some(packet) => packet,
                    None => return,
                }
            };
            self.requeue_frames_for_retransmission(packet, path_id);
        }
    }

    /// Re-queues the retransmittable frames of a lost packet: STREAM
    /// frames through the framer, WINDOW_UPDATEs only while still
    /// current, PATHS frames as a freshly scheduled one.
    pub(crate) fn requeue_frames_for_retransmission(
        &mut self,
        packet: SentPacket,
        path_id: PathId,
    ) {
        for frame in packet.frames {
            match frame {
                Frame::Stream(frame) => {
                    self.streams.add_frame_for_retransmission(frame);
                }
                Frame::WindowUpdate(frame) => {
                    // Drop stale window updates: only retransmit if no
                    // higher offset has been advertised since.
                    match self.flow.receive_window(frame.stream_id) {
                        Some(current) if frame.byte_offset >= current => {
                            self.packer
                                .queue_control_frame(Frame::WindowUpdate(frame), path_id);
                        }
                        _ => {}
                    }
                }
                Frame::Paths(_) => {
                    self.schedule_paths_frame();
                }
                frame => {
                    self.packer.queue_control_frame(frame, path_id);
                }
            }
        }
    }

    /// Queues a fresh PATHS frame describing the currently open paths.
    pub(crate) fn schedule_paths_frame(&mut self) {
        let entries: Vec<PathsEntry> = self
            .open_paths
            .iter()
            .filter_map(|path_id| self.paths.get(path_id))
            .map(|path| PathsEntry {
                path_id: path.path_id,
                remote_ip: path.remote_addr.ip().to_string(),
                remote_port: path.remote_addr.port().to_string(),
            })
            .collect();
        self.streams.queue_paths_frame(PathsFrame { entries });
    }

    /// Sends a PING on the given path to probe it.
    pub(crate) fn send_ping(&mut self, path_id: PathId, now: Instant) -> Result<(), ConnectionError> {
        let packet = {
            let path = match self.paths.get_mut(&path_id) {
                Some(path) => path,
                None => return Ok(()),
            };
            self.packer
                .pack_ping(path, &mut self.streams, &mut *self.flow, &*self.crypto)?
        };
        if let Some(packet) = packet {
            self.send_packed_packet(path_id, packet, now)?;
        }
        Ok(())
    }

    /// Registers a packed packet with the path's reliability engine and
    /// queues the datagram for transmission.
    pub(crate) fn send_packed_packet(
        &mut self,
        path_id: PathId,
        packet: PackedPacket,
        now: Instant,
    ) -> Result<(), ConnectionError> {
        let path = self
            .paths
            .get_mut(&path_id)
            .expect("packed packet for unknown path");
        let sent = SentPacket {
            packet_number: packet.number,
            length: packet.raw.len() as ByteCount,
            frames: packet.frames,
            send_time: now,
            encryption_level: packet.encryption_level,
        };
        path.sent_packets.sent_packet(sent, now)?;
        self.transmits.push_back(Transmit {
            path_id,
            local_addr: path.local_addr,
            destination: path.remote_addr,
            contents: packet.raw,
        });
        Ok(())
    }

    /// The earliest instant at which [`handle_timeout`](Self::handle_timeout)
    /// must be called.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.paths
            .values()
            .filter_map(|path| path.sent_packets.alarm_timeout())
            .min()
    }

    /// Fires every expired loss-detection alarm.
    pub fn handle_timeout(&mut self, now: Instant) {
        let expired: Vec<PathId> = self
            .paths
            .iter()
            .filter(|(_, path)| {
                path.sent_packets
                    .alarm_timeout()
                    .is_some_and(|alarm| alarm <= now)
            })
            .map(|(&path_id, _)| path_id)
            .collect();

        let mut any_potentially_failed = false;
        for path_id in expired {
            let path = self.paths.get_mut(&path_id).expect("expired path exists");
            let last_activity = path.last_network_activity;
            let mut potentially_failed = false;
            path.sent_packets.on_alarm(now, |last_sent| {
                // An RTO without incoming traffic since the last send
                // means the path may be dead; move everything elsewhere.
                potentially_failed = last_activity.map_or(true, |at| at < last_sent);
                potentially_failed
            });
            if potentially_failed {
                trace!(%path_id, "path potentially failed after RTO");
                path.potentially_failed = true;
                any_potentially_failed = true;
            }
        }
        if any_potentially_failed {
            self.schedule_paths_frame();
        }
    }

    /// The next datagram to put on the wire, if any.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// The next application-visible event, if any.
    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub(crate) fn push_event(&mut self, event: Event) {
        self.events.push_back(event);
    }

    fn close_paths(&mut self) {
        let path_ids: Vec<PathId> = self.open_paths.clone();
        for path_id in path_ids {
            self.teardown_path(path_id);
        }
    }

    /// Splits the borrows needed by the packer.
    pub(crate) fn pack_parts(
        &mut self,
        path_id: PathId,
    ) -> (
        &mut PacketPacker,
        &mut Path,
        &mut StreamsState,
        &mut dyn FlowControl,
        &dyn CryptoSetup,
    ) {
        let path = self
            .paths
            .get_mut(&path_id)
            .expect("pack_parts for unknown path");
        (
            &mut self.packer,
            path,
            &mut self.streams,
            &mut *self.flow,
            &*self.crypto,
        )
    }

    pub(crate) fn window_update_frames(&mut self, force_connection: bool) -> Vec<Frame> {
        self.flow
            .window_updates(force_connection)
            .into_iter()
            .map(Frame::WindowUpdate)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn path(&self, path_id: PathId) -> &Path {
        &self.paths[&path_id]
    }
}
