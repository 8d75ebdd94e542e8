//! Packet assembly and sealing.
//!
//! Frame order inside a packet is STOP_WAITING, ACK, queued control frames
//! (popped LIFO), then stream frames with retransmissions first. The last
//! stream frame omits its explicit data length to reclaim two bytes.

use rustc_hash::FxHashMap;
use thiserror::Error;

use super::paths::Path;
use super::streams::{StreamSelector, StreamsState};
use crate::crypto::{CryptoSetup, Sealer};
use crate::flow::FlowControl;
use crate::frame::{AckFrame, ConnectionCloseFrame, Frame, FrameError, StopWaitingFrame};
use crate::packet::{PacketNumberLen, PublicHeader};
use crate::protocol::{
    ByteCount, ConnectionId, EncryptionLevel, PacketNumber, PathId, Perspective, StreamId,
    Version, MAX_PACKET_SIZE, NON_FORWARD_SECURE_PACKET_SIZE_REDUCTION,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PackError {
    #[error("packet too large")]
    PacketTooLarge,
    #[error("peeked and popped packet numbers do not match")]
    PeekPopMismatch,
    #[error("forward-secure encrypted handshake packets don't need special treatment")]
    ForwardSecureHandshakeRetransmission,
    #[error("handshake retransmissions must contain a STOP_WAITING frame")]
    HandshakeRetransmissionMissingStopWaiting,
    #[error("no ACK frame queued")]
    NoAckFrameQueued,
    #[error("no sealer available for the requested encryption level")]
    SealerUnavailable,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A finished packet, sealed and ready to hand to the wire.
#[derive(Debug)]
pub(crate) struct PackedPacket {
    pub(crate) number: PacketNumber,
    pub(crate) raw: Vec<u8>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) encryption_level: EncryptionLevel,
}

/// How stream frames are sourced for a packet.
enum PackTarget {
    /// Any stream.
    Any,
    /// Only streams assigned to the path being packed.
    OfPath,
    /// Only the given stream.
    OfStream(StreamId),
}

pub(crate) struct PacketPacker {
    connection_id: ConnectionId,
    perspective: Perspective,
    version: Version,
    truncate_connection_id: bool,
    handshake_complete: bool,

    control_frames: Vec<Frame>,
    stop_waiting: FxHashMap<PathId, StopWaitingFrame>,
    ack_frames: FxHashMap<PathId, AckFrame>,
}

impl PacketPacker {
    pub(crate) fn new(
        connection_id: ConnectionId,
        perspective: Perspective,
        version: Version,
        truncate_connection_id: bool,
    ) -> Self {
        Self {
            connection_id,
            perspective,
            version,
            truncate_connection_id,
            handshake_complete: false,
            control_frames: Vec::new(),
            stop_waiting: FxHashMap::default(),
            ack_frames: FxHashMap::default(),
        }
    }

    pub(crate) fn set_handshake_complete(&mut self) {
        self.handshake_complete = true;
    }

    /// Queues a frame for the next packet on `path_id`. STOP_WAITING and
    /// ACK frames replace any previously queued one for the path; all
    /// other control frames accumulate.
    pub(crate) fn queue_control_frame(&mut self, frame: Frame, path_id: PathId) {
        match frame {
            Frame::StopWaiting(swf) => {
                self.stop_waiting.insert(path_id, swf);
            }
            Frame::Ack(ack) => {
                self.ack_frames.insert(path_id, ack);
            }
            frame => self.control_frames.push(frame),
        }
    }

    /// Packs a packet that contains nothing but a CONNECTION_CLOSE frame.
    pub(crate) fn pack_connection_close(
        &mut self,
        frame: ConnectionCloseFrame,
        path: &mut Path,
        crypto: &dyn CryptoSetup,
    ) -> Result<PackedPacket, PackError> {
        let frames = vec![Frame::ConnectionClose(frame)];
        let (encryption_level, sealer) = crypto.sealer();
        let header = self.public_header(encryption_level, path, crypto);
        let raw = self.write_and_seal(&header, &frames, sealer, path)?;
        Ok(PackedPacket {
            number: header.packet_number,
            raw,
            frames,
            encryption_level,
        })
    }

    /// Prepends a PING and falls through to normal packing.
    pub(crate) fn pack_ping(
        &mut self,
        path: &mut Path,
        streams: &mut StreamsState,
        flow: &mut dyn FlowControl,
        crypto: &dyn CryptoSetup,
    ) -> Result<Option<PackedPacket>, PackError> {
        path.set_least_unacked(path.sent_packets.get_least_unacked());
        self.control_frames.insert(0, Frame::Ping);
        self.pack_packet(path, streams, flow, crypto)
    }

    /// Emits the queued ACK, plus the queued STOP_WAITING if any.
    pub(crate) fn pack_ack_packet(
        &mut self,
        path: &mut Path,
        crypto: &dyn CryptoSetup,
    ) -> Result<PackedPacket, PackError> {
        let ack = self
            .ack_frames
            .remove(&path.path_id)
            .ok_or(PackError::NoAckFrameQueued)?;
        let (encryption_level, sealer) = crypto.sealer();
        let header = self.public_header(encryption_level, path, crypto);
        let mut frames = vec![Frame::Ack(ack)];
        if let Some(mut swf) = self.stop_waiting.remove(&path.path_id) {
            swf.packet_number = Some(header.packet_number);
            swf.packet_number_len = Some(header.packet_number_len);
            frames.push(Frame::StopWaiting(swf));
        }
        let raw = self.write_and_seal(&header, &frames, sealer, path)?;
        Ok(PackedPacket {
            number: header.packet_number,
            raw,
            frames,
            encryption_level,
        })
    }

    /// Retransmits a handshake packet that was sent below forward-secure
    /// encryption, re-sealed under its original level.
    pub(crate) fn pack_handshake_retransmission(
        &mut self,
        packet: &super::sent_packets::SentPacket,
        path: &mut Path,
        crypto: &dyn CryptoSetup,
    ) -> Result<PackedPacket, PackError> {
        if packet.encryption_level == EncryptionLevel::ForwardSecure {
            return Err(PackError::ForwardSecureHandshakeRetransmission);
        }
        let sealer = crypto
            .sealer_with_encryption_level(packet.encryption_level)
            .ok_or(PackError::SealerUnavailable)?;
        let mut swf = self
            .stop_waiting
            .remove(&path.path_id)
            .ok_or(PackError::HandshakeRetransmissionMissingStopWaiting)?;
        let header = self.public_header(packet.encryption_level, path, crypto);
        swf.packet_number = Some(header.packet_number);
        swf.packet_number_len = Some(header.packet_number_len);
        let mut frames = vec![Frame::StopWaiting(swf)];
        frames.extend(packet.frames.iter().cloned());
        let raw = self.write_and_seal(&header, &frames, sealer, path)?;
        Ok(PackedPacket {
            number: header.packet_number,
            raw,
            frames,
            encryption_level: packet.encryption_level,
        })
    }

    /// Packs a packet sourcing stream frames from any stream.
    pub(crate) fn pack_packet(
        &mut self,
        path: &mut Path,
        streams: &mut StreamsState,
        flow: &mut dyn FlowControl,
        crypto: &dyn CryptoSetup,
    ) -> Result<Option<PackedPacket>, PackError> {
        self.pack_packet_inner(path, streams, flow, crypto, PackTarget::Any)
    }

    /// Packs a packet restricted to the streams assigned to `path`.
    pub(crate) fn pack_packet_of_path(
        &mut self,
        path: &mut Path,
        streams: &mut StreamsState,
        flow: &mut dyn FlowControl,
        crypto: &dyn CryptoSetup,
    ) -> Result<Option<PackedPacket>, PackError> {
        self.pack_packet_inner(path, streams, flow, crypto, PackTarget::OfPath)
    }

    /// Packs a packet restricted to a single stream.
    pub(crate) fn pack_packet_of_stream(
        &mut self,
        path: &mut Path,
        streams: &mut StreamsState,
        flow: &mut dyn FlowControl,
        crypto: &dyn CryptoSetup,
        stream_id: StreamId,
    ) -> Result<Option<PackedPacket>, PackError> {
        self.pack_packet_inner(path, streams, flow, crypto, PackTarget::OfStream(stream_id))
    }

    fn pack_packet_inner(
        &mut self,
        path: &mut Path,
        streams: &mut StreamsState,
        flow: &mut dyn FlowControl,
        crypto: &dyn CryptoSetup,
        target: PackTarget,
    ) -> Result<Option<PackedPacket>, PackError> {
        if streams.has_crypto_stream_frame() {
            return self.pack_crypto_packet(path, streams, crypto);
        }

        let (encryption_level, sealer) = crypto.sealer();
        let header = self.public_header(encryption_level, path, crypto);
        let header_len = header.len(self.perspective);

        if let Some(swf) = self.stop_waiting.get_mut(&path.path_id) {
            swf.packet_number = Some(header.packet_number);
            swf.packet_number_len = Some(header.packet_number_len);
        }

        // A queued PING short-circuits normal assembly.
        let payload_frames = if matches!(self.control_frames.first(), Some(Frame::Ping)) {
            vec![self.control_frames.remove(0)]
        } else {
            let max_frame_size =
                MAX_PACKET_SIZE - sealer.overhead() as ByteCount - header_len;
            let assigned;
            let selector = match target {
                PackTarget::Any => StreamSelector::Any,
                PackTarget::OfPath => {
                    assigned = path.stream_ids.clone();
                    StreamSelector::OfPath(path.path_id, &assigned)
                }
                PackTarget::OfStream(stream_id) => StreamSelector::OfStream(stream_id),
            };
            self.compose_next_packet(
                max_frame_size,
                self.can_send_data(encryption_level),
                path.path_id,
                selector,
                streams,
                flow,
            )?
        };

        // Refusal rules: nothing to send, or nothing but a STOP_WAITING.
        if payload_frames.is_empty() {
            return Ok(None);
        }
        if payload_frames.len() == 1 && self.stop_waiting.contains_key(&path.path_id) {
            return Ok(None);
        }
        self.stop_waiting.remove(&path.path_id);
        self.ack_frames.remove(&path.path_id);

        let raw = self.write_and_seal(&header, &payload_frames, sealer, path)?;
        Ok(Some(PackedPacket {
            number: header.packet_number,
            raw,
            frames: payload_frames,
            encryption_level,
        }))
    }

    /// Seals pending crypto-stream data under the handshake sealer with a
    /// reduced maximum size.
    fn pack_crypto_packet(
        &mut self,
        path: &mut Path,
        streams: &mut StreamsState,
        crypto: &dyn CryptoSetup,
    ) -> Result<Option<PackedPacket>, PackError> {
        let (encryption_level, sealer) = crypto.sealer_for_crypto_stream();
        let header = self.public_header(encryption_level, path, crypto);
        let header_len = header.len(self.perspective);
        let max_len = MAX_PACKET_SIZE
            - sealer.overhead() as ByteCount
            - NON_FORWARD_SECURE_PACKET_SIZE_REDUCTION
            - header_len;
        let mut frame = match streams.pop_crypto_stream_frame(max_len) {
            Some(frame) => frame,
            None => return Ok(None),
        };
        frame.data_len_present = false;
        let frames = vec![Frame::Stream(frame)];
        let raw = self.write_and_seal(&header, &frames, sealer, path)?;
        Ok(Some(PackedPacket {
            number: header.packet_number,
            raw,
            frames,
            encryption_level,
        }))
    }

    fn compose_next_packet(
        &mut self,
        mut max_frame_size: ByteCount,
        can_send_stream_frames: bool,
        path_id: PathId,
        selector: StreamSelector<'_>,
        streams: &mut StreamsState,
        flow: &mut dyn FlowControl,
    ) -> Result<Vec<Frame>, PackError> {
        let mut payload_length: ByteCount = 0;
        let mut payload_frames: Vec<Frame> = Vec::new();

        // STOP_WAITING and ACK will always fit.
        if let Some(swf) = self.stop_waiting.get(&path_id) {
            let frame = Frame::StopWaiting(swf.clone());
            payload_length += frame.min_len();
            payload_frames.push(frame);
        }
        if let Some(ack) = self.ack_frames.get(&path_id) {
            let frame = Frame::Ack(ack.clone());
            payload_length += frame.min_len();
            payload_frames.push(frame);
        }

        while let Some(frame) = self.control_frames.last() {
            let min_length = frame.min_len();
            if payload_length + min_length > max_frame_size {
                break;
            }
            payload_frames.push(self.control_frames.pop().unwrap());
            payload_length += min_length;
        }

        if payload_length > max_frame_size {
            return Err(PackError::PacketTooLarge);
        }

        if !can_send_stream_frames {
            return Ok(payload_frames);
        }

        // All size accounting above assumed stream frames with an explicit
        // data length. The final stream frame omits it, so the budget may
        // temporarily be two bytes larger and still produce a packet of
        // exactly the right size.
        max_frame_size += 2;

        let mut stream_frames =
            streams.pop_stream_frames(max_frame_size - payload_length, selector, flow);
        if let Some(last) = stream_frames.last_mut() {
            last.data_len_present = false;
        }
        payload_frames.extend(stream_frames.into_iter().map(Frame::Stream));

        while let Some(blocked) = streams.pop_blocked_frame() {
            self.control_frames.push(Frame::Blocked(blocked));
        }

        Ok(payload_frames)
    }

    fn public_header(
        &self,
        encryption_level: EncryptionLevel,
        path: &Path,
        crypto: &dyn CryptoSetup,
    ) -> PublicHeader {
        let packet_number = path.packet_number_generator.peek();
        let packet_number_len = PacketNumberLen::for_header(packet_number, path.least_unacked);
        let multipath_flag = self.handshake_complete && self.version.supports_multipath();

        let diversification_nonce = if self.perspective.is_server()
            && encryption_level == EncryptionLevel::Secure
        {
            crypto.diversification_nonce().copied()
        } else {
            None
        };

        PublicHeader {
            connection_id: self.connection_id,
            version_flag: self.perspective.is_client()
                && encryption_level != EncryptionLevel::ForwardSecure,
            version: self.version,
            multipath_flag,
            path_id: path.path_id,
            // In case of doubt, never truncate the connection ID of a
            // multipath connection.
            truncate_connection_id: if multipath_flag {
                false
            } else {
                self.truncate_connection_id
            },
            diversification_nonce,
            packet_number,
            packet_number_len,
        }
    }

    fn write_and_seal(
        &self,
        header: &PublicHeader,
        payload_frames: &[Frame],
        sealer: &dyn Sealer,
        path: &mut Path,
    ) -> Result<Vec<u8>, PackError> {
        let mut raw = Vec::with_capacity(MAX_PACKET_SIZE as usize);
        header.write(&mut raw, self.perspective);
        let payload_start = raw.len();
        for frame in payload_frames {
            frame.write(&mut raw)?;
        }
        if raw.len() + sealer.overhead() > MAX_PACKET_SIZE as usize {
            return Err(PackError::PacketTooLarge);
        }
        sealer.seal(&mut raw, payload_start, header.packet_number);

        let popped = path.packet_number_generator.pop();
        if popped != header.packet_number {
            return Err(PackError::PeekPopMismatch);
        }
        Ok(raw)
    }

    fn can_send_data(&self, encryption_level: EncryptionLevel) -> bool {
        if self.perspective.is_client() {
            encryption_level >= EncryptionLevel::Secure
        } else {
            encryption_level == EncryptionLevel::ForwardSecure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathStatsSeed;
    use crate::connection::sent_packets::SentPacket;
    use crate::connection::streams::StreamPriority;
    use crate::crypto::testing::StubCryptoSetup;
    use crate::flow::testing::OpenFlowControl;
    use crate::frame::RstStreamFrame;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use std::time::Instant;

    struct Fixture {
        packer: PacketPacker,
        path: Path,
        streams: StreamsState,
        flow: OpenFlowControl,
        crypto: StubCryptoSetup,
    }

    fn fixture(perspective: Perspective, seal_level: EncryptionLevel) -> Fixture {
        Fixture {
            packer: PacketPacker::new(
                ConnectionId(0x1337),
                perspective,
                Version::WHATEVER,
                false,
            ),
            path: Path::new(
                PathId::INITIAL,
                "127.0.0.1:6121".parse().unwrap(),
                "127.0.0.1:7331".parse().unwrap(),
                PathStatsSeed::default(),
                false,
            ),
            streams: StreamsState::new(),
            flow: OpenFlowControl::new(),
            crypto: StubCryptoSetup::new(seal_level),
        }
    }

    fn server_fixture() -> Fixture {
        fixture(Perspective::Server, EncryptionLevel::ForwardSecure)
    }

    impl Fixture {
        fn pack(&mut self) -> Result<Option<PackedPacket>, PackError> {
            self.packer
                .pack_packet(&mut self.path, &mut self.streams, &mut self.flow, &self.crypto)
        }
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn returns_none_when_nothing_is_queued() {
        let mut fx = server_fixture();
        assert!(fx.pack().unwrap().is_none());
    }

    #[test]
    fn packs_single_packets() {
        let mut fx = server_fixture();
        fx.streams.add_frame_for_retransmission(crate::frame::StreamFrame {
            stream_id: 5,
            offset: 0,
            fin: false,
            data_len_present: false,
            data: Bytes::from_static(&[0xDE, 0xCA, 0xFB, 0xAD]),
        });
        let packet = fx.pack().unwrap().expect("a packet");
        assert_eq!(packet.frames.len(), 1);
        assert!(contains(&packet.raw, &[0xDE, 0xCA, 0xFB, 0xAD]));
    }

    #[test]
    fn does_not_pack_a_packet_containing_only_a_stop_waiting_frame() {
        let mut fx = server_fixture();
        fx.packer.queue_control_frame(
            Frame::StopWaiting(StopWaitingFrame::new(10)),
            PathId::INITIAL,
        );
        assert!(fx.pack().unwrap().is_none());
    }

    #[test]
    fn sets_the_least_unacked_delta_length_of_a_stop_waiting_frame() {
        let mut fx = server_fixture();
        let packet_number: PacketNumber = 0xDECAFB; // results in a 4 byte packet number
        fx.path.packet_number_generator.next = packet_number;
        fx.packer.queue_control_frame(
            Frame::RstStream(RstStreamFrame::default()),
            PathId::INITIAL,
        );
        fx.packer.queue_control_frame(
            Frame::StopWaiting(StopWaitingFrame::new(packet_number - 0x100)),
            PathId::INITIAL,
        );
        let packet = fx.pack().unwrap().expect("a packet");
        assert_matches!(
            &packet.frames[0],
            Frame::StopWaiting(swf) if swf.packet_number_len == Some(PacketNumberLen::Four)
        );
    }

    #[test]
    fn packs_a_packet_with_queued_control_frames_only() {
        let mut fx = server_fixture();
        fx.packer
            .queue_control_frame(Frame::Blocked(crate::frame::BlockedFrame { stream_id: 0 }), PathId::INITIAL);
        let packet = fx.pack().unwrap().expect("a packet");
        assert_eq!(packet.frames.len(), 1);
    }

    #[test]
    fn increases_the_packet_number_only_when_a_packet_is_sent() {
        let mut fx = server_fixture();
        assert!(fx.pack().unwrap().is_none());
        assert_eq!(fx.path.packet_number_generator.peek(), 1);

        fx.packer
            .queue_control_frame(Frame::Ping, PathId::INITIAL);
        let packet = fx.pack().unwrap().expect("a packet");
        assert_eq!(packet.number, 1);
        assert_eq!(fx.path.packet_number_generator.peek(), 2);
    }

    #[test]
    fn packs_a_connection_close_alone() {
        let mut fx = server_fixture();
        // Other queued frames must not leak into a CONNECTION_CLOSE packet.
        fx.packer
            .queue_control_frame(Frame::Ping, PathId::INITIAL);
        let packet = fx
            .packer
            .pack_connection_close(
                ConnectionCloseFrame {
                    error_code: 0x1337,
                    reason_phrase: "test error".into(),
                },
                &mut fx.path,
                &fx.crypto,
            )
            .unwrap();
        assert_eq!(packet.frames.len(), 1);
        assert_matches!(&packet.frames[0], Frame::ConnectionClose(_));
    }

    #[test]
    fn refuses_to_send_a_packet_larger_than_max_packet_size() {
        let mut fx = server_fixture();
        let reason = "x".repeat(MAX_PACKET_SIZE as usize);
        let result = fx.packer.pack_connection_close(
            ConnectionCloseFrame {
                error_code: 0,
                reason_phrase: reason,
            },
            &mut fx.path,
            &fx.crypto,
        );
        assert_matches!(result, Err(PackError::PacketTooLarge));
    }

    #[test]
    fn packs_a_single_ack() {
        let mut fx = server_fixture();
        fx.packer.queue_control_frame(
            Frame::Ack(AckFrame {
                path_id: PathId::INITIAL,
                largest_acked: 1,
                lowest_acked: 1,
                delay_time: std::time::Duration::ZERO,
                ack_ranges: vec![],
            }),
            PathId::INITIAL,
        );
        let packet = fx
            .packer
            .pack_ack_packet(&mut fx.path, &fx.crypto)
            .unwrap();
        assert_eq!(packet.frames.len(), 1);
        assert_matches!(&packet.frames[0], Frame::Ack(_));
    }

    #[test]
    fn ack_packet_requires_a_queued_ack() {
        let mut fx = server_fixture();
        assert_matches!(
            fx.packer.pack_ack_packet(&mut fx.path, &fx.crypto),
            Err(PackError::NoAckFrameQueued)
        );
    }

    #[test]
    fn version_flag_tracks_encryption_level_on_the_client() {
        let mut fx = fixture(Perspective::Client, EncryptionLevel::Secure);
        fx.packer.queue_control_frame(Frame::Ping, PathId::INITIAL);
        let packet = fx.pack().unwrap().expect("a packet");
        assert_eq!(packet.raw[0] & 0x01, 0x01);

        let mut fx = fixture(Perspective::Client, EncryptionLevel::ForwardSecure);
        fx.packer.queue_control_frame(Frame::Ping, PathId::INITIAL);
        let packet = fx.pack().unwrap().expect("a packet");
        assert_eq!(packet.raw[0] & 0x01, 0);
    }

    #[test]
    fn server_includes_div_nonce_only_at_secure_encryption() {
        let mut fx = fixture(Perspective::Server, EncryptionLevel::Secure);
        fx.crypto.nonce = Some([0xAB; 32]);
        fx.packer.queue_control_frame(Frame::Ping, PathId::INITIAL);
        let packet = fx.pack().unwrap().expect("a packet");
        assert_eq!(packet.raw[0] & 0x04, 0x04);

        let mut fx = server_fixture();
        fx.crypto.nonce = Some([0xAB; 32]);
        fx.packer.queue_control_frame(Frame::Ping, PathId::INITIAL);
        let packet = fx.pack().unwrap().expect("a packet");
        assert_eq!(packet.raw[0] & 0x04, 0);
    }

    #[test]
    fn multipath_flag_appears_after_handshake_on_multipath_versions() {
        let mut fx = server_fixture();
        fx.packer.version = Version::MULTIPATH;
        fx.packer.set_handshake_complete();
        fx.packer.queue_control_frame(Frame::Ping, PathId::INITIAL);
        let packet = fx.pack().unwrap().expect("a packet");
        assert_eq!(packet.raw[0] & 0x40, 0x40);
    }

    #[test]
    fn last_stream_frame_omits_data_length() {
        let mut fx = server_fixture();
        fx.streams.open_stream(5, StreamPriority::default());
        fx.streams.open_stream(7, StreamPriority::default());
        fx.streams.write(5, b"frame one");
        fx.streams.write(7, b"frame two");
        let packet = fx.pack().unwrap().expect("a packet");
        let stream_frames: Vec<_> = packet
            .frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::Stream(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(stream_frames.len(), 2);
        assert!(stream_frames[0].data_len_present);
        assert!(!stream_frames[1].data_len_present);
    }

    #[test]
    fn does_not_pack_stream_frames_if_not_allowed() {
        let mut fx = fixture(Perspective::Server, EncryptionLevel::Secure);
        fx.streams.open_stream(5, StreamPriority::default());
        fx.streams.write(5, b"not yet");
        assert!(fx.pack().unwrap().is_none());
    }

    #[test]
    fn handshake_retransmission_rules() {
        let mut fx = server_fixture();
        let now = Instant::now();
        let forward_secure = SentPacket {
            packet_number: 1,
            length: 100,
            frames: vec![Frame::Ping],
            send_time: now,
            encryption_level: EncryptionLevel::ForwardSecure,
        };
        assert_matches!(
            fx.packer
                .pack_handshake_retransmission(&forward_secure, &mut fx.path, &fx.crypto),
            Err(PackError::ForwardSecureHandshakeRetransmission)
        );

        let secure = SentPacket {
            encryption_level: EncryptionLevel::Secure,
            ..forward_secure
        };
        assert_matches!(
            fx.packer
                .pack_handshake_retransmission(&secure, &mut fx.path, &fx.crypto),
            Err(PackError::HandshakeRetransmissionMissingStopWaiting)
        );

        fx.packer.queue_control_frame(
            Frame::StopWaiting(StopWaitingFrame::new(1)),
            PathId::INITIAL,
        );
        let packet = fx
            .packer
            .pack_handshake_retransmission(&secure, &mut fx.path, &fx.crypto)
            .unwrap();
        assert_eq!(packet.encryption_level, EncryptionLevel::Secure);
        assert_matches!(&packet.frames[0], Frame::StopWaiting(_));
        assert_matches!(&packet.frames[1], Frame::Ping);
    }

    #[test]
    fn crypto_stream_data_uses_the_handshake_sealer() {
        let mut fx = server_fixture();
        fx.streams
            .open_stream(crate::protocol::CRYPTO_STREAM_ID, StreamPriority::default());
        fx.streams
            .write(crate::protocol::CRYPTO_STREAM_ID, b"SHLO");
        let packet = fx.pack().unwrap().expect("a packet");
        assert_eq!(packet.encryption_level, EncryptionLevel::Unencrypted);
        assert!(contains(&packet.raw, b"SHLO"));
    }
}
