//! Wire frames.
//!
//! The wire union of frames is a sum type with one case per frame kind;
//! per-kind encoding and length logic lives on the frame structs. Only the
//! frame types the transport core produces or inspects are represented.
//! Encoding is deterministic; exact bit-compatibility with any IETF draft is
//! not a goal.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::packet::PacketNumberLen;
use crate::protocol::{ByteCount, PacketNumber, PathId, StreamId, MAX_PACKET_SIZE};

/// Frame type bytes. STREAM and ACK use the high bits of the type byte and
/// are handled separately.
const TYPE_RST_STREAM: u8 = 0x01;
const TYPE_CONNECTION_CLOSE: u8 = 0x02;
const TYPE_WINDOW_UPDATE: u8 = 0x04;
const TYPE_BLOCKED: u8 = 0x05;
const TYPE_STOP_WAITING: u8 = 0x06;
const TYPE_PING: u8 = 0x07;
const TYPE_ADD_ADDRESS: u8 = 0x10;
const TYPE_CLOSE_PATH: u8 = 0x11;
const TYPE_PATHS: u8 = 0x12;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Reason phrase longer than a packet can carry.
    #[error("invalid CONNECTION_CLOSE data")]
    InvalidConnectionCloseData,
    /// STOP_WAITING written before the packer assigned it a packet number.
    #[error("STOP_WAITING frame is missing packet number context")]
    StopWaitingIncomplete,
    #[error("frame truncated")]
    Truncated,
    #[error("malformed PUBLIC_RESET: {0}")]
    InvalidPublicReset(&'static str),
}

/// A single QUIC frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Ping,
    Ack(AckFrame),
    StopWaiting(StopWaitingFrame),
    WindowUpdate(WindowUpdateFrame),
    Blocked(BlockedFrame),
    RstStream(RstStreamFrame),
    ConnectionClose(ConnectionCloseFrame),
    AddAddress(AddAddressFrame),
    ClosePath(ClosePathFrame),
    Paths(PathsFrame),
    Stream(StreamFrame),
}

impl Frame {
    /// Whether loss of a packet containing this frame requires
    /// retransmission. Pure acknowledgement state (ACK, STOP_WAITING) is
    /// regenerated rather than retransmitted.
    pub fn is_retransmittable(&self) -> bool {
        !matches!(self, Frame::Ack(_) | Frame::StopWaiting(_))
    }

    /// Appends the wire encoding of this frame to `buf`.
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        match self {
            Frame::Ping => {
                buf.put_u8(TYPE_PING);
                Ok(())
            }
            Frame::Ack(f) => f.write(buf),
            Frame::StopWaiting(f) => f.write(buf),
            Frame::WindowUpdate(f) => f.write(buf),
            Frame::Blocked(f) => f.write(buf),
            Frame::RstStream(f) => f.write(buf),
            Frame::ConnectionClose(f) => f.write(buf),
            Frame::AddAddress(f) => f.write(buf),
            Frame::ClosePath(f) => f.write(buf),
            Frame::Paths(f) => f.write(buf),
            Frame::Stream(f) => f.write(buf),
        }
    }

    /// Size the frame will occupy on the wire.
    ///
    /// For stream frames this assumes the data-length field is present; the
    /// packer reclaims those two bytes on the final frame of a packet.
    pub fn min_len(&self) -> ByteCount {
        match self {
            Frame::Ping => 1,
            Frame::Ack(f) => f.min_len(),
            Frame::StopWaiting(f) => f.min_len(),
            Frame::WindowUpdate(_) => 1 + 4 + 8,
            Frame::Blocked(_) => 1 + 4,
            Frame::RstStream(_) => 1 + 4 + 8 + 4,
            Frame::ConnectionClose(f) => f.min_len(),
            Frame::AddAddress(f) => f.min_len(),
            Frame::ClosePath(f) => f.min_len(),
            Frame::Paths(f) => f.min_len(),
            Frame::Stream(f) => f.frame_len(true),
        }
    }
}

fn put_u48(buf: &mut Vec<u8>, v: u64) {
    buf.put_uint(v & 0xFFFF_FFFF_FFFF, 6);
}

/// An ACK range, a closed interval of acknowledged packet numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRange {
    pub first: PacketNumber,
    pub last: PacketNumber,
}

/// Path-scoped acknowledgement.
///
/// `ack_ranges` is ordered descending, non-overlapping; it is only
/// populated when the acknowledgement has holes.
#[derive(Debug, Clone, PartialEq)]
pub struct AckFrame {
    pub path_id: PathId,
    pub largest_acked: PacketNumber,
    pub lowest_acked: PacketNumber,
    pub delay_time: Duration,
    pub ack_ranges: Vec<AckRange>,
}

impl AckFrame {
    pub fn has_missing_ranges(&self) -> bool {
        self.ack_ranges.len() > 1
    }

    /// Whether this frame acknowledges packet `p`.
    pub fn acks_packet(&self, p: PacketNumber) -> bool {
        if p < self.lowest_acked || p > self.largest_acked {
            return false;
        }
        if self.has_missing_ranges() {
            return self.ack_ranges.iter().any(|r| r.first <= p && p <= r.last);
        }
        true
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        let mut type_byte = 0x40;
        if self.has_missing_ranges() {
            type_byte |= 0x01;
        }
        buf.put_u8(type_byte);
        buf.put_u8(self.path_id.0);
        put_u48(buf, self.largest_acked);
        put_u48(buf, self.lowest_acked);
        buf.put_u32(self.delay_time.as_micros().min(u128::from(u32::MAX)) as u32);
        if self.has_missing_ranges() {
            buf.put_u8(self.ack_ranges.len() as u8);
            for range in &self.ack_ranges {
                put_u48(buf, range.first);
                put_u48(buf, range.last);
            }
        }
        Ok(())
    }

    fn min_len(&self) -> ByteCount {
        let mut len = 1 + 1 + 6 + 6 + 4;
        if self.has_missing_ranges() {
            len += 1 + 12 * self.ack_ranges.len() as ByteCount;
        }
        len
    }
}

/// Tells the peer which packet numbers it need not acknowledge.
///
/// The packet number and its length are filled in by the packer at emit
/// time; the least-unacked value is written as a delta against them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopWaitingFrame {
    pub least_unacked: PacketNumber,
    pub packet_number: Option<PacketNumber>,
    pub packet_number_len: Option<PacketNumberLen>,
}

impl StopWaitingFrame {
    pub fn new(least_unacked: PacketNumber) -> Self {
        Self {
            least_unacked,
            packet_number: None,
            packet_number_len: None,
        }
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        let (pn, pn_len) = match (self.packet_number, self.packet_number_len) {
            (Some(pn), Some(len)) => (pn, len),
            _ => return Err(FrameError::StopWaitingIncomplete),
        };
        buf.put_u8(TYPE_STOP_WAITING);
        let delta = pn - self.least_unacked;
        buf.put_uint(delta & pn_len.mask(), pn_len.len());
        Ok(())
    }

    fn min_len(&self) -> ByteCount {
        1 + self.packet_number_len.map_or(6, |l| l.len() as ByteCount)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub stream_id: StreamId,
    pub byte_offset: ByteCount,
}

impl WindowUpdateFrame {
    fn write(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        buf.put_u8(TYPE_WINDOW_UPDATE);
        buf.put_u32(self.stream_id);
        buf.put_u64(self.byte_offset);
        Ok(())
    }
}

/// Stream 0 signals connection-level blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedFrame {
    pub stream_id: StreamId,
}

impl BlockedFrame {
    fn write(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        buf.put_u8(TYPE_BLOCKED);
        buf.put_u32(self.stream_id);
        Ok(())
    }

    pub fn parse(buf: &mut impl Buf) -> Result<Self, FrameError> {
        if buf.remaining() < 5 {
            return Err(FrameError::Truncated);
        }
        buf.advance(1); // type byte
        Ok(Self {
            stream_id: buf.get_u32(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub stream_id: StreamId,
    pub byte_offset: ByteCount,
    pub error_code: u32,
}

impl Default for RstStreamFrame {
    fn default() -> Self {
        Self {
            stream_id: 0,
            byte_offset: 0,
            error_code: 0,
        }
    }
}

impl RstStreamFrame {
    fn write(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        buf.put_u8(TYPE_RST_STREAM);
        buf.put_u32(self.stream_id);
        buf.put_u64(self.byte_offset);
        buf.put_u32(self.error_code);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    pub error_code: u32,
    pub reason_phrase: String,
}

impl ConnectionCloseFrame {
    fn write(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        if self.reason_phrase.len() > usize::from(u16::MAX) {
            return Err(FrameError::InvalidConnectionCloseData);
        }
        buf.put_u8(TYPE_CONNECTION_CLOSE);
        buf.put_u32(self.error_code);
        buf.put_u16(self.reason_phrase.len() as u16);
        buf.put_slice(self.reason_phrase.as_bytes());
        Ok(())
    }

    pub fn parse(buf: &mut impl Buf) -> Result<Self, FrameError> {
        if buf.remaining() < 7 {
            return Err(FrameError::Truncated);
        }
        buf.advance(1); // type byte
        let error_code = buf.get_u32();
        let reason_len = buf.get_u16() as usize;
        if reason_len as ByteCount > MAX_PACKET_SIZE {
            return Err(FrameError::InvalidConnectionCloseData);
        }
        if buf.remaining() < reason_len {
            return Err(FrameError::Truncated);
        }
        let mut reason = vec![0; reason_len];
        buf.copy_to_slice(&mut reason);
        Ok(Self {
            error_code,
            reason_phrase: String::from_utf8_lossy(&reason).into_owned(),
        })
    }

    fn min_len(&self) -> ByteCount {
        1 + 4 + 2 + self.reason_phrase.len() as ByteCount
    }
}

/// Advertises a local address the peer may open a path to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddAddressFrame {
    pub ip_version: u8,
    pub address: SocketAddr,
}

impl AddAddressFrame {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            ip_version: if address.is_ipv4() { 4 } else { 6 },
            address,
        }
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        buf.put_u8(TYPE_ADD_ADDRESS);
        buf.put_u8(self.ip_version);
        match self.address.ip() {
            std::net::IpAddr::V4(ip) => buf.put_slice(&ip.octets()),
            std::net::IpAddr::V6(ip) => buf.put_slice(&ip.octets()),
        }
        buf.put_u16(self.address.port());
        Ok(())
    }

    fn min_len(&self) -> ByteCount {
        let ip_len: ByteCount = if self.address.is_ipv4() { 4 } else { 16 };
        1 + 1 + ip_len + 2
    }
}

/// Acknowledgement-shaped frame closing a path for sending.
///
/// Unlike an ACK it carries no delay time; the receiving side treats the
/// remaining in-flight packets below `largest_acked` as lost.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosePathFrame {
    pub path_id: PathId,
    pub largest_acked: PacketNumber,
    pub lowest_acked: PacketNumber,
    pub ack_ranges: Vec<AckRange>,
}

impl ClosePathFrame {
    pub fn has_missing_ranges(&self) -> bool {
        self.ack_ranges.len() > 1
    }

    pub fn acks_packet(&self, p: PacketNumber) -> bool {
        if p < self.lowest_acked || p > self.largest_acked {
            return false;
        }
        if self.has_missing_ranges() {
            return self.ack_ranges.iter().any(|r| r.first <= p && p <= r.last);
        }
        true
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        buf.put_u8(TYPE_CLOSE_PATH);
        buf.put_u8(self.path_id.0);
        put_u48(buf, self.largest_acked);
        put_u48(buf, self.lowest_acked);
        if self.has_missing_ranges() {
            buf.put_u8(self.ack_ranges.len() as u8);
            for range in &self.ack_ranges {
                put_u48(buf, range.first);
                put_u48(buf, range.last);
            }
        } else {
            buf.put_u8(0);
        }
        Ok(())
    }

    fn min_len(&self) -> ByteCount {
        1 + 1 + 6 + 6 + 1 + if self.has_missing_ranges() {
            12 * self.ack_ranges.len() as ByteCount
        } else {
            0
        }
    }
}

/// One advertised path in a [`PathsFrame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathsEntry {
    pub path_id: PathId,
    pub remote_ip: String,
    pub remote_port: String,
}

/// Enumerates the sender's active paths and their remote addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathsFrame {
    pub entries: Vec<PathsEntry>,
}

impl PathsFrame {
    fn write(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        buf.put_u8(TYPE_PATHS);
        buf.put_u8(self.entries.len() as u8);
        for entry in &self.entries {
            buf.put_u8(entry.path_id.0);
            buf.put_u8(entry.remote_ip.len() as u8);
            buf.put_slice(entry.remote_ip.as_bytes());
            buf.put_u8(entry.remote_port.len() as u8);
            buf.put_slice(entry.remote_port.as_bytes());
        }
        Ok(())
    }

    fn min_len(&self) -> ByteCount {
        let mut len: ByteCount = 2;
        for entry in &self.entries {
            len += 3 + entry.remote_ip.len() as ByteCount + entry.remote_port.len() as ByteCount;
        }
        len
    }
}

/// A chunk of application data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub offset: ByteCount,
    pub fin: bool,
    /// Whether the explicit 16-bit data length is written. The last stream
    /// frame in a packet omits it to reclaim two bytes.
    pub data_len_present: bool,
    pub data: Bytes,
}

impl StreamFrame {
    /// Smallest number of bytes that can encode `offset`: zero, or two
    /// through eight.
    fn offset_len(offset: ByteCount) -> usize {
        if offset == 0 {
            return 0;
        }
        for len in 2..8 {
            if offset < 1 << (8 * len) {
                return len;
            }
        }
        8
    }

    fn stream_id_len(id: StreamId) -> usize {
        for len in 1..4 {
            if u64::from(id) < 1 << (8 * len) {
                return len;
            }
        }
        4
    }

    /// Bytes of header this frame writes, with or without the data-length
    /// field.
    pub fn header_len(&self, data_len_present: bool) -> ByteCount {
        let mut len = 1 + Self::stream_id_len(self.stream_id) + Self::offset_len(self.offset);
        if data_len_present {
            len += 2;
        }
        len as ByteCount
    }

    /// Total wire size of the frame.
    pub fn frame_len(&self, data_len_present: bool) -> ByteCount {
        self.header_len(data_len_present) + self.data.len() as ByteCount
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        let offset_len = Self::offset_len(self.offset);
        let id_len = Self::stream_id_len(self.stream_id);
        let mut type_byte = 0x80;
        if self.fin {
            type_byte |= 0x40;
        }
        if self.data_len_present {
            type_byte |= 0x20;
        }
        if offset_len > 0 {
            type_byte |= ((offset_len - 1) as u8) << 2;
        }
        type_byte |= (id_len - 1) as u8;
        buf.put_u8(type_byte);
        buf.put_uint(u64::from(self.stream_id), id_len);
        if offset_len > 0 {
            buf.put_uint(self.offset, offset_len);
        }
        if self.data_len_present {
            buf.put_u16(self.data.len() as u16);
        }
        buf.put_slice(&self.data);
        Ok(())
    }

    /// Splits off the first `n` bytes of data into a frame of its own,
    /// advancing this frame's offset past them.
    pub fn split_off_front(&mut self, n: usize) -> StreamFrame {
        debug_assert!(n < self.data.len());
        let head = self.data.split_to(n);
        let front = StreamFrame {
            stream_id: self.stream_id,
            offset: self.offset,
            fin: false,
            data_len_present: self.data_len_present,
            data: head,
        };
        self.offset += n as ByteCount;
        front
    }
}
