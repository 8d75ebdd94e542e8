//! Stream store and stream framer.
//!
//! Streams hold data the application queued for writing; the framer pops
//! stream frames out of them under a size budget, retransmissions first,
//! optionally restricted to the streams assigned to one path. BLOCKED
//! frames fall out as a side effect of popping against an exhausted
//! flow-control window.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::flow::FlowControl;
use crate::frame::{
    AddAddressFrame, BlockedFrame, ClosePathFrame, PathsFrame, StreamFrame,
};
use crate::protocol::{
    is_reserved_stream, ByteCount, PathId, StreamId, CRYPTO_STREAM_ID,
};

/// Scheduling priority of a stream, HTTP/2 style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPriority {
    pub weight: u8,
    pub dependency: StreamId,
}

impl Default for StreamPriority {
    fn default() -> Self {
        Self {
            weight: 16,
            dependency: 0,
        }
    }
}

/// One logical stream with pending outgoing data.
pub(crate) struct Stream {
    pub(crate) stream_id: StreamId,
    pub(crate) priority: StreamPriority,
    data_for_writing: BytesMut,
    write_offset: ByteCount,
    fin_pending: bool,
    fin_sent: bool,
    /// Total size of the stream's payload, once detected.
    pub(crate) size: ByteCount,
    /// Whether `size` has been detected yet; scheduling of non-reserved
    /// streams on servers waits for it.
    pub(crate) size_known: bool,
    /// Bytes of this stream allocated to each path. A zero entry means the
    /// path carries the stream without a byte quota.
    pub(crate) path_volume: FxHashMap<PathId, f64>,
}

impl Stream {
    fn new(stream_id: StreamId, priority: StreamPriority) -> Self {
        Self {
            stream_id,
            priority,
            data_for_writing: BytesMut::new(),
            write_offset: 0,
            fin_pending: false,
            fin_sent: false,
            size: 0,
            size_known: false,
            path_volume: FxHashMap::default(),
        }
    }

    pub(crate) fn len_of_data_for_writing(&self) -> ByteCount {
        self.data_for_writing.len() as ByteCount
    }

    /// Records the stream size once data is present. Returns whether the
    /// size is known.
    pub(crate) fn detect_size(&mut self) -> bool {
        if !self.size_known {
            let len = self.len_of_data_for_writing();
            if len != 0 {
                self.size = len;
                self.size_known = true;
            }
        }
        self.size_known
    }

    fn get_data_for_writing(&mut self, max_bytes: ByteCount) -> Option<Bytes> {
        if self.data_for_writing.is_empty() {
            return None;
        }
        let len = (self.data_for_writing.len() as ByteCount).min(max_bytes) as usize;
        Some(self.data_for_writing.split_to(len).freeze())
    }

    fn should_send_fin(&self) -> bool {
        self.fin_pending && !self.fin_sent && self.data_for_writing.is_empty()
    }
}

/// Restricts which streams the framer may pop from.
pub(crate) enum StreamSelector<'a> {
    /// Any open stream.
    Any,
    /// Only streams assigned to the given path, charged against the
    /// per-path volume quota.
    OfPath(PathId, &'a [StreamId]),
    /// Only the given stream.
    OfStream(StreamId),
}

impl StreamSelector<'_> {
    fn admits(&self, stream_id: StreamId) -> bool {
        match self {
            Self::Any => true,
            Self::OfPath(_, streams) => streams.contains(&stream_id),
            Self::OfStream(id) => *id == stream_id,
        }
    }
}

/// The stream store plus the framer state layered on top of it.
pub(crate) struct StreamsState {
    streams: FxHashMap<StreamId, Stream>,
    /// Open stream ids, sorted by descending weight after
    /// [`Self::sort_stream_priority_order`].
    open_streams: Vec<StreamId>,
    round_robin_index: usize,

    retransmission_queue: VecDeque<StreamFrame>,
    blocked_frames: VecDeque<BlockedFrame>,

    // Control frames the send loop attaches per tick.
    close_path_frames: VecDeque<ClosePathFrame>,
    add_address_frames: VecDeque<AddAddressFrame>,
    paths_frames: VecDeque<PathsFrame>,
}

impl StreamsState {
    pub(crate) fn new() -> Self {
        Self {
            streams: FxHashMap::default(),
            open_streams: Vec::new(),
            round_robin_index: 0,
            retransmission_queue: VecDeque::new(),
            blocked_frames: VecDeque::new(),
            close_path_frames: VecDeque::new(),
            add_address_frames: VecDeque::new(),
            paths_frames: VecDeque::new(),
        }
    }

    pub(crate) fn open_stream(&mut self, stream_id: StreamId, priority: StreamPriority) {
        if self.streams.contains_key(&stream_id) {
            return;
        }
        self.streams.insert(stream_id, Stream::new(stream_id, priority));
        self.open_streams.push(stream_id);
    }

    pub(crate) fn write(&mut self, stream_id: StreamId, data: &[u8]) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.data_for_writing.extend_from_slice(data);
        }
    }

    pub(crate) fn finish(&mut self, stream_id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.fin_pending = true;
        }
    }

    pub(crate) fn stream(&self, stream_id: StreamId) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    pub(crate) fn stream_mut(&mut self, stream_id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&stream_id)
    }

    /// Sum of the priority weights of `stream_ids`, ignoring the reserved
    /// streams (they are scheduled with absolute priority).
    pub(crate) fn priority_sum(&self, stream_ids: &[StreamId]) -> f64 {
        stream_ids
            .iter()
            .filter(|id| !is_reserved_stream(**id))
            .filter_map(|id| self.streams.get(id))
            .map(|stream| f64::from(stream.priority.weight))
            .sum()
    }

    /// Orders open streams for assignment: the reserved streams first,
    /// then the rest by descending weight, rotated by a round-robin index
    /// that advances on every call.
    pub(crate) fn schedule_order(&mut self) -> Vec<StreamId> {
        let mut others: Vec<StreamId> = self
            .open_streams
            .iter()
            .copied()
            .filter(|id| !is_reserved_stream(*id))
            .collect();
        others.sort_by_key(|id| {
            std::cmp::Reverse(self.streams[id].priority.weight)
        });

        let mut order: Vec<StreamId> = self
            .open_streams
            .iter()
            .copied()
            .filter(|id| is_reserved_stream(*id))
            .collect();
        order.sort_unstable();
        if !others.is_empty() {
            let start = self.round_robin_index % others.len();
            order.extend(others[start..].iter().chain(others[..start].iter()));
            self.round_robin_index = self.round_robin_index.wrapping_add(1);
        }
        order
    }

    //
    // Framer: retransmissions
    //

    pub(crate) fn add_frame_for_retransmission(&mut self, frame: StreamFrame) {
        self.retransmission_queue.push_back(frame);
    }

    pub(crate) fn has_frames_for_retransmission(&self) -> bool {
        !self.retransmission_queue.is_empty()
    }

    pub(crate) fn has_crypto_stream_frame(&self) -> bool {
        self.retransmission_queue
            .iter()
            .any(|frame| frame.stream_id == CRYPTO_STREAM_ID)
            || self
                .streams
                .get(&CRYPTO_STREAM_ID)
                .is_some_and(|stream| !stream.data_for_writing.is_empty())
    }

    /// Pops a single crypto-stream frame, bypassing flow control.
    pub(crate) fn pop_crypto_stream_frame(&mut self, budget: ByteCount) -> Option<StreamFrame> {
        if let Some(index) = self
            .retransmission_queue
            .iter()
            .position(|frame| frame.stream_id == CRYPTO_STREAM_ID)
        {
            let mut frame = self.retransmission_queue.remove(index).unwrap();
            frame.data_len_present = true;
            let max_data = budget.checked_sub(frame.header_len(true))?;
            if frame.data.len() as ByteCount > max_data {
                let front = frame.split_off_front(max_data as usize);
                self.retransmission_queue.push_front(frame);
                return Some(front);
            }
            return Some(frame);
        }

        let stream = self.streams.get_mut(&CRYPTO_STREAM_ID)?;
        let mut frame = StreamFrame {
            stream_id: CRYPTO_STREAM_ID,
            offset: stream.write_offset,
            fin: false,
            data_len_present: true,
            data: Bytes::new(),
        };
        let max_data = budget.checked_sub(frame.header_len(true))?;
        let data = stream.get_data_for_writing(max_data)?;
        stream.write_offset += data.len() as ByteCount;
        frame.data = data;
        Some(frame)
    }

    /// Pops stream frames worth up to `budget` bytes, retransmissions
    /// before fresh data. Every returned frame has `data_len_present` set;
    /// the packer clears it on the final one.
    pub(crate) fn pop_stream_frames(
        &mut self,
        budget: ByteCount,
        selector: StreamSelector<'_>,
        flow: &mut dyn FlowControl,
    ) -> Vec<StreamFrame> {
        let (mut frames, used) = self.pop_retransmission_frames(budget, &selector, flow);
        frames.extend(self.pop_normal_frames(budget.saturating_sub(used), &selector, flow));
        frames
    }

    fn pop_retransmission_frames(
        &mut self,
        budget: ByteCount,
        selector: &StreamSelector<'_>,
        flow: &mut dyn FlowControl,
    ) -> (Vec<StreamFrame>, ByteCount) {
        let mut frames = Vec::new();
        let mut current_len: ByteCount = 0;
        while let Some(index) = self
            .retransmission_queue
            .iter()
            .position(|frame| selector.admits(frame.stream_id))
        {
            let mut frame = self.retransmission_queue.remove(index).unwrap();
            frame.data_len_present = true;
            let header_len = frame.header_len(true);
            if current_len + header_len >= budget {
                self.retransmission_queue.push_front(frame);
                break;
            }
            let max_data = budget - current_len - header_len;
            if frame.data.len() as ByteCount > max_data {
                let front = frame.split_off_front(max_data as usize);
                self.retransmission_queue.push_front(frame);
                flow.add_bytes_retrans(front.stream_id, front.data.len() as ByteCount);
                current_len += front.frame_len(true);
                frames.push(front);
                break;
            }
            flow.add_bytes_retrans(frame.stream_id, frame.data.len() as ByteCount);
            current_len += frame.frame_len(true);
            frames.push(frame);
        }
        (frames, current_len)
    }

    fn pop_normal_frames(
        &mut self,
        budget: ByteCount,
        selector: &StreamSelector<'_>,
        flow: &mut dyn FlowControl,
    ) -> Vec<StreamFrame> {
        let order: Vec<StreamId> = match selector {
            StreamSelector::Any => self.open_streams.clone(),
            StreamSelector::OfPath(_, streams) => streams.to_vec(),
            StreamSelector::OfStream(id) => vec![*id],
        };
        let path_id = match selector {
            StreamSelector::OfPath(path_id, _) => Some(*path_id),
            _ => None,
        };

        let mut frames = Vec::new();
        let mut remaining = budget;
        for stream_id in order {
            // The crypto stream is popped through its own entry point.
            if stream_id == CRYPTO_STREAM_ID {
                continue;
            }
            let stream = match self.streams.get_mut(&stream_id) {
                Some(stream) => stream,
                None => continue,
            };
            if stream.data_for_writing.is_empty() && !stream.should_send_fin() {
                continue;
            }

            let header_len = StreamFrame {
                stream_id,
                offset: stream.write_offset,
                fin: false,
                data_len_present: true,
                data: Bytes::new(),
            }
            .header_len(true);
            if header_len >= remaining {
                break;
            }
            let mut max_data = remaining - header_len;

            let send_window = flow.send_window_size(stream_id);
            if send_window == 0 && !stream.data_for_writing.is_empty() {
                // The BLOCKED frame went out when the window was drained;
                // wait for a window update.
                continue;
            }
            max_data = max_data.min(send_window);

            // Honour the byte volume the scheduler allotted to this path.
            if let Some(path_id) = path_id {
                if let Some(volume) = stream.path_volume.get(&path_id).copied() {
                    if volume > 0.0 {
                        max_data = max_data.min(volume as ByteCount);
                        if max_data == 0 {
                            continue;
                        }
                    }
                }
            }

            let data = stream.get_data_for_writing(max_data);
            let fin = stream.should_send_fin();
            if data.is_none() && !fin {
                continue;
            }
            let data = data.unwrap_or_default();
            if fin {
                stream.fin_sent = true;
            }

            let sent = data.len() as ByteCount;
            let frame = StreamFrame {
                stream_id,
                offset: stream.write_offset,
                fin,
                data_len_present: true,
                data,
            };
            stream.write_offset += sent;
            if let Some(path_id) = path_id {
                if let Some(volume) = stream.path_volume.get_mut(&path_id) {
                    if *volume > 0.0 {
                        *volume -= sent as f64;
                    }
                }
            }
            if sent > 0 {
                flow.add_bytes_sent(stream_id, sent);
                if !fin && flow.send_window_size(stream_id) == 0 {
                    trace!(stream = stream_id, "send window exhausted");
                    self.blocked_frames.push_back(BlockedFrame { stream_id });
                }
            }
            remaining -= frame.frame_len(true);
            frames.push(frame);
            if remaining == 0 {
                break;
            }
        }
        frames
    }

    pub(crate) fn pop_blocked_frame(&mut self) -> Option<BlockedFrame> {
        self.blocked_frames.pop_front()
    }

    //
    // Control-frame queues drained by the send loop.
    //

    pub(crate) fn queue_close_path_frame(&mut self, frame: ClosePathFrame) {
        self.close_path_frames.push_back(frame);
    }

    pub(crate) fn pop_close_path_frame(&mut self) -> Option<ClosePathFrame> {
        self.close_path_frames.pop_front()
    }

    pub(crate) fn queue_add_address_frame(&mut self, frame: AddAddressFrame) {
        self.add_address_frames.push_back(frame);
    }

    pub(crate) fn pop_add_address_frame(&mut self) -> Option<AddAddressFrame> {
        self.add_address_frames.pop_front()
    }

    pub(crate) fn queue_paths_frame(&mut self, frame: PathsFrame) {
        self.paths_frames.push_back(frame);
    }

    pub(crate) fn pop_paths_frame(&mut self) -> Option<PathsFrame> {
        self.paths_frames.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::testing::OpenFlowControl;
    use crate::protocol::HEADERS_STREAM_ID;

    fn retrans_frame(stream_id: StreamId, data: &'static [u8]) -> StreamFrame {
        StreamFrame {
            stream_id,
            offset: 0,
            fin: false,
            data_len_present: true,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn retransmissions_pop_before_fresh_data() {
        let mut streams = StreamsState::new();
        let mut flow = OpenFlowControl::new();
        streams.open_stream(5, StreamPriority::default());
        streams.write(5, b"fresh data");
        streams.add_frame_for_retransmission(retrans_frame(5, b"old data"));

        let frames = streams.pop_stream_frames(1000, StreamSelector::Any, &mut flow);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data.as_ref(), b"old data");
        assert_eq!(frames[1].data.as_ref(), b"fresh data");
    }

    #[test]
    fn oversized_retransmission_is_split() {
        let mut streams = StreamsState::new();
        let mut flow = OpenFlowControl::new();
        streams.add_frame_for_retransmission(retrans_frame(5, b"abcdefghij"));

        // Header is 1 (type) + 1 (stream id) + 2 (data len) = 4 bytes.
        let frames = streams.pop_stream_frames(10, StreamSelector::Any, &mut flow);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.as_ref(), b"abcdef");
        assert!(streams.has_frames_for_retransmission());

        let rest = streams.pop_stream_frames(1000, StreamSelector::Any, &mut flow);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].data.as_ref(), b"ghij");
        assert_eq!(rest[0].offset, 6);
    }

    #[test]
    fn exhausted_window_yields_blocked_frame() {
        let mut streams = StreamsState::new();
        let mut flow = OpenFlowControl::new();
        flow.stream_window = 4;
        streams.open_stream(5, StreamPriority::default());
        streams.write(5, b"abcdefgh");

        let frames = streams.pop_stream_frames(1000, StreamSelector::Any, &mut flow);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.as_ref(), b"abcd");
        let blocked = streams.pop_blocked_frame().expect("BLOCKED frame");
        assert_eq!(blocked.stream_id, 5);

        // The window stays empty: nothing more is popped, and the BLOCKED
        // marker is not repeated.
        let frames = streams.pop_stream_frames(1000, StreamSelector::Any, &mut flow);
        assert!(frames.is_empty());
        assert!(streams.pop_blocked_frame().is_none());
    }

    #[test]
    fn path_selector_restricts_and_consumes_volume() {
        let mut streams = StreamsState::new();
        let mut flow = OpenFlowControl::new();
        streams.open_stream(5, StreamPriority::default());
        streams.open_stream(7, StreamPriority::default());
        streams.write(5, b"stream five data");
        streams.write(7, b"stream seven data");
        streams
            .stream_mut(5)
            .unwrap()
            .path_volume
            .insert(PathId(2), 4.0);

        let assigned = [5];
        let frames =
            streams.pop_stream_frames(1000, StreamSelector::OfPath(PathId(2), &assigned), &mut flow);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_id, 5);
        assert_eq!(frames[0].data.as_ref(), b"stre");
        let volume = streams.stream(5).unwrap().path_volume[&PathId(2)];
        assert_eq!(volume, 0.0);
    }

    #[test]
    fn fin_is_sent_once_data_is_drained() {
        let mut streams = StreamsState::new();
        let mut flow = OpenFlowControl::new();
        streams.open_stream(5, StreamPriority::default());
        streams.write(5, b"last words");
        streams.finish(5);

        let frames = streams.pop_stream_frames(1000, StreamSelector::Any, &mut flow);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].fin);

        // Fin must not be emitted again.
        let frames = streams.pop_stream_frames(1000, StreamSelector::Any, &mut flow);
        assert!(frames.is_empty());
    }

    #[test]
    fn crypto_stream_bypasses_flow_control() {
        let mut streams = StreamsState::new();
        streams.open_stream(CRYPTO_STREAM_ID, StreamPriority::default());
        streams.write(CRYPTO_STREAM_ID, b"client hello");
        assert!(streams.has_crypto_stream_frame());

        let frame = streams.pop_crypto_stream_frame(1000).unwrap();
        assert_eq!(frame.stream_id, CRYPTO_STREAM_ID);
        assert_eq!(frame.data.as_ref(), b"client hello");
        assert!(!streams.has_crypto_stream_frame());
    }

    #[test]
    fn schedule_order_puts_reserved_streams_first() {
        let mut streams = StreamsState::new();
        streams.open_stream(7, StreamPriority { weight: 1, dependency: 0 });
        streams.open_stream(HEADERS_STREAM_ID, StreamPriority::default());
        streams.open_stream(5, StreamPriority { weight: 200, dependency: 0 });

        let order = streams.schedule_order();
        assert_eq!(order[0], HEADERS_STREAM_ID);
        assert_eq!(order[1], 5);
        assert_eq!(order[2], 7);

        // Round robin rotates the non-reserved tail.
        let order = streams.schedule_order();
        assert_eq!(order[0], HEADERS_STREAM_ID);
        assert_eq!(order[1], 7);
    }
}
