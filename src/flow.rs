//! Contract consumed from the flow-control layer.

use crate::frame::WindowUpdateFrame;
use crate::protocol::{ByteCount, StreamId};

/// View of the flow-control accounting maintained outside this crate.
///
/// The stream framer consults the send windows when popping fresh data; the
/// scheduler asks for window updates to push to the peer.
pub trait FlowControl {
    /// Bytes the given stream may still send, bounded by the connection
    /// window.
    fn send_window_size(&self, stream: StreamId) -> ByteCount;

    /// Records `n` bytes of fresh data sent on `stream`.
    fn add_bytes_sent(&mut self, stream: StreamId, n: ByteCount);

    /// Bytes remaining in the connection-level send window.
    fn remaining_connection_window(&self) -> ByteCount;

    /// Records `n` bytes retransmitted for `stream`.
    fn add_bytes_retrans(&mut self, stream: StreamId, n: ByteCount);

    /// The current receive window offset advertised for `stream`, if the
    /// stream is known.
    fn receive_window(&self, stream: StreamId) -> Option<ByteCount>;

    /// Window updates that should be sent now. With `force_connection`
    /// the connection-level update is emitted even if the window has not
    /// shrunk, used after the peer reported itself blocked.
    fn window_updates(&mut self, force_connection: bool) -> Vec<WindowUpdateFrame>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use rustc_hash::FxHashMap;

    /// Flow controller granting a fixed window to every stream.
    pub(crate) struct OpenFlowControl {
        pub(crate) stream_window: ByteCount,
        pub(crate) connection_window: ByteCount,
        pub(crate) sent: FxHashMap<StreamId, ByteCount>,
        pub(crate) receive_windows: FxHashMap<StreamId, ByteCount>,
        /// Handed out on the next `window_updates` call.
        pub(crate) pending_updates: Vec<WindowUpdateFrame>,
        /// Connection-level update emitted only when forced.
        pub(crate) forced_connection_update: Option<WindowUpdateFrame>,
    }

    impl OpenFlowControl {
        pub(crate) fn new() -> Self {
            Self {
                stream_window: 1 << 20,
                connection_window: 1 << 22,
                sent: FxHashMap::default(),
                receive_windows: FxHashMap::default(),
                pending_updates: Vec::new(),
                forced_connection_update: None,
            }
        }
    }

    impl FlowControl for OpenFlowControl {
        fn send_window_size(&self, stream: StreamId) -> ByteCount {
            let sent = self.sent.get(&stream).copied().unwrap_or(0);
            self.stream_window.saturating_sub(sent)
        }

        fn add_bytes_sent(&mut self, stream: StreamId, n: ByteCount) {
            *self.sent.entry(stream).or_default() += n;
        }

        fn remaining_connection_window(&self) -> ByteCount {
            self.connection_window
        }

        fn add_bytes_retrans(&mut self, _stream: StreamId, _n: ByteCount) {}

        fn receive_window(&self, stream: StreamId) -> Option<ByteCount> {
            self.receive_windows.get(&stream).copied()
        }

        fn window_updates(&mut self, force_connection: bool) -> Vec<WindowUpdateFrame> {
            let mut updates = std::mem::take(&mut self.pending_updates);
            if force_connection {
                updates.extend(self.forced_connection_update.take());
            }
            updates
        }
    }
}
