//! Multipath scheduling: stream-to-path assignment and the send tick.
//!
//! Assignment runs off the hot path and decides which paths carry which
//! streams, using RTT, estimated bandwidth and stream priority. The send
//! tick drains streams across paths round-robin, retransmissions first,
//! and falls back to acking the remaining paths when nothing (or nothing
//! more) can be sent.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::sent_packets::SentPacket;
use super::{Connection, ConnectionError};
use crate::frame::Frame;
use crate::protocol::{is_reserved_stream, EncryptionLevel, PathId, Perspective, StreamId};

/// Scheduler state surviving across send ticks.
pub(crate) struct Scheduler {
    /// Packets sent per path.
    pub(crate) quotas: BTreeMap<PathId, u64>,
    /// Non-reserved streams assigned per path.
    pub(crate) num_streams: BTreeMap<PathId, u64>,
    round_robin_index_path: u32,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            quotas: BTreeMap::new(),
            num_streams: BTreeMap::new(),
            round_robin_index_path: 0,
        }
    }

    fn advance_round_robin(&mut self, num_paths: usize) {
        self.round_robin_index_path = (self.round_robin_index_path + 1) % num_paths as u32;
    }
}

impl Connection {
    /// Runs one send tick: assigns unassigned streams to paths, then
    /// drains streams across all open paths while congestion windows
    /// allow, ending with an ack round over the remaining paths.
    pub fn send_tick(&mut self, now: Instant) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Ok(());
        }

        // Paths might not be assignable while the initial path is
        // congestion limited; ACK frames must flow regardless.
        if !self.schedule_to_multiple_paths(now)? {
            return Ok(());
        }

        let mut window_update_frames = self.window_update_frames(false);
        for frame in &window_update_frames {
            self.packer.queue_control_frame(frame.clone(), PathId::INITIAL);
        }

        let num_paths = self.open_paths.len();
        if num_paths == 0 {
            return self.ack_remaining_paths(window_update_frames, now);
        }
        let start_index = self.scheduler.round_robin_index_path;

        // Repeatedly try sending until no path has more data or every
        // path ran out of congestion window.
        loop {
            let mut has_windows = false;
            let mut path_sent = false;

            'path_loop: for i in 0..num_paths as u32 {
                let path_id = self.open_paths[((i + start_index) % num_paths as u32) as usize];

                {
                    let path = self.paths.get_mut(&path_id).expect("open path exists");
                    let least_unacked = path.sent_packets.get_least_unacked();
                    path.set_least_unacked(least_unacked);
                }

                let mut stream_num = self.paths[&path_id].stream_ids.len();
                if stream_num == 0 {
                    // Nothing scheduled here; it will be acked in the
                    // final round if needed.
                    self.scheduler.advance_round_robin(num_paths);
                    continue 'path_loop;
                }

                while stream_num > 0 {
                    has_windows = has_windows || self.paths[&path_id].sending_allowed();
                    if !self.paths[&path_id].sending_allowed() {
                        trace!(%path_id, "sending not allowed");
                        self.scheduler.advance_round_robin(num_paths);
                        continue 'path_loop;
                    }

                    // Retransmissions of this path go first; handshake
                    // retransmissions leave immediately.
                    let handshake_retransmission = self.get_retransmission_of_path(path_id)?;
                    let has_stream_retransmission = self.streams.has_frames_for_retransmission();
                    if let Some(packet) = handshake_retransmission {
                        if let Some(swf) = self
                            .paths
                            .get_mut(&path_id)
                            .expect("open path exists")
                            .get_stop_waiting_frame(true)
                        {
                            self.packer
                                .queue_control_frame(Frame::StopWaiting(swf), path_id);
                        }
                        let packed = {
                            let (packer, path, _, _, crypto) = self.pack_parts(path_id);
                            packer.pack_handshake_retransmission(&packet, path, crypto)?
                        };
                        self.send_packed_packet(path_id, packed, now)?;
                    }

                    let ack = self
                        .paths
                        .get_mut(&path_id)
                        .expect("open path exists")
                        .take_ack_frame();
                    let have_ack = ack.is_some();
                    if let Some(ack) = ack {
                        self.packer.queue_control_frame(Frame::Ack(ack), path_id);
                    }
                    if have_ack || has_stream_retransmission {
                        if let Some(swf) = self
                            .paths
                            .get_mut(&path_id)
                            .expect("open path exists")
                            .get_stop_waiting_frame(has_stream_retransmission)
                        {
                            self.packer
                                .queue_control_frame(Frame::StopWaiting(swf), path_id);
                        }
                    }

                    // Attach pending path-management frames.
                    while let Some(frame) = self.streams.pop_close_path_frame() {
                        self.packer
                            .queue_control_frame(Frame::ClosePath(frame), path_id);
                    }
                    while let Some(frame) = self.streams.pop_add_address_frame() {
                        self.packer
                            .queue_control_frame(Frame::AddAddress(frame), path_id);
                    }
                    while let Some(frame) = self.streams.pop_paths_frame() {
                        self.packer.queue_control_frame(Frame::Paths(frame), path_id);
                    }

                    let sent =
                        self.perform_packet_sending(path_id, &window_update_frames, now)?;
                    window_update_frames.clear();
                    path_sent = path_sent || sent;

                    if !sent {
                        self.scheduler.advance_round_robin(num_paths);
                        continue 'path_loop;
                    }
                    // No duplicate sending of the same stream round on
                    // this path.
                    stream_num -= 1;
                }

                self.scheduler.advance_round_robin(num_paths);
            }

            // Every path with streams sent empty packets, or every path
            // ran out of window.
            if !path_sent || !has_windows {
                return self.ack_remaining_paths(window_update_frames, now);
            }
        }
    }

    /// Drains this path's retransmission queue into the stream framer and
    /// control queues. A handshake packet needing retransmission is
    /// returned for immediate re-sealing.
    fn get_retransmission_of_path(
        &mut self,
        path_id: PathId,
    ) -> Result<Option<SentPacket>, ConnectionError> {
        loop {
            let packet = match self
                .paths
                .get_mut(&path_id)
                .and_then(|path| path.sent_packets.dequeue_packet_for_retransmission())
            {
                Some(packet) => packet,
                None => return Ok(None),
            };

            if packet.encryption_level != EncryptionLevel::ForwardSecure {
                if self.handshake_complete {
                    // Handshake packets are moot once the handshake is
                    // complete.
                    continue;
                }
                debug!(
                    packet = packet.packet_number,
                    "dequeueing handshake retransmission"
                );
                return Ok(Some(packet));
            }
            trace!(
                packet = packet.packet_number,
                %path_id,
                "dequeueing retransmission"
            );
            self.requeue_frames_for_retransmission(packet, path_id);
        }
    }

    /// Packs and sends one packet on the path. Returns whether anything
    /// was produced.
    fn perform_packet_sending(
        &mut self,
        path_id: PathId,
        window_update_frames: &[Frame],
        now: Instant,
    ) -> Result<bool, ConnectionError> {
        if self.paths[&path_id]
            .sent_packets
            .should_send_retransmittable_packet()
        {
            // Too many ack-only packets in a row; force the peer to keep
            // acking.
            self.packer.queue_control_frame(Frame::Ping, path_id);
        }

        let packet = {
            let (packer, path, streams, flow, crypto) = self.pack_parts(path_id);
            packer.pack_packet_of_path(path, streams, flow, crypto)?
        };
        let packet = match packet {
            Some(packet) => packet,
            None => return Ok(false),
        };

        let finished_streams: Vec<StreamId> = packet
            .frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::Stream(frame) if frame.fin => Some(frame.stream_id),
                _ => None,
            })
            .collect();

        self.send_packed_packet(path_id, packet, now)?;

        // Send every window update twice.
        for frame in window_update_frames {
            self.packer.queue_control_frame(frame.clone(), path_id);
        }

        *self.scheduler.quotas.entry(path_id).or_insert(0) += 1;

        for stream_id in finished_streams {
            for (&path_id, path) in &self.paths {
                let (sent, retransmitted, lost) = path.sent_packets.statistics();
                debug!(
                    stream = stream_id,
                    %path_id,
                    sent,
                    retransmitted,
                    lost,
                    rtt = ?path.smoothed_rtt(),
                    "stream finished"
                );
            }
        }

        Ok(true)
    }

    /// Assigns any not-yet-assigned streams to paths. Returns false when
    /// the tick should stop because no path was selectable.
    fn schedule_to_multiple_paths(&mut self, now: Instant) -> Result<bool, ConnectionError> {
        let order = self.streams.schedule_order();
        if order.is_empty() {
            trace!("no stream to be scheduled");
            return Ok(true);
        }

        for stream_id in order {
            // A path never fails after assignment; only place streams
            // that have no path yet.
            if self.stream_to_path.contains_key(&stream_id) {
                continue;
            }

            if self.perspective == Perspective::Client || is_reserved_stream(stream_id) {
                // All client streams, and the reserved streams on the
                // server, go to the lowest-RTT usable path.
                let path_id = match self.find_path_low_latency() {
                    Some(path_id) => path_id,
                    None => {
                        debug!(stream = stream_id, "failed to assign a path");
                        let window_updates = self.window_update_frames(false);
                        self.ack_remaining_paths(window_updates, now)?;
                        return Ok(false);
                    }
                };
                trace!(stream = stream_id, %path_id, "stream assigned");
                self.assign_stream_to_path(stream_id, path_id, 0.0);
            } else {
                // Server data streams are split across paths by priority,
                // RTT and bandwidth; wait until enough paths exist.
                if self.paths.len() < 3 {
                    continue;
                }

                let weight = match self.streams.stream(stream_id) {
                    Some(stream) => stream.priority.weight,
                    None => continue,
                };
                let selected = self.choose_paths(stream_id, weight);
                match selected {
                    Some(selected) if !selected.is_empty() => {
                        for (path_id, volume) in selected {
                            trace!(
                                stream = stream_id,
                                %path_id,
                                volume,
                                "stream assigned with volume"
                            );
                            self.assign_stream_to_path(stream_id, path_id, volume);
                        }
                    }
                    _ => {
                        debug!(stream = stream_id, "failed to assign a path");
                        let size_known = self
                            .streams
                            .stream(stream_id)
                            .map_or(false, |stream| stream.size_known);
                        if size_known {
                            // Only bail out when the stream size was
                            // detected; otherwise assignment is deferred.
                            let window_updates = self.window_update_frames(false);
                            self.ack_remaining_paths(window_updates, now)?;
                            return Ok(false);
                        }
                        continue;
                    }
                }
            }
        }
        Ok(true)
    }

    fn assign_stream_to_path(&mut self, stream_id: StreamId, path_id: PathId, volume: f64) {
        self.stream_to_path
            .entry(stream_id)
            .or_default()
            .push(path_id);
        if let Some(stream) = self.streams.stream_mut(stream_id) {
            stream.path_volume.insert(path_id, volume);
        }
        if let Some(path) = self.paths.get_mut(&path_id) {
            path.stream_ids.push(stream_id);
        }
        if !is_reserved_stream(stream_id) {
            *self.scheduler.num_streams.entry(path_id).or_insert(0) += 1;
        }
    }

    /// The lowest-smoothed-RTT usable path; among unprobed paths, the one
    /// with the lowest packet quota. The initial path is only used while
    /// it is the sole path.
    pub(crate) fn find_path_low_latency(&self) -> Option<PathId> {
        if self.paths.len() <= 1 {
            let initial = &self.paths[&PathId::INITIAL];
            if !initial.sending_allowed() {
                return None;
            }
            return Some(PathId::INITIAL);
        }

        let mut selected: Option<PathId> = None;
        let mut lower_rtt = Duration::ZERO;
        for (&path_id, path) in &self.paths {
            if !path.sending_allowed() || path.potentially_failed || path_id == PathId::INITIAL {
                continue;
            }

            let current_rtt = path.smoothed_rtt();

            // Prefer staying on a probed path; skip unprobed ones once a
            // probed path was seen.
            if !lower_rtt.is_zero() && current_rtt.is_zero() {
                continue;
            }

            // With multiple unprobed paths, pick the one with the lowest
            // number of packets sent.
            if current_rtt.is_zero() {
                if let Some(selected) = selected {
                    let current_quota = self.scheduler.quotas.get(&path_id).copied().unwrap_or(0);
                    let lower_quota = self.scheduler.quotas.get(&selected).copied().unwrap_or(0);
                    if current_quota > lower_quota {
                        continue;
                    }
                }
            }

            if !current_rtt.is_zero()
                && !lower_rtt.is_zero()
                && selected.is_some()
                && current_rtt >= lower_rtt
            {
                continue;
            }

            lower_rtt = current_rtt;
            selected = Some(path_id);
        }

        selected
    }

    /// The path with the lowest packet quota, disregarding everything
    /// else.
    pub(crate) fn iterate_path_round_robin(&self) -> Option<PathId> {
        self.paths
            .keys()
            .min_by_key(|path_id| self.scheduler.quotas.get(path_id).copied().unwrap_or(0))
            .copied()
    }

    /// Splits a stream's volume over the usable paths so that, given the
    /// per-path bandwidth share and one-way delay, all paths would finish
    /// at the same time. Returns bytes per path; `None` while the stream
    /// size is unknown.
    fn choose_paths(&mut self, stream_id: StreamId, weight: u8) -> Option<BTreeMap<PathId, f64>> {
        let size = {
            let stream = self.streams.stream_mut(stream_id)?;
            if !stream.detect_size() {
                trace!(stream = stream_id, "stream size not yet detected");
                return None;
            }
            stream.size
        };
        let mut volume = size as f64 * 8.0; // bits

        if self.paths.len() <= 1 {
            if !self.paths[&PathId::INITIAL].sending_allowed() {
                return None;
            }
            let mut selected = BTreeMap::new();
            selected.insert(PathId::INITIAL, size as f64);
            return Some(selected);
        }

        // Stage 1: filter usable paths and compute each path's effective
        // bandwidth share and one-way delay.
        let mut usable: Vec<PathId> = Vec::new();
        for (&path_id, path) in &self.paths {
            if !path.sending_allowed() || path.potentially_failed || path_id == PathId::INITIAL {
                continue;
            }
            usable.push(path_id);
        }

        let mut paths_bdw: BTreeMap<PathId, f64> = BTreeMap::new(); // bits/s
        let mut paths_owd: BTreeMap<PathId, f64> = BTreeMap::new(); // seconds
        let mut paths_volume: BTreeMap<PathId, f64> = BTreeMap::new(); // bits
        for &path_id in &usable {
            let path = &self.paths[&path_id];
            // The share counts the weights of streams already assigned to
            // the path, excluding the reserved streams and the stream
            // being placed.
            let priority_sum = self.streams.priority_sum(&path.stream_ids);
            let share = f64::from(weight) / (f64::from(weight) + priority_sum)
                * path.bandwidth_megabits() as f64
                * 1_048_576.0;
            paths_bdw.insert(path_id, share);
            paths_owd.insert(path_id, path.smoothed_rtt().as_secs_f64() / 2.0);
            paths_volume.insert(path_id, 0.0);
            trace!(
                %path_id,
                share_mbps = share / 1_048_576.0,
                owd = paths_owd[&path_id],
                "choose_paths candidate"
            );
        }

        // Stage 2: walk paths by ascending delay, filling each gap so
        // that simultaneous completion stays possible.
        let mut order = usable.clone();
        order.sort_by(|a, b| {
            paths_owd[a]
                .partial_cmp(&paths_owd[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        'gap_loop: for i in 0..order.len().saturating_sub(1) {
            let path_a = order[i];
            let path_b = order[i + 1];
            let bdw_sum: f64 = order[..=i].iter().map(|p| paths_bdw[p]).sum();
            let owd_gap = paths_owd[&path_b] - paths_owd[&path_a];
            if owd_gap == 0.0 {
                break;
            }
            let gap = owd_gap * bdw_sum;
            if volume > gap {
                for k in (0..=i).rev() {
                    let step = owd_gap * paths_bdw[&order[k]];
                    *paths_volume.get_mut(&order[k]).expect("candidate") += step;
                    volume -= step;
                    if volume <= 0.0 {
                        break 'gap_loop;
                    }
                }
            } else {
                let mut cut = 0.0;
                for k in (0..=i).rev() {
                    let step = volume * paths_bdw[&order[k]] / bdw_sum;
                    *paths_volume.get_mut(&order[k]).expect("candidate") += step;
                    cut += step;
                }
                volume -= cut;
                if volume <= 0.0 {
                    break 'gap_loop;
                }
            }
        }

        // Stage 3: the excess is distributed over all candidates
        // proportionally to bandwidth.
        if volume > 0.0 {
            let all: f64 = usable.iter().map(|p| paths_bdw[p]).sum();
            if all > 0.0 {
                for path_id in &usable {
                    *paths_volume.get_mut(path_id).expect("candidate") +=
                        volume * paths_bdw[path_id] / all;
                }
            }
        }

        let mut selected = BTreeMap::new();
        for (path_id, bits) in paths_volume {
            if bits > 0.0 {
                selected.insert(path_id, bits / 8.0);
            }
        }
        Some(selected)
    }

    /// Sends an ACK (or a path-restricted data packet carrying window
    /// updates) on every path that has something to acknowledge.
    pub(crate) fn ack_remaining_paths(
        &mut self,
        window_update_frames: Vec<Frame>,
        now: Instant,
    ) -> Result<(), ConnectionError> {
        // Either we ran out of data or the windows of all usable paths
        // are full; pure ACKs are not congestion limited.
        let mut window_updates = window_update_frames;
        if window_updates.is_empty() {
            window_updates = self.window_update_frames(self.peer_blocked);
        }
        let path_ids: Vec<PathId> = self.paths.keys().copied().collect();
        for path_id in path_ids {
            self.ack_path(path_id, &window_updates, now)?;
        }
        self.peer_blocked = false;
        Ok(())
    }

    fn ack_path(
        &mut self,
        path_id: PathId,
        window_updates: &[Frame],
        now: Instant,
    ) -> Result<(), ConnectionError> {
        let ack = match self.paths.get_mut(&path_id) {
            Some(path) => path.take_ack_frame(),
            None => return Ok(()),
        };
        for frame in window_updates {
            self.packer.queue_control_frame(frame.clone(), path_id);
        }
        if ack.is_none() && window_updates.is_empty() {
            return Ok(());
        }
        // The initial path is skipped unless it has an ACK to deliver.
        if path_id == PathId::INITIAL && ack.is_none() {
            return Ok(());
        }
        if let Some(swf) = self
            .paths
            .get_mut(&path_id)
            .expect("path exists")
            .get_stop_waiting_frame(false)
        {
            self.packer
                .queue_control_frame(Frame::StopWaiting(swf), path_id);
        }

        let packet = match ack {
            Some(ack) => {
                self.packer.queue_control_frame(Frame::Ack(ack), path_id);
                let (packer, path, _, _, crypto) = self.pack_parts(path_id);
                Some(packer.pack_ack_packet(path, crypto)?)
            }
            None => {
                let (packer, path, streams, flow, crypto) = self.pack_parts(path_id);
                packer.pack_packet_of_path(path, streams, flow, crypto)?
            }
        };
        if let Some(packet) = packet {
            self.send_packed_packet(path_id, packet, now)?;
        }
        Ok(())
    }
}
