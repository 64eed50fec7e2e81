//! Frame fan-out queue.
//!
//! Frames queued here stay application-held until every client that started
//! sending them has finished. Clients borrow a frame through a `FrameLease`;
//! the lease is not `Clone` and is consumed by `release`, so a frame's
//! `pending_viewers` count can only return to zero through the clients that
//! raised it.
//!
//! Frames are kept in capture order in a `VecDeque` keyed by a monotonically
//! increasing `FrameId`, which doubles as the arena index for lookups.

use anyhow::anyhow;
use std::collections::VecDeque;
use std::fmt;

use crate::capture::{FrameHandle, FrameStore, FrameTimestamp};
use crate::mjpeg::{Chunk, Envelope, PART_TRAILER};

pub type FrameId = u64;

pub struct QueuedFrame {
    id: FrameId,
    handle: FrameHandle,
    envelope: Envelope,
    pending_viewers: u32,
    served_count: u32,
}

impl QueuedFrame {
    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn timestamp(&self) -> FrameTimestamp {
        self.handle.timestamp()
    }

    pub fn sequence(&self) -> u32 {
        self.handle.sequence()
    }

    pub fn buffer_index(&self) -> u32 {
        self.handle.index()
    }

    /// Clients currently sending this frame.
    pub fn pending_viewers(&self) -> u32 {
        self.pending_viewers
    }

    /// Clients that were handed this frame.
    pub fn served_count(&self) -> u32 {
        self.served_count
    }

    pub fn content_length(&self) -> usize {
        self.envelope.content_length
    }

    pub fn wire_len(&self) -> usize {
        self.envelope.wire_len()
    }

    pub fn chunk_count(&self) -> usize {
        self.envelope.chunks.len()
    }

    /// Bytes of envelope chunk `index`. Frame bytes are read straight from the
    /// capture buffer through `store`.
    pub fn chunk<'a>(&'a self, index: usize, store: &'a dyn FrameStore) -> Option<&'a [u8]> {
        match self.envelope.chunks.get(index)? {
            Chunk::PartHeader => Some(self.envelope.part_header.as_slice()),
            Chunk::Frame(range) => store.frame_data(&self.handle)?.get(range.clone()),
            Chunk::Static(bytes) => Some(*bytes),
            Chunk::Trailer => Some(PART_TRAILER),
        }
    }
}

/// One client's claim on a queued frame.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a frame lease must be released back to the queue"]
pub struct FrameLease {
    frame: FrameId,
    timestamp: FrameTimestamp,
}

impl FrameLease {
    pub fn frame_id(&self) -> FrameId {
        self.frame
    }

    pub fn timestamp(&self) -> FrameTimestamp {
        self.timestamp
    }
}

/// A frame the queue refused. The handle goes back to the caller for requeueing.
pub struct QueueRejected {
    pub handle: FrameHandle,
    pub error: anyhow::Error,
}

impl fmt::Debug for QueueRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueRejected")
            .field("buffer", &self.handle.index())
            .field("sequence", &self.handle.sequence())
            .field("error", &format_args!("{:#}", self.error))
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub queued: u64,
    pub rejected: u64,
    /// Frames the device dropped, from gaps in the capture sequence.
    pub missed: u64,
    /// Frames evicted before any client was handed them.
    pub skipped: u64,
    pub evicted: u64,
}

pub struct FrameFanoutQueue {
    frames: VecDeque<QueuedFrame>,
    next_id: FrameId,
    last_sequence: Option<u32>,
    insert_huffman: bool,
    stats: FanoutStats,
}

impl Default for FrameFanoutQueue {
    fn default() -> Self {
        Self::new(false)
    }
}

impl FrameFanoutQueue {
    pub fn new(insert_huffman: bool) -> Self {
        Self {
            frames: VecDeque::new(),
            next_id: 1,
            last_sequence: None,
            insert_huffman,
            stats: FanoutStats::default(),
        }
    }

    /// Builds the frame's envelope and appends it. Only envelope construction
    /// can fail; the handle is then returned inside `QueueRejected`.
    pub fn queue_frame(
        &mut self,
        handle: FrameHandle,
        store: &dyn FrameStore,
    ) -> Result<FrameId, QueueRejected> {
        let envelope = match store.frame_data(&handle) {
            Some(data) => Envelope::build(data, handle.timestamp(), self.insert_huffman),
            None => Err(anyhow!("frame buffer {} is not lent out", handle.index())),
        };
        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(error) => {
                self.stats.rejected += 1;
                return Err(QueueRejected { handle, error });
            }
        };

        let sequence = handle.sequence();
        if let Some(last) = self.last_sequence {
            let gap = sequence.wrapping_sub(last);
            if gap > 1 && gap < u32::MAX / 2 {
                let missed = u64::from(gap - 1);
                self.stats.missed += missed;
                log::warn!(
                    "capture sequence jumped {} -> {}: {} frame(s) missed",
                    last,
                    sequence,
                    missed
                );
            }
        }
        self.last_sequence = Some(sequence);

        let id = self.next_id;
        self.next_id += 1;
        self.frames.push_back(QueuedFrame {
            id,
            handle,
            envelope,
            pending_viewers: 0,
            served_count: 0,
        });
        self.stats.queued += 1;
        Ok(id)
    }

    /// Picks the frame a client should send after the one stamped `after`.
    ///
    /// That is the oldest frame strictly newer than `after`. If the client is
    /// ahead of every queued frame (the capture clock went backwards), it gets
    /// the newest one instead. `None` selects the oldest frame.
    pub fn select_next_for_client(&mut self, after: Option<FrameTimestamp>) -> Option<FrameLease> {
        let newest = self.frames.back()?.timestamp();
        let frame = match after {
            None => self.frames.front_mut(),
            Some(after) if after > newest => self.frames.back_mut(),
            Some(after) => self
                .frames
                .iter_mut()
                .filter(|frame| frame.timestamp() > after)
                .min_by_key(|frame| (frame.timestamp(), frame.id)),
        }?;
        frame.pending_viewers += 1;
        frame.served_count += 1;
        Some(FrameLease {
            frame: frame.id,
            timestamp: frame.timestamp(),
        })
    }

    pub fn frame(&self, id: FrameId) -> Option<&QueuedFrame> {
        let pos = self.position(id)?;
        self.frames.get(pos)
    }

    fn position(&self, id: FrameId) -> Option<usize> {
        self.frames.binary_search_by_key(&id, |frame| frame.id).ok()
    }

    /// Ends a lease. The frame becomes evictable once its last lease ends.
    pub fn release(&mut self, lease: FrameLease) {
        let Some(pos) = self.position(lease.frame) else {
            log::warn!("released frame {} is no longer queued", lease.frame);
            return;
        };
        let frame = &mut self.frames[pos];
        if frame.pending_viewers == 0 {
            log::warn!("frame {} released more often than leased", lease.frame);
            return;
        }
        frame.pending_viewers -= 1;
    }

    /// Removes frames no client is sending and hands their buffers back.
    ///
    /// Without `force`, only frames that reached at least one client go, and
    /// the newest frame stays for clients that ask next. With `force`, every
    /// idle frame goes.
    pub fn evict_ready(&mut self, force: bool) -> Vec<FrameHandle> {
        let newest = self.frames.back().map(|frame| frame.id);
        let mut evicted = Vec::new();
        let mut kept = VecDeque::with_capacity(self.frames.len());
        for frame in self.frames.drain(..) {
            let idle = frame.pending_viewers == 0;
            let evictable =
                idle && (force || (frame.served_count > 0 && Some(frame.id) != newest));
            if !evictable {
                kept.push_back(frame);
                continue;
            }
            if frame.served_count == 0 {
                self.stats.skipped += 1;
                log::debug!("frame {} skipped (seq {})", frame.id, frame.sequence());
            }
            self.stats.evicted += 1;
            evicted.push(frame.handle);
        }
        self.frames = kept;
        evicted
    }

    /// Waits for in-flight sends to finish, calling `drive` up to `attempts`
    /// times to make progress, then force-evicts every idle frame.
    ///
    /// Frames still leased afterwards stay queued; the caller must drop the
    /// clients holding them and evict again.
    pub fn drain_all(
        &mut self,
        attempts: u32,
        mut drive: impl FnMut(&mut Self),
    ) -> Vec<FrameHandle> {
        for _ in 0..attempts {
            if self.in_flight() == 0 {
                break;
            }
            drive(self);
        }
        self.evict_ready(true)
    }

    /// Forgets the last capture sequence, e.g. after the device restarted.
    pub fn reset_sequence(&mut self) {
        self.last_sequence = None;
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Outstanding leases across all frames.
    pub fn in_flight(&self) -> u32 {
        self.frames.iter().map(|frame| frame.pending_viewers).sum()
    }

    pub fn newest_timestamp(&self) -> Option<FrameTimestamp> {
        self.frames.back().map(QueuedFrame::timestamp)
    }

    pub fn stats(&self) -> FanoutStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{
        CaptureDevice, DeviceBufferPool, Faults, PoolConfig, SyntheticConfig, SyntheticDevice,
    };

    fn pool_with(buffers: u32, faults: Faults) -> DeviceBufferPool {
        let device = SyntheticDevice::new(SyntheticConfig::small("stub://fanout"))
            .with_faults(faults)
            .with_generator(|seq| format!("frame-{}", seq).into_bytes());
        let device: Box<dyn CaptureDevice> = Box::new(device);
        let config = PoolConfig {
            buffer_count: buffers,
            ioctl_retries: 2,
        };
        let mut pool = DeviceBufferPool::allocate(device, &config).unwrap();
        pool.start_streaming().unwrap();
        pool
    }

    fn pool(buffers: u32) -> DeviceBufferPool {
        pool_with(buffers, Faults::default())
    }

    fn queue_next(queue: &mut FrameFanoutQueue, pool: &mut DeviceBufferPool) -> FrameId {
        let handle = pool.dequeue_filled().unwrap().expect("frame");
        queue.queue_frame(handle, &*pool).unwrap()
    }

    fn assembled(queue: &FrameFanoutQueue, id: FrameId, pool: &DeviceBufferPool) -> Vec<u8> {
        let frame = queue.frame(id).unwrap();
        (0..frame.chunk_count())
            .flat_map(|i| frame.chunk(i, pool).unwrap().to_vec())
            .collect()
    }

    #[test]
    fn queued_frame_renders_full_envelope() {
        let mut pool = pool(2);
        let mut queue = FrameFanoutQueue::new(true);
        let id = queue_next(&mut queue, &mut pool);
        let frame = queue.frame(id).unwrap();
        assert_eq!(frame.content_length(), "frame-0".len());

        let bytes = assembled(&queue, id, &pool);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("Content-Type: image/jpeg\r\nContent-Length: 7\r\n"));
        assert!(text.ends_with("\r\n\r\nframe-0\r\n--BoundaryDoNotCross\r\n"));
        assert_eq!(text.len(), frame.wire_len());
    }

    #[test]
    fn default_queue_forwards_frames_unmodified() {
        // SOI, DQT, SOF0, SOS, scan data, EOI: no Huffman tables.
        let jpeg = vec![
            0xFF, 0xD8, 0xFF, 0xDB, 0x00, 0x04, 0x00, 0x01, 0xFF, 0xC0, 0x00, 0x05, 0x08, 0x00,
            0x10, 0xFF, 0xDA, 0x00, 0x03, 0x01, 0x12, 0x34, 0xFF, 0xD9,
        ];
        let filled = jpeg.clone();
        let device = SyntheticDevice::new(SyntheticConfig::small("stub://fanout"))
            .with_generator(move |_| filled.clone());
        let config = PoolConfig {
            buffer_count: 2,
            ioctl_retries: 2,
        };
        let mut pool = DeviceBufferPool::allocate(Box::new(device), &config).unwrap();
        pool.start_streaming().unwrap();

        let mut queue = FrameFanoutQueue::new(crate::streamer::LoopConfig::default().insert_huffman);
        let id = queue_next(&mut queue, &mut pool);
        let frame = queue.frame(id).unwrap();
        assert_eq!(frame.content_length(), jpeg.len());
        assert_eq!(frame.chunk_count(), 3);
        assert_eq!(frame.chunk(1, &pool), Some(jpeg.as_slice()));

        let mut spliced = FrameFanoutQueue::new(true);
        let id = queue_next(&mut spliced, &mut pool);
        assert_eq!(spliced.frame(id).unwrap().content_length(), jpeg.len() + 420);
    }

    #[test]
    fn selection_follows_capture_order() {
        let mut pool = pool(4);
        let mut queue = FrameFanoutQueue::default();
        for _ in 0..3 {
            queue_next(&mut queue, &mut pool);
        }

        let mut after = None;
        let mut seen = Vec::new();
        while let Some(lease) = queue.select_next_for_client(after) {
            if after.is_some_and(|t| lease.timestamp() <= t) {
                queue.release(lease);
                break;
            }
            after = Some(lease.timestamp());
            seen.push(queue.frame(lease.frame_id()).unwrap().sequence());
            queue.release(lease);
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn client_ahead_of_queue_gets_newest_frame() {
        let mut pool = pool(2);
        let mut queue = FrameFanoutQueue::default();
        queue_next(&mut queue, &mut pool);
        let newest = queue_next(&mut queue, &mut pool);

        let future = FrameTimestamp::new(i64::MAX / 2_000_000, 0);
        let lease = queue.select_next_for_client(Some(future)).unwrap();
        assert_eq!(lease.frame_id(), newest);
        queue.release(lease);

        let at_newest = queue.newest_timestamp();
        assert!(queue.select_next_for_client(at_newest).is_none());
    }

    #[test]
    fn leased_frames_are_never_evicted() {
        let mut pool = pool(2);
        let mut queue = FrameFanoutQueue::default();
        let id = queue_next(&mut queue, &mut pool);
        let lease = queue.select_next_for_client(None).unwrap();
        assert_eq!(queue.frame(id).unwrap().pending_viewers(), 1);

        assert!(queue.evict_ready(true).is_empty());
        assert_eq!(queue.in_flight(), 1);

        queue.release(lease);
        let handles = queue.evict_ready(true);
        assert_eq!(handles.len(), 1);
        for handle in handles {
            pool.enqueue_empty(handle).unwrap();
        }
    }

    #[test]
    fn unforced_eviction_keeps_unserved_and_newest_frames() {
        let mut pool = pool(4);
        let mut queue = FrameFanoutQueue::default();
        let first = queue_next(&mut queue, &mut pool);
        let second = queue_next(&mut queue, &mut pool);
        let third = queue_next(&mut queue, &mut pool);

        // Nothing was handed out yet.
        assert!(queue.evict_ready(false).is_empty());

        // One client receives the first two frames.
        let lease = queue.select_next_for_client(None).unwrap();
        queue.release(lease);
        let lease = queue.select_next_for_client(queue.frame(first).map(|f| f.timestamp())).unwrap();
        assert_eq!(lease.frame_id(), second);
        let after_second = lease.timestamp();
        queue.release(lease);

        let evicted = queue.evict_ready(false);
        let sequences: Vec<u32> = evicted.iter().map(|h| h.sequence()).collect();
        assert_eq!(sequences, vec![0, 1]);
        assert!(queue.frame(first).is_none());
        assert!(queue.frame(second).is_none());
        assert!(queue.frame(third).is_some());
        for handle in evicted {
            pool.enqueue_empty(handle).unwrap();
        }

        // The newest frame stays available even once served.
        let lease = queue.select_next_for_client(Some(after_second)).unwrap();
        assert_eq!(lease.frame_id(), third);
        queue.release(lease);
        assert!(queue.evict_ready(false).is_empty());

        let unserved = queue_next(&mut queue, &mut pool);
        assert!(queue.frame(unserved).is_some());
        let forced = queue.evict_ready(true);
        assert_eq!(forced.len(), 2);
        assert_eq!(queue.stats().skipped, 1);
        assert_eq!(queue.stats().evicted, 4);
        for handle in forced {
            pool.enqueue_empty(handle).unwrap();
        }
        assert_eq!(pool.device_held_count(), 4);
    }

    #[test]
    fn eviction_returns_the_queued_buffer_index() {
        let mut pool = pool(3);
        let mut queue = FrameFanoutQueue::default();
        let mut indices = Vec::new();
        for _ in 0..3 {
            let handle = pool.dequeue_filled().unwrap().unwrap();
            indices.push(handle.index());
            queue.queue_frame(handle, &pool).unwrap();
        }
        let returned: Vec<u32> = queue.evict_ready(true).iter().map(|h| h.index()).collect();
        assert_eq!(returned, indices);
    }

    #[test]
    fn sequence_gap_counts_missed_frames() {
        let mut pool = pool_with(
            4,
            Faults {
                skip_sequences: vec![2],
                ..Faults::default()
            },
        );
        let mut queue = FrameFanoutQueue::default();
        for _ in 0..3 {
            queue_next(&mut queue, &mut pool);
        }
        assert_eq!(queue.stats().missed, 1);
        assert_eq!(queue.len(), 3);

        queue.reset_sequence();
        for handle in queue.evict_ready(true) {
            pool.enqueue_empty(handle).unwrap();
        }
        queue_next(&mut queue, &mut pool);
        assert_eq!(queue.stats().missed, 1);
    }

    #[test]
    fn stale_handle_is_rejected_with_handle_returned() {
        let mut pool = pool(2);
        let mut other = pool_with(2, Faults::default());
        let mut queue = FrameFanoutQueue::default();

        let foreign = other.dequeue_filled().unwrap().unwrap();
        let rejected = queue.queue_frame(foreign, &pool).unwrap_err();
        assert_eq!(queue.stats().rejected, 1);
        assert!(queue.is_empty());
        other.enqueue_empty(rejected.handle).unwrap();
        assert_eq!(other.device_held_count(), 2);

        queue_next(&mut queue, &mut pool);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn drain_drives_until_leases_end() {
        let mut pool = pool(2);
        let mut queue = FrameFanoutQueue::default();
        queue_next(&mut queue, &mut pool);
        let mut lease = queue.select_next_for_client(None);

        let mut drives = 0;
        let drained = queue.drain_all(10, |q| {
            drives += 1;
            if let Some(lease) = lease.take() {
                q.release(lease);
            }
        });
        assert_eq!(drives, 1);
        assert_eq!(drained.len(), 1);
        assert!(queue.is_empty());
        for handle in drained {
            pool.enqueue_empty(handle).unwrap();
        }
    }
}
