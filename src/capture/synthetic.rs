//! Synthetic capture device for `stub://` paths.
//!
//! Behaves like a V4L2 streaming device: buffers are heap slabs handed out
//! through `map_buffer`, the queue is FIFO, and `dequeue_buffer` reports
//! `WouldBlock` when nothing is queued. Frames are real JPEG images, so the
//! whole pipeline runs end to end without hardware.
//!
//! `Faults` injects device failures (transient errors, hot-unplug, dropped
//! sequence numbers) and `SyntheticProbe` observes the device from tests
//! after it has been moved into a pool.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::ptr::NonNull;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::{CaptureDevice, CaptureFormat, FilledBuffer, FrameTimestamp, MappedRegion};

/// Produces the payload for a given frame sequence number.
pub type FrameGenerator = Box<dyn FnMut(u32) -> Vec<u8>>;

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub name: String,
    pub format: CaptureFormat,
    /// Size of each capture buffer. Longer payloads are truncated.
    pub buffer_len: usize,
    /// Deliver at most one frame per frame interval.
    pub paced: bool,
}

impl SyntheticConfig {
    pub fn new(name: impl Into<String>, format: CaptureFormat) -> Self {
        Self {
            name: name.into(),
            format,
            buffer_len: (format.width as usize * format.height as usize * 2).max(4096),
            paced: true,
        }
    }

    /// Tiny unpaced device for tests.
    pub fn small(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: CaptureFormat {
                width: 64,
                height: 48,
                fps: 30,
            },
            buffer_len: 64 * 1024,
            paced: false,
        }
    }
}

/// Failure injection for the synthetic device.
#[derive(Clone, Debug, Default)]
pub struct Faults {
    /// Sequence numbers the device never delivers.
    pub skip_sequences: Vec<u32>,
    /// Number of `Interrupted` errors returned before the next dequeue succeeds.
    pub transient_dequeue_errors: u32,
    /// Every dequeue fails once this many frames have been delivered.
    pub fail_dequeue_after: Option<u64>,
    /// Every queue call fails once this many queue calls have succeeded.
    pub fail_queue_after: Option<u64>,
    /// Mapping this buffer index fails.
    pub fail_map_at: Option<u32>,
    /// Grant at most this many buffers.
    pub grant_limit: Option<u32>,
    /// Control ids the device rejects.
    pub reject_controls: Vec<u32>,
}

#[derive(Default)]
struct ProbeState {
    dequeue_calls: Cell<u64>,
    queue_calls: Cell<u64>,
    map_calls: Cell<u64>,
    unmap_calls: Cell<u64>,
    mapped: Cell<usize>,
    requested: Cell<u32>,
    streaming: Cell<bool>,
    delivered: Cell<u64>,
    negotiated: Cell<Option<CaptureFormat>>,
    controls: RefCell<Vec<(u32, i32)>>,
}

/// Read-only view of a `SyntheticDevice` that stays valid after the device is boxed.
#[derive(Clone, Default)]
pub struct SyntheticProbe {
    state: Rc<ProbeState>,
}

impl SyntheticProbe {
    pub fn dequeue_calls(&self) -> u64 {
        self.state.dequeue_calls.get()
    }

    pub fn queue_calls(&self) -> u64 {
        self.state.queue_calls.get()
    }

    pub fn map_calls(&self) -> u64 {
        self.state.map_calls.get()
    }

    pub fn unmap_calls(&self) -> u64 {
        self.state.unmap_calls.get()
    }

    /// Buffers currently mapped.
    pub fn mapped_buffers(&self) -> usize {
        self.state.mapped.get()
    }

    /// Size of the device's current buffer pool.
    pub fn requested_buffers(&self) -> u32 {
        self.state.requested.get()
    }

    pub fn streaming(&self) -> bool {
        self.state.streaming.get()
    }

    /// Frames delivered by successful dequeues.
    pub fn delivered(&self) -> u64 {
        self.state.delivered.get()
    }

    pub fn negotiated(&self) -> Option<CaptureFormat> {
        self.state.negotiated.get()
    }

    /// Controls applied, in order.
    pub fn controls(&self) -> Vec<(u32, i32)> {
        self.state.controls.borrow().clone()
    }
}

struct Slab {
    raw: NonNull<[u8]>,
    mapped: bool,
}

impl Slab {
    fn alloc(len: usize) -> Self {
        let boxed: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        // SAFETY: Box::into_raw never returns null.
        let raw = unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) };
        Self { raw, mapped: false }
    }

    fn len(&self) -> usize {
        self.raw.len()
    }

    fn base(&self) -> NonNull<u8> {
        self.raw.cast()
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        // SAFETY: `raw` came from Box::into_raw in `alloc` and is freed once.
        unsafe { drop(Box::from_raw(self.raw.as_ptr())) };
    }
}

pub struct SyntheticDevice {
    config: SyntheticConfig,
    faults: Faults,
    generator: FrameGenerator,
    slabs: Vec<Slab>,
    queued: VecDeque<u32>,
    next_sequence: u32,
    epoch_micros: i64,
    last_delivery: Option<Instant>,
    probe: SyntheticProbe,
}

impl SyntheticDevice {
    pub fn new(config: SyntheticConfig) -> Self {
        let epoch_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        let generator = test_pattern(config.format);
        Self {
            config,
            faults: Faults::default(),
            generator,
            slabs: Vec::new(),
            queued: VecDeque::new(),
            next_sequence: 0,
            epoch_micros,
            last_delivery: None,
            probe: SyntheticProbe::default(),
        }
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    pub fn with_generator(mut self, generator: impl FnMut(u32) -> Vec<u8> + 'static) -> Self {
        self.generator = Box::new(generator);
        self
    }

    pub fn probe(&self) -> SyntheticProbe {
        self.probe.clone()
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.config.format.fps.max(1)))
    }

    fn slab(&self, index: u32) -> io::Result<&Slab> {
        self.slabs
            .get(index as usize)
            .ok_or_else(|| invalid(format!("buffer index {} out of range", index)))
    }

    fn next_delivered_sequence(&mut self) -> u32 {
        while self.faults.skip_sequences.contains(&self.next_sequence) {
            self.next_sequence = self.next_sequence.wrapping_add(1);
        }
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        sequence
    }
}

impl CaptureDevice for SyntheticDevice {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn negotiate(&mut self, requested: CaptureFormat) -> io::Result<CaptureFormat> {
        let accepted = CaptureFormat {
            fps: requested.fps.max(1),
            ..requested
        };
        self.config.format = accepted;
        self.probe.state.negotiated.set(Some(accepted));
        Ok(accepted)
    }

    fn set_control(&mut self, id: u32, value: i32) -> io::Result<()> {
        if self.faults.reject_controls.contains(&id) {
            return Err(invalid(format!("control {:#010x} not supported", id)));
        }
        self.probe.state.controls.borrow_mut().push((id, value));
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        if self.probe.streaming() {
            return Err(io::Error::new(io::ErrorKind::Other, "device is streaming"));
        }
        if self.slabs.iter().any(|slab| slab.mapped) {
            return Err(io::Error::new(io::ErrorKind::Other, "buffers still mapped"));
        }
        self.slabs.clear();
        self.queued.clear();

        let granted = self.faults.grant_limit.map_or(count, |limit| count.min(limit));
        self.slabs = (0..granted)
            .map(|_| Slab::alloc(self.config.buffer_len))
            .collect();
        self.probe.state.requested.set(granted);
        Ok(granted)
    }

    fn map_buffer(&mut self, index: u32) -> io::Result<MappedRegion> {
        let state = &self.probe.state;
        state.map_calls.set(state.map_calls.get() + 1);
        if self.faults.fail_map_at == Some(index) {
            return Err(io::Error::new(io::ErrorKind::Other, "mmap failed"));
        }
        let slab = self
            .slabs
            .get_mut(index as usize)
            .ok_or_else(|| invalid(format!("buffer index {} out of range", index)))?;
        if slab.mapped {
            return Err(invalid(format!("buffer {} already mapped", index)));
        }
        slab.mapped = true;
        state.mapped.set(state.mapped.get() + 1);
        // SAFETY: the slab stays allocated while mapped; request_buffers refuses
        // to free mapped slabs.
        Ok(unsafe { MappedRegion::new(slab.base(), slab.len()) })
    }

    fn unmap_buffer(&mut self, region: MappedRegion) -> io::Result<()> {
        let state = &self.probe.state;
        state.unmap_calls.set(state.unmap_calls.get() + 1);
        let slab = self
            .slabs
            .iter_mut()
            .find(|slab| slab.mapped && slab.base().as_ptr() == region.as_ptr())
            .ok_or_else(|| invalid("region was not mapped by this device".to_string()))?;
        slab.mapped = false;
        state.mapped.set(state.mapped.get().saturating_sub(1));
        Ok(())
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let state = &self.probe.state;
        let calls = state.queue_calls.get();
        state.queue_calls.set(calls + 1);
        if self.faults.fail_queue_after.is_some_and(|limit| calls >= limit) {
            return Err(io::Error::new(io::ErrorKind::Other, "no such device"));
        }
        if !self.slab(index)?.mapped {
            return Err(invalid(format!("buffer {} is not mapped", index)));
        }
        if self.queued.contains(&index) {
            return Err(invalid(format!("buffer {} already queued", index)));
        }
        self.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> io::Result<FilledBuffer> {
        let state = Rc::clone(&self.probe.state);
        state.dequeue_calls.set(state.dequeue_calls.get() + 1);

        if self.faults.transient_dequeue_errors > 0 {
            self.faults.transient_dequeue_errors -= 1;
            return Err(io::ErrorKind::Interrupted.into());
        }
        if self
            .faults
            .fail_dequeue_after
            .is_some_and(|limit| state.delivered.get() >= limit)
        {
            return Err(io::Error::new(io::ErrorKind::Other, "no such device"));
        }
        if !state.streaming.get() {
            return Err(invalid("device is not streaming".to_string()));
        }
        if self.config.paced {
            if let Some(last) = self.last_delivery {
                if last.elapsed() < self.frame_interval() {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
            }
        }
        let Some(index) = self.queued.pop_front() else {
            return Err(io::ErrorKind::WouldBlock.into());
        };

        let sequence = self.next_delivered_sequence();
        let payload = (self.generator)(sequence);
        let slab = self.slab(index)?;
        let used = payload.len().min(slab.len());
        // SAFETY: the buffer was queued, so no application lease aliases it,
        // and `used` is bounded by the slab length.
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), slab.base().as_ptr(), used);
        }

        let interval = self.frame_interval().as_micros() as i64;
        let timestamp =
            FrameTimestamp::from_micros(self.epoch_micros + i64::from(sequence) * interval);
        self.last_delivery = Some(Instant::now());
        state.delivered.set(state.delivered.get() + 1);

        Ok(FilledBuffer {
            index,
            bytes_used: used as u32,
            sequence,
            timestamp,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        if self.slabs.is_empty() {
            return Err(invalid("no buffers requested".to_string()));
        }
        self.probe.state.streaming.set(true);
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.probe.state.streaming.set(false);
        self.queued.clear();
        Ok(())
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        if self.slabs.iter().any(|slab| slab.mapped) {
            log::warn!("{}: dropped with mapped buffers", self.config.name);
        }
        self.probe.state.streaming.set(false);
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}

/// Moving-bar JPEG test pattern. Eight distinct frames are encoded once and reused.
pub fn test_pattern(format: CaptureFormat) -> FrameGenerator {
    const PHASES: u32 = 8;
    let mut cache: HashMap<u32, Vec<u8>> = HashMap::new();
    Box::new(move |sequence| {
        let phase = sequence % PHASES;
        cache
            .entry(phase)
            .or_insert_with(|| encode_pattern(format, phase, PHASES))
            .clone()
    })
}

fn encode_pattern(format: CaptureFormat, phase: u32, phases: u32) -> Vec<u8> {
    let width = format.width.max(8);
    let height = format.height.max(8);
    let bar_width = (width / phases).max(1);
    let bar_start = phase * bar_width;

    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height {
        for x in 0..width {
            if x >= bar_start && x < bar_start + bar_width {
                rgb.extend_from_slice(&[240, 240, 240]);
            } else {
                let r = (x * 255 / width) as u8;
                let g = (y * 255 / height) as u8;
                rgb.extend_from_slice(&[r, g, 96]);
            }
        }
    }

    let mut out = Vec::new();
    let encoded = {
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 80);
        encoder.encode(&rgb, width, height, image::ExtendedColorType::Rgb8)
    };
    match encoded {
        Ok(()) => out,
        Err(err) => {
            log::warn!("synthetic frame encode failed: {}", err);
            vec![0xFF, 0xD8, 0xFF, 0xD9]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped_device(buffers: u32) -> (SyntheticDevice, Vec<MappedRegion>) {
        let mut device = SyntheticDevice::new(SyntheticConfig::small("stub://t"));
        assert_eq!(device.request_buffers(buffers).unwrap(), buffers);
        let regions = (0..buffers)
            .map(|i| device.map_buffer(i).unwrap())
            .collect();
        (device, regions)
    }

    #[test]
    fn dequeue_without_queued_buffers_would_block() {
        let (mut device, regions) = mapped_device(2);
        device.stream_on().unwrap();
        let err = device.dequeue_buffer().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        device.stream_off().unwrap();
        for region in regions {
            device.unmap_buffer(region).unwrap();
        }
    }

    #[test]
    fn frames_are_jpeg_and_fifo() {
        let (mut device, regions) = mapped_device(2);
        device.queue_buffer(1).unwrap();
        device.queue_buffer(0).unwrap();
        device.stream_on().unwrap();

        let first = device.dequeue_buffer().unwrap();
        let second = device.dequeue_buffer().unwrap();
        assert_eq!((first.index, second.index), (1, 0));
        assert_eq!((first.sequence, second.sequence), (0, 1));
        assert!(first.timestamp < second.timestamp);

        let data = unsafe { regions[1].filled(first.bytes_used as usize) };
        assert_eq!(&data[..2], &[0xFF, 0xD8]);

        device.stream_off().unwrap();
        for region in regions {
            device.unmap_buffer(region).unwrap();
        }
    }

    #[test]
    fn skipped_sequences_leave_gaps() {
        let faults = Faults {
            skip_sequences: vec![1],
            ..Faults::default()
        };
        let mut device = SyntheticDevice::new(SyntheticConfig::small("stub://t"))
            .with_faults(faults)
            .with_generator(|seq| vec![seq as u8; 4]);
        device.request_buffers(1).unwrap();
        let region = device.map_buffer(0).unwrap();
        device.stream_on().unwrap();

        let mut sequences = Vec::new();
        for _ in 0..3 {
            device.queue_buffer(0).unwrap();
            sequences.push(device.dequeue_buffer().unwrap().sequence);
        }
        assert_eq!(sequences, vec![0, 2, 3]);

        device.stream_off().unwrap();
        device.unmap_buffer(region).unwrap();
    }

    #[test]
    fn pool_cannot_be_dropped_while_mapped() {
        let (mut device, regions) = mapped_device(1);
        assert!(device.request_buffers(0).is_err());
        for region in regions {
            device.unmap_buffer(region).unwrap();
        }
        assert_eq!(device.request_buffers(0).unwrap(), 0);
        assert_eq!(device.probe().requested_buffers(), 0);
    }
}
