//! Fixed pool of device-mapped capture buffers.
//!
//! Each buffer is either held by the device (queued, being filled) or lent to
//! the application as a `FrameHandle`. The handle is a lease token: it carries
//! the buffer index plus a generation counter, so a handle that outlives its
//! lease (returned twice, or kept across a pool re-allocation) is rejected
//! instead of aliasing a buffer the device is writing into.

use anyhow::{anyhow, bail, Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{retry, CaptureDevice, FrameTimestamp, MappedRegion};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    pub buffer_count: u32,
    /// Attempts per device call while it fails transiently.
    pub ioctl_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_count: 4,
            ioctl_retries: 5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    DeviceHeld,
    ApplicationHeld,
}

struct CaptureBuffer {
    index: u32,
    region: MappedRegion,
    state: BufferState,
    generation: u64,
    bytes_used: u32,
    sequence: u32,
    timestamp: FrameTimestamp,
}

/// Read-only lease on one filled capture buffer.
///
/// Not `Clone`: a handle is consumed exactly once, either by
/// `DeviceBufferPool::enqueue_empty` or by handing it to the fan-out queue.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a frame handle must be returned to the pool"]
pub struct FrameHandle {
    pool_id: u64,
    index: u32,
    generation: u64,
    bytes_used: u32,
    sequence: u32,
    timestamp: FrameTimestamp,
}

impl FrameHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn timestamp(&self) -> FrameTimestamp {
        self.timestamp
    }

    /// Filled length in bytes.
    pub fn len(&self) -> usize {
        self.bytes_used as usize
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_used == 0
    }
}

pub struct DeviceBufferPool {
    id: u64,
    device: Box<dyn CaptureDevice>,
    buffers: Vec<CaptureBuffer>,
    tries: u32,
    usable: bool,
    streaming: bool,
    released: bool,
}

impl DeviceBufferPool {
    /// Requests, maps and enqueues `config.buffer_count` buffers.
    ///
    /// Fails the whole pool if any buffer cannot be set up; buffers mapped so
    /// far are unmapped and the device pool is dropped before returning.
    pub fn allocate(mut device: Box<dyn CaptureDevice>, config: &PoolConfig) -> Result<Self> {
        let tries = config.ioctl_retries.max(1);
        let wanted = config.buffer_count;
        if wanted == 0 {
            bail!("buffer pool needs at least one buffer");
        }

        let granted = retry(tries, || device.request_buffers(wanted))
            .with_context(|| format!("request {} buffers from {}", wanted, device.name()))?;
        if granted < wanted {
            drop_device_pool(device.as_mut(), tries);
            bail!(
                "{} granted {} of {} requested buffers",
                device.name(),
                granted,
                wanted
            );
        }

        let mut buffers: Vec<CaptureBuffer> = Vec::with_capacity(wanted as usize);
        for index in 0..wanted {
            match prepare_buffer(device.as_mut(), index, tries) {
                Ok(region) => buffers.push(CaptureBuffer {
                    index,
                    region,
                    state: BufferState::DeviceHeld,
                    generation: 0,
                    bytes_used: 0,
                    sequence: 0,
                    timestamp: FrameTimestamp::default(),
                }),
                Err(err) => {
                    for buffer in buffers.drain(..) {
                        if let Err(unmap_err) = device.unmap_buffer(buffer.region) {
                            log::warn!("unmap buffer {} failed: {}", buffer.index, unmap_err);
                        }
                    }
                    drop_device_pool(device.as_mut(), tries);
                    return Err(err.context(format!("set up buffer {} of {}", index, wanted)));
                }
            }
        }

        log::debug!("{}: {} capture buffers mapped", device.name(), buffers.len());
        Ok(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            device,
            buffers,
            tries,
            usable: true,
            streaming: false,
            released: false,
        })
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    pub fn start_streaming(&mut self) -> Result<()> {
        self.ensure_usable()?;
        let tries = self.tries;
        let device = &mut self.device;
        retry(tries, || device.stream_on())
            .with_context(|| format!("start streaming on {}", self.device.name()))?;
        self.streaming = true;
        Ok(())
    }

    pub fn stop_streaming(&mut self) {
        if !self.streaming {
            return;
        }
        let tries = self.tries;
        let device = &mut self.device;
        if let Err(err) = retry(tries, || device.stream_off()) {
            log::warn!("stop streaming on {} failed: {}", self.device.name(), err);
        }
        self.streaming = false;
    }

    /// Takes one filled buffer from the device.
    ///
    /// `Ok(None)` means the device has nothing ready. Any error leaves the
    /// pool unusable until it is released and allocated again.
    pub fn dequeue_filled(&mut self) -> Result<Option<FrameHandle>> {
        self.ensure_usable()?;
        let tries = self.tries;
        let device = &mut self.device;
        let filled = match retry(tries, || device.dequeue_buffer()) {
            Ok(filled) => filled,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(err) => {
                self.usable = false;
                return Err(anyhow::Error::new(err)
                    .context(format!("dequeue buffer from {}", self.device.name())));
            }
        };

        let Some(buffer) = self.buffers.get_mut(filled.index as usize) else {
            let device = &mut self.device;
            if let Err(err) = retry(tries, || device.queue_buffer(filled.index)) {
                log::warn!("requeue of unknown buffer {} failed: {}", filled.index, err);
            }
            self.usable = false;
            bail!(
                "{} returned unexpected buffer index {}",
                self.device.name(),
                filled.index
            );
        };
        if buffer.state != BufferState::DeviceHeld {
            self.usable = false;
            bail!("device returned buffer {} while it was lent out", filled.index);
        }

        buffer.state = BufferState::ApplicationHeld;
        buffer.generation += 1;
        buffer.bytes_used = filled.bytes_used.min(buffer.region.len() as u32);
        buffer.sequence = filled.sequence;
        buffer.timestamp = filled.timestamp;

        Ok(Some(FrameHandle {
            pool_id: self.id,
            index: buffer.index,
            generation: buffer.generation,
            bytes_used: buffer.bytes_used,
            sequence: buffer.sequence,
            timestamp: buffer.timestamp,
        }))
    }

    /// Returns a dequeued buffer to the device. This is the only way a lease ends.
    ///
    /// A stale handle is rejected without touching the device. A device
    /// failure leaves the pool unusable.
    pub fn enqueue_empty(&mut self, handle: FrameHandle) -> Result<()> {
        self.ensure_usable()?;
        let index = self.lease_index(&handle)?;
        let tries = self.tries;
        let device = &mut self.device;
        if let Err(err) = retry(tries, || device.queue_buffer(handle.index)) {
            self.usable = false;
            return Err(anyhow::Error::new(err)
                .context(format!("queue buffer {} to {}", handle.index, self.device.name())));
        }
        self.buffers[index].state = BufferState::DeviceHeld;
        Ok(())
    }

    /// Filled bytes of a leased buffer, or `None` if the handle is stale.
    pub fn frame_data(&self, handle: &FrameHandle) -> Option<&[u8]> {
        let index = self.lease_index(handle).ok()?;
        let buffer = &self.buffers[index];
        // SAFETY: the lease is current, so the buffer is application-held and
        // the device does not write into it until it is enqueued again.
        Some(unsafe { buffer.region.filled(buffer.bytes_used as usize) })
    }

    /// Unmaps every buffer and tells the device to drop its pool. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.stop_streaming();
        for buffer in self.buffers.drain(..) {
            if let Err(err) = self.device.unmap_buffer(buffer.region) {
                log::warn!("unmap buffer {} failed: {}", buffer.index, err);
            }
        }
        drop_device_pool(self.device.as_mut(), self.tries);
        self.usable = false;
        self.released = true;
    }

    pub fn is_usable(&self) -> bool {
        self.usable
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn states(&self) -> Vec<BufferState> {
        self.buffers.iter().map(|b| b.state).collect()
    }

    pub fn device_held_count(&self) -> usize {
        self.count_state(BufferState::DeviceHeld)
    }

    pub fn application_held_count(&self) -> usize {
        self.count_state(BufferState::ApplicationHeld)
    }

    fn count_state(&self, state: BufferState) -> usize {
        self.buffers.iter().filter(|b| b.state == state).count()
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.usable {
            Ok(())
        } else {
            Err(anyhow!(
                "buffer pool of {} is unusable until re-allocated",
                self.device.name()
            ))
        }
    }

    fn lease_index(&self, handle: &FrameHandle) -> Result<usize> {
        if handle.pool_id != self.id {
            bail!("frame handle {} belongs to a released pool", handle.index);
        }
        let buffer = self
            .buffers
            .get(handle.index as usize)
            .ok_or_else(|| anyhow!("frame handle index {} out of range", handle.index))?;
        if buffer.state != BufferState::ApplicationHeld || buffer.generation != handle.generation {
            bail!("stale frame handle for buffer {}", handle.index);
        }
        Ok(handle.index as usize)
    }
}

impl Drop for DeviceBufferPool {
    fn drop(&mut self) {
        self.release();
    }
}

fn prepare_buffer(device: &mut dyn CaptureDevice, index: u32, tries: u32) -> Result<MappedRegion> {
    let region = retry(tries, || device.map_buffer(index)).context("map buffer")?;
    if let Err(err) = retry(tries, || device.queue_buffer(index)) {
        if let Err(unmap_err) = device.unmap_buffer(region) {
            log::warn!("unmap buffer {} failed: {}", index, unmap_err);
        }
        return Err(anyhow::Error::new(err).context("queue empty buffer"));
    }
    Ok(region)
}

fn drop_device_pool(device: &mut dyn CaptureDevice, tries: u32) {
    if let Err(err) = retry(tries, || device.request_buffers(0)) {
        log::warn!("release device buffers on {} failed: {}", device.name(), err);
    }
}
