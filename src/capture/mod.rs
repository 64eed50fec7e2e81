//! Frame capture.
//!
//! This module owns everything on the device side of the pipeline:
//! - `CaptureDevice`: the handshake seam to a capture device (V4L2 or synthetic)
//! - `DeviceBufferPool`: fixed set of mapped capture buffers and their lease tokens
//! - `FrameSource`: device lifecycle, degraded-state tracking and recovery
//!
//! Buffers are never copied. A dequeued buffer is lent to the application as a
//! `FrameHandle` and stays application-held until it is returned with
//! `FrameSource::requeue_frame`.

pub mod controls;
pub mod pool;
pub mod source;
pub mod synthetic;
#[cfg(target_os = "linux")]
pub mod v4l2;

use std::fmt;
use std::io;
use std::ptr::NonNull;

pub use controls::{ControlPreset, ControlSetting};
pub use pool::{BufferState, DeviceBufferPool, FrameHandle, PoolConfig};
pub use source::{open_device, CaptureConfig, DeviceOpener, FrameSource, FrameStore};
pub use synthetic::{Faults, SyntheticConfig, SyntheticDevice, SyntheticProbe};

/// Capture timestamp reported by the device.
///
/// Ordering is seconds first, then microseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameTimestamp {
    pub secs: i64,
    pub micros: i64,
}

impl FrameTimestamp {
    pub const fn new(secs: i64, micros: i64) -> Self {
        Self { secs, micros }
    }

    pub fn from_micros(total: i64) -> Self {
        Self {
            secs: total.div_euclid(1_000_000),
            micros: total.rem_euclid(1_000_000),
        }
    }

    pub fn as_micros(&self) -> i64 {
        self.secs.saturating_mul(1_000_000).saturating_add(self.micros)
    }
}

impl fmt::Display for FrameTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs, self.micros)
    }
}

/// Requested or negotiated capture format. Frames are always MJPEG.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

impl fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.fps)
    }
}

/// Memory region shared between a capture device and the process.
///
/// The region is produced by `CaptureDevice::map_buffer` and must be handed
/// back to the same device with `CaptureDevice::unmap_buffer`.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedRegion {
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `len` bytes until the region is
    /// returned to the device that created it.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// The device must not be writing into the region for the lifetime of the
    /// returned slice, i.e. the buffer must be application-held.
    pub(crate) unsafe fn filled(&self, used: usize) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), used.min(self.len))
    }
}

/// Buffer metadata reported by the device on dequeue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilledBuffer {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
    pub timestamp: FrameTimestamp,
}

/// Handshake with a streaming capture device.
///
/// Every call is non-blocking. Transient failures are reported as
/// `Interrupted`, `WouldBlock` or `TimedOut`; callers retry those in place.
pub trait CaptureDevice {
    /// Device path or name, for diagnostics.
    fn name(&self) -> &str;

    /// Applies the requested format and frame rate, returning what the device accepted.
    fn negotiate(&mut self, requested: CaptureFormat) -> io::Result<CaptureFormat>;

    fn set_control(&mut self, id: u32, value: i32) -> io::Result<()>;

    /// Requests `count` buffers; `0` drops the device's pool. Returns the granted count.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    fn map_buffer(&mut self, index: u32) -> io::Result<MappedRegion>;

    fn unmap_buffer(&mut self, region: MappedRegion) -> io::Result<()>;

    /// Hands an empty buffer to the device.
    fn queue_buffer(&mut self, index: u32) -> io::Result<()>;

    /// Takes back one filled buffer. `WouldBlock` means nothing is ready yet.
    fn dequeue_buffer(&mut self) -> io::Result<FilledBuffer>;

    fn stream_on(&mut self) -> io::Result<()>;

    fn stream_off(&mut self) -> io::Result<()>;
}

/// Device-specific tuning applied once after format negotiation and before streaming.
pub trait DeviceTuner {
    fn tune(&mut self, device: &mut dyn CaptureDevice) -> anyhow::Result<()>;
}

impl<F> DeviceTuner for F
where
    F: FnMut(&mut dyn CaptureDevice) -> anyhow::Result<()>,
{
    fn tune(&mut self, device: &mut dyn CaptureDevice) -> anyhow::Result<()> {
        self(device)
    }
}

pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Runs `op` up to `tries` times while it fails transiently.
pub(crate) fn retry<T>(tries: u32, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(err) if is_transient(&err) && attempt < tries => attempt += 1,
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_order_by_seconds_then_micros() {
        let a = FrameTimestamp::new(10, 999_999);
        let b = FrameTimestamp::new(11, 0);
        let c = FrameTimestamp::new(11, 1);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(FrameTimestamp::from_micros(11_000_001), c);
        assert_eq!(c.to_string(), "11.000001");
    }

    #[test]
    fn retry_stops_on_fatal_error() {
        let mut calls = 0;
        let result: io::Result<()> = retry(5, || {
            calls += 1;
            Err(io::Error::new(io::ErrorKind::Other, "fatal"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn retry_is_bounded_for_transient_errors() {
        let mut calls = 0;
        let result: io::Result<()> = retry(5, || {
            calls += 1;
            Err(io::ErrorKind::Interrupted.into())
        });
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::Interrupted);
        assert_eq!(calls, 5);
    }

    #[test]
    fn retry_returns_first_success() {
        let mut calls = 0;
        let result = retry(5, || {
            calls += 1;
            if calls < 3 {
                Err(io::ErrorKind::WouldBlock.into())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }
}
