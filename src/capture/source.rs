//! Capture device lifecycle.
//!
//! `FrameSource` opens the device, negotiates MJPEG at the configured
//! resolution and rate, applies tuning, allocates the buffer pool and starts
//! streaming. Any device failure flips it into the broken state; the owner is
//! expected to drain outstanding handles and call `reinit`.

use anyhow::{bail, Context, Result};

use super::pool::{DeviceBufferPool, FrameHandle, PoolConfig};
use super::synthetic::{SyntheticConfig, SyntheticDevice};
use super::{CaptureDevice, CaptureFormat, DeviceTuner};

#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// Device path (e.g., "/dev/video0"), or `stub://name` for the synthetic device.
    pub device: String,
    pub format: CaptureFormat,
    pub buffer_count: u32,
    pub ioctl_retries: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            format: CaptureFormat::default(),
            buffer_count: 4,
            ioctl_retries: 5,
        }
    }
}

impl CaptureConfig {
    fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            buffer_count: self.buffer_count,
            ioctl_retries: self.ioctl_retries,
        }
    }
}

/// Opens the capture device named by a config. Called on every (re)initialization.
pub type DeviceOpener = Box<dyn FnMut(&CaptureConfig) -> Result<Box<dyn CaptureDevice>>>;

/// Default opener: `stub://` paths get the synthetic device, everything else V4L2.
pub fn open_device(config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>> {
    if config.device.starts_with("stub://") {
        let synthetic = SyntheticConfig::new(config.device.clone(), config.format);
        return Ok(Box::new(SyntheticDevice::new(synthetic)));
    }
    open_v4l2(config)
}

#[cfg(target_os = "linux")]
fn open_v4l2(config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>> {
    let device = super::v4l2::V4l2Device::open(&config.device)?;
    Ok(Box::new(device))
}

#[cfg(not(target_os = "linux"))]
fn open_v4l2(config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>> {
    bail!(
        "V4L2 capture is only available on Linux (device {})",
        config.device
    )
}

/// Resolves a frame handle to its bytes.
pub trait FrameStore {
    fn frame_data(&self, handle: &FrameHandle) -> Option<&[u8]>;
}

pub struct FrameSource {
    config: CaptureConfig,
    opener: DeviceOpener,
    tuner: Option<Box<dyn DeviceTuner>>,
    pool: Option<DeviceBufferPool>,
    active_format: Option<CaptureFormat>,
    broken: bool,
    frames_dequeued: u64,
}

impl FrameSource {
    pub fn new(config: CaptureConfig) -> Self {
        Self::with_opener(config, Box::new(open_device))
    }

    pub fn with_opener(config: CaptureConfig, opener: DeviceOpener) -> Self {
        Self {
            config,
            opener,
            tuner: None,
            pool: None,
            active_format: None,
            broken: false,
            frames_dequeued: 0,
        }
    }

    pub fn with_tuner(mut self, tuner: Box<dyn DeviceTuner>) -> Self {
        self.tuner = Some(tuner);
        self
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Opens and starts the device. Never panics or propagates; failures are
    /// logged and reported as `false`, leaving the source not ready.
    pub fn init(&mut self) -> bool {
        if self.pool.is_some() {
            log::warn!("{}: init on a running source, shutting down first", self.config.device);
            self.shutdown();
        }
        match self.start() {
            Ok(pool) => {
                log::info!(
                    "{}: streaming MJPEG {} with {} buffers",
                    self.config.device,
                    self.active_format.unwrap_or(self.config.format),
                    pool.len()
                );
                self.pool = Some(pool);
                self.broken = false;
                true
            }
            Err(err) => {
                log::warn!("{}: capture init failed: {:#}", self.config.device, err);
                self.active_format = None;
                false
            }
        }
    }

    fn start(&mut self) -> Result<DeviceBufferPool> {
        let mut device = (self.opener)(&self.config)
            .with_context(|| format!("open capture device {}", self.config.device))?;

        let requested = self.config.format;
        let accepted = device
            .negotiate(requested)
            .context("negotiate MJPEG capture format")?;
        if accepted.width != requested.width || accepted.height != requested.height {
            bail!(
                "device offered {}x{} instead of {}x{}",
                accepted.width,
                accepted.height,
                requested.width,
                requested.height
            );
        }
        if accepted.fps != requested.fps {
            log::warn!(
                "{}: requested {} fps, device runs at {} fps",
                self.config.device,
                requested.fps,
                accepted.fps
            );
        }
        self.active_format = Some(accepted);

        if let Some(tuner) = self.tuner.as_mut() {
            tuner.tune(device.as_mut()).context("tune capture device")?;
        }

        let mut pool = DeviceBufferPool::allocate(device, &self.config.pool_config())?;
        pool.start_streaming()?;
        Ok(pool)
    }

    /// Releases the pool and closes the device. The broken flag is cleared.
    pub fn shutdown(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            let outstanding = pool.application_held_count();
            if outstanding > 0 {
                log::warn!(
                    "{}: shutting down with {} frames still lent out",
                    self.config.device,
                    outstanding
                );
            }
            pool.release();
            log::info!("{}: capture stopped", self.config.device);
        }
        self.active_format = None;
        self.broken = false;
    }

    pub fn reinit(&mut self) -> bool {
        self.shutdown();
        self.init()
    }

    /// True once init succeeded and until shutdown, even while broken.
    pub fn is_ready(&self) -> bool {
        self.pool.is_some()
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Returns one newly filled frame, or `None` if none is ready or the source is broken.
    pub fn dequeue_frame(&mut self) -> Option<FrameHandle> {
        if self.broken {
            return None;
        }
        let pool = self.pool.as_mut()?;
        match pool.dequeue_filled() {
            Ok(Some(handle)) => {
                self.frames_dequeued += 1;
                Some(handle)
            }
            Ok(None) => None,
            Err(err) => {
                log::error!("{}: capture failed: {:#}", self.config.device, err);
                self.broken = true;
                None
            }
        }
    }

    /// Hands a frame back to the device. When broken the handle is dropped,
    /// since the pool will be released on reinit.
    pub fn requeue_frame(&mut self, handle: FrameHandle) {
        if self.broken {
            return;
        }
        let Some(pool) = self.pool.as_mut() else {
            log::warn!("{}: frame returned after shutdown", self.config.device);
            return;
        };
        if let Err(err) = pool.enqueue_empty(handle) {
            if pool.is_usable() {
                log::warn!("{}: rejected frame handle: {:#}", self.config.device, err);
            } else {
                log::error!("{}: requeue failed: {:#}", self.config.device, err);
                self.broken = true;
            }
        }
    }

    /// Buffers currently queued in the device; 0 when not ready.
    pub fn device_held_count(&self) -> usize {
        self.pool.as_ref().map_or(0, |pool| pool.device_held_count())
    }

    pub fn application_held_count(&self) -> usize {
        self.pool
            .as_ref()
            .map_or(0, |pool| pool.application_held_count())
    }

    /// Negotiated format while ready.
    pub fn format(&self) -> Option<CaptureFormat> {
        self.active_format
    }

    pub fn frames_dequeued(&self) -> u64 {
        self.frames_dequeued
    }
}

impl FrameStore for FrameSource {
    fn frame_data(&self, handle: &FrameHandle) -> Option<&[u8]> {
        self.pool.as_ref()?.frame_data(handle)
    }
}

impl FrameStore for DeviceBufferPool {
    fn frame_data(&self, handle: &FrameHandle) -> Option<&[u8]> {
        DeviceBufferPool::frame_data(self, handle)
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}
